mod non_blocking;

pub use non_blocking::NoBlockingSync;
