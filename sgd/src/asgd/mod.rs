mod coordinator;

pub use coordinator::{AsyncContext, AsyncCoordinator};
