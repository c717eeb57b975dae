mod add_delta;
mod optimizer;

pub use add_delta::AddDelta;
pub use optimizer::Optimizer;
