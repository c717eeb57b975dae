//! A shared, sharded parameter store for asynchronous SGD.
//!
//! Ranks push parameter deltas into the store and pull the latest parameters
//! back, concurrent pushes are accumulated and applied rather than overwritten.

mod optimization;
mod storage;
mod synchronization;

pub use optimization::{AddDelta, Optimizer};
pub use storage::{ParameterHandle, ParameterStore, Result, SizeMismatchErr};
pub use synchronization::NoBlockingSync;
