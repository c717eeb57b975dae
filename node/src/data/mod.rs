mod dataset;
mod loader;
mod shard;

pub use dataset::{Batch, InMemoryDataset};
pub use loader::DataLoader;
pub use shard::shard_range;
