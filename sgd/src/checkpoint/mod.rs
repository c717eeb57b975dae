mod best;
pub(crate) mod bits;
mod error;
mod format;
mod manager;
mod record;

pub use best::{BestEpoch, BestEpochs};
pub use error::CheckpointErr;
pub use format::{VERSION, read_record, verify_record, write_record};
pub use manager::CheckpointManager;
pub use record::CheckpointRecord;
