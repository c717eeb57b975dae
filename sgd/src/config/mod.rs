mod parallel;
mod schedule;
mod sgd;

pub use parallel::{
    DEFAULT_BLOCK_SIZE_PER_RANK, DEFAULT_PACK_THRESHOLD_SIZE_IN_BYTES, ParallelConfig,
    ParallelizationMethod,
};
pub use schedule::{Granularity, RateSchedule, Schedule};
pub use sgd::{
    CheckpointConfig, EpochView, LearnRateSearchConfig, MinibatchTuningConfig, SgdConfig,
};
