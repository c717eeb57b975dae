mod controller;
mod iteration;

pub use controller::{
    Adjustment, LearnRateState, LearningRateController, LearningRateSearch, Reduction,
};
pub use iteration::{AdjustType, IterationPolicy, IterationSchedule};
