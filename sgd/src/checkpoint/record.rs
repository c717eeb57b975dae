use super::BestEpochs;
use crate::{learning_rate::LearnRateState, sync::BlockMomentumState};

/// Everything needed to resume training after `epoch`.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    /// The last completed epoch.
    pub epoch: usize,
    pub total_samples_seen: u64,
    pub learn_rate_per_sample: f64,
    pub minibatch_size: usize,
    pub prev_criterion: f64,
    /// Minibatches processed so far, drives the per-iteration rate policy.
    pub iteration: usize,
    pub parameters: Vec<Vec<f32>>,
    pub smoothed_gradients: Vec<Vec<f32>>,
    pub smoothed_counts: Vec<f64>,
    pub learn_rate_state: Option<LearnRateState>,
    pub best_epochs: BestEpochs,
    pub block_momentum: Option<BlockMomentumState>,
}

impl Default for CheckpointRecord {
    fn default() -> Self {
        Self {
            epoch: 0,
            total_samples_seen: 0,
            learn_rate_per_sample: 0.,
            minibatch_size: 0,
            prev_criterion: f64::MAX,
            iteration: 0,
            parameters: Vec::new(),
            smoothed_gradients: Vec::new(),
            smoothed_counts: Vec::new(),
            learn_rate_state: None,
            best_epochs: BestEpochs::default(),
            block_momentum: None,
        }
    }
}
