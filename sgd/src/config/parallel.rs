use serde::{Deserialize, Serialize};

use super::Schedule;
use crate::aggregation::ReduceOp;

/// Default size of the buffers eligible for quantized packing.
pub const DEFAULT_PACK_THRESHOLD_SIZE_IN_BYTES: usize = 32 * 1024;

/// Default samples each rank processes between two periodic syncs.
pub const DEFAULT_BLOCK_SIZE_PER_RANK: usize = 40_000;

/// How ranks combine their work into a single model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelizationMethod {
    /// Every rank trains on the whole data and stays bit-identical to the others.
    #[default]
    None,
    /// Gradients are reduced across ranks every minibatch.
    GradientAggregation,
    /// Parameters are averaged every sync block.
    ModelAveraging,
    /// Parameters are averaged every sync block and blended with a global momentum.
    BlockMomentum,
    /// Parameter deltas are pushed to a shared store without barriers.
    AsyncSgd,
    /// Splits the model itself across ranks, not supported.
    ModelParallel,
}

impl ParallelizationMethod {
    /// Returns `true` for the methods that sync parameters every block.
    pub fn is_periodic(self) -> bool {
        matches!(self, Self::ModelAveraging | Self::BlockMomentum)
    }
}

/// Configuration of the parallel training methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub method: ParallelizationMethod,
    pub start_epoch: usize,
    pub num_gradient_bits: Schedule<u32>,
    pub pack_threshold_size_in_bytes: usize,
    pub zero_threshold_for_1bit: bool,
    pub buffered_async_gradient_aggregation: bool,
    pub reduce_op: ReduceOp,
    /// Samples processed by the whole cluster between two periodic syncs.
    pub model_aggregation_block_size: Option<usize>,
    pub block_momentum_as_time_constant: Option<f64>,
    pub reset_momentum_on_restart: bool,
    pub use_nesterov_block_momentum: bool,
    pub block_learning_rate: f64,
    /// Per epoch, the samples each rank processes between two pushes. A single
    /// entry applies to every rank.
    pub n_sync_samples_per_worker: Schedule<Vec<usize>>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            method: ParallelizationMethod::None,
            start_epoch: 0,
            num_gradient_bits: Schedule::constant(32),
            pack_threshold_size_in_bytes: DEFAULT_PACK_THRESHOLD_SIZE_IN_BYTES,
            zero_threshold_for_1bit: true,
            buffered_async_gradient_aggregation: false,
            reduce_op: ReduceOp::Sum,
            model_aggregation_block_size: None,
            block_momentum_as_time_constant: None,
            reset_momentum_on_restart: true,
            use_nesterov_block_momentum: true,
            block_learning_rate: 1.0,
            n_sync_samples_per_worker: Schedule::constant(vec![1024]),
        }
    }
}

impl ParallelConfig {
    /// Returns the method in effect during `epoch`.
    pub fn method_for_epoch(&self, epoch: usize) -> ParallelizationMethod {
        if epoch < self.start_epoch {
            ParallelizationMethod::None
        } else {
            self.method
        }
    }

    /// Returns the cluster-wide sync block size for `ranks` ranks.
    pub fn block_size(&self, ranks: usize) -> usize {
        self.model_aggregation_block_size
            .unwrap_or(DEFAULT_BLOCK_SIZE_PER_RANK * ranks)
    }

    /// Returns the block momentum applied at every sync.
    ///
    /// Without an explicit time constant the classic `1 - 1 / ranks` is used.
    pub fn block_momentum(&self, ranks: usize) -> f64 {
        match self.block_momentum_as_time_constant {
            Some(tc) if tc > 0. => (-(self.block_size(ranks) as f64) / tc).exp(),
            Some(_) => 0.,
            None => 1. - 1. / ranks as f64,
        }
    }

    /// Returns how many samples `rank` processes between two async pushes during `epoch`.
    pub fn n_sync_samples(&self, epoch: usize, rank: usize) -> Option<usize> {
        let per_rank = self.n_sync_samples_per_worker.get(epoch)?;
        per_rank.get(rank).or_else(|| per_rank.last()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_mode_starts_at_the_configured_epoch() {
        let cfg = ParallelConfig {
            method: ParallelizationMethod::ModelAveraging,
            start_epoch: 2,
            ..Default::default()
        };

        assert_eq!(cfg.method_for_epoch(1), ParallelizationMethod::None);
        assert_eq!(cfg.method_for_epoch(2), ParallelizationMethod::ModelAveraging);
    }

    #[test]
    fn block_momentum_from_time_constant() {
        let mut cfg = ParallelConfig {
            model_aggregation_block_size: Some(100),
            ..Default::default()
        };
        assert_eq!(cfg.block_momentum(4), 0.75);

        cfg.block_momentum_as_time_constant = Some(100.);
        assert!((cfg.block_momentum(4) - (-1f64).exp()).abs() < 1e-12);

        cfg.block_momentum_as_time_constant = Some(0.);
        assert_eq!(cfg.block_momentum(4), 0.);
    }

    #[test]
    fn sync_samples_fall_back_to_the_last_rank_entry() {
        let cfg = ParallelConfig {
            n_sync_samples_per_worker: Schedule::new(vec![vec![10, 20], vec![5]]),
            ..Default::default()
        };

        assert_eq!(cfg.n_sync_samples(0, 1), Some(20));
        assert_eq!(cfg.n_sync_samples(0, 3), Some(20));
        assert_eq!(cfg.n_sync_samples(7, 2), Some(5));
    }
}
