use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};

use super::{Granularity, ParallelConfig, ParallelizationMethod, RateSchedule, Schedule};
use crate::{
    Result, SgdErr,
    learning_rate::{IterationPolicy, LearningRateSearch},
    update::{ClippingMode, GradientUpdateConfig},
};

/// Adaptive minibatch size search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinibatchTuningConfig {
    /// Search every this many epochs, `0` disables the search.
    pub frequency: usize,
    /// Smallest candidate, the epoch's configured size when unset.
    pub min: Option<usize>,
    pub max: usize,
    /// Relative criterion regression tolerated by a larger minibatch.
    pub error_margin: f64,
    pub probe_samples: usize,
}

impl Default for MinibatchTuningConfig {
    fn default() -> Self {
        Self {
            frequency: 0,
            min: None,
            max: 1 << 20,
            error_margin: 0.01,
            probe_samples: 2048,
        }
    }
}

/// Learning rate search and adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnRateSearchConfig {
    pub algorithm: LearningRateSearch,
    /// Maximum amount of probes of a single before-epoch search.
    pub max_iter: usize,
    /// Never increase when unset.
    pub increase_learn_rate_if_improve_more_than: Option<f64>,
    pub reduce_learn_rate_if_improve_less_than: f64,
    pub learn_rate_increase_factor: f64,
    pub learn_rate_decrease_factor: f64,
    pub min_learn_rate: f64,
    pub num_prev_learn_rates: usize,
    pub learn_rate_adjust_interval: usize,
    pub num_best_search_epoch: usize,
    pub search_samples: usize,
    /// Roll back to the previous epoch's model when the criterion regressed.
    pub load_best_model: bool,
    pub iteration_policy: Option<IterationPolicy>,
}

impl Default for LearnRateSearchConfig {
    fn default() -> Self {
        Self {
            algorithm: LearningRateSearch::None,
            max_iter: 6,
            increase_learn_rate_if_improve_more_than: None,
            reduce_learn_rate_if_improve_less_than: 0.,
            learn_rate_increase_factor: 1.382,
            learn_rate_decrease_factor: 0.618,
            min_learn_rate: 1e-9,
            num_prev_learn_rates: 5,
            learn_rate_adjust_interval: 1,
            num_best_search_epoch: 1,
            search_samples: 2048,
            load_best_model: true,
            iteration_policy: None,
        }
    }
}

/// Where and how checkpoints are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpointing is disabled when unset.
    pub dir: Option<PathBuf>,
    pub model_name: String,
    pub keep_checkpoint_files: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: None,
            model_name: "model".into(),
            keep_checkpoint_files: false,
        }
    }
}

/// The full trainer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub max_epochs: usize,
    /// Samples per epoch across the cluster, `0` means the whole data source.
    pub epoch_size: usize,
    pub minibatch_size: Schedule<usize>,
    pub learning_rate: RateSchedule,
    pub momentum: RateSchedule,
    pub use_nesterov_momentum: bool,
    pub disable_unit_gain: bool,
    /// Truncated back-propagation through time.
    pub truncated: bool,
    pub num_parallel_sequences: usize,
    pub l1_reg_weight: f64,
    pub l2_reg_weight: f64,
    /// Gradients are not clipped when unset.
    pub clipping_threshold_per_sample: Option<f64>,
    pub clipping_mode: ClippingMode,
    pub gradient_update: GradientUpdateConfig,
    pub need_average_multiplier: bool,
    pub gaussian_noise_inject_std: f64,
    pub mixed_precision_loss_scale: f64,
    pub parallel: ParallelConfig,
    pub minibatch_tuning: MinibatchTuningConfig,
    pub learning_rate_search: LearnRateSearchConfig,
    pub checkpoint: CheckpointConfig,
    pub seed: u64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            max_epochs: 1,
            epoch_size: 0,
            minibatch_size: Schedule::constant(256),
            learning_rate: RateSchedule::per_sample(vec![0.01]),
            momentum: RateSchedule::per_sample(vec![0.]),
            use_nesterov_momentum: false,
            disable_unit_gain: false,
            truncated: false,
            num_parallel_sequences: 1,
            l1_reg_weight: 0.,
            l2_reg_weight: 0.,
            clipping_threshold_per_sample: None,
            clipping_mode: ClippingMode::Element,
            gradient_update: GradientUpdateConfig::default(),
            need_average_multiplier: true,
            gaussian_noise_inject_std: 0.,
            mixed_precision_loss_scale: 1.,
            parallel: ParallelConfig::default(),
            minibatch_tuning: MinibatchTuningConfig::default(),
            learning_rate_search: LearnRateSearchConfig::default(),
            checkpoint: CheckpointConfig::default(),
            seed: 0,
        }
    }
}

/// The configuration values in effect during a single epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochView {
    pub epoch: usize,
    pub method: ParallelizationMethod,
    pub minibatch_size: usize,
    pub learn_rate_per_sample: f64,
    pub momentum_per_sample: f64,
    pub num_gradient_bits: u32,
    /// Cluster-wide samples between two periodic syncs.
    pub block_size: usize,
    pub block_momentum: f64,
    /// This rank's samples between two async pushes.
    pub n_sync_samples: usize,
}

fn invalid(msg: impl Into<String>) -> SgdErr {
    SgdErr::InvalidConfig(msg.into())
}

impl SgdConfig {
    /// Checks the configuration as a whole, before any training step runs.
    ///
    /// # Returns
    /// An `InvalidConfig` error describing the first offending option, or
    /// `Unsupported` for model parallel training.
    pub fn validate(&self) -> Result<()> {
        self.validate_schedules()?;
        self.validate_update()?;
        self.validate_parallel()?;
        self.validate_tuning()?;
        self.validate_search()?;

        if let Some(dir) = &self.checkpoint.dir {
            let name = &self.checkpoint.model_name;
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(invalid(format!(
                    "checkpoint model name {name:?} in {} must be a plain file name",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    fn validate_schedules(&self) -> Result<()> {
        if self.max_epochs == 0 {
            return Err(invalid("max_epochs must be positive"));
        }

        if self.minibatch_size.is_empty() || self.minibatch_size.values().contains(&0) {
            return Err(invalid("every minibatch size must be positive"));
        }

        let rates = self.learning_rate.values.values();
        if rates.is_empty() || rates.iter().any(|r| !r.is_finite() || *r < 0.) {
            return Err(invalid("learning rates must be finite and non-negative"));
        }

        let momentums = self.momentum.values.values();
        if momentums.is_empty() || momentums.iter().any(|m| !(0. ..1.).contains(m)) {
            return Err(invalid("momentums must lie in [0, 1)"));
        }

        let per_minibatch = self.learning_rate.granularity == Granularity::PerMinibatch
            || self.momentum.granularity == Granularity::PerMinibatch;
        if self.truncated && per_minibatch && self.num_parallel_sequences == 0 {
            return Err(invalid(
                "learning rate and momentum are not supported per minibatch with truncated \
                 training and no parallel sequences, specify them per sample",
            ));
        }

        Ok(())
    }

    fn validate_update(&self) -> Result<()> {
        if self.l1_reg_weight < 0. || self.l2_reg_weight < 0. {
            return Err(invalid("regularization weights must be non-negative"));
        }

        if let Some(t) = self.clipping_threshold_per_sample
            && !(t > 0.)
        {
            return Err(invalid("the clipping threshold must be positive"));
        }

        if !self.mixed_precision_loss_scale.is_finite() || self.mixed_precision_loss_scale <= 0. {
            return Err(invalid("the loss scale must be a positive finite number"));
        }

        if !(self.gaussian_noise_inject_std >= 0.) {
            return Err(invalid("the gradient noise deviation must be non-negative"));
        }

        self.gradient_update.validate()
    }

    fn validate_parallel(&self) -> Result<()> {
        let parallel = &self.parallel;

        let bits = parallel.num_gradient_bits.values();
        if bits.is_empty() || bits.iter().any(|b| !(1..=32).contains(b)) {
            return Err(invalid("gradient bits must lie in [1, 32]"));
        }

        match parallel.method {
            ParallelizationMethod::ModelParallel => {
                return Err(SgdErr::Unsupported("model parallel training"));
            }
            ParallelizationMethod::ModelAveraging | ParallelizationMethod::BlockMomentum => {
                if parallel.model_aggregation_block_size == Some(0) {
                    return Err(invalid("the model aggregation block size must be positive"));
                }
                if !(parallel.block_learning_rate > 0.) {
                    return Err(invalid("the block learning rate must be positive"));
                }
                if parallel.block_momentum_as_time_constant.is_some_and(|tc| !(tc >= 0.)) {
                    return Err(invalid("the block momentum time constant must be non-negative"));
                }
            }
            ParallelizationMethod::AsyncSgd => {
                let counts = parallel.n_sync_samples_per_worker.values();
                if counts.is_empty() || counts.iter().any(|c| c.is_empty() || c.contains(&0)) {
                    return Err(invalid("async sync sample counts must be positive"));
                }
            }
            ParallelizationMethod::None | ParallelizationMethod::GradientAggregation => {}
        }

        if parallel.buffered_async_gradient_aggregation
            && parallel.method != ParallelizationMethod::GradientAggregation
        {
            warn!("buffered async aggregation only applies to gradient aggregation, ignoring it");
        }

        Ok(())
    }

    fn validate_tuning(&self) -> Result<()> {
        let tuning = &self.minibatch_tuning;
        if tuning.frequency == 0 {
            return Ok(());
        }

        if tuning.min.is_some_and(|min| min == 0 || min > tuning.max) {
            return Err(invalid("minibatch tuning bounds must satisfy 0 < min <= max"));
        }

        if !(tuning.error_margin >= 0.) || tuning.probe_samples == 0 {
            return Err(invalid(
                "minibatch tuning needs a non-negative error margin and probe samples",
            ));
        }

        Ok(())
    }

    fn validate_search(&self) -> Result<()> {
        let search = &self.learning_rate_search;

        if !(search.learn_rate_decrease_factor > 0. && search.learn_rate_decrease_factor < 1.) {
            return Err(invalid("the learning rate decrease factor must lie in (0, 1)"));
        }

        if !(search.learn_rate_increase_factor >= 1.) {
            return Err(invalid("the learning rate increase factor must be at least 1"));
        }

        if !(search.min_learn_rate >= 0.) {
            return Err(invalid("the minimum learning rate must be non-negative"));
        }

        if search.num_prev_learn_rates == 0
            || search.learn_rate_adjust_interval == 0
            || search.num_best_search_epoch == 0
            || search.max_iter == 0
        {
            return Err(invalid(
                "learning rate search windows, intervals and budgets must be positive",
            ));
        }

        if search.algorithm == LearningRateSearch::SearchBeforeEpoch && search.search_samples == 0 {
            return Err(invalid("the learning rate search needs samples to probe"));
        }

        if let Some(policy) = &search.iteration_policy {
            policy.validate()?;
        }

        Ok(())
    }

    /// Returns the minibatch size the rates are defined against.
    ///
    /// With truncated training a minibatch holds `num_parallel_sequences` sequences
    /// per configured sample.
    pub fn effective_minibatch_size(&self, minibatch_size: usize) -> Result<usize> {
        if !self.truncated {
            return Ok(minibatch_size);
        }

        if self.num_parallel_sequences == 0 {
            return Err(invalid(
                "learning rate and momentum are not supported per minibatch, specify them per sample",
            ));
        }

        Ok(minibatch_size * self.num_parallel_sequences)
    }

    /// Returns the configured learning rate of `epoch`, converted per sample.
    pub fn learn_rate_per_sample(&self, epoch: usize, minibatch_size: usize) -> Result<f64> {
        let rate = *self
            .learning_rate
            .values
            .get(epoch)
            .ok_or_else(|| invalid("no learning rate configured"))?;

        Ok(match self.learning_rate.granularity {
            Granularity::PerSample => rate,
            Granularity::PerMinibatch => rate / self.effective_minibatch_size(minibatch_size)? as f64,
        })
    }

    /// Returns the configured momentum of `epoch`, converted per sample.
    pub fn momentum_per_sample(&self, epoch: usize, minibatch_size: usize) -> Result<f64> {
        let momentum = *self
            .momentum
            .values
            .get(epoch)
            .ok_or_else(|| invalid("no momentum configured"))?;

        Ok(match self.momentum.granularity {
            Granularity::PerSample => momentum,
            Granularity::PerMinibatch => {
                let mb = self.effective_minibatch_size(minibatch_size)? as f64;
                momentum.powf(1. / mb)
            }
        })
    }

    /// Returns the values in effect during `epoch` for a cluster of `ranks` ranks.
    ///
    /// # Arguments
    /// * `epoch` - The epoch index.
    /// * `ranks` - The amount of ranks in the cluster.
    /// * `rank` - This rank's index.
    ///
    /// # Returns
    /// The epoch's view or an `InvalidConfig` error if a schedule is empty.
    pub fn epoch_view(&self, epoch: usize, ranks: usize, rank: usize) -> Result<EpochView> {
        let minibatch_size = *self
            .minibatch_size
            .get(epoch)
            .ok_or_else(|| invalid("no minibatch size configured"))?;

        let num_gradient_bits = *self
            .parallel
            .num_gradient_bits
            .get(epoch)
            .ok_or_else(|| invalid("no gradient bits configured"))?;

        let method = self.parallel.method_for_epoch(epoch);
        let n_sync_samples = match method {
            ParallelizationMethod::AsyncSgd => self
                .parallel
                .n_sync_samples(epoch, rank)
                .ok_or_else(|| invalid("no async sync sample count configured"))?,
            _ => 0,
        };

        Ok(EpochView {
            epoch,
            method,
            minibatch_size,
            learn_rate_per_sample: self.learn_rate_per_sample(epoch, minibatch_size)?,
            momentum_per_sample: self.momentum_per_sample(epoch, minibatch_size)?,
            num_gradient_bits,
            block_size: self.parallel.block_size(ranks),
            block_momentum: self.parallel.block_momentum(ranks),
            n_sync_samples,
        })
    }
}
