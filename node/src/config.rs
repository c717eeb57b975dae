use serde::{Deserialize, Serialize};
use sgd::{Result, SgdErr, config::SgdConfig};

/// What the node trains, on how many in-process ranks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub ranks: usize,
    pub samples: usize,
    pub validation_samples: usize,
    pub slope: f32,
    pub intercept: f32,
    pub noise_std: f32,
    pub init_std: f32,
    /// Maximum amount of parameters per parameter store shard.
    pub store_shard_size: usize,
    pub sgd: SgdConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ranks: 1,
            samples: 1024,
            validation_samples: 256,
            slope: 2.,
            intercept: 0.5,
            noise_std: 0.05,
            init_std: 0.1,
            store_shard_size: 1024,
            sgd: SgdConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Checks the node options, the trainer options are checked by the driver.
    pub fn validate(&self) -> Result<()> {
        if self.ranks == 0 || self.samples == 0 || self.store_shard_size == 0 {
            return Err(SgdErr::InvalidConfig(
                "ranks, samples and the store shard size must be positive".into(),
            ));
        }

        Ok(())
    }
}
