use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::bits;

/// The lowest value a validation metric reached, and in which epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestEpoch {
    #[serde(with = "bits::exact")]
    pub criterion_min_value: f64,
    pub epoch_index: Option<usize>,
}

impl Default for BestEpoch {
    fn default() -> Self {
        Self {
            criterion_min_value: f64::MAX,
            epoch_index: None,
        }
    }
}

/// Best epochs keyed by validation metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BestEpochs(BTreeMap<String, BestEpoch>);

impl BestEpochs {
    /// Records `value` for `metric` if it beats the best so far.
    ///
    /// # Returns
    /// `true` if `epoch` is the new best epoch of `metric`.
    pub fn update(&mut self, metric: &str, value: f64, epoch: usize) -> bool {
        let best = self.0.entry(metric.to_string()).or_default();
        if !(value < best.criterion_min_value) {
            return false;
        }

        best.criterion_min_value = value;
        best.epoch_index = Some(epoch);
        true
    }

    pub fn get(&self, metric: &str) -> Option<&BestEpoch> {
        self.0.get(metric)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BestEpoch)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}
