use serde::{Deserialize, Serialize};

/// A per-epoch value, the last entry repeats for every later epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schedule<T>(Vec<T>);

impl<T> Schedule<T> {
    /// Creates a schedule out of one value per epoch.
    pub fn new(values: Vec<T>) -> Self {
        Self(values)
    }

    /// Creates a schedule holding the same value for every epoch.
    pub fn constant(value: T) -> Self {
        Self(vec![value])
    }

    /// Returns the value in effect during `epoch`, `None` if the schedule is empty.
    pub fn get(&self, epoch: usize) -> Option<&T> {
        self.0.get(epoch).or_else(|| self.0.last())
    }

    pub fn values(&self) -> &[T] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Whether a rate was specified for a single sample or for a whole minibatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    PerSample,
    PerMinibatch,
}

/// A per-epoch rate together with its declared granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSchedule {
    pub values: Schedule<f64>,
    #[serde(default)]
    pub granularity: Granularity,
}

impl RateSchedule {
    pub fn per_sample(values: Vec<f64>) -> Self {
        Self {
            values: Schedule::new(values),
            granularity: Granularity::PerSample,
        }
    }

    pub fn per_minibatch(values: Vec<f64>) -> Self {
        Self {
            values: Schedule::new(values),
            granularity: Granularity::PerMinibatch,
        }
    }
}
