use crate::{Result, SgdErr};

/// Accumulated value of one evaluation metric.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalError {
    pub value: f64,
    pub samples: usize,
}

/// Running totals of one aggregation round.
///
/// Before aggregation it holds this rank's contribution, afterwards the
/// cluster-wide sums.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationHeader {
    pub criterion: f64,
    pub eval_errors: Vec<EvalError>,
    pub num_samples: usize,
    pub num_samples_with_label: usize,
    pub valid: bool,
}

/// What a reduced header wire tells about the round besides the totals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RoundInfo {
    pub contributors: usize,
    pub mismatches: usize,
    pub fingerprint: f64,
}

// contributors, mismatches, fingerprint, criterion, samples, labelled
const WIRE_PREFIX: usize = 6;

impl AggregationHeader {
    /// Creates an empty header tracking `num_eval` metrics.
    pub fn new(num_eval: usize) -> Self {
        Self {
            eval_errors: vec![EvalError::default(); num_eval],
            ..Default::default()
        }
    }

    /// Clears every total, keeping the amount of tracked metrics.
    pub fn reset(&mut self) {
        self.criterion = 0.;
        self.eval_errors.fill(EvalError::default());
        self.num_samples = 0;
        self.num_samples_with_label = 0;
        self.valid = false;
    }

    /// Adds `other`'s totals into this header.
    ///
    /// # Returns
    /// A `SizeMismatch` error if both headers track a different amount of metrics.
    pub fn merge(&mut self, other: &AggregationHeader) -> Result<()> {
        if self.eval_errors.len() != other.eval_errors.len() {
            return Err(SgdErr::SizeMismatch {
                what: "evaluation metrics",
                got: other.eval_errors.len(),
                expected: self.eval_errors.len(),
            });
        }

        self.criterion += other.criterion;
        self.num_samples += other.num_samples;
        self.num_samples_with_label += other.num_samples_with_label;
        self.valid |= other.valid;
        self.eval_errors
            .iter_mut()
            .zip(&other.eval_errors)
            .for_each(|(a, b)| {
                a.value += b.value;
                a.samples += b.samples;
            });

        Ok(())
    }

    /// Returns the criterion averaged over the labelled samples, `NaN` if there are none.
    pub fn average_criterion(&self) -> f64 {
        self.criterion / self.num_samples_with_label as f64
    }

    /// Returns every metric averaged over its own sample count.
    pub fn average_eval_errors(&self) -> Vec<f64> {
        self.eval_errors
            .iter()
            .map(|e| e.value / e.samples as f64)
            .collect()
    }

    /// Serializes the header into a flat vector ready to be summed across ranks.
    ///
    /// Sample counts travel as `f64`, which is exact up to 2^53 samples.
    pub(crate) fn to_wire(&self, contributed: bool, mismatch: bool, fingerprint: f64) -> Vec<f64> {
        let mut wire = Vec::with_capacity(WIRE_PREFIX + 2 * self.eval_errors.len());
        wire.extend([
            contributed as u8 as f64,
            mismatch as u8 as f64,
            fingerprint,
            self.criterion,
            self.num_samples as f64,
            self.num_samples_with_label as f64,
        ]);

        for e in &self.eval_errors {
            wire.extend([e.value, e.samples as f64]);
        }

        wire
    }

    /// Reads the round information out of a reduced wire without touching the header.
    pub(crate) fn round_info(wire: &[f64]) -> RoundInfo {
        RoundInfo {
            contributors: wire[0] as usize,
            mismatches: wire[1] as usize,
            fingerprint: wire[2],
        }
    }

    /// Overwrites the totals with those of a reduced wire.
    pub(crate) fn load_wire(&mut self, wire: &[f64]) {
        self.criterion = wire[3];
        self.num_samples = wire[4] as usize;
        self.num_samples_with_label = wire[5] as usize;
        self.valid = wire[0] > 0.;

        for (e, pair) in self
            .eval_errors
            .iter_mut()
            .zip(wire[WIRE_PREFIX..].chunks_exact(2))
        {
            e.value = pair[0];
            e.samples = pair[1] as usize;
        }
    }
}
