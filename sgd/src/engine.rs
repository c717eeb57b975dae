use crate::{
    Result,
    gradient::{DeviceBuffer, Gradients},
    header::{AggregationHeader, EvalError},
};

/// What a forward pass over one minibatch measured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    /// Summed over the minibatch's labelled samples.
    pub criterion: f64,
    /// Summed over the minibatch's labelled samples, one per metric.
    pub eval_errors: Vec<f64>,
    pub samples: usize,
    pub labelled: usize,
}

impl BatchStats {
    /// Builds this rank's contribution to an aggregation round.
    pub fn to_header(&self) -> AggregationHeader {
        AggregationHeader {
            criterion: self.criterion,
            eval_errors: self
                .eval_errors
                .iter()
                .map(|&value| EvalError {
                    value,
                    samples: self.labelled,
                })
                .collect(),
            num_samples: self.samples,
            num_samples_with_label: self.labelled,
            valid: self.samples > 0,
        }
    }
}

/// The model being trained.
///
/// Parameters and gradients are owned by the engine, one gradient buffer per
/// parameter buffer and of the same length. The parameters are always kept in
/// single precision, engines back-propagating in half precision keep them as
/// master weights next to a rounded working copy.
pub trait ComputationEngine: Send {
    type Batch: Send;

    /// Returns the parameters and the gradients at once.
    fn split_mut(&mut self) -> (&mut [DeviceBuffer<f32>], Gradients<'_>);

    /// Rounds the parameters into the half precision working copy, if any.
    ///
    /// Called whenever the parameters were overwritten from outside the engine.
    fn refresh_working_copy(&mut self) {
        let (params, mut grads) = self.split_mut();
        grads.refresh_working(params);
    }

    fn parameters(&self) -> &[DeviceBuffer<f32>];

    /// Runs the forward and backward passes over `batch`.
    ///
    /// Leaves the gradients, summed over the minibatch's samples, in the
    /// gradient buffers.
    fn forward_backward(&mut self, batch: &Self::Batch) -> Result<BatchStats>;

    /// Runs the forward pass only, gradients are left untouched.
    fn evaluate(&mut self, batch: &Self::Batch) -> Result<BatchStats>;

    /// Returns the amount of evaluation metrics every `BatchStats` holds.
    fn num_eval_metrics(&self) -> usize;
}

/// Where the minibatches come from.
pub trait DataSource: Send {
    type Batch: Send;

    /// Rewinds to the start of `epoch`, reading this rank's share of it.
    ///
    /// # Arguments
    /// * `epoch` - The epoch about to start.
    /// * `minibatch_size` - The global minibatch size, shared by every rank.
    /// * `rank` - This rank's index.
    /// * `ranks` - The amount of ranks reading the epoch.
    fn start_epoch(&mut self, epoch: usize, minibatch_size: usize, rank: usize, ranks: usize);

    /// Returns the next minibatch of the epoch, `None` once this rank's share is exhausted.
    fn next_batch(&mut self) -> Option<Self::Batch>;

    /// Returns a fixed slice of `epoch`'s data, the same on every call.
    ///
    /// Used to probe learning rates and minibatch sizes.
    fn probe_batches(&mut self, epoch: usize, minibatch_size: usize, samples: usize) -> Vec<Self::Batch>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_become_a_header() {
        let stats = BatchStats {
            criterion: 3.,
            eval_errors: vec![1.],
            samples: 4,
            labelled: 3,
        };

        let h = stats.to_header();
        assert_eq!(h.num_samples, 4);
        assert_eq!(h.eval_errors[0], EvalError { value: 1., samples: 3 });
        assert_eq!(h.average_criterion(), 1.);
        assert!(h.valid);
        assert!(!BatchStats::default().to_header().valid);
    }
}
