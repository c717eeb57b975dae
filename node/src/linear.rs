use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use sgd::{
    Result, SgdErr,
    engine::{BatchStats, ComputationEngine},
    gradient::{DeviceBuffer, Gradients},
};

use crate::data::Batch;

const WEIGHT: usize = 0;
const BIAS: usize = 1;

/// One dimensional linear regression, `y = w * x + b`, under the squared error.
///
/// The weight and the bias live in separate buffers. Besides the criterion it
/// reports the absolute error as its single evaluation metric.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    params: Vec<DeviceBuffer<f32>>,
    grads: Vec<DeviceBuffer<f32>>,
}

impl LinearRegression {
    /// Creates a new model with a random weight and a zero bias.
    ///
    /// # Arguments
    /// * `init_std` - Standard deviation of the initial weight.
    /// * `seed` - Seed of the initialization, equal seeds give equal models.
    pub fn new(init_std: f32, seed: u64) -> Result<Self> {
        let init = Normal::new(0., init_std)
            .map_err(|e| SgdErr::InvalidConfig(format!("weight initialization: {e}")))?;
        let w = init.sample(&mut StdRng::seed_from_u64(seed));

        Ok(Self {
            params: vec![DeviceBuffer::from(vec![w]), DeviceBuffer::zeros(1)],
            grads: vec![DeviceBuffer::zeros(1), DeviceBuffer::zeros(1)],
        })
    }

    /// Returns `(w, b)`.
    pub fn line(&self) -> (f32, f32) {
        (self.params[WEIGHT][0], self.params[BIAS][0])
    }

    fn pass(&mut self, batch: &Batch, backward: bool) -> BatchStats {
        let (w, b) = self.line();
        let (mut gw, mut gb) = (0f32, 0f32);
        let (mut loss, mut abs) = (0f64, 0f64);

        for (x, y) in batch.xs.iter().zip(&batch.ys) {
            let e = w * x + b - y;
            loss += 0.5 * (e * e) as f64;
            abs += e.abs() as f64;
            gw += e * x;
            gb += e;
        }

        if backward {
            self.grads[WEIGHT][0] = gw;
            self.grads[BIAS][0] = gb;
        }

        BatchStats {
            criterion: loss,
            eval_errors: vec![abs],
            samples: batch.len(),
            labelled: batch.len(),
        }
    }
}

impl ComputationEngine for LinearRegression {
    type Batch = Batch;

    fn split_mut(&mut self) -> (&mut [DeviceBuffer<f32>], Gradients<'_>) {
        (self.params.as_mut_slice(), Gradients::Single(&mut self.grads))
    }

    fn parameters(&self) -> &[DeviceBuffer<f32>] {
        &self.params
    }

    fn forward_backward(&mut self, batch: &Batch) -> Result<BatchStats> {
        Ok(self.pass(batch, true))
    }

    fn evaluate(&mut self, batch: &Batch) -> Result<BatchStats> {
        Ok(self.pass(batch, false))
    }

    fn num_eval_metrics(&self) -> usize {
        1
    }
}
