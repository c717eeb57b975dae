use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use sgd::{Result, SgdErr};

/// A minibatch of scalar samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub xs: Vec<f32>,
    pub ys: Vec<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }
}

/// A minimal in-memory dataset of `(x, y)` pairs.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    xs: Vec<f32>,
    ys: Vec<f32>,
}

impl InMemoryDataset {
    /// Creates a new dataset from owned buffers.
    ///
    /// # Panics
    /// If `xs.len() != ys.len()`.
    pub fn new(xs: Vec<f32>, ys: Vec<f32>) -> Self {
        assert_eq!(xs.len(), ys.len(), "xs and ys must have the same length");
        Self { xs, ys }
    }

    /// Samples `n` points of `y = slope * x + intercept` with gaussian noise on `y`.
    ///
    /// # Arguments
    /// * `n` - The amount of samples.
    /// * `slope` - The line's slope.
    /// * `intercept` - The line's intercept.
    /// * `noise_std` - Standard deviation of the noise, `0` for exact samples.
    /// * `seed` - Seed of the generator, `x` is drawn uniformly from `[-1, 1)`.
    ///
    /// # Returns
    /// The dataset, or an error if `noise_std` is not a valid deviation.
    pub fn synthetic(n: usize, slope: f32, intercept: f32, noise_std: f32, seed: u64) -> Result<Self> {
        let noise = Normal::new(0., noise_std)
            .map_err(|e| SgdErr::InvalidConfig(format!("dataset noise: {e}")))?;
        let mut rng = StdRng::seed_from_u64(seed);

        let xs: Vec<f32> = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
        let ys = xs
            .iter()
            .map(|x| slope * x + intercept + noise.sample(&mut rng))
            .collect();

        Ok(Self::new(xs, ys))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.xs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    /// Gathers the samples at `indices` into a batch.
    pub fn gather(&self, indices: &[usize]) -> Batch {
        Batch {
            xs: indices.iter().map(|&i| self.xs[i]).collect(),
            ys: indices.iter().map(|&i| self.ys[i]).collect(),
        }
    }

    /// Splits the dataset, in order, into batches of `batch_size` samples.
    pub fn batches(&self, batch_size: usize) -> Vec<Batch> {
        let batch_size = batch_size.max(1);
        self.xs
            .chunks(batch_size)
            .zip(self.ys.chunks(batch_size))
            .map(|(xs, ys)| Batch {
                xs: xs.to_vec(),
                ys: ys.to_vec(),
            })
            .collect()
    }
}
