#![allow(dead_code)]

use comms::{LocalCluster, Transport};
use half::f16;
use sgd::{
    EpochDriver, Result, TrainingSummary,
    asgd::AsyncContext,
    config::SgdConfig,
    engine::{BatchStats, ComputationEngine, DataSource},
    gradient::{DeviceBuffer, Gradients},
};
use tokio::task::JoinSet;

pub type Batch = Vec<(f32, f32)>;

/// Fits `y = w * x + b` under the squared error.
pub struct Line {
    params: Vec<DeviceBuffer<f32>>,
    grads: Vec<DeviceBuffer<f32>>,
    half: Option<HalfPass>,
}

/// Rounded weights and loss-scaled gradients of a half precision `Line`.
struct HalfPass {
    loss_scale: f32,
    working: Vec<DeviceBuffer<f16>>,
    grads: Vec<DeviceBuffer<f16>>,
}

impl Line {
    pub fn new() -> Self {
        Self {
            params: vec![DeviceBuffer::zeros(2)],
            grads: vec![DeviceBuffer::zeros(2)],
            half: None,
        }
    }

    /// A `Line` running its passes in half precision, the loss multiplied by `loss_scale`.
    pub fn half(loss_scale: f32) -> Self {
        Self {
            half: Some(HalfPass {
                loss_scale,
                working: vec![DeviceBuffer::zeros(2)],
                grads: vec![DeviceBuffer::zeros(2)],
            }),
            ..Self::new()
        }
    }

    fn run(&mut self, batch: &Batch, backward: bool) -> BatchStats {
        let (w, b) = match &self.half {
            Some(half) => (half.working[0][0].to_f32(), half.working[0][1].to_f32()),
            None => (self.params[0][0], self.params[0][1]),
        };
        let grad = &mut self.grads[0];
        if backward {
            grad.fill(0.);
        }

        let mut loss = 0.;
        for &(x, y) in batch {
            let e = w * x + b - y;
            loss += 0.5 * (e * e) as f64;
            if backward {
                grad[0] += e * x;
                grad[1] += e;
            }
        }

        if backward && let Some(half) = &mut self.half {
            half.grads[0]
                .iter_mut()
                .zip(grad.iter())
                .for_each(|(h, g)| *h = f16::from_f32(g * half.loss_scale));
        }

        BatchStats {
            criterion: loss,
            eval_errors: vec![loss],
            samples: batch.len(),
            labelled: batch.len(),
        }
    }
}

impl ComputationEngine for Line {
    type Batch = Batch;

    fn split_mut(&mut self) -> (&mut [DeviceBuffer<f32>], Gradients<'_>) {
        let grads = match &mut self.half {
            Some(half) => Gradients::Half {
                working: &mut half.working,
                grads: &mut half.grads,
            },
            None => Gradients::Single(&mut self.grads),
        };
        (self.params.as_mut_slice(), grads)
    }

    fn parameters(&self) -> &[DeviceBuffer<f32>] {
        &self.params
    }

    fn forward_backward(&mut self, batch: &Batch) -> Result<BatchStats> {
        Ok(self.run(batch, true))
    }

    fn evaluate(&mut self, batch: &Batch) -> Result<BatchStats> {
        Ok(self.run(batch, false))
    }

    fn num_eval_metrics(&self) -> usize {
        1
    }
}

/// Samples of `y = 2x + 0.5` on `[-1, 1]`.
pub struct Samples {
    data: Batch,
    cursor: usize,
    end: usize,
    batch: usize,
}

impl Samples {
    pub fn line(n: usize) -> Self {
        let data = (0..n)
            .map(|i| {
                let x = -1. + 2. * i as f32 / (n - 1) as f32;
                (x, 2. * x + 0.5)
            })
            .collect();

        Self {
            data,
            cursor: 0,
            end: 0,
            batch: 1,
        }
    }

    pub fn all(&self) -> Batch {
        self.data.clone()
    }
}

impl DataSource for Samples {
    type Batch = Batch;

    fn start_epoch(&mut self, _epoch: usize, minibatch_size: usize, rank: usize, ranks: usize) {
        let n = self.data.len();
        self.cursor = rank * n / ranks;
        self.end = (rank + 1) * n / ranks;
        self.batch = (minibatch_size / ranks).max(1);
    }

    fn next_batch(&mut self) -> Option<Batch> {
        if self.cursor >= self.end {
            return None;
        }

        let end = (self.cursor + self.batch).min(self.end);
        let batch = self.data[self.cursor..end].to_vec();
        self.cursor = end;
        Some(batch)
    }

    fn probe_batches(&mut self, _epoch: usize, minibatch_size: usize, samples: usize) -> Vec<Batch> {
        let n = samples.min(self.data.len());
        self.data[..n]
            .chunks(minibatch_size.max(1))
            .map(|c| c.to_vec())
            .collect()
    }
}

/// The average loss of an untrained `Line` over `Samples::line(n)`.
pub fn initial_criterion(n: usize) -> f64 {
    let mut line = Line::new();
    let data = Samples::line(n).all();
    line.evaluate(&data).unwrap().criterion / n as f64
}

/// Trains one `Line` per rank of an in-process cluster.
///
/// # Returns
/// Every rank's summary and final parameters, ordered by rank.
pub async fn train_ranks(
    config: SgdConfig,
    ranks: usize,
    samples: usize,
    store: Option<AsyncContext>,
) -> Vec<(TrainingSummary, Vec<f32>)> {
    train_lines(config, ranks, samples, store, Line::new).await
}

/// Trains one `make()` per rank of an in-process cluster.
pub async fn train_lines(
    config: SgdConfig,
    ranks: usize,
    samples: usize,
    store: Option<AsyncContext>,
    make: fn() -> Line,
) -> Vec<(TrainingSummary, Vec<f32>)> {
    let mut tasks = JoinSet::new();

    for transport in LocalCluster::new(ranks) {
        let config = config.clone();
        let store = store.clone();

        tasks.spawn(async move {
            let rank = transport.current_rank();
            let mut driver =
                EpochDriver::new(config, transport, make(), Samples::line(samples)).unwrap();
            if let Some(ctx) = store {
                driver = driver.with_parameter_server(ctx);
            }

            let summary = driver.train().await.unwrap();
            (rank, summary, driver.engine().parameters()[0].to_vec())
        });
    }

    let mut results = tasks.join_all().await;
    results.sort_by_key(|(rank, ..)| *rank);
    results
        .into_iter()
        .map(|(_, summary, params)| (summary, params))
        .collect()
}
