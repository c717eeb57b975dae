use std::num::NonZeroUsize;

use log::debug;
use parameter_server::{AddDelta, NoBlockingSync, ParameterHandle, ParameterStore};

use crate::{Result, SgdErr, gradient::DeviceBuffer};

/// The parameter store every rank of an asynchronous run pushes into.
///
/// Cloned once per rank, every clone refers to the same store.
#[derive(Clone)]
pub struct AsyncContext {
    handle: ParameterHandle<AddDelta>,
    sync: NoBlockingSync,
}

impl AsyncContext {
    /// Creates a new `AsyncContext`.
    ///
    /// # Arguments
    /// * `initial` - The parameters the store starts from.
    /// * `ranks` - The amount of ranks sharing the store.
    /// * `shard_size` - The maximum amount of parameters per store shard.
    ///
    /// # Returns
    /// A new `AsyncContext` instance.
    pub fn new(initial: &[DeviceBuffer<f32>], ranks: usize, shard_size: NonZeroUsize) -> Self {
        let flat = flatten(initial);
        let store = ParameterStore::new(shard_size, &flat, |_| AddDelta::default());

        Self {
            handle: ParameterHandle::new(store),
            sync: NoBlockingSync::new(ranks),
        }
    }

    /// Returns the amount of store updates applied so far.
    pub fn updates(&self) -> u64 {
        self.handle.updates()
    }
}

fn flatten(params: &[DeviceBuffer<f32>]) -> Vec<f32> {
    params.iter().flat_map(|p| p.iter().copied()).collect()
}

/// One rank's side of asynchronous SGD.
///
/// The rank trains on its local copy of the parameters, and once it has seen
/// `interval` samples it pushes the difference to the last pulled parameters
/// into the store and pulls the latest global ones back.
pub struct AsyncCoordinator {
    ctx: AsyncContext,
    anchor: Vec<f32>,
    since_sync: usize,
    interval: usize,
}

impl AsyncCoordinator {
    /// Creates a new `AsyncCoordinator`, overwriting `params` with the store's.
    ///
    /// # Arguments
    /// * `ctx` - The shared store.
    /// * `params` - This rank's parameters.
    /// * `interval` - Samples between two synchronizations with the store.
    ///
    /// # Returns
    /// The coordinator, or an error if `params` doesn't match the store.
    pub async fn new(
        ctx: AsyncContext,
        params: &mut [DeviceBuffer<f32>],
        interval: usize,
    ) -> Result<Self> {
        let mut coordinator = Self {
            ctx,
            anchor: Vec::new(),
            since_sync: 0,
            interval,
        };

        coordinator.pull(params).await?;
        Ok(coordinator)
    }

    pub fn set_interval(&mut self, interval: usize) {
        self.interval = interval;
    }

    /// Accumulates `delta` into the store and applies it.
    pub async fn push(&self, delta: &[f32]) -> Result<()> {
        Ok(self.ctx.handle.push(delta).await?)
    }

    /// Overwrites `params` with the latest global parameters.
    pub async fn pull(&mut self, params: &mut [DeviceBuffer<f32>]) -> Result<()> {
        let len: usize = params.iter().map(|p| p.len()).sum();
        if len != self.ctx.handle.len() {
            return Err(SgdErr::SizeMismatch {
                what: "parameter store",
                got: len,
                expected: self.ctx.handle.len(),
            });
        }

        self.anchor.resize(len, 0.);
        self.ctx.handle.pull_params(&mut self.anchor).await?;
        self.scatter(params);
        Ok(())
    }

    /// Copies the last pulled parameters into `params`.
    fn scatter(&self, params: &mut [DeviceBuffer<f32>]) {
        let mut offset = 0;
        for p in params.iter_mut() {
            let len = p.len();
            p.copy_from_slice(&self.anchor[offset..offset + len]);
            offset += len;
        }
    }

    /// Pushes the local progress since the last pull, then pulls.
    pub async fn sync_now(&mut self, params: &mut [DeviceBuffer<f32>]) -> Result<()> {
        let len: usize = params.iter().map(|p| p.len()).sum();
        if len != self.anchor.len() {
            return Err(SgdErr::SizeMismatch {
                what: "parameter store",
                got: len,
                expected: self.anchor.len(),
            });
        }

        let delta: Vec<f32> = params
            .iter()
            .flat_map(|p| p.iter())
            .zip(&self.anchor)
            .map(|(p, a)| p - a)
            .collect();

        self.ctx
            .sync
            .step(&self.ctx.handle, &delta, &mut self.anchor)
            .await?;
        self.scatter(params);

        debug!(samples = self.since_sync, updates = self.ctx.updates(); "synchronized with the store");
        self.since_sync = 0;
        Ok(())
    }

    /// Records `samples` processed samples and synchronizes if the interval is reached.
    ///
    /// # Returns
    /// `true` if a synchronization happened.
    pub async fn on_samples(
        &mut self,
        params: &mut [DeviceBuffer<f32>],
        samples: usize,
    ) -> Result<bool> {
        self.since_sync += samples;
        if self.since_sync < self.interval {
            return Ok(false);
        }

        self.sync_now(params).await?;
        Ok(true)
    }

    /// Waits for every rank, after which every push issued before is applied.
    pub async fn wait_all(&self) {
        self.ctx.sync.wait_all(&self.ctx.handle).await;
    }
}
