use std::sync::Arc;

use tokio::sync::Barrier;

use crate::{
    optimization::Optimizer,
    storage::{ParameterHandle, Result},
};

/// Skips synchronization between ranks on the hot path, pushed deltas are applied immediately.
///
/// A barrier is only entered through `wait_all`, at convergence points.
#[derive(Clone)]
pub struct NoBlockingSync {
    barrier: Arc<Barrier>,
}

impl NoBlockingSync {
    /// Creates a new `NoBlockingSync` synchronizer.
    ///
    /// # Arguments
    /// * `workers` - The amount of ranks sharing the store.
    ///
    /// # Returns
    /// A new `NoBlockingSync` instance.
    pub fn new(workers: usize) -> Self {
        Self {
            barrier: Arc::new(Barrier::new(workers)),
        }
    }

    /// Pushes `delta` into the store and pulls the latest parameters into `params`.
    ///
    /// # Arguments
    /// * `handle` - The parameter handle holding the parameters of the model.
    /// * `delta` - The parameter delta to accumulate.
    /// * `params` - Where to write the resultant parameters.
    ///
    /// # Returns
    /// An error if there's a size mismatch between `delta`, `params` and the size of the store.
    pub async fn step<O>(
        &self,
        handle: &ParameterHandle<O>,
        delta: &[f32],
        params: &mut [f32],
    ) -> Result<()>
    where
        O: Optimizer + Send,
    {
        handle.push(delta).await?;
        handle.pull_params(params).await
    }

    /// Waits for every rank and applies whatever is still accumulated.
    ///
    /// A push racing with an update may land in the accumulator that was just
    /// frozen, so both accumulators are flushed before releasing the ranks.
    ///
    /// # Arguments
    /// * `handle` - The parameter handle holding the parameters of the model.
    pub async fn wait_all<O>(&self, handle: &ParameterHandle<O>)
    where
        O: Optimizer + Send,
    {
        if self.barrier.wait().await.is_leader() {
            handle.flush().await;
        }

        self.barrier.wait().await;
    }
}
