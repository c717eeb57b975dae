use tokio::task;

use super::{ParameterStore, Result};
use crate::optimization::Optimizer;

/// A cloneable, async front to a shared `ParameterStore`.
///
/// Every clone refers to the same store. The CPU-bound store work runs in
/// place on the calling worker thread, so callers need a multi-threaded runtime.
pub struct ParameterHandle<O: Optimizer> {
    store: ParameterStore<O>,
}

impl<O: Optimizer> Clone for ParameterHandle<O> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<O: Optimizer> ParameterHandle<O> {
    /// Creates a new `ParameterHandle`.
    ///
    /// # Arguments
    /// * `store` - The underlying parameter store.
    ///
    /// # Returns
    /// A new `ParameterHandle` instance.
    pub fn new(store: ParameterStore<O>) -> Self {
        Self { store }
    }

    /// Returns the amount of parameters held by the store.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Returns `true` if the store holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Returns the amount of updates applied to the store so far.
    pub fn updates(&self) -> u64 {
        self.store.updates()
    }
}

impl<O: Optimizer + Send> ParameterHandle<O> {
    /// Accumulates `delta` without applying it.
    ///
    /// # Arguments
    /// * `delta` - A flat slice with one entry per parameter.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `delta` doesn't match the size of the store.
    pub async fn accumulate(&self, delta: &[f32]) -> Result<()> {
        task::block_in_place(|| self.store.accumulate(delta))?;
        Ok(())
    }

    /// Applies whatever was accumulated since the last update.
    ///
    /// # Returns
    /// `false` if another update was already running and this one was skipped.
    pub async fn update_params(&self) -> bool {
        task::block_in_place(|| self.store.update_params())
    }

    /// Accumulates `delta` and returns once an update including it was applied.
    ///
    /// If another rank is applying its own deltas, this waits for it and then
    /// applies again, so any pull issued afterwards observes `delta`.
    ///
    /// # Arguments
    /// * `delta` - A flat slice with one entry per parameter.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `delta` doesn't match the size of the store.
    pub async fn push(&self, delta: &[f32]) -> Result<()> {
        task::block_in_place(|| self.store.push(delta))
    }

    /// Applies both accumulation buffers, leaving nothing pending.
    ///
    /// Only meaningful once no rank is pushing anymore.
    pub async fn flush(&self) {
        self.update_params().await;
        self.update_params().await;
    }

    /// Copies the latest parameters into `out`.
    ///
    /// # Arguments
    /// * `out` - A mutable slice where the parameters will be copied.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `out` doesn't match the size of the store.
    pub async fn pull_params(&self, out: &mut [f32]) -> Result<()> {
        task::block_in_place(|| self.store.pull_params(out))
    }
}
