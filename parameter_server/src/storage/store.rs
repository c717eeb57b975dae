use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use log::debug;
use rayon::prelude::*;

use crate::{
    optimization::Optimizer,
    storage::{ParameterShard, Result, SizeMismatchErr},
};

/// Partitions the model's parameters in shards and leverages
/// parallelization to read and write them as fast as possible.
///
/// These methods are private to the crate, they become available
/// through the async interface of a `ParameterHandle`.
#[derive(Debug)]
pub struct ParameterStore<O: Optimizer> {
    nparams: usize,
    generation: Arc<AtomicU64>,
    updating: Arc<AtomicBool>,
    applied: Arc<AtomicU64>,
    shards: Arc<[ParameterShard<O>]>,
    shard_size: NonZeroUsize,
}

impl<O: Optimizer> Clone for ParameterStore<O> {
    fn clone(&self) -> Self {
        Self {
            nparams: self.nparams,
            generation: Arc::clone(&self.generation),
            updating: Arc::clone(&self.updating),
            applied: Arc::clone(&self.applied),
            shards: Arc::clone(&self.shards),
            shard_size: self.shard_size,
        }
    }
}

impl<O: Optimizer> ParameterStore<O> {
    /// Creates a new `ParameterStore`.
    ///
    /// # Arguments
    /// * `shard_size` - The maximum amount of parameters per shard.
    /// * `params` - The initial flat parameters of the model.
    /// * `optimizer_factory` - An `Optimizer` factory closure, called once per shard with its size.
    ///
    /// # Returns
    /// A new `ParameterStore` instance.
    pub fn new<OF>(shard_size: NonZeroUsize, params: &[f32], mut optimizer_factory: OF) -> Self
    where
        OF: FnMut(usize) -> O,
    {
        let shards: Vec<_> = params
            .chunks(shard_size.get())
            .map(|chunk| ParameterShard::new(chunk.to_vec(), optimizer_factory(chunk.len())))
            .collect();

        Self {
            nparams: params.len(),
            generation: Arc::new(AtomicU64::new(0)),
            updating: Arc::new(AtomicBool::new(false)),
            applied: Arc::new(AtomicU64::new(0)),
            shards: Arc::from(shards),
            shard_size,
        }
    }

    /// Returns the amount of parameters in the store.
    pub fn len(&self) -> usize {
        self.nparams
    }

    /// Returns `true` if the store holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.nparams == 0
    }

    /// Returns how many times the accumulated deltas were applied to the parameters.
    pub fn updates(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if self.nparams != len {
            return Err(SizeMismatchErr {
                got: len,
                expected: self.nparams,
            });
        }

        Ok(())
    }
}

impl<O: Optimizer + Send> ParameterStore<O> {
    /// Accumulates a delta into the active accumulator.
    ///
    /// # Arguments
    /// * `delta` - A flat slice with one entry per parameter.
    ///
    /// # Returns
    /// The generation the delta was accumulated at, or a `SizeMismatchErr` if
    /// `delta` doesn't match the amount of parameters.
    pub(crate) fn accumulate(&self, delta: &[f32]) -> Result<u64> {
        self.check_len(delta.len())?;
        let generation = self.generation.load(Ordering::Acquire);
        let active_idx = (generation & 1) as usize;

        self.shards
            .par_iter()
            .zip(delta.par_chunks(self.shard_size.get()))
            .try_for_each(|(shard, slice)| shard.accumulate(active_idx, slice))?;

        Ok(generation)
    }

    /// Returns the amount of applied updates after which a delta accumulated
    /// at `generation` is part of the parameters.
    ///
    /// If the accumulator was swapped while the delta was being written, part
    /// of it may have missed that update, so it waits for the next time the
    /// same accumulator is frozen.
    pub(crate) fn applied_by(&self, generation: u64) -> u64 {
        if self.generation.load(Ordering::Acquire) == generation {
            generation + 1
        } else {
            generation + 3
        }
    }

    /// Accumulates `delta` and returns once an update including it was applied.
    ///
    /// # Arguments
    /// * `delta` - A flat slice with one entry per parameter.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `delta` doesn't match the amount of parameters.
    pub(crate) fn push(&self, delta: &[f32]) -> Result<()> {
        let target = self.applied_by(self.accumulate(delta)?);

        while self.updates() < target {
            if !self.update_params() {
                std::thread::yield_now();
            }
        }

        Ok(())
    }

    /// Swaps the active accumulator and applies the frozen one to the parameters.
    ///
    /// If another caller is already applying, this is a no-op: the deltas just pushed
    /// stay in the now active accumulator and are applied by the next update.
    ///
    /// # Returns
    /// `true` if this call applied the deltas.
    pub(crate) fn update_params(&self) -> bool {
        let success = self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();

        if success {
            let frozen_idx = (self.generation.fetch_add(1, Ordering::AcqRel) & 1) as usize;

            self.shards
                .par_iter()
                .for_each(|shard| shard.update_params(frozen_idx));

            let applied = self.applied.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(frozen_idx = frozen_idx, applied = applied; "applied accumulated deltas");
            self.updating.store(false, Ordering::Release);
        }

        success
    }

    /// Gathers all the sharded parameters into `out`.
    ///
    /// # Arguments
    /// * `out` - A mutable slice where the parameters will be copied.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `out` doesn't match the amount of parameters.
    pub(crate) fn pull_params(&self, out: &mut [f32]) -> Result<()> {
        self.check_len(out.len())?;

        self.shards
            .par_iter()
            .zip(out.par_chunks_mut(self.shard_size.get()))
            .try_for_each(|(shard, slice)| shard.pull_params(slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddDelta;

    fn create_test_store(params: usize, shard_size: usize) -> ParameterStore<AddDelta> {
        let shard_size = NonZeroUsize::new(shard_size).unwrap();
        ParameterStore::new(shard_size, &vec![0.; params], |_| AddDelta::default())
    }

    #[test]
    fn ragged_shards_cover_every_parameter() {
        const PARAMS: usize = 105;
        const SHARD_SIZE: usize = 10;

        let store = create_test_store(PARAMS, SHARD_SIZE);
        assert_eq!(store.shards.len(), 11);

        store.accumulate(&[1.0; PARAMS]).unwrap();
        store.update_params();

        let mut out = [0.0; PARAMS];
        store.pull_params(&mut out).unwrap();
        assert_eq!(out, [1.0; PARAMS]);
    }

    #[test]
    fn pushes_after_a_swap_wait_for_the_next_update() {
        const PARAMS: usize = 10;

        let store = create_test_store(PARAMS, 1);
        store.accumulate(&[1.0; PARAMS]).unwrap();

        assert!(store.update_params());
        assert_eq!(store.generation.load(Ordering::Acquire), 1);
        store.accumulate(&[5.0; PARAMS]).unwrap();

        let mut params = [0.0; PARAMS];
        store.pull_params(&mut params).unwrap();
        assert_eq!(params, [1.0; PARAMS]);

        store.update_params();
        store.pull_params(&mut params).unwrap();
        assert_eq!(params, [6.0; PARAMS]);
        assert_eq!(store.updates(), 2);
    }

    #[test]
    fn concurrent_updates_are_skipped() {
        let store = create_test_store(10, 1);
        store.updating.store(true, Ordering::SeqCst);

        let generation = store.generation.load(Ordering::Acquire);
        assert!(!store.update_params());
        assert_eq!(store.generation.load(Ordering::Acquire), generation);

        store.updating.store(false, Ordering::Release);
        assert!(store.update_params());
        assert_ne!(store.generation.load(Ordering::SeqCst), generation);
    }

    #[test]
    fn push_waits_for_a_running_update() {
        const PARAMS: usize = 4;

        let store = create_test_store(PARAMS, 2);
        store.updating.store(true, Ordering::SeqCst);

        let pusher = {
            let store = store.clone();
            std::thread::spawn(move || store.push(&[1.0; PARAMS]))
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!pusher.is_finished());

        store.updating.store(false, Ordering::Release);
        pusher.join().unwrap().unwrap();

        let mut out = [0.0; PARAMS];
        store.pull_params(&mut out).unwrap();
        assert_eq!(out, [1.0; PARAMS]);
    }

    #[test]
    fn deltas_written_across_a_swap_wait_for_the_same_accumulator() {
        let store = create_test_store(4, 2);

        let generation = store.accumulate(&[1.0; 4]).unwrap();
        assert_eq!(store.applied_by(generation), 1);

        store.update_params();
        assert_eq!(store.applied_by(generation), 3);
    }

    #[test]
    fn initial_parameters_are_kept() {
        let shard_size = NonZeroUsize::new(2).unwrap();
        let store = ParameterStore::new(shard_size, &[1.0, 2.0, 3.0], |_| AddDelta::default());

        let mut out = [0.0; 3];
        store.pull_params(&mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let store = create_test_store(4, 2);
        assert_eq!(
            store.accumulate(&[1.0; 3]).unwrap_err(),
            SizeMismatchErr { got: 3, expected: 4 }
        );
        assert!(store.pull_params(&mut [0.0; 5]).is_err());
    }
}
