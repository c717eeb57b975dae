use parking_lot::{Mutex, RwLock};

use crate::{
    optimization::Optimizer,
    storage::{Result, SizeMismatchErr},
};

/// A slice of the parameters together with its two delta accumulators.
///
/// Ranks keep pushing into the active accumulator while the frozen one is being
/// applied, so an update never stalls a push for longer than one shard lock.
#[derive(Debug)]
pub struct ParameterShard<O: Optimizer> {
    nparams: usize,
    deltas: [Mutex<Box<[f32]>>; 2],
    params: RwLock<Box<[f32]>>,
    optimizer: Mutex<O>,
}

impl<O: Optimizer> ParameterShard<O> {
    /// Creates a new `ParameterShard`.
    ///
    /// # Arguments
    /// * `params` - The initial state of the parameters.
    /// * `optimizer` - How accumulated deltas are applied.
    ///
    /// # Returns
    /// A new `ParameterShard` instance.
    pub fn new(params: Vec<f32>, optimizer: O) -> Self {
        let nparams = params.len();

        Self {
            nparams,
            deltas: [
                Mutex::new(vec![0.; nparams].into_boxed_slice()),
                Mutex::new(vec![0.; nparams].into_boxed_slice()),
            ],
            params: RwLock::new(params.into_boxed_slice()),
            optimizer: Mutex::new(optimizer),
        }
    }

    /// Accumulates `delta` into the active accumulator.
    ///
    /// # Arguments
    /// * `active_idx` - The index of the active accumulator, must be `0` or `1`.
    /// * `delta` - The delta to accumulate.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `delta` isn't the same size as this shard.
    pub fn accumulate(&self, active_idx: usize, delta: &[f32]) -> Result<()> {
        if self.nparams != delta.len() {
            return Err(SizeMismatchErr {
                got: delta.len(),
                expected: self.nparams,
            });
        }

        self.deltas[active_idx]
            .lock()
            .iter_mut()
            .zip(delta)
            .for_each(|(acc, d)| *acc += d);

        Ok(())
    }

    /// Applies the frozen accumulator to the parameters and clears it.
    ///
    /// # Arguments
    /// * `frozen_idx` - The index of the frozen accumulator, must be `0` or `1`.
    pub fn update_params(&self, frozen_idx: usize) {
        let mut params = self.params.write();
        let mut acc = self.deltas[frozen_idx].lock();

        self.optimizer.lock().update_params(&acc, &mut params);
        acc.fill(0.);
    }

    /// Copies the shard's parameters into `out`.
    ///
    /// # Arguments
    /// * `out` - A mutable slice where the parameters will be copied.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `out` isn't the same size as this shard.
    pub fn pull_params(&self, out: &mut [f32]) -> Result<()> {
        if self.nparams != out.len() {
            return Err(SizeMismatchErr {
                got: out.len(),
                expected: self.nparams,
            });
        }

        out.copy_from_slice(&self.params.read());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddDelta;

    #[test]
    fn deltas_land_in_the_active_accumulator_only() {
        let shard = ParameterShard::new(vec![0.; 3], AddDelta::default());

        shard.accumulate(0, &[1.0, 2.0, 3.0]).unwrap();
        shard.accumulate(0, &[1.0, 1.0, 1.0]).unwrap();

        assert_eq!(**shard.deltas[0].lock(), [2., 3., 4.]);
        assert_eq!(**shard.deltas[1].lock(), [0., 0., 0.]);

        shard.update_params(0);

        let mut out = [0.; 3];
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [2., 3., 4.]);
        assert_eq!(**shard.deltas[0].lock(), [0., 0., 0.]);
    }

    #[test]
    fn frozen_accumulators_are_applied_independently() {
        let shard = ParameterShard::new(vec![1.], AddDelta::default());

        shard.accumulate(0, &[10.]).unwrap();
        shard.accumulate(1, &[5.]).unwrap();
        shard.update_params(0);

        let mut out = [0.];
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [11.]);

        shard.update_params(1);
        shard.pull_params(&mut out).unwrap();
        assert_eq!(out, [16.]);
    }

    #[test]
    fn wrong_sizes_are_rejected() {
        let shard = ParameterShard::new(vec![0.; 2], AddDelta::default());

        let err = shard.accumulate(0, &[1.0]).unwrap_err();
        assert_eq!(err, SizeMismatchErr { got: 1, expected: 2 });
        assert!(shard.pull_params(&mut [0.; 3]).is_err());
    }
}
