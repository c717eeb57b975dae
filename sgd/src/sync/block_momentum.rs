use comms::Transport;
use log::debug;

use super::{ParameterSynchronizer, SyncOutcome, broadcast_params, sum_params};
use crate::{Result, SgdErr, distributed::Distributed, gradient::DeviceBuffer};

/// The global model and block momentum kept between rounds, one entry per parameter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockMomentumState {
    pub global: Vec<Vec<f64>>,
    pub momentum: Vec<Vec<f64>>,
}

/// Block-wise model update filtering.
///
/// Every round treats the difference between the averaged model and the global
/// model as a block gradient, filters it through a momentum term and moves the
/// global model by the result.
#[derive(Debug, Clone)]
pub struct BlockMomentum<T> {
    transport: T,
    block_momentum: f64,
    block_learning_rate: f64,
    use_nesterov: bool,
    state: BlockMomentumState,
}

impl<T: Transport + Sync> BlockMomentum<T> {
    /// Creates a new `BlockMomentum` synchronizer.
    ///
    /// # Arguments
    /// * `transport` - The collective layer shared with the other ranks.
    /// * `block_momentum` - The momentum applied to the block gradients, in `[0, 1)`.
    /// * `block_learning_rate` - The scale of every block gradient.
    /// * `use_nesterov` - Hands out the look-ahead model instead of the global one.
    ///
    /// # Returns
    /// A new `BlockMomentum` instance.
    pub fn new(transport: T, block_momentum: f64, block_learning_rate: f64, use_nesterov: bool) -> Self {
        Self {
            transport,
            block_momentum,
            block_learning_rate,
            use_nesterov,
            state: BlockMomentumState::default(),
        }
    }

    /// Zeroes the momentum, keeping the global model.
    pub fn reset_momentum(&mut self) {
        self.state
            .momentum
            .iter_mut()
            .for_each(|u| u.fill(0.));
    }

    pub fn export_state(&self) -> BlockMomentumState {
        self.state.clone()
    }

    /// Restores the state saved before a restart.
    ///
    /// # Arguments
    /// * `state` - The saved state.
    /// * `reset_momentum` - Drops the saved momentum, keeping the global model.
    pub fn import_state(&mut self, state: BlockMomentumState, reset_momentum: bool) {
        self.state = state;
        if reset_momentum {
            self.reset_momentum();
        }
    }

    fn matches(&self, params: &[DeviceBuffer<f32>]) -> bool {
        self.state.global.len() == params.len()
            && self
                .state
                .global
                .iter()
                .zip(&self.state.momentum)
                .zip(params)
                .all(|((g, u), p)| g.len() == p.len() && u.len() == p.len())
    }
}

impl<T: Transport + Sync> ParameterSynchronizer for BlockMomentum<T> {
    /// Starts every rank from rank 0's parameters.
    ///
    /// An imported global model is kept if it matches the parameters' shapes,
    /// otherwise the global model starts at the parameters with zero momentum.
    async fn initialize(&mut self, params: &mut [DeviceBuffer<f32>]) -> Result<()> {
        broadcast_params(&self.transport, params).await?;

        if !self.matches(params) {
            self.state = BlockMomentumState {
                global: params
                    .iter()
                    .map(|p| p.iter().map(|&v| v as f64).collect())
                    .collect(),
                momentum: params.iter().map(|p| vec![0.; p.len()]).collect(),
            };
        }

        Ok(())
    }

    async fn synchronize(
        &mut self,
        params: &mut [DeviceBuffer<f32>],
        local_samples: usize,
        finished: bool,
    ) -> Result<SyncOutcome> {
        if !self.matches(params) {
            return Err(SgdErr::SizeMismatch {
                what: "block momentum state",
                got: params.len(),
                expected: self.state.global.len(),
            });
        }

        let (sum, outcome) = sum_params(&self.transport, params, local_samples, finished).await?;
        let ranks = self.transport.rank_count() as f64;
        let (bm, blr) = (self.block_momentum, self.block_learning_rate);

        let mut sum = sum.into_iter();
        for ((p, w), u) in params
            .iter_mut()
            .zip(self.state.global.iter_mut())
            .zip(self.state.momentum.iter_mut())
        {
            for ((p, w), u) in p.iter_mut().zip(w.iter_mut()).zip(u.iter_mut()) {
                let avg = sum.next().unwrap_or_default() / ranks;
                *u = bm * *u + blr * (avg - *w);
                *w += *u;
                *p = if self.use_nesterov {
                    (*w + bm * *u) as f32
                } else {
                    *w as f32
                };
            }
        }

        debug!(
            rank = self.transport.current_rank(),
            samples = outcome.global_samples;
            "applied block momentum"
        );

        Ok(outcome)
    }
}

impl<T: Transport + Sync> Distributed for BlockMomentum<T> {
    type Transport = T;

    fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use comms::LocalCluster;
    use tokio::task::JoinSet;

    use super::*;
    use crate::sync::ModelAveraging;

    async fn run_two_ranks<F, S>(make: F) -> Vec<f32>
    where
        F: Fn(comms::LocalTransport) -> S,
        S: ParameterSynchronizer + 'static,
    {
        let mut set = JoinSet::new();

        for transport in LocalCluster::new(2) {
            let rank = transport.current_rank();
            let mut sync = make(transport);
            set.spawn(async move {
                let mut params = vec![DeviceBuffer::from(vec![0f32])];
                sync.initialize(&mut params).await.unwrap();

                params[0][0] = if rank == 0 { 1.0 } else { 3.0 };
                let outcome = sync.synchronize(&mut params, 10, rank == 1).await.unwrap();
                assert_eq!(outcome.global_samples, 20);
                assert!(!outcome.all_finished);

                params[0][0]
            });
        }

        set.join_all().await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_momentum_is_model_averaging() {
        let averaged = run_two_ranks(ModelAveraging::new).await;
        let filtered = run_two_ranks(|t| BlockMomentum::new(t, 0., 1., false)).await;

        assert_eq!(averaged, [2.0, 2.0]);
        assert_eq!(filtered, averaged);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn momentum_carries_over_to_the_next_round() {
        let mut set = JoinSet::new();

        for transport in LocalCluster::new(2) {
            set.spawn(async move {
                let mut sync = BlockMomentum::new(transport, 0.5, 1., false);
                let mut params = vec![DeviceBuffer::from(vec![0f32])];
                sync.initialize(&mut params).await.unwrap();

                // every rank moves by +2 in both blocks
                params[0][0] += 2.;
                sync.synchronize(&mut params, 1, false).await.unwrap();
                let first = params[0][0];

                params[0][0] += 2.;
                sync.synchronize(&mut params, 1, false).await.unwrap();
                (first, params[0][0], sync.export_state())
            });
        }

        for (first, second, state) in set.join_all().await {
            assert_eq!(first, 2.);
            // u = 0.5 * 2 + 2, w = 2 + 3
            assert_eq!(second, 5.);
            assert_eq!(state.momentum, [vec![3.]]);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nesterov_hands_out_the_look_ahead() {
        let transport = LocalCluster::new(1).remove(0);
        let mut sync = BlockMomentum::new(transport, 0.5, 1., true);
        let mut params = vec![DeviceBuffer::from(vec![0f32])];
        sync.initialize(&mut params).await.unwrap();

        params[0][0] = 2.;
        let outcome = sync.synchronize(&mut params, 4, true).await.unwrap();

        assert!(outcome.all_finished);
        // w = 2, u = 2, w + 0.5 u
        assert_eq!(params[0][0], 3.);
    }

    #[test]
    fn imported_momentum_can_be_reset() {
        let transport = LocalCluster::new(1).remove(0);
        let mut sync = BlockMomentum::new(transport, 0.5, 1., true);

        sync.import_state(
            BlockMomentumState {
                global: vec![vec![1., 2.]],
                momentum: vec![vec![0.5, 0.5]],
            },
            true,
        );

        let state = sync.export_state();
        assert_eq!(state.global, [vec![1., 2.]]);
        assert_eq!(state.momentum, [vec![0., 0.]]);
    }
}
