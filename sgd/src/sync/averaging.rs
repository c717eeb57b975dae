use comms::Transport;
use log::debug;

use super::{ParameterSynchronizer, SyncOutcome, broadcast_params, sum_params};
use crate::{Result, distributed::Distributed, gradient::DeviceBuffer};

/// Replaces every rank's parameters with the arithmetic mean over all ranks.
#[derive(Debug, Clone)]
pub struct ModelAveraging<T> {
    transport: T,
}

impl<T: Transport + Sync> ModelAveraging<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

impl<T: Transport + Sync> ParameterSynchronizer for ModelAveraging<T> {
    async fn initialize(&mut self, params: &mut [DeviceBuffer<f32>]) -> Result<()> {
        broadcast_params(&self.transport, params).await
    }

    async fn synchronize(
        &mut self,
        params: &mut [DeviceBuffer<f32>],
        local_samples: usize,
        finished: bool,
    ) -> Result<SyncOutcome> {
        let (sum, outcome) = sum_params(&self.transport, params, local_samples, finished).await?;
        let ranks = self.transport.rank_count() as f64;

        params
            .iter_mut()
            .flat_map(|p| p.iter_mut())
            .zip(sum)
            .for_each(|(p, s)| *p = (s / ranks) as f32);

        debug!(
            rank = self.transport.current_rank(),
            samples = outcome.global_samples;
            "averaged parameters"
        );

        Ok(outcome)
    }
}

impl<T: Transport + Sync> Distributed for ModelAveraging<T> {
    type Transport = T;

    fn transport(&self) -> &T {
        &self.transport
    }
}
