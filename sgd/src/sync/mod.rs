mod averaging;
mod block_momentum;

pub use averaging::ModelAveraging;
pub use block_momentum::{BlockMomentum, BlockMomentumState};

use comms::{Transport, broadcast_from_root};

use crate::{Result, distributed::Distributed, gradient::DeviceBuffer};

/// What a synchronization round tells every rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Samples processed by every rank since the previous round.
    pub global_samples: usize,
    /// Every rank ran out of data.
    pub all_finished: bool,
}

/// Periodic synchronization of the parameters themselves.
///
/// The caller decides when a round fires, implementors only define what it
/// computes.
#[allow(unused)]
#[trait_variant::make(ParameterSynchronizer: Send)]
pub trait LocalParameterSynchronizer {
    /// Makes every rank start from rank 0's parameters.
    async fn initialize(&mut self, params: &mut [DeviceBuffer<f32>]) -> Result<()>;

    /// Runs one synchronization round.
    ///
    /// # Arguments
    /// * `params` - This rank's parameters, overwritten with the synchronized ones.
    /// * `local_samples` - Samples this rank processed since the previous round.
    /// * `finished` - This rank has no data left for the epoch.
    ///
    /// # Returns
    /// The round's totals.
    async fn synchronize(
        &mut self,
        params: &mut [DeviceBuffer<f32>],
        local_samples: usize,
        finished: bool,
    ) -> Result<SyncOutcome>;
}

/// The synchronizer picked for a run.
#[derive(Debug)]
pub enum ParameterSync<T> {
    Averaging(ModelAveraging<T>),
    BlockMomentum(BlockMomentum<T>),
}

impl<T: Transport + Sync> ParameterSynchronizer for ParameterSync<T> {
    async fn initialize(&mut self, params: &mut [DeviceBuffer<f32>]) -> Result<()> {
        match self {
            Self::Averaging(s) => ParameterSynchronizer::initialize(s, params).await,
            Self::BlockMomentum(s) => ParameterSynchronizer::initialize(s, params).await,
        }
    }

    async fn synchronize(
        &mut self,
        params: &mut [DeviceBuffer<f32>],
        local_samples: usize,
        finished: bool,
    ) -> Result<SyncOutcome> {
        match self {
            Self::Averaging(s) => ParameterSynchronizer::synchronize(s, params, local_samples, finished).await,
            Self::BlockMomentum(s) => ParameterSynchronizer::synchronize(s, params, local_samples, finished).await,
        }
    }
}

impl<T: Transport + Sync> Distributed for ParameterSync<T> {
    type Transport = T;

    fn transport(&self) -> &T {
        match self {
            Self::Averaging(s) => s.transport(),
            Self::BlockMomentum(s) => s.transport(),
        }
    }
}

/// Copies rank 0's parameters everywhere.
async fn broadcast_params<T: Transport + Sync>(
    transport: &T,
    params: &mut [DeviceBuffer<f32>],
) -> Result<()> {
    for p in params.iter_mut() {
        broadcast_from_root(transport, 0, p).await?;
    }

    Ok(())
}

/// Sums every rank's parameters in a single reduction.
///
/// # Returns
/// The summed parameters flattened in `f64` and the round's totals.
async fn sum_params<T: Transport + Sync>(
    transport: &T,
    params: &[DeviceBuffer<f32>],
    local_samples: usize,
    finished: bool,
) -> Result<(Vec<f64>, SyncOutcome)> {
    let len: usize = params.iter().map(|p| p.len()).sum();
    let mut wire = Vec::with_capacity(2 + len);
    wire.extend([local_samples as f64, finished as u8 as f64]);
    wire.extend(params.iter().flat_map(|p| p.iter()).map(|&v| v as f64));

    transport.all_reduce(&mut wire).await?;

    let outcome = SyncOutcome {
        global_samples: wire[0] as usize,
        all_finished: wire[1] as usize == transport.rank_count(),
    };

    wire.drain(..2);
    Ok((wire, outcome))
}
