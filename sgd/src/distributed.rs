use std::future::Future;

use comms::Transport;

use crate::Result;

/// Shared base of every component taking part in cross-rank coordination.
///
/// Implementors only expose their injected transport, the rank queries and the
/// barrier come for free.
pub trait Distributed: Sync {
    type Transport: Transport + Sync;

    /// Returns the transport this component was built with.
    fn transport(&self) -> &Self::Transport;

    /// Returns the amount of ranks taking part in the run.
    fn rank_count(&self) -> usize {
        self.transport().rank_count()
    }

    /// Returns the index of this rank.
    fn current_rank(&self) -> usize {
        self.transport().current_rank()
    }

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self) -> impl Future<Output = Result<()>> + Send {
        async move { Ok(self.transport().barrier().await?) }
    }
}
