use crate::{Element, Result, TransportErr};

/// The collective communication primitives a training rank relies on.
///
/// Every collective must be entered by all ranks in the same order, otherwise
/// the cluster deadlocks.
#[allow(unused)]
#[trait_variant::make(Transport: Send)]
pub trait TransportTemplate: Sync {
    /// Returns the amount of ranks taking part in the run.
    fn rank_count(&self) -> usize;

    /// Returns the index of this rank, in `0..rank_count()`.
    fn current_rank(&self) -> usize;

    /// Blocks until every rank has reached the barrier.
    async fn barrier(&self) -> Result<()>;

    /// Replaces `buf` with the element-wise sum of every rank's `buf`.
    ///
    /// # Arguments
    /// * `buf` - This rank's contribution, overwritten with the cluster-wide sum.
    ///
    /// # Returns
    /// A `TransportErr::LengthMismatch` on every rank if any two ranks passed buffers
    /// of different lengths.
    async fn all_reduce<E: Element>(&self, buf: &mut [E]) -> Result<()>;
}

/// Copies `root`'s `buf` into every other rank's `buf`.
///
/// Implemented on top of `all_reduce`, the non-root ranks contribute zeros.
///
/// # Arguments
/// * `transport` - The cluster transport.
/// * `root` - The rank whose buffer is broadcasted.
/// * `buf` - The buffer to send (on `root`) or overwrite (everywhere else).
///
/// # Returns
/// An error if `root` is not a valid rank or the underlying reduction fails.
pub async fn broadcast_from_root<T, E>(transport: &T, root: usize, buf: &mut [E]) -> Result<()>
where
    T: Transport,
    E: Element,
{
    let ranks = transport.rank_count();
    if root >= ranks {
        return Err(TransportErr::InvalidRank { rank: root, ranks });
    }

    if transport.current_rank() != root {
        buf.fill(E::default());
    }

    transport.all_reduce(buf).await
}
