use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use log::debug;
use parking_lot::Mutex;
use tokio::sync::Barrier;

use crate::{Element, Result, Transport, TransportErr};

/// A reduction slot shared by every rank of a `LocalCluster`.
///
/// The first contributor of a round overwrites the accumulator, the last reader
/// of a round resets the counters so the slot can be reused two rounds later.
#[derive(Debug, Default)]
struct Slot {
    acc: Vec<f64>,
    contributors: usize,
    readers: usize,
    mismatch: Option<usize>,
}

#[derive(Debug)]
struct Shared {
    ranks: usize,
    barrier: Barrier,
    slots: [Mutex<Slot>; 2],
}

/// An in-process cluster of ranks, each rank driven by its own task.
///
/// Useful for single host multi-rank training and for testing the collective protocol.
pub struct LocalCluster;

impl LocalCluster {
    /// Creates the transport handles of a new in-process cluster.
    ///
    /// # Arguments
    /// * `ranks` - The amount of ranks in the cluster, must be non-zero.
    ///
    /// # Returns
    /// One `LocalTransport` per rank, ordered by rank index.
    ///
    /// # Panics
    /// If `ranks` is zero.
    pub fn new(ranks: usize) -> Vec<LocalTransport> {
        assert!(ranks > 0, "a cluster needs at least one rank");

        let shared = Arc::new(Shared {
            ranks,
            barrier: Barrier::new(ranks),
            slots: [Mutex::new(Slot::default()), Mutex::new(Slot::default())],
        });

        (0..ranks)
            .map(|rank| LocalTransport {
                rank,
                round: Arc::new(AtomicU64::new(0)),
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank's handle to a `LocalCluster`.
///
/// Clones share the same round counter, so a clone may run a collective on
/// behalf of the rank as long as the rank doesn't run another one concurrently.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    rank: usize,
    round: Arc<AtomicU64>,
    shared: Arc<Shared>,
}

impl LocalTransport {
    fn contribute<E: Element>(&self, round: u64, buf: &[E]) {
        let mut slot = self.shared.slots[(round % 2) as usize].lock();

        if slot.contributors == 0 {
            slot.acc.clear();
            slot.acc.extend(buf.iter().map(|x| x.to_f64()));
            slot.mismatch = None;
        } else if slot.acc.len() != buf.len() {
            slot.mismatch = Some(buf.len());
        } else {
            slot.acc
                .iter_mut()
                .zip(buf)
                .for_each(|(acc, x)| *acc += x.to_f64());
        }

        slot.contributors += 1;
    }

    fn collect<E: Element>(&self, round: u64, buf: &mut [E]) -> Result<()> {
        let mut slot = self.shared.slots[(round % 2) as usize].lock();

        let res = match slot.mismatch {
            Some(got) => Err(TransportErr::LengthMismatch {
                round,
                got,
                expected: slot.acc.len(),
            }),
            None if slot.acc.len() != buf.len() => Err(TransportErr::LengthMismatch {
                round,
                got: buf.len(),
                expected: slot.acc.len(),
            }),
            None => {
                buf.iter_mut()
                    .zip(&slot.acc)
                    .for_each(|(x, acc)| *x = E::from_f64(*acc));
                Ok(())
            }
        };

        slot.readers += 1;
        if slot.readers == self.shared.ranks {
            slot.readers = 0;
            slot.contributors = 0;
        }

        res
    }
}

impl Transport for LocalTransport {
    fn rank_count(&self) -> usize {
        self.shared.ranks
    }

    fn current_rank(&self) -> usize {
        self.rank
    }

    async fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait().await;
        Ok(())
    }

    async fn all_reduce<E: Element>(&self, buf: &mut [E]) -> Result<()> {
        let round = self.round.fetch_add(1, Ordering::AcqRel);

        if self.shared.ranks == 1 {
            return Ok(());
        }

        self.contribute(round, buf);
        self.shared.barrier.wait().await;

        let res = self.collect(round, buf);
        if let Err(e) = &res {
            debug!(rank = self.rank, round = round; "all-reduce failed: {e}");
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use half::f16;
    use tokio::task::JoinSet;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn all_reduce_sums_every_rank() {
        let mut tasks = JoinSet::new();

        for t in LocalCluster::new(3) {
            tasks.spawn(async move {
                let mut buf = [t.current_rank() as f32, 1.0];
                t.all_reduce(&mut buf).await.unwrap();
                buf
            });
        }

        while let Some(res) = tasks.join_next().await {
            assert_eq!(res.unwrap(), [3.0, 3.0]);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn consecutive_rounds_do_not_mix() {
        const ROUNDS: usize = 10;
        let mut tasks = JoinSet::new();

        for t in LocalCluster::new(4) {
            tasks.spawn(async move {
                let mut sums = Vec::with_capacity(ROUNDS);
                for round in 0..ROUNDS {
                    let mut buf = [round as f64];
                    t.all_reduce(&mut buf).await.unwrap();
                    sums.push(buf[0]);
                }
                sums
            });
        }

        let expected: Vec<_> = (0..ROUNDS).map(|r| 4.0 * r as f64).collect();
        while let Some(res) = tasks.join_next().await {
            assert_eq!(res.unwrap(), expected);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn length_mismatch_fails_on_every_rank() {
        let mut tasks = JoinSet::new();

        for t in LocalCluster::new(2) {
            tasks.spawn(async move {
                let mut buf = vec![1.0f32; 2 + t.current_rank()];
                t.all_reduce(&mut buf).await
            });
        }

        while let Some(res) = tasks.join_next().await {
            assert!(matches!(
                res.unwrap(),
                Err(TransportErr::LengthMismatch { round: 0, .. })
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn half_buffers_are_reduced_in_wide_precision() {
        let mut tasks = JoinSet::new();

        for t in LocalCluster::new(2) {
            tasks.spawn(async move {
                let mut buf = [f16::from_f32(0.5)];
                t.all_reduce(&mut buf).await.unwrap();
                buf[0]
            });
        }

        while let Some(res) = tasks.join_next().await {
            assert_eq!(res.unwrap(), f16::from_f32(1.0));
        }
    }

    #[tokio::test]
    async fn single_rank_reduce_is_identity() {
        let t = LocalCluster::new(1).remove(0);
        let mut buf = [1.5f32, -2.0];
        t.all_reduce(&mut buf).await.unwrap();
        assert_eq!(buf, [1.5, -2.0]);
    }
}
