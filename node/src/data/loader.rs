use std::{ops::Range, sync::Arc};

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use sgd::engine::DataSource;

use super::{
    dataset::{Batch, InMemoryDataset},
    shard::shard_range,
};

/// Shard-aware loader reshuffling the dataset every epoch.
///
/// Every rank shuffles with the same seed, so the shards of an epoch stay
/// disjoint.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<InMemoryDataset>,
    seed: u64,
    order: Vec<usize>,
    shard: Range<usize>,
    batch_size: usize,
    cursor: usize,
}

impl DataLoader {
    pub fn new(dataset: Arc<InMemoryDataset>, seed: u64) -> Self {
        Self {
            order: (0..dataset.len()).collect(),
            dataset,
            seed,
            shard: 0..0,
            batch_size: 1,
            cursor: 0,
        }
    }

    pub fn shard(&self) -> Range<usize> {
        self.shard.clone()
    }
}

impl DataSource for DataLoader {
    type Batch = Batch;

    fn start_epoch(&mut self, epoch: usize, minibatch_size: usize, rank: usize, ranks: usize) {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        self.order.sort_unstable();
        self.order.shuffle(&mut rng);

        self.shard = shard_range(self.dataset.len(), rank, ranks);
        self.cursor = self.shard.start;
        self.batch_size = (minibatch_size / ranks).max(1);
    }

    fn next_batch(&mut self) -> Option<Batch> {
        if self.cursor >= self.shard.end {
            return None;
        }

        let end = (self.cursor + self.batch_size).min(self.shard.end);
        let batch = self.dataset.gather(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }

    fn probe_batches(&mut self, _epoch: usize, minibatch_size: usize, samples: usize) -> Vec<Batch> {
        let n = samples.min(self.dataset.len());
        let indices: Vec<usize> = (0..n).collect();

        indices
            .chunks(minibatch_size.max(1))
            .map(|c| self.dataset.gather(c))
            .collect()
    }
}
