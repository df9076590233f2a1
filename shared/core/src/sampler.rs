use crate::seeded_rng;
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SamplerError {
    #[error("world size must be at least 1")]
    EmptyWorld,

    #[error("rank {rank} is out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },
}

/// Partitions dataset indices between the workers of a data-parallel run.
///
/// Every rank computes the same (optionally shuffled) permutation of `0..len` for
/// the current epoch, pads it by wrapping around until it divides evenly by the
/// world size (or truncates it when `drop_last` is set), and keeps every
/// `world_size`-th index starting at its own rank. The union of all shards for an
/// epoch is therefore the whole dataset, and shards only overlap on padding.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    world_size: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    drop_last: bool,
    epoch: u64,
}

impl DistributedSampler {
    pub fn new(dataset_len: usize, world_size: usize, rank: usize) -> Result<Self, SamplerError> {
        if world_size == 0 {
            return Err(SamplerError::EmptyWorld);
        }
        if rank >= world_size {
            return Err(SamplerError::RankOutOfRange { rank, world_size });
        }
        Ok(Self {
            dataset_len,
            world_size,
            rank,
            shuffle: true,
            seed: 0,
            drop_last: false,
            epoch: 0,
        })
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Must be called at the start of every epoch, otherwise every epoch reuses
    /// the same ordering.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Number of indices this rank yields per epoch.
    pub fn len(&self) -> usize {
        if self.drop_last {
            self.dataset_len / self.world_size
        } else {
            self.dataset_len.div_ceil(self.world_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn total_size(&self) -> usize {
        self.len() * self.world_size
    }

    pub fn indices(&self) -> Vec<usize> {
        if self.dataset_len == 0 {
            return Vec::new();
        }

        let mut indices: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            indices.shuffle(&mut seeded_rng(self.seed, self.epoch));
        }

        let total_size = self.total_size();
        if total_size > indices.len() {
            let padding: Vec<usize> = indices
                .iter()
                .copied()
                .cycle()
                .take(total_size - indices.len())
                .collect();
            indices.extend(padding);
        } else {
            indices.truncate(total_size);
        }

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}
