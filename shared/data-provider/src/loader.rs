use ember_core::DistributedSampler;

use crate::{Batch, DatasetError, TensorDataset};

pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch, DatasetError>> + 'a>;

/// A per-worker stream of batches, re-iterable once per epoch.
pub trait BatchSource {
    /// Examples this worker sees per epoch, padding included.
    fn num_samples(&self) -> usize;

    fn num_batches(&self) -> usize;

    /// Selects the ordering for the next pass. Sources without shuffling ignore it.
    fn set_epoch(&mut self, _epoch: u64) {}

    fn batches(&self) -> BatchIter<'_>;
}

fn chunk_batches(dataset: &TensorDataset, indices: Vec<usize>, batch_size: usize) -> BatchIter<'_> {
    let chunks: Vec<Vec<usize>> = indices
        .chunks(batch_size)
        .map(|chunk| chunk.to_vec())
        .collect();
    Box::new(chunks.into_iter().map(move |chunk| dataset.batch(&chunk)))
}

/// Training loader: the worker's shard of the dataset, as chosen by a
/// [`DistributedSampler`]. The last batch may be short.
#[derive(Debug)]
pub struct ShardedLoader {
    dataset: TensorDataset,
    sampler: DistributedSampler,
    batch_size: usize,
}

impl ShardedLoader {
    pub fn new(
        dataset: TensorDataset,
        sampler: DistributedSampler,
        batch_size: usize,
    ) -> Result<Self, DatasetError> {
        if batch_size == 0 {
            return Err(DatasetError::ZeroBatchSize);
        }
        Ok(Self {
            dataset,
            sampler,
            batch_size,
        })
    }

    pub fn sampler(&self) -> &DistributedSampler {
        &self.sampler
    }
}

impl BatchSource for ShardedLoader {
    fn num_samples(&self) -> usize {
        self.sampler.len()
    }

    fn num_batches(&self) -> usize {
        self.sampler.len().div_ceil(self.batch_size)
    }

    fn set_epoch(&mut self, epoch: u64) {
        self.sampler.set_epoch(epoch);
    }

    fn batches(&self) -> BatchIter<'_> {
        chunk_batches(&self.dataset, self.sampler.indices(), self.batch_size)
    }
}

/// Evaluation loader: the whole dataset in order, unsharded.
#[derive(Debug)]
pub struct SequentialLoader {
    dataset: TensorDataset,
    batch_size: usize,
}

impl SequentialLoader {
    pub fn new(dataset: TensorDataset, batch_size: usize) -> Result<Self, DatasetError> {
        if batch_size == 0 {
            return Err(DatasetError::ZeroBatchSize);
        }
        Ok(Self {
            dataset,
            batch_size,
        })
    }
}

impl BatchSource for SequentialLoader {
    fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn batches(&self) -> BatchIter<'_> {
        chunk_batches(
            &self.dataset,
            (0..self.dataset.len()).collect(),
            self.batch_size,
        )
    }
}

/// Pre-built batches replayed unchanged every epoch.
#[derive(Debug, Default)]
pub struct FixedBatches {
    batches: Vec<Batch>,
}

impl FixedBatches {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }
}

impl BatchSource for FixedBatches {
    fn num_samples(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn batches(&self) -> BatchIter<'_> {
        Box::new(self.batches.iter().map(|batch| Ok(batch.shallow_clone())))
    }
}
