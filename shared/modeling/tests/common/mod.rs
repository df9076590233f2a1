#![allow(dead_code)]

use ember_core::{DistributedSampler, WorkerBarrier};
use ember_data_provider::{DummyDataset, SequentialLoader, ShardedLoader, TensorDataset};
use ember_modeling::{seeded, Classifier, LinearClassifier, LocalCollective};
use std::{collections::BTreeMap, sync::Arc, thread};
use tch::{Device, Tensor};

pub const FEATURES: i64 = 4;
pub const CLASSES: i64 = 3;

pub fn linear(seed: i64) -> LinearClassifier {
    seeded(seed, || LinearClassifier::new(FEATURES, CLASSES, Device::Cpu))
}

pub fn dummy(examples: usize, seed: u64) -> TensorDataset {
    DummyDataset::new(examples, FEATURES as usize, CLASSES as usize)
        .with_seed(seed)
        .build()
        .unwrap()
}

pub fn sharded(dataset: &TensorDataset, world_size: usize, rank: usize, batch: usize) -> ShardedLoader {
    let sampler = DistributedSampler::new(dataset.len(), world_size, rank)
        .unwrap()
        .with_seed(1);
    ShardedLoader::new(dataset.shallow_clone(), sampler, batch).unwrap()
}

pub fn sequential(dataset: &TensorDataset, batch: usize) -> SequentialLoader {
    SequentialLoader::new(dataset.shallow_clone(), batch).unwrap()
}

/// Parameter values by name, copied out of the model.
pub fn snapshot(model: &dyn Classifier) -> BTreeMap<String, Vec<f32>> {
    model
        .var_store()
        .variables()
        .into_iter()
        .map(|(name, tensor)| {
            let values = Vec::<f32>::try_from(&tensor.detach().flatten(0, -1)).unwrap();
            (name, values)
        })
        .collect()
}

pub fn set_parameter(model: &dyn Classifier, name: &str, value: &Tensor) {
    let mut variable = model.var_store().variables()[name].shallow_clone();
    tch::no_grad(|| variable.copy_(value));
}

/// Runs `f` once per rank on its own thread, all ranks sharing one in-process
/// collective.
pub fn run_local_group<T: Send + 'static>(
    world_size: usize,
    f: impl Fn(usize, LocalCollective) -> T + Send + Sync + 'static,
) -> Vec<T> {
    let f = Arc::new(f);
    let handles: Vec<_> = LocalCollective::group(WorkerBarrier::new(world_size))
        .into_iter()
        .enumerate()
        .map(|(rank, collective)| {
            let f = f.clone();
            thread::Builder::new()
                .name(format!("worker-{rank}"))
                .spawn(move || f(rank, collective))
                .unwrap()
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}
