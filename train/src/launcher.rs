use crate::{
    cli::{ArchitectureArg, Args},
    worker::{run_worker, RunConfig, WorkerError, WorkerOutcome},
};
use anyhow::{anyhow, bail, Result};
use ember_data_provider::{load_dataset, DatasetError, DummyDataset, ImageDataset};
use ember_modeling::init_process_group;
use std::{sync::Arc, thread};
use tracing::{error, info, warn};

pub const SYNTHETIC_TRAIN_EXAMPLES: usize = 512;
pub const SYNTHETIC_TEST_EXAMPLES: usize = 128;
pub const SYNTHETIC_FEATURES: usize = 16;

fn synthetic(args: &Args) -> Result<ImageDataset, DatasetError> {
    let classes = args.num_classes.max(1) as usize;
    let seed = args.random_seed as u64;
    let train = DummyDataset::new(SYNTHETIC_TRAIN_EXAMPLES, SYNTHETIC_FEATURES, classes)
        .with_seed(seed)
        .build()?;
    let test = DummyDataset::new(SYNTHETIC_TEST_EXAMPLES, SYNTHETIC_FEATURES, classes)
        .with_seed(seed.wrapping_add(1))
        .build()?;
    Ok(ImageDataset {
        train,
        test,
        num_classes: args.num_classes,
    })
}

pub fn load_data(args: &Args) -> Result<ImageDataset> {
    let data = match args.dataset.format() {
        Some(format) => load_dataset(&args.data_path, format)?,
        None => {
            if args.architecture != ArchitectureArg::Linear {
                bail!("the synthetic dataset holds feature vectors; use --architecture linear");
            }
            synthetic(args)?
        }
    };
    if data.num_classes != args.num_classes {
        warn!(
            found = data.num_classes,
            configured = args.num_classes,
            "Dataset class count differs from --num-classes"
        );
    }
    Ok(data)
}

/// Loads the data once, then runs one worker thread per rank and waits for
/// all of them. A failing worker aborts the group so its peers return instead
/// of waiting on it forever.
pub fn launch(args: &Args) -> Result<Vec<WorkerOutcome>> {
    let data = load_data(args)?;
    let config = Arc::new(RunConfig::new(args, &data.train.example_shape()));
    info!(
        config = %serde_json::to_string(config.as_ref())?,
        "Run configuration"
    );

    let group = init_process_group(args.backend.into(), args.world_size, args.cpu)?;
    let abort = group.abort_handle();

    let mut threads = Vec::with_capacity(args.world_size);
    for handle in group.into_workers() {
        let rank = handle.rank();
        let config = config.clone();
        let abort = abort.clone();
        let train = data.train.shallow_clone();
        let test = data.test.shallow_clone();
        let thread = thread::Builder::new()
            .name(format!("worker-{rank}"))
            .spawn(move || {
                let result = run_worker(handle, &config, train, test);
                if let Err(err) = &result {
                    if !err.is_abort() {
                        error!(rank, "Worker failed: {err}");
                    }
                    abort.abort();
                }
                result
            });
        match thread {
            Ok(thread) => threads.push((rank, thread)),
            Err(err) => {
                abort.abort();
                return Err(anyhow!("failed to spawn worker {rank}: {err}"));
            }
        }
    }

    let mut outcomes = Vec::with_capacity(threads.len());
    let mut failures: Vec<WorkerError> = Vec::new();
    for (rank, thread) in threads {
        match thread.join() {
            Ok(Ok(outcome)) => outcomes.push(outcome),
            Ok(Err(err)) => failures.push(err),
            Err(_) => {
                abort.abort();
                bail!("worker {rank} panicked");
            }
        }
    }

    // report the worker that failed first, not the peers it released
    if let Some(pos) = failures.iter().position(|err| !err.is_abort()) {
        return Err(failures.swap_remove(pos).into());
    }
    if let Some(err) = failures.pop() {
        return Err(err.into());
    }
    Ok(outcomes)
}
