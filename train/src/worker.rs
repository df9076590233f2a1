use crate::cli::Args;
use ember_core::{DistributedSampler, SamplerError};
use ember_data_provider::{BatchSource, DatasetError, SequentialLoader, ShardedLoader, TensorDataset};
use ember_modeling::{
    evaluate, seeded, Architecture, CheckpointError, CheckpointManager, Classifier,
    CollectiveError, DataParallel, EvalError, EvalResult, RunSummary, SetupError, TrainError,
    Trainer, TrainingConfig, WorkerHandle,
};
use ember_telemetry::{CompositeSink, TracingSink};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, info_span};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to join the process group: {0}")]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("evaluation failed: {0}")]
    Eval(#[from] EvalError),

    #[error("training failed: {0}")]
    Train(#[from] TrainError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("failed to shard the training set: {0}")]
    Sampler(#[from] SamplerError),

    #[error("failed to open metric writer: {0}")]
    Telemetry(#[from] std::io::Error),
}

impl WorkerError {
    /// True when this worker only stopped because a peer gave up first.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            WorkerError::Train(TrainError::Collective(CollectiveError::Aborted(_)))
                | WorkerError::Setup(SetupError::Join(CollectiveError::Aborted(_)))
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// `--eval` on rank 0.
    Evaluated(EvalResult),
    /// `--eval` on every other rank.
    Idle,
    Trained(RunSummary),
}

/// Everything a worker needs besides its seat in the group and its data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub architecture: Architecture,
    pub num_classes: i64,
    pub training: TrainingConfig,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    pub seed: i64,
    pub checkpoint: PathBuf,
    pub resume: bool,
    pub eval_only: bool,
    pub log_dir: PathBuf,
}

impl RunConfig {
    /// `example_shape` sizes the linear architecture's input.
    pub fn new(args: &Args, example_shape: &[i64]) -> Self {
        let architecture = match args.architecture.resnet_depth() {
            Some(depth) => Architecture::ResNet { depth },
            None => Architecture::Linear {
                in_features: example_shape.iter().product(),
            },
        };
        Self {
            architecture,
            num_classes: args.num_classes,
            training: args.training_config(),
            batch_size: args.batch_size,
            eval_batch_size: args.eval_batch_size,
            seed: args.random_seed,
            checkpoint: args.checkpoint_path(),
            resume: args.resume,
            eval_only: args.eval,
            log_dir: args.log_dir.clone(),
        }
    }
}

#[cfg(feature = "tensorboard")]
fn push_tensorboard(
    sink: &mut CompositeSink,
    config: &RunConfig,
    rank: usize,
) -> Result<(), WorkerError> {
    sink.push(Box::new(ember_telemetry::TensorBoardSink::new(
        &config.log_dir,
        rank,
    )?));
    Ok(())
}

#[cfg(not(feature = "tensorboard"))]
fn push_tensorboard(_: &mut CompositeSink, _: &RunConfig, _: usize) -> Result<(), WorkerError> {
    Ok(())
}

fn metric_sink(config: &RunConfig, rank: usize) -> Result<CompositeSink, WorkerError> {
    let mut sink = CompositeSink::default();
    push_tensorboard(&mut sink, config, rank)?;
    sink.push(Box::new(TracingSink::new(rank)));
    Ok(sink)
}

/// Runs one worker from joining the group to the end of training.
///
/// Every rank builds its model from the same seed, so replicas start out
/// identical without a parameter broadcast.
pub fn run_worker(
    handle: WorkerHandle,
    config: &RunConfig,
    train: TensorDataset,
    test: TensorDataset,
) -> Result<WorkerOutcome, WorkerError> {
    let span = info_span!("worker", rank = handle.rank());
    let _entered = span.enter();

    let worker = handle.connect()?;
    info!(device = ?worker.device, world_size = worker.world_size, "Joined process group");

    let mut model: Box<dyn Classifier> = seeded(config.seed, || {
        config.architecture.build(config.num_classes, worker.device)
    });
    let checkpoints = CheckpointManager::new(&config.checkpoint);
    if config.resume {
        checkpoints.load(model.var_store())?;
        info!(path = %checkpoints.path().display(), "Resumed from checkpoint");
    }

    let test = SequentialLoader::new(test, config.eval_batch_size)?;

    if config.eval_only {
        if !worker.is_leader() {
            return Ok(WorkerOutcome::Idle);
        }
        let result = evaluate(&mut model, &test, None, 0)?;
        println!("Accuracy on test data: {}", result.accuracy);
        return Ok(WorkerOutcome::Evaluated(result));
    }

    let sampler = DistributedSampler::new(train.len(), worker.world_size, worker.rank)?
        .with_seed(config.seed as u64);
    let mut train = ShardedLoader::new(train, sampler, config.batch_size)?;
    info!(
        shard = train.num_samples(),
        batches = train.num_batches(),
        "Sharded training set"
    );

    let mut sink = metric_sink(config, worker.rank)?;
    let leader = worker.is_leader();
    let model = DataParallel::new(model, worker.collective);
    let mut trainer = Trainer::new(
        model,
        config.training.clone(),
        leader.then_some(checkpoints),
    )?;
    let summary = trainer.run(&mut train, &test, &mut sink)?;
    Ok(WorkerOutcome::Trained(summary))
}
