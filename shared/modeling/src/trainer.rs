use crate::{
    evaluate, training_loss, CheckpointError, CheckpointManager, Classifier, CollectiveError,
    DataParallel, EvalError, EvalResult, SgdConfig,
};
use ember_core::Regularization;
use ember_data_provider::{BatchSource, DatasetError};
use ember_telemetry::MetricSink;
use serde::{Deserialize, Serialize};
use tch::{nn, TchError, Tensor};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("loss diverged to {loss} at epoch {epoch}, batch {batch}")]
    NumericDivergence { epoch: u64, batch: usize, loss: f64 },

    #[error(transparent)]
    Collective(#[from] CollectiveError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("failed to load training batch: {0}")]
    Dataset(#[from] DatasetError),

    #[error("torch error during training: {0}")]
    Tch(#[from] TchError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub num_epochs: u64,
    /// Rank 0 evaluates and checkpoints at every epoch divisible by this.
    pub eval_every: u64,
    pub regularization: Regularization,
    /// Row at which each training batch is split into in-distribution and
    /// auxiliary examples. `None` splits every batch in half.
    pub ood_split: Option<i64>,
    pub optimizer: SgdConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 250,
            eval_every: 10,
            regularization: Regularization::None,
            ood_split: None,
            optimizer: SgdConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn is_eval_epoch(&self, epoch: u64) -> bool {
        self.eval_every != 0 && epoch % self.eval_every == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochPhase {
    Init,
    PeriodicEval { epoch: u64 },
    Train { epoch: u64 },
    Closed,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Normalized training loss of every epoch, in order.
    pub train_losses: Vec<f64>,
    /// Rank 0 only: `(epoch, result)` of every periodic evaluation.
    pub evaluations: Vec<(u64, EvalResult)>,
    pub optimizer_steps: u64,
    pub checkpoints_written: usize,
}

impl RunSummary {
    pub fn last_evaluation(&self) -> Option<&EvalResult> {
        self.evaluations.last().map(|(_, result)| result)
    }
}

/// Drives one worker through the whole run. Every worker of the job runs its
/// own `Trainer` in lockstep; they meet in the per-batch divergence check,
/// inside gradient averaging and at the barrier that follows each periodic
/// evaluation.
pub struct Trainer<M: Classifier = Box<dyn Classifier>> {
    model: DataParallel<M>,
    optimizer: nn::Optimizer,
    config: TrainingConfig,
    checkpoints: Option<CheckpointManager>,
    phase: EpochPhase,
}

impl<M: Classifier> std::fmt::Debug for Trainer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("model", &self.model)
            .field("config", &self.config)
            .field("checkpoints", &self.checkpoints)
            .field("phase", &self.phase)
            .finish()
    }
}

impl<M: Classifier> Trainer<M> {
    /// `checkpoints` is only written by rank 0.
    pub fn new(
        model: DataParallel<M>,
        config: TrainingConfig,
        checkpoints: Option<CheckpointManager>,
    ) -> Result<Self, TrainError> {
        let optimizer = config.optimizer.build(model.var_store())?;
        Ok(Self {
            model,
            optimizer,
            config,
            checkpoints,
            phase: EpochPhase::Init,
        })
    }

    pub fn phase(&self) -> EpochPhase {
        self.phase
    }

    pub fn model(&self) -> &DataParallel<M> {
        &self.model
    }

    pub fn into_model(self) -> DataParallel<M> {
        self.model
    }

    /// Runs every epoch, then closes `sink`.
    ///
    /// An error aborts the run immediately; the sink is left open so the caller
    /// can still flush what was written.
    pub fn run(
        &mut self,
        train: &mut dyn BatchSource,
        test: &dyn BatchSource,
        sink: &mut dyn MetricSink,
    ) -> Result<RunSummary, TrainError> {
        let rank = self.model.rank();
        let mut summary = RunSummary::default();
        info!(
            rank,
            world_size = self.model.world_size(),
            epochs = self.config.num_epochs,
            regularization = self.config.regularization.name(),
            "Starting training"
        );

        for epoch in 0..self.config.num_epochs {
            if self.config.is_eval_epoch(epoch) {
                self.phase = EpochPhase::PeriodicEval { epoch };
                if rank == 0 {
                    self.periodic_eval(epoch, test, sink, &mut summary)?;
                }
                self.model.collective().barrier()?;
            }

            self.phase = EpochPhase::Train { epoch };
            let loss = self.train_epoch(epoch, train, &mut summary)?;
            sink.add_scalar("Loss/train", loss, epoch as usize);
            summary.train_losses.push(loss);
            info!(rank, epoch, loss, "Finished training epoch");
        }

        sink.close();
        self.phase = EpochPhase::Closed;
        info!(rank, steps = summary.optimizer_steps, "Training finished");
        Ok(summary)
    }

    fn periodic_eval(
        &mut self,
        epoch: u64,
        test: &dyn BatchSource,
        sink: &mut dyn MetricSink,
        summary: &mut RunSummary,
    ) -> Result<(), TrainError> {
        let result = evaluate(&mut self.model, test, Some(sink), epoch as usize)?;
        info!(
            epoch,
            accuracy = result.accuracy,
            loss = result.avg_loss,
            "Epoch {epoch}: test accuracy {:.4}",
            result.accuracy
        );
        summary.evaluations.push((epoch, result));

        if let Some(checkpoints) = &self.checkpoints {
            checkpoints.save(self.model.var_store())?;
            summary.checkpoints_written += 1;
        }
        Ok(())
    }

    /// Agrees on divergence across the group: a non-finite loss on any rank
    /// stops every rank at the same batch, before anyone enters the gradient
    /// all-reduce.
    fn any_rank_diverged(&self, loss: f64) -> Result<bool, TrainError> {
        if self.model.world_size() == 1 {
            return Ok(!loss.is_finite());
        }
        let flag = if loss.is_finite() { 0f32 } else { 1f32 };
        let mut flag = Tensor::from(flag).to_device(self.model.device());
        self.model.collective().all_reduce_mean(&mut flag)?;
        Ok(f64::try_from(&flag)? > 0.0)
    }

    /// Returns the summed batch losses divided by the number of examples in
    /// this worker's shard.
    fn train_epoch(
        &mut self,
        epoch: u64,
        train: &mut dyn BatchSource,
        summary: &mut RunSummary,
    ) -> Result<f64, TrainError> {
        let device = self.model.device();
        let regularization = self.config.regularization;
        let split = self.config.ood_split;

        train.set_epoch(epoch);
        self.model.set_train(true);

        let mut total_loss = 0.0;
        for (index, batch) in train.batches().enumerate() {
            let batch = batch?.to_device(device);
            self.optimizer.zero_grad();

            let logits = self.model.forward(&batch.inputs);
            let loss = training_loss(&logits, &batch.labels, &regularization, split);
            let value = f64::try_from(&loss)?;
            if self.any_rank_diverged(value)? {
                warn!(epoch, batch = index, loss = value, "Loss is not finite");
                return Err(TrainError::NumericDivergence {
                    epoch,
                    batch: index,
                    loss: value,
                });
            }

            self.model.backward(&loss)?;
            self.optimizer.step();
            summary.optimizer_steps += 1;
            total_loss += value;
            debug!(epoch, batch = index, loss = value, "Trained batch");
        }

        let samples = train.num_samples();
        Ok(if samples == 0 {
            0.0
        } else {
            total_loss / samples as f64
        })
    }
}
