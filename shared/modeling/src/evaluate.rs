use crate::Classifier;
use ember_data_provider::{BatchSource, DatasetError};
use ember_telemetry::MetricSink;
use serde::Serialize;
use tch::{Kind, TchError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("evaluation set produced no batches")]
    Empty,

    #[error("failed to load evaluation batch: {0}")]
    Dataset(#[from] DatasetError),

    #[error("torch error during evaluation: {0}")]
    Tch(#[from] TchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalResult {
    /// Summed per-batch mean loss divided by the number of batches.
    pub avg_loss: f64,
    /// `correct / total`, in `[0, 1]`.
    pub accuracy: f64,
    pub correct: i64,
    pub total: i64,
    pub batches: usize,
}

/// Scores `model` on every batch of `batches` without tracking gradients and
/// with normalization layers in inference mode. The model's previous mode is
/// restored afterwards.
///
/// When a sink is given, `Loss/test` and `Accuracy/test` are written at `step`.
pub fn evaluate(
    model: &mut dyn Classifier,
    batches: &dyn BatchSource,
    sink: Option<&mut dyn MetricSink>,
    step: usize,
) -> Result<EvalResult, EvalError> {
    let was_training = model.is_training();
    model.set_train(false);
    let result = score(&*model, batches);
    model.set_train(was_training);
    let result = result?;

    debug!(
        step,
        avg_loss = result.avg_loss,
        accuracy = result.accuracy,
        batches = result.batches,
        "Evaluation finished"
    );
    if let Some(sink) = sink {
        sink.add_scalar("Loss/test", result.avg_loss, step);
        sink.add_scalar("Accuracy/test", result.accuracy, step);
    }
    Ok(result)
}

fn score(model: &dyn Classifier, batches: &dyn BatchSource) -> Result<EvalResult, EvalError> {
    let _guard = tch::no_grad_guard();
    let device = model.device();

    let mut summed_loss = 0.0;
    let mut correct = 0i64;
    let mut total = 0i64;
    let mut count = 0usize;
    for batch in batches.batches() {
        let batch = batch?.to_device(device);
        let logits = model.forward(&batch.inputs);
        let loss = logits.cross_entropy_for_logits(&batch.labels);
        summed_loss += f64::try_from(&loss)?;

        let predicted = logits.f_argmax(1, false)?;
        let hits = predicted.f_eq_tensor(&batch.labels)?.f_sum(Kind::Int64)?;
        correct += i64::try_from(&hits)?;
        total += batch.len() as i64;
        count += 1;
    }

    if count == 0 || total == 0 {
        return Err(EvalError::Empty);
    }

    Ok(EvalResult {
        avg_loss: summed_loss / count as f64,
        accuracy: correct as f64 / total as f64,
        correct,
        total,
        batches: count,
    })
}
