use ember_core::Regularization;
use tch::{Kind, Tensor};

/// `E(x) = -logsumexp(logits)` over the class dimension, one value per row.
pub fn free_energy(logits: &Tensor) -> Tensor {
    -logits.logsumexp([1i64].as_slice(), false)
}

/// Splits a batch of logits into the in-distribution rows `[0, split)` and the
/// auxiliary rows `[split, n)`. Without an explicit split the batch is halved.
/// The split is clamped to the batch, so either side may be empty.
pub fn split_logits(logits: &Tensor, split: Option<i64>) -> (Tensor, Tensor) {
    let rows = logits.size()[0];
    let split = split.unwrap_or(rows / 2).clamp(0, rows);
    (
        logits.narrow(0, 0, split),
        logits.narrow(0, split, rows - split),
    )
}

fn is_empty(tensor: &Tensor) -> bool {
    tensor.size()[0] == 0
}

fn zero_like(logits: &Tensor) -> Tensor {
    Tensor::zeros(&[] as &[i64], (Kind::Float, logits.device()))
}

/// Mean of `relu(x)^2`, zero for an empty partition.
fn squared_hinge(x: &Tensor) -> Tensor {
    if is_empty(x) {
        return zero_like(x);
    }
    x.relu().square().mean(Kind::Float)
}

/// The scalar added to the classification loss under `regularization`.
pub fn regularization_term(
    regularization: &Regularization,
    logits: &Tensor,
    split: Option<i64>,
) -> Tensor {
    match *regularization {
        Regularization::None => zero_like(logits),
        Regularization::Energy {
            margin_in,
            margin_out,
            weight,
        } => {
            let (inliers, outliers) = split_logits(logits, split);
            let energy_in = free_energy(&inliers);
            let energy_out = free_energy(&outliers);
            (squared_hinge(&(energy_in - margin_in)) + squared_hinge(&(-energy_out + margin_out)))
                * weight
        }
        Regularization::OutlierExposure { weight } => {
            let (_, outliers) = split_logits(logits, split);
            if is_empty(&outliers) {
                return zero_like(logits);
            }
            let mean_logit = outliers.mean_dim([1i64].as_slice(), false, Kind::Float);
            let log_normalizer = outliers.logsumexp([1i64].as_slice(), false);
            -(mean_logit - log_normalizer).mean(Kind::Float) * weight
        }
    }
}

/// Cross-entropy over the whole batch plus the regularization term.
pub fn training_loss(
    logits: &Tensor,
    labels: &Tensor,
    regularization: &Regularization,
    split: Option<i64>,
) -> Tensor {
    logits.cross_entropy_for_logits(labels) + regularization_term(regularization, logits, split)
}
