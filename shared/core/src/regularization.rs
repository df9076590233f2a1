use serde::{Deserialize, Serialize};
use std::path::Path;

/// Out-of-distribution term added to the classification loss. Chosen once per run.
///
/// The logits of each training batch are split at a configured row: rows before
/// the split are treated as in-distribution, rows after it as auxiliary
/// (outlier) examples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Regularization {
    None,
    /// Squared hinge on the free energy `E = -logsumexp(logits)`: pushes
    /// in-distribution energies below `margin_in` and auxiliary energies above
    /// `margin_out`.
    Energy {
        margin_in: f64,
        margin_out: f64,
        weight: f64,
    },
    /// Cross-entropy of the auxiliary rows against the uniform distribution.
    OutlierExposure { weight: f64 },
}

impl Regularization {
    pub const ENERGY_MARGIN_IN: f64 = -25.0;
    pub const ENERGY_MARGIN_OUT: f64 = -7.0;
    pub const ENERGY_WEIGHT: f64 = 0.1;
    pub const OUTLIER_EXPOSURE_WEIGHT: f64 = 0.5;

    pub fn energy() -> Self {
        Self::Energy {
            margin_in: Self::ENERGY_MARGIN_IN,
            margin_out: Self::ENERGY_MARGIN_OUT,
            weight: Self::ENERGY_WEIGHT,
        }
    }

    pub fn outlier_exposure() -> Self {
        Self::OutlierExposure {
            weight: Self::OUTLIER_EXPOSURE_WEIGHT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Energy { .. } => "energy",
            Self::OutlierExposure { .. } => "OE",
        }
    }

    /// Appended to the checkpoint file stem so weights trained under different
    /// objectives never share a file.
    pub fn checkpoint_suffix(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Energy { .. } => Some("_energy"),
            Self::OutlierExposure { .. } => Some("_OE"),
        }
    }
}

/// `resnet.safetensors` becomes `resnet_energy.safetensors` under energy
/// regularization; the name is unchanged without regularization. Any directory
/// part of `base` is kept.
pub fn checkpoint_filename(base: &str, regularization: &Regularization) -> String {
    let Some(suffix) = regularization.checkpoint_suffix() else {
        return base.to_owned();
    };
    let path = Path::new(base);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(extension) => format!("{stem}{suffix}.{}", extension.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name).to_string_lossy().into_owned()
}
