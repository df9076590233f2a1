use clap::{Parser, ValueEnum};
use ember_core::{checkpoint_filename, Regularization};
use ember_data_provider::DatasetFormat;
use ember_modeling::{Backend, ResNetDepth, SgdConfig, TrainingConfig};
use ember_telemetry::LogOutput;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
pub enum ScoreArg {
    #[value(name = "none")]
    None,
    #[value(name = "energy")]
    Energy,
    #[value(name = "OE")]
    Oe,
}

impl From<ScoreArg> for Regularization {
    fn from(score: ScoreArg) -> Self {
        match score {
            ScoreArg::None => Regularization::None,
            ScoreArg::Energy => Regularization::energy(),
            ScoreArg::Oe => Regularization::outlier_exposure(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchitectureArg {
    Resnet50,
    Resnet18,
    /// Flatten plus one linear layer; sized from the dataset.
    Linear,
}

impl ArchitectureArg {
    pub fn resnet_depth(self) -> Option<ResNetDepth> {
        match self {
            Self::Resnet50 => Some(ResNetDepth::ResNet50),
            Self::Resnet18 => Some(ResNetDepth::ResNet18),
            Self::Linear => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetArg {
    /// `<data-path>/train/<class>/*` and `<data-path>/val/<class>/*`.
    ImageFolder,
    Cifar10,
    /// Generated in memory; for smoke runs without a dataset on disk.
    Synthetic,
}

impl DatasetArg {
    pub fn format(self) -> Option<DatasetFormat> {
        match self {
            Self::ImageFolder => Some(DatasetFormat::ImageFolder),
            Self::Cifar10 => Some(DatasetFormat::Cifar10),
            Self::Synthetic => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendArg {
    Nccl,
    Local,
}

impl From<BackendArg> for Backend {
    fn from(backend: BackendArg) -> Self {
        match backend {
            BackendArg::Nccl => Backend::Nccl,
            BackendArg::Local => Backend::Local,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ember-train",
    version,
    about = "Data-parallel image classifier training with energy / outlier-exposure regularization"
)]
pub struct Args {
    #[clap(long, default_value_t = 250, env)]
    pub num_epochs: u64,

    /// Per-worker training batch size.
    #[clap(long, default_value_t = 64, env)]
    pub batch_size: usize,

    #[clap(long, default_value_t = 128, env)]
    pub eval_batch_size: usize,

    #[clap(long, default_value_t = 0.1, env)]
    pub learning_rate: f64,

    #[clap(long, default_value_t = 0.9, env)]
    pub momentum: f64,

    #[clap(long, default_value_t = 1e-5, env)]
    pub weight_decay: f64,

    #[clap(long, default_value_t = 0, env)]
    pub random_seed: i64,

    #[clap(long, default_value = "saved_models", env)]
    pub model_dir: PathBuf,

    /// Suffixed with `_energy` or `_OE` when that regularization is active.
    #[clap(long, default_value = "resnet_distributed.safetensors", env)]
    pub model_filename: String,

    /// Load the checkpoint before training or evaluating. Fails if it does not exist.
    #[clap(long, env)]
    pub resume: bool,

    #[clap(long, value_enum, default_value_t = ScoreArg::None, env)]
    pub score: ScoreArg,

    /// Evaluate on the test set, print the accuracy and exit without training.
    #[clap(long, env)]
    pub eval: bool,

    #[clap(long, default_value = "data", env)]
    pub data_path: PathBuf,

    #[clap(long, value_enum, default_value_t = DatasetArg::ImageFolder, env)]
    pub dataset: DatasetArg,

    #[clap(long, default_value_t = 101, env)]
    pub num_classes: i64,

    #[clap(long, value_enum, default_value_t = ArchitectureArg::Resnet50, env)]
    pub architecture: ArchitectureArg,

    /// Number of workers, one per device.
    #[clap(long, default_value_t = 1, env = "WORLD_SIZE")]
    pub world_size: usize,

    #[clap(long, value_enum, default_value_t = BackendArg::Nccl, env)]
    pub backend: BackendArg,

    /// Run every worker on the CPU.
    #[clap(long, env)]
    pub cpu: bool,

    /// Row at which training batches split into in-distribution and auxiliary
    /// examples. Defaults to half of each batch.
    #[clap(long, env)]
    pub ood_split: Option<i64>,

    /// Evaluate and checkpoint every this many epochs.
    #[clap(long, default_value_t = 10, env)]
    pub eval_every: u64,

    /// TensorBoard event files go to `<log-dir>/rank-<rank>`.
    #[clap(long, default_value = "runs", env)]
    pub log_dir: PathBuf,

    #[clap(long, value_enum, default_value_t = LogOutput::Console, env)]
    pub logs: LogOutput,

    #[clap(long, env)]
    pub write_log: Option<PathBuf>,
}

impl Args {
    pub fn regularization(&self) -> Regularization {
        self.score.into()
    }

    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            num_epochs: self.num_epochs,
            eval_every: self.eval_every,
            regularization: self.regularization(),
            ood_split: self.ood_split,
            optimizer: SgdConfig {
                learning_rate: self.learning_rate,
                momentum: self.momentum,
                weight_decay: self.weight_decay,
            },
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.model_dir
            .join(checkpoint_filename(&self.model_filename, &self.regularization()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("ember-train").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let args = parse(&["--world-size", "1"]);
        assert_eq!(args.num_epochs, 250);
        assert_eq!(args.batch_size, 64);
        assert_eq!(args.eval_batch_size, 128);
        assert_eq!(args.score, ScoreArg::None);
        assert!(!args.resume && !args.eval);
        assert_eq!(
            args.checkpoint_path(),
            PathBuf::from("saved_models/resnet_distributed.safetensors")
        );
        assert_eq!(args.training_config().optimizer, SgdConfig::default());
    }

    #[test]
    fn score_selects_regularization_and_checkpoint_name() {
        let args = parse(&["--score", "OE", "--model-dir", "out"]);
        assert_eq!(args.regularization(), Regularization::outlier_exposure());
        assert_eq!(
            args.checkpoint_path(),
            PathBuf::from("out/resnet_distributed_OE.safetensors")
        );

        let args = parse(&["--score", "energy"]);
        assert_eq!(args.regularization(), Regularization::energy());
    }

    #[test]
    fn rejects_unknown_score() {
        assert!(Args::try_parse_from(["ember-train", "--score", "oe"]).is_err());
    }
}
