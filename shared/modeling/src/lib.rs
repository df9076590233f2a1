mod checkpoint;
mod classifier;
mod collective;
mod data_parallel;
mod evaluate;
mod loss;
mod optimizer;
mod process_group;
mod reproducibility;
mod trainer;

pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointError, CheckpointManager, Mismatch};
pub use classifier::{Architecture, Classifier, LinearClassifier, ResNetClassifier, ResNetDepth};
pub use collective::{Collective, CollectiveError, CudaSynchronize, LocalCollective, SingleWorker};
#[cfg(feature = "parallelism")]
pub use collective::NcclCollective;
pub use data_parallel::DataParallel;
pub use evaluate::{evaluate, EvalError, EvalResult};
pub use loss::{free_energy, regularization_term, split_logits, training_loss};
pub use optimizer::SgdConfig;
pub use process_group::{init_process_group, Backend, GroupAbort, ProcessGroup, SetupError, Worker, WorkerHandle};
pub use reproducibility::{seeded, set_random_seeds, set_suggested_env_vars};
pub use trainer::{EpochPhase, RunSummary, TrainError, Trainer, TrainingConfig};
