pub mod cli;
mod launcher;
mod worker;

pub use launcher::{
    launch, load_data, SYNTHETIC_FEATURES, SYNTHETIC_TEST_EXAMPLES, SYNTHETIC_TRAIN_EXAMPLES,
};
pub use worker::{run_worker, RunConfig, WorkerError, WorkerOutcome};
