mod regularization;
mod sampler;
mod seed;
mod worker_barrier;

pub use regularization::{checkpoint_filename, Regularization};
pub use sampler::{DistributedSampler, SamplerError};
pub use seed::seeded_rng;
pub use worker_barrier::{BarrierCancelled, WorkerBarrier};
