use std::sync::{Mutex, PoisonError};
use tracing::debug;

// torch keeps a single process-wide generator per device type, so seeding and the
// construction that consumes it must not interleave between worker threads.
static SEEDED_SECTION: Mutex<()> = Mutex::new(());

/// Seeds torch's CPU and CUDA generators and turns off cuDNN autotuning, whose
/// algorithm choice is not reproducible between runs.
///
/// Shuffling does not use a global generator: the sampler derives its own
/// stream from `(seed, epoch)`.
///
/// tch has no setter for cuDNN's deterministic-algorithm flag, so convolutions
/// on CUDA may still pick nondeterministic kernels. CPU runs are unaffected.
pub fn set_random_seeds(seed: i64) {
    tch::manual_seed(seed);
    if tch::Cuda::is_available() {
        tch::Cuda::manual_seed_all(seed as u64);
    }
    tch::Cuda::cudnn_set_benchmark(false);
    debug!(seed, "Seeded torch generators");
}

/// Runs `f` right after seeding, holding the seeding section for its duration.
/// Two workers constructing a model with the same seed get bit-identical
/// parameters even when they do so concurrently.
pub fn seeded<T>(seed: i64, f: impl FnOnce() -> T) -> T {
    let _section = SEEDED_SECTION
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    set_random_seeds(seed);
    f()
}

pub fn set_suggested_env_vars() {
    for (key, value) in [
        ("TORCH_NCCL_AVOID_RECORD_STREAMS", "1"),
        ("NCCL_ASYNC_ERROR_HANDLING", "1"),
    ] {
        if std::env::var_os(key).is_none() {
            std::env::set_var(key, value);
        }
    }
}
