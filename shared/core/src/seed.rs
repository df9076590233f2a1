use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Deterministic RNG for a `(seed, stream)` pair. Every worker that asks for the
/// same pair gets the same sequence, which is what keeps shuffles in agreement
/// across ranks without any communication.
pub fn seeded_rng(seed: u64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}
