//! Deterministic per-step seed derivation and retry jitter.
//!
//! Every step receives a seed derived from the run's base seed and the
//! step's position in the schedule. Derivation is pure: no wall-clock
//! input, no process state, so a replayed run sees identical seeds.
//!
//! Retry jitter is drawn from a PRNG seeded by the step seed rather
//! than the system PRNG, keeping backoff schedules replay-stable.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use sha2::{Digest, Sha256};

/// Full 32-byte seed digest for a step: `sha256(LE64(base) || LE64(index))`.
///
/// Skills that want more than 64 bits of seed material consume this
/// directly.
#[must_use]
pub fn derive_step_digest(base_seed: u64, step_index: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(base_seed.to_le_bytes());
    hasher.update(step_index.to_le_bytes());
    hasher.finalize().into()
}

/// 64-bit step seed: the little-endian truncation of [`derive_step_digest`].
///
/// Distinct `(base_seed, step_index)` pairs produce distinct seeds with
/// overwhelming probability.
#[must_use]
pub fn derive_step_seed(base_seed: u64, step_index: u64) -> u64 {
    let digest = derive_step_digest(base_seed, step_index);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(first)
}

/// Exponential backoff delay for a retry attempt, with seeded jitter.
///
/// The base delay is `base_ms * 2^attempt`; jitter adds up to half the
/// base delay, drawn from a PRNG seeded by `step_seed ^ attempt` so the
/// schedule is identical on replay.
#[must_use]
pub fn backoff_with_jitter(base_ms: u64, attempt: u32, step_seed: u64) -> Duration {
    // Cap the shift so pathological retry counts cannot overflow.
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = if base_ms == 0 {
        0
    } else {
        let mut rng = StdRng::seed_from_u64(step_seed ^ u64::from(attempt));
        rng.random_range(0..=base_ms / 2)
    };
    Duration::from_millis(exp.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_pure() {
        assert_eq!(derive_step_seed(42, 0), derive_step_seed(42, 0));
        assert_eq!(derive_step_digest(7, 3), derive_step_digest(7, 3));
    }

    #[test]
    fn distinct_inputs_differ() {
        assert_ne!(derive_step_seed(42, 0), derive_step_seed(42, 1));
        assert_ne!(derive_step_seed(42, 0), derive_step_seed(43, 0));
    }

    #[test]
    fn jitter_is_deterministic() {
        let a = backoff_with_jitter(100, 2, 0xdead_beef);
        let b = backoff_with_jitter(100, 2, 0xdead_beef);
        assert_eq!(a, b);
        assert!(a >= Duration::from_millis(400));
        assert!(a <= Duration::from_millis(450));
    }

    #[test]
    fn zero_base_has_no_jitter() {
        assert_eq!(backoff_with_jitter(0, 5, 1), Duration::from_millis(0));
    }
}
