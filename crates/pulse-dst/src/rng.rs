//! Deterministic RNG for simulation
//!
//! TigerStyle: ChaCha20-based RNG for reproducibility.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Deterministic random number generator
///
/// Given the same seed, produces the same sequence of values, including
/// transaction IDs.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    /// The original seed (for logging/reproduction)
    seed: u64,
    rng: Arc<Mutex<ChaCha20Rng>>,
    /// Counter for forking
    fork_counter: Arc<AtomicU64>,
}

impl DeterministicRng {
    /// Create a new deterministic RNG with the given seed
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            fork_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get the seed used to create this RNG
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn inner(&self) -> MutexGuard<'_, ChaCha20Rng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn next_u64(&self) -> u64 {
        self.inner().gen()
    }

    /// Generate a random f64 in [0, 1)
    pub fn next_f64(&self) -> f64 {
        self.inner().gen()
    }

    /// Generate a random bool with given probability of true
    pub fn next_bool(&self, probability: f64) -> bool {
        debug_assert!(
            (0.0..=1.0).contains(&probability),
            "probability must be in [0, 1]"
        );
        self.next_f64() < probability
    }

    /// Generate a random value in the given range [min, max)
    pub fn next_range(&self, min: u64, max: u64) -> u64 {
        debug_assert!(min < max, "min must be less than max");
        let range = max - min;
        min + (self.next_u64() % range)
    }

    /// Generate a random index for a slice of given length
    pub fn next_index(&self, len: usize) -> usize {
        debug_assert!(len > 0, "length must be positive");
        (self.next_u64() as usize) % len
    }

    /// Generate a random (version 4 layout) UUID
    pub fn next_uuid(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.inner().fill(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    /// Fork the RNG to create an independent stream
    ///
    /// The forked RNG is seeded deterministically from the parent.
    pub fn fork(&self) -> Self {
        let fork_id = self.fork_counter.fetch_add(1, Ordering::SeqCst);
        let fork_seed = self
            .seed
            .wrapping_add(fork_id)
            .wrapping_mul(0x9E3779B97F4A7C15);
        Self::new(fork_seed)
    }
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}
