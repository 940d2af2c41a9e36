//! Seed Allocation
//!
//! Every lobby round and every contest round draws a fresh integer seed. The
//! server never simulates a board itself; it only hands the same seed to every
//! participant so their local piece generators agree from the first piece.
//!
//! Uses Xorshift128+ for the draw and SHA-256 to fold process entropy into the
//! initial state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Upper bound (exclusive) of handed-out seeds. Clients parse them as plain
/// JSON numbers, so they stay well inside the exact-integer range.
pub const SEED_RANGE: u32 = 1_000_000;

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// # Example
///
/// ```
/// use blockfall::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = DeterministicRng::new(12345);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random integer in range [0, max).
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        // Simple modulo - slight bias for very large max, but acceptable
        (self.next_u64() % max as u64) as u32
    }
}

/// SplitMix64 step, used only for state initialization.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e3779b97f4a7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

static ENTROPY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Derive a 64-bit seed from wall-clock time, the process id and a counter.
///
/// Two allocators created in the same nanosecond still diverge.
pub fn entropy_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let counter = ENTROPY_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(b"blockfall-seed:");
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(counter.to_le_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(bytes)
}

/// Hands out a fresh seed per lobby round / contest round.
#[derive(Clone, Debug)]
pub struct SeedAllocator {
    rng: DeterministicRng,
    issued: u64,
}

impl SeedAllocator {
    /// Allocator seeded from process entropy.
    pub fn from_entropy() -> Self {
        Self::with_seed(entropy_seed())
    }

    /// Allocator with a fixed seed (reproducible tests).
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: DeterministicRng::new(seed),
            issued: 0,
        }
    }

    /// Draw the next seed in `[0, SEED_RANGE)`.
    ///
    /// Consecutive draws never repeat, so a new round can never reuse the
    /// piece order of the round it replaces.
    pub fn next_seed(&mut self, previous: Option<u32>) -> u32 {
        self.issued += 1;
        loop {
            let seed = self.rng.next_int(SEED_RANGE);
            if Some(seed) != previous {
                return seed;
            }
        }
    }

    /// Number of seeds handed out so far.
    pub fn issued(&self) -> u64 {
        self.issued
    }
}

impl Default for SeedAllocator {
    fn default() -> Self {
        Self::from_entropy()
    }
}
