//! Simulation Random Number Generator
//!
//! The simulation draws all randomness from this generator, and its two
//! 32-bit state words are exactly the "seed pair" exchanged by the desync
//! detector. If two machines ran the same frames with the same inputs,
//! their generators hold identical state; any divergence in the simulation
//! leaks into the state words the next time randomness is consumed.

use serde::{Deserialize, Serialize};

use crate::sync::seed::SeedPair;

/// Deterministic PRNG over two 32-bit state words.
///
/// # Determinism Guarantee
///
/// Given the same seed, this generator produces the exact same sequence on
/// any platform. The state words are replicated to joining clients inside
/// the map snapshot, so a client resumes the sequence mid-stream.
///
/// # Example
///
/// ```
/// use lockstep::core::rng::SimulationRng;
///
/// let mut rng = SimulationRng::new(12345);
/// let value = rng.next_u32();
/// assert_eq!(value, 3896358926); // Always the same!
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationRng {
    state: [u32; 2],
}

impl Default for SimulationRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulationRng {
    /// Create a new generator from a 32-bit seed.
    ///
    /// Uses a SplitMix-style mixer to initialize both state words, so even
    /// weak seeds (0, 1, ...) start well distributed.
    pub fn new(seed: u32) -> Self {
        let mut s = seed;
        let state0 = splitmix32(&mut s);
        let state1 = splitmix32(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Generate the next 32-bit random value.
    ///
    /// Xorshift-style mixing over both words; each call perturbs the full
    /// state, so a single skipped or extra draw on one machine changes
    /// both seed words at the next sample point.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(13) ^ s1 ^ (s1 << 9);
        self.state[1] = s1.rotate_left(19);

        result
    }

    /// Generate a random integer in range [0, max).
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        (u64::from(self.next_u32()) * u64::from(max) >> 32) as u32
    }

    /// The current seed pair, as sampled by the desync detector.
    #[inline]
    pub fn seed_pair(&self) -> SeedPair {
        SeedPair {
            seed_1: self.state[0],
            seed_2: self.state[1],
        }
    }

    /// Get current state (for snapshot transfer).
    pub fn state(&self) -> [u32; 2] {
        self.state
    }

    /// Restore from snapshot state.
    pub fn set_state(&mut self, state: [u32; 2]) {
        self.state = state;
    }
}

/// SplitMix32 for seed initialization.
#[inline]
fn splitmix32(state: &mut u32) -> u32 {
    *state = state.wrapping_add(0x9E37_79B9);
    let mut z = *state;
    z = (z ^ (z >> 16)).wrapping_mul(0x21F0_AAAD);
    z = (z ^ (z >> 15)).wrapping_mul(0x735A_2D97);
    z ^ (z >> 15)
}

// =============================================================================
// TESTS
// =============================================================================
