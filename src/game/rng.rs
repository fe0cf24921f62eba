//! The kernel's deterministic pseudo-random number generator.
//!
//! A minimal-standard Lehmer generator. The exact integer stream is part of
//! cross-participant simulation state, so the algorithm is pinned here rather
//! than delegated to an external generator whose stream could change between
//! library versions. State advances only when simulation code draws from it.

use serde::{Deserialize, Serialize};

const MODULUS: u64 = 2_147_483_647;
const MULTIPLIER: u64 = 48_271;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRng {
    state: u32,
}

impl SimRng {
    pub fn new(seed: u32) -> Self {
        // State must lie in [1, modulus - 1].
        let seed = seed % MODULUS as u32;
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    pub fn state(&self) -> u32 {
        self.state
    }

    fn next(&mut self) -> u32 {
        self.state = ((self.state as u64 * MULTIPLIER) % MODULUS) as u32;
        self.state
    }

    /// Uniform draw from the inclusive range `[low, high]`.
    pub fn next_in_range(&mut self, low: u32, high: u32) -> u32 {
        debug_assert!(low <= high);
        let span = (high - low) as u64 + 1;
        low + ((self.next() as u64 - 1) * span / (MODULUS - 1)) as u32
    }

    pub fn next_bool(&mut self) -> bool {
        self.next_in_range(0, 1) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_minstd_reference_stream() {
        // Known values for the minstd parameters from seed 1.
        let mut rng = SimRng::new(1);
        assert_eq!(rng.next(), 48_271);
        assert_eq!(rng.next(), 182_605_794);
        // The 10000th draw from seed 1 is a published test vector.
        let mut rng = SimRng::new(1);
        let mut last = 0;
        for _ in 0..10_000 {
            last = rng.next();
        }
        assert_eq!(last, 399_268_537);
    }

    #[test]
    fn range_draws_stay_in_bounds() {
        let mut rng = SimRng::new(12345);
        for _ in 0..10_000 {
            let v = rng.next_in_range(3, 17);
            assert!((3..=17).contains(&v));
        }
    }

    #[test]
    fn identical_seeds_produce_identical_streams() {
        let mut a = SimRng::new(99);
        let mut b = SimRng::new(99);
        for _ in 0..1000 {
            assert_eq!(a.next_in_range(0, 1000), b.next_in_range(0, 1000));
        }
    }
}
