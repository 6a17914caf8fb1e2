//! Per-thread randomness for the stochastic stages.

use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};

/// Thin wrapper over the thread-local PRNG.
///
/// Every draw goes through here so stage code never carries generator state
/// and never contends on a shared RNG.
pub struct RandomSource;

impl RandomSource {
    /// Uniform draw in `[0.0, 100.0)`, for comparing against percentage
    /// rates.
    #[inline]
    pub fn percentage() -> f32 {
        thread_rng().gen_range(0.0f32..100.0f32)
    }

    /// Uniform integer in `[lo, hi]`. Callers must pass `lo <= hi`.
    #[inline]
    pub fn range_inclusive(lo: u32, hi: u32) -> u32 {
        if lo >= hi {
            return lo;
        }
        thread_rng().gen_range(lo..=hi)
    }

    /// Uniform shuffle of a slice.
    #[inline]
    pub fn shuffle<T>(items: &mut [T]) {
        items.shuffle(&mut thread_rng());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_stays_in_range() {
        for _ in 0..1000 {
            let p = RandomSource::percentage();
            assert!((0.0..100.0).contains(&p));
        }
    }

    #[test]
    fn range_inclusive_hits_both_ends() {
        let mut saw_lo = false;
        let mut saw_hi = false;
        for _ in 0..1000 {
            match RandomSource::range_inclusive(1, 3) {
                1 => saw_lo = true,
                3 => saw_hi = true,
                2 => {}
                other => panic!("out of range draw: {}", other),
            }
        }
        assert!(saw_lo && saw_hi);
    }

    #[test]
    fn degenerate_range_returns_lo() {
        assert_eq!(RandomSource::range_inclusive(7, 7), 7);
    }
}
