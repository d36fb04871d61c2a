//! Injectable randomness
//!
//! Tie-breaks, interest group shuffling and stochastic rounding all draw
//! from a [`RandomSource`] passed in at engine construction, so tests can
//! make outcomes deterministic.

use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};

/// Source of uniform random draws
pub trait RandomSource: Send + Sync {
    /// Uniform integer in `0..bound`. `bound` is at least 1.
    fn uniform_index(&self, bound: usize) -> usize;

    /// Uniform float in `[0, 1)`.
    fn unit_f64(&self) -> f64;

    /// Run `f` against the underlying generator.
    fn with_rng(&self, f: &mut dyn FnMut(&mut dyn RngCore));
}

/// Thread-local OS-seeded generator
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn uniform_index(&self, bound: usize) -> usize {
        rand::thread_rng().gen_range(0..bound.max(1))
    }

    fn unit_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn with_rng(&self, f: &mut dyn FnMut(&mut dyn RngCore)) {
        f(&mut rand::thread_rng())
    }
}

/// Deterministic generator for reproducible runs
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn uniform_index(&self, bound: usize) -> usize {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen_range(0..bound.max(1))
    }

    fn unit_f64(&self) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen::<f64>()
    }

    fn with_rng(&self, f: &mut dyn FnMut(&mut dyn RngCore)) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *rng)
    }
}

/// Shuffle `items` in place with `random`'s generator.
pub fn shuffle<T>(items: &mut [T], random: &dyn RandomSource) {
    random.with_rng(&mut |rng| items.shuffle(rng));
}
