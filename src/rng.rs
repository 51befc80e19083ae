//! Bracketed pseudo-random number sourcing.
//!
//! The stochastic backtrace is the only consumer of randomness in the
//! crate. Access is bracketed: [`rnd_prepare`] checks the process-wide
//! generator state out into a [`RandomHandle`], `runif()` draws
//! uniform(0,1) variates, and dropping the handle writes the advanced
//! state back. [`set_seed`] makes runs reproducible in tests.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

static GLOBAL_SOURCE: Lazy<Mutex<ChaCha20Rng>> =
    Lazy::new(|| Mutex::new(ChaCha20Rng::from_entropy()));

/// Reset the process-wide generator to a deterministic state.
pub fn set_seed(seed: u64) {
    *GLOBAL_SOURCE.lock() = ChaCha20Rng::seed_from_u64(seed);
}

/// Check the generator state out for a run of draws.
pub fn rnd_prepare() -> RandomHandle {
    RandomHandle {
        rng: GLOBAL_SOURCE.lock().clone(),
    }
}

/// A checked-out generator; dropping it is the cleanup bracket.
pub struct RandomHandle {
    rng: ChaCha20Rng,
}

impl RandomHandle {
    /// Uniform(0, 1) variate.
    pub fn runif(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

impl Drop for RandomHandle {
    fn drop(&mut self) {
        *GLOBAL_SOURCE.lock() = self.rng.clone();
    }
}
