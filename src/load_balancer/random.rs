//! Seedable random selection policy.

use std::sync::Mutex;

use crate::load_balancer::SelectionPolicy;
use crate::topology::Backend;

/// Uniform random selector. Deterministic for a given seed.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<fastrand::Rng>,
}

impl SeededRandom {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }
}

impl SelectionPolicy for SeededRandom {
    fn next_backend<'a>(&self, backends: &'a [Backend]) -> Option<&'a Backend> {
        if backends.is_empty() {
            return None;
        }
        let index = self
            .rng
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .usize(..backends.len());
        backends.get(index)
    }
}
