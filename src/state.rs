//! Iteration state: the deterministic cursor that reproduces a sequence.

use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Bound for iteration state values.
///
/// Equality must be structural: two states compare equal iff iteration from
/// them yields identical sequences. States are cloned at every task and
/// channel boundary and never mutated in place, which keeps `next_item`
/// pure.
pub trait IterationState: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<T> IterationState for T where T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

// Weyl-sequence increment, as in splitmix64.
const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Seeded cursor into a pseudo-random specification sequence.
///
/// The cursor is a `(seed, step)` pair; [`rng`](SeedState::rng) derives the
/// generator for the current step and [`advance`](SeedState::advance) moves
/// past it. Serializable so a training job can checkpoint its position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeedState {
    seed: u64,
    step: u64,
}

impl SeedState {
    pub fn new(seed: u64) -> Self {
        Self { seed, step: 0 }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Derive the generator for the current step.
    pub fn rng(&self) -> StdRng {
        let stream = self
            .seed
            .wrapping_add(self.step.wrapping_add(1).wrapping_mul(GOLDEN_GAMMA));
        StdRng::seed_from_u64(stream)
    }

    /// The state after producing the current step's output.
    #[must_use]
    pub fn advance(&self) -> Self {
        Self {
            seed: self.seed,
            step: self.step + 1,
        }
    }
}
