//! Algorithms for controlling admission limits.

mod aimd;
mod fixed;
mod ratio;

use crate::Outcome;

pub use aimd::{Aimd, AimdConfig};
pub use fixed::Fixed;
pub use ratio::{Ratio, RatioConfig};

/// An algorithm for controlling an admission limit.
///
/// The [Limiter](crate::Limiter) calls every method while holding its lock, so implementations
/// should be cheap and must not block.
pub trait LimitAlgorithm {
    /// The limit a new limiter starts with.
    fn initial_limit(&self) -> usize;

    /// The hard limit. The limit never moves above it.
    fn max_limit(&self) -> usize;

    /// The ceiling used to decide whether a request fits, given the current limit.
    ///
    /// Defaults to the limit itself.
    fn admission_limit(&self, limit: usize) -> usize {
        limit
    }

    /// Update the limit in response to released tokens.
    fn update(&self, old_limit: usize, sample: Sample) -> usize;
}

impl<T: LimitAlgorithm + ?Sized> LimitAlgorithm for Box<T> {
    fn initial_limit(&self) -> usize {
        (**self).initial_limit()
    }

    fn max_limit(&self) -> usize {
        (**self).max_limit()
    }

    fn admission_limit(&self, limit: usize) -> usize {
        (**self).admission_limit(limit)
    }

    fn update(&self, old_limit: usize, sample: Sample) -> usize {
        (**self).update(old_limit, sample)
    }
}

/// The feedback from a release: how many tokens were in use and whether the work was within
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Tokens in use when the sample was taken, before the released tokens are returned.
    pub(crate) in_flight: usize,
    pub(crate) outcome: Outcome,
}

impl Sample {
    /// Tokens in use when the sample was taken, including the ones being released.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether the released work stayed within capacity.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}

/// `limit * factor`, truncated.
fn scale(limit: usize, factor: f64) -> usize {
    (limit as f64 * factor) as usize
}
