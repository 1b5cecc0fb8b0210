//! Loss-based limit that does an additive increment while work succeeds and a multiplicative
//! decrement when work is over capacity.
//!
//! - Loss-based
//! - Additive increase, multiplicative decrease

use serde::{Deserialize, Serialize};

use crate::{AdmitError, AdmitResult, Outcome};

use super::{scale, LimitAlgorithm, Sample};

/// Additive increase, multiplicative decrease.
///
/// The limit only grows when it was the binding constraint: the tokens in use when the work
/// finished had reached it.
///
/// Admission is checked against the limit itself. A lone request larger than the limit is still
/// admitted when nothing else is in use.
#[derive(Debug, Clone, Copy)]
pub struct Aimd {
    initial_limit: usize,
    min_limit: usize,
    max_limit: usize,
    increase_by: usize,
    decrease_factor: f64,
}

impl Aimd {
    const DEFAULT_INCREASE: usize = 1;
    const DEFAULT_MIN_LIMIT: usize = 1;
    const DEFAULT_MAX_LIMIT: usize = usize::MAX;

    /// Start at `initial_limit`, dropping by `decrease_fraction` of the limit on overload.
    pub fn new(initial_limit: usize, decrease_fraction: f64) -> Self {
        assert!(decrease_fraction > 0.0 && decrease_fraction < 1.0);
        Self {
            initial_limit,
            min_limit: Self::DEFAULT_MIN_LIMIT,
            max_limit: Self::DEFAULT_MAX_LIMIT,
            increase_by: Self::DEFAULT_INCREASE,
            decrease_factor: 1.0 - decrease_fraction,
        }
    }

    /// Set the additive step applied on success.
    pub fn increase_by(self, increase: usize) -> Self {
        assert!(increase > 0);
        Self {
            increase_by: increase,
            ..self
        }
    }

    /// Set the floor for decreases. At least 1.
    pub fn with_min_limit(self, min: usize) -> Self {
        assert!(min > 0 && min <= self.max_limit);
        Self {
            min_limit: min,
            ..self
        }
    }

    /// Set the hard limit.
    pub fn with_max_limit(self, max: usize) -> Self {
        assert!(max >= self.min_limit);
        Self {
            max_limit: max,
            ..self
        }
    }
}

impl LimitAlgorithm for Aimd {
    fn initial_limit(&self) -> usize {
        self.initial_limit.clamp(self.min_limit, self.max_limit)
    }

    fn max_limit(&self) -> usize {
        self.max_limit
    }

    fn update(&self, old_limit: usize, sample: Sample) -> usize {
        match sample.outcome() {
            Outcome::Success if sample.in_flight() >= old_limit => old_limit
                .saturating_add(self.increase_by)
                .min(self.max_limit),
            Outcome::Success => old_limit,
            // Truncate instead of round, so the limit reduces even with small numbers.
            // E.g. round(2 * 0.8) = 2, but floor(2 * 0.8) = 1
            Outcome::Overload => scale(old_limit, self.decrease_factor).max(self.min_limit),
        }
    }
}

/// Deserializable settings for an [Aimd] limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AimdConfig {
    /// Starting limit.
    pub initial_limit: usize,
    /// Floor for decreases.
    pub min_limit: usize,
    /// Hard limit.
    pub max_limit: usize,
    /// Additive step on success.
    pub increase_by: usize,
    /// Fraction of the limit removed on overload.
    pub decrease_fraction: f64,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            initial_limit: 10,
            min_limit: Aimd::DEFAULT_MIN_LIMIT,
            max_limit: Aimd::DEFAULT_MAX_LIMIT,
            increase_by: Aimd::DEFAULT_INCREASE,
            decrease_fraction: 0.2,
        }
    }
}

impl AimdConfig {
    /// Check the settings are usable.
    pub fn validate(&self) -> AdmitResult<()> {
        if self.min_limit == 0 {
            return Err(AdmitError::invalid_config("min_limit must be positive"));
        }
        if self.min_limit > self.max_limit {
            return Err(AdmitError::invalid_config(format!(
                "min_limit {} exceeds max_limit {}",
                self.min_limit, self.max_limit
            )));
        }
        if self.increase_by == 0 {
            return Err(AdmitError::invalid_config("increase_by must be positive"));
        }
        if !(self.decrease_fraction > 0.0 && self.decrease_fraction < 1.0) {
            return Err(AdmitError::invalid_config(format!(
                "decrease_fraction {} must be within (0, 1)",
                self.decrease_fraction
            )));
        }
        Ok(())
    }

    /// Validate and build the limit.
    pub fn build(&self) -> AdmitResult<Aimd> {
        self.validate()?;
        Ok(Aimd::new(self.initial_limit, self.decrease_fraction)
            .with_max_limit(self.max_limit)
            .with_min_limit(self.min_limit)
            .increase_by(self.increase_by))
    }
}
