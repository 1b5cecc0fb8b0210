use serde::{Deserialize, Serialize};

use crate::{AdmitError, AdmitResult, Outcome};

use super::{scale, LimitAlgorithm, Sample};

/// Loss-based limit that moves by a fixed proportion of itself.
///
/// - Admission is checked against the limit optimistically raised by the change rate, so work
///   can probe slightly above the last limit that was shown to be safe.
/// - On success, the limit rises to the number of tokens that were in use, if that was above it.
/// - On overload, the limit drops by the change rate.
///
/// The limit never exceeds the hard limit, and a lone request larger than the limit is admitted
/// when nothing else is in use.
#[derive(Debug, Clone, Copy)]
pub struct Ratio {
    initial_limit: usize,
    min_limit: usize,
    max_limit: usize,
    change_rate: f64,
}

impl Ratio {
    /// The default proportion by which the limit moves.
    pub const DEFAULT_CHANGE_RATE: f64 = 0.1;
    const DEFAULT_MIN_LIMIT: usize = 1;

    /// Start at `initial_limit`, never growing beyond `max_limit`.
    pub fn new(initial_limit: usize, max_limit: usize) -> Self {
        assert!(max_limit > 0);
        Self {
            initial_limit,
            min_limit: Self::DEFAULT_MIN_LIMIT,
            max_limit,
            change_rate: Self::DEFAULT_CHANGE_RATE,
        }
    }

    /// Set the proportion by which the limit moves, within `(0, 1)`.
    pub fn with_change_rate(self, rate: f64) -> Self {
        assert!(rate > 0.0 && rate < 1.0);
        Self {
            change_rate: rate,
            ..self
        }
    }

    /// Set the floor for decreases.
    pub fn with_min_limit(self, min: usize) -> Self {
        assert!(min <= self.max_limit);
        Self {
            min_limit: min,
            ..self
        }
    }

    /// The proportion by which the limit moves.
    pub fn change_rate(&self) -> f64 {
        self.change_rate
    }
}

impl LimitAlgorithm for Ratio {
    fn initial_limit(&self) -> usize {
        self.initial_limit.clamp(self.min_limit, self.max_limit)
    }

    fn max_limit(&self) -> usize {
        self.max_limit
    }

    fn admission_limit(&self, limit: usize) -> usize {
        scale(limit, 1.0 + self.change_rate).min(self.max_limit)
    }

    fn update(&self, old_limit: usize, sample: Sample) -> usize {
        match sample.outcome() {
            Outcome::Success if sample.in_flight() > old_limit => {
                sample.in_flight().min(self.max_limit)
            }
            Outcome::Success => old_limit,
            Outcome::Overload => scale(old_limit, 1.0 - self.change_rate).max(self.min_limit),
        }
    }
}

/// Deserializable settings for a [Ratio] limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioConfig {
    /// Starting limit.
    pub initial_limit: usize,
    /// Floor for decreases.
    pub min_limit: usize,
    /// Hard limit.
    pub max_limit: usize,
    /// Proportion by which the limit moves.
    pub change_rate: f64,
}

impl Default for RatioConfig {
    fn default() -> Self {
        Self {
            initial_limit: 10,
            min_limit: Ratio::DEFAULT_MIN_LIMIT,
            max_limit: 1000,
            change_rate: Ratio::DEFAULT_CHANGE_RATE,
        }
    }
}

impl RatioConfig {
    /// Check the settings are usable.
    pub fn validate(&self) -> AdmitResult<()> {
        if self.max_limit == 0 {
            return Err(AdmitError::invalid_config("max_limit must be positive"));
        }
        if self.min_limit > self.max_limit {
            return Err(AdmitError::invalid_config(format!(
                "min_limit {} exceeds max_limit {}",
                self.min_limit, self.max_limit
            )));
        }
        if !(self.change_rate > 0.0 && self.change_rate < 1.0) {
            return Err(AdmitError::invalid_config(format!(
                "change_rate {} must be within (0, 1)",
                self.change_rate
            )));
        }
        Ok(())
    }

    /// Validate and build the limit.
    pub fn build(&self) -> AdmitResult<Ratio> {
        self.validate()?;
        Ok(Ratio::new(self.initial_limit, self.max_limit)
            .with_min_limit(self.min_limit)
            .with_change_rate(self.change_rate))
    }
}
