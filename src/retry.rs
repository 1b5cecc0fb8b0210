//! Retry policies, and the wait between over-capacity attempts.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AdmitError, AdmitResult, Cancel};

/// Decides whether another attempt should be made, and after how long.
pub trait RetryPolicy {
    /// The delay before retrying after `attempt` (counted from 0) failed, or `None` to give up.
    fn retry(&self, attempt: u32) -> Option<Duration>;
}

impl<R: RetryPolicy + ?Sized> RetryPolicy for &R {
    fn retry(&self, attempt: u32) -> Option<Duration> {
        (**self).retry(attempt)
    }
}

impl<R: RetryPolicy + ?Sized> RetryPolicy for Box<R> {
    fn retry(&self, attempt: u32) -> Option<Duration> {
        (**self).retry(attempt)
    }
}

impl<R: RetryPolicy + ?Sized> RetryPolicy for Arc<R> {
    fn retry(&self, attempt: u32) -> Option<Duration> {
        (**self).retry(attempt)
    }
}

/// Wait before retrying after `attempt` failed.
///
/// Fails with [AdmitError::TooManyTries] if the policy gives up, with
/// [AdmitError::RetryTimeout] if the delay would run past the deadline of `cancel`, or with the
/// cancellation error if `cancel` fires while waiting.
pub async fn wait<R: RetryPolicy + ?Sized>(
    cancel: &Cancel,
    policy: &R,
    attempt: u32,
) -> AdmitResult<()> {
    let Some(delay) = policy.retry(attempt) else {
        return Err(AdmitError::TooManyTries { tries: attempt });
    };
    if cancel.remaining().is_some_and(|remaining| remaining < delay) {
        return Err(AdmitError::RetryTimeout { delay });
    }
    debug!(attempt, ?delay, "waiting to retry");
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        err = cancel.done() => Err(err),
    }
}

/// Exponential backoff: waits `initial * factor^attempt`, up to `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    /// Start at `initial`, multiplying by `factor` on each attempt, up to `max`.
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        assert!(factor.is_finite() && factor >= 0.0);
        Self {
            initial,
            max,
            factor,
        }
    }
}

impl RetryPolicy for Backoff {
    fn retry(&self, attempt: u32) -> Option<Duration> {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.initial.as_nanos() as f64 * self.factor.powi(exponent);
        let nanos = nanos.min(self.max.as_nanos() as f64);
        Some(Duration::from_nanos(nanos as u64))
    }
}

/// Gives up once `max_retries` retries have been made.
#[derive(Debug, Clone, Copy)]
pub struct MaxRetries<R> {
    policy: R,
    max_retries: u32,
}

impl<R> MaxRetries<R> {
    /// Allow at most `max_retries` retries, each delayed as `policy` says.
    pub fn new(policy: R, max_retries: u32) -> Self {
        assert!(max_retries > 0);
        Self {
            policy,
            max_retries,
        }
    }
}

impl<R: RetryPolicy> RetryPolicy for MaxRetries<R> {
    fn retry(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        self.policy.retry(attempt)
    }
}

/// Randomises a fraction of the delays of another policy.
///
/// A fraction of 1.0 gives "full jitter", 0.5 gives "equal jitter".
#[derive(Debug, Clone, Copy)]
pub struct Jitter<R> {
    policy: R,
    frac: f64,
}

impl<R> Jitter<R> {
    /// Keep `1 - frac` of each delay from `policy` and pick the rest uniformly at random.
    pub fn new(policy: R, frac: f64) -> Self {
        assert!((0.0..=1.0).contains(&frac));
        Self { policy, frac }
    }
}

impl<R: RetryPolicy> RetryPolicy for Jitter<R> {
    fn retry(&self, attempt: u32) -> Option<Duration> {
        let delay = self.policy.retry(attempt)?;
        // The float round trip in `mul_f64` can land just above `delay`.
        let jittered = delay.mul_f64(self.frac).min(delay);
        Some(delay - jittered + rand::thread_rng().gen_range(Duration::ZERO..=jittered))
    }
}

/// Exponential backoff that gives up once the delay would reach `max`.
pub fn backoff_with_timeout(initial: Duration, max: Duration, factor: f64) -> MaxRetries<Backoff> {
    assert!(!initial.is_zero() && factor > 1.0);
    let ratio = max.as_secs_f64() / initial.as_secs_f64();
    let retries = (ratio.ln() / factor.ln()).floor().max(0.0) as u32 + 1;
    MaxRetries::new(Backoff::new(initial, max, factor), retries)
}

/// Deserializable settings for a retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay, in milliseconds.
    pub initial_delay_ms: u64,
    /// Longest delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth of the delay per attempt.
    pub factor: f64,
    /// Give up after this many retries.
    pub max_retries: Option<u32>,
    /// Fraction of each delay to randomise.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 60_000,
            factor: 1.5,
            max_retries: Some(5),
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    /// Check the settings are usable.
    pub fn validate(&self) -> AdmitResult<()> {
        if !(self.factor.is_finite() && self.factor >= 0.0) {
            return Err(AdmitError::invalid_config(format!(
                "factor {} must be a non-negative number",
                self.factor
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(AdmitError::invalid_config(format!(
                "initial_delay_ms {} exceeds max_delay_ms {}",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        if self.max_retries == Some(0) {
            return Err(AdmitError::invalid_config("max_retries must be positive"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(AdmitError::invalid_config(format!(
                "jitter {} must be within [0, 1]",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Validate and build the policy.
    pub fn build(&self) -> AdmitResult<Box<dyn RetryPolicy + Send + Sync>> {
        self.validate()?;
        let backoff = Backoff::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.factor,
        );
        let policy: Box<dyn RetryPolicy + Send + Sync> = match (self.max_retries, self.jitter) {
            (Some(n), jitter) if jitter > 0.0 => {
                Box::new(MaxRetries::new(Jitter::new(backoff, jitter), n))
            }
            (Some(n), _) => Box::new(MaxRetries::new(backoff, n)),
            (None, jitter) if jitter > 0.0 => Box::new(Jitter::new(backoff, jitter)),
            (None, _) => Box::new(backoff),
        };
        Ok(policy)
    }
}
