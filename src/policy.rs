use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{AdmitResult, Cancel, LimiterState, Outcome, RetryPolicy};

/// An admission control policy.
///
/// Users typically go through [do_work](crate::do_work) or [retry](crate::retry()) rather than
/// calling these methods directly.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Acquire `need` tokens.
    ///
    /// Returns once they are granted, or with an error if `cancel` fired first or the request can
    /// never be granted while other tokens are in use.
    async fn acquire(&self, cancel: &Cancel, need: usize) -> AdmitResult<()>;

    /// Release `tokens`, reporting whether the work stayed within capacity.
    fn release(&self, tokens: usize, outcome: Outcome);

    /// A snapshot of the policy's state, if it tracks one.
    fn snapshot(&self) -> Option<LimiterState> {
        None
    }
}

/// An admission control policy combined with a retry policy.
pub trait RetryingPolicy: Policy + RetryPolicy {}

impl<P: Policy + RetryPolicy + ?Sized> RetryingPolicy for P {}

#[async_trait]
impl<P: Policy + ?Sized> Policy for Arc<P> {
    async fn acquire(&self, cancel: &Cancel, need: usize) -> AdmitResult<()> {
        (**self).acquire(cancel, need).await
    }

    fn release(&self, tokens: usize, outcome: Outcome) {
        (**self).release(tokens, outcome)
    }

    fn snapshot(&self) -> Option<LimiterState> {
        (**self).snapshot()
    }
}

/// A [Policy] that also decides when over-capacity work is retried.
#[derive(Debug, Clone)]
pub struct WithRetry<P, R> {
    policy: P,
    retry: R,
}

impl<P, R> WithRetry<P, R> {
    /// Combine `policy` with `retry`.
    pub fn new(policy: P, retry: R) -> Self {
        Self { policy, retry }
    }

    /// The admission control policy.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// The retry policy.
    pub fn retry_policy(&self) -> &R {
        &self.retry
    }
}

#[async_trait]
impl<P, R> Policy for WithRetry<P, R>
where
    P: Policy,
    R: Send + Sync,
{
    async fn acquire(&self, cancel: &Cancel, need: usize) -> AdmitResult<()> {
        self.policy.acquire(cancel, need).await
    }

    fn release(&self, tokens: usize, outcome: Outcome) {
        self.policy.release(tokens, outcome)
    }

    fn snapshot(&self) -> Option<LimiterState> {
        self.policy.snapshot()
    }
}

impl<P, R: RetryPolicy> RetryPolicy for WithRetry<P, R> {
    fn retry(&self, attempt: u32) -> Option<Duration> {
        self.retry.retry(attempt)
    }
}

/// Extension methods for [Policy].
pub trait PolicyExt: Policy + Sized {
    /// Retry over-capacity work according to `retry`.
    fn with_retry<R: RetryPolicy>(self, retry: R) -> WithRetry<Self, R> {
        WithRetry::new(self, retry)
    }
}

impl<P: Policy> PolicyExt for P {}

/// Tokens acquired from a [Policy].
///
/// Release the tokens back to the policy after the work is complete. Dropping the token without
/// releasing it, e.g. because the work panicked or its future was dropped, releases the tokens as
/// [Outcome::Overload].
#[must_use = "dropping a token releases it as overloaded"]
pub struct Token<'p, P: Policy + ?Sized> {
    policy: &'p P,
    tokens: usize,
}

impl<'p, P: Policy + ?Sized> Token<'p, P> {
    /// Acquire `tokens` from `policy`.
    pub async fn acquire(policy: &'p P, cancel: &Cancel, tokens: usize) -> AdmitResult<Self> {
        policy.acquire(cancel, tokens).await?;
        Ok(Self { policy, tokens })
    }

    /// The number of tokens held.
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// Return the tokens, along with the outcome of the work.
    pub fn release(self, outcome: Outcome) {
        self.policy.release(self.tokens, outcome);
        std::mem::forget(self);
    }
}

impl<P: Policy + ?Sized> Drop for Token<'_, P> {
    fn drop(&mut self) {
        self.policy.release(self.tokens, Outcome::Overload);
    }
}
