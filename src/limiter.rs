use std::{fmt, sync::Arc, task::Poll};

use tracing::{debug, trace, warn};

use crate::{
    gate::Gate,
    limits::{LimitAlgorithm, Sample},
    metrics::MetricsSink,
    AdmitError, AdmitResult, Cancel, Policy,
};

/// Limits the number of tokens in use at once.
///
/// Work acquires a number of tokens before it starts and releases them once it is finished,
/// reporting whether it stayed within the capacity of whatever it used. The limit is adjusted by
/// the [LimitAlgorithm] based on that feedback.
///
/// A limiter is not fair: tokens are not granted in FIFO order. Every release wakes all waiters
/// and whichever fits and runs first is admitted, so a small request may overtake a large one.
pub struct Limiter<T> {
    limit_algo: T,
    gate: Gate<Counters>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    limit: usize,
    used: usize,
}

/// A [Limiter] with a [Ratio](crate::limits::Ratio) limit.
pub type RatioController = Limiter<crate::limits::Ratio>;

/// A [Limiter] with an [Aimd](crate::limits::Aimd) limit.
pub type AimdController = Limiter<crate::limits::Aimd>;

/// A snapshot of the state of the [Limiter].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterState {
    limit: usize,
    available: usize,
    in_flight: usize,
}

/// Whether work stayed within capacity.
///
/// Errors not caused by overload should be reported as [Outcome::Success].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The work succeeded, or failed in a way unrelated to overload.
    Success,
    /// The work exceeded capacity, e.g. it was throttled or timed out.
    Overload,
}

impl<T> Limiter<T>
where
    T: LimitAlgorithm,
{
    /// Create a limiter with a given limit control algorithm.
    pub fn new(limit_algo: T) -> Self {
        let limit = limit_algo.initial_limit();
        Self {
            limit_algo,
            gate: Gate::new(Counters { limit, used: 0 }),
            metrics: None,
        }
    }

    /// Publish the limiter's state to `sink` after every change.
    pub fn with_metrics(mut self, sink: impl MetricsSink + 'static) -> Self {
        let sink: Arc<dyn MetricsSink> = Arc::new(sink);
        sink.publish(self.state());
        self.metrics = Some(sink);
        self
    }

    /// Acquire `need` tokens, waiting until they fit or `cancel` fires.
    ///
    /// Fails with [AdmitError::CapacityExceeded] if `need` is above the hard limit while other
    /// tokens are in use; such a request is only ever admitted alone.
    pub async fn acquire(&self, cancel: &Cancel, need: usize) -> AdmitResult<()> {
        self.gate
            .wait_for(cancel, |counters| self.admit(counters, need))
            .await
    }

    /// Acquire `need` tokens without waiting.
    ///
    /// Returns `Ok(false)` if the tokens don't fit right now.
    pub fn try_acquire(&self, need: usize) -> AdmitResult<bool> {
        match self.admit(&mut *self.gate.lock(), need) {
            Poll::Ready(result) => result.map(|()| true),
            Poll::Pending => Ok(false),
        }
    }

    /// Return `tokens`, along with the outcome of the work they were used for.
    pub fn release(&self, tokens: usize, outcome: Outcome) {
        let (old_limit, new_limit) = self.gate.update(|counters| {
            let old_limit = counters.limit;
            let sample = Sample {
                in_flight: counters.used,
                outcome,
            };
            counters.limit = self
                .limit_algo
                .update(old_limit, sample)
                .min(self.limit_algo.max_limit());
            counters.used = counters.used.saturating_sub(tokens);
            self.publish(counters);
            (old_limit, counters.limit)
        });

        if new_limit != old_limit {
            debug!(old_limit, new_limit, ?outcome, "admission limit changed");
        }
    }

    /// The current state of the limiter.
    pub fn state(&self) -> LimiterState {
        LimiterState::from(*self.gate.lock())
    }

    /// The limit control algorithm.
    pub fn limit_algo(&self) -> &T {
        &self.limit_algo
    }

    fn admit(&self, counters: &mut Counters, need: usize) -> Poll<AdmitResult<()>> {
        let hard_limit = self.limit_algo.max_limit();
        let ceiling = self
            .limit_algo
            .admission_limit(counters.limit)
            .min(hard_limit);
        let have = ceiling.saturating_sub(counters.used);

        if need <= have || (need > ceiling && counters.used == 0) {
            if need > ceiling {
                warn!(need, ceiling, "admitting oversized request alone");
            }
            counters.used += need;
            self.publish(counters);
            trace!(need, used = counters.used, "tokens acquired");
            return Poll::Ready(Ok(()));
        }

        if need > hard_limit {
            warn!(need, hard_limit, used = counters.used, "request can never fit alongside others");
            return Poll::Ready(Err(AdmitError::CapacityExceeded {
                need,
                hard_limit,
                used: counters.used,
            }));
        }

        trace!(need, have, "waiting for tokens");
        Poll::Pending
    }

    fn publish(&self, counters: &Counters) {
        if let Some(metrics) = &self.metrics {
            metrics.publish(LimiterState::from(*counters));
        }
    }
}

#[async_trait::async_trait]
impl<T> Policy for Limiter<T>
where
    T: LimitAlgorithm + Send + Sync,
{
    async fn acquire(&self, cancel: &Cancel, need: usize) -> AdmitResult<()> {
        Limiter::acquire(self, cancel, need).await
    }

    fn release(&self, tokens: usize, outcome: Outcome) {
        Limiter::release(self, tokens, outcome)
    }

    fn snapshot(&self) -> Option<LimiterState> {
        Some(Limiter::state(self))
    }
}

impl<T: fmt::Debug> fmt::Debug for Limiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("limit_algo", &self.limit_algo)
            .field("state", &*self.gate.lock())
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl From<Counters> for LimiterState {
    fn from(Counters { limit, used }: Counters) -> Self {
        Self {
            limit,
            available: limit.saturating_sub(used),
            in_flight: used,
        }
    }
}

impl LimiterState {
    /// The current limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
    /// The number of tokens available below the limit.
    pub fn available(&self) -> usize {
        self.available
    }
    /// The number of tokens in use.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

impl Outcome {
    /// Whether the work stayed within capacity.
    pub fn is_ok(self) -> bool {
        self == Outcome::Success
    }
}

impl From<bool> for Outcome {
    fn from(ok: bool) -> Self {
        if ok {
            Outcome::Success
        } else {
            Outcome::Overload
        }
    }
}
