//! Adaptive admission control for work against a shared resource of unknown capacity.
//!
//! A [Limiter] hands out tokens up to a limit that a [LimitAlgorithm](limits::LimitAlgorithm)
//! moves as work reports whether the resource kept up. [do_work] and [retry()] wrap a unit of work
//! in that protocol.

#![warn(missing_docs)]

mod admit;
mod cancel;
mod error;
mod gate;
mod limiter;
pub mod limits;
pub mod metrics;
mod policy;
pub mod retry;

pub use admit::{do_work, retry, CapacityStatus};
pub use cancel::Cancel;
pub use error::{AdmitError, AdmitResult};
pub use limiter::{AimdController, Limiter, LimiterState, Outcome, RatioController};
pub use policy::{Policy, PolicyExt, RetryingPolicy, Token, WithRetry};
pub use retry::{backoff_with_timeout, Backoff, BackoffConfig, Jitter, MaxRetries, RetryPolicy};
