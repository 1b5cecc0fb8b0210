//! Admission control error types.

use std::time::Duration;

/// Admission control error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    /// The caller's cancellation token fired.
    #[error("admission cancelled")]
    Cancelled,

    /// The caller's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The request can never fit while other work is outstanding.
    #[error("{need} tokens requested exceed the hard limit of {hard_limit} with {used} in use")]
    CapacityExceeded {
        /// Tokens requested.
        need: usize,
        /// The controller's hard limit.
        hard_limit: usize,
        /// Tokens in use when the request was rejected.
        used: usize,
    },

    /// The retry policy gave up.
    #[error("gave up after {tries} tries")]
    TooManyTries {
        /// Retries made before giving up.
        tries: u32,
    },

    /// The next retry would start after the caller's deadline.
    #[error("ran out of time while waiting {delay:?} for retry")]
    RetryTimeout {
        /// The delay the retry policy asked for.
        delay: Duration,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },
}

impl AdmitError {
    /// Whether the error came from the caller's cancel signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Result type for admission control operations.
pub type AdmitResult<T> = Result<T, AdmitError>;
