use std::{future, time::Duration};

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::AdmitError;

/// A cancellation signal for operations that may suspend.
///
/// Combines an optional deadline with an optional [CancellationToken]. Whichever fires first ends
/// the wait: a passed deadline yields [AdmitError::DeadlineExceeded], a cancelled token yields
/// [AdmitError::Cancelled].
///
/// The default signal never fires.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Cancel {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self::default()
    }

    /// Fires when `token` is cancelled.
    pub fn with_token(token: CancellationToken) -> Self {
        Self::never().and_token(token)
    }

    /// Fires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::never().and_deadline(deadline)
    }

    /// Fires once `timeout` has elapsed from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Also fire when `token` is cancelled.
    pub fn and_token(self, token: CancellationToken) -> Self {
        Self {
            token: Some(token),
            ..self
        }
    }

    /// Also fire at `deadline`. The earlier of two deadlines wins.
    pub fn and_deadline(self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if any. Zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The error this signal has already produced, if it has fired.
    pub fn error(&self) -> Option<AdmitError> {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Some(AdmitError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(AdmitError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Whether the signal has fired.
    pub fn is_done(&self) -> bool {
        self.error().is_some()
    }

    /// Completes when the signal fires, with the matching error.
    pub async fn done(&self) -> AdmitError {
        if let Some(err) = self.error() {
            return err;
        }

        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            _ = cancelled => AdmitError::Cancelled,
            _ = expired => AdmitError::DeadlineExceeded,
        }
    }
}
