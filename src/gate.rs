use std::{
    future::Future,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
    task::{self, Poll},
};

use pin_project_lite::pin_project;
use tokio::sync::{futures::Notified, Notify};

use crate::{AdmitResult, Cancel};

/// State guarded by a mutex, with broadcast wake-ups for tasks waiting on it.
///
/// Waiters re-evaluate their own condition after every broadcast. There is no queue: whichever
/// waiter is polled first after a change gets to act on it.
#[derive(Debug)]
pub(crate) struct Gate<S> {
    state: Mutex<S>,
    notify: Notify,
}

impl<S> Gate<S> {
    pub(crate) fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            notify: Notify::new(),
        }
    }

    /// Lock the state without waking anyone.
    pub(crate) fn lock(&self) -> MutexGuard<'_, S> {
        // Only plain counter updates run under the lock, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the state, then wake all waiters.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let out = f(&mut *self.lock());
        self.notify.notify_waiters();
        out
    }

    /// Wait until `check` resolves, re-running it under the lock after every broadcast.
    ///
    /// `check` returns `Poll::Pending` to keep waiting. If `cancel` fires first, its error is
    /// returned and `check` is never resolved, so the state is left as `check` last saw it.
    pub(crate) async fn wait_for<T, F>(&self, cancel: &Cancel, check: F) -> AdmitResult<T>
    where
        F: FnMut(&mut S) -> Poll<AdmitResult<T>>,
    {
        let admit = Admit {
            gate: self,
            notified: self.notify.notified(),
            check,
        };

        tokio::select! {
            biased;
            result = admit => result,
            err = cancel.done() => Err(err),
        }
    }
}

pin_project! {
    struct Admit<'g, S, F> {
        gate: &'g Gate<S>,
        // Created before every check so that no broadcast can slip in between.
        #[pin]
        notified: Notified<'g>,
        check: F,
    }
}

impl<S, T, F> Future for Admit<'_, S, F>
where
    F: FnMut(&mut S) -> Poll<AdmitResult<T>>,
{
    type Output = AdmitResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            let checked = (this.check)(&mut *this.gate.lock());
            if let Poll::Ready(result) = checked {
                return Poll::Ready(result);
            }

            match this.notified.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => this.notified.set(this.gate.notify.notified()),
            }
        }
    }
}
