use std::future::Future;

use tracing::debug;

use crate::{AdmitError, Cancel, Outcome, Policy, RetryingPolicy, Token};

/// How work went relative to the capacity of the resource it used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityStatus {
    /// The resource operated within capacity.
    Within,
    /// The resource is over capacity, but the result is usable and the work is not retried.
    OverNoRetry,
    /// The resource rejected the work for lack of capacity, and it should be retried.
    OverNeedRetry,
}

impl From<CapacityStatus> for Outcome {
    fn from(status: CapacityStatus) -> Self {
        match status {
            CapacityStatus::Within => Outcome::Success,
            CapacityStatus::OverNoRetry | CapacityStatus::OverNeedRetry => Outcome::Overload,
        }
    }
}

/// Run `work` after `policy` admits `tokens`, then report its [Outcome] back to the policy.
///
/// Without a policy, `work` simply runs. The tokens are released exactly once, even if `work`
/// panics or this future is dropped before it finishes; in that case they count as overloaded.
pub async fn do_work<P, F, Fut, T, E>(
    cancel: &Cancel,
    policy: Option<&P>,
    tokens: usize,
    work: F,
) -> Result<T, E>
where
    P: Policy + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = (Outcome, Result<T, E>)>,
    E: From<AdmitError>,
{
    let Some(policy) = policy else {
        return work().await.1;
    };

    let token = Token::acquire(policy, cancel, tokens).await?;
    let (outcome, result) = work().await;
    token.release(outcome);
    result
}

/// Run `work` under `policy`, retrying while it reports [CapacityStatus::OverNeedRetry].
///
/// Every attempt acquires and releases its own tokens, so no tokens are held while waiting to
/// retry. The result of the last attempt is returned, unless the retry policy gives up or
/// `cancel` fires, in which case that error is returned instead.
pub async fn retry<P, F, Fut, T, E>(
    cancel: &Cancel,
    policy: Option<&P>,
    tokens: usize,
    mut work: F,
) -> Result<T, E>
where
    P: RetryingPolicy + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = (CapacityStatus, Result<T, E>)>,
    E: From<AdmitError>,
{
    let Some(policy) = policy else {
        return work().await.1;
    };

    let mut attempt = 0_u32;
    loop {
        let mut status = CapacityStatus::Within;
        let result = {
            let status = &mut status;
            let work = &mut work;
            do_work(cancel, Some(policy), tokens, move || async move {
                let (s, result) = work().await;
                *status = s;
                (Outcome::from(s), result)
            })
            .await
        };

        match status {
            CapacityStatus::Within | CapacityStatus::OverNoRetry => return result,
            CapacityStatus::OverNeedRetry => {
                crate::retry::wait(cancel, policy, attempt).await?;
                debug!(attempt, tokens, "retrying over-capacity work");
            }
        }
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc,
        },
        time::Duration,
    };

    use rand::Rng;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        limits::{Fixed, Ratio},
        Backoff, Limiter, MaxRetries, PolicyExt,
    };

    #[derive(Debug, PartialEq, thiserror::Error)]
    enum TestError {
        #[error(transparent)]
        Admit(#[from] AdmitError),
        #[error("some other error")]
        Other,
    }

    type Result<T> = std::result::Result<T, TestError>;

    fn no_policy() -> Option<&'static Limiter<Fixed>> {
        None
    }

    #[tokio::test(start_paused = true)]
    async fn do_work_adjusts_limit() {
        let limiter = Limiter::new(Ratio::new(100, 10_000));
        let never = Cancel::never();

        // Nothing is in use, so even 150 tokens are admitted.
        let result: Result<()> =
            do_work(&never, Some(&limiter), 150, || async { (Outcome::Success, Ok(())) }).await;
        assert_eq!(result, Ok(()));
        assert_eq!(limiter.state().limit(), 150);
        assert_eq!(limiter.state().in_flight(), 0);

        // Report a capacity error.
        let result: Result<()> = do_work(&never, Some(&limiter), 10, || async {
            (Outcome::Overload, Err(TestError::Other))
        })
        .await;
        assert_eq!(result, Err(TestError::Other));
        assert_eq!(limiter.state().limit(), 135);

        limiter.acquire(&never, 35).await.unwrap();

        // Can go up to 1.1 * 135 = 148, so 114 more don't fit.
        let ran = &AtomicBool::new(false);
        let result: Result<()> = do_work(
            &Cancel::with_timeout(Duration::from_secs(1)),
            Some(&limiter),
            114,
            move || async move {
                ran.store(true, Ordering::SeqCst);
                (Outcome::Success, Err(TestError::Other))
            },
        )
        .await;
        assert_eq!(result, Err(AdmitError::DeadlineExceeded.into()));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(limiter.state().in_flight(), 35);

        // But 113 do, and prove 148 safe.
        let result: Result<()> = do_work(&never, Some(&limiter), 113, || async {
            (Outcome::Success, Err(TestError::Other))
        })
        .await;
        assert_eq!(result, Err(TestError::Other));
        assert_eq!(limiter.state().limit(), 148);
        assert_eq!(limiter.state().in_flight(), 35);

        // Can now go up to 1.1 * 148 = 162, so 127 fit.
        let result: Result<u32> =
            do_work(&never, Some(&limiter), 127, || async { (Outcome::Success, Ok(7)) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn do_work_without_policy() {
        let result: Result<u32> = do_work(&Cancel::never(), no_policy(), 1_000_000, || async {
            (Outcome::Overload, Ok(1))
        })
        .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn do_work_releases_on_panic() {
        let limiter = Arc::new(Limiter::new(Ratio::new(10, 15)));

        let task = tokio::spawn({
            let limiter = limiter.clone();
            async move {
                let seen = limiter.clone();
                do_work(&Cancel::never(), Some(&*limiter), 4, move || async move {
                    if seen.state().in_flight() == 4 {
                        panic!("work failed");
                    }
                    (Outcome::Success, Result::Ok(()))
                })
                .await
            }
        });
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(limiter.state().in_flight(), 0);
        assert_eq!(limiter.state().limit(), 9);
    }

    #[tokio::test]
    async fn do_work_releases_when_dropped() {
        let limiter = Limiter::new(Fixed::new(10));

        let never = Cancel::never();
        let work = do_work(&never, Some(&limiter), 4, || async {
            std::future::pending::<(Outcome, Result<()>)>().await
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(5), work).await;
        assert!(timed_out.is_err());
        assert_eq!(limiter.state().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_until_within_capacity() {
        let policy = &Limiter::new(Ratio::new(10, 100))
            .with_retry(Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 2.0));
        let attempts = &AtomicU32::new(0);

        let result: Result<&str> = retry(&Cancel::never(), Some(policy), 5, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            assert_eq!(policy.snapshot().map(|s| s.in_flight()), Some(5));
            if attempt < 2 {
                (CapacityStatus::OverNeedRetry, Err(TestError::Other))
            } else {
                (CapacityStatus::Within, Ok("done"))
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two overloads shrink the limit: 10 -> 9 -> 8.
        assert_eq!(policy.snapshot().map(|s| s.limit()), Some(8));
        assert_eq!(policy.snapshot().map(|s| s.in_flight()), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_does_not_retry_usable_results() {
        let policy = Limiter::new(Ratio::new(10, 100))
            .with_retry(Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 2.0));
        let attempts = &AtomicU32::new(0);

        let result: Result<&str> = retry(&Cancel::never(), Some(&policy), 5, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            (CapacityStatus::OverNoRetry, Ok("slow"))
        })
        .await;

        assert_eq!(result, Ok("slow"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(policy.snapshot().map(|s| s.limit()), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up() {
        let policy = Limiter::new(Fixed::new(10)).with_retry(MaxRetries::new(
            Backoff::new(Duration::from_millis(1), Duration::from_millis(1), 1.0),
            2,
        ));
        let attempts = &AtomicU32::new(0);

        let result: Result<()> = retry(&Cancel::never(), Some(&policy), 1, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            (CapacityStatus::OverNeedRetry, Err(TestError::Other))
        })
        .await;

        assert_eq!(result, Err(AdmitError::TooManyTries { tries: 2 }.into()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(policy.snapshot().map(|s| s.in_flight()), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_at_deadline() {
        let policy = Limiter::new(Fixed::new(10))
            .with_retry(Backoff::new(Duration::from_secs(2), Duration::from_secs(2), 1.0));

        let result: Result<()> = retry(
            &Cancel::with_timeout(Duration::from_secs(3)),
            Some(&policy),
            1,
            || async { (CapacityStatus::OverNeedRetry, Ok(())) },
        )
        .await;

        assert_eq!(
            result,
            Err(AdmitError::RetryTimeout {
                delay: Duration::from_secs(2)
            }
            .into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_cancelled_during_backoff() {
        let policy = Limiter::new(Fixed::new(10))
            .with_retry(Backoff::new(Duration::from_secs(10), Duration::from_secs(10), 1.0));
        let token = CancellationToken::new();
        let cancel = Cancel::with_token(token.clone());
        let attempts = &AtomicU32::new(0);

        let retrying = retry(&cancel, Some(&policy), 3, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            (CapacityStatus::OverNeedRetry, Result::Ok(()))
        });
        let cancelling = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            // Halfway through the backoff, nothing is held.
            assert_eq!(policy.snapshot().map(|s| s.in_flight()), Some(0));
            token.cancel();
        };

        let (result, ()): (Result<()>, ()) = tokio::join!(retrying, cancelling);
        assert_eq!(result, Err(AdmitError::Cancelled.into()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(policy.snapshot().map(|s| s.in_flight()), Some(0));
        assert_eq!(policy.snapshot().map(|s| s.limit()), Some(10));
    }

    #[tokio::test]
    async fn retry_passes_through_admission_errors() {
        let policy = Limiter::new(Fixed::new(10))
            .with_retry(Backoff::new(Duration::from_millis(1), Duration::from_millis(1), 1.0));
        policy.acquire(&Cancel::never(), 1).await.unwrap();

        let ran = &AtomicBool::new(false);
        let result: Result<()> = retry(&Cancel::never(), Some(&policy), 11, move || async move {
            ran.store(true, Ordering::SeqCst);
            (CapacityStatus::Within, Ok(()))
        })
        .await;

        assert!(matches!(
            result,
            Err(TestError::Admit(AdmitError::CapacityExceeded { .. }))
        ));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn retry_without_policy() {
        let result: Result<u32> = retry(
            &Cancel::never(),
            None::<&crate::WithRetry<Limiter<Fixed>, Backoff>>,
            1,
            || async { (CapacityStatus::OverNeedRetry, Ok(3)) },
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn retry_concurrently() {
        const N: usize = 200;

        let policy = Arc::new(Limiter::new(Ratio::new(20, 100)).with_retry(MaxRetries::new(
            Backoff::new(Duration::from_millis(1), Duration::from_millis(20), 1.5),
            20,
        )));

        let tasks: Vec<_> = (0..N)
            .map(|i| {
                let policy = policy.clone();
                tokio::spawn(async move {
                    let n = rand::thread_rng().gen_range(1..=10);
                    let mut overloaded = i % 2 == 0;
                    retry(&Cancel::never(), Some(&*policy), n, || {
                        let status = if std::mem::take(&mut overloaded) {
                            CapacityStatus::OverNeedRetry
                        } else {
                            CapacityStatus::Within
                        };
                        async move {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                            (status, Result::Ok(()))
                        }
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(policy.snapshot().map(|s| s.in_flight()), Some(0));
    }
}
