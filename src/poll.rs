//! Poll-until-converged primitive
//!
//! Re-evaluates an async predicate at a fixed interval until it returns
//! `Ok(true)`. An `Err` from the predicate ends the wait immediately; there is
//! no retry on error. The primitive has no intrinsic bound, so every caller
//! supplies a [`CancellationToken`] and may add a deadline.
//!
//! # Example
//!
//! ```ignore
//! use kube_testrun::poll::poll_until;
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! let cancel = CancellationToken::new();
//!
//! poll_until(&cancel, || async { is_gone(&api, &kind, &obj).await })
//!     .interval(Duration::from_millis(500))
//!     .timeout(Some(Duration::from_secs(60)))
//!     .await_condition()
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default interval between predicate evaluations
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Error type for poll operations
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("wait cancelled after {attempts} attempts over {elapsed:?}")]
    Cancelled { attempts: u32, elapsed: Duration },

    #[error("condition not met within {timeout:?} ({attempts} attempts)")]
    DeadlineExceeded { attempts: u32, timeout: Duration },

    #[error(transparent)]
    Predicate(E),
}

/// Cancellation, interval and deadline shared by every wait in a run
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub cancel: CancellationToken,
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl WaitOptions {
    /// Default interval, no deadline
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            interval: DEFAULT_INTERVAL,
            timeout: None,
        }
    }

    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Start a wait configured from these options
    pub fn poll<F, Fut, E>(&self, condition: F) -> PollUntil<'_, F>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        poll_until(&self.cancel, condition)
            .interval(self.interval)
            .timeout(self.timeout)
    }
}

/// Builder for a poll-until wait
pub struct PollUntil<'a, F> {
    condition: F,
    cancel: &'a CancellationToken,
    interval: Duration,
    timeout: Option<Duration>,
}

/// Create a wait that retries `condition` until it returns `Ok(true)`
///
/// Default interval: 1 second. No timeout unless one is set.
pub fn poll_until<F, Fut, E>(cancel: &CancellationToken, condition: F) -> PollUntil<'_, F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    PollUntil {
        condition,
        cancel,
        interval: DEFAULT_INTERVAL,
        timeout: None,
    }
}

impl<F, Fut, E> PollUntil<'_, F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    /// Set the polling interval
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Give up once `timeout` has elapsed (`None` waits indefinitely)
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the wait
    pub async fn await_condition(mut self) -> Result<(), PollError<E>> {
        let start = Instant::now();
        let deadline = self.timeout.map(|t| start + t);
        let mut attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PollError::Cancelled {
                    attempts,
                    elapsed: start.elapsed(),
                });
            }

            attempts += 1;
            let met = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return Err(PollError::Cancelled { attempts, elapsed: start.elapsed() });
                }
                () = expiry(deadline) => {
                    return Err(self.exceeded(attempts));
                }
                result = (self.condition)() => result.map_err(PollError::Predicate)?,
            };

            if met {
                debug!(attempts, elapsed = ?start.elapsed(), "Condition met");
                return Ok(());
            }

            debug!(
                attempts,
                interval = ?self.interval,
                "Condition not met, retrying"
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return Err(PollError::Cancelled { attempts, elapsed: start.elapsed() });
                }
                () = expiry(deadline) => {
                    return Err(self.exceeded(attempts));
                }
                () = sleep(self.interval) => {}
            }
        }
    }

    fn exceeded(&self, attempts: u32) -> PollError<E> {
        PollError::DeadlineExceeded {
            attempts,
            timeout: self.timeout.unwrap_or_default(),
        }
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    type Never = std::convert::Infallible;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_immediately() {
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let result = poll_until(&cancel, || async { Ok::<_, Never>(true) })
            .await_condition()
            .await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_at_fixed_interval() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let start = Instant::now();

        let result = poll_until(&cancel, move || {
            let c = counter_clone.clone();
            async move { Ok::<_, Never>(c.fetch_add(1, Ordering::SeqCst) >= 3) }
        })
        .await_condition()
        .await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        // Three failed checks, one default interval after each
        assert_eq!(start.elapsed(), DEFAULT_INTERVAL * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_interval() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let start = Instant::now();

        poll_until(&cancel, move || {
            let c = counter_clone.clone();
            async move { Ok::<_, Never>(c.fetch_add(1, Ordering::SeqCst) >= 1) }
        })
        .interval(Duration::from_millis(10))
        .await_condition()
        .await
        .unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_error_propagates_without_retry() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = poll_until(&cancel, move || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<bool, _>(std::io::Error::other("boom"))
            }
        })
        .await_condition()
        .await;

        match result {
            Err(PollError::Predicate(e)) => assert_eq!(e.to_string(), "boom"),
            other => panic!("expected Predicate error, got {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_a_false_predicate() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result = poll_until(&cancel, || async { Ok::<_, Never>(false) })
            .await_condition()
            .await;

        match result {
            Err(PollError::Cancelled { attempts, .. }) => assert!(attempts >= 5),
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_never_evaluates() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = poll_until(&cancel, move || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Never>(true)
            }
        })
        .await_condition()
        .await;

        assert!(matches!(result, Err(PollError::Cancelled { attempts: 0, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_options_apply_interval_and_deadline() {
        let options = WaitOptions::new(CancellationToken::new())
            .interval(Duration::from_millis(100))
            .timeout(Some(Duration::from_millis(250)));

        let result = options
            .poll(|| async { Ok::<_, Never>(false) })
            .await_condition()
            .await;

        match result {
            Err(PollError::DeadlineExceeded { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected DeadlineExceeded, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let cancel = CancellationToken::new();

        let result = poll_until(&cancel, || async { Ok::<_, Never>(false) })
            .timeout(Some(Duration::from_millis(3500)))
            .await_condition()
            .await;

        match result {
            Err(PollError::DeadlineExceeded { attempts, timeout }) => {
                assert_eq!(attempts, 4);
                assert_eq!(timeout, Duration::from_millis(3500));
            }
            other => panic!("expected DeadlineExceeded, got {other:?}"),
        }
    }
}
