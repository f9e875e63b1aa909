//! Bounded retries for upstream calls.

use std::future::Future;
use std::time::Duration;

use super::upstream::UpstreamError;

/// Exponential delay between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// The delay before the first retry
    pub delay: Duration,

    /// The factor applied to the delay after each retry
    pub exponent: u32,

    /// The longest delay ever waited
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(200),
            exponent: 2,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Create a new backoff policy.
    pub fn new(delay: Duration, exponent: u32, max_delay: Duration) -> Self {
        Self {
            delay,
            exponent,
            max_delay,
        }
    }

    /// The backoff for the next retry, capped at `max_delay`.
    pub fn increment(&self) -> Self {
        let delay = self
            .delay
            .checked_mul(self.exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        Self {
            delay,
            exponent: self.exponent,
            max_delay: self.max_delay,
        }
    }
}

/// How upstream calls are retried.
///
/// The timeout bounds each attempt on its own; a timed out attempt counts as
/// a transient failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: usize,
    /// Limit on a single attempt.
    pub timeout: Duration,
    /// Delay between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(30),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Run `call` until it succeeds, fails fatally, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let attempts = self.attempts.max(1);
        let mut backoff = self.backoff.clone();
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(self.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Transient(format!(
                    "{what} timed out after {:?}",
                    self.timeout
                ))),
            };

            match result {
                Err(err) if err.is_transient() && attempt < attempts => {
                    tracing::debug!(what, attempt, delay = ?backoff.delay, error = %err, "retrying upstream call");
                    tokio::time::sleep(backoff.delay).await;
                    backoff = backoff.increment();
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::warn!(what, attempts, error = %err, "upstream call failed after retries");
                    }
                    return Err(err);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn policy(attempts: usize) -> RetryPolicy {
        RetryPolicy {
            attempts,
            timeout: Duration::from_secs(1),
            backoff: Backoff::new(Duration::from_millis(10), 2, Duration::from_millis(30)),
        }
    }

    #[test]
    fn backoff_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(10), 2, Duration::from_millis(30));
        let delays: Vec<_> = std::iter::successors(Some(backoff), |b| Some(b.increment()))
            .take(4)
            .map(|b| b.delay.as_millis())
            .collect();
        assert_eq!(delays, [10, 20, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = policy(3)
            .run("fetch", move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(UpstreamError::Transient("503".into())),
                    _ => Ok(7),
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy(2)
            .run("fetch", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::Transient("503".into()))
            })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy(5)
            .run("fetch", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::Fatal("403".into()))
            })
            .await;

        assert!(!result.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn each_attempt_has_its_own_timeout() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = policy(2)
            .run("fetch", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok("done")
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
