//! Retry policy for per-item fetches.
//!
//! Transient failures are retried with exponential back-off. Authorization
//! failures are returned straight away so the session can be invalidated.

use crate::error::FetchError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// How often, and how patiently, a failed fetch is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based), or `None` when the
    /// policy gives up.
    pub fn next_delay(&self, retry: u32, error: &FetchError) -> Option<Duration> {
        if !error.is_retryable() || retry >= self.max_retries {
            return None;
        }
        let exp = 1u32 << retry.min(16);
        Some(self.base_delay.saturating_mul(exp).min(self.max_delay))
    }

    /// Run `op` until it succeeds or the policy gives up.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.next_delay(retry, &err) {
                    Some(delay) => {
                        debug!(
                            "Attempt {}/{} failed ({}), retrying in {:?}",
                            retry + 1,
                            self.max_attempts(),
                            err,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> FetchError {
        FetchError::Transport("connection reset".to_string())
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.next_delay(0, &transient()), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(1, &transient()), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(2, &transient()), Some(Duration::from_millis(300)));
        assert_eq!(policy.next_delay(3, &transient()), None);
    }

    #[test]
    fn test_auth_errors_never_delay() {
        let err = FetchError::from_status(403, "http://api", "");
        assert_eq!(RetryPolicy::default().next_delay(0, &err), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_until_success() {
        let calls = &AtomicU32::new(0);
        let result = RetryPolicy::default()
            .run(|| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(5u64)
                }
            })
            .await;

        assert_eq!(result, Ok(5));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_retries() {
        let calls = &AtomicU32::new(0);
        let result: Result<u64, _> = RetryPolicy::default()
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert_eq!(result, Err(transient()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_auth() {
        let calls = &AtomicU32::new(0);
        let result: Result<u64, _> = RetryPolicy::default()
            .run(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::from_status(401, "http://api", ""))
            })
            .await;

        assert!(result.unwrap_err().is_auth());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
