//! Bounded retry with exponential backoff
//!
//! Every retry path in the engine goes through [`retry`]: a fixed attempt
//! budget, a per-attempt timeout, and a final failure that is marked
//! persistent so outer layers do not retry it again.

use crate::error::{self, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry budget for one kind of call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Timeout applied to each attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Single attempt with the given timeout
    pub fn once(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            attempt_timeout,
        }
    }

    /// Backoff before the given retry (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(error::timeout(operation, policy.attempt_timeout.as_secs_f64())),
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err.with_operation(operation));
        }
        if attempt >= attempts {
            return Err(err
                .persist()
                .with_operation(operation)
                .with_context("attempts", attempt.to_string()));
        }

        let delay = policy.backoff(attempt);
        debug!(operation, attempt, ?delay, error = %err, "retrying after transient failure");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ErrorStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = fast_policy(5);
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(9), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast_policy(3), "test::op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(error::network_failed("flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&fast_policy(5), "test::op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(error::backend_failed("bad request", false)) }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_persists() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&fast_policy(3), "test::op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(error::rate_limited("429")) }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.status(), ErrorStatus::Persistent);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_surfaces_as_timeout() {
        let policy = RetryPolicy::once(Duration::from_millis(50));
        let result: Result<()> = retry(&policy, "test::slow", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.status(), ErrorStatus::Persistent);
    }
}
