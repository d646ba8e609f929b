use std::future::Future;
use std::time::Duration;

use crate::{AppError, Result};

/// Upper bound for a server-requested `Retry-After` wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base_delay * 2^(attempt - 1)`
    Exponential,
    Fixed,
}

/// Bounded retry loop: how many attempts, how long to wait and which errors are worth retrying.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
    pub is_retryable: fn(&AppError) -> bool,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff: Backoff::Exponential,
            is_retryable: AppError::is_retryable,
        }
    }

    /// Fixed delay, every error retried.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            backoff: Backoff::Fixed,
            is_retryable: |_| true,
        }
    }

    pub fn with_classifier(mut self, is_retryable: fn(&AppError) -> bool) -> Self {
        self.is_retryable = is_retryable;
        self
    }

    /// Wait before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor)
            }
        }
    }

    fn delay_after(&self, attempt: u32, err: &AppError) -> Duration {
        let backoff = self.delay_for(attempt);
        match err {
            AppError::SlackRateLimit { retry_after_secs } => {
                backoff.max(Duration::from_secs(*retry_after_secs).min(MAX_RETRY_AFTER))
            }
            _ => backoff,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the attempts run out.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && (self.is_retryable)(&err) => {
                    let delay = self.delay_after(attempt, &err);
                    tracing::warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delays_double() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_fixed_delays_do_not_grow() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(5), Duration::from_millis(50));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::exponential(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_rate_limit_honours_retry_after() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(10));
        let err = AppError::SlackRateLimit {
            retry_after_secs: 2,
        };
        assert_eq!(policy.delay_after(1, &err), Duration::from_secs(2));
        let err = AppError::SlackRateLimit {
            retry_after_secs: 3600,
        };
        assert_eq!(policy.delay_after(1, &err), MAX_RETRY_AFTER);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(4, Duration::from_secs(1));
        let result = policy
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(AppError::Http("boom".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1));
        let err = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AppError::SlackRateLimit { retry_after_secs: 0 }) }
            })
            .await
            .unwrap_err();
        assert!(err.is_rate_limit());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_fatal_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(5, Duration::ZERO);
        let err = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AppError::Auth("invalid_auth".into())) }
            })
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fixed_policy_retries_everything() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let _ = policy
            .run("write", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AppError::Validation("nope".into())) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
