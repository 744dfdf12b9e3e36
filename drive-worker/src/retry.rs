//! Bounded retry around one handler invocation.
//!
//! Only retriable errors are retried. A rate-limit hint from the upstream
//! overrides the computed backoff for that attempt and restarts the backoff
//! sequence. Sleeps are plain `tokio::time::sleep`, so dropping the future
//! (shutdown, outer timeout) cancels them.

use conduit::config::RetryConfig;
use conduit::metrics::WorkerMetrics;
use conduit::resilience::{BackoffConfig, ExponentialBackoff};
use conduit::WorkerResult;
use std::future::Future;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffConfig) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Policy that never retries.
    pub fn once() -> Self {
        Self::new(1, BackoffConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.backoff.clone())
    }
}

/// Run `op` until it succeeds, fails terminally, or runs out of attempts.
/// `op` receives the 1-based attempt number. The last error is returned
/// unchanged.
pub async fn run_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    metrics: &WorkerMetrics,
    mut op: F,
) -> WorkerResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = WorkerResult<T>>,
{
    let mut backoff = ExponentialBackoff::new(policy.backoff.clone());
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && attempt < policy.max_attempts => {
                let delay = match e.retry_after() {
                    Some(hint) => {
                        backoff.reset();
                        hint
                    }
                    None => backoff.next_delay(),
                };
                warn!(
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retriable failure, retry scheduled"
                );
                metrics.record_retry();
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit::WorkerError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            BackoffConfig {
                base_delay_seconds: 1.0,
                max_delay_seconds: 30.0,
                multiplier: 2.0,
                jitter: false,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let metrics = WorkerMetrics::new();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = run_with_retry(&policy(3), &metrics, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(WorkerError::Transport("reset".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(metrics.snapshot().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_not_retried() {
        let metrics = WorkerMetrics::new();
        let calls = AtomicU32::new(0);
        let result: WorkerResult<()> = run_with_retry(&policy(5), &metrics, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WorkerError::validation("bad trigger")) }
        })
        .await;

        assert!(matches!(result, Err(WorkerError::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.snapshot().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let metrics = WorkerMetrics::new();
        let attempts = AtomicU32::new(0);
        let result: WorkerResult<()> = run_with_retry(&policy(3), &metrics, |attempt| {
            attempts.store(attempt, Ordering::SeqCst);
            async move {
                Err(WorkerError::Upstream {
                    status: 503,
                    message: format!("attempt {}", attempt),
                })
            }
        })
        .await;

        match result {
            Err(WorkerError::Upstream { message, .. }) => assert_eq!(message, "attempt 3"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_overrides_backoff() {
        let metrics = WorkerMetrics::new();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = run_with_retry(&policy(2), &metrics, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(WorkerError::rate_limited(Some(Duration::from_secs(7))))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_future_cancels_backoff_sleep() {
        let metrics = WorkerMetrics::new();
        let long = RetryPolicy::new(
            2,
            BackoffConfig {
                base_delay_seconds: 3600.0,
                max_delay_seconds: 3600.0,
                multiplier: 1.0,
                jitter: false,
            },
        );
        let retrying = run_with_retry(&long, &metrics, |_| async {
            Err::<(), _>(WorkerError::Transport("down".to_string()))
        });

        let outcome = tokio::time::timeout(Duration::from_secs(1), retrying).await;
        assert!(outcome.is_err());
        assert_eq!(metrics.snapshot().retries, 1);
    }

    #[test]
    fn test_policy_from_config_floors_attempts() {
        let config = RetryConfig {
            max_attempts: 0,
            backoff: BackoffConfig::default(),
        };
        assert_eq!(RetryPolicy::from(&config).max_attempts, 1);
    }
}
