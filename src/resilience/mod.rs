//! Resilience primitives for upstream API calls.
//!
//! ```text
//!   handler ──▶ ApiGuard::run ──▶ CircuitBreaker ──▶ AdaptiveRateLimiter ──▶ upstream
//!                                    (gate)              (pacing)
//! ```
//!
//! None of these swallow errors. They either return the guarded call's
//! error unchanged or raise their own signal (`BreakerOpen`, `Paused`).

pub mod adaptive;
pub mod backoff;
pub mod circuit_breaker;

pub use adaptive::{AdaptiveRateLimiter, RateLimitConfig};
pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};

use crate::error::{WorkerError, WorkerResult};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;

/// One breaker per call-site name, created lazily.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

/// Breaker plus pacing for one upstream API, shared by every invocation
/// that talks to it.
#[derive(Clone)]
pub struct ApiGuard {
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<AdaptiveRateLimiter>,
}

impl ApiGuard {
    pub fn new(breaker: Arc<CircuitBreaker>, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        Self { breaker, limiter }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    /// Gate on the breaker, pace, then call. Rate-limit responses slow the
    /// limiter down; successes speed it back up.
    pub async fn run<F, Fut, T>(&self, f: F) -> WorkerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WorkerResult<T>>,
    {
        let limiter = &self.limiter;
        let result = self
            .breaker
            .call(|| async move {
                limiter.acquire().await?;
                f().await
            })
            .await;

        match &result {
            Ok(_) => self.limiter.record_success(),
            Err(WorkerError::RateLimited { .. }) => self.limiter.record_rate_limit_signal(),
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn guard() -> ApiGuard {
        ApiGuard::new(
            Arc::new(CircuitBreaker::new(
                "drive",
                BreakerConfig {
                    failure_threshold: 2,
                    ..Default::default()
                },
            )),
            Arc::new(AdaptiveRateLimiter::new(RateLimitConfig::default())),
        )
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.get_or_create("drive");
        let b = registry.get_or_create("drive");
        assert!(Arc::ptr_eq(&a, &b));
        registry.get_or_create("control_plane");
        let names: Vec<_> = registry.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["control_plane", "drive"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_slows_limiter() {
        let g = guard();
        let err = g
            .run(|| async { Err::<(), _>(WorkerError::rate_limited(Some(Duration::from_secs(1)))) })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::RateLimited { .. }));
        assert_eq!(g.limiter().current_rate(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_trips_breaker() {
        let g = guard();
        for _ in 0..2 {
            g.run(|| async { Err::<(), _>(WorkerError::Transport("down".to_string())) })
                .await
                .unwrap_err();
        }
        assert_eq!(g.breaker().state(), BreakerState::Open);
        let err = g.run(|| async { Ok(1) }).await.unwrap_err();
        assert!(matches!(err, WorkerError::BreakerOpen { .. }));
    }
}
