//! Self-tuning request pacing.
//!
//! A single shared rate (requests/second) that grows slowly on success and
//! drops sharply whenever the upstream signals a rate limit. `acquire` is a
//! voluntary pause, not a concurrency gate: concurrent callers each sleep
//! `1 / rate` independently.

use crate::error::{WorkerError, WorkerResult};
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_initial_rate")]
    pub initial_rate: f64,
    #[serde(default = "default_min_rate")]
    pub min_rate: f64,
    #[serde(default = "default_max_rate")]
    pub max_rate: f64,
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,
}

fn default_initial_rate() -> f64 {
    10.0
}

fn default_min_rate() -> f64 {
    0.1
}

fn default_max_rate() -> f64 {
    100.0
}

fn default_decrease_factor() -> f64 {
    0.5
}

fn default_increase_factor() -> f64 {
    1.1
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_rate: default_initial_rate(),
            min_rate: default_min_rate(),
            max_rate: default_max_rate(),
            decrease_factor: default_decrease_factor(),
            increase_factor: default_increase_factor(),
        }
    }
}

pub struct AdaptiveRateLimiter {
    config: RateLimitConfig,
    current_rate: Mutex<f64>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let initial = config.initial_rate.clamp(config.min_rate, config.max_rate);
        Self {
            config,
            current_rate: Mutex::new(initial),
        }
    }

    pub fn current_rate(&self) -> f64 {
        *self.current_rate.lock()
    }

    pub fn record_success(&self) {
        let mut rate = self.current_rate.lock();
        *rate = (*rate * self.config.increase_factor).min(self.config.max_rate);
    }

    pub fn record_rate_limit_signal(&self) {
        let mut rate = self.current_rate.lock();
        *rate = (*rate * self.config.decrease_factor).max(self.config.min_rate);
        debug!(rate = *rate, "Rate limit signal, slowing down");
    }

    /// Pause before the next request, or `None` when the rate is zero or so
    /// close to zero that the wait does not fit in a `Duration`.
    pub fn delay(&self) -> Option<Duration> {
        let rate = self.current_rate();
        if rate > 0.0 && rate.is_finite() {
            Duration::try_from_secs_f64(1.0 / rate).ok()
        } else {
            None
        }
    }

    /// Sleep for the pacing delay.
    ///
    /// Fails with [`WorkerError::Paused`] instead of waiting forever when the
    /// rate is zero. Dropping the returned future cancels the sleep.
    pub async fn acquire(&self) -> WorkerResult<()> {
        match self.delay() {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Err(WorkerError::Paused),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn limiter(initial: f64, min: f64, max: f64) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(RateLimitConfig {
            initial_rate: initial,
            min_rate: min,
            max_rate: max,
            ..Default::default()
        })
    }

    #[test]
    fn test_success_increases_up_to_max() {
        let l = limiter(10.0, 0.1, 12.0);
        l.record_success();
        assert!((l.current_rate() - 11.0).abs() < 1e-9);
        l.record_success();
        l.record_success();
        assert_eq!(l.current_rate(), 12.0);
    }

    #[test]
    fn test_rate_limit_signal_halves_down_to_min() {
        let l = limiter(10.0, 2.0, 100.0);
        l.record_rate_limit_signal();
        assert_eq!(l.current_rate(), 5.0);
        l.record_rate_limit_signal();
        l.record_rate_limit_signal();
        assert_eq!(l.current_rate(), 2.0);
    }

    #[test]
    fn test_zero_rate_is_infinite_delay() {
        let l = limiter(0.0, 0.0, 100.0);
        assert_eq!(l.delay(), None);
    }

    #[tokio::test]
    async fn test_decay_toward_zero_floor_pauses() {
        let l = limiter(10.0, 0.0, 100.0);
        for _ in 0..80 {
            l.record_rate_limit_signal();
        }
        assert!(l.current_rate() > 0.0);
        assert_eq!(l.delay(), None);
        let err = l.acquire().await.unwrap_err();
        assert!(matches!(err, WorkerError::Paused));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_sleeps_inverse_rate() {
        let l = limiter(10.0, 0.1, 100.0);
        let start = Instant::now();
        l.acquire().await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(110));
    }

    #[tokio::test]
    async fn test_acquire_at_zero_rate_is_paused() {
        let l = limiter(0.0, 0.0, 1.0);
        let err = l.acquire().await.unwrap_err();
        assert!(matches!(err, WorkerError::Paused));
    }
}
