//! Exponential backoff delay generator.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Jitter perturbs each delay uniformly within this fraction of its value.
const JITTER_FRACTION: f64 = 0.25;

/// Exponents past this point have long since saturated `max_delay`.
const MAX_EXPONENT: u32 = 1024;

#[derive(Clone, Debug, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay_seconds")]
    pub base_delay_seconds: f64,
    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_base_delay_seconds() -> f64 {
    1.0
}

fn default_max_delay_seconds() -> f64 {
    60.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: default_base_delay_seconds(),
            max_delay_seconds: default_max_delay_seconds(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Stateful delay sequence: `min(base * multiplier^attempt, max)`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the delay for the current attempt and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay for attempt `n` without touching the internal counter.
    pub fn delay_for_attempt(&self, n: u32) -> Duration {
        let max = self.config.max_delay_seconds.max(0.0);
        let raw = self.config.base_delay_seconds * self.config.multiplier.powi(n.min(MAX_EXPONENT) as i32);
        let capped = if raw.is_finite() { raw.clamp(0.0, max) } else { max };

        let seconds = if self.config.jitter {
            let factor = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
            (capped * (1.0 + factor)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(seconds)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base: f64, multiplier: f64, max: f64) -> ExponentialBackoff {
        ExponentialBackoff::new(BackoffConfig {
            base_delay_seconds: base,
            max_delay_seconds: max,
            multiplier,
            jitter: false,
        })
    }

    #[test]
    fn test_sequence_doubles_then_caps() {
        let mut backoff = no_jitter(1.0, 2.0, 30.0);
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_sequence_non_decreasing() {
        let backoff = no_jitter(0.5, 1.7, 45.0);
        let mut previous = Duration::ZERO;
        for n in 0..40 {
            let d = backoff.delay_for_attempt(n);
            assert!(d >= previous);
            assert!(d <= Duration::from_secs(45));
            previous = d;
        }
    }

    #[test]
    fn test_delay_for_attempt_is_pure() {
        let backoff = no_jitter(1.0, 2.0, 60.0);
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = no_jitter(1.0, 2.0, 60.0);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_huge_attempt_saturates_at_max() {
        let backoff = no_jitter(1.0, 10.0, 60.0);
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let backoff = ExponentialBackoff::new(BackoffConfig {
            base_delay_seconds: 4.0,
            max_delay_seconds: 60.0,
            multiplier: 2.0,
            jitter: true,
        });
        for _ in 0..200 {
            let d = backoff.delay_for_attempt(1).as_secs_f64();
            assert!((6.0..=10.0).contains(&d), "delay {} outside jitter band", d);
        }
    }
}
