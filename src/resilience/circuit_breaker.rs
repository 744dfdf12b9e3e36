//! Three-state circuit breaker keyed by call-site.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │  recovery_timeout elapsed,
//!     │ trial succeeds                 │  next call attempt
//!     │                                ▼
//!     └──────────────────────────── HalfOpen
//!                 trial fails ──▶ Open
//! ```
//!
//! While Open no call reaches the guarded function; the caller gets
//! [`WorkerError::BreakerOpen`]. Only errors accepted by the breaker's
//! failure filter move the state machine, everything else passes through.

use crate::error::{WorkerError, WorkerResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Clone, Debug, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_seconds")]
    pub recovery_timeout_seconds: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_seconds() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout_seconds(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Decides which errors count against the breaker.
pub type FailureFilter = Arc<dyn Fn(&WorkerError) -> bool + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub half_open_in_flight: u32,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
    /// Bumped on every entry into HalfOpen so stale trials can't release
    /// slots belonging to a later recovery window.
    generation: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    filter: FailureFilter,
    inner: Mutex<Inner>,
}

/// Admission ticket for one guarded call. Dropping it without settling
/// (the call was cancelled) frees its half-open trial slot.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.trial.take() {
            self.breaker.release_trial(generation);
        }
    }
}

impl CircuitBreaker {
    /// Breaker that counts upstream-health failures
    /// ([`WorkerError::is_upstream_failure`]).
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_filter(name, config, Arc::new(WorkerError::is_upstream_failure))
    }

    pub fn with_filter(name: impl Into<String>, config: BreakerConfig, filter: FailureFilter) -> Self {
        Self {
            name: name.into(),
            config,
            filter,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_in_flight: 0,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_in_flight: inner.half_open_in_flight,
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Errors from `f` are always returned unchanged; the breaker only
    /// records them.
    pub async fn call<F, Fut, T>(&self, f: F) -> WorkerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WorkerResult<T>>,
    {
        let mut admission = self.admit()?;
        let result = f().await;

        let trial = admission.trial.take();
        match &result {
            Ok(_) => self.on_success(),
            Err(e) if (self.filter)(e) => self.on_failure(e),
            Err(_) => {
                if let Some(generation) = trial {
                    self.release_trial(generation);
                }
            }
        }
        result
    }

    fn admit(&self) -> WorkerResult<Admission<'_>> {
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::Open {
            let cooled = inner
                .last_failure
                .map(|at| at.elapsed() >= self.config.recovery_timeout())
                .unwrap_or(true);
            if !cooled {
                return Err(self.open_error());
            }
            inner.state = BreakerState::HalfOpen;
            inner.half_open_in_flight = 0;
            inner.generation += 1;
            info!(breaker = %self.name, "Circuit breaker half-open, admitting trials");
        }

        match inner.state {
            BreakerState::Closed => Ok(Admission {
                breaker: self,
                trial: None,
            }),
            BreakerState::HalfOpen if inner.half_open_in_flight < self.config.half_open_max_calls => {
                inner.half_open_in_flight += 1;
                Ok(Admission {
                    breaker: self,
                    trial: Some(inner.generation),
                })
            }
            _ => Err(self.open_error()),
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.last_failure = None;
                inner.half_open_in_flight = 0;
                info!(breaker = %self.name, "Circuit breaker closed after successful trial");
            }
            // A call admitted before the breaker tripped; it says nothing
            // about recovery.
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self, error: &WorkerError) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            BreakerState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = BreakerState::Open;
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    error = %error,
                    "Circuit breaker opened"
                );
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.half_open_in_flight = 0;
                warn!(breaker = %self.name, error = %error, "Trial failed, circuit breaker re-opened");
            }
            _ => {}
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen && inner.generation == generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn open_error(&self) -> WorkerError {
        WorkerError::BreakerOpen {
            name: self.name.clone(),
        }
    }
}
