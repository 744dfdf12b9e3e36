//! Failure taxonomy for message processing.
//!
//! Every error raised while handling an inbound message is a [`WorkerError`].
//! The variant decides the [`ErrorClass`]; the orchestration loop only reads
//! that tag and never re-classifies.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Whether a failure may succeed if the whole message is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retriable,
    Terminal,
}

/// Classified processing error.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Network-level failure talking to an upstream or collaborator.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Upstream answered with a 5xx status.
    #[error("upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    /// Upstream asked us to slow down. `retry_after` is the server's hint.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The circuit breaker guarding `name` rejected the call without running it.
    #[error("circuit breaker '{name}' is open")]
    BreakerOpen { name: String },

    /// The adaptive rate limiter is at zero requests per second.
    #[error("request pacing paused (rate is zero)")]
    Paused,

    /// The surrounding invocation was cancelled (worker shutdown).
    #[error("processing cancelled")]
    Cancelled,

    /// Publishing to the outbound bus failed.
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Credentials were rejected (after the refresh attempt, if any).
    #[error("authentication failed: {message}")]
    Authentication {
        message: String,
        requires_reauth: bool,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Request or payload could not be understood.
    #[error("malformed: {0}")]
    Malformed(String),

    /// No connection exists for an external identifier.
    #[error("no connection registered for external id '{external_id}'")]
    UnresolvableIdentity { external_id: String },

    /// Anything not raised by a recognised component.
    #[error("unexpected error: {0:#}")]
    Unexpected(#[from] anyhow::Error),
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: "rate limit exceeded".to_string(),
            retry_after,
        }
    }

    /// Classification is a property of the kind, never of the call-site.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(_)
            | Self::Timeout(_)
            | Self::Upstream { .. }
            | Self::RateLimited { .. }
            | Self::BreakerOpen { .. }
            | Self::Paused
            | Self::Cancelled
            | Self::Publish(_) => ErrorClass::Retriable,
            Self::Validation { .. }
            | Self::Authentication { .. }
            | Self::NotFound(_)
            | Self::Malformed(_)
            | Self::UnresolvableIdentity { .. }
            | Self::Unexpected(_) => ErrorClass::Terminal,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Retriable
    }

    /// Stable snake_case name used on the error channel.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Upstream { .. } => "upstream",
            Self::RateLimited { .. } => "rate_limited",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Publish(_) => "publish",
            Self::Validation { .. } => "validation",
            Self::Authentication { .. } => "authentication",
            Self::NotFound(_) => "not_found",
            Self::Malformed(_) => "malformed",
            Self::UnresolvableIdentity { .. } => "unresolvable_identity",
            Self::Unexpected(_) => "unexpected",
        }
    }

    /// Server-supplied wait hint, if this is a rate-limit signal carrying one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// True for failures that indicate the upstream itself is unhealthy.
    ///
    /// This is the default failure filter for circuit breakers: a 404 or a
    /// validation error says nothing about the health of the API.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::Upstream { .. } | Self::RateLimited { .. }
        )
    }

    /// Structured details carried onto the error channel.
    pub fn details(&self) -> Map<String, Value> {
        let value = match self {
            Self::Timeout(after) => json!({ "timeout_ms": after.as_millis() as u64 }),
            Self::Upstream { status, .. } => json!({ "status": status }),
            Self::RateLimited { retry_after, .. } => {
                json!({ "retry_after": retry_after.map(|d| d.as_secs()) })
            }
            Self::BreakerOpen { name } => json!({ "breaker": name }),
            Self::Validation { field, .. } => json!({ "field": field }),
            Self::Authentication {
                requires_reauth, ..
            } => json!({ "requires_reauth": requires_reauth }),
            Self::UnresolvableIdentity { external_id } => json!({ "external_id": external_id }),
            _ => json!({}),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}
