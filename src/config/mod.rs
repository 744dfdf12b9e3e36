//! Worker configuration.
//!
//! Loaded from the TOML file named by `WORKER_CONFIG` (defaults when unset),
//! then environment overrides (see [`env`]), then validated. Every section
//! and field is optional.

pub mod env;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::blob::BlobConfig;
pub use crate::connections::ControlPlaneConfig;
pub use crate::idempotency::IdempotencyConfig;
pub use crate::nats::NatsConfig;
pub use crate::resilience::{BackoffConfig, BreakerConfig, RateLimitConfig};
pub use crate::telemetry::LoggingConfig;

use crate::bus::{TOPIC_DATA, TOPIC_ERRORS, TOPIC_TRIGGER, TOPIC_WEBHOOK};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerSettings {
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// What to do with a delivery whose connection is already being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyKeyPolicy {
    /// Leave it unacknowledged; the bus redelivers after its ack wait.
    Skip,
    /// Negatively acknowledge for prompt redelivery.
    Nack,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Messages naming a different integration are dropped. `None` accepts all.
    #[serde(default)]
    pub integration_id: Option<String>,
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
    #[serde(default = "default_processing_timeout_seconds")]
    pub processing_timeout_seconds: u64,
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "default_busy_key_policy")]
    pub busy_key_policy: BusyKeyPolicy,
    /// Redelivery delay requested when a busy delivery is nacked.
    #[serde(default = "default_busy_nack_delay_ms")]
    pub busy_nack_delay_ms: u64,
    #[serde(default)]
    pub topics: TopicConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_inbound_topics")]
    pub inbound: Vec<String>,
    #[serde(default = "default_data_topic")]
    pub data: String,
    #[serde(default = "default_error_topic")]
    pub errors: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(flatten)]
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_resolver_max_size")]
    pub max_size: usize,
    #[serde(default = "default_resolver_ttl_seconds")]
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryBackend {
    Sqlite,
    ControlPlane,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_directory_backend")]
    pub backend: DirectoryBackend,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Base64 32-byte key; required for the sqlite backend.
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default)]
    pub control_plane: Option<ControlPlaneConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_bind")]
    pub bind: String,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_max_concurrent_connections() -> usize {
    10
}

fn default_processing_timeout_seconds() -> u64 {
    300
}

fn default_poll_batch_size() -> usize {
    100
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_busy_nack_delay_ms() -> u64 {
    1000
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

fn default_busy_key_policy() -> BusyKeyPolicy {
    BusyKeyPolicy::Skip
}

fn default_inbound_topics() -> Vec<String> {
    vec![TOPIC_TRIGGER.to_string(), TOPIC_WEBHOOK.to_string()]
}

fn default_data_topic() -> String {
    TOPIC_DATA.to_string()
}

fn default_error_topic() -> String {
    TOPIC_ERRORS.to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_resolver_max_size() -> usize {
    1000
}

fn default_resolver_ttl_seconds() -> u64 {
    300
}

fn default_directory_backend() -> DirectoryBackend {
    DirectoryBackend::Sqlite
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/connections.db")
}

fn default_health_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_health_port() -> u16 {
    8080
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            integration_id: None,
            max_concurrent_connections: default_max_concurrent_connections(),
            processing_timeout_seconds: default_processing_timeout_seconds(),
            poll_batch_size: default_poll_batch_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            busy_key_policy: default_busy_key_policy(),
            busy_nack_delay_ms: default_busy_nack_delay_ms(),
            topics: TopicConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_seconds)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn busy_nack_delay(&self) -> Duration {
        Duration::from_millis(self.busy_nack_delay_ms)
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            inbound: default_inbound_topics(),
            data: default_data_topic(),
            errors: default_error_topic(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_size: default_resolver_max_size(),
            ttl_seconds: default_resolver_ttl_seconds(),
        }
    }
}

impl ResolverConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            backend: default_directory_backend(),
            db_path: default_db_path(),
            encryption_key: None,
            control_plane: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            bind: default_health_bind(),
            port: default_health_port(),
        }
    }
}

/// Parse a TOML file into `T`, or `T::default()` when `path` is `None`.
pub fn load_toml<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&contents).with_context(|| format!("Invalid config file {}", path.display()))
        }
        None => Ok(T::default()),
    }
}

impl WorkerSettings {
    /// File, then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings: Self = load_toml(path)?;
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.max_concurrent_connections < 1 {
            bail!("worker.max_concurrent_connections must be at least 1");
        }
        if self.worker.poll_batch_size < 1 {
            bail!("worker.poll_batch_size must be at least 1");
        }
        if self.retry.max_attempts < 1 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff.base_delay_seconds < 0.0 || self.retry.backoff.max_delay_seconds < 0.0 {
            bail!("retry delays must not be negative");
        }
        if self.idempotency.max_size < 1 {
            bail!("idempotency.max_size must be at least 1");
        }
        if self.resolver.max_size < 1 {
            bail!("resolver.max_size must be at least 1");
        }
        if self.breaker.failure_threshold < 1 {
            bail!("breaker.failure_threshold must be at least 1");
        }
        if self.breaker.half_open_max_calls < 1 {
            bail!("breaker.half_open_max_calls must be at least 1");
        }
        let rate = &self.rate_limit;
        if !(rate.min_rate <= rate.initial_rate && rate.initial_rate <= rate.max_rate) {
            bail!(
                "rate_limit must satisfy min_rate <= initial_rate <= max_rate (got {} / {} / {})",
                rate.min_rate,
                rate.initial_rate,
                rate.max_rate
            );
        }
        match self.directory.backend {
            DirectoryBackend::Sqlite if self.directory.encryption_key.is_none() => {
                bail!("directory.encryption_key (or CONNECTIONS_ENCRYPTION_KEY) is required for the sqlite backend")
            }
            DirectoryBackend::ControlPlane if self.directory.control_plane.is_none() => {
                bail!("directory.control_plane (or CONTROL_PLANE_URL) is required for the control_plane backend")
            }
            _ => Ok(()),
        }
    }
}
