//! Environment variable overrides.
//!
//! | Variable | Field |
//! |---|---|
//! | `NATS_URL` | `nats.url` |
//! | `WORKER_INTEGRATION_ID` | `worker.integration_id` |
//! | `WORKER_MAX_CONCURRENT_CONNECTIONS` | `worker.max_concurrent_connections` |
//! | `WORKER_PROCESSING_TIMEOUT_SECONDS` | `worker.processing_timeout_seconds` |
//! | `WORKER_BUSY_KEY_POLICY` | `worker.busy_key_policy` |
//! | `WORKER_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `LOG_LEVEL` / `LOG_FORMAT` | `logging.level` / `logging.format` |
//! | `HEALTH_PORT` | `health.port` |
//! | `CONNECTIONS_DB` | `directory.db_path` |
//! | `CONNECTIONS_ENCRYPTION_KEY` | `directory.encryption_key` |
//! | `CONTROL_PLANE_URL` | `directory.control_plane.base_url` (selects that backend) |
//! | `CONTROL_PLANE_TOKEN` | `directory.control_plane.api_token` |
//!
//! Unparseable values are ignored with a warning.

use super::{BusyKeyPolicy, ControlPlaneConfig, DirectoryBackend, WorkerSettings};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

impl FromStr for BusyKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "nack" => Ok(Self::Nack),
            other => Err(format!("unknown busy key policy '{}'", other)),
        }
    }
}

impl WorkerSettings {
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("NATS_URL") {
            self.nats.url = url;
        }
        if let Some(id) = lookup("WORKER_INTEGRATION_ID") {
            self.worker.integration_id = Some(id).filter(|s| !s.is_empty());
        }
        if let Some(n) = parsed(&lookup, "WORKER_MAX_CONCURRENT_CONNECTIONS") {
            self.worker.max_concurrent_connections = n;
        }
        if let Some(n) = parsed(&lookup, "WORKER_PROCESSING_TIMEOUT_SECONDS") {
            self.worker.processing_timeout_seconds = n;
        }
        if let Some(policy) = parsed(&lookup, "WORKER_BUSY_KEY_POLICY") {
            self.worker.busy_key_policy = policy;
        }
        if let Some(n) = parsed(&lookup, "WORKER_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = n;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = parsed(&lookup, "LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(port) = parsed(&lookup, "HEALTH_PORT") {
            self.health.port = port;
        }
        if let Some(path) = lookup("CONNECTIONS_DB") {
            self.directory.db_path = PathBuf::from(path);
        }
        if let Some(key) = lookup("CONNECTIONS_ENCRYPTION_KEY") {
            self.directory.encryption_key = Some(key);
        }
        if let Some(url) = lookup("CONTROL_PLANE_URL") {
            let control_plane = self.directory.control_plane.get_or_insert_with(|| ControlPlaneConfig {
                base_url: String::new(),
                api_token: None,
                timeout_seconds: 10,
            });
            control_plane.base_url = url;
            self.directory.backend = DirectoryBackend::ControlPlane;
        }
        if let Some(token) = lookup("CONTROL_PLANE_TOKEN") {
            if let Some(control_plane) = self.directory.control_plane.as_mut() {
                control_plane.api_token = Some(token);
            }
        }
    }
}
