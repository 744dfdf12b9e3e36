//! Service configuration: the shared worker sections plus `[drive]`.

use anyhow::Result;
use conduit::config::{load_toml, WorkerSettings};
use serde::Deserialize;
use std::path::Path;

use crate::handlers::drive::DriveConfig;

/// Environment variable naming the TOML config file.
pub const CONFIG_PATH_ENV: &str = "WORKER_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub drive: DriveConfig,
}

impl AppConfig {
    /// Load from `WORKER_CONFIG` (defaults when unset) and the process
    /// environment.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok().filter(|p| !p.is_empty());
        Self::load(path.as_deref().map(Path::new), |name| std::env::var(name).ok())
    }

    /// File, then overrides from `lookup`, then validation.
    pub fn load(path: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config: Self = load_toml(path)?;
        config.worker.apply_overrides(&lookup);
        config.drive.apply_overrides(&lookup);
        config.worker.validate()?;
        config.drive.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit::config::BusyKeyPolicy;
    use std::io::Write;

    #[test]
    fn test_sections_share_one_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [worker]
            integration_id = "google-drive"
            busy_key_policy = "nack"

            [directory]
            encryption_key = "AAAA"

            [drive]
            page_size = 500
            "#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path()), |_| None).unwrap();
        assert_eq!(config.worker.worker.integration_id.as_deref(), Some("google-drive"));
        assert_eq!(config.worker.worker.busy_key_policy, BusyKeyPolicy::Nack);
        assert_eq!(config.drive.page_size, 500);
        assert_eq!(config.drive.max_pages, 100);
    }

    #[test]
    fn test_env_overrides_both_sections() {
        let config = AppConfig::load(None, |name| match name {
            "CONNECTIONS_ENCRYPTION_KEY" => Some("AAAA".to_string()),
            "WORKER_MAX_CONCURRENT_CONNECTIONS" => Some("4".to_string()),
            "DRIVE_API_BASE_URL" => Some("http://localhost:8089".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.worker.worker.max_concurrent_connections, 4);
        assert_eq!(config.drive.api_base_url, "http://localhost:8089");
    }

    #[test]
    fn test_invalid_drive_section_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[directory]\nencryption_key = \"AAAA\"\n\n[drive]\npage_size = 0").unwrap();
        assert!(AppConfig::load(Some(file.path()), |_| None).is_err());
    }
}
