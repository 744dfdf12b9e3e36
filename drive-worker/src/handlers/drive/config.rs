use anyhow::{bail, Result};
use serde::Deserialize;
use std::time::Duration;

use super::auth::OAuthConfig;

/// Provider name used in routes, record keys and the breaker name.
pub const PROVIDER: &str = "google-drive";

pub const BASE_URL: &str = "https://www.googleapis.com/drive/v3";

/// Mime type Drive uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// `[drive]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DriveConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Items per list call (Drive caps this at 1000).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Upper bound on pages fetched by one sync invocation.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Lifetime requested for push channels (Drive allows at most 24h).
    #[serde(default = "default_channel_ttl_hours")]
    pub channel_ttl_hours: i64,
    /// Files larger than this are fetched as metadata only.
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: u64,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

fn default_api_base_url() -> String {
    BASE_URL.to_string()
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_page_size() -> u32 {
    100
}

fn default_max_pages() -> u32 {
    100
}

fn default_channel_ttl_hours() -> i64 {
    23
}

fn default_max_content_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            request_timeout_seconds: default_request_timeout_seconds(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            channel_ttl_hours: default_channel_ttl_hours(),
            max_content_bytes: default_max_content_bytes(),
            oauth: OAuthConfig::default(),
        }
    }
}

impl DriveConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// `DRIVE_API_BASE_URL` overrides the API endpoint; OAuth client
    /// settings come from the `GOOGLE_OAUTH_*` variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DRIVE_API_BASE_URL").filter(|u| !u.is_empty()) {
            self.api_base_url = url;
        }
        self.oauth.apply_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > 1000 {
            bail!("drive.page_size must be between 1 and 1000 (got {})", self.page_size);
        }
        if self.max_pages == 0 {
            bail!("drive.max_pages must be >= 1");
        }
        if !(1..=24).contains(&self.channel_ttl_hours) {
            bail!("drive.channel_ttl_hours must be between 1 and 24");
        }
        if self.oauth.token_url.is_empty() {
            bail!("drive.oauth.token_url must not be empty");
        }
        Ok(())
    }
}
