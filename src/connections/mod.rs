//! Connection configuration and external-identity lookup.
//!
//! ```text
//!            ConnectionDirectory (trait)
//!             ├── ConnectionStore        SQLite, tokens sealed with AES-256-GCM
//!             └── ControlPlaneDirectory  HTTP lookups against the control plane
//! ```
//!
//! Contexts are fetched fresh for every message and owned by the handler
//! invocation that asked for them. Caching of external-id resolutions is the
//! resolver's job, not the directory's.

use crate::error::WorkerResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod control_plane;
mod encryption;
mod store;

pub use control_plane::{ControlPlaneConfig, ControlPlaneDirectory};
pub use encryption::TokenCipher;
pub use store::ConnectionStore;

/// OAuth tokens for one upstream account.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Resolved configuration for one upstream account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionContext {
    pub connection_id: String,
    pub customer_id: String,
    #[serde(default)]
    pub integration_id: Option<String>,
    pub provider: String,
    /// Account identifier known to the provider (for drive, the user's email).
    #[serde(default)]
    pub external_id: Option<String>,
    pub credentials: Credentials,
    /// Feature flags such as which resource kinds to sync.
    #[serde(default)]
    pub settings: Map<String, Value>,
    /// Provider-specific continuation cursor.
    #[serde(default)]
    pub cursor: Option<Value>,
}

impl ConnectionContext {
    /// Context built from an external-id resolution. Settings and cursor are
    /// left empty; resolutions only carry identity and credentials.
    pub fn from_resolution(resolution: ConnectionResolution, provider: &str) -> Self {
        Self {
            connection_id: resolution.connection_id,
            customer_id: resolution.customer_id,
            integration_id: None,
            provider: provider.to_string(),
            external_id: Some(resolution.external_id),
            credentials: resolution.credentials,
            settings: Map::new(),
            cursor: None,
        }
    }

    pub fn setting_bool(&self, name: &str, default: bool) -> bool {
        self.settings.get(name).and_then(Value::as_bool).unwrap_or(default)
    }
}

/// Outcome of mapping an external identifier to a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionResolution {
    pub external_id: String,
    pub connection_id: String,
    pub customer_id: String,
    pub credentials: Credentials,
    /// Which collaborator answered (`store`, `control_plane`, ...).
    pub resolved_via: String,
    pub resolved_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConnectionDirectory: Send + Sync {
    /// Full context for a known connection. Unknown ids are `NotFound`.
    async fn fetch_connection_config(&self, connection_id: &str) -> WorkerResult<ConnectionContext>;

    /// `Ok(None)` means no connection exists for that identity.
    async fn resolve_by_external_id(&self, external_id: &str) -> WorkerResult<Option<ConnectionResolution>>;
}
