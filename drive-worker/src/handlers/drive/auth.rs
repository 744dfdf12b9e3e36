//! OAuth access-token refresh for the Drive API.
//!
//! ```text
//!   DriveClient::send ──401──▶ TokenRefresher::refresh ──▶ POST {token_url}
//!          ▲                                                (refresh_token grant)
//!          └──────────────── replay once with the new token ────┘
//! ```
//!
//! A refreshed token lives in the invocation's [`AccessToken`] only; it is
//! not written back to the connection directory.

use anyhow::{Context, Result};
use conduit::connections::ConnectionContext;
use conduit::{WorkerError, WorkerResult};
use parking_lot::Mutex;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// `[drive.oauth]` section. The client id and secret are the fallback for
/// connections whose settings carry none; with neither, refresh is disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn default_token_url() -> String {
    TOKEN_URL.to_string()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            client_id: None,
            client_secret: None,
        }
    }
}

impl OAuthConfig {
    /// `GOOGLE_OAUTH_TOKEN_URL`, `GOOGLE_OAUTH_CLIENT_ID`, `GOOGLE_OAUTH_CLIENT_SECRET`.
    pub fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(url) = non_empty("GOOGLE_OAUTH_TOKEN_URL") {
            self.token_url = url;
        }
        if let Some(id) = non_empty("GOOGLE_OAUTH_CLIENT_ID") {
            self.client_id = Some(id);
        }
        if let Some(secret) = non_empty("GOOGLE_OAUTH_CLIENT_SECRET") {
            self.client_secret = Some(secret);
        }
    }

    fn client(&self) -> Option<OAuthClient> {
        OAuthClient::new(self.client_id.as_deref()?, self.client_secret.as_deref()?)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct OAuthClient {
    id: String,
    secret: String,
}

impl OAuthClient {
    fn new(id: &str, secret: &str) -> Option<Self> {
        (!id.is_empty() && !secret.is_empty()).then(|| Self {
            id: id.to_string(),
            secret: secret.to_string(),
        })
    }
}

/// Bearer token for one handler invocation, refreshable at most once.
pub struct AccessToken {
    current: Mutex<String>,
    refresh_token: Option<String>,
    client: Option<OAuthClient>,
    refreshed: AtomicBool,
}

impl AccessToken {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            current: Mutex::new(access_token.into()),
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            client: None,
            refreshed: AtomicBool::new(false),
        }
    }

    /// Token for a resolved connection. `client_id` and `client_secret` in
    /// the connection's settings take precedence over `[drive.oauth]`.
    pub fn for_connection(ctx: &ConnectionContext) -> Self {
        let setting = |name: &str| ctx.settings.get(name).and_then(Value::as_str);
        let mut token = Self::new(
            ctx.credentials.access_token.clone(),
            ctx.credentials.refresh_token.clone(),
        );
        if let (Some(id), Some(secret)) = (setting("client_id"), setting("client_secret")) {
            token.client = OAuthClient::new(id, secret);
        }
        token
    }

    pub fn current(&self) -> String {
        self.current.lock().clone()
    }

    /// Refresh token, if this invocation has not yet used it.
    fn take_refresh(&self) -> Option<&str> {
        let token = self.refresh_token.as_deref()?;
        if self.refreshed.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(token)
    }

    fn replace(&self, access_token: String) {
        *self.current.lock() = access_token;
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct TokenError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchanges refresh tokens for fresh access tokens.
pub struct TokenRefresher {
    http_client: Client,
    token_url: String,
    default_client: Option<OAuthClient>,
    timeout: Duration,
}

impl TokenRefresher {
    pub fn new(config: &OAuthConfig, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build OAuth HTTP client")?;
        Ok(Self {
            http_client,
            token_url: config.token_url.clone(),
            default_client: config.client(),
            timeout,
        })
    }

    /// Refresh `token` in place if it still has an unused refresh token and
    /// client credentials are known. Returns `Ok(false)` when no refresh was
    /// possible.
    pub async fn refresh(&self, token: &AccessToken) -> WorkerResult<bool> {
        let Some(client) = token.client.as_ref().or(self.default_client.as_ref()) else {
            return Ok(false);
        };
        let Some(refresh_token) = token.take_refresh() else {
            return Ok(false);
        };
        let fresh = self.exchange(client, refresh_token).await?;
        token.replace(fresh);
        Ok(true)
    }

    /// Map token-endpoint statuses the same way as Drive's: rejected grants
    /// are terminal, throttling and server errors stay retriable.
    async fn exchange(&self, client: &OAuthClient, refresh_token: &str) -> WorkerResult<String> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.id.as_str()),
            ("client_secret", client.secret.as_str()),
        ];
        let response = self
            .http_client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WorkerError::Timeout(self.timeout)
                } else {
                    WorkerError::Transport(format!("OAuth token refresh failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let body: TokenResponse = response
                .json()
                .await
                .map_err(|e| WorkerError::Malformed(format!("OAuth token response: {}", e)))?;
            return match body.access_token.filter(|t| !t.is_empty()) {
                Some(access_token) => {
                    info!(expires_in = ?body.expires_in, "Access token refreshed");
                    Ok(access_token)
                }
                None => Err(WorkerError::Authentication {
                    message: "token refresh response missing access_token".to_string(),
                    requires_reauth: true,
                }),
            };
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<TokenError>(&text)
            .ok()
            .and_then(|e| e.error_description.or(e.error))
            .unwrap_or(text);

        let error = match status {
            StatusCode::TOO_MANY_REQUESTS => WorkerError::RateLimited {
                message: format!("token endpoint throttled: {}", detail),
                retry_after,
            },
            s if s.is_server_error() => WorkerError::Upstream {
                status: s.as_u16(),
                message: format!("token endpoint: {}", detail),
            },
            _ => WorkerError::Authentication {
                message: format!("token refresh failed: {}", detail),
                requires_reauth: true,
            },
        };
        warn!(status = %status, error = %error, "OAuth token refresh failed");
        Err(error)
    }
}
