//! HTTP client for the control plane's connection endpoints.
//!
//! - `GET {base}/connections/{id}` → [`ConnectionContext`]
//! - `GET {base}/connections/resolve?external_id=...` → [`ConnectionResolution`]

use super::{ConnectionContext, ConnectionDirectory, ConnectionResolution};
use crate::error::{WorkerError, WorkerResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug, Deserialize)]
pub struct ControlPlaneConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    10
}

pub struct ControlPlaneDirectory {
    client: Client,
    config: ControlPlaneConfig,
}

impl ControlPlaneDirectory {
    pub fn new(config: ControlPlaneConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build control plane HTTP client")?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, url: String) -> WorkerResult<Response> {
        let mut request = self.client.get(&url);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }
        debug!(url = %url, "Control plane request");
        request.send().await.map_err(transport_error)
    }
}

fn transport_error(e: reqwest::Error) -> WorkerError {
    if e.is_timeout() {
        WorkerError::Timeout(Duration::ZERO)
    } else {
        WorkerError::Transport(format!("control plane: {}", e))
    }
}

/// Map a non-404 failure status onto the error taxonomy.
fn status_error(status: StatusCode, body: String) -> WorkerError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => WorkerError::Authentication {
            message: format!("control plane rejected worker credentials: {}", body),
            requires_reauth: false,
        },
        StatusCode::TOO_MANY_REQUESTS => WorkerError::rate_limited(None),
        s if s.is_server_error() => WorkerError::Upstream {
            status: s.as_u16(),
            message: body,
        },
        s => WorkerError::Validation {
            message: format!("control plane returned {}: {}", s, body),
            field: None,
        },
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> WorkerResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| WorkerError::Malformed(format!("control plane response: {}", e)))
}

#[async_trait]
impl ConnectionDirectory for ControlPlaneDirectory {
    async fn fetch_connection_config(&self, connection_id: &str) -> WorkerResult<ConnectionContext> {
        let url = self.url(&format!("/connections/{}", urlencoding::encode(connection_id)));
        let response = self.get(url).await?;
        match response.status() {
            s if s.is_success() => decode(response).await,
            StatusCode::NOT_FOUND => Err(WorkerError::NotFound(format!("connection '{}'", connection_id))),
            s => Err(status_error(s, response.text().await.unwrap_or_default())),
        }
    }

    async fn resolve_by_external_id(&self, external_id: &str) -> WorkerResult<Option<ConnectionResolution>> {
        let url = self.url(&format!(
            "/connections/resolve?external_id={}",
            urlencoding::encode(external_id)
        ));
        let response = self.get(url).await?;
        match response.status() {
            s if s.is_success() => decode(response).await.map(Some),
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(status_error(s, response.text().await.unwrap_or_default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(server: &mockito::Server) -> ControlPlaneDirectory {
        ControlPlaneDirectory::new(ControlPlaneConfig {
            base_url: server.url(),
            api_token: Some("worker-token".to_string()),
            timeout_seconds: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_connection_config() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/connections/conn-1")
            .match_header("authorization", "Bearer worker-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"connection_id":"conn-1","customer_id":"cust-1","provider":"drive",
                    "credentials":{"access_token":"tok"},"settings":{"sync_files":true}}"#,
            )
            .create_async()
            .await;

        let ctx = directory(&server).fetch_connection_config("conn-1").await.unwrap();
        assert_eq!(ctx.customer_id, "cust-1");
        assert_eq!(ctx.credentials.access_token, "tok");
        assert!(ctx.setting_bool("sync_files", false));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_resolve_not_found_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/connections/resolve?external_id=ghost%40example.com")
            .with_status(404)
            .create_async()
            .await;

        let resolved = directory(&server).resolve_by_external_id("ghost@example.com").await.unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_retriable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/connections/conn-1")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let err = directory(&server).fetch_connection_config("conn-1").await.unwrap_err();
        assert!(matches!(err, WorkerError::Upstream { status: 503, .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_unknown_connection_is_terminal() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/connections/gone").with_status(404).create_async().await;

        let err = directory(&server).fetch_connection_config("gone").await.unwrap_err();
        assert!(!err.is_retriable());
    }
}
