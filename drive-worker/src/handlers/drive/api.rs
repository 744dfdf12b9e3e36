use anyhow::Context;
use conduit::resilience::ApiGuard;
use conduit::{WorkerError, WorkerResult};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::auth::{AccessToken, TokenRefresher};
use super::config::DriveConfig;

/// Fields requested for every file, on both list paths.
const FILE_FIELDS: &str = "id,name,mimeType,size,createdTime,modifiedTime,parents,webViewLink,owners,trashed";

const PERMISSION_FIELDS: &str = "id,type,role,emailAddress,domain,displayName";

const REVISION_FIELDS: &str = "id,mimeType,modifiedTime,lastModifyingUser,size,md5Checksum,keepForever";

/// Wait suggested when a rate-limit response carries no `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Owner or modifier of a Drive file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveUser {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

/// Drive file or folder metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Byte size as a decimal string; absent for folders and native docs.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub modified_time: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub web_view_link: Option<String>,
    #[serde(default)]
    pub owners: Vec<DriveUser>,
    #[serde(default)]
    pub trashed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// One `files.list` call.
#[derive(Debug, Clone)]
pub struct FileQuery<'a> {
    /// Drive search expression, e.g. `trashed = false`.
    pub q: String,
    pub page_token: Option<&'a str>,
    pub page_size: u32,
    pub include_shared_drives: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionList {
    #[serde(default)]
    pub permissions: Vec<Value>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionList {
    #[serde(default)]
    pub revisions: Vec<Value>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub change_type: Option<String>,
    #[serde(default)]
    pub file: Option<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeList {
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    /// Present on the last page; the cursor for the next incremental sync.
    #[serde(default)]
    pub new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageToken {
    start_page_token: String,
}

/// Request body for `changes/watch`.
#[derive(Debug, Clone, Serialize)]
pub struct WatchRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    pub address: String,
    pub token: String,
    /// Expiry in epoch milliseconds.
    pub expiration: i64,
}

/// Push notification channel returned by `changes/watch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub resource_id: String,
    #[serde(default)]
    pub resource_uri: Option<String>,
    /// Epoch milliseconds, as a string.
    #[serde(default)]
    pub expiration: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest<'a> {
    id: &'a str,
    resource_id: &'a str,
}

/// HTTP client for the Drive v3 REST API.
///
/// One client is shared by every invocation; the caller's [`AccessToken`] is
/// passed per call. All requests go through the provider's [`ApiGuard`]. A
/// 401 refreshes the token once and replays the request; a second 401 is a
/// terminal authentication failure.
pub struct DriveClient {
    http_client: Client,
    base_url: String,
    timeout: Duration,
    page_size: u32,
    guard: ApiGuard,
    refresher: TokenRefresher,
}

impl DriveClient {
    pub fn new(config: &DriveConfig, guard: ApiGuard) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .user_agent("drive-worker/1.0")
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build Drive HTTP client")?;
        Ok(Self {
            http_client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            timeout: config.request_timeout(),
            page_size: config.page_size,
            guard,
            refresher: TokenRefresher::new(&config.oauth, config.request_timeout())?,
        })
    }

    pub fn guard(&self) -> &ApiGuard {
        &self.guard
    }

    /// One page of non-trashed files and folders.
    pub async fn list_files(
        &self,
        token: &AccessToken,
        page_token: Option<&str>,
        include_shared_drives: bool,
    ) -> WorkerResult<FileList> {
        self.search_files(
            token,
            &FileQuery {
                q: "trashed = false".to_string(),
                page_token,
                page_size: self.page_size,
                include_shared_drives,
            },
        )
        .await
    }

    pub async fn search_files(&self, token: &AccessToken, query: &FileQuery<'_>) -> WorkerResult<FileList> {
        let mut params = vec![
            ("pageSize", query.page_size.to_string()),
            ("q", query.q.clone()),
            ("fields", format!("nextPageToken,files({})", FILE_FIELDS)),
            ("supportsAllDrives", query.include_shared_drives.to_string()),
            ("includeItemsFromAllDrives", query.include_shared_drives.to_string()),
        ];
        if let Some(page_token) = query.page_token {
            params.push(("pageToken", page_token.to_string()));
        }
        let response = self.send(token, |bearer| self.get("/files", bearer).query(&params)).await?;
        decode(response).await
    }

    /// Metadata for one file or folder.
    pub async fn get_file(&self, token: &AccessToken, file_id: &str) -> WorkerResult<DriveFile> {
        let path = format!("/files/{}", path_segment(file_id)?);
        let response = self
            .send(token, |bearer| {
                self.get(&path, bearer)
                    .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
            })
            .await?;
        decode(response).await
    }

    /// Raw bytes of a stored (non-Workspace) file.
    pub async fn download_file(&self, token: &AccessToken, file_id: &str) -> WorkerResult<Vec<u8>> {
        let path = format!("/files/{}", path_segment(file_id)?);
        let response = self
            .send(token, |bearer| {
                self.get(&path, bearer)
                    .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            })
            .await?;
        self.bytes(response).await
    }

    /// A Google Workspace document converted to `mime_type`.
    pub async fn export_file(&self, token: &AccessToken, file_id: &str, mime_type: &str) -> WorkerResult<Vec<u8>> {
        let path = format!("/files/{}/export", path_segment(file_id)?);
        let response = self
            .send(token, |bearer| self.get(&path, bearer).query(&[("mimeType", mime_type)]))
            .await?;
        self.bytes(response).await
    }

    /// One page of changes since `page_token`, at the configured page size.
    pub async fn list_changes(
        &self,
        token: &AccessToken,
        page_token: &str,
        include_shared_drives: bool,
    ) -> WorkerResult<ChangeList> {
        self.changes_page(token, page_token, self.page_size, include_shared_drives)
            .await
    }

    pub async fn changes_page(
        &self,
        token: &AccessToken,
        page_token: &str,
        page_size: u32,
        include_shared_drives: bool,
    ) -> WorkerResult<ChangeList> {
        let params = [
            ("pageToken", page_token.to_string()),
            ("pageSize", page_size.to_string()),
            (
                "fields",
                format!(
                    "nextPageToken,newStartPageToken,changes(removed,fileId,changeType,file({}))",
                    FILE_FIELDS
                ),
            ),
            ("supportsAllDrives", include_shared_drives.to_string()),
            ("includeItemsFromAllDrives", include_shared_drives.to_string()),
        ];
        let response = self.send(token, |bearer| self.get("/changes", bearer).query(&params)).await?;
        decode(response).await
    }

    /// Cursor marking "now" for change tracking.
    pub async fn get_start_page_token(&self, token: &AccessToken) -> WorkerResult<String> {
        let response = self
            .send(token, |bearer| {
                self.get("/changes/startPageToken", bearer)
                    .query(&[("supportsAllDrives", "true")])
            })
            .await?;
        let start: StartPageToken = decode(response).await?;
        Ok(start.start_page_token)
    }

    pub async fn list_permissions(
        &self,
        token: &AccessToken,
        file_id: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> WorkerResult<PermissionList> {
        let path = format!("/files/{}/permissions", path_segment(file_id)?);
        let mut params = vec![
            ("pageSize", page_size.min(100).to_string()),
            ("fields", format!("nextPageToken,permissions({})", PERMISSION_FIELDS)),
            ("supportsAllDrives", "true".to_string()),
        ];
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token.to_string()));
        }
        let response = self.send(token, |bearer| self.get(&path, bearer).query(&params)).await?;
        decode(response).await
    }

    pub async fn get_permission(&self, token: &AccessToken, file_id: &str, permission_id: &str) -> WorkerResult<Value> {
        let path = format!(
            "/files/{}/permissions/{}",
            path_segment(file_id)?,
            path_segment(permission_id)?
        );
        let response = self
            .send(token, |bearer| {
                self.get(&path, bearer)
                    .query(&[("fields", PERMISSION_FIELDS), ("supportsAllDrives", "true")])
            })
            .await?;
        decode(response).await
    }

    pub async fn list_revisions(
        &self,
        token: &AccessToken,
        file_id: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> WorkerResult<RevisionList> {
        let path = format!("/files/{}/revisions", path_segment(file_id)?);
        let mut params = vec![
            ("pageSize", page_size.min(200).to_string()),
            ("fields", format!("nextPageToken,revisions({})", REVISION_FIELDS)),
        ];
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token.to_string()));
        }
        let response = self.send(token, |bearer| self.get(&path, bearer).query(&params)).await?;
        decode(response).await
    }

    pub async fn get_revision(&self, token: &AccessToken, file_id: &str, revision_id: &str) -> WorkerResult<Value> {
        let path = format!(
            "/files/{}/revisions/{}",
            path_segment(file_id)?,
            path_segment(revision_id)?
        );
        let response = self
            .send(token, |bearer| self.get(&path, bearer).query(&[("fields", REVISION_FIELDS)]))
            .await?;
        decode(response).await
    }

    /// Account and quota information for the token's user.
    pub async fn about(&self, token: &AccessToken) -> WorkerResult<Value> {
        let response = self
            .send(token, |bearer| {
                self.get("/about", bearer)
                    .query(&[("fields", "user,storageQuota,maxUploadSize")])
            })
            .await?;
        decode(response).await
    }

    /// Open a push channel for changes after `page_token`.
    pub async fn watch_changes(
        &self,
        token: &AccessToken,
        page_token: &str,
        watch: &WatchRequest,
    ) -> WorkerResult<Channel> {
        let response = self
            .send(token, |bearer| {
                self.post("/changes/watch", bearer)
                    .query(&[("pageToken", page_token), ("supportsAllDrives", "true")])
                    .json(watch)
            })
            .await?;
        decode(response).await
    }

    pub async fn stop_channel(&self, token: &AccessToken, channel_id: &str, resource_id: &str) -> WorkerResult<()> {
        let stop = StopRequest {
            id: channel_id,
            resource_id,
        };
        self.send(token, |bearer| self.post("/channels/stop", bearer).json(&stop))
            .await
            .map(|_| ())
    }

    fn get(&self, path: &str, access_token: &str) -> RequestBuilder {
        self.http_client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(access_token)
    }

    fn post(&self, path: &str, access_token: &str) -> RequestBuilder {
        self.http_client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(access_token)
    }

    /// Send with the current token. On 401, refresh once and replay with the
    /// new token; failures of the refresh itself keep their own class.
    async fn send<F>(&self, token: &AccessToken, build: F) -> WorkerResult<Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        match self.send_guarded(build(&token.current())).await {
            Err(WorkerError::Authentication {
                message,
                requires_reauth: true,
            }) => {
                if !self.refresher.refresh(token).await? {
                    return Err(WorkerError::Authentication {
                        message,
                        requires_reauth: true,
                    });
                }
                debug!("Replaying Drive request with refreshed token");
                self.send_guarded(build(&token.current())).await.map_err(|e| match e {
                    WorkerError::Authentication { message, .. } => WorkerError::Authentication {
                        message: format!("rejected after token refresh: {}", message),
                        requires_reauth: true,
                    },
                    other => other,
                })
            }
            other => other,
        }
    }

    /// Send through the guard and map failure statuses.
    async fn send_guarded(&self, request: RequestBuilder) -> WorkerResult<Response> {
        self.guard
            .run(move || async move {
                let response = request.send().await.map_err(|e| self.transport_error(e))?;
                debug!(url = %response.url().path(), status = %response.status(), "Drive API response");
                check_response_status(response).await
            })
            .await
    }

    async fn bytes(&self, response: Response) -> WorkerResult<Vec<u8>> {
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> WorkerError {
        if e.is_timeout() {
            WorkerError::Timeout(self.timeout)
        } else {
            WorkerError::Transport(format!("Drive API request failed: {}", e))
        }
    }
}

/// Drive ids are URL-safe; anything else would change the request path.
fn path_segment(id: &str) -> WorkerResult<&str> {
    let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(id)
    } else {
        Err(WorkerError::validation_field(format!("invalid Drive id '{}'", id), "id"))
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> WorkerResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| WorkerError::Malformed(format!("Drive API response: {}", e)))
}

fn retry_after(response: &Response) -> Duration {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Pull `error.message` out of a Drive error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(500).collect())
}

/// Map failure statuses onto the error taxonomy.
///
/// - 401 → authentication (token expired or revoked)
/// - 403 with a rate-limit reason, or 429 → rate limited (`Retry-After`)
/// - other 403 → authentication (insufficient scope)
/// - 404 → not found, 400 → malformed request, other 4xx → validation
/// - 5xx → upstream (retriable)
async fn check_response_status(response: Response) -> WorkerResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let wait = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);

    let error = match status {
        StatusCode::TOO_MANY_REQUESTS => WorkerError::RateLimited {
            message,
            retry_after: Some(wait),
        },
        StatusCode::FORBIDDEN if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") => {
            WorkerError::RateLimited {
                message,
                retry_after: Some(wait),
            }
        }
        StatusCode::UNAUTHORIZED => WorkerError::Authentication {
            message,
            requires_reauth: true,
        },
        StatusCode::FORBIDDEN => WorkerError::Authentication {
            message,
            requires_reauth: false,
        },
        StatusCode::NOT_FOUND => WorkerError::NotFound(message),
        StatusCode::BAD_REQUEST => WorkerError::Malformed(message),
        s if s.is_server_error() => WorkerError::Upstream {
            status: s.as_u16(),
            message,
        },
        s => WorkerError::Validation {
            message: format!("Drive API returned {}: {}", s, message),
            field: None,
        },
    };

    if error.is_retriable() {
        warn!(status = %status, error = %error, "Drive API call failed");
    }
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::drive::auth::OAuthConfig;
    use conduit::resilience::{AdaptiveRateLimiter, BreakerConfig, BreakerState, CircuitBreaker, RateLimitConfig};
    use mockito::{Matcher, Server};
    use std::sync::Arc;

    fn guard() -> ApiGuard {
        ApiGuard::new(
            Arc::new(CircuitBreaker::new(
                "google-drive",
                BreakerConfig {
                    failure_threshold: 2,
                    ..Default::default()
                },
            )),
            Arc::new(AdaptiveRateLimiter::new(RateLimitConfig {
                initial_rate: 1000.0,
                max_rate: 1000.0,
                ..Default::default()
            })),
        )
    }

    fn client(server: &Server) -> DriveClient {
        let config = DriveConfig {
            api_base_url: server.url(),
            request_timeout_seconds: 5,
            oauth: OAuthConfig {
                token_url: format!("{}/token", server.url()),
                client_id: Some("client-1".to_string()),
                client_secret: Some("secret-1".to_string()),
            },
            ..Default::default()
        };
        DriveClient::new(&config, guard()).unwrap()
    }

    fn tok() -> AccessToken {
        AccessToken::new("tok", None)
    }

    fn refreshable() -> AccessToken {
        AccessToken::new("stale", Some("rt-1".to_string()))
    }

    async fn mock_files(server: &mut Server, bearer: &str, status: usize) -> mockito::Mock {
        server
            .mock("GET", "/files")
            .match_query(Matcher::Any)
            .match_header("authorization", format!("Bearer {}", bearer).as_str())
            .with_status(status)
            .with_body(if status == 200 {
                r#"{"files": [{"id": "f1", "name": "a.txt"}]}"#
            } else {
                r#"{"error": {"code": 401, "message": "Invalid Credentials"}}"#
            })
            .create_async()
            .await
    }

    async fn mock_token(server: &mut Server, status: usize, body: &str) -> mockito::Mock {
        server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "rt-1".into()),
            ]))
            .with_status(status)
            .with_body(body)
            .expect(1)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_list_files() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/files")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("pageToken".into(), "page-2".into()),
                Matcher::UrlEncoded("q".into(), "trashed = false".into()),
            ]))
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "nextPageToken": "page-3",
                    "files": [
                        {"id": "f1", "name": "Q4 Report.docx", "mimeType": "application/pdf", "size": "1234",
                         "owners": [{"displayName": "Alice", "emailAddress": "alice@example.com"}]},
                        {"id": "d1", "name": "Reports", "mimeType": "application/vnd.google-apps.folder"}
                    ]
                }"#,
            )
            .create_async()
            .await;

        let page = client(&server).list_files(&tok(), Some("page-2"), true).await.unwrap();
        assert_eq!(page.files.len(), 2);
        assert_eq!(page.files[0].size.as_deref(), Some("1234"));
        assert_eq!(page.files[0].owners[0].email_address.as_deref(), Some("alice@example.com"));
        assert_eq!(page.next_page_token.as_deref(), Some("page-3"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_changes_and_start_token() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/changes/startPageToken")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"startPageToken": "100"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/changes")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "100".into()))
            .with_status(200)
            .with_body(
                r#"{
                    "newStartPageToken": "101",
                    "changes": [
                        {"removed": true, "fileId": "gone"},
                        {"removed": false, "fileId": "f1", "file": {"id": "f1", "name": "a.txt"}}
                    ]
                }"#,
            )
            .create_async()
            .await;

        let client = client(&server);
        let token = client.get_start_page_token(&tok()).await.unwrap();
        assert_eq!(token, "100");
        let changes = client.list_changes(&tok(), &token, true).await.unwrap();
        assert_eq!(changes.changes.len(), 2);
        assert!(changes.changes[0].removed);
        assert_eq!(changes.new_start_page_token.as_deref(), Some("101"));
    }

    #[tokio::test]
    async fn test_401_without_refresh_token_is_terminal() {
        let mut server = Server::new_async().await;
        mock_files(&mut server, "bad", 401).await;

        let err = client(&server)
            .list_files(&AccessToken::new("bad", None), None, false)
            .await
            .unwrap_err();
        match &err {
            WorkerError::Authentication { message, requires_reauth } => {
                assert_eq!(message, "Invalid Credentials");
                assert!(requires_reauth);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_401_refreshes_and_replays() {
        let mut server = Server::new_async().await;
        let rejected = mock_files(&mut server, "stale", 401).await;
        let token_mock = mock_token(&mut server, 200, r#"{"access_token": "fresh", "expires_in": 3599}"#).await;
        let replayed = mock_files(&mut server, "fresh", 200).await;

        let token = refreshable();
        let page = client(&server).list_files(&token, None, false).await.unwrap();
        assert_eq!(page.files[0].id, "f1");
        assert_eq!(token.current(), "fresh");
        rejected.assert_async().await;
        token_mock.assert_async().await;
        replayed.assert_async().await;
    }

    #[tokio::test]
    async fn test_401_after_refresh_is_terminal() {
        let mut server = Server::new_async().await;
        mock_files(&mut server, "stale", 401).await;
        let token_mock = mock_token(&mut server, 200, r#"{"access_token": "fresh"}"#).await;
        let replayed = mock_files(&mut server, "fresh", 401).await;

        let client = client(&server);
        let token = refreshable();
        let err = client.list_files(&token, None, false).await.unwrap_err();
        assert!(matches!(err, WorkerError::Authentication { requires_reauth: true, .. }));
        assert!(!err.is_retriable());
        token_mock.assert_async().await;
        replayed.assert_async().await;

        // The refresh token is spent; a second rejection does not refresh again.
        let err = client.list_files(&token, None, false).await.unwrap_err();
        assert!(matches!(err, WorkerError::Authentication { .. }));
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_outage_is_retriable() {
        let mut server = Server::new_async().await;
        mock_files(&mut server, "stale", 401).await;
        mock_token(&mut server, 503, "unavailable").await;

        let err = client(&server)
            .list_files(&refreshable(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Upstream { status: 503, .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_get_file_and_export() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/files/doc-1")
            .match_query(Matcher::UrlEncoded("supportsAllDrives".into(), "true".into()))
            .with_status(200)
            .with_body(r#"{"id": "doc-1", "name": "Plan", "mimeType": "application/vnd.google-apps.document"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/files/doc-1/export")
            .match_query(Matcher::UrlEncoded("mimeType".into(), "text/plain".into()))
            .with_status(200)
            .with_body("plan body")
            .create_async()
            .await;
        server
            .mock("GET", "/files/bin-1")
            .match_query(Matcher::UrlEncoded("alt".into(), "media".into()))
            .with_status(200)
            .with_body(vec![0u8, 159, 146, 150])
            .create_async()
            .await;

        let client = client(&server);
        let file = client.get_file(&tok(), "doc-1").await.unwrap();
        assert_eq!(file.name.as_deref(), Some("Plan"));
        let body = client.export_file(&tok(), "doc-1", "text/plain").await.unwrap();
        assert_eq!(body, b"plan body");
        let raw = client.download_file(&tok(), "bin-1").await.unwrap();
        assert_eq!(raw, vec![0u8, 159, 146, 150]);
    }

    #[tokio::test]
    async fn test_ids_cannot_escape_path() {
        let server = Server::new_async().await;
        let err = client(&server).get_file(&tok(), "../about").await.unwrap_err();
        assert!(matches!(err, WorkerError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_permissions_and_revisions() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/files/f1/permissions")
            .match_query(Matcher::UrlEncoded("pageSize".into(), "100".into()))
            .with_status(200)
            .with_body(r#"{"permissions": [{"id": "p1", "role": "writer"}], "nextPageToken": "n"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/files/f1/revisions/r1")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"id": "r1", "size": "10"}"#)
            .create_async()
            .await;

        let client = client(&server);
        let perms = client.list_permissions(&tok(), "f1", None, 500).await.unwrap();
        assert_eq!(perms.permissions[0]["role"], "writer");
        assert_eq!(perms.next_page_token.as_deref(), Some("n"));
        let revision = client.get_revision(&tok(), "f1", "r1").await.unwrap();
        assert_eq!(revision["size"], "10");
    }

    #[tokio::test]
    async fn test_429_carries_retry_after() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/files")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "12")
            .create_async()
            .await;

        let client = client(&server);
        let before = client.guard().limiter().current_rate();
        let err = client.list_files(&tok(), None, false).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert!(client.guard().limiter().current_rate() < before);
    }

    #[tokio::test]
    async fn test_403_rate_limit_reason() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/files")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error": {"errors": [{"reason": "userRateLimitExceeded"}], "message": "slow down"}}"#)
            .create_async()
            .await;

        let err = client(&server).list_files(&tok(), None, false).await.unwrap_err();
        assert!(matches!(err, WorkerError::RateLimited { .. }));
        assert_eq!(err.retry_after(), Some(DEFAULT_RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_client_errors_map_to_terminal_kinds() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/channels/stop")
            .with_status(404)
            .with_body(r#"{"error": {"message": "Channel not found"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/changes")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body("bad token")
            .create_async()
            .await;

        let client = client(&server);
        let err = client.stop_channel(&tok(), "ch-1", "res-1").await.unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
        let err = client.list_changes(&tok(), "garbage", false).await.unwrap_err();
        assert!(matches!(err, WorkerError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_server_errors_open_breaker() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/files")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let client = client(&server);
        for _ in 0..2 {
            let err = client.list_files(&tok(), None, false).await.unwrap_err();
            assert!(matches!(err, WorkerError::Upstream { status: 503, .. }));
        }
        assert_eq!(client.guard().breaker().state(), BreakerState::Open);

        let err = client.list_files(&tok(), None, false).await.unwrap_err();
        assert!(matches!(err, WorkerError::BreakerOpen { .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_watch_changes() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/changes/watch")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "100".into()))
            .match_body(Matcher::PartialJsonString(
                r#"{"id": "ch-1", "type": "web_hook", "address": "https://hooks.example.com/drive"}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"id": "ch-1", "resourceId": "res-1", "expiration": "1700000000000"}"#)
            .create_async()
            .await;

        let channel = client(&server)
            .watch_changes(
                &tok(),
                "100",
                &WatchRequest {
                    id: "ch-1".to_string(),
                    channel_type: "web_hook".to_string(),
                    address: "https://hooks.example.com/drive".to_string(),
                    token: "verify".to_string(),
                    expiration: 1_700_000_000_000,
                },
            )
            .await
            .unwrap();
        assert_eq!(channel.resource_id, "res-1");
        assert_eq!(channel.expiration.as_deref(), Some("1700000000000"));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(r#"{"error": {"message": "nope"}}"#), "nope");
        assert_eq!(error_message("plain text"), "plain text");
    }
}
