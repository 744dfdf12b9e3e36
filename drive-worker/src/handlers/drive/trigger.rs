use async_trait::async_trait;
use conduit::connections::ConnectionContext;
use conduit::{RecordBuilder, WorkerError, WorkerResult};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::api::{DriveClient, DriveFile};
use super::auth::AccessToken;
use super::config::PROVIDER;
use super::method_routes;
use super::transformer::{file_record, is_folder, SyncSource};
use crate::handler::{Handler, RecordSink, Route};
use conduit::bus::TOPIC_TRIGGER;
use crate::message::MessageBody;

pub const METHOD: &str = "integration.sync.trigger";

/// Which resource kinds a sync emits. Message parameters override the
/// connection's stored settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub sync_files: bool,
    pub sync_folders: bool,
    pub include_shared_drives: bool,
}

impl SyncSettings {
    pub fn resolve(body: &MessageBody, ctx: &ConnectionContext) -> Self {
        let flag = |name: &str| body.param_bool(name).unwrap_or_else(|| ctx.setting_bool(name, true));
        Self {
            sync_files: flag("sync_files"),
            sync_folders: flag("sync_folders"),
            include_shared_drives: flag("include_shared_drives"),
        }
    }

    pub fn wants(&self, file: &DriveFile) -> bool {
        if is_folder(file) {
            self.sync_folders
        } else {
            self.sync_files
        }
    }
}

/// Page token to resume from: the message's `last_cursor` (an object with
/// `page_token`, or a bare string), else the connection's stored cursor.
pub fn cursor_page_token<'a>(body: &'a MessageBody, ctx: &'a ConnectionContext) -> Option<&'a str> {
    fn token(value: &Value) -> Option<&str> {
        match value {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("page_token").and_then(Value::as_str),
            _ => None,
        }
    }
    body.last_cursor()
        .and_then(token)
        .or_else(|| ctx.cursor.as_ref().and_then(token))
        .filter(|t| !t.is_empty())
}

/// Scheduled or on-demand sync: full listing or change feed.
pub struct TriggerHandler {
    client: Arc<DriveClient>,
    builder: RecordBuilder,
    max_pages: u32,
}

impl TriggerHandler {
    pub fn new(client: Arc<DriveClient>, builder: RecordBuilder, max_pages: u32) -> Self {
        Self {
            client,
            builder,
            max_pages: max_pages.max(1),
        }
    }

    async fn full_sync(
        &self,
        token: &AccessToken,
        ctx: &ConnectionContext,
        settings: SyncSettings,
        sink: &dyn RecordSink,
    ) -> WorkerResult<usize> {
        let mut page_token: Option<String> = None;
        let mut emitted = 0;

        for page in 1..=self.max_pages {
            let listing = self
                .client
                .list_files(token, page_token.as_deref(), settings.include_shared_drives)
                .await?;
            for file in listing.files.iter().filter(|f| settings.wants(f)) {
                sink.emit(file_record(&self.builder, ctx, file, SyncSource::FullSync).await?).await?;
                emitted += 1;
            }
            debug!(connection_id = %ctx.connection_id, page = page, files = listing.files.len(), "Listed files page");

            page_token = listing.next_page_token;
            if page_token.is_none() {
                return Ok(emitted);
            }
        }

        warn!(
            connection_id = %ctx.connection_id,
            max_pages = self.max_pages,
            "Full sync stopped at page limit"
        );
        Ok(emitted)
    }

    async fn incremental_sync(
        &self,
        token: &AccessToken,
        body: &MessageBody,
        ctx: &ConnectionContext,
        settings: SyncSettings,
        sink: &dyn RecordSink,
    ) -> WorkerResult<usize> {
        let mut page_token = match cursor_page_token(body, ctx) {
            Some(t) => t.to_string(),
            None => {
                let start = self.client.get_start_page_token(token).await?;
                info!(connection_id = %ctx.connection_id, "No cursor, starting change tracking from now");
                start
            }
        };
        let mut emitted = 0;

        for _ in 0..self.max_pages {
            let changes = self
                .client
                .list_changes(token, &page_token, settings.include_shared_drives)
                .await?;
            for change in &changes.changes {
                if change.removed {
                    debug!(file_id = ?change.file_id, "Skipping removed file");
                    continue;
                }
                let Some(file) = &change.file else { continue };
                if !settings.wants(file) {
                    continue;
                }
                sink.emit(file_record(&self.builder, ctx, file, SyncSource::Incremental).await?).await?;
                emitted += 1;
            }

            match changes.next_page_token {
                Some(next) => page_token = next,
                None => {
                    if let Some(cursor) = changes.new_start_page_token {
                        info!(connection_id = %ctx.connection_id, next_cursor = %cursor, "Change feed drained");
                    }
                    return Ok(emitted);
                }
            }
        }

        warn!(
            connection_id = %ctx.connection_id,
            max_pages = self.max_pages,
            resume_from = %page_token,
            "Incremental sync stopped at page limit"
        );
        Ok(emitted)
    }
}

#[async_trait]
impl Handler for TriggerHandler {
    fn name(&self) -> &str {
        "drive.trigger"
    }

    fn routes(&self) -> Vec<Route> {
        let mut routes = method_routes(METHOD);
        routes.push(Route::action("trigger", Some(PROVIDER)));
        routes.push(Route::topic(TOPIC_TRIGGER, Some(PROVIDER)));
        routes
    }

    async fn handle(&self, body: &MessageBody, ctx: &ConnectionContext, sink: &dyn RecordSink) -> WorkerResult<()> {
        let settings = SyncSettings::resolve(body, ctx);
        let trigger_type = body
            .trigger_type()
            .ok_or_else(|| WorkerError::validation_field("trigger_type is required", "trigger_type"))?;

        let token = AccessToken::for_connection(ctx);
        let emitted = match trigger_type {
            "full_sync" => self.full_sync(&token, ctx, settings, sink).await?,
            "incremental" | "poll" => self.incremental_sync(&token, body, ctx, settings, sink).await?,
            other => {
                return Err(WorkerError::validation_field(
                    format!("unknown trigger type '{}'", other),
                    "trigger_type",
                ))
            }
        };

        info!(
            connection_id = %ctx.connection_id,
            trigger_type = trigger_type,
            records = emitted,
            "Sync finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::CollectingSink;
    use crate::handlers::drive::testing::{client, ctx};
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn handler(server: &Server) -> TriggerHandler {
        TriggerHandler::new(client(server), RecordBuilder::new(PROVIDER), 10)
    }

    fn body(value: Value) -> MessageBody {
        MessageBody::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_full_sync_pages_and_filters() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/files")
            .match_query(Matcher::Regex("includeItemsFromAllDrives=true$".to_string()))
            .with_status(200)
            .with_body(
                r#"{"nextPageToken": "p2", "files": [
                    {"id": "f1", "mimeType": "application/pdf"},
                    {"id": "d1", "mimeType": "application/vnd.google-apps.folder"}
                ]}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/files")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
            .with_status(200)
            .with_body(r#"{"files": [{"id": "f2", "mimeType": "text/plain"}]}"#)
            .create_async()
            .await;

        let sink = CollectingSink::new();
        let msg = body(json!({
            "method": METHOD,
            "trigger_type": "full_sync",
            "config": {"sync_folders": false}
        }));
        handler(&server).handle(&msg, &ctx(), &sink).await.unwrap();

        let ids: Vec<_> = sink.records().into_iter().map(|r| r.resource_id).collect();
        assert_eq!(ids, vec!["f1", "f2"]);
    }

    #[tokio::test]
    async fn test_incremental_skips_removed_and_bare_changes() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/changes")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "42".into()))
            .with_status(200)
            .with_body(
                r#"{"newStartPageToken": "43", "changes": [
                    {"removed": true, "fileId": "gone"},
                    {"removed": false, "fileId": "nofile"},
                    {"removed": false, "fileId": "f1", "file": {"id": "f1", "mimeType": "application/pdf"}}
                ]}"#,
            )
            .create_async()
            .await;

        let sink = CollectingSink::new();
        let msg = body(json!({"trigger_type": "incremental", "last_cursor": {"page_token": "42"}}));
        handler(&server).handle(&msg, &ctx(), &sink).await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resource_id, "f1");
        assert_eq!(records[0].metadata["sync_source"], "incremental");
    }

    #[tokio::test]
    async fn test_incremental_without_cursor_fetches_start_token() {
        let mut server = Server::new_async().await;
        let start = server
            .mock("GET", "/changes/startPageToken")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"startPageToken": "7"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/changes")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "7".into()))
            .with_status(200)
            .with_body(r#"{"newStartPageToken": "7", "changes": []}"#)
            .create_async()
            .await;

        let sink = CollectingSink::new();
        let msg = body(json!({"trigger_type": "poll"}));
        handler(&server).handle(&msg, &ctx(), &sink).await.unwrap();
        start.assert_async().await;
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_trigger_type_is_validation_error() {
        let server = Server::new_async().await;
        let sink = CollectingSink::new();
        let err = handler(&server)
            .handle(&body(json!({"trigger_type": "everything"})), &ctx(), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Validation { .. }));

        let err = handler(&server).handle(&body(json!({})), &ctx(), &sink).await.unwrap_err();
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_cursor_sources() {
        let mut context = ctx();
        context.cursor = Some(json!({"page_token": "stored"}));
        assert_eq!(cursor_page_token(&body(json!({"last_cursor": "msg"})), &context), Some("msg"));
        assert_eq!(cursor_page_token(&body(json!({})), &context), Some("stored"));
        context.cursor = None;
        assert_eq!(cursor_page_token(&body(json!({"last_cursor": null})), &context), None);
    }

    #[test]
    fn test_settings_precedence() {
        let mut context = ctx();
        context.settings.insert("sync_files".to_string(), json!(false));
        let settings = SyncSettings::resolve(&body(json!({"params": {"include_shared_drives": false}})), &context);
        assert!(!settings.sync_files);
        assert!(settings.sync_folders);
        assert!(!settings.include_shared_drives);
    }
}
