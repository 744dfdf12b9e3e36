use async_trait::async_trait;
use conduit::connections::ConnectionContext;
use conduit::{RecordBuilder, WorkerError, WorkerResult};
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::api::DriveClient;
use super::auth::AccessToken;
use super::config::PROVIDER;
use super::method_routes;
use super::transformer::{file_record, SyncSource};
use super::trigger::SyncSettings;
use crate::handler::{Handler, RecordSink, Route};
use conduit::bus::TOPIC_WEBHOOK;
use crate::message::MessageBody;

pub const METHOD: &str = "integration.webhook.notify";

/// Notification kind Drive sends when a channel is closed.
const KIND_STOP: &str = "drive#stop";

/// `pageToken` from a notification's resource URI, e.g.
/// `https://www.googleapis.com/drive/v3/changes?pageToken=123`.
pub fn extract_page_token(resource_uri: &str) -> Option<String> {
    let url = Url::parse(resource_uri).ok()?;
    let token = url
        .query_pairs()
        .find(|(name, _)| name == "pageToken")
        .map(|(_, value)| value.into_owned());
    token.filter(|t| !t.is_empty())
}

/// Push notification from a watch channel. Fetches the one page of changes
/// the notification points at.
pub struct WebhookHandler {
    client: Arc<DriveClient>,
    builder: RecordBuilder,
}

impl WebhookHandler {
    pub fn new(client: Arc<DriveClient>, builder: RecordBuilder) -> Self {
        Self { client, builder }
    }
}

#[async_trait]
impl Handler for WebhookHandler {
    fn name(&self) -> &str {
        "drive.webhook"
    }

    fn routes(&self) -> Vec<Route> {
        let mut routes = method_routes(METHOD);
        routes.push(Route::action("webhook", Some(PROVIDER)));
        routes.push(Route::topic(TOPIC_WEBHOOK, Some(PROVIDER)));
        routes
    }

    async fn handle(&self, body: &MessageBody, ctx: &ConnectionContext, sink: &dyn RecordSink) -> WorkerResult<()> {
        let payload = body
            .payload()
            .and_then(Value::as_object)
            .ok_or_else(|| WorkerError::validation_field("webhook payload must be an object", "payload"))?;
        let channel_id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkerError::validation_field("missing channel id in webhook payload", "payload.id"))?;

        if payload.get("kind").and_then(Value::as_str) == Some(KIND_STOP) {
            info!(connection_id = %ctx.connection_id, channel_id = %channel_id, "Channel stop notification");
            return Ok(());
        }

        let resource_uri = payload.get("resourceUri").and_then(Value::as_str).ok_or_else(|| {
            WorkerError::validation_field("missing resourceUri in webhook payload", "payload.resourceUri")
        })?;
        let Some(page_token) = extract_page_token(resource_uri) else {
            debug!(connection_id = %ctx.connection_id, resource_uri = %resource_uri, "Notification carries no page token");
            return Ok(());
        };

        let settings = SyncSettings::resolve(body, ctx);
        let changes = self
            .client
            .list_changes(&AccessToken::for_connection(ctx), &page_token, settings.include_shared_drives)
            .await?;

        let mut emitted = 0;
        for change in changes.changes.iter().filter(|c| !c.removed) {
            let Some(file) = &change.file else { continue };
            if !settings.wants(file) {
                continue;
            }
            sink.emit(file_record(&self.builder, ctx, file, SyncSource::Webhook).await?).await?;
            emitted += 1;
        }

        info!(
            connection_id = %ctx.connection_id,
            channel_id = %channel_id,
            records = emitted,
            "Webhook processed"
        );
        Ok(())
    }
}
