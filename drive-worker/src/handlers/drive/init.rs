use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use conduit::connections::ConnectionContext;
use conduit::{RecordBuilder, WorkerError, WorkerResult};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::api::{DriveClient, WatchRequest};
use super::auth::AccessToken;
use super::method_routes;
use super::transformer::channel_record;
use crate::handler::{Handler, RecordSink, Route};
use crate::message::MessageBody;

pub const METHOD: &str = "integration.connection.initialize";

/// Connection set-up. With `setup_webhook` it opens a push channel for the
/// change feed and emits one `channel` record describing it.
pub struct InitHandler {
    client: Arc<DriveClient>,
    builder: RecordBuilder,
    channel_ttl_hours: i64,
}

impl InitHandler {
    pub fn new(client: Arc<DriveClient>, builder: RecordBuilder, channel_ttl_hours: i64) -> Self {
        Self {
            client,
            builder,
            channel_ttl_hours,
        }
    }

    fn watch_request(&self, webhook_url: &str) -> WatchRequest {
        let expires = Utc::now() + ChronoDuration::hours(self.channel_ttl_hours);
        WatchRequest {
            id: Uuid::now_v7().to_string(),
            channel_type: "web_hook".to_string(),
            address: webhook_url.to_string(),
            token: Uuid::new_v4().to_string(),
            expiration: expires.timestamp_millis(),
        }
    }
}

#[async_trait]
impl Handler for InitHandler {
    fn name(&self) -> &str {
        "drive.init"
    }

    fn routes(&self) -> Vec<Route> {
        let mut routes = method_routes(METHOD);
        routes.push(Route::action("init", None));
        routes
    }

    async fn handle(&self, body: &MessageBody, ctx: &ConnectionContext, sink: &dyn RecordSink) -> WorkerResult<()> {
        if !body.param_bool("setup_webhook").unwrap_or(false) {
            info!(connection_id = %ctx.connection_id, "Connection initialized without push channel");
            return Ok(());
        }

        let webhook_url = body.param_str("webhook_url").ok_or_else(|| {
            WorkerError::validation_field("setup_webhook requires webhook_url", "webhook_url")
        })?;

        let token = AccessToken::for_connection(ctx);
        let page_token = self.client.get_start_page_token(&token).await?;
        let watch = self.watch_request(webhook_url);
        let channel = self.client.watch_changes(&token, &page_token, &watch).await?;

        info!(
            connection_id = %ctx.connection_id,
            channel_id = %channel.id,
            expiration = ?channel.expiration,
            "Push channel opened"
        );
        sink.emit(channel_record(&self.builder, ctx, &channel, &page_token, webhook_url).await?)
            .await
    }
}
