use async_trait::async_trait;
use conduit::connections::ConnectionContext;
use conduit::{WorkerError, WorkerResult};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::api::DriveClient;
use super::auth::AccessToken;
use super::method_routes;
use crate::handler::{Handler, RecordSink, Route};
use crate::message::MessageBody;

pub const METHOD: &str = "integration.connection.teardown";

/// Connection removal: stops the push channel, if one is known. Emits no
/// records.
pub struct TeardownHandler {
    client: Arc<DriveClient>,
}

impl TeardownHandler {
    pub fn new(client: Arc<DriveClient>) -> Self {
        Self { client }
    }
}

/// Message parameter first, then the connection's stored setting.
fn channel_field<'a>(body: &'a MessageBody, ctx: &'a ConnectionContext, name: &str) -> Option<&'a str> {
    body.param_str(name)
        .or_else(|| ctx.settings.get(name).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl Handler for TeardownHandler {
    fn name(&self) -> &str {
        "drive.teardown"
    }

    fn routes(&self) -> Vec<Route> {
        let mut routes = method_routes(METHOD);
        routes.push(Route::action("teardown", None));
        routes
    }

    async fn handle(&self, body: &MessageBody, ctx: &ConnectionContext, _sink: &dyn RecordSink) -> WorkerResult<()> {
        let (Some(channel_id), Some(resource_id)) = (
            channel_field(body, ctx, "channel_id"),
            channel_field(body, ctx, "resource_id"),
        ) else {
            info!(connection_id = %ctx.connection_id, "No push channel to stop");
            return Ok(());
        };

        match self
            .client
            .stop_channel(&AccessToken::for_connection(ctx), channel_id, resource_id)
            .await
        {
            Ok(()) => {
                info!(connection_id = %ctx.connection_id, channel_id = %channel_id, "Push channel stopped");
                Ok(())
            }
            Err(WorkerError::NotFound(_)) => {
                info!(connection_id = %ctx.connection_id, channel_id = %channel_id, "Push channel already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
