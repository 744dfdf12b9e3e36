//! Google Drive handlers: sync trigger, push notifications, on-demand
//! fetch, connection set-up and teardown.

pub mod api;
pub mod auth;
pub mod config;
pub mod fetch;
pub mod init;
pub mod teardown;
pub mod transformer;
pub mod trigger;
pub mod webhook;

use anyhow::Result;
use conduit::RecordBuilder;
use std::sync::Arc;

use crate::handler::Route;
use crate::registry::HandlerRegistry;

pub use api::DriveClient;
pub use config::{DriveConfig, PROVIDER};

/// Namespace some publishers put in front of method names.
pub const METHOD_NAMESPACE: &str = "clustera.";

/// Routes for a method under both its plain and namespaced name.
pub fn method_routes(method: &str) -> Vec<Route> {
    vec![
        Route::method(method),
        Route::method(&format!("{}{}", METHOD_NAMESPACE, method)),
    ]
}

/// Register the Drive handlers. Trigger comes first so a legacy `trigger`
/// action never falls through to a later route.
pub fn register_drive_handlers(
    registry: &mut HandlerRegistry,
    client: Arc<DriveClient>,
    builder: RecordBuilder,
    config: &DriveConfig,
) -> Result<()> {
    registry.register(Arc::new(trigger::TriggerHandler::new(
        client.clone(),
        builder.clone(),
        config.max_pages,
    )))?;
    registry.register(Arc::new(webhook::WebhookHandler::new(client.clone(), builder.clone())))?;
    registry.register(Arc::new(fetch::FetchHandler::new(
        client.clone(),
        builder.clone(),
        config.max_content_bytes,
    )))?;
    registry.register(Arc::new(init::InitHandler::new(
        client.clone(),
        builder,
        config.channel_ttl_hours,
    )))?;
    registry.register(Arc::new(teardown::TeardownHandler::new(client)))?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBody;
    use conduit::bus::{TOPIC_TRIGGER, TOPIC_WEBHOOK};
    use serde_json::json;

    #[tokio::test]
    async fn test_registers_all_routes() {
        let server = mockito::Server::new_async().await;
        let mut registry = HandlerRegistry::new();
        register_drive_handlers(
            &mut registry,
            testing::client(&server),
            RecordBuilder::new(PROVIDER),
            &DriveConfig::default(),
        )
        .unwrap();
        assert_eq!(
            registry.names(),
            vec!["drive.trigger", "drive.webhook", "drive.fetch", "drive.init", "drive.teardown"]
        );

        let cases = [
            (json!({"method": "integration.sync.trigger"}), "drive.trigger"),
            (json!({"method": "clustera.integration.sync.trigger"}), "drive.trigger"),
            (json!({"method": "clustera.integration.content.fetch"}), "drive.fetch"),
            (json!({"action": "fetch"}), "drive.fetch"),
            (json!({"method": "clustera.integration.connection.teardown"}), "drive.teardown"),
            (json!({"action": "trigger", "provider": "google-drive"}), "drive.trigger"),
            (json!({"action": "webhook", "integration_id": "google-drive"}), "drive.webhook"),
            (json!({"method": "integration.connection.initialize"}), "drive.init"),
            (json!({"action": "teardown"}), "drive.teardown"),
        ];
        for (body, expected) in cases {
            let body = MessageBody::from_value(body).unwrap();
            assert_eq!(registry.dispatch(TOPIC_TRIGGER, &body).unwrap().name(), expected);
        }

        let other = MessageBody::from_value(json!({"action": "trigger", "provider": "gmail"})).unwrap();
        assert!(registry.dispatch(TOPIC_TRIGGER, &other).is_none());
    }

    #[tokio::test]
    async fn test_unaddressed_bodies_route_by_topic() {
        let server = mockito::Server::new_async().await;
        let mut registry = HandlerRegistry::new();
        register_drive_handlers(
            &mut registry,
            testing::client(&server),
            RecordBuilder::new(PROVIDER),
            &DriveConfig::default(),
        )
        .unwrap();

        let webhook = MessageBody::from_value(json!({
            "message_id": "msg-1",
            "customer_id": "cust-1",
            "provider": "google-drive",
            "integration_connection_id": "conn-1",
            "payload": {
                "kind": "api#channel",
                "id": "ch-1",
                "resourceUri": "https://www.googleapis.com/drive/v3/changes?pageToken=abc123"
            }
        }))
        .unwrap();
        assert_eq!(registry.dispatch(TOPIC_WEBHOOK, &webhook).unwrap().name(), "drive.webhook");
        assert_eq!(registry.dispatch(TOPIC_TRIGGER, &webhook).unwrap().name(), "drive.trigger");

        let trigger = MessageBody::from_value(json!({
            "message_id": "msg-2",
            "customer_id": "cust-1",
            "integration_id": "google-drive",
            "integration_connection_id": "conn-1",
            "trigger_type": "full_sync"
        }))
        .unwrap();
        assert_eq!(registry.dispatch(TOPIC_TRIGGER, &trigger).unwrap().name(), "drive.trigger");

        let foreign = MessageBody::from_value(json!({"provider": "gmail", "payload": {}})).unwrap();
        assert!(registry.dispatch(TOPIC_WEBHOOK, &foreign).is_none());
        assert!(registry.dispatch("integration.other", &trigger).is_none());
    }
}
