use super::ConsumerSettings;
use crate::bus::{InboundMessage, InboundQueue, HEADER_PARTITION_KEY};
use crate::error::{WorkerError, WorkerResult};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer, AckKind};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Inbound queue over a durable JetStream pull consumer.
///
/// The consumer always uses explicit acks. Fetched messages are held in
/// `pending` until the loop commits, nacks or abandons them.
pub struct JetStreamInbound {
    consumer: consumer::PullConsumer,
    pending: DashMap<String, jetstream::Message>,
}

impl JetStreamInbound {
    pub async fn bind(js: &jetstream::Context, stream_name: &str, settings: &ConsumerSettings) -> Result<Self> {
        let stream = js
            .get_stream(stream_name)
            .await
            .with_context(|| format!("Failed to get stream '{}'", stream_name))?;

        let config = consumer::pull::Config {
            durable_name: Some(settings.durable_name.clone()),
            filter_subjects: settings.filter_subjects.clone(),
            ack_policy: consumer::AckPolicy::Explicit,
            ack_wait: Duration::from_secs(settings.ack_wait_seconds),
            max_ack_pending: settings.max_ack_pending,
            deliver_policy: consumer::DeliverPolicy::All,
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&settings.durable_name, config)
            .await
            .with_context(|| format!("Failed to bind consumer '{}'", settings.durable_name))?;

        info!(
            stream = %stream_name,
            consumer = %settings.durable_name,
            "JetStream consumer bound"
        );

        Ok(Self {
            consumer,
            pending: DashMap::new(),
        })
    }

    fn track(&self, message: jetstream::Message) -> InboundMessage {
        let subject = message.subject.to_string();
        let mut headers = HashMap::new();
        if let Some(map) = &message.headers {
            for (name, values) in map.iter() {
                if let Some(value) = values.first() {
                    headers.insert(name.to_string(), value.as_str().to_string());
                }
            }
        }

        let (topic, suffix) = split_subject(&subject);
        let partition_key = headers.get(HEADER_PARTITION_KEY).cloned().or(suffix);

        let inbound = InboundMessage {
            delivery_id: Uuid::now_v7().to_string(),
            topic,
            partition_key,
            body: message.payload.to_vec(),
            headers,
        };
        self.pending.insert(inbound.delivery_id.clone(), message);
        inbound
    }

    fn take(&self, message: &InboundMessage) -> Option<jetstream::Message> {
        let taken = self.pending.remove(&message.delivery_id).map(|(_, m)| m);
        if taken.is_none() {
            warn!(delivery_id = %message.delivery_id, "Delivery already settled");
        }
        taken
    }
}

/// `integration.trigger.conn-1` → (`integration.trigger`, `conn-1`).
fn split_subject(subject: &str) -> (String, Option<String>) {
    let mut parts = subject.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), Some(rest)) if !rest.is_empty() => (format!("{}.{}", a, b), Some(rest.to_string())),
        _ => (subject.to_string(), None),
    }
}

#[async_trait]
impl InboundQueue for JetStreamInbound {
    async fn poll(&self, max_messages: usize, timeout: Duration) -> WorkerResult<Vec<InboundMessage>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| WorkerError::Transport(format!("fetch failed: {}", e)))?;

        let mut messages = Vec::new();
        while let Some(next) = batch.next().await {
            match next {
                Ok(message) => messages.push(self.track(message)),
                Err(e) => {
                    warn!(error = %e, "Error in fetched batch, returning what arrived");
                    break;
                }
            }
        }
        Ok(messages)
    }

    async fn commit(&self, message: &InboundMessage) -> WorkerResult<()> {
        if let Some(delivery) = self.take(message) {
            delivery
                .ack()
                .await
                .map_err(|e| WorkerError::Transport(format!("ack failed: {}", e)))?;
        }
        Ok(())
    }

    async fn nack(&self, message: &InboundMessage, delay: Duration) -> WorkerResult<()> {
        if let Some(delivery) = self.take(message) {
            delivery
                .ack_with(AckKind::Nak(Some(delay)))
                .await
                .map_err(|e| WorkerError::Transport(format!("nak failed: {}", e)))?;
        }
        Ok(())
    }

    async fn abandon(&self, message: &InboundMessage) -> WorkerResult<()> {
        self.pending.remove(&message.delivery_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_subject() {
        assert_eq!(
            split_subject("integration.trigger.conn-1"),
            ("integration.trigger".to_string(), Some("conn-1".to_string()))
        );
        assert_eq!(split_subject("webhook.raw"), ("webhook.raw".to_string(), None));
        assert_eq!(split_subject("single"), ("single".to_string(), None));
    }
}
