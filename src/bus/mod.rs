//! Message bus seams.
//!
//! The orchestration loop only talks to these traits. Two implementations
//! live in the crate: JetStream ([`crate::nats`]) for production and
//! [`memory::MemoryBus`] for tests and local runs.
//!
//! Inbound delivery is manual-ack only. A message is committed exactly once,
//! after it was handled (or after its terminal failure was reported);
//! anything left uncommitted is redelivered by the bus.

pub mod memory;

use crate::error::WorkerResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Trigger requests from the control plane.
pub const TOPIC_TRIGGER: &str = "integration.trigger";
/// Raw provider push notifications.
pub const TOPIC_WEBHOOK: &str = "webhook.raw";
/// Normalized records.
pub const TOPIC_DATA: &str = "ingestion.data";
/// Error channel (logical dead-letter queue).
pub const TOPIC_ERRORS: &str = "integration.errors";

/// Header carrying the partition key on inbound messages.
pub const HEADER_PARTITION_KEY: &str = "Partition-Key";

/// One delivery of an inbound message. Never mutated after the bus client
/// creates it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Delivery handle used for commit/nack.
    pub delivery_id: String,
    pub topic: String,
    pub partition_key: Option<String>,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl InboundMessage {
    pub fn new(delivery_id: impl Into<String>, topic: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            topic: topic.into(),
            partition_key: None,
            body,
            headers: HashMap::new(),
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
pub trait InboundQueue: Send + Sync {
    /// Up to `max_messages`, waiting at most `timeout` for the first one.
    /// An empty batch is not an error.
    async fn poll(&self, max_messages: usize, timeout: Duration) -> WorkerResult<Vec<InboundMessage>>;

    /// Acknowledge one delivery; it will not be redelivered.
    async fn commit(&self, message: &InboundMessage) -> WorkerResult<()>;

    /// Ask for redelivery of one delivery once `delay` has passed.
    async fn nack(&self, message: &InboundMessage, delay: Duration) -> WorkerResult<()>;

    /// Stop tracking a delivery without acknowledging it. The bus redelivers
    /// it once its ack deadline passes.
    async fn abandon(&self, _message: &InboundMessage) -> WorkerResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait OutboundQueue: Send + Sync {
    /// Publish `value` to `topic`. `key` is the connection id, which keeps
    /// per-connection ordering on the bus side.
    async fn send(&self, topic: &str, key: &str, value: Vec<u8>, headers: &[(String, String)]) -> WorkerResult<()>;
}
