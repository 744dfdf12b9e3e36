// NATS JetStream implementation of the bus seams

mod client;
mod consumer;
mod publisher;

pub use client::{ConsumerSettings, NatsClient, NatsConfig};
pub use consumer::JetStreamInbound;
pub use publisher::{subject_token, JetStreamOutbound, HEADER_IDEMPOTENCY_KEY};
