use super::{JetStreamInbound, JetStreamOutbound};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

#[derive(Clone, Debug, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_stream_subjects")]
    pub stream_subjects: Vec<String>,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

/// Durable pull consumer for the worker's inbound topics.
#[derive(Clone, Debug, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_durable_name")]
    pub durable_name: String,
    #[serde(default = "default_filter_subjects")]
    pub filter_subjects: Vec<String>,
    /// Redelivery delay for deliveries that are neither acked nor nacked.
    #[serde(default = "default_ack_wait_seconds")]
    pub ack_wait_seconds: u64,
    #[serde(default = "default_max_ack_pending")]
    pub max_ack_pending: i64,
}

fn default_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_stream_name() -> String {
    "INTEGRATIONS".to_string()
}

fn default_stream_subjects() -> Vec<String> {
    [
        "integration.trigger",
        "integration.trigger.>",
        "webhook.raw",
        "webhook.raw.>",
        "ingestion.data.>",
        "integration.errors.>",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_age_days() -> u64 {
    7
}

fn default_durable_name() -> String {
    "drive-worker".to_string()
}

fn default_filter_subjects() -> Vec<String> {
    [
        "integration.trigger",
        "integration.trigger.>",
        "webhook.raw",
        "webhook.raw.>",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_ack_wait_seconds() -> u64 {
    60
}

fn default_max_ack_pending() -> i64 {
    1000
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            stream_name: default_stream_name(),
            stream_subjects: default_stream_subjects(),
            max_age_days: default_max_age_days(),
            consumer: ConsumerSettings::default(),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            durable_name: default_durable_name(),
            filter_subjects: default_filter_subjects(),
            ack_wait_seconds: default_ack_wait_seconds(),
            max_ack_pending: default_max_ack_pending(),
        }
    }
}

/// Connection to NATS with the worker's stream in place.
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
}

impl NatsClient {
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting to NATS");

        let client = async_nats::connect(&config.url)
            .await
            .with_context(|| format!("Failed to connect to NATS at {}", config.url))?;
        let jetstream = jetstream::new(client.clone());

        let nats = Self {
            client,
            jetstream,
            config,
        };
        nats.ensure_stream().await?;
        Ok(nats)
    }

    async fn ensure_stream(&self) -> Result<()> {
        let stream_config = stream::Config {
            name: self.config.stream_name.clone(),
            subjects: self.config.stream_subjects.clone(),
            max_age: Duration::from_secs(self.config.max_age_days * 86_400),
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(stream_config)
            .await
            .with_context(|| format!("Failed to ensure JetStream stream '{}'", self.config.stream_name))?;

        info!(stream = %self.config.stream_name, "JetStream stream ready");
        Ok(())
    }

    /// Bind the durable pull consumer described by `[nats.consumer]`.
    pub async fn inbound(&self) -> Result<JetStreamInbound> {
        JetStreamInbound::bind(&self.jetstream, &self.config.stream_name, &self.config.consumer).await
    }

    pub fn outbound(&self) -> JetStreamOutbound {
        JetStreamOutbound::new(self.jetstream.clone())
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}
