use crate::bus::OutboundQueue;
use crate::error::{WorkerError, WorkerResult};
use async_nats::jetstream;
use async_nats::HeaderMap;
use async_trait::async_trait;
use tracing::debug;

/// Header the worker puts on record publishes.
pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency_key";

/// JetStream de-duplication header.
const NATS_MSG_ID: &str = "Nats-Msg-Id";

/// Outbound queue publishing to `{topic}.{key}`.
///
/// Records carrying an idempotency key are also tagged with `Nats-Msg-Id`,
/// so the stream's duplicate window catches republishes the worker missed.
#[derive(Clone)]
pub struct JetStreamOutbound {
    jetstream: jetstream::Context,
}

impl JetStreamOutbound {
    pub fn new(jetstream: jetstream::Context) -> Self {
        Self { jetstream }
    }
}

/// Subject tokens can't contain `.`, `*`, `>` or whitespace.
pub fn subject_token(key: &str) -> String {
    let token: String = key
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if token.is_empty() {
        "_".to_string()
    } else {
        token
    }
}

#[async_trait]
impl OutboundQueue for JetStreamOutbound {
    async fn send(&self, topic: &str, key: &str, value: Vec<u8>, headers: &[(String, String)]) -> WorkerResult<()> {
        let subject = format!("{}.{}", topic, subject_token(key));

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            header_map.insert(name.as_str(), value.as_str());
            if name == HEADER_IDEMPOTENCY_KEY {
                header_map.insert(NATS_MSG_ID, value.as_str());
            }
        }

        debug!(subject = %subject, bytes = value.len(), "Publishing to JetStream");

        self.jetstream
            .publish_with_headers(subject.clone(), header_map, value.into())
            .await
            .map_err(|e| WorkerError::Publish(format!("publish to '{}' failed: {}", subject, e)))?
            .await
            .map_err(|e| WorkerError::Publish(format!("no ack for '{}': {}", subject, e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_token_sanitizes() {
        assert_eq!(subject_token("conn-1"), "conn-1");
        assert_eq!(subject_token("a.b*c>d e"), "a_b_c_d_e");
        assert_eq!(subject_token(""), "_");
    }
}
