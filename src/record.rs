//! Outbound record types.
//!
//! [`NormalizedRecord`] is what handlers produce and what lands on the data
//! topic. [`ErrorRecord`] is what the orchestration loop puts on the error
//! channel when a message fails for good (or runs out of retries).

use crate::blob::{BlobRef, BlobStore};
use crate::error::{WorkerError, WorkerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Deterministic key for one logical unit of output.
///
/// Pure function of its four components, so a file seen on full sync,
/// incremental sync and a webhook all collapse to the same key.
pub fn idempotency_key(provider: &str, connection_id: &str, resource_type: &str, resource_id: &str) -> String {
    format!("{}:{}:{}:{}", provider, connection_id, resource_type, resource_id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub message_id: String,
    pub idempotency_key: String,
    pub provider: String,
    pub customer_id: String,
    pub integration_connection_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
    /// `Null` when the payload was offloaded (see `payload_ref`).
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<BlobRef>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NormalizedRecord {
    pub fn new(
        provider: &str,
        customer_id: &str,
        connection_id: &str,
        resource_type: &str,
        resource_id: &str,
        payload: Value,
    ) -> Self {
        Self {
            message_id: Uuid::now_v7().to_string(),
            idempotency_key: idempotency_key(provider, connection_id, resource_type, resource_id),
            provider: provider.to_string(),
            customer_id: customer_id.to_string(),
            integration_connection_id: connection_id.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            created_at: Utc::now(),
            payload,
            payload_ref: None,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Builds records for one provider, offloading oversized payloads.
#[derive(Clone)]
pub struct RecordBuilder {
    provider: String,
    blob_store: Option<Arc<dyn BlobStore>>,
    threshold_bytes: usize,
}

impl RecordBuilder {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            blob_store: None,
            threshold_bytes: usize::MAX,
        }
    }

    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>, threshold_bytes: usize) -> Self {
        self.blob_store = Some(store);
        self.threshold_bytes = threshold_bytes;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Build a record, uploading the payload when its serialized size
    /// exceeds the threshold.
    pub async fn build(
        &self,
        customer_id: &str,
        connection_id: &str,
        resource_type: &str,
        resource_id: &str,
        payload: Value,
    ) -> WorkerResult<NormalizedRecord> {
        let mut record = NormalizedRecord::new(
            &self.provider,
            customer_id,
            connection_id,
            resource_type,
            resource_id,
            payload,
        );

        if let Some(store) = &self.blob_store {
            let bytes = serde_json::to_vec(&record.payload)
                .map_err(|e| WorkerError::Malformed(format!("payload not serializable: {}", e)))?;
            if bytes.len() > self.threshold_bytes {
                let blob = store.upload(&bytes, customer_id, "application/json").await?;
                debug!(
                    resource_id = %resource_id,
                    size = bytes.len(),
                    key = %blob.key,
                    "Offloaded oversized payload"
                );
                record.payload = Value::Null;
                record.payload_ref = Some(blob);
            }
        }

        Ok(record)
    }

    /// Attach downloaded file content to a built record.
    ///
    /// UTF-8 text within the threshold goes inline as `payload.content`.
    /// Anything else is uploaded and referenced from `metadata.content_ref`;
    /// without a blob store it is dropped and `metadata.content_omitted` set.
    pub async fn attach_content(
        &self,
        mut record: NormalizedRecord,
        content: Vec<u8>,
        content_type: &str,
    ) -> WorkerResult<NormalizedRecord> {
        let size = content.len();
        record.metadata.insert("content_size_bytes".to_string(), size.into());
        record.metadata.insert("content_type".to_string(), content_type.into());

        let mut content = content;
        if size <= self.threshold_bytes {
            if let Value::Object(payload) = &mut record.payload {
                match String::from_utf8(content) {
                    Ok(text) => {
                        payload.insert("content".to_string(), Value::String(text));
                        return Ok(record);
                    }
                    Err(e) => content = e.into_bytes(),
                }
            }
        }

        match &self.blob_store {
            Some(store) => {
                let blob = store.upload(&content, &record.customer_id, content_type).await?;
                debug!(resource_id = %record.resource_id, size = size, key = %blob.key, "Offloaded file content");
                let blob = serde_json::to_value(&blob)
                    .map_err(|e| WorkerError::Malformed(format!("blob reference not serializable: {}", e)))?;
                record.metadata.insert("content_ref".to_string(), blob);
            }
            None => {
                record.metadata.insert("content_omitted".to_string(), Value::Bool(true));
            }
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    pub retriable: bool,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Failure report for manual replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Id of the inbound message that failed.
    pub message_id: Option<String>,
    pub customer_id: Option<String>,
    pub integration_id: Option<String>,
    pub integration_connection_id: Option<String>,
    pub error: ErrorDetail,
    pub original_message: Value,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_error(error: &WorkerError, message_id: Option<String>, original_message: Value) -> Self {
        Self {
            message_id,
            customer_id: None,
            integration_id: None,
            integration_connection_id: None,
            error: ErrorDetail {
                kind: error.kind().to_string(),
                message: error.to_string(),
                retriable: error.is_retriable(),
                details: error.details(),
            },
            original_message,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_connection(
        mut self,
        customer_id: Option<String>,
        integration_id: Option<String>,
        connection_id: Option<String>,
    ) -> Self {
        self.customer_id = customer_id;
        self.integration_id = integration_id;
        self.integration_connection_id = connection_id;
        self
    }

    pub fn is_retriable(&self) -> bool {
        self.error.retriable
    }
}
