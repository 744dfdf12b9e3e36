//! Offload storage for payloads too large to inline on the bus.
//!
//! Objects are content-addressed by SHA-256, so uploading the same payload
//! twice stores it once.

use crate::error::{WorkerError, WorkerResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Clone, Debug, Deserialize)]
pub struct BlobConfig {
    /// Serialized payloads larger than this are uploaded instead of inlined.
    #[serde(default = "default_payload_threshold_bytes")]
    pub payload_threshold_bytes: usize,
    /// Root directory for the local store. Offload is disabled when unset.
    #[serde(default = "default_local_root")]
    pub local_root: Option<PathBuf>,
}

fn default_payload_threshold_bytes() -> usize {
    256 * 1024
}

fn default_local_root() -> Option<PathBuf> {
    Some(PathBuf::from("data/blobs"))
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            payload_threshold_bytes: default_payload_threshold_bytes(),
            local_root: default_local_root(),
        }
    }
}

/// Where an offloaded payload lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub url: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub key: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bytes: &[u8], customer_id: &str, content_type: &str) -> WorkerResult<BlobRef>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().map(str::trim) {
        Some("application/json") => "json",
        Some("text/plain") => "txt",
        Some("text/csv") => "csv",
        _ => "bin",
    }
}

/// Filesystem store: `{root}/{customer_id}/{sha256}.{ext}`.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, bytes: &[u8], customer_id: &str, content_type: &str) -> WorkerResult<BlobRef> {
        if customer_id.is_empty() || customer_id.contains(['/', '\\']) || customer_id.contains("..") {
            return Err(WorkerError::validation_field(
                format!("invalid customer id for blob key: '{}'", customer_id),
                "customer_id",
            ));
        }

        let sha256 = sha256_hex(bytes);
        let key = format!("{}/{}.{}", customer_id, sha256, extension_for(content_type));
        let path = self.root.join(&key);

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| WorkerError::Transport(format!("blob store: {}", e)))?;
        if exists {
            debug!(key = %key, "Blob already stored, skipping upload");
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| WorkerError::Transport(format!("blob store: {}", e)))?;
            }
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| WorkerError::Transport(format!("blob store: {}", e)))?;
            debug!(key = %key, size = bytes.len(), "Stored blob");
        }

        Ok(BlobRef {
            url: format!("file://{}", path.display()),
            sha256,
            size_bytes: bytes.len() as u64,
            key,
        })
    }
}
