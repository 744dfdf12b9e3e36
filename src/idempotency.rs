//! Duplicate suppression for outbound records.
//!
//! Every record is claimed here just before it is published. The first claim
//! of a key within the TTL wins; later claims are duplicates and are skipped.
//! This collapses redeliveries and overlapping sync paths. It is not the
//! system of record: downstream consumers still dedupe on `idempotency_key`.

use crate::cache::TtlLruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_prune_interval_seconds")]
    pub prune_interval_seconds: u64,
}

fn default_max_size() -> usize {
    10_000
}

fn default_ttl_seconds() -> u64 {
    86_400
}

fn default_prune_interval_seconds() -> u64 {
    300
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            ttl_seconds: default_ttl_seconds(),
            prune_interval_seconds: default_prune_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdempotencyStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_seconds: u64,
    pub claims: u64,
    pub duplicates: u64,
    pub evictions: u64,
}

pub struct IdempotencyCache {
    entries: Mutex<TtlLruCache<String, ()>>,
    claims: AtomicU64,
    duplicates: AtomicU64,
    evictions: AtomicU64,
}

impl IdempotencyCache {
    pub fn new(config: &IdempotencyConfig) -> Self {
        Self {
            entries: Mutex::new(TtlLruCache::new(
                config.max_size,
                Duration::from_secs(config.ttl_seconds),
            )),
            claims: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Atomically claim `key` for publishing.
    ///
    /// Returns `true` if the key was absent or expired (it is now recorded
    /// as most recently used), `false` if it is a live duplicate.
    pub fn claim(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        let key = key.to_string();

        if entries.get(&key).is_some() {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if let Some(evicted) = entries.insert(key, ()) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(evicted = %evicted, "Idempotency cache full, evicted least recently used key");
        }
        self.claims.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Give back a claim whose publish failed so a retry can publish it.
    pub fn release(&self, key: &str) {
        self.entries.lock().remove(&key.to_string());
    }

    /// Unexpired presence check. Promotes the key like a claim would.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().get(&key.to_string()).is_some()
    }

    pub fn prune_expired(&self) -> usize {
        self.entries.lock().prune_expired()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> IdempotencyStats {
        let entries = self.entries.lock();
        IdempotencyStats {
            size: entries.len(),
            max_size: entries.capacity(),
            ttl_seconds: entries.ttl().as_secs(),
            claims: self.claims.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
