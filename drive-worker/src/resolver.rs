//! External-identity resolver cache.
//!
//! Maps a provider-side identity (an account email) to a connection when a
//! webhook arrives without a connection id.
//!
//! ```text
//!   resolve(email)
//!     ├── cache hit (unexpired) ───────────────► resolution
//!     └── miss ─► per-key lock ─► re-check ─► directory lookup ─► cache ─► resolution
//! ```
//!
//! Concurrent misses for the same identity share one directory lookup: the
//! first caller holds the key's lock while it looks up and populates, the
//! rest wait on the lock and then find the entry cached. The lock entry is
//! removed when a caller leaves, even a cancelled one. Not-found is never
//! cached, so a connection created later is picked up by the next message.

use conduit::cache::TtlLruCache;
use conduit::connections::{ConnectionDirectory, ConnectionResolution};
use conduit::{WorkerError, WorkerResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type InflightMap = DashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Removes an identity's in-flight entry when the caller leaves `resolve`,
/// whether it returns, is cancelled or times out. An entry already replaced
/// by a later caller is left alone.
struct InflightSlot<'a> {
    inflight: &'a InflightMap,
    key: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        self.inflight.remove_if(self.key, |_, lock| Arc::ptr_eq(lock, &self.lock));
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResolverStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub lookups: u64,
}

pub struct IdentityResolver {
    directory: Arc<dyn ConnectionDirectory>,
    cache: Mutex<TtlLruCache<String, ConnectionResolution>>,
    inflight: InflightMap,
    hits: AtomicU64,
    misses: AtomicU64,
    lookups: AtomicU64,
}

impl IdentityResolver {
    pub fn new(directory: Arc<dyn ConnectionDirectory>, max_size: usize, ttl: Duration) -> Self {
        Self {
            directory,
            cache: Mutex::new(TtlLruCache::new(max_size, ttl)),
            inflight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
        }
    }

    /// Identities compare case-insensitively.
    fn normalize(external_id: &str) -> String {
        external_id.trim().to_ascii_lowercase()
    }

    fn cached(&self, key: &str) -> Option<ConnectionResolution> {
        self.cache.lock().get(&key.to_string()).cloned()
    }

    pub async fn resolve(&self, external_id: &str) -> WorkerResult<ConnectionResolution> {
        let key = Self::normalize(external_id);
        if key.is_empty() {
            return Err(WorkerError::validation_field("external identity is empty", "email"));
        }

        if let Some(hit) = self.cached(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let slot = InflightSlot {
            inflight: &self.inflight,
            key: &key,
            lock,
        };
        let _guard = slot.lock.lock().await;

        // Another caller may have populated the entry while we waited.
        if let Some(hit) = self.cached(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let result = match self.directory.resolve_by_external_id(&key).await {
            Ok(Some(resolution)) => {
                debug!(
                    external_id = %key,
                    connection_id = %resolution.connection_id,
                    resolved_via = %resolution.resolved_via,
                    "Resolved external identity"
                );
                self.cache.lock().insert(key.clone(), resolution.clone());
                Ok(resolution)
            }
            Ok(None) => Err(WorkerError::UnresolvableIdentity {
                external_id: key.clone(),
            }),
            Err(e) => Err(e),
        };
        result
    }

    /// Drop a cached resolution, e.g. after its credentials were rejected.
    pub fn invalidate(&self, external_id: &str) -> bool {
        self.cache.lock().remove(&Self::normalize(external_id)).is_some()
    }

    pub fn prune_expired(&self) -> usize {
        self.cache.lock().prune_expired()
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            size: self.cache.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use conduit::connections::{ConnectionContext, Credentials};

    #[derive(Default)]
    struct CountingDirectory {
        calls: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl ConnectionDirectory for CountingDirectory {
        async fn fetch_connection_config(&self, connection_id: &str) -> WorkerResult<ConnectionContext> {
            Err(WorkerError::NotFound(connection_id.to_string()))
        }

        async fn resolve_by_external_id(&self, external_id: &str) -> WorkerResult<Option<ConnectionResolution>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(WorkerError::Transport("directory down".to_string()));
            }
            if external_id.starts_with("stuck") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if external_id.starts_with("ghost") {
                return Ok(None);
            }
            Ok(Some(ConnectionResolution {
                external_id: external_id.to_string(),
                connection_id: "conn-1".to_string(),
                customer_id: "cust-1".to_string(),
                credentials: Credentials::bearer("tok"),
                resolved_via: "test".to_string(),
                resolved_at: Utc::now(),
            }))
        }
    }

    fn resolver(directory: Arc<CountingDirectory>) -> IdentityResolver {
        IdentityResolver::new(directory, 10, Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl_skips_lookup() {
        let directory = Arc::new(CountingDirectory::default());
        let resolver = resolver(directory.clone());

        let first = resolver.resolve("User@Example.com").await.unwrap();
        assert_eq!(first.connection_id, "conn-1");
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(299)).await;
        resolver.resolve("user@example.com").await.unwrap();
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);

        let stats = resolver.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.lookups, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_looked_up_again() {
        let directory = Arc::new(CountingDirectory::default());
        let resolver = resolver(directory.clone());

        resolver.resolve("user@example.com").await.unwrap();
        tokio::time::advance(Duration::from_secs(300)).await;
        resolver.resolve("user@example.com").await.unwrap();
        assert_eq!(directory.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_lookup() {
        let directory = Arc::new(CountingDirectory::default());
        let resolver = Arc::new(resolver(directory.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve("user@example.com").await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_terminal_and_not_cached() {
        let directory = Arc::new(CountingDirectory::default());
        let resolver = resolver(directory.clone());

        let err = resolver.resolve("ghost@example.com").await.unwrap_err();
        assert!(matches!(err, WorkerError::UnresolvableIdentity { .. }));
        assert!(!err.is_retriable());

        resolver.resolve("ghost@example.com").await.unwrap_err();
        assert_eq!(directory.calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.stats().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_retriable() {
        let directory = Arc::new(CountingDirectory {
            fail: true,
            ..Default::default()
        });
        let resolver = resolver(directory);
        let err = resolver.resolve("user@example.com").await.unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_lookup_releases_inflight_entry() {
        let directory = Arc::new(CountingDirectory::default());
        let resolver = resolver(directory.clone());

        let timed_out = tokio::time::timeout(Duration::from_secs(1), resolver.resolve("stuck@example.com")).await;
        assert!(timed_out.is_err());
        assert!(resolver.inflight.is_empty());

        resolver.resolve("user@example.com").await.unwrap();
        resolver.resolve("ghost@example.com").await.unwrap_err();
        assert!(resolver.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_empty_identity_rejected() {
        let resolver = resolver(Arc::new(CountingDirectory::default()));
        let err = resolver.resolve("   ").await.unwrap_err();
        assert!(matches!(err, WorkerError::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_lookup() {
        let directory = Arc::new(CountingDirectory::default());
        let resolver = resolver(directory.clone());
        resolver.resolve("user@example.com").await.unwrap();
        assert!(resolver.invalidate("USER@example.com"));
        resolver.resolve("user@example.com").await.unwrap();
        assert_eq!(directory.calls.load(Ordering::SeqCst), 2);
    }
}
