//! Bounded LRU map whose entries expire after a fixed TTL.
//!
//! Shared by the idempotency cache (presence markers) and the
//! external-identity resolver (resolved connections). Not synchronized:
//! callers wrap it in a lock and do each check-and-set under one guard.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

struct Slot<V> {
    value: V,
    inserted_at: Instant,
}

pub struct TtlLruCache<K: Hash + Eq, V> {
    entries: LruCache<K, Slot<V>>,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone, V> TtlLruCache<K, V> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Physical entry count, including expired entries not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, slot: &Slot<V>) -> bool {
        slot.inserted_at.elapsed() >= self.ttl
    }

    /// Fresh value for `key`, promoting it to most-recently-used.
    ///
    /// An expired entry is removed and reported as a miss. A hit does not
    /// refresh the entry's insertion time.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let expired = match self.entries.peek(key) {
            Some(slot) => self.is_expired(slot),
            None => return None,
        };
        if expired {
            self.entries.pop(key);
            return None;
        }
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Insert or replace `key` with a fresh timestamp.
    ///
    /// Returns the key evicted to make room, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<K> {
        let slot = Slot {
            value,
            inserted_at: Instant::now(),
        };
        match self.entries.push(key.clone(), slot) {
            Some((old_key, _)) if old_key != key => Some(old_key),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key).map(|slot| slot.value)
    }

    /// Physically drop every expired entry. Returns how many were removed.
    pub fn prune_expired(&mut self) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, slot)| self.is_expired(slot))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
