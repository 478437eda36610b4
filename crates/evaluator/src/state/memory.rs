//! In-memory state store
//!
//! A DashMap-backed [`StateInternals`] used by the default context backend.
//! Entries can expire after an optional TTL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::StateInternals;
use crate::error::StateResult;

/// Entry in the memory state store with TTL support
#[derive(Debug, Clone)]
struct StateEntry {
    value: Vec<u8>,
    modified_at: DateTime<Utc>,
}

impl StateEntry {
    fn new(value: Vec<u8>) -> Self {
        Self {
            value,
            modified_at: Utc::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.modified_at);
        age.num_milliseconds() > ttl.as_millis() as i64
    }
}

/// Snapshot of store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStateStats {
    pub entries: usize,
    pub get_count: u64,
    pub put_count: u64,
    pub delete_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub expired_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    get: AtomicU64,
    put: AtomicU64,
    delete: AtomicU64,
    hit: AtomicU64,
    miss: AtomicU64,
    expired: AtomicU64,
}

/// In-memory state store for one (step, key) pair
///
/// Cloning yields another handle to the same underlying store, so identity
/// can be checked with [`InMemoryStateInternals::same_store`].
#[derive(Debug, Clone)]
pub struct InMemoryStateInternals {
    data: Arc<DashMap<Vec<u8>, StateEntry>>,
    ttl: Option<Duration>,
    counters: Arc<Counters>,
}

impl InMemoryStateInternals {
    /// Create a new store. If `ttl` is None, entries never expire.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            ttl,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Whether two handles point at the same underlying store
    pub fn same_store(&self, other: &InMemoryStateInternals) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Get current statistics
    pub fn stats(&self) -> MemoryStateStats {
        MemoryStateStats {
            entries: self.data.len(),
            get_count: self.counters.get.load(Ordering::Relaxed),
            put_count: self.counters.put.load(Ordering::Relaxed),
            delete_count: self.counters.delete.load(Ordering::Relaxed),
            hit_count: self.counters.hit.load(Ordering::Relaxed),
            miss_count: self.counters.miss.load(Ordering::Relaxed),
            expired_count: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    /// Remove entries older than the TTL. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };

        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired(ttl));
        let removed = before.saturating_sub(self.data.len());

        if removed > 0 {
            debug!("Cleaned up {} expired entries", removed);
            self.counters.expired.fetch_add(removed as u64, Ordering::Relaxed);
        }

        removed
    }

    /// Copy of every live entry
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }
}

impl Default for InMemoryStateInternals {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl StateInternals for InMemoryStateInternals {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        trace!("Getting key: {:?}", String::from_utf8_lossy(key));
        self.counters.get.fetch_add(1, Ordering::Relaxed);

        let expired = match (self.data.get(key), self.ttl) {
            (Some(entry), Some(ttl)) if entry.is_expired(ttl) => true,
            (Some(entry), _) => {
                self.counters.hit.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(entry.value.clone()));
            }
            (None, _) => false,
        };

        if expired {
            self.data.remove(key);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.miss.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        trace!(
            "Putting key: {:?}, value size: {} bytes",
            String::from_utf8_lossy(key),
            value.len()
        );
        self.counters.put.fetch_add(1, Ordering::Relaxed);
        self.data.insert(key.to_vec(), StateEntry::new(value.to_vec()));
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        trace!("Deleting key: {:?}", String::from_utf8_lossy(key));
        self.counters.delete.fetch_add(1, Ordering::Relaxed);
        self.data.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>> {
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn clear(&self) -> StateResult<()> {
        debug!("Clearing all state");
        self.data.clear();
        Ok(())
    }

    async fn count(&self) -> StateResult<usize> {
        Ok(self.data.len())
    }

    async fn contains(&self, key: &[u8]) -> StateResult<bool> {
        Ok(self.data.contains_key(key))
    }
}
