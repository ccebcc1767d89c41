//! Process-wide cache of successful per-item fetches.
//!
//! Keyed by `(kind, item)`. Shared by every aggregator through an `Arc`;
//! a fresh entry lets a re-derived task settle without a network call.
//! Stale entries are dropped when they are read and on every insert.

use crate::models::QueryKey;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
}

/// Cache of fetched values with an optional stale time.
#[derive(Debug)]
pub struct QueryCache<V> {
    entries: Mutex<HashMap<QueryKey, CacheEntry<V>>>,
    /// `None` keeps entries fresh forever.
    stale_time: Option<Duration>,
}

impl<V: Clone> Default for QueryCache<V> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<V: Clone> QueryCache<V> {
    pub fn new(stale_time: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stale_time,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_stale(&self, entry: &CacheEntry<V>) -> bool {
        matches!(self.stale_time, Some(stale) if entry.fetched_at.elapsed() >= stale)
    }

    /// Returns the cached value if it is still fresh.
    pub fn get_fresh(&self, key: &QueryKey) -> Option<V> {
        let mut entries = self.lock();
        let entry = entries.get(key)?;
        if self.is_stale(entry) {
            entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Store a successful fetch.
    pub fn insert(&self, key: QueryKey, value: V) {
        let mut entries = self.lock();
        if self.stale_time.is_some() {
            entries.retain(|_, entry| !self.is_stale(entry));
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop a single entry so the next derivation fetches again.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
