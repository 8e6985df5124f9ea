//! # Bounded TTL Cache
//!
//! Size-bounded cache with per-entry expiry, used in front of discovery
//! lookups. Entries older than the TTL are treated as absent and removed on
//! access. When full, the oldest insertion is evicted.
//!
//! ```rust
//! use lora_router::discovery::TtlCache;
//! use std::time::Duration;
//!
//! let cache = TtlCache::new(2, Duration::from_secs(60));
//! cache.insert("broker", 1);
//! assert_eq!(cache.get(&"broker"), Some(1));
//! cache.invalidate(&"broker");
//! assert_eq!(cache.get(&"broker"), None);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Statistics for cache monitoring
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub insertions: u64,
    pub hits: u64,
    pub misses: u64,
    /// Removed because the cache was full
    pub evictions: u64,
    /// Removed because the TTL passed
    pub expirations: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted: Instant,
}

#[derive(Debug)]
struct CacheInner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Insertion order, oldest at the front
    order: VecDeque<K>,
    stats: CacheStats,
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<CacheInner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = inner
            .entries
            .get(key)
            .map(|entry| entry.inserted.elapsed() <= self.ttl);

        match fresh {
            Some(true) => {
                inner.stats.hits += 1;
                inner.entries.get(key).map(|entry| entry.value.clone())
            }
            Some(false) => {
                inner.entries.remove(key);
                inner.order.retain(|k| k != key);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stats.insertions += 1;

        if inner.entries.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        } else if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                inner.stats.evictions += 1;
            }
        }

        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    /// Remove `key`, returning whether it was cached
    pub fn invalidate(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.order.retain(|k| k != key);
        inner.entries.remove(key).is_some()
    }

    /// Keep only entries matching `keep`
    pub fn retain<F: FnMut(&K, &V) -> bool>(&self, mut keep: F) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.retain(|k, entry| keep(k, &entry.value));
        let CacheInner { entries, order, .. } = &mut *inner;
        order.retain(|k| entries.contains_key(k));
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.entries.len();
        let ttl = self.ttl;
        inner.entries.retain(|_, entry| entry.inserted.elapsed() <= ttl);
        let removed = before - inner.entries.len();
        inner.stats.expirations += removed as u64;
        let CacheInner { entries, order, .. } = &mut *inner;
        order.retain(|k| entries.contains_key(k));
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).stats
    }

    pub fn hit_rate(&self) -> f64 {
        let stats = self.stats();
        let lookups = stats.hits + stats.misses;
        if lookups > 0 {
            stats.hits as f64 / lookups as f64
        } else {
            0.0
        }
    }
}
