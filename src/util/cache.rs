//! Small TTL cache.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entries<K, V> {
    map: HashMap<K, (V, Instant)>,
    swept_at: Instant,
}

/// Map whose entries expire `ttl` after insertion.
///
/// Expired entries are evicted when read, and swept on insert at most once
/// per `ttl`, so keys that are never read again do not accumulate.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<Entries<K, V>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    /// Create an empty cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                swept_at: Instant::now(),
            }),
        }
    }

    /// Live value for `key`. Expired entries are evicted on read.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.map.get(key) {
            Some((value, at)) if at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.map.remove(key);
                None
            }
            None => None,
        }
    }

    /// Whether `key` has a live entry.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert or refresh an entry.
    pub fn insert(&self, key: K, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if now.duration_since(entries.swept_at) >= self.ttl {
            let ttl = self.ttl;
            entries.map.retain(|_, (_, at)| now.duration_since(*at) < ttl);
            entries.swept_at = now;
        }
        entries.map.insert(key, (value, now));
    }

    /// Number of stored entries, including ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
