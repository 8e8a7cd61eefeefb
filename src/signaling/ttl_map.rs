//! Time-bounded maps used by login handling
//!
//! Entries older than the TTL behave as absent on lookup; a background sweep
//! only reclaims their memory.

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    touched_ms: i64,
}

/// Map whose entries expire `ttl` after they were last written
#[derive(Debug)]
pub struct TtlMap<K, V> {
    ttl_ms: i64,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as i64,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn expired(&self, entry: &Entry<V>, now_ms: i64) -> bool {
        now_ms > entry.touched_ms + self.ttl_ms
    }

    pub fn insert(&self, key: K, value: V, now_ms: i64) {
        self.entries.lock().insert(key, Entry { value, touched_ms: now_ms });
    }

    /// Insert only if the key is absent or expired. Returns false when a
    /// live entry already exists.
    pub fn insert_if_absent(&self, key: K, value: V, now_ms: i64) -> bool {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&key) {
            if !self.expired(entry, now_ms) {
                return false;
            }
        }
        entries.insert(key, Entry { value, touched_ms: now_ms });
        true
    }

    pub fn get(&self, key: &K, now_ms: i64) -> Option<V> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| !self.expired(entry, now_ms))
            .map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &K, now_ms: i64) -> bool {
        self.get(key, now_ms).is_some()
    }

    /// Entries physically held, expired or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries, returning how many were removed
    pub fn sweep(&self, now_ms: i64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now_ms <= entry.touched_ms + self.ttl_ms);
        before - entries.len()
    }
}

impl<K> TtlMap<K, u32>
where
    K: Eq + Hash + Clone,
{
    /// Increment a counter, refreshing its timestamp. An expired counter
    /// restarts at 1.
    pub fn increment(&self, key: K, now_ms: i64) -> u32 {
        let mut entries = self.entries.lock();
        let ttl_ms = self.ttl_ms;
        let entry = entries.entry(key).or_insert(Entry { value: 0, touched_ms: now_ms });
        if now_ms > entry.touched_ms + ttl_ms {
            entry.value = 0;
        }
        entry.value = entry.value.saturating_add(1);
        entry.touched_ms = now_ms;
        entry.value
    }
}

/// Spawn a periodic sweep. The task ends once the map is dropped.
pub fn spawn_sweeper<K, V>(map: &Arc<TtlMap<K, V>>, interval: Duration, name: &'static str) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    let weak: Weak<TtlMap<K, V>> = Arc::downgrade(map);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(map) = weak.upgrade() else {
                break;
            };
            let removed = map.sweep(super::auth::unix_millis());
            if removed > 0 {
                debug!("{} sweep removed {} expired entries", name, removed);
            }
        }
    })
}

/// Set of one-time login tokens
#[derive(Debug)]
pub struct ReplayGuard {
    tokens: Arc<TtlMap<String, ()>>,
}

impl ReplayGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Arc::new(TtlMap::new(ttl)),
        }
    }

    /// Record `token`. Returns false if it was already used within the TTL.
    pub fn check_and_record(&self, token: &str, now_ms: i64) -> bool {
        self.tokens.insert_if_absent(token.to_string(), (), now_ms)
    }

    pub fn is_used(&self, token: &str, now_ms: i64) -> bool {
        self.tokens.contains(&token.to_string(), now_ms)
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        spawn_sweeper(&self.tokens, interval, "Replay guard")
    }
}

/// Failed login attempts per remote IP
#[derive(Debug)]
pub struct FailureCounter {
    counts: Arc<TtlMap<String, u32>>,
}

impl FailureCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            counts: Arc::new(TtlMap::new(window)),
        }
    }

    pub fn count(&self, ip: &str, now_ms: i64) -> u32 {
        self.counts.get(&ip.to_string(), now_ms).unwrap_or(0)
    }

    pub fn record_failure(&self, ip: &str, now_ms: i64) -> u32 {
        self.counts.increment(ip.to_string(), now_ms)
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        spawn_sweeper(&self.counts, interval, "Login failure")
    }
}
