//! In-memory TTL cache
//!
//! Each cache has one fixed TTL window (remote status ~10s, version
//! manifests ~24h). Entries live only as long as the process. Expiry is
//! measured against an injected [`Clock`], so tests can step time instead of
//! sleeping.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::time::Clock;

/// A cached value and the time it was stored
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub timestamp_ms: u64,
}

/// Map of values that expire after a fixed TTL
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// The cached value if it is still inside the TTL window
    pub fn get_fresh(&self, key: &K) -> Option<V> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| now.saturating_sub(entry.timestamp_ms) < self.ttl.as_millis() as u64)
            .map(|entry| entry.value.clone())
    }

    /// The cached entry regardless of age
    pub fn get_any(&self, key: &K) -> Option<CacheEntry<V>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    /// Store a value stamped with the current time
    pub fn insert(&self, key: K, value: V) {
        let entry = CacheEntry {
            value,
            timestamp_ms: self.clock.now_millis(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, entry);
    }

    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn cache(clock: &Arc<ManualClock>) -> TtlCache<String, String> {
        TtlCache::new(Duration::from_secs(10), clock.clone())
    }

    #[test]
    fn test_fresh_within_ttl() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = cache(&clock);
        cache.insert("box".to_string(), "running".to_string());

        clock.advance(Duration::from_millis(9_999));
        assert_eq!(cache.get_fresh(&"box".to_string()).as_deref(), Some("running"));
    }

    #[test]
    fn test_expires_at_ttl() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = cache(&clock);
        cache.insert("box".to_string(), "running".to_string());

        clock.advance(Duration::from_secs(10));
        assert!(cache.get_fresh(&"box".to_string()).is_none());
        // stale entry is still visible
        let entry = cache.get_any(&"box".to_string()).unwrap();
        assert_eq!(entry.timestamp_ms, 1_000_000);
    }

    #[test]
    fn test_insert_refreshes_timestamp() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(&clock);
        cache.insert("box".to_string(), "stopped".to_string());
        clock.advance(Duration::from_secs(30));
        cache.insert("box".to_string(), "running".to_string());

        assert_eq!(cache.get_fresh(&"box".to_string()).as_deref(), Some("running"));
        cache.invalidate(&"box".to_string());
        assert!(cache.is_empty());
    }
}
