// =============================================================================
// TTL cache — adapter-owned read-mostly caches
// =============================================================================
//
// Used for tickers (2 s), funding rates (1 h) and contract metadata (process
// lifetime). The cache is a value owned by the adapter, not a process-wide
// singleton; readers tolerate momentarily-stale values by design of the
// surrounding call sites.
// =============================================================================

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// A simple per-key TTL cache. `ttl = None` means entries never expire
/// (process-lifetime caching, e.g. contract metadata).
pub struct TtlCache<K, V> {
    ttl: Option<Duration>,
    entries: RwLock<HashMap<K, (V, Instant)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a live entry, or `None` when absent or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        let (value, stored_at) = entries.get(key)?;
        match self.ttl {
            Some(ttl) if stored_at.elapsed() > ttl => None,
            _ => Some(value.clone()),
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.write().insert(key, (value, Instant::now()));
    }

    /// Drop expired entries. Called opportunistically by refreshers.
    pub fn evict_expired(&self) {
        let Some(ttl) = self.ttl else { return };
        self.entries.write().retain(|_, (_, at)| at.elapsed() <= ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let cache: TtlCache<String, u32> = TtlCache::new(Some(Duration::from_secs(60)));
        cache.insert("BTCUSDT".into(), 7);
        assert_eq!(cache.get(&"BTCUSDT".into()), Some(7));
        assert_eq!(cache.get(&"ETHUSDT".into()), None);
    }

    #[test]
    fn expiry() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(Some(Duration::from_millis(0)));
        cache.insert("k", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"k"), None);

        cache.evict_expired();
        assert!(cache.is_empty());
    }

    #[test]
    fn lifetime_cache_never_expires() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(None);
        cache.insert("k", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"k"), Some(1));
    }
}
