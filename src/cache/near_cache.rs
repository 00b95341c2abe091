//! Near Cache Module
//!
//! Client-local store mirroring a subset of the remote cache, combining
//! HashMap storage with LRU tracking and TTL expiration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::{LruTracker, NearCacheEntry, NearCacheLookup, NearCacheRecord, NearCacheStats};
use crate::config::NearCacheConfig;
use crate::serialization::Data;

// == Near Cache Store ==
/// Single-threaded near-cache storage with LRU eviction and TTL support.
#[derive(Debug)]
pub struct NearCacheStore {
    entries: HashMap<Data, NearCacheEntry>,
    lru: LruTracker,
    stats: NearCacheStats,
    max_entries: usize,
    time_to_live: Option<Duration>,
    /// Bumped by every invalidation and clear
    epoch: u64,
}

impl NearCacheStore {
    // == Constructor ==
    /// Creates a store holding at most `max_entries` records.
    pub fn new(max_entries: usize, time_to_live: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruTracker::new(),
            stats: NearCacheStats::new(),
            max_entries,
            time_to_live,
            epoch: 0,
        }
    }

    // == Get ==
    /// Looks a key up. Expired entries are dropped and reported as uncached.
    pub fn get(&mut self, key: &Data) -> NearCacheLookup {
        let Some(entry) = self.entries.get(key) else {
            self.stats.record_miss();
            return NearCacheLookup::Uncached;
        };

        if entry.is_expired() {
            self.entries.remove(key);
            self.lru.remove(key);
            self.stats.record_expirations(1);
            self.stats.record_miss();
            self.stats.set_total_entries(self.entries.len());
            return NearCacheLookup::Uncached;
        }

        let lookup = entry.lookup();
        match lookup {
            NearCacheLookup::Present(_) => self.stats.record_hit(),
            _ => self.stats.record_miss(),
        }
        self.lru.touch(key);
        lookup
    }

    // == Put ==
    /// Stores a record, evicting the least recently used entry when full.
    pub fn put(&mut self, key: Data, record: NearCacheRecord) {
        let is_overwrite = self.entries.contains_key(&key);

        if !is_overwrite && self.entries.len() >= self.max_entries {
            match self.lru.evict_oldest() {
                Some(evicted_key) => {
                    self.entries.remove(&evicted_key);
                    self.stats.record_eviction();
                }
                // Zero capacity
                None => return,
            }
        }

        let entry = NearCacheEntry::new(record, self.time_to_live);
        self.lru.touch(&key);
        self.entries.insert(key, entry);
        self.stats.set_total_entries(self.entries.len());
    }

    /// Stores a record fetched when the store was at `epoch`, unless an
    /// invalidation happened since. Returns true if stored.
    pub fn put_if_current(&mut self, key: Data, record: NearCacheRecord, epoch: u64) -> bool {
        if self.epoch != epoch {
            return false;
        }
        self.put(key, record);
        true
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    // == Invalidate ==
    /// Drops the record for a key. Returns true if one was cached.
    pub fn invalidate(&mut self, key: &Data) -> bool {
        self.epoch += 1;
        if self.entries.remove(key).is_some() {
            self.lru.remove(key);
            self.stats.record_invalidation();
            self.stats.set_total_entries(self.entries.len());
            true
        } else {
            false
        }
    }

    // == Clear ==
    pub fn clear(&mut self) {
        self.epoch += 1;
        self.entries.clear();
        self.lru.clear();
        self.stats.set_total_entries(0);
    }

    // == Cleanup Expired ==
    /// Removes all expired entries. Returns the number removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let expired_keys: Vec<Data> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired_keys {
            self.entries.remove(key);
            self.lru.remove(key);
        }

        self.stats.record_expirations(expired_keys.len());
        self.stats.set_total_entries(self.entries.len());
        expired_keys.len()
    }

    pub fn stats(&self) -> NearCacheStats {
        let mut stats = self.stats.clone();
        stats.set_total_entries(self.entries.len());
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// == Near Cache ==
/// Thread-safe near-cache handle shared by a proxy and its sweep task.
///
/// Every operation takes the lock for its own duration only, so an
/// invalidation is visible to any lookup that starts after it returns.
#[derive(Debug, Clone)]
pub struct NearCache {
    store: Arc<Mutex<NearCacheStore>>,
}

impl NearCache {
    pub fn new(config: &NearCacheConfig) -> Self {
        Self {
            store: Arc::new(Mutex::new(NearCacheStore::new(
                config.max_entries,
                config.time_to_live,
            ))),
        }
    }

    pub fn get(&self, key: &Data) -> NearCacheLookup {
        self.store.lock().get(key)
    }

    pub fn put(&self, key: Data, record: NearCacheRecord) {
        self.store.lock().put(key, record);
    }

    pub fn put_if_current(&self, key: Data, record: NearCacheRecord, epoch: u64) -> bool {
        self.store.lock().put_if_current(key, record, epoch)
    }

    /// Invalidation epoch to pass to [`NearCache::put_if_current`].
    pub fn epoch(&self) -> u64 {
        self.store.lock().epoch()
    }

    pub fn invalidate(&self, key: &Data) -> bool {
        self.store.lock().invalidate(key)
    }

    pub fn invalidate_all<'a>(&self, keys: impl IntoIterator<Item = &'a Data>) {
        let mut store = self.store.lock();
        for key in keys {
            store.invalidate(key);
        }
    }

    pub fn clear(&self) {
        self.store.lock().clear();
    }

    pub fn cleanup_expired(&self) -> usize {
        self.store.lock().cleanup_expired()
    }

    pub fn stats(&self) -> NearCacheStats {
        self.store.lock().stats()
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn data(text: &str) -> Data {
        Data::from_bytes(text.as_bytes().to_vec())
    }

    fn value(text: &str) -> NearCacheRecord {
        NearCacheRecord::Value(data(text))
    }

    #[test]
    fn test_store_put_and_get() {
        let mut store = NearCacheStore::new(100, None);

        store.put(data("key1"), value("value1"));

        assert_eq!(store.get(&data("key1")), NearCacheLookup::Present(data("value1")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_get_uncached() {
        let mut store = NearCacheStore::new(100, None);
        assert_eq!(store.get(&data("missing")), NearCacheLookup::Uncached);
    }

    #[test]
    fn test_store_null_marker_differs_from_uncached() {
        let mut store = NearCacheStore::new(100, None);

        store.put(data("absent"), NearCacheRecord::Null);

        assert_eq!(store.get(&data("absent")), NearCacheLookup::Null);
        assert_eq!(store.get(&data("other")), NearCacheLookup::Uncached);
    }

    #[test]
    fn test_store_invalidate() {
        let mut store = NearCacheStore::new(100, None);

        store.put(data("key1"), value("value1"));
        assert!(store.invalidate(&data("key1")));
        assert!(!store.invalidate(&data("key1")));

        assert!(store.is_empty());
        assert_eq!(store.get(&data("key1")), NearCacheLookup::Uncached);
        assert_eq!(store.stats().invalidations, 1);
    }

    #[test]
    fn test_store_put_if_current_rejects_after_invalidation() {
        let mut store = NearCacheStore::new(10, None);
        let epoch = store.epoch();
        store.invalidate(&data("other"));

        assert!(!store.put_if_current(data("k"), NearCacheRecord::Null, epoch));
        assert_eq!(store.get(&data("k")), NearCacheLookup::Uncached);
        assert!(store.put_if_current(data("k"), NearCacheRecord::Null, store.epoch()));
        assert_eq!(store.get(&data("k")), NearCacheLookup::Null);
    }

    #[test]
    fn test_store_overwrite() {
        let mut store = NearCacheStore::new(100, None);

        store.put(data("key1"), value("value1"));
        store.put(data("key1"), value("value2"));

        assert_eq!(store.get(&data("key1")), NearCacheLookup::Present(data("value2")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_ttl_expiration() {
        let mut store = NearCacheStore::new(100, Some(Duration::from_millis(50)));

        store.put(data("key1"), value("value1"));
        assert!(matches!(store.get(&data("key1")), NearCacheLookup::Present(_)));

        sleep(Duration::from_millis(80));

        assert_eq!(store.get(&data("key1")), NearCacheLookup::Uncached);
        assert_eq!(store.stats().expirations, 1);
    }

    #[test]
    fn test_store_lru_eviction() {
        let mut store = NearCacheStore::new(3, None);

        store.put(data("key1"), value("value1"));
        store.put(data("key2"), value("value2"));
        store.put(data("key3"), value("value3"));

        // Touch key1 so key2 becomes the oldest
        store.get(&data("key1"));
        store.put(data("key4"), value("value4"));

        assert_eq!(store.len(), 3);
        assert_eq!(store.get(&data("key2")), NearCacheLookup::Uncached);
        assert!(matches!(store.get(&data("key1")), NearCacheLookup::Present(_)));
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_store_zero_capacity_stores_nothing() {
        let mut store = NearCacheStore::new(0, None);
        store.put(data("key1"), value("value1"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_cleanup_expired() {
        let mut store = NearCacheStore::new(100, Some(Duration::from_millis(50)));

        store.put(data("key1"), value("value1"));
        sleep(Duration::from_millis(80));
        store.put(data("key2"), value("value2"));

        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_stats() {
        let mut store = NearCacheStore::new(100, None);

        store.put(data("key1"), value("value1"));
        store.put(data("key2"), NearCacheRecord::Null);
        store.get(&data("key1")); // hit
        store.get(&data("key2")); // null-marker, miss
        store.get(&data("missing")); // miss

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.total_entries, 2);
    }

    #[test]
    fn test_near_cache_shared_between_threads() {
        let near_cache = NearCache::new(&NearCacheConfig::default());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let near_cache = near_cache.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let key = data(&format!("k{}-{}", t, i));
                        near_cache.put(key.clone(), NearCacheRecord::Value(key.clone()));
                        assert_eq!(near_cache.get(&key), NearCacheLookup::Present(key.clone()));
                        near_cache.invalidate(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(near_cache.is_empty());
    }
}
