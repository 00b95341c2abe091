//! Near Cache Module
//!
//! Client-local accelerator for remote reads, with TTL expiration, LRU
//! eviction and invalidate-on-write, plus the proxy's statistics counters.

mod entry;
mod lru;
mod near_cache;
mod stats;


// Re-export public types
pub use entry::{NearCacheEntry, NearCacheLookup, NearCacheRecord};
pub use lru::LruTracker;
pub use near_cache::{NearCache, NearCacheStore};
pub use stats::{CacheStatistics, CacheStatsSnapshot, NearCacheStats};
