//! Statistics Module
//!
//! Near-cache counters and the client-side cache statistics a proxy keeps
//! for puts, gets and removals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

// == Near Cache Stats ==
/// Near-cache performance counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NearCacheStats {
    /// Lookups answered with a cached record
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries evicted due to LRU policy
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Entries dropped by invalidation
    pub invalidations: u64,
    /// Current number of entries
    pub total_entries: usize,
}

impl NearCacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns hits / (hits + misses), or 0.0 if no lookups have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn record_expirations(&mut self, count: usize) {
        self.expirations += count as u64;
    }

    pub fn record_invalidation(&mut self) {
        self.invalidations += 1;
    }

    pub fn set_total_entries(&mut self, count: usize) {
        self.total_entries = count;
    }
}

// == Cache Statistics ==
/// Client-side operation counters of a cache proxy.
///
/// Counters only grow. The proxy updates them only when statistics are
/// enabled in its configuration.
#[derive(Debug, Default)]
pub struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    removals: AtomicU64,
    get_time_nanos: AtomicU64,
    put_time_nanos: AtomicU64,
    remove_time_nanos: AtomicU64,
}

/// Point-in-time copy of [`CacheStatistics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub gets: u64,
    pub puts: u64,
    pub removals: u64,
    pub average_get_micros: f64,
    pub average_put_micros: f64,
    pub average_remove_micros: f64,
}

fn elapsed_nanos(start: Instant) -> u64 {
    start.elapsed().as_nanos() as u64
}

fn average_micros(total_nanos: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_nanos as f64 / count as f64 / 1_000.0
    }
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one get that found a value.
    pub fn record_hit(&self, start: Instant) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.get_time_nanos
            .fetch_add(elapsed_nanos(start), Ordering::Relaxed);
    }

    /// Records one get that found nothing.
    pub fn record_miss(&self, start: Instant) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.get_time_nanos
            .fetch_add(elapsed_nanos(start), Ordering::Relaxed);
    }

    /// Records a batched read of `hits + misses` keys.
    pub fn record_gets(&self, hits: u64, misses: u64, start: Instant) {
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.misses.fetch_add(misses, Ordering::Relaxed);
        self.get_time_nanos
            .fetch_add(elapsed_nanos(start), Ordering::Relaxed);
    }

    /// Records `count` puts that took `start.elapsed()` in total.
    pub fn record_puts(&self, count: u64, start: Instant) {
        self.puts.fetch_add(count, Ordering::Relaxed);
        self.put_time_nanos
            .fetch_add(elapsed_nanos(start), Ordering::Relaxed);
    }

    /// Records `count` removals that took `start.elapsed()` in total.
    pub fn record_removals(&self, count: u64, start: Instant) {
        self.removals.fetch_add(count, Ordering::Relaxed);
        self.remove_time_nanos
            .fetch_add(elapsed_nanos(start), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let puts = self.puts.load(Ordering::Relaxed);
        let removals = self.removals.load(Ordering::Relaxed);
        let gets = hits + misses;

        CacheStatsSnapshot {
            hits,
            misses,
            gets,
            puts,
            removals,
            average_get_micros: average_micros(self.get_time_nanos.load(Ordering::Relaxed), gets),
            average_put_micros: average_micros(self.put_time_nanos.load(Ordering::Relaxed), puts),
            average_remove_micros: average_micros(
                self.remove_time_nanos.load(Ordering::Relaxed),
                removals,
            ),
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_no_requests() {
        let stats = NearCacheStats::new();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let mut stats = NearCacheStats::new();
        stats.record_hit();
        stats.record_miss();
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_expirations_accumulate() {
        let mut stats = NearCacheStats::new();
        stats.record_expirations(3);
        stats.record_expirations(2);
        assert_eq!(stats.expirations, 5);
    }

    #[test]
    fn test_cache_statistics_counts() {
        let stats = CacheStatistics::new();
        let start = Instant::now();

        stats.record_hit(start);
        stats.record_miss(start);
        stats.record_puts(2, start);
        stats.record_removals(1, start);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.gets, 2);
        assert_eq!(snapshot.puts, 2);
        assert_eq!(snapshot.removals, 1);
    }

    #[test]
    fn test_cache_statistics_empty_averages() {
        let snapshot = CacheStatistics::new().snapshot();
        assert_eq!(snapshot.average_get_micros, 0.0);
        assert_eq!(snapshot.average_put_micros, 0.0);
    }
}
