//! Near Cache Entry Module
//!
//! Defines the records kept by the near-cache and the result of a lookup.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::serialization::Data;

// == Near Cache Record ==
/// What the near-cache holds for a key.
///
/// `Null` is the marker for "the server confirmed there is no value", which
/// differs from the key not being cached at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NearCacheRecord {
    Null,
    Value(Data),
}

impl NearCacheRecord {
    /// Builds a record from a remote lookup result.
    pub fn from_remote(value: Option<Data>) -> Self {
        match value {
            Some(data) => NearCacheRecord::Value(data),
            None => NearCacheRecord::Null,
        }
    }
}

// == Near Cache Lookup ==
/// Outcome of a near-cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NearCacheLookup {
    /// Key not cached (never stored, invalidated, evicted or expired)
    Uncached,
    /// Cached null-marker
    Null,
    /// Cached value
    Present(Data),
}

impl NearCacheLookup {
    /// Returns the cached value when it can answer a read without a remote call.
    pub fn into_present(self) -> Option<Data> {
        match self {
            NearCacheLookup::Present(data) => Some(data),
            NearCacheLookup::Uncached | NearCacheLookup::Null => None,
        }
    }
}

// == Near Cache Entry ==
/// A single near-cache record with expiry metadata.
#[derive(Debug, Clone)]
pub struct NearCacheEntry {
    /// The cached record
    pub record: NearCacheRecord,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expires_at: Option<u64>,
}

impl NearCacheEntry {
    // == Constructor ==
    /// Creates a new entry with optional TTL.
    pub fn new(record: NearCacheRecord, ttl: Option<Duration>) -> Self {
        let now = current_timestamp_ms();
        let expires_at = ttl.map(|ttl| now + ttl.as_millis() as u64);

        Self {
            record,
            created_at: now,
            expires_at,
        }
    }

    // == Is Expired ==
    /// An entry is expired once the current time reaches its expiration time.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => current_timestamp_ms() >= expires,
            None => false,
        }
    }

    /// Returns remaining TTL in milliseconds, or None if no expiration is set.
    pub fn ttl_remaining_ms(&self) -> Option<u64> {
        self.expires_at
            .map(|expires| expires.saturating_sub(current_timestamp_ms()))
    }

    /// Converts the stored record into a lookup result.
    pub fn lookup(&self) -> NearCacheLookup {
        match &self.record {
            NearCacheRecord::Null => NearCacheLookup::Null,
            NearCacheRecord::Value(data) => NearCacheLookup::Present(data.clone()),
        }
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn data(text: &'static str) -> Data {
        Data::from_bytes(text.as_bytes())
    }

    #[test]
    fn test_entry_creation_no_ttl() {
        let entry = NearCacheEntry::new(NearCacheRecord::Value(data("v")), None);

        assert!(entry.expires_at.is_none());
        assert!(!entry.is_expired());
        assert!(entry.ttl_remaining_ms().is_none());
    }

    #[test]
    fn test_entry_expiration() {
        let entry = NearCacheEntry::new(
            NearCacheRecord::Value(data("v")),
            Some(Duration::from_millis(50)),
        );
        assert!(!entry.is_expired());

        sleep(Duration::from_millis(80));

        assert!(entry.is_expired());
        assert_eq!(entry.ttl_remaining_ms(), Some(0));
    }

    #[test]
    fn test_null_marker_lookup_is_not_present() {
        let entry = NearCacheEntry::new(NearCacheRecord::from_remote(None), None);
        assert_eq!(entry.lookup(), NearCacheLookup::Null);
        assert!(entry.lookup().into_present().is_none());
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let now = current_timestamp_ms();
        let entry = NearCacheEntry {
            record: NearCacheRecord::Null,
            created_at: now,
            expires_at: Some(now),
        };

        assert!(entry.is_expired(), "Entry should be expired at boundary");
    }
}
