//! Response bodies of the cache gateway
//!
//! Every body names the cache it was served from, so a client talking to
//! several gateways can tell the replies apart.

use serde::Serialize;

use crate::cache::{CacheStatsSnapshot, NearCacheStats};
use crate::error::CacheError;

/// Body of GET /get/:key.
#[derive(Debug, Clone, Serialize)]
pub struct EntryResponse {
    pub cache: String,
    pub key: String,
    pub value: String,
}

impl EntryResponse {
    pub fn new(cache: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            cache: cache.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Acknowledges a single-key write or removal.
#[derive(Debug, Clone, Serialize)]
pub struct KeyAck {
    pub cache: String,
    pub key: String,
    pub message: String,
    /// Lifetime the cluster applies to a stored entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl KeyAck {
    pub fn stored(cache: impl Into<String>, key: impl Into<String>, ttl_secs: Option<u64>) -> Self {
        let (cache, key) = (cache.into(), key.into());
        let message = match ttl_secs {
            Some(secs) => format!("stored '{}' in '{}', expires in {}s", key, cache, secs),
            None => format!("stored '{}' in '{}'", key, cache),
        };
        Self {
            cache,
            key,
            message,
            ttl_secs,
        }
    }

    pub fn removed(cache: impl Into<String>, key: impl Into<String>) -> Self {
        let (cache, key) = (cache.into(), key.into());
        Self {
            message: format!("removed '{}' from '{}'", key, cache),
            cache,
            key,
            ttl_secs: None,
        }
    }
}

/// Body of POST /clear. Clearing fires no entry events on the cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClearResponse {
    pub cache: String,
    pub message: String,
}

impl ClearResponse {
    pub fn new(cache: impl Into<String>) -> Self {
        let cache = cache.into();
        Self {
            message: format!("all entries of '{}' removed", cache),
            cache,
        }
    }
}

/// Body of GET /stats.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub cache: String,
    /// Client-side operation statistics
    pub statistics: CacheStatsSnapshot,
    /// Absent when no near-cache is configured
    pub near_cache: Option<NearCacheStats>,
    /// hits / gets, or 0 before the first get
    pub hit_rate: f64,
}

impl StatsResponse {
    pub fn new(
        cache: impl Into<String>,
        statistics: CacheStatsSnapshot,
        near_cache: Option<NearCacheStats>,
    ) -> Self {
        let hit_rate = if statistics.gets > 0 {
            statistics.hits as f64 / statistics.gets as f64
        } else {
            0.0
        };
        Self {
            cache: cache.into(),
            statistics,
            near_cache,
            hit_rate,
        }
    }
}

/// Body of GET /health. `status` follows the proxy lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub cache: String,
    pub status: &'static str,
    /// RFC 3339
    pub timestamp: String,
}

impl HealthResponse {
    pub fn for_cache(cache: impl Into<String>, closed: bool) -> Self {
        Self {
            cache: cache.into(),
            status: if closed { "closed" } else { "healthy" },
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Body of every failed request.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Stable machine-readable category
    pub kind: &'static str,
}

impl ErrorResponse {
    pub fn not_found(cache: &str, key: &str) -> Self {
        Self {
            error: format!("no entry for key '{}' in cache '{}'", key, cache),
            kind: "not_found",
        }
    }

    pub fn from_error(err: &CacheError) -> Self {
        let kind = match err {
            CacheError::Closed(_) => "closed",
            CacheError::Validation(_) => "validation",
            CacheError::RemoteInvocation(_) => "remote",
            CacheError::EntryProcessor(_) => "entry_processor",
            CacheError::Load(_) => "load",
            CacheError::Serialization(_) => "serialization",
            CacheError::Internal(_) => "internal",
        };
        Self {
            error: err.to_string(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_ack_mentions_ttl_only_when_set() {
        let json = serde_json::to_value(KeyAck::stored("users", "alice", Some(30))).unwrap();
        assert_eq!(json["cache"], "users");
        assert_eq!(json["ttl_secs"], 30);
        assert!(json["message"].as_str().unwrap().contains("30s"));

        let json = serde_json::to_value(KeyAck::stored("users", "alice", None)).unwrap();
        assert!(json.get("ttl_secs").is_none());
        assert_eq!(json["message"], "stored 'alice' in 'users'");
    }

    #[test]
    fn test_removed_ack() {
        let ack = KeyAck::removed("users", "alice");
        assert_eq!(ack.message, "removed 'alice' from 'users'");
        assert_eq!(ack.ttl_secs, None);
    }

    #[test]
    fn test_stats_response_hit_rate() {
        let statistics = CacheStatsSnapshot {
            hits: 80,
            misses: 20,
            gets: 100,
            ..Default::default()
        };
        let resp = StatsResponse::new("users", statistics, None);
        assert!((resp.hit_rate - 0.8).abs() < 0.001);
    }

    #[test]
    fn test_stats_response_before_first_get() {
        let resp = StatsResponse::new("users", CacheStatsSnapshot::default(), None);
        assert_eq!(resp.hit_rate, 0.0);
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json["near_cache"].is_null());
    }

    #[test]
    fn test_health_follows_lifecycle() {
        assert_eq!(HealthResponse::for_cache("users", false).status, "healthy");
        let closed = serde_json::to_value(HealthResponse::for_cache("users", true)).unwrap();
        assert_eq!(closed["status"], "closed");
        assert_eq!(closed["cache"], "users");
        assert!(closed["timestamp"].is_string());
    }

    #[test]
    fn test_error_kinds() {
        let missing = ErrorResponse::not_found("users", "bob");
        assert_eq!(missing.kind, "not_found");
        assert!(missing.error.contains("bob"));

        let closed = ErrorResponse::from_error(&CacheError::Closed("users".to_string()));
        assert_eq!(closed.kind, "closed");
        assert_eq!(closed.error, "Cache is closed: users");
    }
}
