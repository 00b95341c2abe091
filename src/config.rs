//! Configuration Module
//!
//! Process settings loaded from environment variables, plus the per-cache
//! configuration object a proxy is created from.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the cache served by the gateway
    pub cache_name: String,
    /// Whether the gateway proxy keeps a near-cache
    pub near_cache_enabled: bool,
    /// Maximum number of entries held in the near-cache
    pub near_cache_max_entries: usize,
    /// Near-cache entry TTL in seconds, 0 disables expiry
    pub near_cache_ttl: u64,
    /// Whether client-side statistics are collected
    pub statistics_enabled: bool,
    /// HTTP server port
    pub server_port: u16,
    /// Near-cache expiration sweep interval in seconds
    pub cleanup_interval: u64,
    /// Members started in the in-process cluster
    pub member_count: usize,
    /// Partitions of the in-process cluster
    pub partition_count: u32,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_NAME` - Cache name (default: "default")
    /// - `NEAR_CACHE_ENABLED` - Enable near-cache (default: true)
    /// - `NEAR_CACHE_MAX_ENTRIES` - Near-cache capacity (default: 1000)
    /// - `NEAR_CACHE_TTL` - Near-cache TTL in seconds (default: 300)
    /// - `STATISTICS_ENABLED` - Collect statistics (default: true)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `CLEANUP_INTERVAL` - Sweep frequency in seconds (default: 1)
    /// - `MEMBER_COUNT` - Cluster members (default: 3)
    /// - `PARTITION_COUNT` - Cluster partitions (default: 271)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_name: env::var("CACHE_NAME").unwrap_or(defaults.cache_name),
            near_cache_enabled: env_or("NEAR_CACHE_ENABLED", defaults.near_cache_enabled),
            near_cache_max_entries: env_or("NEAR_CACHE_MAX_ENTRIES", defaults.near_cache_max_entries),
            near_cache_ttl: env_or("NEAR_CACHE_TTL", defaults.near_cache_ttl),
            statistics_enabled: env_or("STATISTICS_ENABLED", defaults.statistics_enabled),
            server_port: env_or("SERVER_PORT", defaults.server_port),
            cleanup_interval: env_or("CLEANUP_INTERVAL", defaults.cleanup_interval),
            member_count: env_or("MEMBER_COUNT", defaults.member_count),
            partition_count: env_or("PARTITION_COUNT", defaults.partition_count),
        }
    }

    /// Builds the configuration of the cache served by the gateway.
    pub fn cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig::new(self.cache_name.clone())
            .with_types::<String, String>()
            .with_statistics(self.statistics_enabled);
        if self.near_cache_enabled {
            let ttl = (self.near_cache_ttl > 0).then(|| Duration::from_secs(self.near_cache_ttl));
            config = config.with_near_cache(NearCacheConfig {
                max_entries: self.near_cache_max_entries,
                time_to_live: ttl,
            });
        }
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_name: "default".to_string(),
            near_cache_enabled: true,
            near_cache_max_entries: 1000,
            near_cache_ttl: 300,
            statistics_enabled: true,
            server_port: 3000,
            cleanup_interval: 1,
            member_count: 3,
            partition_count: 271,
        }
    }
}

// == Expiry Policy ==
/// Server-side expiry durations shipped with read and write requests.
///
/// `None` leaves the corresponding expiry untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryPolicy {
    /// Lifetime of a newly created entry
    pub creation: Option<Duration>,
    /// Lifetime reset applied when an entry is read
    pub access: Option<Duration>,
    /// Lifetime reset applied when an entry is overwritten
    pub update: Option<Duration>,
}

impl ExpiryPolicy {
    /// Entries never expire.
    pub fn eternal() -> Self {
        Self::default()
    }

    /// Entries expire a fixed time after creation or update.
    pub fn created(ttl: Duration) -> Self {
        Self {
            creation: Some(ttl),
            access: None,
            update: Some(ttl),
        }
    }

    /// Entries expire after `ttl` without being read or written.
    pub fn touched(ttl: Duration) -> Self {
        Self {
            creation: Some(ttl),
            access: Some(ttl),
            update: Some(ttl),
        }
    }
}

// == Near Cache Config ==
/// Near-cache sizing and expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NearCacheConfig {
    pub max_entries: usize,
    pub time_to_live: Option<Duration>,
}

impl Default for NearCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            time_to_live: None,
        }
    }
}

// == Cache Config ==
/// Configuration of one cache as seen by its client proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheConfig {
    pub name: String,
    /// Declared key type; keys of another type are rejected
    pub key_type: Option<String>,
    /// Declared value type; values of another type are rejected
    pub value_type: Option<String>,
    pub statistics_enabled: bool,
    pub near_cache: Option<NearCacheConfig>,
    /// Policy used by operations that are not given one explicitly
    pub expiry_policy: ExpiryPolicy,
}

impl CacheConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_type: None,
            value_type: None,
            statistics_enabled: false,
            near_cache: None,
            expiry_policy: ExpiryPolicy::eternal(),
        }
    }

    /// Declares the key and value types the cache accepts.
    pub fn with_types<K: ?Sized, V: ?Sized>(mut self) -> Self {
        self.key_type = Some(std::any::type_name::<K>().to_string());
        self.value_type = Some(std::any::type_name::<V>().to_string());
        self
    }

    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    pub fn with_near_cache(mut self, near_cache: NearCacheConfig) -> Self {
        self.near_cache = Some(near_cache);
        self
    }

    pub fn with_expiry_policy(mut self, policy: ExpiryPolicy) -> Self {
        self.expiry_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.cache_name, "default");
        assert!(config.near_cache_enabled);
        assert_eq!(config.near_cache_max_entries, 1000);
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.member_count, 3);
        assert_eq!(config.partition_count, 271);
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        env::remove_var("CACHE_NAME");
        env::remove_var("NEAR_CACHE_MAX_ENTRIES");
        env::remove_var("SERVER_PORT");
        env::remove_var("PARTITION_COUNT");

        let config = Config::from_env();
        assert_eq!(config.cache_name, "default");
        assert_eq!(config.near_cache_max_entries, 1000);
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.partition_count, 271);
    }

    #[test]
    fn test_cache_config_from_process_config() {
        let config = Config {
            near_cache_ttl: 0,
            ..Config::default()
        };
        let cache_config = config.cache_config();

        assert_eq!(cache_config.name, "default");
        assert!(cache_config.statistics_enabled);
        assert_eq!(cache_config.key_type.as_deref(), Some("alloc::string::String"));
        let near = cache_config.near_cache.unwrap();
        assert_eq!(near.max_entries, 1000);
        assert!(near.time_to_live.is_none());
    }

    #[test]
    fn test_near_cache_disabled() {
        let config = Config {
            near_cache_enabled: false,
            ..Config::default()
        };
        assert!(config.cache_config().near_cache.is_none());
    }
}
