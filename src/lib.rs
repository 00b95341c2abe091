//! Cache Proxy - client-side access to a partitioned remote cache
//!
//! Routes keyed operations to partition owners, keeps an optional near-cache
//! in front of the cluster, and manages cluster-wide listener registration.

pub mod api;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod models;
pub mod protocol;
pub mod proxy;
pub mod serialization;
pub mod tasks;

pub use api::AppState;
pub use cluster::{ClientContext, LocalCluster};
pub use config::{CacheConfig, Config, ExpiryPolicy, NearCacheConfig};
pub use error::{CacheError, RemoteError, Result};
pub use proxy::CacheProxy;
pub use serialization::{CacheKey, Data, SerializationService};
pub use tasks::spawn_near_cache_sweep;
