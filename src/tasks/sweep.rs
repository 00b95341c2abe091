//! Near-cache Sweep Task
//!
//! Background task that periodically drops expired near-cache records.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::NearCache;

/// Spawns a task that removes expired near-cache records every
/// `interval_secs` seconds.
///
/// Lookups already skip expired records; the sweep only bounds how long
/// they keep occupying capacity. Abort the returned handle on shutdown.
///
/// # Example
/// ```ignore
/// let handle = spawn_near_cache_sweep(near_cache.clone(), 1);
/// // Later, during shutdown:
/// handle.abort();
/// ```
pub fn spawn_near_cache_sweep(near_cache: NearCache, interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            "Starting near-cache sweep task with interval of {} seconds",
            interval.as_secs()
        );

        loop {
            tokio::time::sleep(interval).await;

            let removed = near_cache.cleanup_expired();
            if removed > 0 {
                debug!("Near-cache sweep: removed {} expired records", removed);
            }
        }
    })
}
