//! Cache Proxy Gateway
//!
//! Serves one cache of an in-process cluster over HTTP through a client
//! cache proxy with a near-cache.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cache_proxy::api::{create_router, AppState};
use cache_proxy::{spawn_near_cache_sweep, Config};

/// Main entry point for the cache proxy gateway.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Start the in-process cluster and open the cache proxy
/// 4. Start the near-cache sweep task
/// 5. Create Axum router with all endpoints
/// 6. Start HTTP server on configured port
/// 7. Close the proxy after a graceful shutdown on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cache_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting cache proxy gateway");

    let config = Config::from_env();
    info!(
        "Configuration loaded: cache={}, near_cache={} (max_entries={}, ttl={}s), members={}, partitions={}, port={}",
        config.cache_name,
        config.near_cache_enabled,
        config.near_cache_max_entries,
        config.near_cache_ttl,
        config.member_count,
        config.partition_count,
        config.server_port
    );

    let state = AppState::from_config(&config)
        .await
        .context("failed to open cache proxy")?;
    info!("Cache proxy opened for cache '{}'", state.cache.name());

    let sweep_handle = state
        .cache
        .near_cache()
        .map(|near_cache| spawn_near_cache_sweep(near_cache, config.cleanup_interval));

    let cache = state.cache.clone();
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(handle) = sweep_handle {
        handle.abort();
        warn!("Near-cache sweep task aborted");
    }
    cache.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
