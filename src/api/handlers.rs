//! API Handlers
//!
//! HTTP request handlers for each gateway endpoint. Every handler goes
//! through the cache proxy, so reads use the near-cache and writes reach
//! the partition owner.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::cluster::{ClientContext, LocalCluster};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::models::{
    ClearResponse, EntryResponse, ErrorResponse, HealthResponse, KeyAck, SetRequest,
    StatsResponse,
};
use crate::proxy::CacheProxy;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Proxy of the cache served by the gateway
    pub cache: CacheProxy<String, String>,
}

impl AppState {
    /// Creates a new AppState around an existing proxy.
    pub fn new(cache: CacheProxy<String, String>) -> Self {
        Self { cache }
    }

    /// Starts an in-process cluster sized by the configuration and opens a
    /// proxy for the configured cache on it.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let cluster = Arc::new(LocalCluster::new(config.member_count, config.partition_count));
        let context = ClientContext::from_service(cluster);
        let cache = CacheProxy::create(config.cache_config(), context).await?;
        Ok(Self::new(cache))
    }
}

/// Gateway failure: a cache error or a key with no value.
#[derive(Debug)]
pub enum ApiError {
    Cache(CacheError),
    NotFound { cache: String, key: String },
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        ApiError::Cache(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Cache(err) => err.into_response(),
            ApiError::NotFound { cache, key } => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::not_found(&cache, &key)),
            )
                .into_response(),
        }
    }
}

/// Handler for PUT /set
///
/// Stores a key-value pair with optional TTL.
pub async fn set_handler(
    State(state): State<AppState>,
    Json(req): Json<SetRequest>,
) -> std::result::Result<Json<KeyAck>, ApiError> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::Validation(error_msg).into());
    }

    match req.expiry_policy() {
        Some(policy) => state.cache.put_with_expiry(&req.key, &req.value, policy).await?,
        None => state.cache.put(&req.key, &req.value).await?,
    }

    Ok(Json(KeyAck::stored(state.cache.name(), req.key, req.ttl)))
}

/// Handler for GET /get/:key
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> std::result::Result<Json<EntryResponse>, ApiError> {
    let cache = state.cache.name().to_string();
    match state.cache.get(&key).await? {
        Some(value) => Ok(Json(EntryResponse::new(cache, key, value))),
        None => Err(ApiError::NotFound { cache, key }),
    }
}

/// Handler for DELETE /del/:key
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> std::result::Result<Json<KeyAck>, ApiError> {
    let cache = state.cache.name().to_string();
    if state.cache.remove(&key).await? {
        Ok(Json(KeyAck::removed(cache, key)))
    } else {
        Err(ApiError::NotFound { cache, key })
    }
}

/// Handler for POST /clear
pub async fn clear_handler(State(state): State<AppState>) -> Result<Json<ClearResponse>> {
    state.cache.clear().await?;
    Ok(Json(ClearResponse::new(state.cache.name())))
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(
        state.cache.name(),
        state.cache.statistics(),
        state.cache.near_cache_stats(),
    ))
}

/// Handler for GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::for_cache(state.cache.name(), state.cache.is_closed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_state() -> AppState {
        let config = Config {
            member_count: 2,
            partition_count: 16,
            ..Config::default()
        };
        AppState::from_config(&config).await.unwrap()
    }

    fn set_request(key: &str, value: &str) -> SetRequest {
        SetRequest {
            key: key.to_string(),
            value: value.to_string(),
            ttl: None,
        }
    }

    #[tokio::test]
    async fn test_set_and_get_handler() {
        let state = test_state().await;

        let result = set_handler(State(state.clone()), Json(set_request("test_key", "test_value"))).await;
        assert!(result.is_ok());

        let response = get_handler(State(state), Path("test_key".to_string()))
            .await
            .unwrap();
        assert_eq!(response.cache, "default");
        assert_eq!(response.value, "test_value");
    }

    #[tokio::test]
    async fn test_get_nonexistent_key() {
        let state = test_state().await;

        let result = get_handler(State(state), Path("nonexistent".to_string())).await;
        assert!(matches!(result, Err(ApiError::NotFound { key, .. }) if key == "nonexistent"));
    }

    #[tokio::test]
    async fn test_delete_handler() {
        let state = test_state().await;
        set_handler(State(state.clone()), Json(set_request("to_delete", "value")))
            .await
            .unwrap();

        let ack = delete_handler(State(state.clone()), Path("to_delete".to_string()))
            .await
            .unwrap();
        assert_eq!(ack.message, "removed 'to_delete' from 'default'");

        let again = delete_handler(State(state.clone()), Path("to_delete".to_string())).await;
        assert!(matches!(again, Err(ApiError::NotFound { cache, .. }) if cache == "default"));

        let result = get_handler(State(state), Path("to_delete".to_string())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_clear_handler() {
        let state = test_state().await;
        set_handler(State(state.clone()), Json(set_request("a", "1")))
            .await
            .unwrap();

        let response = clear_handler(State(state.clone())).await.unwrap();
        assert_eq!(response.cache, "default");
        assert_eq!(state.cache.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stats_handler() {
        let state = test_state().await;

        let response = stats_handler(State(state)).await;
        assert_eq!(response.statistics.hits, 0);
        assert_eq!(response.statistics.misses, 0);
        assert!(response.near_cache.is_some());
    }

    #[tokio::test]
    async fn test_health_handler() {
        let state = test_state().await;
        assert_eq!(health_handler(State(state.clone())).await.status, "healthy");

        state.cache.close().await;
        assert_eq!(health_handler(State(state)).await.status, "closed");
    }

    #[tokio::test]
    async fn test_set_invalid_request() {
        let state = test_state().await;

        let result = set_handler(State(state), Json(set_request("", "value"))).await;
        assert!(matches!(result, Err(ApiError::Cache(CacheError::Validation(_)))));
    }
}
