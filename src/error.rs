//! Error types for the cache proxy
//!
//! Provides unified error handling using thiserror.
//!
//! `RemoteError` is what a transport future fails with; `CacheError` is what
//! the application sees. The conversion between them keeps the most specific
//! public kind available.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Cache Error Enum ==
/// Unified error type surfaced by the cache proxy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Operation attempted after the proxy was closed
    #[error("Cache is closed: {0}")]
    Closed(String),

    /// Argument rejected locally, before any request was issued
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Transport or server failure surfaced from an invocation future
    #[error("Remote invocation failed: {0}")]
    RemoteInvocation(String),

    /// Entry processor raised an error on the partition owner
    #[error("Entry processor failed: {0}")]
    EntryProcessor(String),

    /// Cache loader failed during load-all
    #[error("Load failed: {0}")]
    Load(String),

    /// Key or value could not be converted to or from its wire form
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == Remote Error Enum ==
/// Failure kinds a transport future can complete with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("target {0} is not a cluster member")]
    TargetNotMember(String),

    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("entry processor error: {0}")]
    Processor(String),

    #[error("cache loader error: {0}")]
    Loader(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected response to {operation}: {response}")]
    UnexpectedResponse {
        operation: &'static str,
        response: String,
    },
}

// == Remote -> Public Translation ==
impl From<RemoteError> for CacheError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Processor(msg) => CacheError::EntryProcessor(msg),
            RemoteError::Loader(msg) => CacheError::Load(msg),
            RemoteError::Serialization(msg) => CacheError::Serialization(msg),
            other => CacheError::RemoteInvocation(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::Closed(_) => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::Validation(_) | CacheError::Serialization(_) => StatusCode::BAD_REQUEST,
            CacheError::RemoteInvocation(_) => StatusCode::BAD_GATEWAY,
            CacheError::EntryProcessor(_) | CacheError::Load(_) | CacheError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(ErrorResponse::from_error(&self))).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache proxy.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_error_keeps_specific_kind() {
        let err: CacheError = RemoteError::Processor("boom".to_string()).into();
        assert_eq!(err, CacheError::EntryProcessor("boom".to_string()));
    }

    #[test]
    fn test_loader_error_keeps_specific_kind() {
        let err: CacheError = RemoteError::Loader("db down".to_string()).into();
        assert_eq!(err, CacheError::Load("db down".to_string()));
    }

    #[test]
    fn test_transport_error_becomes_remote_invocation() {
        let err: CacheError = RemoteError::Transport("connection reset".to_string()).into();
        assert!(matches!(err, CacheError::RemoteInvocation(msg) if msg.contains("connection reset")));
    }

    #[test]
    fn test_closed_maps_to_service_unavailable() {
        let response = CacheError::Closed("users".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
