//! Request DTOs for the cache gateway API
//!
//! Defines the structure of incoming HTTP request bodies.

use std::time::Duration;

use serde::Deserialize;

use crate::config::ExpiryPolicy;

/// Request body for the SET operation (PUT /set)
///
/// # Fields
/// - `key`: The cache key to store the value under
/// - `value`: The value to store
/// - `ttl`: Optional lifetime in seconds, applied on the cluster
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    /// The cache key
    pub key: String,
    /// The value to store
    pub value: String,
    /// Optional TTL in seconds
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl SetRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.key.is_empty() {
            return Some("Key cannot be empty".to_string());
        }
        if self.key.len() > 256 {
            return Some("Key exceeds maximum length of 256 characters".to_string());
        }
        if self.ttl == Some(0) {
            return Some("TTL must be positive".to_string());
        }
        None
    }

    /// Expiry policy requested by the client, if any.
    pub fn expiry_policy(&self) -> Option<ExpiryPolicy> {
        self.ttl
            .map(|secs| ExpiryPolicy::created(Duration::from_secs(secs)))
    }
}
