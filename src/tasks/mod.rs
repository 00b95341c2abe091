//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a proxy is in use.
//!
//! # Tasks
//! - Near-cache sweep: drops expired near-cache records at configured intervals

mod sweep;

pub use sweep::spawn_near_cache_sweep;
