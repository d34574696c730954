//! Shared key/value + pub/sub store.
//!
//! The distributed circuit breaker keeps its records here so every gateway
//! instance sees the same state. Only hash-style reads/writes and fire-and-forget
//! publish/subscribe are required, which maps directly onto Redis `HGETALL`,
//! `HSET`, `DEL`, `PUBLISH` and `SUBSCRIBE`.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Errors raised by a store backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed record at {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Backend holding shared breaker state.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read every field of the hash at `key`; empty when the key does not exist.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Overwrite the given fields of the hash at `key`.
    async fn hset_all(&self, key: &str, fields: HashMap<String, String>) -> Result<(), StoreError>;

    /// Remove the hash at `key`.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Publish `message` on `channel`; returns the number of receivers reached.
    async fn publish(&self, channel: &str, message: String) -> Result<usize, StoreError>;

    /// Subscribe to messages published on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, StoreError>;
}
