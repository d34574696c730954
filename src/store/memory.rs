//! In-process store used for single-node deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use super::{SharedStore, StoreError};

const CHANNEL_CAPACITY: usize = 256;

/// A `SharedStore` backed by process memory. Share it behind an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    hashes: DashMap<String, HashMap<String, String>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreError::Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check()?;
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.value().clone())
            .unwrap_or_default())
    }

    async fn hset_all(&self, key: &str, fields: HashMap<String, String>) -> Result<(), StoreError> {
        self.check()?;
        self.hashes.entry(key.to_string()).or_default().extend(fields);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.hashes.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<usize, StoreError> {
        self.check()?;
        // No subscribers is not an error; publishing is best-effort.
        Ok(self.sender(channel).send(message).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, StoreError> {
        self.check()?;
        Ok(self.sender(channel).subscribe())
    }
}
