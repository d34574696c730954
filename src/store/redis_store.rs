//! Redis-backed store: the fleet-wide home of breaker state.
//!
//! Commands go through a cloned `ConnectionManager`, which reconnects on its
//! own. Each subscribed channel gets one dedicated pub/sub connection whose
//! messages fan out to local receivers through a broadcast channel.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{SharedStore, StoreError};

const CHANNEL_CAPACITY: usize = 256;

pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl RedisStore {
    /// Connect to `url` (`redis://` or `rediss://`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = client.get_connection_manager().await.map_err(unavailable)?;
        tracing::info!(url = %redact(url), "Connected to shared store");
        Ok(Self {
            client,
            conn,
            channels: Arc::new(DashMap::new()),
        })
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// `url` with any password removed, for logging.
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(unavailable)
    }

    async fn hset_all(&self, key: &str, fields: HashMap<String, String>) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, &pairs)
            .await
            .map_err(unavailable)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(unavailable)
    }

    async fn publish(&self, channel: &str, message: String) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, usize>(channel, message)
            .await
            .map_err(unavailable)
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, StoreError> {
        if let Some(tx) = self.channels.get(channel) {
            return Ok(tx.subscribe());
        }

        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub.subscribe(channel).await.map_err(unavailable)?;

        let (tx, rx) = match self.channels.entry(channel.to_string()) {
            // Lost a race with another subscriber; the spare connection is dropped.
            Entry::Occupied(existing) => return Ok(existing.get().subscribe()),
            Entry::Vacant(slot) => {
                let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
                slot.insert(tx.clone());
                (tx, rx)
            }
        };

        let channels = self.channels.clone();
        let name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        let _ = tx.send(payload);
                    }
                    Err(e) => tracing::warn!(channel = %name, error = %e, "Dropped non-text store message"),
                }
            }
            tracing::warn!(channel = %name, "Store subscription ended");
            // Receivers see Closed once the last sender is gone.
            channels.remove(&name);
        });

        Ok(rx)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}
