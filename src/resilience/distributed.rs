//! Circuit breaker whose record lives in a shared store.
//!
//! Every gateway instance reads and writes the same hash at `<prefix>:<name>`,
//! so a circuit opened by one instance is open for all of them. Each
//! mutation is a plain read-modify-write: two instances racing on the same
//! record can lose an update, which the coarse thresholds absorb.
//!
//! State transitions are also published on `<prefix>:events`. Publishing is
//! best effort; nothing depends on a subscriber being present.
//!
//! The store is never allowed to block traffic. Any store failure is logged
//! and the call is allowed through.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::resilience::circuit_breaker::{announce, Breaker};
use crate::resilience::events::EventBus;
use crate::resilience::state::{BreakerConfig, CircuitRecord, CircuitState, Clock, Transition};
use crate::store::{SharedStore, StoreError};

/// Message published on the events channel for every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionMessage {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub timestamp: u64,
    /// Id of the publishing instance.
    pub instance: String,
}

pub struct DistributedCircuitBreaker {
    name: String,
    key: String,
    channel: String,
    instance_id: String,
    config: BreakerConfig,
    store: Arc<dyn SharedStore>,
    clock: Clock,
    events: Option<Arc<EventBus>>,
    peer_states: Arc<DashMap<String, TransitionMessage>>,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl DistributedCircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        prefix: &str,
        config: BreakerConfig,
        store: Arc<dyn SharedStore>,
    ) -> Self {
        let name = name.into();
        Self {
            key: format!("{}:{}", prefix, name),
            channel: format!("{}:events", prefix),
            instance_id: Uuid::new_v4().to_string(),
            name,
            config,
            store,
            clock: Clock::new(),
            events: None,
            peer_states: Arc::new(DashMap::new()),
            subscription: Mutex::new(None),
        }
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Last transition announced by another instance for `name`.
    pub fn peer_state(&self, name: &str) -> Option<TransitionMessage> {
        self.peer_states.get(name).map(|m| m.value().clone())
    }

    /// Read the record, seeding a Closed one when the key does not exist yet.
    pub async fn load(&self) -> Result<CircuitRecord, StoreError> {
        let fields = self.store.hget_all(&self.key).await?;
        if fields.is_empty() {
            let record = CircuitRecord::new(self.name.clone(), self.clock.now_ms());
            self.store.hset_all(&self.key, record.to_fields()).await?;
            return Ok(record);
        }
        CircuitRecord::from_fields(&self.name, &self.key, &fields)
    }

    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut CircuitRecord, &BreakerConfig, u64) -> (R, Option<Transition>),
    ) -> Result<R, StoreError> {
        let mut record = self.load().await?;
        let before = record.clone();
        let (result, transition) = f(&mut record, &self.config, self.clock.now_ms());

        if record != before {
            self.store.hset_all(&self.key, record.to_fields()).await?;
        }
        if let Some(t) = transition {
            announce(&self.name, t, self.events.as_ref());
            self.publish(t, record.last_state_change_at).await;
        }
        Ok(result)
    }

    async fn publish(&self, transition: Transition, timestamp: u64) {
        let message = TransitionMessage {
            name: self.name.clone(),
            from: transition.from,
            to: transition.to,
            timestamp,
            instance: self.instance_id.clone(),
        };
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(name = %self.name, error = %e, "Failed to encode transition message");
                return;
            }
        };
        if let Err(e) = self.store.publish(&self.channel, payload).await {
            tracing::warn!(name = %self.name, channel = %self.channel, error = %e, "Failed to publish transition");
        }
    }

    /// Start listening for transitions published by other instances.
    pub async fn subscribe(&self) -> Result<(), StoreError> {
        let mut rx = self.store.subscribe(&self.channel).await?;
        let peers = self.peer_states.clone();
        let own_id = self.instance_id.clone();
        let channel = self.channel.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(raw) => match serde_json::from_str::<TransitionMessage>(&raw) {
                        Ok(msg) if msg.instance == own_id => {}
                        Ok(msg) => {
                            tracing::debug!(
                                name = %msg.name,
                                from = %msg.from,
                                to = %msg.to,
                                instance = %msg.instance,
                                "Peer circuit transition"
                            );
                            peers.insert(msg.name.clone(), msg);
                        }
                        Err(e) => {
                            tracing::warn!(channel = %channel, error = %e, "Ignoring malformed transition message");
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel, skipped, "Transition subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let previous = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(old) = previous {
            old.abort();
        }
        Ok(())
    }

    fn degraded(&self, op: &str, err: &StoreError) {
        tracing::warn!(
            name = %self.name,
            key = %self.key,
            op,
            error = %err,
            "Shared store unavailable, circuit breaker degraded to allow"
        );
    }

    fn fallback_record(&self) -> CircuitRecord {
        let mut record = CircuitRecord::new(self.name.clone(), self.clock.now_ms());
        if let Some(peer) = self.peer_state(&self.name) {
            record.state = peer.to;
            record.last_state_change_at = peer.timestamp;
        }
        record
    }
}

#[async_trait]
impl Breaker for DistributedCircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_allowed(&self) -> bool {
        match self.mutate(|rec, cfg, now| rec.try_acquire(cfg, now)).await {
            Ok(allowed) => allowed,
            Err(e) => {
                self.degraded("is_allowed", &e);
                true
            }
        }
    }

    async fn record_success(&self) {
        if let Err(e) = self.mutate(|rec, cfg, now| ((), rec.on_success(cfg, now))).await {
            self.degraded("record_success", &e);
        }
    }

    async fn record_failure(&self) {
        if let Err(e) = self.mutate(|rec, cfg, now| ((), rec.on_failure(cfg, now))).await {
            self.degraded("record_failure", &e);
        }
    }

    async fn state(&self) -> CircuitState {
        self.snapshot().await.state
    }

    async fn snapshot(&self) -> CircuitRecord {
        match self.load().await {
            Ok(record) => record,
            Err(e) => {
                self.degraded("snapshot", &e);
                self.fallback_record()
            }
        }
    }

    async fn force_state(&self, state: CircuitState) {
        if let Err(e) = self.mutate(|rec, _, now| ((), rec.force(state, now))).await {
            self.degraded("force_state", &e);
        }
    }

    fn destroy(&self) {
        if let Some(handle) = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for DistributedCircuitBreaker {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for DistributedCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCircuitBreaker")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
