//! Bounded-concurrency gate with a FIFO wait queue.
//!
//! # Admission
//! ```text
//! active < max_concurrent          → admitted immediately
//! queued < max_queue_length        → wait in FIFO order
//! otherwise                        → rejected, never queued
//! ```
//!
//! A freed slot is handed directly to the longest waiting caller, so `active`
//! never drops and climbs again between the two.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use crate::error::{ProxyError, Result};
use crate::observability::metrics;

/// Limits of one bulkhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    pub max_queue_length: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            max_queue_length: 100,
        }
    }
}

impl BulkheadConfig {
    pub fn new(max_concurrent: usize, max_queue_length: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            max_queue_length,
        }
    }
}

/// Point-in-time view of a bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkheadState {
    pub name: String,
    pub max_concurrent: usize,
    pub max_queue_length: usize,
    pub active: usize,
    pub queued: usize,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    active: usize,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

/// A named concurrency limiter.
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    inner: Mutex<Inner>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a slot. The returned permit frees it on drop.
    pub async fn acquire(self: &Arc<Self>) -> Result<BulkheadPermit> {
        let (id, rx) = {
            let mut inner = self.lock();
            if inner.active < self.config.max_concurrent {
                inner.active += 1;
                return Ok(BulkheadPermit {
                    bulkhead: self.clone(),
                });
            }
            if inner.queue.len() >= self.config.max_queue_length {
                drop(inner);
                tracing::warn!(
                    name = %self.name,
                    max_concurrent = self.config.max_concurrent,
                    max_queue_length = self.config.max_queue_length,
                    "Bulkhead full, rejecting"
                );
                metrics::record_bulkhead_rejection(&self.name);
                return Err(self.rejected());
            }
            let id = inner.next_id;
            inner.next_id += 1;
            let (tx, rx) = oneshot::channel();
            inner.queue.push_back(Waiter { id, tx });
            tracing::debug!(name = %self.name, queued = inner.queue.len(), "Queued for bulkhead slot");
            (id, rx)
        };

        let mut guard = QueuedWaiter {
            bulkhead: self,
            id,
            granted: false,
        };
        match rx.await {
            Ok(()) => {
                guard.granted = true;
                Ok(BulkheadPermit {
                    bulkhead: self.clone(),
                })
            }
            Err(_) => Err(self.rejected()),
        }
    }

    /// Free one slot, handing it to the oldest live waiter if there is one.
    fn release(&self) {
        let mut inner = self.lock();
        while let Some(waiter) = inner.queue.pop_front() {
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
        inner.active = inner.active.saturating_sub(1);
    }

    pub fn state(&self) -> BulkheadState {
        let inner = self.lock();
        BulkheadState {
            name: self.name.clone(),
            max_concurrent: self.config.max_concurrent,
            max_queue_length: self.config.max_queue_length,
            active: inner.active,
            queued: inner.queue.len(),
        }
    }

    fn rejected(&self) -> ProxyError {
        ProxyError::BulkheadRejected {
            name: self.name.clone(),
            max_concurrent: self.config.max_concurrent,
            max_queue_length: self.config.max_queue_length,
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("active", &state.active)
            .field("queued", &state.queued)
            .finish()
    }
}

/// Removes an abandoned waiter from the queue, or passes on a slot that was
/// granted after the waiter stopped listening.
struct QueuedWaiter<'a> {
    bulkhead: &'a Bulkhead,
    id: u64,
    granted: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        let mut inner = self.bulkhead.lock();
        if let Some(pos) = inner.queue.iter().position(|w| w.id == self.id) {
            inner.queue.remove(pos);
            return;
        }
        drop(inner);
        self.bulkhead.release();
    }
}

/// Holds one bulkhead slot until dropped.
#[derive(Debug)]
pub struct BulkheadPermit {
    bulkhead: Arc<Bulkhead>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.bulkhead.release();
    }
}

/// Bulkheads by name, one per pipeline.
#[derive(Debug, Default)]
pub struct BulkheadRegistry {
    bulkheads: DashMap<String, Arc<Bulkhead>>,
}

impl BulkheadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bulkhead for `name`, created with `config` on first use.
    pub fn get_or_create(&self, name: &str, config: BulkheadConfig) -> Arc<Bulkhead> {
        self.bulkheads
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.get(name).map(|b| b.value().clone())
    }

    /// Acquire a slot on an existing bulkhead.
    pub async fn acquire(&self, name: &str) -> Result<BulkheadPermit> {
        let bulkhead = self
            .get(name)
            .ok_or_else(|| ProxyError::Configuration(format!("no bulkhead named '{}'", name)))?;
        bulkhead.acquire().await
    }

    pub fn state(&self, name: &str) -> Option<BulkheadState> {
        self.bulkheads.get(name).map(|b| b.state())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.bulkheads.remove(name).is_some()
    }

    pub fn clear(&self) {
        self.bulkheads.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn bulkhead(max_concurrent: usize, max_queue_length: usize) -> Arc<Bulkhead> {
        Arc::new(Bulkhead::new("db", BulkheadConfig::new(max_concurrent, max_queue_length)))
    }

    #[tokio::test]
    async fn admits_queues_then_rejects() {
        let bh = bulkhead(2, 1);
        let first = bh.acquire().await.unwrap();
        let _second = bh.acquire().await.unwrap();

        let queued = tokio::spawn({
            let bh = bh.clone();
            async move { bh.acquire().await }
        });
        tokio::task::yield_now().await;
        while bh.state().queued == 0 {
            tokio::task::yield_now().await;
        }

        let err = bh.acquire().await.unwrap_err();
        assert!(matches!(err, ProxyError::BulkheadRejected { max_concurrent: 2, max_queue_length: 1, .. }));

        drop(first);
        let third = timeout(Duration::from_secs(1), queued).await.unwrap().unwrap();
        assert!(third.is_ok());

        let state = bh.state();
        assert_eq!(state.active, 2);
        assert_eq!(state.queued, 0);
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let bh = bulkhead(1, 3);
        let held = bh.acquire().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..3 {
            let worker = bh.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = worker.acquire().await.unwrap();
                tx.send(i).unwrap();
                drop(permit);
            });
            while bh.state().queued != i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(held);
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(bh.state().active, 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_leaves_queue() {
        let bh = bulkhead(1, 1);
        let held = bh.acquire().await.unwrap();

        let attempt = timeout(Duration::from_millis(10), bh.acquire()).await;
        assert!(attempt.is_err());
        assert_eq!(bh.state().queued, 0);

        drop(held);
        assert_eq!(bh.state().active, 0);
        let _again = bh.acquire().await.unwrap();
        assert_eq!(bh.state().active, 1);
    }

    #[tokio::test]
    async fn registry_shares_by_name() {
        let registry = BulkheadRegistry::new();
        let a = registry.get_or_create("api", BulkheadConfig::new(1, 0));
        let b = registry.get_or_create("api", BulkheadConfig::new(9, 9));
        assert!(Arc::ptr_eq(&a, &b));

        let _permit = registry.acquire("api").await.unwrap();
        assert!(registry.acquire("api").await.is_err());
        assert!(matches!(
            registry.acquire("missing").await,
            Err(ProxyError::Configuration(_))
        ));
        assert_eq!(registry.state("api").unwrap().active, 1);
    }
}
