//! Resilience events and the observer list that fans them out.
//!
//! Handlers run synchronously at emission time. Each one is invoked behind a
//! guard: an `Err` return or a panic is logged and delivery moves on to the
//! next handler. Nothing a handler does can reach the caller.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::resilience::state::epoch_millis;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Open,
    Close,
    HalfOpen,
    Timeout,
    Failure,
    Success,
    Fallback,
    Reject,
}

/// Call counters attached to outcome events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCounts {
    pub successes: u64,
    pub failures: u64,
    pub rejects: u64,
    pub fallbacks: u64,
    pub timeouts: u64,
}

/// A single resilience event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub name: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<CallCounts>,
}

impl ResilienceEvent {
    pub fn new(kind: EventKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            timestamp: epoch_millis(),
            error: None,
            stats: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_stats(mut self, stats: CallCounts) -> Self {
        self.stats = Some(stats);
        self
    }
}

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&ResilienceEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Identifies a registered handler so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Observer list for resilience events.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(HandlerId, Handler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every event.
    pub fn on<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ResilienceEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler; returns false if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `event` to every handler.
    pub fn emit(&self, event: ResilienceEvent) {
        // Snapshot so handlers may register or remove handlers themselves.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        name = %event.name,
                        kind = ?event.kind,
                        error = %e,
                        "Resilience event handler failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        name = %event.name,
                        kind = ?event.kind,
                        "Resilience event handler panicked"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
