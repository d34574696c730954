//! Circuit breaker for upstream protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: upstream assumed down, requests fail fast
//! - Half-Open: testing if the upstream recovered
//!
//! # Design Decisions
//! - One breaker per pipeline name (not global)
//! - Fail fast in Open state, no waiting
//! - Open → Half-Open is evaluated lazily on the next allowance check
//! - Single probe in Half-Open (prevents hammering a recovering upstream)

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::observability::metrics;
use crate::resilience::events::{EventBus, EventKind, ResilienceEvent};

pub use crate::resilience::state::{BreakerConfig, CircuitRecord, CircuitState, Clock, Transition};

/// Common surface of the local and distributed breakers.
#[async_trait]
pub trait Breaker: Send + Sync {
    fn name(&self) -> &str;

    /// Returns true if a call may proceed.
    async fn is_allowed(&self) -> bool;

    async fn record_success(&self);

    async fn record_failure(&self);

    async fn state(&self) -> CircuitState;

    async fn snapshot(&self) -> CircuitRecord;

    /// Force the breaker to `state`, bypassing the transition graph.
    async fn force_state(&self, state: CircuitState);

    /// Back to Closed with cleared counters.
    async fn reset(&self) {
        self.force_state(CircuitState::Closed).await;
    }

    /// Release background handles; the breaker must not be used afterwards.
    fn destroy(&self) {}
}

/// Log, count and publish a state change on the local bus.
pub(crate) fn announce(name: &str, transition: Transition, events: Option<&Arc<EventBus>>) {
    tracing::info!(
        name = %name,
        from = %transition.from,
        to = %transition.to,
        "Circuit breaker state changed"
    );
    metrics::record_breaker_transition(name, transition.to.as_str());

    if let Some(bus) = events {
        let kind = match transition.to {
            CircuitState::Open => EventKind::Open,
            CircuitState::Closed => EventKind::Close,
            CircuitState::HalfOpen => EventKind::HalfOpen,
        };
        bus.emit(ResilienceEvent::new(kind, name));
    }
}

/// In-process circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    record: Mutex<CircuitRecord>,
    clock: Clock,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        let clock = Clock::new();
        Self {
            record: Mutex::new(CircuitRecord::new(name.clone(), clock.now_ms())),
            name,
            config,
            clock,
            events: None,
        }
    }

    /// Publish transitions on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    fn record(&self) -> MutexGuard<'_, CircuitRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply<R>(&self, f: impl FnOnce(&mut CircuitRecord, &BreakerConfig, u64) -> (R, Option<Transition>)) -> R {
        let now = self.clock.now_ms();
        let (result, transition) = {
            let mut record = self.record();
            f(&mut record, &self.config, now)
        };
        if let Some(t) = transition {
            announce(&self.name, t, self.events.as_ref());
        }
        result
    }

    pub fn allow_request(&self) -> bool {
        self.apply(|rec, cfg, now| rec.try_acquire(cfg, now))
    }

    pub fn on_success(&self) {
        self.apply(|rec, cfg, now| ((), rec.on_success(cfg, now)));
    }

    pub fn on_failure(&self) {
        self.apply(|rec, cfg, now| ((), rec.on_failure(cfg, now)));
    }

    pub fn current_state(&self) -> CircuitState {
        self.record().state
    }

    pub fn current_record(&self) -> CircuitRecord {
        self.record().clone()
    }

    pub fn force(&self, state: CircuitState) {
        self.apply(|rec, _, now| ((), rec.force(state, now)));
    }
}

#[async_trait]
impl Breaker for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_allowed(&self) -> bool {
        self.allow_request()
    }

    async fn record_success(&self) {
        self.on_success();
    }

    async fn record_failure(&self) {
        self.on_failure();
    }

    async fn state(&self) -> CircuitState {
        self.current_state()
    }

    async fn snapshot(&self) -> CircuitRecord {
        self.current_record()
    }

    async fn force_state(&self, state: CircuitState) {
        self.force(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::advance;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "upstream",
            BreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_success_threshold(2)
                .with_open_timeout(Duration::from_secs(30))
                .with_monitoring_window(Duration::from_secs(60)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_open_the_circuit() {
        let cb = breaker(5);
        for _ in 0..4 {
            assert!(cb.is_allowed().await);
            cb.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.is_allowed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn open_to_half_open_after_timeout() {
        let cb = breaker(2);
        cb.record_failure().await;
        cb.record_failure().await;

        advance(Duration::from_secs(29)).await;
        assert!(!cb.is_allowed().await);

        advance(Duration::from_secs(1)).await;
        assert!(cb.is_allowed().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        // Only one probe at a time.
        assert!(!cb.is_allowed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_successes_close() {
        let cb = breaker(2);
        cb.record_failure().await;
        cb.record_failure().await;
        advance(Duration::from_secs(30)).await;

        assert!(cb.is_allowed().await);
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        assert!(cb.is_allowed().await);
        cb.record_success().await;

        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.snapshot().await.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let cb = breaker(2);
        cb.record_failure().await;
        cb.record_failure().await;
        advance(Duration::from_secs(30)).await;

        assert!(cb.is_allowed().await);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.is_allowed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_resets_instead_of_opening() {
        let cb = breaker(3);
        cb.record_failure().await;
        cb.record_failure().await;
        advance(Duration::from_secs(61)).await;
        cb.record_failure().await;

        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.snapshot().await.failure_count, 1);
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(move |e| {
            sink.lock().unwrap().push(e.kind);
            Ok(())
        });

        let cb = breaker(1).with_events(bus);
        cb.record_failure().await;
        cb.reset().await;

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Open, EventKind::Close]);
        assert_eq!(cb.state().await, CircuitState::Closed);
    }
}
