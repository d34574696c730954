//! Per-name resilience pipelines.
//!
//! # Call Flow
//! ```text
//! execute(name, op)
//!     → bulkhead.acquire()      (optional; permit released on every exit)
//!     → breaker.is_allowed()    (reject before any attempt)
//!     → retry.execute(op)       (each attempt bounded by call_timeout)
//!     → breaker.record_*()      (one outcome per call, not per attempt)
//! ```
//!
//! Rejections by the bulkhead or the breaker are counted as rejects. They are
//! not call failures and never reach the retry loop.

use dashmap::DashMap;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::time::Instant;

use crate::error::{ProxyError, Result, TransportError};
use crate::resilience::bulkhead::{Bulkhead, BulkheadPermit, BulkheadRegistry, BulkheadState};
use crate::resilience::circuit_breaker::{Breaker, CircuitBreaker, CircuitState};
use crate::resilience::distributed::DistributedCircuitBreaker;
use crate::resilience::events::{EventBus, EventKind, HandlerError, HandlerId, ResilienceEvent};
use crate::resilience::presets::{self, PipelineOptions};
use crate::resilience::retries::RetryExecutor;
use crate::resilience::stats::{PipelineMetrics, PipelineStats};
use crate::store::SharedStore;

/// One named pipeline: breaker, optional bulkhead, retry policy and stats.
pub struct Pipeline {
    name: String,
    options: PipelineOptions,
    breaker: Arc<dyn Breaker>,
    bulkhead: Option<Arc<Bulkhead>>,
    retry: RetryExecutor,
    metrics: PipelineMetrics,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn breaker(&self) -> &Arc<dyn Breaker> {
        &self.breaker
    }

    pub async fn stats(&self) -> PipelineStats {
        self.metrics.snapshot(&self.name, self.breaker.state().await)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("bulkhead", &self.bulkhead)
            .finish_non_exhaustive()
    }
}

/// Registry of pipelines by name, plus the event bus they report to.
pub struct ResilienceManager {
    defaults: PipelineOptions,
    presets: DashMap<String, PipelineOptions>,
    pipelines: DashMap<String, Arc<Pipeline>>,
    bulkheads: BulkheadRegistry,
    events: Arc<EventBus>,
    store: Option<(Arc<dyn SharedStore>, String)>,
    lazy: bool,
}

impl ResilienceManager {
    pub fn new(defaults: PipelineOptions) -> Self {
        Self {
            defaults,
            presets: DashMap::new(),
            pipelines: DashMap::new(),
            bulkheads: BulkheadRegistry::new(),
            events: Arc::new(EventBus::new()),
            store: None,
            lazy: true,
        }
    }

    /// Keep breaker state in `store` under `<prefix>:<name>`.
    pub fn with_store(mut self, store: Arc<dyn SharedStore>, prefix: impl Into<String>) -> Self {
        self.store = Some((store, prefix.into()));
        self
    }

    /// When disabled, executing an unconfigured name is a configuration error.
    pub fn with_lazy_pipelines(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Subscribe to resilience events.
    pub fn on<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ResilienceEvent) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.events.on(handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.events.off(id)
    }

    pub fn register_preset(&self, name: impl Into<String>, options: PipelineOptions) {
        self.presets.insert(name.into(), options);
    }

    /// A registered preset, falling back to the built-ins.
    pub fn preset(&self, name: &str) -> Option<PipelineOptions> {
        self.presets
            .get(name)
            .map(|p| p.value().clone())
            .or_else(|| presets::builtin(name))
    }

    async fn build(&self, name: &str, options: PipelineOptions) -> Pipeline {
        let breaker: Arc<dyn Breaker> = match &self.store {
            Some((store, prefix)) => {
                let cb = DistributedCircuitBreaker::new(name, prefix, options.breaker, store.clone())
                    .with_events(self.events.clone());
                if let Err(e) = cb.subscribe().await {
                    tracing::warn!(name = %name, error = %e, "Could not subscribe to circuit transitions");
                }
                Arc::new(cb)
            }
            None => Arc::new(CircuitBreaker::new(name, options.breaker).with_events(self.events.clone())),
        };
        let bulkhead = options
            .bulkhead
            .map(|cfg| self.bulkheads.get_or_create(name, cfg));

        Pipeline {
            name: name.to_string(),
            retry: RetryExecutor::new(options.retry.clone()),
            metrics: PipelineMetrics::new(options.stats_window, options.stats_buckets),
            options,
            breaker,
            bulkhead,
        }
    }

    /// Create or replace the pipeline for `name`.
    pub async fn configure(&self, name: &str, options: PipelineOptions) -> Arc<Pipeline> {
        self.shutdown(name);
        let pipeline = Arc::new(self.build(name, options).await);
        self.pipelines.insert(name.to_string(), pipeline.clone());
        tracing::debug!(name = %name, "Configured resilience pipeline");
        pipeline
    }

    pub async fn configure_with_preset(&self, name: &str, preset: &str) -> Result<Arc<Pipeline>> {
        let options = self
            .preset(preset)
            .ok_or_else(|| ProxyError::Configuration(format!("unknown preset '{}'", preset)))?;
        Ok(self.configure(name, options).await)
    }

    /// The pipeline for `name`, created from the defaults on first use.
    pub async fn pipeline(&self, name: &str) -> Result<Arc<Pipeline>> {
        if let Some(p) = self.pipelines.get(name) {
            return Ok(p.value().clone());
        }
        if !self.lazy {
            return Err(ProxyError::Configuration(format!(
                "no resilience pipeline configured for '{}'",
                name
            )));
        }

        let built = Arc::new(self.build(name, self.defaults.clone()).await);
        let pipeline = self
            .pipelines
            .entry(name.to_string())
            .or_insert_with(|| built.clone())
            .value()
            .clone();
        if !Arc::ptr_eq(&pipeline, &built) {
            // Lost the race to a concurrent caller.
            built.breaker.destroy();
        }
        Ok(pipeline)
    }

    /// Run `op` through the pipeline for `name`.
    pub async fn execute<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let pipeline = self.pipeline(name).await?;
        self.run(&pipeline, op).await
    }

    /// Like [`execute`](Self::execute), but hands the final error to `fallback`.
    pub async fn execute_with_fallback<T, F, Fut, FB, FbFut>(
        &self,
        name: &str,
        op: F,
        fallback: FB,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(ProxyError) -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        let pipeline = self.pipeline(name).await?;
        match self.run(&pipeline, op).await {
            Ok(value) => Ok(value),
            Err(err) => {
                pipeline.metrics.record_fallback();
                self.events.emit(
                    ResilienceEvent::new(EventKind::Fallback, name)
                        .with_error(&err)
                        .with_stats(pipeline.metrics.counts()),
                );
                fallback(err).await
            }
        }
    }

    async fn run<T, F, Fut>(&self, pipeline: &Pipeline, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = pipeline.name.as_str();
        let _permit: Option<BulkheadPermit> = match &pipeline.bulkhead {
            Some(bulkhead) => match bulkhead.acquire().await {
                Ok(permit) => Some(permit),
                Err(err) => return Err(self.reject(pipeline, err)),
            },
            None => None,
        };

        if !pipeline.breaker.is_allowed().await {
            let err = ProxyError::BreakerOpen {
                name: name.to_string(),
            };
            return Err(self.reject(pipeline, err));
        }

        let call_timeout = pipeline.options.call_timeout;
        let events = &self.events;
        let started = Instant::now();

        let result = pipeline
            .retry
            .execute(name, || {
                let attempt =
                    panic::catch_unwind(AssertUnwindSafe(&mut op)).map(|fut| AssertUnwindSafe(fut).catch_unwind());
                async move {
                    let Ok(attempt) = attempt else {
                        return Err(panicked(name));
                    };
                    let guarded = async move { attempt.await.unwrap_or_else(|_| Err(panicked(name))) };
                    let Some(limit) = call_timeout else {
                        return guarded.await;
                    };
                    match tokio::time::timeout(limit, guarded).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            let err = ProxyError::from(TransportError::Timeout(limit));
                            pipeline.metrics.record_timeout();
                            events.emit(ResilienceEvent::new(EventKind::Timeout, name).with_error(&err));
                            Err(err)
                        }
                    }
                }
            })
            .await;

        let latency = started.elapsed();
        match &result {
            Ok(_) => {
                pipeline.breaker.record_success().await;
                pipeline.metrics.record_success(latency);
                self.events.emit(
                    ResilienceEvent::new(EventKind::Success, name).with_stats(pipeline.metrics.counts()),
                );
            }
            Err(err) => {
                pipeline.breaker.record_failure().await;
                pipeline.metrics.record_failure(latency);
                self.events.emit(
                    ResilienceEvent::new(EventKind::Failure, name)
                        .with_error(err)
                        .with_stats(pipeline.metrics.counts()),
                );
            }
        }
        result
    }

    fn reject(&self, pipeline: &Pipeline, err: ProxyError) -> ProxyError {
        tracing::warn!(name = %pipeline.name, error = %err, "Call rejected");
        pipeline.metrics.record_reject();
        self.events.emit(
            ResilienceEvent::new(EventKind::Reject, pipeline.name.as_str())
                .with_error(&err)
                .with_stats(pipeline.metrics.counts()),
        );
        err
    }

    pub async fn stats(&self, name: &str) -> Option<PipelineStats> {
        let pipeline = self.pipelines.get(name).map(|p| p.value().clone())?;
        Some(pipeline.stats().await)
    }

    pub async fn all_stats(&self) -> Vec<PipelineStats> {
        let mut stats = Vec::new();
        for pipeline in self.snapshot_pipelines() {
            stats.push(pipeline.stats().await);
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub async fn state(&self, name: &str) -> Option<CircuitState> {
        let pipeline = self.pipelines.get(name).map(|p| p.value().clone())?;
        Some(pipeline.breaker.state().await)
    }

    /// Close the breaker for `name`. Returns false for unknown names.
    pub async fn reset(&self, name: &str) -> bool {
        let Some(pipeline) = self.pipelines.get(name).map(|p| p.value().clone()) else {
            return false;
        };
        pipeline.breaker.reset().await;
        tracing::info!(name = %name, "Circuit breaker reset");
        true
    }

    pub async fn reset_all(&self) {
        for pipeline in self.snapshot_pipelines() {
            pipeline.breaker.reset().await;
        }
        tracing::info!("All circuit breakers reset");
    }

    /// Discard the pipeline for `name` and release its background handles.
    pub fn shutdown(&self, name: &str) -> bool {
        self.bulkheads.remove(name);
        match self.pipelines.remove(name) {
            Some((_, pipeline)) => {
                pipeline.breaker.destroy();
                true
            }
            None => false,
        }
    }

    pub fn shutdown_all(&self) {
        for pipeline in self.snapshot_pipelines() {
            pipeline.breaker.destroy();
        }
        self.pipelines.clear();
        self.bulkheads.clear();
    }

    pub fn bulkhead_state(&self, name: &str) -> Option<BulkheadState> {
        self.bulkheads.state(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    // Clone out of the map so no shard lock is held across an await.
    fn snapshot_pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.pipelines.iter().map(|p| p.value().clone()).collect()
    }
}

impl Default for ResilienceManager {
    fn default() -> Self {
        Self::new(PipelineOptions::default())
    }
}

impl std::fmt::Debug for ResilienceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("pipelines", &self.names())
            .field("distributed", &self.store.is_some())
            .field("lazy", &self.lazy)
            .finish_non_exhaustive()
    }
}

/// A panicking attempt counts as an unclassified failure.
fn panicked(name: &str) -> ProxyError {
    tracing::error!(name = %name, "Operation panicked");
    TransportError::Unknown.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::bulkhead::BulkheadConfig;
    use crate::resilience::retries::RetryPolicy;
    use crate::resilience::state::BreakerConfig;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn options(threshold: u32, retries: u32) -> PipelineOptions {
        PipelineOptions::default()
            .with_breaker(
                BreakerConfig::new()
                    .with_failure_threshold(threshold)
                    .with_open_timeout(Duration::from_secs(30)),
            )
            .with_retry(
                RetryPolicy::new()
                    .with_max_retries(retries)
                    .with_base_delay(Duration::from_millis(10)),
            )
    }

    fn refused() -> ProxyError {
        TransportError::ConnectionRefused("upstream".into()).into()
    }

    fn record_kinds(manager: &ResilienceManager) -> Arc<Mutex<Vec<EventKind>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on(move |e| {
            sink.lock().unwrap().push(e.kind);
            Ok(())
        });
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_rejects_without_calling() {
        let manager = ResilienceManager::new(options(5, 0));
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let result = manager
                .execute("users", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(refused()) }
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(manager.state("users").await, Some(CircuitState::Open));

        let err = manager
            .execute("users", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BreakerOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let stats = manager.stats("users").await.unwrap();
        assert_eq!(stats.failures, 5);
        assert_eq!(stats.rejects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_count_as_one_breaker_outcome() {
        let manager = ResilienceManager::new(options(2, 2));
        let calls = AtomicU32::new(0);

        let _ = manager
            .execute("search", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(refused()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.state("search").await, Some(CircuitState::Closed));
        let record = manager.pipeline("search").await.unwrap().breaker().snapshot().await;
        assert_eq!(record.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_runs_when_open() {
        let manager = ResilienceManager::new(options(1, 0));
        let kinds = record_kinds(&manager);
        let _ = manager.execute("ai", || async { Err::<u32, _>(refused()) }).await;

        let value = manager
            .execute_with_fallback("ai", || async { Ok(1) }, |err| async move {
                assert!(matches!(err, ProxyError::BreakerOpen { .. }));
                Ok(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        let kinds = kinds.lock().unwrap();
        assert!(kinds.contains(&EventKind::Open));
        assert!(kinds.contains(&EventKind::Reject));
        assert_eq!(kinds.last(), Some(&EventKind::Fallback));
        assert_eq!(manager.stats("ai").await.unwrap().fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let manager = ResilienceManager::new(
            options(5, 1).with_call_timeout(Some(Duration::from_millis(100))),
        );
        let kinds = record_kinds(&manager);
        let calls = AtomicU32::new(0);

        let result = manager
            .execute("slow", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok("fast enough")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "fast enough");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stats = manager.stats("slow").await.unwrap();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.successes, 1);
        let kinds = kinds.lock().unwrap();
        assert_eq!(*kinds, vec![EventKind::Timeout, EventKind::Success]);
    }

    #[tokio::test]
    async fn full_bulkhead_rejects() {
        let manager = Arc::new(ResilienceManager::new(
            options(5, 0).with_bulkhead(Some(BulkheadConfig::new(1, 0))),
        ));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let busy = tokio::spawn({
            let manager = manager.clone();
            async move {
                let mut gates = Some((started_tx, release_rx));
                manager
                    .execute("db", move || {
                        let gates = gates.take();
                        async move {
                            if let Some((started, release)) = gates {
                                let _ = started.send(());
                                let _ = release.await;
                            }
                            Ok(())
                        }
                    })
                    .await
            }
        });
        started_rx.await.unwrap();

        let err = manager.execute("db", || async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, ProxyError::BulkheadRejected { .. }));
        assert_eq!(manager.bulkhead_state("db").unwrap().active, 1);

        release_tx.send(()).unwrap();
        busy.await.unwrap().unwrap();
        assert_eq!(manager.bulkhead_state("db").unwrap().active, 0);
        assert_eq!(manager.stats("db").await.unwrap().rejects, 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_reach_caller() {
        let manager = ResilienceManager::default();
        manager.on(|_| panic!("observer bug"));
        let seen = record_kinds(&manager);

        let value = manager.execute("svc", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Success]);
    }

    fn explode() -> std::future::Ready<Result<()>> {
        panic!("exploded before returning a future")
    }

    #[tokio::test]
    async fn panicking_operations_count_as_failures() {
        let manager = ResilienceManager::new(options(2, 3));
        let seen = record_kinds(&manager);

        let err = manager
            .execute("svc", || async {
                if manager.names().len() < 10 {
                    panic!("transport exploded");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Transport(TransportError::Unknown)));

        let err = manager.execute("svc", explode).await.unwrap_err();
        assert!(matches!(err, ProxyError::Transport(TransportError::Unknown)));

        assert_eq!(manager.state("svc").await, Some(CircuitState::Open));
        let stats = manager.stats("svc").await.unwrap();
        assert_eq!(stats.failures, 2);
        let kinds = seen.lock().unwrap().clone();
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Failure).count(), 2);
        assert!(kinds.contains(&EventKind::Open));

        let err = manager.execute("svc", || async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, ProxyError::BreakerOpen { .. }));
    }

    #[tokio::test]
    async fn stats_are_idempotent() {
        let manager = ResilienceManager::default();
        manager.execute("svc", || async { Ok(()) }).await.unwrap();
        let a = manager.stats("svc").await.unwrap();
        let b = manager.stats("svc").await.unwrap();
        assert_eq!(a, b);
        assert!(manager.stats("other").await.is_none());
    }

    #[tokio::test]
    async fn configuration_errors() {
        let strict = ResilienceManager::default().with_lazy_pipelines(false);
        let err = strict.execute("ghost", || async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));

        let err = strict.configure_with_preset("ghost", "mainframe").await.unwrap_err();
        assert!(matches!(err, ProxyError::Configuration(_)));

        strict.configure_with_preset("ghost", "database").await.unwrap();
        assert!(strict.execute("ghost", || async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn custom_presets_shadow_builtins() {
        let manager = ResilienceManager::default();
        manager.register_preset("database", options(9, 0));
        let pipeline = manager.configure_with_preset("orders", "database").await.unwrap();
        assert_eq!(pipeline.options().breaker.failure_threshold, 9);
    }

    #[tokio::test]
    async fn reset_and_shutdown() {
        let manager = ResilienceManager::new(options(1, 0));
        let _ = manager.execute("a", || async { Err::<(), _>(refused()) }).await;
        assert_eq!(manager.state("a").await, Some(CircuitState::Open));

        assert!(manager.reset("a").await);
        assert_eq!(manager.state("a").await, Some(CircuitState::Closed));
        assert!(!manager.reset("missing").await);

        assert!(manager.shutdown("a"));
        assert!(manager.names().is_empty());
        assert!(!manager.shutdown("a"));
    }

    #[tokio::test]
    async fn store_backed_pipelines_share_state() {
        let store = Arc::new(MemoryStore::new());
        let a = ResilienceManager::new(options(2, 0)).with_store(store.clone(), "circuit");
        let b = ResilienceManager::new(options(2, 0)).with_store(store.clone(), "circuit");

        let _ = a.execute("billing", || async { Err::<(), _>(refused()) }).await;
        let _ = b.execute("billing", || async { Err::<(), _>(refused()) }).await;

        let err = a.execute("billing", || async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, ProxyError::BreakerOpen { .. }));

        store.set_offline(true);
        assert!(b.execute("billing", || async { Ok(()) }).await.is_ok());

        a.shutdown_all();
        b.shutdown_all();
    }
}
