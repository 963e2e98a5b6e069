//! Cache service: one explicit instance owning the store, executor, listener,
//! prefetcher and monitor, with an `init()`/`dispose()` lifecycle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::config::CacheServiceConfig;
use super::entry::EntryStatus;
use super::error::QueryError;
use super::events::CacheNotification;
use super::executor::{Fetcher, QueryExecutor, QueryOutcome, ValueSource};
use super::feed::ChangeFeed;
use super::keys::CacheKey;
use super::listener::{InvalidationListener, ListenerHandle};
use super::lock::mutex_lock;
use super::monitor::{MetricsSnapshot, PageSignal, PerformanceMonitor};
use super::policy::{PolicyTable, ResourcePolicy};
use super::prefetch::{PrefetchHandle, Prefetcher};
use super::store::CacheStore;

const SOURCE: &str = "cache::service";

/// Rows as returned by the backend. Coalesced readers share one allocation.
pub type Rows = Arc<Vec<serde_json::Value>>;

/// What a UI consumer renders from: data, loading flag, staleness and error.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<V> {
    pub data: Option<V>,
    pub is_loading: bool,
    pub is_stale: bool,
    pub error: Option<QueryError>,
}

impl<V> ResourceState<V> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl ResourceState<Rows> {
    /// Decode the rows into typed records.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>, serde_json::Error> {
        match &self.data {
            Some(rows) => rows
                .iter()
                .cloned()
                .map(serde_json::from_value)
                .collect(),
            None => Ok(Vec::new()),
        }
    }
}

struct RuntimeTasks {
    sweeper: JoinHandle<()>,
    listener: ListenerHandle,
}

pub struct CacheService {
    config: CacheServiceConfig,
    policies: Arc<PolicyTable>,
    store: Arc<CacheStore<Rows>>,
    monitor: Arc<PerformanceMonitor>,
    executor: Arc<QueryExecutor<Rows>>,
    listener: Arc<InvalidationListener<Rows>>,
    prefetcher: Prefetcher<Rows>,
    source: Arc<dyn Fetcher<Rows>>,
    feed: Arc<dyn ChangeFeed>,
    runtime: Mutex<Option<RuntimeTasks>>,
}

impl CacheService {
    pub fn new(
        config: CacheServiceConfig,
        source: Arc<dyn Fetcher<Rows>>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        let config = config.normalized();
        let policies = Arc::new(config.policies.clone());
        let store = Arc::new(CacheStore::new());
        let monitor = Arc::new(PerformanceMonitor::new(config.slow_query_threshold));
        let executor = Arc::new(QueryExecutor::new(
            Arc::clone(&store),
            Arc::clone(&monitor),
        ));
        let listener = Arc::new(InvalidationListener::new(
            Arc::clone(&store),
            Arc::clone(&monitor),
            config.listener.clone(),
        ));
        let prefetcher = Prefetcher::new(
            Arc::clone(&executor),
            Arc::clone(&source),
            Arc::clone(&policies),
            config.prefetch_targets.clone(),
        );

        Self {
            config,
            policies,
            store,
            monitor,
            executor,
            listener,
            prefetcher,
            source,
            feed,
            runtime: Mutex::new(None),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the expiry sweeper and the change-feed listener, then fire the
    /// prefetcher when enabled. Calling `init` twice is a no-op.
    pub fn init(&self) -> Option<PrefetchHandle> {
        let mut runtime = mutex_lock(&self.runtime, SOURCE, "init");
        if runtime.is_some() {
            warn!("Cache service already initialised");
            return None;
        }

        let sweeper = spawn_sweeper(Arc::clone(&self.store), self.config.sweep_interval);
        let listener = Arc::clone(&self.listener).start(Arc::clone(&self.feed));
        *runtime = Some(RuntimeTasks { sweeper, listener });
        drop(runtime);

        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            watched = ?self.config.listener.watched_resources(),
            prefetch = self.config.prefetch_enabled,
            "Cache service initialised"
        );

        self.config
            .prefetch_enabled
            .then(|| self.prefetcher.prefetch_all())
    }

    pub fn is_running(&self) -> bool {
        mutex_lock(&self.runtime, SOURCE, "is_running").is_some()
    }

    /// Stop background work. Cached entries stay readable.
    pub async fn dispose(&self) {
        let tasks = mutex_lock(&self.runtime, SOURCE, "dispose").take();
        let Some(tasks) = tasks else {
            debug!("Cache service dispose called while not running");
            return;
        };

        tasks.sweeper.abort();
        let _ = tasks.sweeper.await;
        tasks.listener.stop().await;
        info!(entries = self.store.len(), "Cache service disposed");
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Resolve `key` with the default source and the policy for its domain.
    pub async fn query(&self, key: CacheKey) -> Result<QueryOutcome<Rows>, QueryError> {
        let policy = self.policies.get(key.domain()).clone();
        self.executor
            .execute(key, Arc::clone(&self.source), &policy)
            .await
    }

    /// Resolve `key` and shape the result for rendering.
    pub async fn use_resource(&self, key: CacheKey) -> ResourceState<Rows> {
        let policy = self.policies.get(key.domain()).clone();
        self.use_resource_with(key, Arc::clone(&self.source), &policy)
            .await
    }

    /// Like [`Self::use_resource`] with a caller-supplied fetcher and policy.
    #[instrument(skip(self, fetcher, policy), fields(key = %key))]
    pub async fn use_resource_with(
        &self,
        key: CacheKey,
        fetcher: Arc<dyn Fetcher<Rows>>,
        policy: &ResourcePolicy,
    ) -> ResourceState<Rows> {
        match self.executor.execute(key.clone(), fetcher, policy).await {
            Ok(QueryOutcome { value, source }) => {
                let is_stale = matches!(source, ValueSource::Stale | ValueSource::Fallback);
                ResourceState {
                    data: Some(value),
                    // A stale hit is being revalidated right now.
                    is_loading: self.executor.is_in_flight(&key),
                    is_stale,
                    error: None,
                }
            }
            Err(error) => ResourceState {
                data: None,
                is_loading: false,
                is_stale: false,
                error: Some(error),
            },
        }
    }

    /// Non-blocking view of `key` without triggering a fetch.
    pub fn peek_state(&self, key: &CacheKey) -> ResourceState<Rows> {
        let entry = self.store.get(key);
        let is_stale = entry
            .as_ref()
            .is_some_and(|entry| entry.status(Instant::now()) == EntryStatus::Stale);
        ResourceState {
            data: entry.map(|entry| entry.into_value()),
            is_loading: self.executor.is_in_flight(key),
            is_stale,
            error: None,
        }
    }

    pub fn prefetch_all(&self) -> PrefetchHandle {
        self.prefetcher.prefetch_all()
    }

    pub fn invalidate(&self, key: &CacheKey) -> usize {
        let evicted = self.executor.invalidate(key);
        self.monitor.record_evictions(evicted);
        evicted
    }

    pub fn invalidate_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheKey) -> bool,
    {
        let evicted = self.executor.invalidate_where(predicate);
        self.monitor.record_evictions(evicted);
        evicted
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.monitor.get_metrics()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<MetricsSnapshot> {
        self.monitor.subscribe()
    }

    pub fn reset_metrics(&self) {
        self.monitor.reset();
    }

    pub fn track_page_signal(&self, signal: PageSignal, duration: Duration) {
        self.monitor.track_page_signal(signal, duration);
    }

    pub fn notifications(&self) -> broadcast::Receiver<CacheNotification> {
        self.listener.notifications()
    }

    pub fn config(&self) -> &CacheServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore<Rows>> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<QueryExecutor<Rows>> {
        &self.executor
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }
}

impl Drop for CacheService {
    fn drop(&mut self) {
        if let Some(tasks) = mutex_lock(&self.runtime, SOURCE, "drop").take() {
            tasks.sweeper.abort();
            tasks.listener.abort();
        }
    }
}

fn spawn_sweeper(store: Arc<CacheStore<Rows>>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let removed = store.sweep_expired();
            debug!(removed, remaining = store.len(), "Expiry sweep finished");
        }
    })
}
