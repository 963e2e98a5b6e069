//! Query execution: coalescing, stale-while-revalidate, retries and fallback.
//!
//! Every network fetch runs in its own tokio task and is published to callers
//! as a [`Shared`] future keyed by [`CacheKey`], so concurrent requests for
//! one key share a single fetch. The task writes the store before it leaves
//! the in-flight map, so a caller never sees "no entry and no fetch" between
//! the two steps.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use super::entry::EntryStatus;
use super::error::{ErrorClass, FetchError, QueryError};
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::monitor::PerformanceMonitor;
use super::policy::ResourcePolicy;
use super::store::{CacheStore, Completion, FetchTicket};

const SOURCE: &str = "cache::executor";

/// Loads the value behind a cache key from the backend.
#[async_trait]
pub trait Fetcher<V>: Send + Sync
where
    V: Send + 'static,
{
    async fn fetch(&self, key: &CacheKey) -> Result<V, FetchError>;
}

/// Adapter turning an async closure into a [`Fetcher`].
pub struct FnFetcher<F>(F);

#[async_trait]
impl<V, F, Fut> Fetcher<V> for FnFetcher<F>
where
    V: Send + 'static,
    F: Fn(CacheKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, FetchError>> + Send,
{
    async fn fetch(&self, key: &CacheKey) -> Result<V, FetchError> {
        (self.0)(key.clone()).await
    }
}

pub fn fetcher_fn<V, F, Fut>(fetch: F) -> Arc<dyn Fetcher<V>>
where
    V: Send + 'static,
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
{
    Arc::new(FnFetcher(fetch))
}

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Fresh cache hit; no network call.
    Fresh,
    /// Stale cache hit; a background refresh is running.
    Stale,
    /// Loaded from the backend by this call or a coalesced one.
    Fetched,
    /// Refresh failed; the last good value was served instead.
    Fallback,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueSource::Fresh => "fresh",
            ValueSource::Stale => "stale",
            ValueSource::Fetched => "fetched",
            ValueSource::Fallback => "fallback",
        }
    }

    pub fn from_cache(self) -> bool {
        !matches!(self, ValueSource::Fetched)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome<V> {
    pub value: V,
    pub source: ValueSource,
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, QueryError>>>;

struct InFlight<V> {
    id: u64,
    started_at: Instant,
    future: SharedFetch<V>,
}

type InFlightMap<V> = Arc<Mutex<HashMap<CacheKey, InFlight<V>>>>;

enum Lookup<V> {
    Hit(V, ValueSource),
    Wait(SharedFetch<V>),
}

pub struct QueryExecutor<V> {
    store: Arc<CacheStore<V>>,
    monitor: Arc<PerformanceMonitor>,
    in_flight: InFlightMap<V>,
    next_fetch_id: AtomicU64,
}

impl<V> QueryExecutor<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore<V>>, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            store,
            monitor,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_fetch_id: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore<V>> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Resolve `key`, fetching through `fetcher` when the cache cannot answer.
    #[instrument(skip(self, fetcher, policy), fields(key = %key, kind = %policy.kind))]
    pub async fn execute(
        &self,
        key: CacheKey,
        fetcher: Arc<dyn Fetcher<V>>,
        policy: &ResourcePolicy,
    ) -> Result<QueryOutcome<V>, QueryError> {
        let started = Instant::now();

        let result = match self.lookup(&key, fetcher, policy) {
            Lookup::Hit(value, source) => Ok(QueryOutcome { value, source }),
            Lookup::Wait(shared) => match shared.await {
                Ok(value) => Ok(QueryOutcome {
                    value,
                    source: ValueSource::Fetched,
                }),
                Err(error) => self.fallback(&key, error, policy),
            },
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(outcome) => {
                self.monitor.track(elapsed, outcome.source.from_cache());
                debug!(
                    source = outcome.source.as_str(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Query resolved"
                );
            }
            Err(error) => {
                self.monitor.track(elapsed, false);
                warn!(error = %error, outcome = error.as_label(), "Query failed");
            }
        }
        result
    }

    /// Number of fetches currently running.
    pub fn in_flight_count(&self) -> usize {
        mutex_lock(&self.in_flight, SOURCE, "in_flight_count").len()
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        mutex_lock(&self.in_flight, SOURCE, "is_in_flight").contains_key(key)
    }

    pub fn invalidate(&self, key: &CacheKey) -> usize {
        self.store.invalidate(key)
    }

    pub fn invalidate_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheKey) -> bool,
    {
        self.store.invalidate_where(predicate)
    }

    fn lookup(
        &self,
        key: &CacheKey,
        fetcher: Arc<dyn Fetcher<V>>,
        policy: &ResourcePolicy,
    ) -> Lookup<V> {
        let mut in_flight = mutex_lock(&self.in_flight, SOURCE, "lookup");

        if let Some(entry) = self.store.get(key) {
            match entry.status(Instant::now()) {
                EntryStatus::Fresh => return Lookup::Hit(entry.into_value(), ValueSource::Fresh),
                EntryStatus::Stale => {
                    // Stale readers never wait, not even on a revalidation
                    // that is already running.
                    if !in_flight.contains_key(key) {
                        debug!("Serving stale entry; revalidating in background");
                        let _revalidation = self.start_fetch(&mut in_flight, key, fetcher, policy);
                    }
                    return Lookup::Hit(entry.into_value(), ValueSource::Stale);
                }
                EntryStatus::Expired => {}
            }
        }

        if let Some(existing) = in_flight.get(key) {
            debug!(
                fetch_id = existing.id,
                running_ms = existing.started_at.elapsed().as_millis() as u64,
                "Joining in-flight fetch"
            );
            return Lookup::Wait(existing.future.clone());
        }

        Lookup::Wait(self.start_fetch(&mut in_flight, key, fetcher, policy))
    }

    /// Spawn the fetch task and register it. Called with the in-flight map
    /// locked, so the task cannot deregister before it is registered.
    fn start_fetch(
        &self,
        in_flight: &mut HashMap<CacheKey, InFlight<V>>,
        key: &CacheKey,
        fetcher: Arc<dyn Fetcher<V>>,
        policy: &ResourcePolicy,
    ) -> SharedFetch<V> {
        let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ticket = self.store.begin_fetch(key);
        let guard = FetchGuard {
            id,
            ticket,
            store: Arc::clone(&self.store),
            monitor: Arc::clone(&self.monitor),
            in_flight: Arc::clone(&self.in_flight),
        };
        let policy = policy.clone();
        let span = info_span!("fetch", key = %key, fetch_id = id);

        let task = tokio::spawn(
            async move {
                let result = run_fetch(&guard, fetcher.as_ref(), &policy).await;
                drop(guard);
                result
            }
            .instrument(span),
        );

        let task_key = key.clone();
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => Err(QueryError::Aborted {
                    key: task_key,
                    reason: join_error.to_string(),
                }),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(
            key.clone(),
            InFlight {
                id,
                started_at: Instant::now(),
                future: future.clone(),
            },
        );
        future
    }

    fn fallback(
        &self,
        key: &CacheKey,
        error: QueryError,
        policy: &ResourcePolicy,
    ) -> Result<QueryOutcome<V>, QueryError> {
        let allowed = match &error {
            QueryError::Exhausted { .. } | QueryError::Aborted { .. } => true,
            QueryError::Denied { .. } => policy.stale_on_denied,
            // A 404 is a deletion; the entry was already evicted.
            QueryError::NotFound { .. } => false,
        };
        if !allowed {
            return Err(error);
        }

        let Some(entry) = self.store.peek(key) else {
            return Err(error);
        };

        self.store.mark_stale(key);
        self.monitor.track_fallback();
        warn!(
            error = %error,
            age_ms = entry.age(Instant::now()).as_millis() as u64,
            "Refresh failed; serving last good value"
        );
        Ok(QueryOutcome {
            value: entry.into_value(),
            source: ValueSource::Fallback,
        })
    }
}

/// Releases the in-flight slot and the store ticket when the fetch task ends,
/// including when it unwinds.
struct FetchGuard<V> {
    id: u64,
    ticket: FetchTicket,
    store: Arc<CacheStore<V>>,
    monitor: Arc<PerformanceMonitor>,
    in_flight: InFlightMap<V>,
}

impl<V> Drop for FetchGuard<V> {
    fn drop(&mut self) {
        self.store.abandon_fetch(&self.ticket);
        let mut in_flight = mutex_lock(&self.in_flight, SOURCE, "release");
        if in_flight
            .get(self.ticket.key())
            .is_some_and(|entry| entry.id == self.id)
        {
            in_flight.remove(self.ticket.key());
        }
    }
}

async fn run_fetch<V>(
    guard: &FetchGuard<V>,
    fetcher: &dyn Fetcher<V>,
    policy: &ResourcePolicy,
) -> Result<V, QueryError>
where
    V: Clone + Send + Sync + 'static,
{
    let key = guard.ticket.key();
    let fetch_policy = &policy.fetch;
    let attempts = fetch_policy.total_attempts();
    let mut last_error = FetchError::network("no attempt made");

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = fetch_policy.backoff_for_retry(attempt - 1);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }

        // Dropping the fetch future on timeout cancels it and frees the timer.
        let outcome = match tokio::time::timeout(fetch_policy.timeout, fetcher.fetch(key)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::timeout(fetch_policy.timeout)),
        };

        match outcome {
            Ok(value) => {
                let completion =
                    guard
                        .store
                        .complete_fetch(&guard.ticket, value.clone(), policy.staleness);
                match completion {
                    Completion::Stored => debug!(attempt, "Fetch stored"),
                    Completion::Superseded => info!(
                        attempt,
                        "Fetch completed after invalidation; stored as stale"
                    ),
                }
                return Ok(value);
            }
            Err(error) => match error.class() {
                ErrorClass::NotFound => {
                    let evicted = guard.store.invalidate(key);
                    guard.monitor.record_evictions(evicted);
                    info!(error = %error, evicted, "Resource reported missing; cache entry evicted");
                    return Err(QueryError::NotFound { key: key.clone() });
                }
                ErrorClass::Denied => {
                    warn!(error = %error, "Fetch denied; not retrying");
                    return Err(QueryError::Denied {
                        key: key.clone(),
                        status: error.status_code().unwrap_or_default(),
                    });
                }
                ErrorClass::Retryable => {
                    warn!(
                        attempt = attempt + 1,
                        attempts,
                        error = %error,
                        "Fetch attempt failed"
                    );
                    last_error = error;
                }
            },
        }
    }

    Err(QueryError::Exhausted {
        key: key.clone(),
        attempts,
        last: last_error,
    })
}

/// Total time a fetch may take before it gives up, including backoff.
pub fn worst_case_latency(policy: &ResourcePolicy) -> Duration {
    let fetch = &policy.fetch;
    let waiting: Duration = (0..fetch.max_retries)
        .map(|retry| fetch.backoff_for_retry(retry))
        .sum();
    fetch.timeout.saturating_mul(fetch.total_attempts()) + waiting
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::StalenessPolicy;
    use crate::cache::policy::FetchPolicy;
    use crate::domain::types::ResourceDomain;
    use std::sync::atomic::AtomicUsize;

    fn executor() -> QueryExecutor<Arc<Vec<u32>>> {
        QueryExecutor::new(
            Arc::new(CacheStore::new()),
            Arc::new(PerformanceMonitor::default()),
        )
    }

    fn counting_fetcher(
        calls: Arc<AtomicUsize>,
        result: Result<Vec<u32>, FetchError>,
    ) -> Arc<dyn Fetcher<Arc<Vec<u32>>>> {
        fetcher_fn(move |_key| {
            let calls = Arc::clone(&calls);
            let result = result.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                result.map(Arc::new)
            }
        })
    }

    fn policy() -> ResourcePolicy {
        ResourcePolicy::list(
            StalenessPolicy::new(Duration::from_millis(100), Duration::from_millis(500))
                .expect("valid policy"),
        )
    }

    #[tokio::test]
    async fn fresh_hit_skips_fetcher() {
        let executor = executor();
        let key = CacheKey::new(ResourceDomain::Categories);
        executor
            .store()
            .set(key.clone(), Arc::new(vec![1]), policy().staleness);

        let calls = Arc::new(AtomicUsize::new(0));
        let outcome = executor
            .execute(key, counting_fetcher(Arc::clone(&calls), Ok(vec![2])), &policy())
            .await
            .expect("hit");

        assert_eq!(outcome.source, ValueSource::Fresh);
        assert_eq!(*outcome.value, vec![1]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn list_query_retries_three_times() {
        let executor = executor();
        let calls = Arc::new(AtomicUsize::new(0));
        let error = executor
            .execute(
                CacheKey::new(ResourceDomain::Products),
                counting_fetcher(Arc::clone(&calls), Err(FetchError::status(503, "busy"))),
                &policy(),
            )
            .await
            .expect_err("exhausted");

        assert!(matches!(error, QueryError::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(executor.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn detail_query_retries_twice() {
        let executor = executor();
        let calls = Arc::new(AtomicUsize::new(0));
        let detail = ResourcePolicy::detail(policy().staleness);
        let error = executor
            .execute(
                CacheKey::new(ResourceDomain::ProductDetail).with("slug", "buche-tisch"),
                counting_fetcher(Arc::clone(&calls), Err(FetchError::network("reset"))),
                &detail,
            )
            .await
            .expect_err("exhausted");

        assert!(matches!(error, QueryError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn denied_is_not_retried() {
        let executor = executor();
        let calls = Arc::new(AtomicUsize::new(0));
        let error = executor
            .execute(
                CacheKey::new(ResourceDomain::ShopSettings),
                counting_fetcher(Arc::clone(&calls), Err(FetchError::status(403, "forbidden"))),
                &policy(),
            )
            .await
            .expect_err("denied");

        assert_eq!(
            error,
            QueryError::Denied {
                key: CacheKey::new(ResourceDomain::ShopSettings),
                status: 403
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out_and_is_retried() {
        let executor = executor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = fetcher_fn(move |_key| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(Arc::new(vec![call as u32]))
            }
        });

        let started = Instant::now();
        let outcome = executor
            .execute(CacheKey::new(ResourceDomain::Products), fetcher, &policy())
            .await
            .expect("second attempt succeeds");

        assert_eq!(*outcome.value, vec![1]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // 7s timeout plus the first 1s backoff.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(8), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(9), "elapsed {elapsed:?}");
    }

    #[test]
    fn worst_case_latency_adds_timeouts_and_backoff() {
        let list = ResourcePolicy::list(StalenessPolicy::minutes(10, 20));
        assert_eq!(worst_case_latency(&list), Duration::from_secs(4 * 7 + 1 + 2 + 4));
        let detail = ResourcePolicy::detail(StalenessPolicy::minutes(5, 15))
            .with_fetch(FetchPolicy::detail());
        assert_eq!(worst_case_latency(&detail), Duration::from_secs(3 * 5 + 1 + 2));
    }
}
