//! Query executor behaviour against the in-memory backend.
//!
//! Time is paused in every test, so backoff and latency cost nothing and the
//! staleness windows can be stepped through exactly.

use std::sync::Arc;
use std::time::Duration;

use catalog_cache::cache::{
    CacheKey, CacheStore, EntryStatus, FetchError, Fetcher, PerformanceMonitor, QueryError,
    QueryExecutor, ResourcePolicy, Rows, StalenessPolicy, ValueSource,
};
use catalog_cache::domain::types::ResourceDomain;
use catalog_cache::infra::memory::InMemoryBackend;
use futures::future::join_all;
use tokio::time::Instant;

fn executor() -> QueryExecutor<Rows> {
    QueryExecutor::new(
        Arc::new(CacheStore::new()),
        Arc::new(PerformanceMonitor::default()),
    )
}

fn short_list_policy() -> ResourcePolicy {
    ResourcePolicy::list(
        StalenessPolicy::new(Duration::from_millis(100), Duration::from_millis(500))
            .expect("valid policy"),
    )
}

fn short_detail_policy() -> ResourcePolicy {
    ResourcePolicy::detail(
        StalenessPolicy::new(Duration::from_millis(100), Duration::from_millis(500))
            .expect("valid policy"),
    )
}

fn buche_listing() -> CacheKey {
    CacheKey::new(ResourceDomain::Products).with("category", "Buche")
}

/// Wait until no fetch for `key` is running.
async fn settle(executor: &QueryExecutor<Rows>, key: &CacheKey) {
    while executor.is_in_flight(key) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_reads_share_one_fetch() {
    let backend = Arc::new(InMemoryBackend::with_sample_catalog());
    backend.set_latency(Duration::from_millis(50));
    let executor = executor();
    let fetcher: Arc<dyn Fetcher<Rows>> = backend.clone();
    let policy = short_list_policy();
    let key = buche_listing();

    let outcomes = join_all(
        (0..8).map(|_| executor.execute(key.clone(), Arc::clone(&fetcher), &policy)),
    )
    .await;

    assert_eq!(backend.fetch_count(&key), 1);
    let first = outcomes[0].as_ref().expect("rows").value.clone();
    for outcome in &outcomes {
        let outcome = outcome.as_ref().expect("rows");
        assert_eq!(outcome.source, ValueSource::Fetched);
        assert!(Arc::ptr_eq(&first, &outcome.value));
    }
    assert_eq!(executor.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_reads_return_immediately_and_revalidate_once() {
    let backend = Arc::new(InMemoryBackend::with_sample_catalog());
    let executor = executor();
    let fetcher: Arc<dyn Fetcher<Rows>> = backend.clone();
    let policy = short_list_policy();
    let key = buche_listing();

    let loaded = executor
        .execute(key.clone(), Arc::clone(&fetcher), &policy)
        .await
        .expect("initial load");
    assert_eq!(loaded.source, ValueSource::Fetched);

    tokio::time::advance(Duration::from_millis(50)).await;
    let fresh = executor
        .execute(key.clone(), Arc::clone(&fetcher), &policy)
        .await
        .expect("fresh hit");
    assert_eq!(fresh.source, ValueSource::Fresh);
    assert_eq!(backend.fetch_count(&key), 1);

    tokio::time::advance(Duration::from_millis(100)).await;
    let started = Instant::now();
    let stale = executor
        .execute(key.clone(), Arc::clone(&fetcher), &policy)
        .await
        .expect("stale hit");
    assert_eq!(stale.source, ValueSource::Stale);
    assert!(Arc::ptr_eq(&stale.value, &loaded.value));
    assert_eq!(started.elapsed(), Duration::ZERO);

    // A second stale read while revalidating does not start another fetch.
    let again = executor
        .execute(key.clone(), Arc::clone(&fetcher), &policy)
        .await
        .expect("stale hit");
    assert_eq!(again.source, ValueSource::Stale);

    settle(&executor, &key).await;
    assert_eq!(backend.fetch_count(&key), 2);
    assert_eq!(executor.store().status(&key), Some(EntryStatus::Fresh));
}

#[tokio::test(start_paused = true)]
async fn expired_reads_wait_for_a_fresh_fetch() {
    let backend = Arc::new(InMemoryBackend::with_sample_catalog());
    let executor = executor();
    let fetcher: Arc<dyn Fetcher<Rows>> = backend.clone();
    let policy = short_list_policy();
    let key = buche_listing();

    executor
        .execute(key.clone(), Arc::clone(&fetcher), &policy)
        .await
        .expect("initial load");

    tokio::time::advance(Duration::from_millis(600)).await;
    backend.set_latency(Duration::from_millis(30));
    let started = Instant::now();
    let outcome = executor
        .execute(key.clone(), fetcher, &policy)
        .await
        .expect("reload");

    assert_eq!(outcome.source, ValueSource::Fetched);
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(backend.fetch_count(&key), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_refresh_falls_back_to_last_good_value() {
    let backend = Arc::new(InMemoryBackend::with_sample_catalog());
    let executor = executor();
    let fetcher: Arc<dyn Fetcher<Rows>> = backend.clone();
    let policy = short_list_policy();
    let key = buche_listing();

    let loaded = executor
        .execute(key.clone(), Arc::clone(&fetcher), &policy)
        .await
        .expect("initial load");

    tokio::time::advance(Duration::from_millis(600)).await;
    backend.fail_next(
        ResourceDomain::Products,
        FetchError::network("connection reset"),
        10,
    );
    let outcome = executor
        .execute(key.clone(), fetcher, &policy)
        .await
        .expect("fallback instead of an error");

    assert_eq!(outcome.source, ValueSource::Fallback);
    assert!(Arc::ptr_eq(&outcome.value, &loaded.value));
    // One initial load plus four failed attempts.
    assert_eq!(backend.fetch_count(&key), 5);

    let metrics = executor.monitor().get_metrics();
    assert_eq!(metrics.stale_fallbacks, 1);
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.cache_misses, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_fetch_without_cached_value_surfaces_the_error() {
    let backend = Arc::new(InMemoryBackend::with_sample_catalog());
    let executor = executor();
    backend.fail_next(ResourceDomain::Categories, FetchError::status(503, "busy"), 10);

    let error = executor
        .execute(
            CacheKey::new(ResourceDomain::Categories),
            backend.clone(),
            &short_list_policy(),
        )
        .await
        .expect_err("nothing to fall back to");

    match error {
        QueryError::Exhausted { attempts, last, .. } => {
            assert_eq!(attempts, 4);
            assert_eq!(last.status_code(), Some(503));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn not_found_evicts_and_never_falls_back() {
    let backend = Arc::new(InMemoryBackend::with_sample_catalog());
    let executor = executor();
    let fetcher: Arc<dyn Fetcher<Rows>> = backend.clone();
    let policy = short_detail_policy();
    let key = CacheKey::new(ResourceDomain::ProductDetail).with("slug", "buche-tisch");

    executor
        .execute(key.clone(), Arc::clone(&fetcher), &policy)
        .await
        .expect("initial load");

    backend.delete_where(&ResourceDomain::ProductDetail, "slug", "buche-tisch");
    tokio::time::advance(Duration::from_millis(600)).await;
    let error = executor
        .execute(key.clone(), fetcher, &policy)
        .await
        .expect_err("deleted upstream");

    assert_eq!(error, QueryError::NotFound { key: key.clone() });
    assert_eq!(backend.fetch_count(&key), 2);
    assert!(executor.store().peek(&key).is_none());
    assert_eq!(executor.monitor().get_metrics().evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn denied_surfaces_unless_policy_allows_stale() {
    let backend = Arc::new(InMemoryBackend::with_sample_catalog());
    let executor = executor();
    let fetcher: Arc<dyn Fetcher<Rows>> = backend.clone();
    let key = CacheKey::new(ResourceDomain::ShopSettings);
    let strict = short_detail_policy();
    let lenient = short_detail_policy().with_stale_on_denied(true);

    executor
        .execute(key.clone(), Arc::clone(&fetcher), &strict)
        .await
        .expect("initial load");
    tokio::time::advance(Duration::from_millis(600)).await;

    backend.fail_next(ResourceDomain::ShopSettings, FetchError::status(403, "forbidden"), 1);
    let error = executor
        .execute(key.clone(), Arc::clone(&fetcher), &strict)
        .await
        .expect_err("denied");
    assert_eq!(
        error,
        QueryError::Denied {
            key: key.clone(),
            status: 403
        }
    );
    assert_eq!(backend.fetch_count(&key), 2);

    backend.fail_next(ResourceDomain::ShopSettings, FetchError::status(401, "expired"), 1);
    let outcome = executor
        .execute(key.clone(), fetcher, &lenient)
        .await
        .expect("stale value allowed");
    assert_eq!(outcome.source, ValueSource::Fallback);
    assert_eq!(backend.fetch_count(&key), 3);
}

#[tokio::test(start_paused = true)]
async fn invalidation_during_revalidation_leaves_entry_stale() {
    let backend = Arc::new(InMemoryBackend::with_sample_catalog());
    let executor = executor();
    let fetcher: Arc<dyn Fetcher<Rows>> = backend.clone();
    let policy = short_list_policy();
    let key = buche_listing();

    executor
        .execute(key.clone(), Arc::clone(&fetcher), &policy)
        .await
        .expect("initial load");

    tokio::time::advance(Duration::from_millis(150)).await;
    backend.set_latency(Duration::from_millis(100));
    let stale = executor
        .execute(key.clone(), Arc::clone(&fetcher), &policy)
        .await
        .expect("stale hit");
    assert_eq!(stale.source, ValueSource::Stale);
    assert!(executor.is_in_flight(&key));

    assert_eq!(executor.invalidate(&key), 1);
    settle(&executor, &key).await;
    assert_eq!(executor.store().status(&key), Some(EntryStatus::Stale));
    assert_eq!(backend.fetch_count(&key), 2);

    // The superseded result is served once more while exactly one new fetch runs.
    let next = executor
        .execute(key.clone(), fetcher, &policy)
        .await
        .expect("stale hit");
    assert_eq!(next.source, ValueSource::Stale);
    settle(&executor, &key).await;
    assert_eq!(backend.fetch_count(&key), 3);
    assert_eq!(executor.store().status(&key), Some(EntryStatus::Fresh));
}

#[tokio::test]
async fn invalidation_is_idempotent() {
    let executor = executor();
    let key = buche_listing();
    executor.store().set(
        key.clone(),
        Arc::new(Vec::new()),
        short_list_policy().staleness,
    );

    assert_eq!(executor.invalidate(&key), 1);
    assert_eq!(executor.invalidate(&key), 0);
    assert_eq!(executor.invalidate(&CacheKey::new(ResourceDomain::Images)), 0);
    assert!(executor.store().is_empty());
}
