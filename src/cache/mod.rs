//! Catalog Cache System
//!
//! Client-side data cache for a catalog storefront:
//!
//! - **Store**: keyed entries with fresh / stale / expired lifecycle
//! - **Executor**: coalesced fetches, stale-while-revalidate, retry with backoff
//!   and last-good-value fallback
//! - **Listener**: change-feed driven eviction
//! - **Prefetcher**: start-up warm-up of critical keys
//! - **Monitor**: hit ratio, latency and slow-query accounting
//!
//! [`CacheService`] owns one of each and exposes the `init()`/`dispose()`
//! lifecycle.
//!
//! ## Configuration
//!
//! Timing is controlled via `catalog-cache.toml`:
//!
//! ```toml
//! [cache]
//! sweep_interval_seconds = 60
//! slow_query_ms = 1000
//!
//! [cache.policies.products]
//! stale_after_seconds = 600
//! expire_after_seconds = 1200
//! ```

mod config;
mod entry;
mod error;
mod events;
mod executor;
mod feed;
mod keys;
mod listener;
pub(crate) mod lock;
mod monitor;
mod policy;
mod prefetch;
mod service;
mod store;

pub use config::{
    CacheServiceConfig, ListenerConfig, MIN_RECONNECT_DELAY, MIN_SWEEP_INTERVAL,
    default_prefetch_targets,
};
pub use entry::{CacheEntry, EntryStatus, StalenessPolicy};
pub use error::{ErrorClass, FeedError, FetchError, FetchErrorKind, QueryError};
pub use events::{CacheNotification, ChangeEvent};
pub use executor::{
    FnFetcher, Fetcher, QueryExecutor, QueryOutcome, ValueSource, fetcher_fn, worst_case_latency,
};
pub use feed::{ChangeFeed, DEFAULT_SUBSCRIPTION_CAPACITY, EventHandlerTask, Subscription};
pub use keys::CacheKey;
pub use listener::{InvalidationListener, ListenerHandle, WatchRule};
pub use monitor::{
    DEFAULT_SLOW_QUERY_THRESHOLD, MetricsSnapshot, PageSignal, PerformanceMonitor,
};
pub use policy::{FetchPolicy, PolicyTable, QueryKind, ResourcePolicy};
pub use prefetch::{PrefetchHandle, PrefetchReport, Prefetcher};
pub use service::{CacheService, ResourceState, Rows};
pub use store::{CacheStore, Completion, FetchTicket};

pub(crate) use monitor::{
    METRIC_FALLBACK_TOTAL, METRIC_HIT_TOTAL, METRIC_MISS_TOTAL, METRIC_PAGE_SIGNAL_MS,
    METRIC_QUERY_MS, METRIC_QUERY_TOTAL, METRIC_SLOW_TOTAL,
};
pub(crate) use store::METRIC_CACHE_EVICT_TOTAL;
