//! Query performance monitor.
//!
//! Purely observational: counters are updated after the fact and never gate a
//! query. Snapshots are published on a `watch` channel for live consumers and
//! mirrored to the `metrics` facade for exporters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) const METRIC_QUERY_TOTAL: &str = "catalog_cache_query_total";
pub(crate) const METRIC_HIT_TOTAL: &str = "catalog_cache_hit_total";
pub(crate) const METRIC_MISS_TOTAL: &str = "catalog_cache_miss_total";
pub(crate) const METRIC_SLOW_TOTAL: &str = "catalog_cache_slow_query_total";
pub(crate) const METRIC_FALLBACK_TOTAL: &str = "catalog_cache_fallback_total";
pub(crate) const METRIC_QUERY_MS: &str = "catalog_cache_query_ms";
pub(crate) const METRIC_PAGE_SIGNAL_MS: &str = "catalog_page_signal_ms";

pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(1000);

/// Point-in-time view of the accumulated counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_duration_ms: u64,
    pub slow_queries: u64,
    pub stale_fallbacks: u64,
    pub evictions: u64,
}

impl MetricsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / self.total_queries as f64
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.total_queries as f64
    }
}

/// Page-level timing signals reported by the rendering layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSignal {
    FirstContentfulPaint,
    LargestContentfulPaint,
    TimeToInteractive,
}

impl PageSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            PageSignal::FirstContentfulPaint => "fcp",
            PageSignal::LargestContentfulPaint => "lcp",
            PageSignal::TimeToInteractive => "tti",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    total_duration_ms: AtomicU64,
    slow_queries: AtomicU64,
    stale_fallbacks: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    counters: Counters,
    slow_threshold: Duration,
    updates: watch::Sender<MetricsSnapshot>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_QUERY_THRESHOLD)
    }
}

impl PerformanceMonitor {
    pub fn new(slow_threshold: Duration) -> Self {
        let (updates, _) = watch::channel(MetricsSnapshot::default());
        Self {
            counters: Counters::default(),
            slow_threshold,
            updates,
        }
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    /// Record one completed query.
    pub fn track(&self, duration: Duration, from_cache: bool) {
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let counters = &self.counters;
        counters.total_queries.fetch_add(1, Ordering::Relaxed);
        counters
            .total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);

        let source = if from_cache {
            counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_HIT_TOTAL).increment(1);
            "cache"
        } else {
            counters.cache_misses.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_MISS_TOTAL).increment(1);
            "network"
        };
        counter!(METRIC_QUERY_TOTAL).increment(1);
        histogram!(METRIC_QUERY_MS, "source" => source).record(duration.as_secs_f64() * 1000.0);

        if duration > self.slow_threshold {
            counters.slow_queries.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_SLOW_TOTAL).increment(1);
            warn!(
                duration_ms,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                source,
                "Slow cache query"
            );
        }

        self.publish();
    }

    /// Record that a failed refresh was answered from cache.
    pub fn track_fallback(&self) {
        self.counters
            .stale_fallbacks
            .fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_FALLBACK_TOTAL).increment(1);
        self.publish();
    }

    pub fn record_evictions(&self, evicted: usize) {
        if evicted == 0 {
            return;
        }
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        self.publish();
    }

    /// Peripheral page timing; recorded as a histogram only.
    pub fn track_page_signal(&self, signal: PageSignal, duration: Duration) {
        histogram!(METRIC_PAGE_SIGNAL_MS, "signal" => signal.as_str())
            .record(duration.as_secs_f64() * 1000.0);
        debug!(
            signal = signal.as_str(),
            duration_ms = duration.as_millis() as u64,
            "Page timing recorded"
        );
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let counters = &self.counters;
        MetricsSnapshot {
            total_queries: counters.total_queries.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: counters.cache_misses.load(Ordering::Relaxed),
            total_duration_ms: counters.total_duration_ms.load(Ordering::Relaxed),
            slow_queries: counters.slow_queries.load(Ordering::Relaxed),
            stale_fallbacks: counters.stale_fallbacks.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Live view; the receiver always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.updates.subscribe()
    }

    /// Run `callback` for every published snapshot until the monitor is
    /// dropped or the returned task is aborted.
    pub fn on_update<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(MetricsSnapshot) + Send + 'static,
    {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let snapshot = *receiver.borrow_and_update();
                callback(snapshot);
            }
        })
    }

    pub fn reset(&self) {
        let counters = &self.counters;
        for counter in [
            &counters.total_queries,
            &counters.cache_hits,
            &counters.cache_misses,
            &counters.total_duration_ms,
            &counters.slow_queries,
            &counters.stale_fallbacks,
            &counters.evictions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.publish();
    }

    fn publish(&self) {
        self.updates.send_replace(self.get_metrics());
    }
}
