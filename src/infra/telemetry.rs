use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_EVICT_TOTAL, METRIC_FALLBACK_TOTAL, METRIC_HIT_TOTAL, METRIC_MISS_TOTAL,
    METRIC_PAGE_SIGNAL_MS, METRIC_QUERY_MS, METRIC_QUERY_TOTAL, METRIC_SLOW_TOTAL,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_QUERY_TOTAL,
            Unit::Count,
            "Total number of resolved cache queries."
        );
        describe_counter!(
            METRIC_HIT_TOTAL,
            Unit::Count,
            "Queries answered from cache, including stale and fallback answers."
        );
        describe_counter!(
            METRIC_MISS_TOTAL,
            Unit::Count,
            "Queries that waited on a network fetch."
        );
        describe_counter!(
            METRIC_SLOW_TOTAL,
            Unit::Count,
            "Queries slower than the configured threshold."
        );
        describe_counter!(
            METRIC_FALLBACK_TOTAL,
            Unit::Count,
            "Failed refreshes answered with the last good value."
        );
        describe_counter!(
            METRIC_CACHE_EVICT_TOTAL,
            Unit::Count,
            "Cache entries removed by invalidation or expiry sweeps."
        );
        describe_histogram!(
            METRIC_QUERY_MS,
            Unit::Milliseconds,
            "Query latency in milliseconds, labelled by answer source."
        );
        describe_histogram!(
            METRIC_PAGE_SIGNAL_MS,
            Unit::Milliseconds,
            "Page timing signals (fcp, lcp, tti) in milliseconds."
        );
    });
}
