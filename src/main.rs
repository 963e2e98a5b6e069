use std::{process, sync::Arc, time::Duration};

use catalog_cache::{
    cache::{
        CacheKey, CacheService, CacheServiceConfig, PageSignal, ResourcePolicy, worst_case_latency,
    },
    config,
    domain::types::ResourceDomain,
    error::AppError,
    infra::{memory::InMemoryBackend, telemetry},
};
use tokio::time::Instant;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const SUBSCRIBE_WAIT: Duration = Duration::from_secs(2);
const NOTIFICATION_WAIT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Demo(config::DemoArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Check(_) => run_check(&settings),
        config::Command::Demo(_) => run_demo(&settings).await,
    }
}

fn run_check(settings: &config::Settings) -> Result<(), AppError> {
    let policies = &settings.cache.policies;
    println!(
        "{:<16} {:<7} {:>10} {:>11} {:>9} {:>8} {:>11}",
        "domain", "kind", "stale_s", "expire_s", "timeout", "retries", "worst_case"
    );
    for (domain, policy) in policies.iter() {
        print_policy_row(&domain.to_string(), policy);
    }
    print_policy_row("(fallback)", policies.fallback());

    println!(
        "sweep every {}s, slow query above {}ms, prefetch {}",
        settings.cache.sweep_interval.as_secs(),
        settings.cache.slow_query_threshold.as_millis(),
        if settings.prefetch.enabled { "on" } else { "off" }
    );
    info!(domains = policies.iter().count(), "Configuration is valid");
    Ok(())
}

fn print_policy_row(name: &str, policy: &ResourcePolicy) {
    println!(
        "{:<16} {:<7} {:>10} {:>11} {:>8}s {:>8} {:>10}s",
        name,
        policy.kind.as_str(),
        policy.staleness.stale_after().as_secs(),
        policy.staleness.expire_after().as_secs(),
        policy.fetch.timeout.as_secs(),
        policy.fetch.max_retries,
        worst_case_latency(policy).as_secs(),
    );
}

async fn run_demo(settings: &config::Settings) -> Result<(), AppError> {
    let started = Instant::now();
    let backend = Arc::new(InMemoryBackend::with_sample_catalog());
    let service = CacheService::new(
        CacheServiceConfig::from(settings),
        backend.clone(),
        backend.clone(),
    );

    if let Some(prefetch) = service.init() {
        let report = prefetch.join().await;
        info!(
            warmed = report.warmed.len(),
            failed = report.failed.len(),
            "Critical keys warmed"
        );
    }

    // Two readers in the same tick share one fetch.
    let buche = CacheKey::new(ResourceDomain::Products).with("category", "Buche");
    let (first, second) = tokio::join!(service.query(buche.clone()), service.query(buche.clone()));
    let (first, second) = (first?, second?);
    info!(
        key = %buche,
        rows = first.value.len(),
        shared = Arc::ptr_eq(&first.value, &second.value),
        fetches = backend.fetch_count(&buche),
        "Coalesced listing read"
    );

    let images = CacheKey::new(ResourceDomain::Images).with("entity", "buche");
    let before = service.query(images.clone()).await?;
    info!(key = %images, rows = before.value.len(), "Images loaded");

    wait_for_feed(&backend).await;
    let mut notifications = service.notifications();
    backend.delete_where(&ResourceDomain::Images, "slug", "buche-25cm-hauptbild");
    match tokio::time::timeout(NOTIFICATION_WAIT, notifications.recv()).await {
        Ok(Ok(notification)) => info!(
            identifier = notification.identifier.as_deref().unwrap_or("*"),
            evicted = notification.evicted,
            "Invalidation applied"
        ),
        Ok(Err(err)) => warn!(error = %err, "Notification not received"),
        Err(_) => warn!("No invalidation observed"),
    }

    let after = service.query(images.clone()).await?;
    info!(
        key = %images,
        rows = after.value.len(),
        source = after.source.as_str(),
        "Images reloaded"
    );

    let missing = CacheKey::new(ResourceDomain::ProductDetail).with("slug", "gibt-es-nicht");
    let state = service.use_resource(missing).await;
    if let Some(err) = state.error {
        info!(error = %err, "Missing product surfaced as an error state");
    }

    service.track_page_signal(PageSignal::TimeToInteractive, started.elapsed());

    let metrics = service.get_metrics();
    let rendered = serde_json::to_string_pretty(&metrics)
        .map_err(|err| AppError::unexpected(format!("failed to render metrics: {err}")))?;
    println!("{rendered}");
    println!(
        "hit ratio {:.2}, average {:.1}ms",
        metrics.hit_ratio(),
        metrics.average_duration_ms()
    );

    service.dispose().await;
    Ok(())
}

/// The listener subscribes on its own task; give it a moment before mutating.
async fn wait_for_feed(backend: &InMemoryBackend) {
    let deadline = Instant::now() + SUBSCRIBE_WAIT;
    while backend.subscriber_count() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
