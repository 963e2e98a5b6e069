//! Change-feed invalidation through a running `CacheService`.

use std::sync::Arc;
use std::time::Duration;

use catalog_cache::cache::{
    CacheKey, CacheNotification, CacheService, CacheServiceConfig, ChangeEvent, EntryStatus,
    ListenerConfig, ValueSource, WatchRule,
};
use catalog_cache::domain::types::{ChangeOperation, ResourceDomain};
use catalog_cache::infra::memory::InMemoryBackend;
use serde_json::json;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(2);

fn start(listener: ListenerConfig) -> (Arc<InMemoryBackend>, CacheService) {
    let backend = Arc::new(InMemoryBackend::with_sample_catalog());
    let config = CacheServiceConfig {
        prefetch_enabled: false,
        listener,
        ..CacheServiceConfig::default()
    };
    let service = CacheService::new(config, backend.clone(), backend.clone());
    assert!(service.init().is_none());
    (backend, service)
}

fn fast_reconnect() -> ListenerConfig {
    ListenerConfig {
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        ..ListenerConfig::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_notification(
    receiver: &mut broadcast::Receiver<CacheNotification>,
) -> CacheNotification {
    tokio::time::timeout(WAIT, receiver.recv())
        .await
        .expect("notification in time")
        .expect("notification channel open")
}

fn images(entity: &str) -> CacheKey {
    CacheKey::new(ResourceDomain::Images).with("entity", entity)
}

#[tokio::test]
async fn deleted_image_evicts_only_its_entity() {
    let (backend, service) = start(ListenerConfig::default());
    wait_until(|| backend.subscriber_count() == 1).await;

    let listing = CacheKey::new(ResourceDomain::Products).with("category", "Buche");
    let (first, second) = tokio::join!(
        service.query(listing.clone()),
        service.query(listing.clone())
    );
    let (first, second) = (first.expect("rows"), second.expect("rows"));
    assert!(Arc::ptr_eq(&first.value, &second.value));
    assert_eq!(backend.fetch_count(&listing), 1);

    let buche = service.query(images("buche")).await.expect("rows");
    assert_eq!(buche.value.len(), 2);
    service.query(images("eiche-natur")).await.expect("rows");

    let mut notifications = service.notifications();
    backend.delete_where(&ResourceDomain::Images, "slug", "buche-25cm-hauptbild");
    let notification = next_notification(&mut notifications).await;

    assert_eq!(notification.resource, "images");
    assert_eq!(notification.operation, ChangeOperation::Delete);
    assert_eq!(notification.identifier.as_deref(), Some("buche"));
    assert_eq!(notification.evicted, 1);
    assert!(service.store().peek(&images("buche")).is_none());
    assert_eq!(
        service.store().status(&images("eiche-natur")),
        Some(EntryStatus::Fresh)
    );
    assert_eq!(service.store().status(&listing), Some(EntryStatus::Fresh));

    let reloaded = service.query(images("buche")).await.expect("rows");
    assert_eq!(reloaded.source, ValueSource::Fetched);
    assert_eq!(backend.fetch_count(&images("buche")), 2);
    assert_eq!(reloaded.value.len(), 1);
    assert!(
        reloaded
            .value
            .iter()
            .all(|row| row["slug"] != "buche-25cm-hauptbild")
    );

    service.dispose().await;
}

#[tokio::test]
async fn malformed_events_do_not_stop_the_listener() {
    let (backend, service) = start(ListenerConfig::default());
    wait_until(|| backend.subscriber_count() == 1).await;
    service.query(images("eiche-natur")).await.expect("rows");

    let mut notifications = service.notifications();
    backend.publish(ChangeEvent::new(
        "images",
        ChangeOperation::Update,
        json!({ "title": "no slug" }),
    ));
    backend.publish(ChangeEvent::new(
        "images",
        ChangeOperation::Update,
        json!({ "slug": "eiche-natur-detail" }),
    ));

    // The malformed event produced no notification; the first one seen is the valid event.
    let notification = next_notification(&mut notifications).await;
    assert_eq!(notification.identifier.as_deref(), Some("eiche-natur"));
    assert_eq!(notification.evicted, 1);
    assert!(service.store().is_empty());

    service.dispose().await;
}

#[tokio::test]
async fn listener_resubscribes_after_the_feed_drops() {
    let (backend, service) = start(fast_reconnect());
    wait_until(|| backend.subscriber_count() == 1).await;

    assert_eq!(backend.drop_subscriptions(), 1);
    wait_until(|| backend.subscribe_calls() >= 2 && backend.subscriber_count() == 1).await;

    service.query(images("buche")).await.expect("rows");
    let mut notifications = service.notifications();
    backend.insert(
        ResourceDomain::Images,
        json!({ "slug": "buche-60cm-galerie-3", "entity": "buche" }),
    );

    let notification = next_notification(&mut notifications).await;
    assert_eq!(notification.operation, ChangeOperation::Insert);
    assert_eq!(notification.evicted, 1);

    service.dispose().await;
}

#[tokio::test]
async fn failed_subscriptions_are_retried() {
    let backend = Arc::new(InMemoryBackend::with_sample_catalog());
    backend.fail_next_subscribe(2);
    let config = CacheServiceConfig {
        prefetch_enabled: false,
        listener: fast_reconnect(),
        ..CacheServiceConfig::default()
    };
    let service = CacheService::new(config, backend.clone(), backend.clone());
    service.init();

    wait_until(|| backend.subscriber_count() == 1).await;
    assert_eq!(backend.subscribe_calls(), 3);

    service.dispose().await;
    assert_eq!(backend.subscriber_count(), 0);
}

#[tokio::test]
async fn whole_domain_rules_clear_every_key_of_the_domain() {
    let (backend, service) = start(ListenerConfig {
        rules: vec![
            WatchRule::image_index(),
            WatchRule::whole_domain("shop_settings", vec![ResourceDomain::ShopSettings]),
        ],
        ..ListenerConfig::default()
    });
    wait_until(|| backend.subscriber_count() == 1).await;

    service
        .query(CacheKey::new(ResourceDomain::ShopSettings))
        .await
        .expect("rows");
    service.query(images("buche")).await.expect("rows");

    let mut notifications = service.notifications();
    backend.insert(
        ResourceDomain::ShopSettings,
        json!({ "currency": "CHF" }),
    );

    let notification = next_notification(&mut notifications).await;
    assert_eq!(notification.identifier, None);
    assert_eq!(notification.evicted, 1);
    assert_eq!(service.store().keys(), vec![images("buche")]);

    service.dispose().await;
}

#[tokio::test]
async fn manual_invalidation_counts_evictions() {
    let (_backend, service) = start(ListenerConfig::default());
    service.query(images("buche")).await.expect("rows");
    service.query(images("eiche-natur")).await.expect("rows");

    assert_eq!(service.invalidate(&images("buche")), 1);
    assert_eq!(service.invalidate(&images("buche")), 0);
    assert_eq!(
        service.invalidate_where(|key| key.domain() == &ResourceDomain::Images),
        1
    );
    assert_eq!(service.get_metrics().evictions, 2);

    service.dispose().await;
}
