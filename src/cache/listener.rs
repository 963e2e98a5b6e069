//! Change-feed driven cache invalidation.
//!
//! The listener turns backend mutation events into key evictions. Eviction is
//! synchronous once an event is in hand; only the feed subscription itself is
//! asynchronous, and it is re-established with capped backoff whenever the
//! transport drops it.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::ListenerConfig;
use super::events::{CacheNotification, ChangeEvent};
use super::feed::ChangeFeed;
use super::keys::CacheKey;
use super::monitor::PerformanceMonitor;
use super::store::CacheStore;
use crate::domain::slug::logical_identifier;
use crate::domain::types::ResourceDomain;

/// Maps one change-feed resource to the cache keys it invalidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRule {
    /// Feed resource name, e.g. `images`.
    pub resource: String,
    /// Payload field naming the affected entity; `None` evicts whole domains.
    pub identifier_field: Option<String>,
    /// Peel size/role suffixes off the identifier (`buche-25cm-hauptbild` → `buche`).
    pub strip_disambiguator: bool,
    /// Domains whose keys are candidates for eviction.
    pub targets: Vec<ResourceDomain>,
    /// Key filter compared against the identifier.
    pub key_field: String,
}

impl WatchRule {
    /// Image index: image slugs evict the owning entity's image listings.
    pub fn image_index() -> Self {
        Self::by_identifier("images", "slug", vec![ResourceDomain::Images], "entity")
    }

    pub fn by_identifier(
        resource: impl Into<String>,
        identifier_field: impl Into<String>,
        targets: Vec<ResourceDomain>,
        key_field: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            identifier_field: Some(identifier_field.into()),
            strip_disambiguator: true,
            targets,
            key_field: key_field.into(),
        }
    }

    /// Any change to `resource` evicts every key in `targets`.
    pub fn whole_domain(resource: impl Into<String>, targets: Vec<ResourceDomain>) -> Self {
        Self {
            resource: resource.into(),
            identifier_field: None,
            strip_disambiguator: false,
            targets,
            key_field: String::new(),
        }
    }

    pub fn with_exact_identifier(mut self) -> Self {
        self.strip_disambiguator = false;
        self
    }

    fn targets(&self, key: &CacheKey) -> bool {
        self.targets.contains(key.domain())
    }
}

pub struct InvalidationListener<V> {
    store: Arc<CacheStore<V>>,
    monitor: Arc<PerformanceMonitor>,
    config: ListenerConfig,
    notifications: broadcast::Sender<CacheNotification>,
}

impl<V> InvalidationListener<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(
        store: Arc<CacheStore<V>>,
        monitor: Arc<PerformanceMonitor>,
        config: ListenerConfig,
    ) -> Self {
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));
        Self {
            store,
            monitor,
            config,
            notifications,
        }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Receive a [`CacheNotification`] for every applied event.
    pub fn notifications(&self) -> broadcast::Receiver<CacheNotification> {
        self.notifications.subscribe()
    }

    /// Apply one event to the store. Returns `None` when the event was
    /// ignored or dropped as malformed.
    pub fn handle_event(&self, event: &ChangeEvent) -> Option<CacheNotification> {
        let rules: Vec<&WatchRule> = self
            .config
            .rules
            .iter()
            .filter(|rule| rule.resource == event.resource)
            .collect();
        if rules.is_empty() {
            debug!(
                event_id = %event.id,
                resource = %event.resource,
                "Change event for unwatched resource ignored"
            );
            return None;
        }

        let mut applied = false;
        let mut evicted = 0;
        let mut identifier = None;

        for rule in rules {
            let Some(field) = rule.identifier_field.as_deref() else {
                evicted += self.store.invalidate_where(|key| rule.targets(key));
                applied = true;
                continue;
            };

            let Some(raw) = event.field(field) else {
                warn!(
                    event_id = %event.id,
                    resource = %event.resource,
                    operation = %event.operation,
                    field,
                    "Change event lacks identifier field; dropped"
                );
                continue;
            };

            let derived = if rule.strip_disambiguator {
                logical_identifier(raw, &self.config.role_suffixes)
            } else {
                Ok(raw.trim().to_ascii_lowercase())
            };
            let logical = match derived {
                Ok(logical) => logical,
                Err(error) => {
                    warn!(
                        event_id = %event.id,
                        resource = %event.resource,
                        raw,
                        error = %error,
                        "Change event identifier unusable; dropped"
                    );
                    continue;
                }
            };

            evicted += self.store.invalidate_where(|key| {
                rule.targets(key) && key.matches_identifier(&rule.key_field, &logical)
            });
            identifier = Some(logical);
            applied = true;
        }

        if !applied {
            return None;
        }

        self.monitor.record_evictions(evicted);
        let notification = CacheNotification {
            event_id: event.id,
            resource: event.resource.clone(),
            operation: event.operation,
            identifier,
            evicted,
            timestamp: OffsetDateTime::now_utc(),
        };
        info!(
            event_id = %notification.event_id,
            resource = %notification.resource,
            operation = %notification.operation,
            identifier = notification.identifier.as_deref().unwrap_or("*"),
            evicted,
            "Cache invalidated from change feed"
        );
        // No receivers is fine; nobody is rendering right now.
        let _ = self.notifications.send(notification.clone());
        Some(notification)
    }

    /// Subscribe to `feed` and keep applying events until stopped.
    pub fn start(self: Arc<Self>, feed: Arc<dyn ChangeFeed>) -> ListenerHandle {
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(self.run(feed, signal));
        ListenerHandle { shutdown, task }
    }

    async fn run(self: Arc<Self>, feed: Arc<dyn ChangeFeed>, mut shutdown: watch::Receiver<bool>) {
        let resources = self.config.watched_resources();
        let mut failures: u32 = 0;

        loop {
            let subscribed = tokio::select! {
                _ = shutdown.changed() => break,
                result = feed.subscribe(&resources) => result,
            };

            match subscribed {
                Ok(mut subscription) => {
                    failures = 0;
                    info!(
                        subscription_id = %subscription.id(),
                        resources = ?resources,
                        "Change feed subscribed"
                    );
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                subscription.unsubscribe();
                                return;
                            }
                            event = subscription.recv() => match event {
                                Some(event) => {
                                    self.handle_event(&event);
                                }
                                None => {
                                    warn!(
                                        subscription_id = %subscription.id(),
                                        "Change feed subscription lost"
                                    );
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(error) => {
                    warn!(error = %error, failures, "Change feed subscribe failed");
                }
            }

            let delay = self.config.reconnect_delay(failures);
            failures = failures.saturating_add(1);
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = failures,
                "Resubscribing to change feed"
            );
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("Invalidation listener stopped");
    }
}

/// Running listener. Dropping the handle also stops the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Unsubscribe and wait for the listener task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::StalenessPolicy;
    use crate::domain::types::ChangeOperation;

    fn listener(rules: Vec<WatchRule>) -> InvalidationListener<u32> {
        InvalidationListener::new(
            Arc::new(CacheStore::new()),
            Arc::new(PerformanceMonitor::default()),
            ListenerConfig {
                rules,
                ..ListenerConfig::default()
            },
        )
    }

    fn seed(listener: &InvalidationListener<u32>, key: CacheKey) {
        listener
            .store
            .set(key, 1, StalenessPolicy::minutes(10, 20));
    }

    fn images(entity: &str) -> CacheKey {
        CacheKey::new(ResourceDomain::Images).with("entity", entity)
    }

    #[test]
    fn evicts_only_the_derived_entity() {
        let listener = listener(vec![WatchRule::image_index()]);
        seed(&listener, images("buche"));
        seed(&listener, images("Buche").with("page", 2_i64));
        seed(&listener, images("eiche"));

        let notification = listener
            .handle_event(&ChangeEvent::new(
                "images",
                ChangeOperation::Delete,
                serde_json::json!({ "slug": "buche-25cm-hauptbild" }),
            ))
            .expect("applied");

        assert_eq!(notification.identifier.as_deref(), Some("buche"));
        assert_eq!(notification.evicted, 2);
        assert_eq!(listener.store.keys(), vec![images("eiche")]);
        assert_eq!(listener.monitor.get_metrics().evictions, 2);
    }

    #[test]
    fn malformed_events_are_dropped() {
        let listener = listener(vec![WatchRule::image_index()]);
        seed(&listener, images("buche"));

        let outcome = listener.handle_event(&ChangeEvent::new(
            "images",
            ChangeOperation::Update,
            serde_json::json!({ "title": "no slug here" }),
        ));

        assert!(outcome.is_none());
        assert_eq!(listener.store.len(), 1);
    }

    #[test]
    fn unwatched_resources_are_ignored() {
        let listener = listener(vec![WatchRule::image_index()]);
        seed(&listener, images("buche"));
        assert!(
            listener
                .handle_event(&ChangeEvent::new(
                    "orders",
                    ChangeOperation::Insert,
                    serde_json::json!({ "slug": "buche" }),
                ))
                .is_none()
        );
        assert_eq!(listener.store.len(), 1);
    }

    #[test]
    fn whole_domain_rule_clears_targets() {
        let listener = listener(vec![WatchRule::whole_domain(
            "shop_settings",
            vec![ResourceDomain::ShopSettings],
        )]);
        seed(&listener, CacheKey::new(ResourceDomain::ShopSettings));
        seed(&listener, images("buche"));

        let notification = listener
            .handle_event(&ChangeEvent::new(
                "shop_settings",
                ChangeOperation::Update,
                serde_json::json!({}),
            ))
            .expect("applied");

        assert_eq!(notification.identifier, None);
        assert_eq!(notification.evicted, 1);
        assert_eq!(listener.store.keys(), vec![images("buche")]);
    }

    #[test]
    fn repeated_events_are_idempotent() {
        let listener = listener(vec![WatchRule::image_index()]);
        seed(&listener, images("buche"));
        let event = ChangeEvent::new(
            "images",
            ChangeOperation::Delete,
            serde_json::json!({ "slug": "buche-hauptbild" }),
        );

        assert_eq!(listener.handle_event(&event).map(|n| n.evicted), Some(1));
        assert_eq!(listener.handle_event(&event).map(|n| n.evicted), Some(0));
        assert!(listener.store.is_empty());
    }

    #[tokio::test]
    async fn notifications_reach_subscribers() {
        let listener = listener(vec![WatchRule::image_index()]);
        let mut receiver = listener.notifications();
        seed(&listener, images("eiche"));

        listener.handle_event(&ChangeEvent::new(
            "images",
            ChangeOperation::Insert,
            serde_json::json!({ "slug": "eiche-natur-2" }),
        ));

        let notification = receiver.recv().await.expect("notification");
        assert_eq!(notification.identifier.as_deref(), Some("eiche-natur"));
        assert_eq!(notification.evicted, 0);
    }
}
