//! In-process catalog backend.
//!
//! Serves rows from per-domain tables and pushes a change event for every
//! mutation, so the cache can be driven end to end without a network. Fault
//! hooks (`fail_next`, `fail_next_subscribe`, `drop_subscriptions`,
//! `set_latency`) let tests and the demo reproduce outages.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::lock::mutex_lock;
use crate::cache::{
    CacheKey, ChangeEvent, ChangeFeed, DEFAULT_SUBSCRIPTION_CAPACITY, FeedError, FetchError,
    Fetcher, Rows, Subscription,
};
use crate::domain::types::{ChangeOperation, FilterValue, ResourceDomain};

const SOURCE: &str = "infra::memory";

/// Filters that page through a table instead of matching row fields.
const PAGE_FILTER: &str = "page";
const LIMIT_FILTER: &str = "limit";

#[derive(Default)]
struct BackendState {
    tables: BTreeMap<ResourceDomain, Vec<Value>>,
    faults: HashMap<ResourceDomain, VecDeque<FetchError>>,
    fetch_counts: HashMap<CacheKey, usize>,
    latency: Duration,
    subscribers: Vec<FeedSubscriber>,
    subscribe_calls: usize,
    subscribe_failures: usize,
}

struct FeedSubscriber {
    resources: Vec<String>,
    sender: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Small wooden-furniture catalog used by the demo command.
    pub fn with_sample_catalog() -> Self {
        let backend = Self::new();
        backend.seed(
            ResourceDomain::Products,
            vec![
                json!({ "slug": "buche-tisch", "name": "Buche Tisch", "category": "Buche", "active": true, "price_cents": 34900 }),
                json!({ "slug": "eiche-regal", "name": "Eiche Regal", "category": "Eiche", "active": true, "price_cents": 21900 }),
                json!({ "slug": "kiefer-hocker", "name": "Kiefer Hocker", "category": "Kiefer", "active": false, "price_cents": 4900 }),
            ],
        );
        backend.seed(
            ResourceDomain::ProductDetail,
            vec![
                json!({ "slug": "buche-tisch", "name": "Buche Tisch", "description": "Massivholz, geölt", "width_cm": 160 }),
                json!({ "slug": "eiche-regal", "name": "Eiche Regal", "description": "Fünf Böden", "width_cm": 90 }),
            ],
        );
        backend.seed(
            ResourceDomain::Categories,
            vec![
                json!({ "slug": "buche", "name": "Buche" }),
                json!({ "slug": "eiche", "name": "Eiche" }),
                json!({ "slug": "kiefer", "name": "Kiefer" }),
            ],
        );
        backend.seed(
            ResourceDomain::ShopSettings,
            vec![json!({ "currency": "EUR", "shipping_free_from_cents": 50000 })],
        );
        backend.seed(
            ResourceDomain::Images,
            vec![
                json!({ "slug": "buche-25cm-hauptbild", "entity": "buche", "url": "/img/buche-25cm-hauptbild.webp" }),
                json!({ "slug": "buche-40cm-galerie-2", "entity": "buche", "url": "/img/buche-40cm-galerie-2.webp" }),
                json!({ "slug": "eiche-natur-hauptbild", "entity": "eiche-natur", "url": "/img/eiche-natur-hauptbild.webp" }),
            ],
        );
        backend
    }

    /// Replace a table without emitting change events.
    pub fn seed(&self, domain: ResourceDomain, rows: Vec<Value>) {
        mutex_lock(&self.state, SOURCE, "seed")
            .tables
            .insert(domain, rows);
    }

    pub fn rows(&self, domain: &ResourceDomain) -> Vec<Value> {
        mutex_lock(&self.state, SOURCE, "rows")
            .tables
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Append a row and announce it on the feed.
    pub fn insert(&self, domain: ResourceDomain, row: Value) {
        let mut state = mutex_lock(&self.state, SOURCE, "insert");
        state
            .tables
            .entry(domain.clone())
            .or_default()
            .push(row.clone());
        state.publish(ChangeEvent::new(domain.as_str(), ChangeOperation::Insert, row));
    }

    /// Remove rows whose `field` equals `value`; one delete event per row.
    pub fn delete_where(
        &self,
        domain: &ResourceDomain,
        field: &str,
        value: impl Into<FilterValue>,
    ) -> usize {
        let value = value.into();
        let mut state = mutex_lock(&self.state, SOURCE, "delete_where");
        let Some(table) = state.tables.get_mut(domain) else {
            return 0;
        };

        let (removed, kept): (Vec<Value>, Vec<Value>) = table
            .drain(..)
            .partition(|row| row.get(field).is_some_and(|actual| value.matches_json(actual)));
        *table = kept;

        let count = removed.len();
        for row in removed {
            state.publish(ChangeEvent::new(domain.as_str(), ChangeOperation::Delete, row));
        }
        count
    }

    /// Push a hand-made event to matching subscribers.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        mutex_lock(&self.state, SOURCE, "publish").publish(event)
    }

    // ========================================================================
    // Fault injection
    // ========================================================================

    /// Fail the next `times` fetches of `domain` with `error`.
    pub fn fail_next(&self, domain: ResourceDomain, error: FetchError, times: usize) {
        let mut state = mutex_lock(&self.state, SOURCE, "fail_next");
        let queue = state.faults.entry(domain).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Reject the next `times` subscribe calls.
    pub fn fail_next_subscribe(&self, times: usize) {
        mutex_lock(&self.state, SOURCE, "fail_next_subscribe").subscribe_failures += times;
    }

    /// Delay applied to every fetch.
    pub fn set_latency(&self, latency: Duration) {
        mutex_lock(&self.state, SOURCE, "set_latency").latency = latency;
    }

    /// Close every open subscription, as a dropped connection would.
    pub fn drop_subscriptions(&self) -> usize {
        let mut state = mutex_lock(&self.state, SOURCE, "drop_subscriptions");
        let dropped = state.subscribers.len();
        state.subscribers.clear();
        warn!(dropped, "Change feed connections dropped");
        dropped
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn fetch_count(&self, key: &CacheKey) -> usize {
        mutex_lock(&self.state, SOURCE, "fetch_count")
            .fetch_counts
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "total_fetches")
            .fetch_counts
            .values()
            .sum()
    }

    pub fn subscriber_count(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "subscriber_count")
            .subscribers
            .iter()
            .filter(|subscriber| !subscriber.sender.is_closed())
            .count()
    }

    pub fn subscribe_calls(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "subscribe_calls").subscribe_calls
    }

    fn resolve(&self, key: &CacheKey) -> (Duration, Result<Vec<Value>, FetchError>) {
        let mut state = mutex_lock(&self.state, SOURCE, "fetch");
        *state.fetch_counts.entry(key.clone()).or_insert(0) += 1;

        if let Some(error) = state
            .faults
            .get_mut(key.domain())
            .and_then(VecDeque::pop_front)
        {
            return (state.latency, Err(error));
        }

        let rows = select_rows(state.tables.get(key.domain()), key);
        let result = if rows.is_empty() && *key.domain() == ResourceDomain::ProductDetail {
            Err(FetchError::status(404, format!("no record for {key}")))
        } else {
            Ok(rows)
        };
        (state.latency, result)
    }
}

impl BackendState {
    fn publish(&mut self, event: ChangeEvent) -> usize {
        self.subscribers
            .retain(|subscriber| !subscriber.sender.is_closed());

        let mut delivered = 0;
        for subscriber in &self.subscribers {
            if !subscriber.resources.contains(&event.resource) {
                continue;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    event_id = %event.id,
                    resource = %event.resource,
                    error = %err,
                    "Change event not delivered"
                ),
            }
        }
        debug!(
            event_id = %event.id,
            resource = %event.resource,
            operation = %event.operation,
            delivered,
            "Change event published"
        );
        delivered
    }
}

fn select_rows(table: Option<&Vec<Value>>, key: &CacheKey) -> Vec<Value> {
    let Some(table) = table else {
        return Vec::new();
    };

    let matching = table.iter().filter(|row| {
        key.filters()
            .iter()
            .filter(|(field, _)| !is_paging(field))
            .all(|(field, expected)| {
                row.get(field.as_str())
                    .is_some_and(|actual| expected.matches_json(actual))
            })
    });

    let limit = integer_filter(key, LIMIT_FILTER).map(|limit| limit.max(0) as usize);
    let page = integer_filter(key, PAGE_FILTER).unwrap_or(1).max(1) as usize;
    match limit {
        Some(limit) => matching
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .cloned()
            .collect(),
        None => matching.cloned().collect(),
    }
}

fn is_paging(field: &str) -> bool {
    field == PAGE_FILTER || field == LIMIT_FILTER
}

fn integer_filter(key: &CacheKey, field: &str) -> Option<i64> {
    match key.filter(field) {
        Some(FilterValue::Integer(value)) => Some(*value),
        _ => None,
    }
}

#[async_trait]
impl Fetcher<Rows> for InMemoryBackend {
    async fn fetch(&self, key: &CacheKey) -> Result<Rows, FetchError> {
        let (latency, result) = self.resolve(key);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        debug!(key = %key, ok = result.is_ok(), "In-memory fetch served");
        result.map(std::sync::Arc::new)
    }
}

#[async_trait]
impl ChangeFeed for InMemoryBackend {
    async fn subscribe(&self, resources: &[String]) -> Result<Subscription, FeedError> {
        let mut state = mutex_lock(&self.state, SOURCE, "subscribe");
        state.subscribe_calls += 1;
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(FeedError::subscribe("backend refused subscription"));
        }

        let (sender, subscription) =
            Subscription::channel(resources.to_vec(), DEFAULT_SUBSCRIPTION_CAPACITY);
        state.subscribers.push(FeedSubscriber {
            resources: resources.to_vec(),
            sender,
        });
        info!(
            subscription_id = %subscription.id(),
            resources = ?resources,
            "In-memory change feed subscription opened"
        );
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filters_rows_case_insensitively() {
        let backend = InMemoryBackend::with_sample_catalog();
        let rows = backend
            .fetch(&CacheKey::new(ResourceDomain::Products).with("category", "buche"))
            .await
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["slug"], "buche-tisch");
    }

    #[tokio::test]
    async fn pages_through_rows() {
        let backend = InMemoryBackend::with_sample_catalog();
        let key = CacheKey::new(ResourceDomain::Categories)
            .with("limit", 2_i64)
            .with("page", 2_i64);
        let rows = backend.fetch(&key).await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["slug"], "kiefer");
    }

    #[tokio::test]
    async fn missing_detail_is_not_found() {
        let backend = InMemoryBackend::with_sample_catalog();
        let error = backend
            .fetch(&CacheKey::new(ResourceDomain::ProductDetail).with("slug", "gibt-es-nicht"))
            .await
            .expect_err("404");
        assert_eq!(error.status_code(), Some(404));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let backend = InMemoryBackend::with_sample_catalog();
        let key = CacheKey::new(ResourceDomain::Categories);
        backend.fail_next(ResourceDomain::Categories, FetchError::status(503, "busy"), 1);

        assert!(backend.fetch(&key).await.is_err());
        assert!(backend.fetch(&key).await.is_ok());
        assert_eq!(backend.fetch_count(&key), 2);
    }

    #[tokio::test]
    async fn mutations_reach_matching_subscribers_only() {
        let backend = InMemoryBackend::new();
        let mut images = backend
            .subscribe(&["images".to_string()])
            .await
            .expect("subscribe");
        let mut products = backend
            .subscribe(&["products".to_string()])
            .await
            .expect("subscribe");

        backend.insert(
            ResourceDomain::Images,
            json!({ "slug": "buche-hauptbild", "entity": "buche" }),
        );
        let event = images.recv().await.expect("event");
        assert_eq!(event.operation, ChangeOperation::Insert);
        assert_eq!(event.field("slug"), Some("buche-hauptbild"));

        assert_eq!(backend.delete_where(&ResourceDomain::Images, "entity", "BUCHE"), 1);
        let event = images.recv().await.expect("event");
        assert_eq!(event.operation, ChangeOperation::Delete);

        assert_eq!(backend.drop_subscriptions(), 2);
        assert!(products.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_failures_are_counted() {
        let backend = InMemoryBackend::new();
        backend.fail_next_subscribe(1);
        assert!(backend.subscribe(&["images".to_string()]).await.is_err());
        assert!(backend.subscribe(&["images".to_string()]).await.is_ok());
        assert_eq!(backend.subscribe_calls(), 2);
        assert_eq!(backend.subscriber_count(), 1);
    }
}
