//! Change-feed events and the notifications emitted after eviction.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::types::ChangeOperation;

/// A backend mutation delivered by the change feed. Consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Local identifier for log correlation (UUIDv4).
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub resource: String,
    pub operation: ChangeOperation,
    /// The affected row; for deletes, the row as it was.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(skip, default = "OffsetDateTime::now_utc")]
    pub received_at: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(
        resource: impl Into<String>,
        operation: ChangeOperation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource: resource.into(),
            operation,
            payload,
            received_at: OffsetDateTime::now_utc(),
        }
    }

    /// String field of the payload, if present and non-empty.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload
            .get(name)
            .and_then(serde_json::Value::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

/// Emitted after a change event has been applied to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNotification {
    pub event_id: Uuid,
    pub resource: String,
    pub operation: ChangeOperation,
    /// Logical identifier the eviction matched on; `None` for whole-domain rules.
    pub identifier: Option<String>,
    pub evicted: usize,
    pub timestamp: OffsetDateTime,
}
