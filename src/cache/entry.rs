//! Cache entries and their freshness windows.

use std::time::Duration;

use tokio::time::Instant;

use crate::domain::error::DomainError;

/// Freshness state of an entry, computed at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Younger than `stale_after`; served without touching the network.
    Fresh,
    /// Servable, but a background refresh should start.
    Stale,
    /// Past `expire_after`; must not be served.
    Expired,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Fresh => "fresh",
            EntryStatus::Stale => "stale",
            EntryStatus::Expired => "expired",
        }
    }
}

/// Soft and hard age limits for one resource family.
///
/// Invariant: `stale_after <= expire_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    stale_after: Duration,
    expire_after: Duration,
}

impl StalenessPolicy {
    pub fn new(stale_after: Duration, expire_after: Duration) -> Result<Self, DomainError> {
        if stale_after > expire_after {
            return Err(DomainError::invariant(format!(
                "stale window ({}ms) exceeds expiry window ({}ms)",
                stale_after.as_millis(),
                expire_after.as_millis()
            )));
        }
        Ok(Self {
            stale_after,
            expire_after,
        })
    }

    /// Preset constructor; callers pass `stale <= expire`.
    pub(crate) const fn minutes(stale: u64, expire: u64) -> Self {
        Self {
            stale_after: Duration::from_secs(stale * 60),
            expire_after: Duration::from_secs(expire * 60),
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn expire_after(&self) -> Duration {
        self.expire_after
    }
}

/// A cached value together with the metadata needed to judge its age.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
    policy: StalenessPolicy,
    forced_stale: bool,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, policy: StalenessPolicy, fetched_at: Instant) -> Self {
        Self {
            value,
            fetched_at,
            policy,
            forced_stale: false,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    pub fn is_forced_stale(&self) -> bool {
        self.forced_stale
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.fetched_at)
    }

    pub fn status(&self, now: Instant) -> EntryStatus {
        let age = self.age(now);
        if age >= self.policy.expire_after {
            EntryStatus::Expired
        } else if self.forced_stale || age >= self.policy.stale_after {
            EntryStatus::Stale
        } else {
            EntryStatus::Fresh
        }
    }

    /// Demote to stale without touching `fetched_at`; expiry is unaffected.
    pub(crate) fn mark_stale(&mut self) {
        self.forced_stale = true;
    }
}
