//! Per-resource fetch and staleness policies.
//!
//! Timeouts, retry budgets and freshness windows are configuration; the
//! executor only reads them from a [`ResourcePolicy`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::entry::StalenessPolicy;
use crate::domain::types::ResourceDomain;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(1000);
const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// Shape of a query, which decides its timeout and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    List,
    Detail,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::List => "list",
            QueryKind::Detail => "detail",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeout and retry settings for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: u32,
}

impl FetchPolicy {
    /// Listing queries: 7s timeout, 3 retries, backoff capped at 8s.
    pub const fn list() -> Self {
        Self {
            timeout: Duration::from_secs(7),
            max_retries: 3,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: Duration::from_secs(8),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Single-record queries: 5s timeout, 2 retries, backoff capped at 3s.
    pub const fn detail() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 2,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: Duration::from_secs(3),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    pub const fn for_kind(kind: QueryKind) -> Self {
        match kind {
            QueryKind::List => Self::list(),
            QueryKind::Detail => Self::detail(),
        }
    }

    /// Delay before retry number `retry` (0-based): `initial * multiplier^retry`, capped.
    pub fn backoff_for_retry(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Initial attempt plus retries.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Everything the executor needs to know about one resource family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePolicy {
    pub kind: QueryKind,
    pub staleness: StalenessPolicy,
    pub fetch: FetchPolicy,
    /// Serve a cached value when the backend answers 401/403.
    pub stale_on_denied: bool,
}

impl ResourcePolicy {
    pub fn list(staleness: StalenessPolicy) -> Self {
        Self::new(QueryKind::List, staleness)
    }

    pub fn detail(staleness: StalenessPolicy) -> Self {
        Self::new(QueryKind::Detail, staleness)
    }

    pub fn new(kind: QueryKind, staleness: StalenessPolicy) -> Self {
        Self {
            kind,
            staleness,
            fetch: FetchPolicy::for_kind(kind),
            stale_on_denied: false,
        }
    }

    pub fn with_fetch(mut self, fetch: FetchPolicy) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_stale_on_denied(mut self, enabled: bool) -> Self {
        self.stale_on_denied = enabled;
        self
    }
}

/// Policy lookup by resource domain, with a fallback for unknown families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    fallback: ResourcePolicy,
    by_domain: BTreeMap<ResourceDomain, ResourcePolicy>,
}

impl PolicyTable {
    pub fn new(fallback: ResourcePolicy) -> Self {
        Self {
            fallback,
            by_domain: BTreeMap::new(),
        }
    }

    /// Storefront defaults for the well-known resource families.
    pub fn standard() -> Self {
        let mut table = Self::new(ResourcePolicy::list(StalenessPolicy::minutes(10, 20)));
        table.insert(
            ResourceDomain::Products,
            ResourcePolicy::list(StalenessPolicy::minutes(10, 20)),
        );
        table.insert(
            ResourceDomain::ProductDetail,
            ResourcePolicy::detail(StalenessPolicy::minutes(5, 15)),
        );
        table.insert(
            ResourceDomain::Categories,
            ResourcePolicy::list(StalenessPolicy::minutes(30, 60)),
        );
        table.insert(
            ResourceDomain::ShopSettings,
            ResourcePolicy::detail(StalenessPolicy::minutes(30, 60)),
        );
        table.insert(
            ResourceDomain::Images,
            ResourcePolicy::list(StalenessPolicy::minutes(10, 20)),
        );
        table
    }

    pub fn insert(&mut self, domain: ResourceDomain, policy: ResourcePolicy) {
        self.by_domain.insert(domain, policy);
    }

    pub fn get(&self, domain: &ResourceDomain) -> &ResourcePolicy {
        self.by_domain.get(domain).unwrap_or(&self.fallback)
    }

    pub fn fallback(&self) -> &ResourcePolicy {
        &self.fallback
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceDomain, &ResourcePolicy)> {
        self.by_domain.iter()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::standard()
    }
}
