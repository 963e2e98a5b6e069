//! Cache service configuration.
//!
//! Built from the resolved [`crate::config::Settings`] by the binary, or
//! directly in code (`CacheServiceConfig::default()`) by embedders and tests.

use std::time::Duration;

use tracing::warn;

use super::keys::CacheKey;
use super::listener::WatchRule;
use super::monitor::DEFAULT_SLOW_QUERY_THRESHOLD;
use super::policy::PolicyTable;
use crate::domain::slug::DEFAULT_ROLE_SUFFIXES;
use crate::domain::types::ResourceDomain;

// Default values for cache configuration
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(30);
const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

/// Floor for the expiry sweep interval. A zero period would stop the sweeper.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Floor for the first resubscription delay. Zero would spin on a dead feed.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(10);

/// Settings for the change-feed invalidation listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Which feed resources to watch and what each one evicts.
    pub rules: Vec<WatchRule>,
    /// Trailing slug segments that never name an entity.
    pub role_suffixes: Vec<String>,
    /// First resubscription delay after the feed drops.
    pub reconnect_initial: Duration,
    /// Upper bound for the resubscription delay.
    pub reconnect_max: Duration,
    /// Buffered notifications per lagging receiver.
    pub notification_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            rules: vec![WatchRule::image_index()],
            role_suffixes: DEFAULT_ROLE_SUFFIXES
                .iter()
                .map(|suffix| suffix.to_string())
                .collect(),
            reconnect_initial: DEFAULT_RECONNECT_INITIAL,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl ListenerConfig {
    /// Delay before resubscription attempt `failures` (0-based), doubling up to the cap.
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let factor = 2_u32.saturating_pow(failures);
        self.reconnect_initial
            .saturating_mul(factor)
            .min(self.reconnect_max)
    }

    /// Raise delays below [`MIN_RECONNECT_DELAY`] and keep the cap at or above
    /// the initial delay.
    pub fn normalized(mut self) -> Self {
        if self.reconnect_initial < MIN_RECONNECT_DELAY {
            warn!(
                configured_ms = self.reconnect_initial.as_millis() as u64,
                applied_ms = MIN_RECONNECT_DELAY.as_millis() as u64,
                "Reconnect delay too small; clamped"
            );
            self.reconnect_initial = MIN_RECONNECT_DELAY;
        }
        if self.reconnect_max < self.reconnect_initial {
            warn!(
                configured_ms = self.reconnect_max.as_millis() as u64,
                applied_ms = self.reconnect_initial.as_millis() as u64,
                "Reconnect cap below initial delay; raised"
            );
            self.reconnect_max = self.reconnect_initial;
        }
        self
    }

    /// Distinct feed resources named by the rules, in rule order.
    pub fn watched_resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = Vec::new();
        for rule in &self.rules {
            if !resources.contains(&rule.resource) {
                resources.push(rule.resource.clone());
            }
        }
        resources
    }
}

/// Everything a [`super::CacheService`] needs at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheServiceConfig {
    /// Interval of the background expiry sweep.
    pub sweep_interval: Duration,
    /// Queries slower than this are logged and counted.
    pub slow_query_threshold: Duration,
    pub policies: PolicyTable,
    pub listener: ListenerConfig,
    /// Run the prefetcher from `init()`.
    pub prefetch_enabled: bool,
    /// Keys warmed by the prefetcher.
    pub prefetch_targets: Vec<CacheKey>,
}

impl Default for CacheServiceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            slow_query_threshold: DEFAULT_SLOW_QUERY_THRESHOLD,
            policies: PolicyTable::standard(),
            listener: ListenerConfig::default(),
            prefetch_enabled: true,
            prefetch_targets: default_prefetch_targets(),
        }
    }
}

impl CacheServiceConfig {
    /// Clamp intervals that would stall background tasks. Applied by
    /// [`super::CacheService::new`].
    pub fn normalized(mut self) -> Self {
        if self.sweep_interval < MIN_SWEEP_INTERVAL {
            warn!(
                configured_ms = self.sweep_interval.as_millis() as u64,
                applied_ms = MIN_SWEEP_INTERVAL.as_millis() as u64,
                "Sweep interval too small; clamped"
            );
            self.sweep_interval = MIN_SWEEP_INTERVAL;
        }
        self.listener = self.listener.normalized();
        self
    }
}

impl From<&crate::config::Settings> for CacheServiceConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        let listener = ListenerConfig {
            role_suffixes: settings.listener.role_suffixes.clone(),
            reconnect_initial: settings.listener.reconnect_initial,
            reconnect_max: settings.listener.reconnect_max,
            ..ListenerConfig::default()
        };

        Self {
            sweep_interval: settings.cache.sweep_interval,
            slow_query_threshold: settings.cache.slow_query_threshold,
            policies: settings.cache.policies.clone(),
            listener,
            prefetch_enabled: settings.prefetch.enabled,
            prefetch_targets: default_prefetch_targets(),
        }
    }
}

/// Critical keys warmed at start: active catalog listing, shop settings, categories.
pub fn default_prefetch_targets() -> Vec<CacheKey> {
    vec![
        CacheKey::new(ResourceDomain::Products).with("active", true),
        CacheKey::new(ResourceDomain::ShopSettings),
        CacheKey::new(ResourceDomain::Categories),
    ]
}
