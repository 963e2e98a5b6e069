//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{FetchPolicy, PolicyTable, QueryKind, ResourcePolicy, StalenessPolicy};
use crate::domain::slug::DEFAULT_ROLE_SUFFIXES;
use crate::domain::types::ResourceDomain;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "catalog-cache";
const ENV_PREFIX: &str = "CATALOG_CACHE";
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_SLOW_QUERY_MS: u64 = 1000;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Command-line arguments for the catalog-cache binary.
#[derive(Debug, Parser)]
#[command(
    name = "catalog-cache",
    version,
    about = "Client-side cache and invalidation layer for a catalog storefront"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CATALOG_CACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Validate configuration and print the resolved policy table.
    Check(CheckArgs),
    /// Run the cache against the built-in sample catalog.
    Demo(DemoArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DemoArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the expiry sweep interval.
    #[arg(long = "sweep-interval-seconds", value_name = "SECONDS")]
    pub sweep_interval_seconds: Option<u64>,

    /// Override the slow-query threshold.
    #[arg(long = "slow-query-ms", value_name = "MILLIS")]
    pub slow_query_ms: Option<u64>,

    /// Skip the start-up prefetch.
    #[arg(long = "no-prefetch", action = clap::ArgAction::SetTrue)]
    pub no_prefetch: bool,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub listener: ListenerSettings,
    pub prefetch: PrefetchSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub sweep_interval: Duration,
    pub slow_query_threshold: Duration,
    pub policies: PolicyTable,
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub role_suffixes: Vec<String>,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

#[derive(Debug, Clone)]
pub struct PrefetchSettings {
    pub enabled: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Check(args)) => raw.apply_overrides(&args.overrides),
        Some(Command::Demo(args)) => raw.apply_overrides(&args.overrides),
        None => raw.apply_overrides(&CacheOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    listener: RawListenerSettings,
    prefetch: RawPrefetchSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(seconds) = overrides.sweep_interval_seconds {
            self.cache.sweep_interval_seconds = Some(seconds);
        }
        if let Some(millis) = overrides.slow_query_ms {
            self.cache.slow_query_ms = Some(millis);
        }
        if overrides.no_prefetch {
            self.prefetch.enabled = Some(false);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            listener,
            prefetch,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let listener = build_listener_settings(listener)?;
        let prefetch = PrefetchSettings {
            enabled: prefetch.enabled.unwrap_or(true),
        };

        Ok(Self {
            logging,
            cache,
            listener,
            prefetch,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let sweep_secs = cache
        .sweep_interval_seconds
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    if sweep_secs == 0 {
        return Err(LoadError::invalid(
            "cache.sweep_interval_seconds",
            "must be greater than zero",
        ));
    }

    let slow_ms = cache.slow_query_ms.unwrap_or(DEFAULT_SLOW_QUERY_MS);
    if slow_ms == 0 {
        return Err(LoadError::invalid(
            "cache.slow_query_ms",
            "must be greater than zero",
        ));
    }

    let mut policies = PolicyTable::standard();
    for (name, raw_policy) in cache.policies {
        let domain = ResourceDomain::from_str(&name)
            .map_err(|err| LoadError::invalid("cache.policies", err.to_string()))?;
        let base = policies.get(&domain).clone();
        let policy = apply_policy_overrides(base, &name, raw_policy)?;
        policies.insert(domain, policy);
    }

    Ok(CacheSettings {
        sweep_interval: Duration::from_secs(sweep_secs),
        slow_query_threshold: Duration::from_millis(slow_ms),
        policies,
    })
}

fn apply_policy_overrides(
    mut policy: ResourcePolicy,
    name: &str,
    raw: RawPolicySettings,
) -> Result<ResourcePolicy, LoadError> {
    if let Some(kind) = raw.kind.as_deref() {
        policy.kind = match kind.trim().to_ascii_lowercase().as_str() {
            "list" => QueryKind::List,
            "detail" => QueryKind::Detail,
            other => {
                return Err(LoadError::invalid(
                    "cache.policies.kind",
                    format!("`{name}`: expected `list` or `detail`, got `{other}`"),
                ));
            }
        };
        policy.fetch = FetchPolicy::for_kind(policy.kind);
    }

    let stale_after = raw
        .stale_after_seconds
        .map(Duration::from_secs)
        .unwrap_or(policy.staleness.stale_after());
    let expire_after = raw
        .expire_after_seconds
        .map(Duration::from_secs)
        .unwrap_or(policy.staleness.expire_after());
    policy.staleness = StalenessPolicy::new(stale_after, expire_after).map_err(|err| {
        LoadError::invalid("cache.policies.staleness", format!("`{name}`: {err}"))
    })?;

    if let Some(timeout_ms) = raw.timeout_ms {
        if timeout_ms == 0 {
            return Err(LoadError::invalid(
                "cache.policies.timeout_ms",
                format!("`{name}`: must be greater than zero"),
            ));
        }
        policy.fetch.timeout = Duration::from_millis(timeout_ms);
    }
    if let Some(max_retries) = raw.max_retries {
        policy.fetch.max_retries = max_retries;
    }
    if let Some(max_backoff_ms) = raw.max_backoff_ms {
        policy.fetch.max_backoff = Duration::from_millis(max_backoff_ms);
    }
    if let Some(stale_on_denied) = raw.stale_on_denied {
        policy.stale_on_denied = stale_on_denied;
    }

    Ok(policy)
}

fn build_listener_settings(listener: RawListenerSettings) -> Result<ListenerSettings, LoadError> {
    let role_suffixes = match listener.role_suffixes {
        Some(suffixes) => suffixes
            .into_iter()
            .map(|suffix| suffix.trim().to_ascii_lowercase())
            .filter(|suffix| !suffix.is_empty())
            .collect(),
        None => DEFAULT_ROLE_SUFFIXES
            .iter()
            .map(|suffix| suffix.to_string())
            .collect(),
    };

    let initial_ms = listener
        .reconnect_initial_ms
        .unwrap_or(DEFAULT_RECONNECT_INITIAL_MS);
    if initial_ms == 0 {
        return Err(LoadError::invalid(
            "listener.reconnect_initial_ms",
            "must be greater than zero",
        ));
    }

    let max_ms = listener.reconnect_max_ms.unwrap_or(DEFAULT_RECONNECT_MAX_MS);
    if max_ms < initial_ms {
        return Err(LoadError::invalid(
            "listener.reconnect_max_ms",
            "must not be smaller than listener.reconnect_initial_ms",
        ));
    }

    Ok(ListenerSettings {
        role_suffixes,
        reconnect_initial: Duration::from_millis(initial_ms),
        reconnect_max: Duration::from_millis(max_ms),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    sweep_interval_seconds: Option<u64>,
    slow_query_ms: Option<u64>,
    policies: BTreeMap<String, RawPolicySettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    kind: Option<String>,
    stale_after_seconds: Option<u64>,
    expire_after_seconds: Option<u64>,
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    max_backoff_ms: Option<u64>,
    stale_on_denied: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawListenerSettings {
    role_suffixes: Option<Vec<String>>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPrefetchSettings {
    enabled: Option<bool>,
}
