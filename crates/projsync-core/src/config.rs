use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CACHE_TTL};
use crate::demux::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_DEDUPE_CAPACITY};
use crate::gateway::{DEFAULT_CREDENTIAL_SKEW, DEFAULT_REFRESH_TIMEOUT};
use crate::reconcile::{SortDirection, DEFAULT_SEEN_TTL};

pub const ENV_CONFIG_PATH: &str = "PROJSYNC_CONFIG";
pub const ENV_SEEN_TTL_SECS: &str = "PROJSYNC_SEEN_TTL_SECS";
pub const ENV_DEDUPE_CAPACITY: &str = "PROJSYNC_DEDUPE_CAPACITY";
pub const ENV_CHANNEL_CAPACITY: &str = "PROJSYNC_CHANNEL_CAPACITY";
pub const ENV_REFRESH_TIMEOUT_MS: &str = "PROJSYNC_REFRESH_TIMEOUT_MS";
pub const ENV_CACHE_MAX_ENTRIES: &str = "PROJSYNC_CACHE_MAX_ENTRIES";
pub const ENV_CACHE_TTL_SECS: &str = "PROJSYNC_CACHE_TTL_SECS";

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Seconds an event key (and a tombstone) is remembered by the reconciler.
    #[serde(default)]
    pub seen_ttl_secs: Option<u64>,
    /// Recently delivered event keys kept per subscription.
    #[serde(default)]
    pub dedupe_capacity: Option<usize>,
    /// Bound of the queue between change streams and the apply loop.
    #[serde(default)]
    pub channel_capacity: Option<usize>,
    #[serde(default)]
    pub comment_order: Option<SortDirection>,
    #[serde(default)]
    pub task_order: Option<SortDirection>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Upper bound for one credential refresh, in milliseconds.
    #[serde(default)]
    pub refresh_timeout_ms: Option<u64>,
    /// A credential expiring within this many seconds is treated as stale.
    #[serde(default)]
    pub credential_skew_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default)]
    pub max_entries: Option<u64>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema_value = config_schema_json();
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid config {}", path.display()))
}

/// Resolved engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub seen_ttl: Duration,
    pub dedupe_capacity: usize,
    pub channel_capacity: usize,
    pub comment_order: SortDirection,
    pub task_order: SortDirection,
    pub refresh_timeout: Duration,
    pub credential_skew: Duration,
    pub cache_max_entries: u64,
    pub cache_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            seen_ttl: DEFAULT_SEEN_TTL,
            dedupe_capacity: DEFAULT_DEDUPE_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            comment_order: SortDirection::NewestFirst,
            task_order: SortDirection::OldestFirst,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            credential_skew: DEFAULT_CREDENTIAL_SKEW,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        let d = Self::default();
        Self {
            seen_ttl: cfg
                .sync
                .seen_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(d.seen_ttl),
            dedupe_capacity: cfg.sync.dedupe_capacity.unwrap_or(d.dedupe_capacity).max(1),
            channel_capacity: cfg.sync.channel_capacity.unwrap_or(d.channel_capacity).max(1),
            comment_order: cfg.sync.comment_order.unwrap_or(d.comment_order),
            task_order: cfg.sync.task_order.unwrap_or(d.task_order),
            refresh_timeout: cfg
                .gateway
                .refresh_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.refresh_timeout),
            credential_skew: cfg
                .gateway
                .credential_skew_secs
                .map(Duration::from_secs)
                .unwrap_or(d.credential_skew),
            cache_max_entries: cfg.cache.max_entries.unwrap_or(d.cache_max_entries).max(1),
            cache_ttl: cfg
                .cache
                .ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(d.cache_ttl),
        }
    }

    /// Applies `PROJSYNC_*` overrides. Unparseable values are logged and skipped.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_number::<u64>(ENV_SEEN_TTL_SECS) {
            self.seen_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_number::<usize>(ENV_DEDUPE_CAPACITY) {
            self.dedupe_capacity = v.max(1);
        }
        if let Some(v) = env_number::<usize>(ENV_CHANNEL_CAPACITY) {
            self.channel_capacity = v.max(1);
        }
        if let Some(v) = env_number::<u64>(ENV_REFRESH_TIMEOUT_MS) {
            self.refresh_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_number::<u64>(ENV_CACHE_MAX_ENTRIES) {
            self.cache_max_entries = v.max(1);
        }
        if let Some(v) = env_number::<u64>(ENV_CACHE_TTL_SECS) {
            self.cache_ttl = Duration::from_secs(v);
        }
        self
    }

    /// Defaults, then the file named by `PROJSYNC_CONFIG` if set, then env.
    pub fn load() -> Result<Self> {
        let base = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) if !path.trim().is_empty() => Self::from_config(&load_config(path.trim())?),
            _ => Self::default(),
        };
        Ok(base.with_env_overrides())
    }
}

fn env_number<T: std::str::FromStr>(key: &'static str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(target: "projsync::config", key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}
