//! Persisting reconciled collections into the local cache.
//!
//! The writer remembers the last value it wrote per key and turns each new
//! collection into an RFC 6902 patch against it, applied to whatever the
//! store currently holds. Other writers sharing the store keep their edits to
//! parts of the document this patch does not touch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use moka::sync::Cache;
use parking_lot::Mutex;
use projsync_protocol::{Entity, EntityKind};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Settings;

const METRIC_CACHE_FALLBACKS: &str = "projsync_cache_full_replace";

pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 512;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub entity_set: &'static str,
    pub parent_id: String,
}

impl CacheKey {
    pub fn new(kind: EntityKind, parent_id: impl Into<String>) -> Self {
        Self {
            entity_set: kind.entity_set(),
            parent_id: parent_id.into(),
        }
    }

    pub fn for_entity<E: Entity>(parent_id: impl Into<String>) -> Self {
        Self::new(E::KIND, parent_id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_set, self.parent_id)
    }
}

/// Local key/value store. Writes are local only.
pub trait CacheStore: Send + Sync {
    fn read(&self, key: &CacheKey) -> Option<Value>;
    fn write(&self, key: &CacheKey, value: Value);
}

pub struct MemoryCacheStore {
    inner: Cache<CacheKey, Value>,
}

impl MemoryCacheStore {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_entries.max(1))
                .time_to_live(ttl.max(Duration::from_secs(1)))
                .build(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.cache_max_entries, settings.cache_ttl)
    }

    pub fn remove(&self, key: &CacheKey) {
        self.inner.invalidate(key);
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CACHE_TTL)
    }
}

impl CacheStore for MemoryCacheStore {
    fn read(&self, key: &CacheKey) -> Option<Value> {
        self.inner.get(key)
    }

    fn write(&self, key: &CacheKey, value: Value) {
        self.inner.insert(key.clone(), value);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplaceReason {
    /// Nothing cached for the key yet.
    Miss,
    /// Cached value is not a collection document.
    Malformed,
    /// The patch did not apply to the cached value.
    PatchRejected,
}

impl ReplaceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplaceReason::Miss => "miss",
            ReplaceReason::Malformed => "malformed",
            ReplaceReason::PatchRejected => "patch_rejected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    Patched { operations: usize },
    Unchanged,
    Replaced(ReplaceReason),
    Skipped(String),
}

pub struct CacheWriter {
    store: Arc<dyn CacheStore>,
    last: Mutex<HashMap<CacheKey, Value>>,
}

impl CacheWriter {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Writes `collection` under `key`. Never fails; a write that cannot be
    /// expressed as a patch becomes a full replace.
    pub fn persist<E: Entity>(&self, key: &CacheKey, collection: &[E]) -> PersistOutcome {
        let current = match serde_json::to_value(collection) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    target: "projsync::cache",
                    key = %key,
                    error = %err,
                    "collection did not serialize; cache left as is"
                );
                return PersistOutcome::Skipped(err.to_string());
            }
        };

        let mut last = self.last.lock();
        let cached = self.store.read(key);
        let previous = match last.get(key) {
            Some(prev) => Some(prev.clone()),
            None => cached
                .as_ref()
                .and_then(|doc| doc.get("entities"))
                .cloned(),
        };

        let outcome = match (cached, previous) {
            (None, _) => self.replace(key, &current, ReplaceReason::Miss),
            (Some(_), None) => self.replace(key, &current, ReplaceReason::Malformed),
            (Some(mut doc), Some(previous)) => {
                let patch = json_patch::diff(&previous, &current);
                if patch.0.is_empty() {
                    PersistOutcome::Unchanged
                } else {
                    match doc.get_mut("entities") {
                        Some(entities) => match json_patch::patch(entities, &patch) {
                            Ok(()) => {
                                stamp(&mut doc);
                                self.store.write(key, doc);
                                PersistOutcome::Patched {
                                    operations: patch.0.len(),
                                }
                            }
                            Err(err) => {
                                debug!(key = %key, error = %err, "patch did not apply to cached value");
                                self.replace(key, &current, ReplaceReason::PatchRejected)
                            }
                        },
                        None => self.replace(key, &current, ReplaceReason::Malformed),
                    }
                }
            }
        };
        last.insert(key.clone(), current);
        debug!(key = %key, outcome = ?outcome, "collection persisted");
        outcome
    }

    /// Drops the remembered baseline for `key`; the cached value stays.
    pub fn forget(&self, key: &CacheKey) {
        self.last.lock().remove(key);
    }

    fn replace(&self, key: &CacheKey, entities: &Value, reason: ReplaceReason) -> PersistOutcome {
        metrics::counter!(METRIC_CACHE_FALLBACKS, "reason" => reason.as_str()).increment(1);
        let mut doc = json!({ "entities": entities.clone() });
        stamp(&mut doc);
        self.store.write(key, doc);
        PersistOutcome::Replaced(reason)
    }
}

fn stamp(doc: &mut Value) {
    if let Value::Object(map) = doc {
        map.insert(
            "persisted_at".into(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
}

/// Reads the entities stored under `key`, if they decode as `E`.
pub fn read_collection<E: Entity>(store: &dyn CacheStore, key: &CacheKey) -> Option<Vec<E>> {
    let doc = store.read(key)?;
    let entities = doc.get("entities")?.clone();
    serde_json::from_value(entities).ok()
}
