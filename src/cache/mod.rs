//! Typed caching wrapper over the key-value store.
//!
//! Every logical key is namespaced under the service's prefix before it
//! touches the store; values are JSON-serialized on the way in and parsed on
//! the way out. The service keeps per-instance hit/miss counters and reports
//! them through the OpenTelemetry global meter. Store-level errors always
//! propagate to the caller: this is a general-purpose primitive with no safe
//! default.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use opentelemetry::{global, metrics::Counter, KeyValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::store::KeyValueStore;

pub const DEFAULT_CACHE_PREFIX: &str = "gardisto:cache:";

const SCAN_BATCH_SIZE: usize = 100;
const METER_NAME: &str = "gardisto";

/// Hit/miss counters scoped to one cache service instance. Returned by value
/// so callers cannot mutate the live counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
}

/// One entry of a bulk `mset`.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub ttl_seconds: Option<i64>,
}

#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    operations: Counter<u64>,
}

impl CacheService {
    /// Create a cache service over `store`, namespacing every key under
    /// `prefix`. Registers a hit-rate observer tagged with the prefix.
    pub fn new(store: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let hits = Arc::new(AtomicU64::new(0));
        let misses = Arc::new(AtomicU64::new(0));

        let meter = global::meter(METER_NAME);
        let operations = meter.u64_counter("cache.operations").build();

        let gauge_hits = Arc::clone(&hits);
        let gauge_misses = Arc::clone(&misses);
        let gauge_prefix = prefix.clone();
        meter
            .f64_observable_gauge("cache.hit_rate")
            .with_callback(move |observer| {
                let hits = gauge_hits.load(Ordering::Relaxed);
                let misses = gauge_misses.load(Ordering::Relaxed);
                let total = hits + misses;
                let rate = if total == 0 {
                    0.0
                } else {
                    hits as f64 / total as f64
                };
                observer.observe(rate, &[KeyValue::new("key_prefix", gauge_prefix.clone())]);
            })
            .build();

        Self {
            store,
            prefix,
            hits,
            misses,
            operations,
        }
    }

    /// Cache service with the crate-wide default namespace.
    pub fn with_default_prefix(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, DEFAULT_CACHE_PREFIX)
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Fetch and JSON-decode a value.
    ///
    /// A store miss returns `Ok(None)` and counts as a miss. A store hit
    /// counts as a hit even when the payload does not decode to `T`; payloads
    /// that are not valid JSON are re-read as a JSON string so `get::<String>`
    /// returns the stored text unchanged.
    ///
    /// # Errors
    /// Store-level failures propagate unchanged.
    #[instrument(skip(self), fields(key_prefix = %self.prefix))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let prefixed = self.prefixed(key);

        let raw = match self.store.get(&prefixed).await {
            Ok(raw) => raw,
            Err(err) => {
                self.record("get", "error");
                return Err(err);
            }
        };

        let Some(raw) = raw else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.record("get", "miss");
            return Ok(None);
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        self.record("get", "hit");
        Ok(decode(&raw))
    }

    /// JSON-encode and store a value. A TTL of zero or below means "no TTL",
    /// not an error.
    ///
    /// # Errors
    /// Returns an error if serialization or the store write fails.
    #[instrument(skip(self, value), fields(key_prefix = %self.prefix, ttl = ttl_seconds))]
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: Option<i64>,
    ) -> Result<()> {
        let prefixed = self.prefixed(key);
        let payload = serde_json::to_string(value).context("failed to serialize cache value")?;

        let result = match ttl_seconds {
            Some(ttl) if ttl > 0 => self.store.set_ex(&prefixed, &payload, ttl as u64).await,
            _ => self.store.set(&prefixed, &payload).await,
        };

        match result {
            Ok(()) => {
                self.record("set", "success");
                Ok(())
            }
            Err(err) => {
                self.record("set", "error");
                Err(err)
            }
        }
    }

    /// Remove a single key.
    ///
    /// # Errors
    /// Store-level failures propagate unchanged.
    #[instrument(skip(self), fields(key_prefix = %self.prefix))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let prefixed = self.prefixed(key);
        match self.store.del(&[prefixed]).await {
            Ok(_) => {
                self.record("delete", "success");
                Ok(())
            }
            Err(err) => {
                self.record("delete", "error");
                Err(err)
            }
        }
    }

    /// Remove every key matching a glob pattern (within this service's
    /// namespace), returning how many were deleted. Scans in batches of 100
    /// and only issues a DEL when a batch matched something.
    ///
    /// # Errors
    /// Store-level failures propagate unchanged.
    #[instrument(skip(self), fields(key_prefix = %self.prefix, key_count = tracing::field::Empty))]
    pub async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        let prefixed_pattern = self.prefixed(pattern);

        let result = async {
            let mut cursor = 0;
            let mut deleted = 0;
            loop {
                let (next, keys) = self
                    .store
                    .scan(cursor, &prefixed_pattern, SCAN_BATCH_SIZE)
                    .await?;
                if !keys.is_empty() {
                    deleted += self.store.del(&keys).await?;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(deleted)
        }
        .await;

        match result {
            Ok(deleted) => {
                tracing::Span::current().record("key_count", deleted);
                self.record("delete_by_pattern", "success");
                Ok(deleted)
            }
            Err(err) => {
                self.record("delete_by_pattern", "error");
                Err(err)
            }
        }
    }

    /// Bulk fetch, preserving input order. Empty input returns an empty
    /// vector without a store round-trip. Hit/miss counters are updated once
    /// per call with the aggregate outcome.
    ///
    /// # Errors
    /// Store-level failures propagate unchanged.
    #[instrument(skip(self), fields(key_prefix = %self.prefix, key_count = keys.len()))]
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[&str]) -> Result<Vec<Option<T>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let prefixed: Vec<String> = keys.iter().map(|key| self.prefixed(key)).collect();
        let raw = match self.store.mget(&prefixed).await {
            Ok(raw) => raw,
            Err(err) => {
                self.record("mget", "error");
                return Err(err);
            }
        };

        let mut hits = 0;
        let mut misses = 0;
        let values = raw
            .into_iter()
            .map(|item| match item {
                Some(raw) => {
                    hits += 1;
                    decode(&raw)
                }
                None => {
                    misses += 1;
                    None
                }
            })
            .collect();

        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.misses.fetch_add(misses, Ordering::Relaxed);
        self.record("mget", if misses == 0 { "hit" } else { "miss" });
        Ok(values)
    }

    /// Bulk store as one pipelined batch, each entry honoring its own
    /// optional TTL. Empty input is a no-op.
    ///
    /// # Errors
    /// Returns an error if serialization or the store write fails.
    #[instrument(skip(self, entries), fields(key_prefix = %self.prefix, key_count = entries.len()))]
    pub async fn mset<T: Serialize>(&self, entries: &[CacheEntry<T>]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut batch = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = serde_json::to_string(&entry.value)
                .context("failed to serialize cache value")?;
            let ttl = entry.ttl_seconds.filter(|ttl| *ttl > 0).map(|ttl| ttl as u64);
            batch.push((self.prefixed(&entry.key), payload, ttl));
        }

        match self.store.mset(&batch).await {
            Ok(()) => {
                self.record("mset", "success");
                Ok(())
            }
            Err(err) => {
                self.record("mset", "error");
                Err(err)
            }
        }
    }

    /// Hits over total requests; `0.0` when nothing has been requested yet.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Snapshot of the counters, by value.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn reset_metrics(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn record(&self, operation: &'static str, status: &'static str) {
        self.operations.add(
            1,
            &[
                KeyValue::new("operation", operation),
                KeyValue::new("status", status),
                KeyValue::new("key_prefix", self.prefix.clone()),
            ],
        );
    }
}

/// Parse a cached payload. Payloads that are not valid JSON fall back to
/// being read as a JSON string; payloads matching neither decode to `None`.
fn decode<T: DeserializeOwned>(raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(_) => match serde_json::from_value(Value::String(raw.to_string())) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, "cached payload does not match requested type");
                None
            }
        },
    }
}
