//! In-process [`KeyValueStore`] used for development and tests.
//!
//! Mirrors the Redis semantics the cache service relies on: TTL expiry, glob
//! pattern SCAN with stable cursors, and bulk operations. Scan cursors are
//! lexicographic watermarks, so deleting the keys of one batch never hides
//! keys from the next one. Call counters allow tests to assert how many
//! round-trips an operation issued.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use super::KeyValueStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    // cursor id -> last key returned by the previous scan batch
    scan_cursors: Mutex<HashMap<u64, String>>,
    next_cursor: AtomicU64,
    scan_calls: AtomicU64,
    mget_calls: AtomicU64,
    del_calls: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            scan_cursors: Mutex::new(HashMap::new()),
            // cursor 0 means "iteration complete", so ids start at 1
            next_cursor: AtomicU64::new(1),
            scan_calls: AtomicU64::new(0),
            mget_calls: AtomicU64::new(0),
            del_calls: AtomicU64::new(0),
        }
    }

    /// Number of SCAN round-trips issued so far.
    pub fn scan_calls(&self) -> u64 {
        self.scan_calls.load(Ordering::Relaxed)
    }

    /// Number of DEL round-trips issued so far.
    pub fn del_calls(&self) -> u64 {
        self.del_calls.load(Ordering::Relaxed)
    }

    /// Number of MGET round-trips issued so far.
    pub fn mget_calls(&self) -> u64 {
        self.mget_calls.load(Ordering::Relaxed)
    }

    /// Expiry instant recorded for a key, if any. Test helper.
    pub fn expiry(&self, key: &str) -> Option<Instant> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .and_then(|entry| entry.expires_at)
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.read_entries();
        // Expired entries are filtered lazily rather than removed.
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.write_entries().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        self.write_entries().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.del_calls.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.write_entries();
        let mut removed = 0;
        for key in keys {
            if entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        self.scan_calls.fetch_add(1, Ordering::Relaxed);

        let watermark = if cursor == 0 {
            None
        } else {
            let mut cursors = self
                .scan_cursors
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            cursors.remove(&cursor)
        };

        let entries = self.read_entries();
        let mut matched: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| {
                !entry.is_expired()
                    && glob_match(pattern, key)
                    && watermark.as_deref().map_or(true, |mark| key.as_str() > mark)
            })
            .map(|(key, _)| key.clone())
            .collect();
        drop(entries);

        let has_more = matched.len() > count;
        matched.truncate(count);

        let next = if has_more {
            let id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
            if let Some(last) = matched.last() {
                self.scan_cursors
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert(id, last.clone());
            }
            id
        } else {
            0
        };

        Ok((next, matched))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.mget_calls.fetch_add(1, Ordering::Relaxed);
        let entries = self.read_entries();
        Ok(keys
            .iter()
            .map(|key| {
                entries
                    .get(key)
                    .filter(|entry| !entry.is_expired())
                    .map(|entry| entry.value.clone())
            })
            .collect())
    }

    async fn mset(&self, batch: &[(String, String, Option<u64>)]) -> Result<()> {
        let mut entries = self.write_entries();
        for (key, value, ttl_seconds) in batch {
            entries.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    expires_at: ttl_seconds
                        .map(|ttl| Instant::now() + Duration::from_secs(ttl)),
                },
            );
        }
        Ok(())
    }
}

/// Glob matching with `*` (any sequence) and `?` (single character), the
/// subset Redis MATCH patterns use here.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // Backtrack: let the last star absorb one more character.
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}
