//! Key-value store collaborator.
//!
//! The cache service and the Turnstile verifier both sit on top of a networked
//! key-value store (Redis in production). The [`KeyValueStore`] trait captures
//! the primitives they need so components can be exercised against the
//! in-process [`memory::MemoryStore`] without a running server.

use anyhow::Result;
use async_trait::async_trait;

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Raw string-valued store operations. Keys passed here are already fully
/// qualified; prefixing is the caller's concern.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// SET with expiry in seconds.
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;

    /// Delete the given keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Cursor-based iteration over keys matching a glob pattern. A returned
    /// cursor of `0` means the iteration is complete. `count` is a hint, not
    /// a guarantee, matching Redis SCAN semantics.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;

    /// Bulk GET preserving input order.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Pipelined batch of SETs, each with an optional per-entry TTL. The batch
    /// executes as a single round-trip; it is not a transaction, so partial
    /// application on a store-level crash is possible.
    async fn mset(&self, entries: &[(String, String, Option<u64>)]) -> Result<()>;
}
