//! Storage interface behind the prompt cache.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::CacheError;

/// A key/value store with per-key expiry and cursor-based prefix scans.
///
/// Modelled on the subset of Redis the prompt cache needs. A scan starts at
/// cursor `0` and is finished when the backend hands back cursor `0`; keys
/// deleted between pages must not cause other matching keys to be skipped.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` under `key`, replacing any previous value, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// One page of keys starting with `prefix`. Returns the next cursor and the page.
    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError>;

    /// Delete `keys`, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Size in bytes of the value under `key`, 0 when absent.
    async fn value_size(&self, key: &str) -> Result<u64, CacheError>;
}
