//! Redis cache backend.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;

use super::backend::CacheBackend;
use crate::error::CacheError;

/// Cache backend on a shared Redis `ConnectionManager`.
#[derive(Clone)]
pub struct RedisBackend {
    redis: ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Connection` if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| CacheError::Connection(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Wrap an existing connection, e.g. one shared with other components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

/// Escape glob metacharacters so a literal prefix can be used in `MATCH`.
pub fn match_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        // EX rejects 0.
        let secs = ttl.as_secs().max(1);
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        let mut conn = self.redis.clone();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(match_pattern(prefix))
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.redis.clone();
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn value_size(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.redis.clone();
        let size: u64 = redis::cmd("STRLEN").arg(key).query_async(&mut conn).await?;
        Ok(size)
    }
}
