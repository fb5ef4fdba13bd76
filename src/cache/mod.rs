//! Prompt response cache.
//!
//! Completed batch responses are stored under a key derived from the cache
//! namespace (tenant), the model selection and the exact prompt:
//!
//! ```text
//! {prefix}:{namespace}:{sha256_hex(namespace 0x1f model 0x1f prompt)}
//! ```
//!
//! The namespace is repeated in clear text so a whole tenant can be dropped
//! with a prefix scan. Backend failures never reach the caller: a failed read
//! is a miss and a failed write is skipped.

mod backend;
mod memory;
mod redis;

pub use self::backend::CacheBackend;
pub use self::memory::MemoryBackend;
pub use self::redis::{match_pattern, RedisBackend};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::task::{check_namespace, TaskType};

const KEY_SEPARATOR: u8 = 0x1f;

/// Prompt cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Redis URL. The in-process backend is used when unset.
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub research_ttl_secs: u64,
    pub extraction_ttl_secs: u64,
    pub default_ttl_secs: u64,
    /// Keys fetched per page during namespace invalidation.
    pub scan_batch_size: usize,
    /// Entry cap of the in-process backend.
    pub memory_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            key_prefix: "llm_cache".to_string(),
            research_ttl_secs: 30 * 60,
            extraction_ttl_secs: 24 * 60 * 60,
            default_ttl_secs: 60 * 60,
            scan_batch_size: 100,
            memory_max_entries: 10_000,
        }
    }
}

/// Cache usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 with no traffic.
    pub hit_rate: f64,
    pub total_requests: u64,
    /// Sum of stored value sizes under the cache prefix.
    pub approx_size_bytes: u64,
}

/// Namespaced TTL cache over a [`CacheBackend`].
pub struct PromptCache {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PromptCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// In-process cache with default settings.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), CacheConfig::default())
    }

    /// Build the backend named by `config`: Redis when a URL is set, in-process otherwise.
    pub async fn connect(config: CacheConfig) -> Result<Self, CacheError> {
        let backend: Arc<dyn CacheBackend> = match &config.redis_url {
            Some(url) if !url.is_empty() => Arc::new(RedisBackend::connect(url).await?),
            _ => Arc::new(MemoryBackend::with_capacity(config.memory_max_entries)),
        };
        info!(
            backend = backend.name(),
            enabled = config.enabled,
            prefix = %config.key_prefix,
            "Prompt cache ready"
        );
        Ok(Self::new(backend, config))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Deterministic key for a `(namespace, model, prompt)` triple.
    pub fn cache_key(&self, namespace: &str, model: &str, prompt: &str) -> String {
        cache_key(&self.config.key_prefix, namespace, model, prompt)
    }

    /// TTL for responses to a task of the given type.
    pub fn ttl_for(&self, task_type: TaskType) -> Duration {
        let secs = match task_type {
            TaskType::Research => self.config.research_ttl_secs,
            TaskType::Extraction => self.config.extraction_ttl_secs,
            _ => self.config.default_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    pub async fn get(&self, namespace: &str, model: &str, prompt: &str) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        if let Err(e) = check_namespace(namespace) {
            warn!(error = %e, "Cache read refused");
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let key = self.cache_key(namespace, model, prompt);
        let found = match self.backend.get(&key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, backend = self.backend.name(), "Cache read failed, treating as miss");
                None
            }
        };
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(namespace, "Cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub async fn put(&self, namespace: &str, model: &str, prompt: &str, content: &str, ttl: Duration) {
        if !self.config.enabled {
            return;
        }
        if let Err(e) = check_namespace(namespace) {
            warn!(error = %e, "Cache write refused");
            return;
        }
        let key = self.cache_key(namespace, model, prompt);
        if let Err(e) = self.backend.set_ex(&key, content, ttl).await {
            warn!(error = %e, backend = self.backend.name(), "Cache write failed, skipping");
        }
    }

    /// Delete every entry of `namespace`, returning how many were removed.
    ///
    /// Pages are deleted as they are scanned. A backend failure stops the
    /// sweep and the partial count is returned. A namespace containing the
    /// key separator would match other tenants' keys and removes nothing.
    pub async fn invalidate_namespace(&self, namespace: &str) -> u64 {
        if let Err(e) = check_namespace(namespace) {
            warn!(error = %e, "Invalidation refused");
            return 0;
        }
        let prefix = format!("{}:{}:", self.config.key_prefix, namespace);
        let mut cursor = 0;
        let mut removed = 0;
        loop {
            let (next, keys) = match self
                .backend
                .scan_prefix(&prefix, cursor, self.config.scan_batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, namespace, removed, "Cache scan failed during invalidation");
                    break;
                }
            };
            if !keys.is_empty() {
                match self.backend.delete(&keys).await {
                    Ok(n) => removed += n,
                    Err(e) => {
                        warn!(error = %e, namespace, removed, "Cache delete failed during invalidation");
                        break;
                    }
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        info!(namespace, removed, "Invalidated cache namespace");
        removed
    }

    /// Hit/miss counters plus an approximate stored size.
    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total_requests == 0 {
                0.0
            } else {
                hits as f64 / total_requests as f64
            },
            total_requests,
            approx_size_bytes: self.approx_size_bytes().await,
        }
    }

    async fn approx_size_bytes(&self) -> u64 {
        let prefix = format!("{}:", self.config.key_prefix);
        let mut cursor = 0;
        let mut total = 0;
        loop {
            let (next, keys) = match self
                .backend
                .scan_prefix(&prefix, cursor, self.config.scan_batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "Cache scan failed while sizing");
                    return total;
                }
            };
            for key in &keys {
                match self.backend.value_size(key).await {
                    Ok(size) => total += size,
                    Err(e) => warn!(error = %e, "Cache size lookup failed"),
                }
            }
            if next == 0 {
                return total;
            }
            cursor = next;
        }
    }
}

/// `{prefix}:{namespace}:{sha256_hex(namespace 0x1f model 0x1f prompt)}`.
pub fn cache_key(prefix: &str, namespace: &str, model: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([KEY_SEPARATOR]);
    hasher.update(model.as_bytes());
    hasher.update([KEY_SEPARATOR]);
    hasher.update(prompt.as_bytes());
    format!("{}:{}:{}", prefix, namespace, hex::encode(hasher.finalize()))
}
