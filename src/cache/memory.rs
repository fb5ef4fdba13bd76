//! In-process cache backend.
//!
//! Used when no Redis URL is configured and throughout the test suite.
//! Expired entries are dropped on access and swept on every write. The store
//! holds at most `max_entries` entries; when full, the entry closest to
//! expiry is evicted. Scan cursors left open by abandoned scans are pruned
//! after [`CURSOR_IDLE`].

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::backend::CacheBackend;
use crate::error::CacheError;

/// Default entry cap.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
/// Open cursors not resumed within this window are dropped.
pub const CURSOR_IDLE: Duration = Duration::from_secs(60);
const MAX_OPEN_CURSORS: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug)]
struct OpenCursor {
    last_key: String,
    opened_at: Instant,
}

/// `RwLock<BTreeMap>` store with TTLs and resumable scans.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Entry>>,
    max_entries: usize,
    /// Open scans: cursor id -> last key returned.
    cursors: Mutex<HashMap<u64, OpenCursor>>,
    next_cursor: AtomicU64,
    evicted: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    /// Store holding at most `max_entries` entries (minimum 1).
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            max_entries: max_entries.max(1),
            cursors: Mutex::new(HashMap::new()),
            next_cursor: AtomicU64::new(1),
            evicted: AtomicU64::new(0),
        }
    }

    /// Entries currently held, expired ones included until the next sweep.
    pub async fn stored(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Live entries evicted to stay under the cap.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Scan cursors currently held open.
    pub fn open_cursors(&self) -> usize {
        self.cursors().len()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn cursors(&self) -> std::sync::MutexGuard<'_, HashMap<u64, OpenCursor>> {
        self.cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_cursor(&self, last_key: String, now: Instant) -> u64 {
        let id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
        let mut cursors = self.cursors();
        cursors.retain(|_, c| now.duration_since(c.opened_at) < CURSOR_IDLE);
        if cursors.len() >= MAX_OPEN_CURSORS {
            if let Some(oldest) = cursors
                .iter()
                .min_by_key(|(_, c)| c.opened_at)
                .map(|(id, _)| *id)
            {
                cursors.remove(&oldest);
            }
        }
        cursors.insert(
            id,
            OpenCursor {
                last_key,
                opened_at: now,
            },
        );
        id
    }
}

fn evict_expired(entries: &mut BTreeMap<String, Entry>, now: Instant) {
    entries.retain(|_, e| e.is_live(now));
}

/// Drop the entry closest to expiry.
fn evict_soonest(entries: &mut BTreeMap<String, Entry>) -> bool {
    let victim = entries
        .iter()
        .min_by_key(|(_, e)| e.expires_at)
        .map(|(k, _)| k.clone());
    match victim {
        Some(key) => entries.remove(&key).is_some(),
        None => false,
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                None => return Ok(None),
                Some(_) => {}
            }
        }
        // Expired: drop it, unless it was refreshed in between.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        evict_expired(&mut entries, now);
        if ttl.is_zero() {
            entries.remove(key);
            return Ok(());
        }
        if !entries.contains_key(key) {
            while entries.len() >= self.max_entries && evict_soonest(&mut entries) {
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        let resume_after = if cursor == 0 {
            None
        } else {
            match self.cursors().remove(&cursor) {
                Some(open) => Some(open.last_key),
                None => {
                    return Err(CacheError::Connection(format!(
                        "unknown scan cursor {cursor}"
                    )))
                }
            }
        };

        let lower = match &resume_after {
            Some(last) => Bound::Excluded(last.clone()),
            None => Bound::Included(prefix.to_string()),
        };

        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut page = Vec::new();
        let mut more = false;
        for (key, entry) in entries.range((lower, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            if !entry.is_live(now) {
                continue;
            }
            if page.len() == count.max(1) {
                more = true;
                break;
            }
            page.push(key.clone());
        }
        drop(entries);

        match (more, page.last()) {
            (true, Some(last)) => Ok((self.open_cursor(last.clone(), now), page)),
            _ => Ok((0, page)),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn value_size(&self, key: &str) -> Result<u64, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.len() as u64)
            .unwrap_or(0))
    }
}
