//! Durable cost ledger.
//!
//! Every completed provider call is appended to a SQLite log. A month-to-date
//! per-provider aggregate is maintained in memory so the router can read
//! spend without touching the database:
//!
//! - on open, the aggregate is rebuilt from the log for the current month;
//! - each successful insert adds its cost under one mutex;
//! - when the calendar month changes, the aggregate is rebuilt while holding
//!   the write side of an epoch lock, which in-flight records hold for read.
//!
//! The aggregate therefore never contains spend without a committed row, and
//! concurrent records never lose increments.

mod aggregate;
mod store;

pub use aggregate::{dollars_to_micros, micros_to_dollars, MonthKey, MonthlyAggregate};
pub use store::LedgerStore;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::routing::SpendSnapshot;
use crate::task::{Response, Task};

/// One completed provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Row id, assigned by the store.
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub task_type: String,
    pub task_id: String,
    pub tokens_input: u32,
    pub tokens_output: u32,
    pub tokens_total: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub routing_reason: String,
    pub fallback_used: bool,
}

impl LedgerEntry {
    /// Build the entry for a served response, timestamped now.
    pub fn from_response(task: &Task, response: &Response) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            provider: response.provider.clone(),
            model: response.model.clone(),
            task_type: task.task_type.as_str().to_string(),
            task_id: task.id.clone(),
            tokens_input: response.tokens_input,
            tokens_output: response.tokens_output,
            tokens_total: response.tokens_total,
            cost_usd: response.cost_usd,
            latency_ms: response.latency_ms,
            routing_reason: response.routing_reason.clone(),
            fallback_used: response.fallback_used,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Request/token/cost totals for one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub requests: u64,
    pub tokens: u64,
    pub cost_usd: f64,
}

/// Ledger statistics over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_cost_per_request: f64,
    pub avg_latency_ms: f64,
    pub fallback_count: u64,
    pub provider_breakdown: HashMap<String, Breakdown>,
    pub task_breakdown: HashMap<String, Breakdown>,
}

/// Append-only cost log plus month-to-date aggregate.
pub struct CostLedger {
    store: LedgerStore,
    aggregate: MonthlyAggregate,
    /// Held for read by `record`, for write by month rebuilds.
    epoch: RwLock<()>,
}

impl CostLedger {
    /// Open a file-backed ledger and rebuild the current month.
    pub async fn open(path: &str) -> Result<Self, LedgerError> {
        let store = LedgerStore::open(path).await?;
        Self::with_store(store).await
    }

    /// A non-durable ledger, for tests and dry runs.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let store = LedgerStore::in_memory().await?;
        Self::with_store(store).await
    }

    async fn with_store(store: LedgerStore) -> Result<Self, LedgerError> {
        let month = MonthKey::current();
        let ledger = Self {
            store,
            aggregate: MonthlyAggregate::new(month),
            epoch: RwLock::new(()),
        };
        let _guard = ledger.epoch.write().await;
        ledger.rebuild(month).await?;
        drop(_guard);
        Ok(ledger)
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Reload the aggregate for `month` from the log. Caller holds the write epoch.
    async fn rebuild(&self, month: MonthKey) -> Result<(), LedgerError> {
        let (start_ms, end_ms) = month.window_ms().ok_or_else(|| {
            LedgerError::InvalidRange(format!("{}-{:02}", month.year, month.month))
        })?;
        let micros = self.store.micros_by_provider(start_ms, end_ms).await?;
        info!(
            year = month.year,
            month = month.month,
            providers = micros.len(),
            "Rebuilt monthly spend aggregate"
        );
        self.aggregate.replace(month, micros);
        Ok(())
    }

    /// Rebuild if the wall-clock month moved past the aggregate's month.
    async fn roll_over_if_needed(&self) -> Result<(), LedgerError> {
        let now = MonthKey::current();
        if self.aggregate.month() >= now {
            return Ok(());
        }
        let _guard = self.epoch.write().await;
        // Another task may have rebuilt while we waited.
        if self.aggregate.month() < now {
            self.rebuild(now).await?;
        }
        Ok(())
    }

    /// Append an entry and add its cost to the month-to-date aggregate.
    pub async fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        self.roll_over_if_needed().await?;

        let _guard = self.epoch.read().await;
        let id = self.store.insert(entry).await?;
        let counted = self
            .aggregate
            .add(&entry.provider, entry.cost_usd, entry.timestamp);
        debug!(
            id,
            provider = %entry.provider,
            cost_usd = entry.cost_usd,
            counted,
            "Recorded ledger entry"
        );
        Ok(())
    }

    /// Month-to-date spend per provider, or for one provider.
    pub async fn monthly_spending(
        &self,
        provider: Option<&str>,
    ) -> Result<HashMap<String, f64>, LedgerError> {
        self.roll_over_if_needed().await?;
        let all = self.aggregate.to_dollars();
        Ok(match provider {
            Some(name) => {
                let spent = all.get(name).copied().unwrap_or(0.0);
                HashMap::from([(name.to_string(), spent)])
            }
            None => all,
        })
    }

    /// Spend snapshot for routing. Falls back to the stale aggregate if a
    /// rollover rebuild fails.
    pub async fn snapshot(&self) -> SpendSnapshot {
        if let Err(e) = self.roll_over_if_needed().await {
            tracing::warn!(error = %e, "Monthly rollover failed, routing on stale spend");
        }
        SpendSnapshot::new(self.aggregate.to_dollars())
    }

    /// Spend over the closed UTC day range `[start, end]`.
    pub async fn total_spending(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        provider: Option<&str>,
    ) -> Result<f64, LedgerError> {
        if start > end {
            return Err(LedgerError::InvalidRange(format!("{start} is after {end}")));
        }
        let end_exclusive = end
            .succ_opt()
            .ok_or_else(|| LedgerError::InvalidRange(format!("{end} has no successor")))?;
        let start_ms = Utc.from_utc_datetime(&start.and_time(NaiveTime::MIN)).timestamp_millis();
        let end_ms = Utc
            .from_utc_datetime(&end_exclusive.and_time(NaiveTime::MIN))
            .timestamp_millis();
        self.store.total_cost(start_ms, end_ms, provider).await
    }

    /// Statistics over the last `days` days.
    pub async fn stats(&self, days: u32, provider: Option<&str>) -> Result<LedgerStats, LedgerError> {
        let since = Utc::now() - Duration::days(i64::from(days));
        self.store.stats(since.timestamp_millis(), provider).await
    }

    pub async fn recent_entries(&self, limit: u32) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store.recent(limit).await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
