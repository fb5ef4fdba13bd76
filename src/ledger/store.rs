//! SQLite-backed append-only entry log.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

use super::{Breakdown, LedgerEntry, LedgerStats};
use crate::error::LedgerError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms          INTEGER NOT NULL,
    provider       TEXT    NOT NULL,
    model          TEXT    NOT NULL,
    task_type      TEXT    NOT NULL,
    task_id        TEXT    NOT NULL,
    tokens_input   INTEGER NOT NULL,
    tokens_output  INTEGER NOT NULL,
    tokens_total   INTEGER NOT NULL,
    cost_usd       REAL    NOT NULL,
    latency_ms     INTEGER NOT NULL,
    routing_reason TEXT    NOT NULL,
    fallback_used  INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_ledger_ts ON ledger_entries(ts_ms);
CREATE INDEX IF NOT EXISTS idx_ledger_provider_ts ON ledger_entries(provider, ts_ms);
"#;

/// Entry log on a SQLite pool.
#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    /// Open (creating if needed) a file-backed log in WAL mode.
    pub async fn open(path: &str) -> Result<Self, LedgerError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(|e| LedgerError::Open(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| LedgerError::Open(e.to_string()))?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(path = path, "Cost ledger opened");
        Ok(Self { pool })
    }

    /// A private in-memory log. A single pinned connection keeps the
    /// database alive for the lifetime of the pool.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| LedgerError::Open(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| LedgerError::Open(e.to_string()))?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Append one entry, returning its row id.
    pub async fn insert(&self, entry: &LedgerEntry) -> Result<i64, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                ts_ms, provider, model, task_type, task_id,
                tokens_input, tokens_output, tokens_total,
                cost_usd, latency_ms, routing_reason, fallback_used
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(entry.timestamp.timestamp_millis())
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(&entry.task_type)
        .bind(&entry.task_id)
        .bind(entry.tokens_input as i64)
        .bind(entry.tokens_output as i64)
        .bind(entry.tokens_total as i64)
        .bind(entry.cost_usd)
        .bind(entry.latency_ms as i64)
        .bind(&entry.routing_reason)
        .bind(entry.fallback_used)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Per-provider spend in micro-dollars for `[start_ms, end_ms)`.
    ///
    /// Each row is rounded to whole micro-dollars before summing, matching the
    /// incremental aggregate.
    pub async fn micros_by_provider(
        &self,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<HashMap<String, u64>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT provider,
                   COALESCE(SUM(CAST(ROUND(cost_usd * 1000000.0) AS INTEGER)), 0) AS micros
            FROM ledger_entries
            WHERE ts_ms >= ?1 AND ts_ms < ?2
            GROUP BY provider
            "#,
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let provider: String = row.try_get("provider")?;
            let micros: i64 = row.try_get("micros")?;
            out.insert(provider, micros.max(0) as u64);
        }
        Ok(out)
    }

    /// Total spend in USD for `[start_ms, end_ms)`, optionally for one provider.
    pub async fn total_cost(
        &self,
        start_ms: i64,
        end_ms: i64,
        provider: Option<&str>,
    ) -> Result<f64, LedgerError> {
        let total: f64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(cost_usd), 0.0)
            FROM ledger_entries
            WHERE ts_ms >= ?1 AND ts_ms < ?2
              AND (?3 IS NULL OR provider = ?3)
            "#,
        )
        .bind(start_ms)
        .bind(end_ms)
        .bind(provider)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    /// Usage statistics for entries at or after `since_ms`.
    pub async fn stats(
        &self,
        since_ms: i64,
        provider: Option<&str>,
    ) -> Result<LedgerStats, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)                          AS requests,
                   COALESCE(SUM(tokens_total), 0)    AS tokens,
                   COALESCE(SUM(cost_usd), 0.0)      AS cost,
                   COALESCE(AVG(latency_ms), 0.0)    AS avg_latency,
                   COALESCE(SUM(fallback_used), 0)   AS fallbacks
            FROM ledger_entries
            WHERE ts_ms >= ?1 AND (?2 IS NULL OR provider = ?2)
            "#,
        )
        .bind(since_ms)
        .bind(provider)
        .fetch_one(&self.pool)
        .await?;

        let total_requests = row.try_get::<i64, _>("requests")?.max(0) as u64;
        let total_cost_usd: f64 = row.try_get("cost")?;

        Ok(LedgerStats {
            total_requests,
            total_tokens: row.try_get::<i64, _>("tokens")?.max(0) as u64,
            total_cost_usd,
            avg_cost_per_request: if total_requests > 0 {
                total_cost_usd / total_requests as f64
            } else {
                0.0
            },
            avg_latency_ms: row.try_get("avg_latency")?,
            fallback_count: row.try_get::<i64, _>("fallbacks")?.max(0) as u64,
            provider_breakdown: self.breakdown("provider", since_ms, provider).await?,
            task_breakdown: self.breakdown("task_type", since_ms, provider).await?,
        })
    }

    async fn breakdown(
        &self,
        column: &'static str,
        since_ms: i64,
        provider: Option<&str>,
    ) -> Result<HashMap<String, Breakdown>, LedgerError> {
        // `column` is one of two fixed identifiers, never caller input.
        let sql = format!(
            r#"
            SELECT {column}                       AS label,
                   COUNT(*)                       AS requests,
                   COALESCE(SUM(tokens_total), 0) AS tokens,
                   COALESCE(SUM(cost_usd), 0.0)   AS cost
            FROM ledger_entries
            WHERE ts_ms >= ?1 AND (?2 IS NULL OR provider = ?2)
            GROUP BY {column}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(since_ms)
            .bind(provider)
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(
                row.try_get::<String, _>("label")?,
                Breakdown {
                    requests: row.try_get::<i64, _>("requests")?.max(0) as u64,
                    tokens: row.try_get::<i64, _>("tokens")?.max(0) as u64,
                    cost_usd: row.try_get("cost")?,
                },
            );
        }
        Ok(out)
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ledger_entries
            ORDER BY ts_ms DESC, id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn count(&self) -> Result<u64, LedgerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, LedgerError> {
    let ts_ms: i64 = row.try_get("ts_ms")?;
    let timestamp: DateTime<Utc> = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_default();

    Ok(LedgerEntry {
        id: Some(row.try_get("id")?),
        timestamp,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        task_type: row.try_get("task_type")?,
        task_id: row.try_get("task_id")?,
        tokens_input: row.try_get::<i64, _>("tokens_input")?.max(0) as u32,
        tokens_output: row.try_get::<i64, _>("tokens_output")?.max(0) as u32,
        tokens_total: row.try_get::<i64, _>("tokens_total")?.max(0) as u32,
        cost_usd: row.try_get("cost_usd")?,
        latency_ms: row.try_get::<i64, _>("latency_ms")?.max(0) as u64,
        routing_reason: row.try_get("routing_reason")?,
        fallback_used: row.try_get("fallback_used")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(provider: &str, cost: f64, ts_ms: i64) -> LedgerEntry {
        LedgerEntry {
            id: None,
            timestamp: Utc.timestamp_millis_opt(ts_ms).unwrap(),
            provider: provider.to_string(),
            model: "m".to_string(),
            task_type: "generation".to_string(),
            task_id: "t".to_string(),
            tokens_input: 10,
            tokens_output: 5,
            tokens_total: 15,
            cost_usd: cost,
            latency_ms: 100,
            routing_reason: "default_local".to_string(),
            fallback_used: false,
        }
    }

    #[tokio::test]
    async fn test_insert_and_recent() {
        let store = LedgerStore::in_memory().await.unwrap();
        store.insert(&entry("ollama", 0.0, 1_000)).await.unwrap();
        let id = store.insert(&entry("anthropic", 0.5, 2_000)).await.unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, Some(id));
        assert_eq!(recent[0].provider, "anthropic");
        assert_eq!(recent[0].timestamp.timestamp_millis(), 2_000);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_window_sums() {
        let store = LedgerStore::in_memory().await.unwrap();
        store.insert(&entry("anthropic", 1.0, 1_000)).await.unwrap();
        store.insert(&entry("anthropic", 2.0, 2_000)).await.unwrap();
        store.insert(&entry("openrouter", 0.25, 2_500)).await.unwrap();
        store.insert(&entry("anthropic", 4.0, 3_000)).await.unwrap();

        let micros = store.micros_by_provider(1_000, 3_000).await.unwrap();
        assert_eq!(micros["anthropic"], 3_000_000);
        assert_eq!(micros["openrouter"], 250_000);

        let total = store.total_cost(0, 10_000, Some("anthropic")).await.unwrap();
        assert!((total - 7.0).abs() < 1e-9);
        let total = store.total_cost(0, 10_000, None).await.unwrap();
        assert!((total - 7.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stats_on_empty_log() {
        let store = LedgerStore::in_memory().await.unwrap();
        let stats = store.stats(0, None).await.unwrap();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.avg_cost_per_request, 0.0);
        assert!(stats.provider_breakdown.is_empty());
    }

    #[tokio::test]
    async fn test_stats_breakdowns() {
        let store = LedgerStore::in_memory().await.unwrap();
        let mut fallback = entry("ollama", 0.0, 5_000);
        fallback.fallback_used = true;
        fallback.task_type = "research".to_string();
        store.insert(&fallback).await.unwrap();
        store.insert(&entry("anthropic", 1.0, 5_000)).await.unwrap();

        let stats = store.stats(0, None).await.unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_tokens, 30);
        assert_eq!(stats.fallback_count, 1);
        assert_eq!(stats.provider_breakdown["anthropic"].requests, 1);
        assert_eq!(stats.task_breakdown["research"].requests, 1);

        let stats = store.stats(0, Some("anthropic")).await.unwrap();
        assert_eq!(stats.total_requests, 1);
        assert!((stats.avg_cost_per_request - 1.0).abs() < 1e-9);
    }
}
