//! Persistent LLM cost ledger.
//!
//! Aggregates spend from the observer into a small SQLite database so cost
//! breakdowns survive restarts (the observer's ring is memory-only).

use anyhow::{Context, Result};
use kait_core::now_ts;
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::sync::Arc;

use crate::observability::LlmObserver;

#[derive(Debug, Clone, Serialize)]
pub struct CostSummary {
    pub period: String,
    pub total_cost_usd: f64,
    pub call_count: i64,
    pub avg_cost_usd: f64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub by_provider: Vec<CostBucket>,
    pub by_model: Vec<CostBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostBucket {
    pub name: String,
    pub calls: i64,
    pub cost_usd: f64,
}

pub struct CostTracker {
    pool: Pool<Sqlite>,
    /// Timestamp of the newest observer record already synced.
    synced_until: std::sync::Mutex<f64>,
}

impl CostTracker {
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&db_url)
            .await
            .context("Failed to open cost ledger")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS llm_costs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0.0,
                latency_ms REAL NOT NULL DEFAULT 0.0,
                success INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_costs_timestamp ON llm_costs (timestamp)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_costs_provider ON llm_costs (provider)")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            synced_until: std::sync::Mutex::new(0.0),
        })
    }

    /// Record a single cost entry.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_cost(
        &self,
        timestamp: f64,
        provider: &str,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
        cost_usd: f64,
        latency_ms: f64,
        success: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO llm_costs \
             (timestamp, provider, model, input_tokens, output_tokens, cost_usd, latency_ms, success) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(timestamp)
        .bind(provider)
        .bind(model)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(cost_usd)
        .bind(latency_ms)
        .bind(if success { 1 } else { 0 })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pull observer records newer than the last sync into the ledger.
    /// Returns the number of records written.
    pub async fn sync_from_observer(&self, observer: &Arc<LlmObserver>) -> Result<usize> {
        let since = *self.synced_until.lock().unwrap();
        let recent = observer.get_recent(1000);
        let mut synced = 0usize;
        let mut newest = since;

        for rec in recent.iter().filter(|r| r.timestamp > since) {
            self.record_cost(
                rec.timestamp,
                &rec.provider,
                &rec.model,
                rec.input_tokens as i64,
                rec.output_tokens as i64,
                rec.estimated_cost_usd,
                rec.latency_ms,
                rec.success,
            )
            .await?;
            synced += 1;
            if rec.timestamp > newest {
                newest = rec.timestamp;
            }
        }

        *self.synced_until.lock().unwrap() = newest;
        Ok(synced)
    }

    /// Cost summary for "1h", "24h", "7d", or "30d".
    pub async fn get_cost_summary(&self, period: &str) -> Result<CostSummary> {
        let window = match period {
            "1h" => 3_600.0,
            "24h" => 86_400.0,
            "7d" => 604_800.0,
            "30d" => 2_592_000.0,
            _ => 3_600.0,
        };
        let cutoff = now_ts() - window;

        let row = sqlx::query(
            "SELECT COUNT(*) AS count, SUM(cost_usd) AS total, AVG(cost_usd) AS avg, \
                    SUM(input_tokens) AS inp, SUM(output_tokens) AS outp \
             FROM llm_costs WHERE timestamp > ?",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        let by_provider = self
            .bucket_query(
                "SELECT provider AS name, COUNT(*) AS calls, SUM(cost_usd) AS total \
                 FROM llm_costs WHERE timestamp > ? GROUP BY provider ORDER BY total DESC",
                cutoff,
            )
            .await?;
        let by_model = self
            .bucket_query(
                "SELECT model AS name, COUNT(*) AS calls, SUM(cost_usd) AS total \
                 FROM llm_costs WHERE timestamp > ? GROUP BY model ORDER BY total DESC LIMIT 10",
                cutoff,
            )
            .await?;

        Ok(CostSummary {
            period: period.to_string(),
            total_cost_usd: row.get::<Option<f64>, _>("total").unwrap_or(0.0),
            call_count: row.get::<i64, _>("count"),
            avg_cost_usd: row.get::<Option<f64>, _>("avg").unwrap_or(0.0),
            total_input_tokens: row.get::<Option<i64>, _>("inp").unwrap_or(0),
            total_output_tokens: row.get::<Option<i64>, _>("outp").unwrap_or(0),
            by_provider,
            by_model,
        })
    }

    async fn bucket_query(&self, sql: &str, cutoff: f64) -> Result<Vec<CostBucket>> {
        let rows = sqlx::query(sql).bind(cutoff).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|r| CostBucket {
                name: r.get("name"),
                calls: r.get("calls"),
                cost_usd: r.get::<Option<f64>, _>("total").unwrap_or(0.0),
            })
            .collect())
    }

    /// Remove entries older than `max_age_days`. Returns rows deleted.
    pub async fn cleanup_old_records(&self, max_age_days: i64) -> Result<u64> {
        let cutoff = now_ts() - (max_age_days as f64) * 86_400.0;
        let res = sqlx::query("DELETE FROM llm_costs WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
