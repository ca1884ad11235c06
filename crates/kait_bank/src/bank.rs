use kait_core::{generate_id, now_ts, KaitError};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;

use crate::models::*;

/// Parameters for [`ReasoningBank::save_interaction`].
#[derive(Debug, Clone, Default)]
pub struct NewInteraction {
    pub user_input: String,
    pub ai_response: String,
    pub mood: Option<String>,
    pub sentiment_score: f64,
    pub session_id: Option<String>,
    pub feedback_score: Option<f64>,
    /// Explicit id; auto-generated if None.
    pub interaction_id: Option<String>,
    /// Defaults to "gui" when empty.
    pub source: String,
    pub source_meta: Option<String>,
    /// Explicit timestamp; defaults to now. Used when importing history.
    pub timestamp: Option<f64>,
}

type BankResult<T> = Result<T, KaitError>;

fn db_err(e: sqlx::Error) -> KaitError {
    KaitError::storage(e)
}

/// SQLite-backed persistence for sidekick reasoning and evolution.
///
/// The single source of truth for learned state. Exactly one instance per
/// process owns the backing store; other components hold a cloned handle
/// (the pool is internally shared) and submit writes through these typed
/// operations only.
///
/// Every mutation is a single statement or an explicit transaction, so
/// readers never observe a partially-written record.
#[derive(Clone)]
pub struct ReasoningBank {
    pool: Pool<Sqlite>,
}

impl ReasoningBank {
    pub async fn new<P: AsRef<Path>>(db_path: P) -> BankResult<Self> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(&db_url)
            .await
            .map_err(db_err)?;

        let bank = Self { pool };
        bank.migrate().await?;
        Ok(bank)
    }

    async fn migrate(&self) -> BankResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS interactions (
                id TEXT PRIMARY KEY,
                user_input TEXT NOT NULL,
                ai_response TEXT NOT NULL,
                mood TEXT,
                sentiment_score REAL NOT NULL DEFAULT 0.0,
                timestamp REAL NOT NULL,
                session_id TEXT,
                feedback_score REAL,
                source TEXT NOT NULL DEFAULT 'gui',
                source_meta TEXT,
                archived INTEGER NOT NULL DEFAULT 0
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS contexts (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                value_json TEXT NOT NULL,
                domain TEXT,
                confidence REAL NOT NULL DEFAULT 0.5,
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS corrections (
                id TEXT PRIMARY KEY,
                original_response TEXT NOT NULL,
                correction TEXT NOT NULL,
                reason TEXT,
                domain TEXT,
                learned_at REAL NOT NULL,
                applied_count INTEGER NOT NULL DEFAULT 0
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS evolutions (
                id TEXT PRIMARY KEY,
                evolution_type TEXT NOT NULL,
                description TEXT NOT NULL,
                metrics_before_json TEXT,
                metrics_after_json TEXT,
                timestamp REAL NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                value TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.5,
                last_updated REAL NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS personality (
                id TEXT PRIMARY KEY,
                trait TEXT NOT NULL UNIQUE,
                value_float REAL NOT NULL DEFAULT 0.5,
                history_json TEXT NOT NULL DEFAULT '[]',
                updated_at REAL NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS behavior_rules (
                rule_id TEXT PRIMARY KEY,
                "trigger" TEXT NOT NULL,
                action TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.5,
                source TEXT NOT NULL DEFAULT '',
                created_at REAL NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS archives (
                archive_id TEXT PRIMARY KEY,
                batch_label TEXT NOT NULL,
                session_ids TEXT NOT NULL,
                interaction_ids TEXT NOT NULL,
                interaction_count INTEGER NOT NULL DEFAULT 0,
                time_range_start REAL NOT NULL,
                time_range_end REAL NOT NULL,
                memory_entries_json TEXT,
                learning_records_json TEXT,
                mind_sync_status TEXT NOT NULL DEFAULT 'pending',
                narrative_summary TEXT NOT NULL DEFAULT '',
                topics_json TEXT,
                mood_summary TEXT NOT NULL DEFAULT '',
                avg_sentiment REAL NOT NULL DEFAULT 0.0,
                created_at REAL NOT NULL,
                source_breakdown_json TEXT,
                status TEXT NOT NULL DEFAULT 'complete'
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_interactions_timestamp ON interactions(timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_interactions_session ON interactions(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_interactions_source ON interactions(source)",
            "CREATE INDEX IF NOT EXISTS idx_interactions_archived ON interactions(archived)",
            "CREATE INDEX IF NOT EXISTS idx_contexts_domain ON contexts(domain)",
            "CREATE INDEX IF NOT EXISTS idx_contexts_confidence ON contexts(confidence DESC)",
            "CREATE INDEX IF NOT EXISTS idx_corrections_domain ON corrections(domain)",
            "CREATE INDEX IF NOT EXISTS idx_corrections_learned ON corrections(learned_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_evolutions_type ON evolutions(evolution_type)",
            "CREATE INDEX IF NOT EXISTS idx_evolutions_timestamp ON evolutions(timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_archives_batch ON archives(batch_label)",
            "CREATE INDEX IF NOT EXISTS idx_archives_time ON archives(time_range_start DESC)",
        ];

        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    // ==================== Interaction operations ====================

    /// Save a user<->AI interaction. Returns the interaction id.
    pub async fn save_interaction(&self, new: NewInteraction) -> BankResult<String> {
        let id = new.interaction_id.unwrap_or_else(generate_id);
        let source = if new.source.is_empty() { "gui".to_string() } else { new.source };
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO interactions (
                id, user_input, ai_response, mood, sentiment_score,
                timestamp, session_id, feedback_score, source, source_meta, archived
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&id)
        .bind(&new.user_input)
        .bind(&new.ai_response)
        .bind(&new.mood)
        .bind(new.sentiment_score)
        .bind(new.timestamp.unwrap_or_else(now_ts))
        .bind(&new.session_id)
        .bind(new.feedback_score)
        .bind(&source)
        .bind(&new.source_meta)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(id)
    }

    pub async fn get_interaction(&self, id: &str) -> BankResult<Option<Interaction>> {
        let row = sqlx::query("SELECT * FROM interactions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| row_to_interaction(&r)))
    }

    /// Fetch recent interactions, newest first, with optional filters.
    ///
    /// `include_archived` = false hides interactions already folded into an
    /// archive, which is what interactive surfaces want.
    pub async fn get_interaction_history(
        &self,
        limit: i64,
        session_id: Option<&str>,
        source: Option<&str>,
        include_archived: bool,
    ) -> BankResult<Vec<Interaction>> {
        let mut clauses: Vec<&str> = Vec::new();
        if session_id.is_some() {
            clauses.push("session_id = ?");
        }
        if source.is_some() {
            clauses.push("source = ?");
        }
        if !include_archived {
            clauses.push("archived = 0");
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT * FROM interactions {where_clause} ORDER BY timestamp DESC LIMIT ?"
        );

        let mut q = sqlx::query(&sql);
        if let Some(sid) = session_id {
            q = q.bind(sid);
        }
        if let Some(src) = source {
            q = q.bind(src);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows.iter().map(row_to_interaction).collect())
    }

    pub async fn delete_interaction(&self, id: &str) -> BankResult<bool> {
        let res = sqlx::query("DELETE FROM interactions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn update_interaction_feedback(&self, id: &str, score: f64) -> BankResult<bool> {
        let res = sqlx::query("UPDATE interactions SET feedback_score = ? WHERE id = ?")
            .bind(score)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    /// Distinct sessions with summary info, most recently active first.
    pub async fn get_sessions(
        &self,
        source: Option<&str>,
        limit: i64,
        exclude_archived: bool,
    ) -> BankResult<Vec<SessionSummary>> {
        let mut clauses = vec!["session_id IS NOT NULL".to_string()];
        if source.is_some() {
            clauses.push("source = ?".to_string());
        }
        if exclude_archived {
            clauses.push("archived = 0".to_string());
        }
        let sql = format!(
            r#"
            SELECT
                session_id,
                source,
                MIN(timestamp) AS first_ts,
                MAX(timestamp) AS last_ts,
                COUNT(*) AS msg_count,
                MIN(user_input) AS first_message,
                source_meta
            FROM interactions
            WHERE {}
            GROUP BY session_id
            ORDER BY MAX(timestamp) DESC
            LIMIT ?
            "#,
            clauses.join(" AND ")
        );

        let mut q = sqlx::query(&sql);
        if let Some(src) = source {
            q = q.bind(src);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows.iter().map(row_to_session_summary).collect())
    }

    /// Interaction counts grouped by source.
    pub async fn get_source_stats(&self) -> BankResult<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT COALESCE(source, 'gui') AS src, COUNT(*) AS cnt \
             FROM interactions GROUP BY src",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("src"), r.get::<i64, _>("cnt")))
            .collect())
    }

    // ==================== Context operations ====================

    /// Save or overwrite a context entry (upsert keyed on `key`).
    pub async fn save_context(
        &self,
        key: &str,
        value: &serde_json::Value,
        domain: Option<&str>,
        confidence: f64,
    ) -> BankResult<String> {
        let id = generate_id();
        let now = now_ts();
        let value_json = value.to_string();
        sqlx::query(
            r#"
            INSERT INTO contexts (
                id, key, value_json, domain, confidence,
                created_at, updated_at, access_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(key) DO UPDATE SET
                value_json = excluded.value_json,
                domain = excluded.domain,
                confidence = excluded.confidence,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(key)
        .bind(&value_json)
        .bind(domain)
        .bind(confidence)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(id)
    }

    /// Context lookup by key.
    ///
    /// Bumps the access counter and reads the row in one transaction, so
    /// concurrent readers each observe a count that includes their own bump.
    pub async fn get_context(&self, key: &str) -> BankResult<Option<ContextEntry>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let res = sqlx::query("UPDATE contexts SET access_count = access_count + 1 WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if res.rows_affected() == 0 {
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        }
        let row = sqlx::query("SELECT * FROM contexts WHERE key = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(Some(row_to_context(&row)))
    }

    /// Update an existing context; creates it when missing.
    ///
    /// Returns true if an existing row was updated, false if created.
    pub async fn update_context(
        &self,
        key: &str,
        value: &serde_json::Value,
        domain: Option<&str>,
        confidence: Option<f64>,
    ) -> BankResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let existing = sqlx::query("SELECT domain, confidence FROM contexts WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        match existing {
            None => {
                drop(tx);
                self.save_context(key, value, domain, confidence.unwrap_or(0.5))
                    .await?;
                Ok(false)
            }
            Some(row) => {
                let new_domain = match domain {
                    Some(d) => Some(d.to_string()),
                    None => row.get::<Option<String>, _>("domain"),
                };
                let new_confidence = confidence.unwrap_or_else(|| row.get::<f64, _>("confidence"));
                sqlx::query(
                    "UPDATE contexts \
                     SET value_json = ?, domain = ?, confidence = ?, \
                         updated_at = ?, access_count = access_count + 1 \
                     WHERE key = ?",
                )
                .bind(value.to_string())
                .bind(&new_domain)
                .bind(new_confidence)
                .bind(now_ts())
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                tx.commit().await.map_err(db_err)?;
                Ok(true)
            }
        }
    }

    pub async fn get_contexts_by_domain(
        &self,
        domain: &str,
        limit: i64,
    ) -> BankResult<Vec<ContextEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM contexts WHERE domain = ? \
             ORDER BY confidence DESC, updated_at DESC LIMIT ?",
        )
        .bind(domain)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_context).collect())
    }

    /// Search contexts by key prefix, optionally filtered by domain.
    pub async fn search_contexts(
        &self,
        key_prefix: &str,
        domain: Option<&str>,
        limit: i64,
    ) -> BankResult<Vec<ContextEntry>> {
        let pattern = format!("{}%", key_prefix.replace('%', ""));
        let rows = if let Some(d) = domain {
            sqlx::query(
                "SELECT * FROM contexts WHERE key LIKE ? AND domain = ? \
                 ORDER BY updated_at DESC LIMIT ?",
            )
            .bind(&pattern)
            .bind(d)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                "SELECT * FROM contexts WHERE key LIKE ? ORDER BY updated_at DESC LIMIT ?",
            )
            .bind(&pattern)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_context).collect())
    }

    pub async fn delete_context(&self, key: &str) -> BankResult<bool> {
        let res = sqlx::query("DELETE FROM contexts WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    // ==================== Correction operations ====================

    /// Record a mistake and its fix for future learning.
    pub async fn record_correction(
        &self,
        original: &str,
        correction: &str,
        reason: Option<&str>,
        domain: Option<&str>,
    ) -> BankResult<String> {
        let id = generate_id();
        sqlx::query(
            r#"
            INSERT INTO corrections (
                id, original_response, correction, reason,
                domain, learned_at, applied_count
            ) VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&id)
        .bind(original)
        .bind(correction)
        .bind(reason)
        .bind(domain)
        .bind(now_ts())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(id)
    }

    pub async fn get_correction(&self, id: &str) -> BankResult<Option<Correction>> {
        let row = sqlx::query("SELECT * FROM corrections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| row_to_correction(&r)))
    }

    pub async fn get_recent_corrections(&self, limit: i64) -> BankResult<Vec<Correction>> {
        let rows = sqlx::query("SELECT * FROM corrections ORDER BY learned_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_correction).collect())
    }

    pub async fn get_corrections_by_domain(
        &self,
        domain: &str,
        limit: i64,
    ) -> BankResult<Vec<Correction>> {
        let rows = sqlx::query(
            "SELECT * FROM corrections WHERE domain = ? ORDER BY learned_at DESC LIMIT ?",
        )
        .bind(domain)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_correction).collect())
    }

    /// Record that a correction influenced a later prompt injection.
    pub async fn increment_correction_applied(&self, id: &str) -> BankResult<bool> {
        let res = sqlx::query(
            "UPDATE corrections SET applied_count = applied_count + 1 WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    // ==================== Evolution operations ====================

    /// Append a system evolution event.
    pub async fn save_evolution(
        &self,
        evolution_type: &str,
        description: &str,
        metrics_before: Option<&serde_json::Value>,
        metrics_after: Option<&serde_json::Value>,
    ) -> BankResult<String> {
        let id = generate_id();
        sqlx::query(
            r#"
            INSERT INTO evolutions (
                id, evolution_type, description,
                metrics_before_json, metrics_after_json, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(evolution_type)
        .bind(description)
        .bind(metrics_before.map(|v| v.to_string()))
        .bind(metrics_after.map(|v| v.to_string()))
        .bind(now_ts())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(id)
    }

    pub async fn get_evolution_timeline(&self, limit: i64) -> BankResult<Vec<EvolutionEvent>> {
        let rows = sqlx::query("SELECT * FROM evolutions ORDER BY timestamp DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_evolution).collect())
    }

    pub async fn get_evolutions_by_type(
        &self,
        evolution_type: &str,
        limit: i64,
    ) -> BankResult<Vec<EvolutionEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM evolutions WHERE evolution_type = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(evolution_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_evolution).collect())
    }

    // ==================== Preference operations ====================

    /// Save or update a user preference (upsert keyed on `key`).
    pub async fn save_preference(
        &self,
        key: &str,
        value: &str,
        confidence: f64,
    ) -> BankResult<String> {
        let id = generate_id();
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO preferences (id, key, value, confidence, last_updated)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                confidence = excluded.confidence,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&id)
        .bind(key)
        .bind(value)
        .bind(confidence)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(id)
    }

    pub async fn get_preference(&self, key: &str) -> BankResult<Option<Preference>> {
        let row = sqlx::query("SELECT * FROM preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| row_to_preference(&r)))
    }

    /// All preferences ordered by confidence descending.
    pub async fn get_all_preferences(&self) -> BankResult<Vec<Preference>> {
        let rows = sqlx::query("SELECT * FROM preferences ORDER BY confidence DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_preference).collect())
    }

    // ==================== Personality operations ====================

    pub async fn get_personality_trait(&self, trait_name: &str) -> BankResult<Option<PersonalityTrait>> {
        let row = sqlx::query("SELECT * FROM personality WHERE trait = ?")
            .bind(trait_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| row_to_trait(&r)))
    }

    pub async fn get_all_personality_traits(&self) -> BankResult<Vec<PersonalityTrait>> {
        let rows = sqlx::query("SELECT * FROM personality ORDER BY trait")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_trait).collect())
    }

    /// Evolve a personality trait, appending to its history and recording a
    /// `personality_shift` evolution event in the same transaction.
    ///
    /// New traits are initialised with a single-point history.
    pub async fn evolve_personality(&self, trait_name: &str, new_value: f64) -> BankResult<String> {
        let now = now_ts();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing = sqlx::query("SELECT id, value_float, history_json FROM personality WHERE trait = ?")
            .bind(trait_name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        let (trait_id, description, metrics_before) = match existing {
            Some(row) => {
                let id: String = row.get("id");
                let old_value: f64 = row.get("value_float");
                let history_json: String = row.get("history_json");
                let mut history: Vec<TraitSample> =
                    serde_json::from_str(&history_json).unwrap_or_default();
                history.push(TraitSample { value: new_value, timestamp: now });

                sqlx::query(
                    "UPDATE personality SET value_float = ?, history_json = ?, updated_at = ? \
                     WHERE trait = ?",
                )
                .bind(new_value)
                .bind(serde_json::to_string(&history).unwrap_or_else(|_| "[]".into()))
                .bind(now)
                .bind(trait_name)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                (
                    id,
                    format!("Trait '{trait_name}' shifted from {old_value:.3} to {new_value:.3}"),
                    Some(serde_json::json!({"trait": trait_name, "value": old_value})),
                )
            }
            None => {
                let id = generate_id();
                let history = vec![TraitSample { value: new_value, timestamp: now }];
                sqlx::query(
                    "INSERT INTO personality (id, trait, value_float, history_json, updated_at) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&id)
                .bind(trait_name)
                .bind(new_value)
                .bind(serde_json::to_string(&history).unwrap_or_else(|_| "[]".into()))
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                (
                    id,
                    format!("New trait '{trait_name}' initialized at {new_value:.3}"),
                    None,
                )
            }
        };

        let metrics_after = serde_json::json!({"trait": trait_name, "value": new_value});
        sqlx::query(
            "INSERT INTO evolutions (id, evolution_type, description, \
             metrics_before_json, metrics_after_json, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(generate_id())
        .bind("personality_shift")
        .bind(&description)
        .bind(metrics_before.map(|v| v.to_string()))
        .bind(metrics_after.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        tracing::debug!("{}", description);
        Ok(trait_id)
    }

    // ==================== Behavior rule operations ====================

    pub async fn save_behavior_rule(&self, rule: &BehaviorRuleRow) -> BankResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO behavior_rules
                (rule_id, "trigger", action, confidence, source, created_at, active)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.rule_id)
        .bind(&rule.trigger)
        .bind(&rule.action)
        .bind(rule.confidence)
        .bind(&rule.source)
        .bind(rule.created_at)
        .bind(if rule.active { 1 } else { 0 })
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// All active rules ordered by confidence descending.
    pub async fn get_active_behavior_rules(&self) -> BankResult<Vec<BehaviorRuleRow>> {
        let rows = sqlx::query(
            "SELECT * FROM behavior_rules WHERE active = 1 ORDER BY confidence DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_rule).collect())
    }

    /// Rules are deactivated when superseded, never deleted.
    pub async fn deactivate_behavior_rule(&self, rule_id: &str) -> BankResult<bool> {
        let res = sqlx::query("UPDATE behavior_rules SET active = 0 WHERE rule_id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    // ==================== Archive operations ====================

    /// Sessions where every interaction is older than `age_seconds` and
    /// none has been archived yet.
    pub async fn get_archivable_sessions(&self, age_seconds: i64) -> BankResult<Vec<SessionSummary>> {
        let cutoff = now_ts() - age_seconds as f64;
        let rows = sqlx::query(
            r#"
            SELECT
                session_id,
                source,
                MIN(timestamp) AS first_ts,
                MAX(timestamp) AS last_ts,
                COUNT(*) AS msg_count,
                MIN(user_input) AS first_message,
                source_meta
            FROM interactions
            WHERE session_id IS NOT NULL
            GROUP BY session_id
            HAVING MAX(timestamp) < ? AND MAX(archived) = 0
            ORDER BY MAX(timestamp) DESC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_session_summary).collect())
    }

    /// Flip the archived flag on a set of interactions. Returns the number
    /// of rows actually changed.
    pub async fn mark_interactions_archived(&self, ids: &[String]) -> BankResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE interactions SET archived = 1 WHERE id IN ({placeholders}) AND archived = 0"
        );
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id);
        }
        let res = q.execute(&self.pool).await.map_err(db_err)?;
        Ok(res.rows_affected())
    }

    pub async fn save_archive(&self, record: &ArchiveRecord) -> BankResult<String> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO archives (
                archive_id, batch_label, session_ids, interaction_ids,
                interaction_count, time_range_start, time_range_end,
                memory_entries_json, learning_records_json,
                mind_sync_status, narrative_summary, topics_json,
                mood_summary, avg_sentiment, created_at,
                source_breakdown_json, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.archive_id)
        .bind(&record.batch_label)
        .bind(serde_json::to_string(&record.session_ids).unwrap_or_default())
        .bind(serde_json::to_string(&record.interaction_ids).unwrap_or_default())
        .bind(record.interaction_count)
        .bind(record.time_range_start)
        .bind(record.time_range_end)
        .bind(serde_json::to_string(&record.memory_entries).unwrap_or_default())
        .bind(serde_json::to_string(&record.learning_records).unwrap_or_default())
        .bind(&record.mind_sync_status)
        .bind(&record.narrative_summary)
        .bind(serde_json::to_string(&record.topics).unwrap_or_default())
        .bind(&record.mood_summary)
        .bind(record.avg_sentiment)
        .bind(record.created_at)
        .bind(serde_json::to_string(&record.source_breakdown).unwrap_or_default())
        .bind(&record.status)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        tracing::debug!(
            "Archive {} saved ({} interactions, batch {})",
            record.archive_id,
            record.interaction_count,
            record.batch_label
        );
        Ok(record.archive_id.clone())
    }

    pub async fn get_archives(&self, limit: i64) -> BankResult<Vec<ArchiveRecord>> {
        let rows = sqlx::query("SELECT * FROM archives ORDER BY time_range_start DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_archive).collect())
    }

    pub async fn get_archive(&self, archive_id: &str) -> BankResult<Option<ArchiveRecord>> {
        let row = sqlx::query("SELECT * FROM archives WHERE archive_id = ?")
            .bind(archive_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| row_to_archive(&r)))
    }

    /// Fetch the full interactions belonging to an archive, oldest first.
    pub async fn get_archive_interactions(&self, archive_id: &str) -> BankResult<Vec<Interaction>> {
        let Some(archive) = self.get_archive(archive_id).await? else {
            return Ok(Vec::new());
        };
        if archive.interaction_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = archive
            .interaction_ids
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT * FROM interactions WHERE id IN ({placeholders}) ORDER BY timestamp ASC"
        );
        let mut q = sqlx::query(&sql);
        for id in &archive.interaction_ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows.iter().map(row_to_interaction).collect())
    }

    // ==================== Statistics ====================

    pub async fn get_stats(&self) -> BankResult<BankStats> {
        let count = |sql: &'static str| {
            let pool = self.pool.clone();
            async move {
                sqlx::query(sql)
                    .fetch_one(&pool)
                    .await
                    .map(|r| r.get::<i64, _>(0))
                    .map_err(db_err)
            }
        };

        let interactions = count("SELECT COUNT(*) FROM interactions").await?;
        let contexts = count("SELECT COUNT(*) FROM contexts").await?;
        let corrections = count("SELECT COUNT(*) FROM corrections").await?;
        let evolutions = count("SELECT COUNT(*) FROM evolutions").await?;
        let preferences = count("SELECT COUNT(*) FROM preferences").await?;
        let personality_traits = count("SELECT COUNT(*) FROM personality").await?;
        let behavior_rules = count("SELECT COUNT(*) FROM behavior_rules").await?;
        let high_confidence_contexts =
            count("SELECT COUNT(*) FROM contexts WHERE confidence >= 0.7").await?;
        let distinct_sessions = count(
            "SELECT COUNT(DISTINCT session_id) FROM interactions WHERE session_id IS NOT NULL",
        )
        .await?;

        let avg_sentiment: f64 = sqlx::query("SELECT AVG(sentiment_score) FROM interactions")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .get::<Option<f64>, _>(0)
            .unwrap_or(0.0);

        let avg_feedback: f64 = sqlx::query(
            "SELECT AVG(feedback_score) FROM interactions WHERE feedback_score IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .get::<Option<f64>, _>(0)
        .unwrap_or(0.0);

        let total_corrections_applied: i64 =
            sqlx::query("SELECT SUM(applied_count) FROM corrections")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?
                .get::<Option<i64>, _>(0)
                .unwrap_or(0);

        let hot_rows = sqlx::query(
            "SELECT key, access_count FROM contexts ORDER BY access_count DESC LIMIT 5",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let hot_contexts = hot_rows
            .iter()
            .map(|r| HotContext {
                key: r.get("key"),
                access_count: r.get("access_count"),
            })
            .collect();

        Ok(BankStats {
            interactions,
            contexts,
            corrections,
            evolutions,
            preferences,
            personality_traits,
            behavior_rules,
            avg_sentiment: (avg_sentiment * 10_000.0).round() / 10_000.0,
            avg_feedback: (avg_feedback * 10_000.0).round() / 10_000.0,
            total_corrections_applied,
            high_confidence_contexts,
            hot_contexts,
            distinct_sessions,
        })
    }
}

// ============================================================================
// Row mapping helpers
// ============================================================================

fn row_to_interaction(row: &SqliteRow) -> Interaction {
    Interaction {
        id: row.get("id"),
        user_input: row.get("user_input"),
        ai_response: row.get("ai_response"),
        mood: row.get("mood"),
        sentiment_score: row.get("sentiment_score"),
        timestamp: row.get("timestamp"),
        session_id: row.get("session_id"),
        feedback_score: row.get("feedback_score"),
        source: row.get("source"),
        source_meta: row.get("source_meta"),
        archived: row.get::<i64, _>("archived") != 0,
    }
}

fn row_to_session_summary(row: &SqliteRow) -> SessionSummary {
    SessionSummary {
        session_id: row.get("session_id"),
        source: row.get("source"),
        first_ts: row.get("first_ts"),
        last_ts: row.get("last_ts"),
        msg_count: row.get("msg_count"),
        first_message: row.get("first_message"),
        source_meta: row.get("source_meta"),
    }
}

fn row_to_context(row: &SqliteRow) -> ContextEntry {
    let value_json: String = row.get("value_json");
    ContextEntry {
        id: row.get("id"),
        key: row.get("key"),
        value: serde_json::from_str(&value_json).unwrap_or(serde_json::Value::Null),
        domain: row.get("domain"),
        confidence: row.get("confidence"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        access_count: row.get("access_count"),
    }
}

fn row_to_correction(row: &SqliteRow) -> Correction {
    Correction {
        id: row.get("id"),
        original_response: row.get("original_response"),
        correction: row.get("correction"),
        reason: row.get("reason"),
        domain: row.get("domain"),
        learned_at: row.get("learned_at"),
        applied_count: row.get("applied_count"),
    }
}

fn row_to_evolution(row: &SqliteRow) -> EvolutionEvent {
    let before: Option<String> = row.get("metrics_before_json");
    let after: Option<String> = row.get("metrics_after_json");
    EvolutionEvent {
        id: row.get("id"),
        evolution_type: row.get("evolution_type"),
        description: row.get("description"),
        metrics_before: before.and_then(|s| serde_json::from_str(&s).ok()),
        metrics_after: after.and_then(|s| serde_json::from_str(&s).ok()),
        timestamp: row.get("timestamp"),
    }
}

fn row_to_preference(row: &SqliteRow) -> Preference {
    Preference {
        id: row.get("id"),
        key: row.get("key"),
        value: row.get("value"),
        confidence: row.get("confidence"),
        last_updated: row.get("last_updated"),
    }
}

fn row_to_trait(row: &SqliteRow) -> PersonalityTrait {
    let history_json: String = row.get("history_json");
    PersonalityTrait {
        id: row.get("id"),
        trait_name: row.get("trait"),
        value: row.get("value_float"),
        history: serde_json::from_str(&history_json).unwrap_or_default(),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_rule(row: &SqliteRow) -> BehaviorRuleRow {
    BehaviorRuleRow {
        rule_id: row.get("rule_id"),
        trigger: row.get("trigger"),
        action: row.get("action"),
        confidence: row.get("confidence"),
        source: row.get("source"),
        created_at: row.get("created_at"),
        active: row.get::<i64, _>("active") != 0,
    }
}

fn row_to_archive(row: &SqliteRow) -> ArchiveRecord {
    let json_vec = |col: &str| -> Vec<String> {
        row.get::<Option<String>, _>(col)
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    };
    let memory_entries: Vec<MemoryEntry> = row
        .get::<Option<String>, _>("memory_entries_json")
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let learning_records: Vec<LearningRecord> = row
        .get::<Option<String>, _>("learning_records_json")
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let source_breakdown = row
        .get::<Option<String>, _>("source_breakdown_json")
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    ArchiveRecord {
        archive_id: row.get("archive_id"),
        batch_label: row.get("batch_label"),
        session_ids: json_vec("session_ids"),
        interaction_ids: json_vec("interaction_ids"),
        interaction_count: row.get("interaction_count"),
        time_range_start: row.get("time_range_start"),
        time_range_end: row.get("time_range_end"),
        memory_entries,
        learning_records,
        mind_sync_status: row.get("mind_sync_status"),
        narrative_summary: row.get("narrative_summary"),
        topics: json_vec("topics_json"),
        mood_summary: row.get("mood_summary"),
        avg_sentiment: row.get("avg_sentiment"),
        created_at: row.get("created_at"),
        source_breakdown,
        status: row.get("status"),
    }
}
