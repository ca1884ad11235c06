use serde::{Deserialize, Serialize};

/// One user<->AI exchange, the raw conversation record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interaction {
    pub id: String,
    pub user_input: String,
    pub ai_response: String,
    pub mood: Option<String>,
    /// Detected sentiment in [-1.0, 1.0].
    pub sentiment_score: f64,
    pub timestamp: f64,
    pub session_id: Option<String>,
    /// User feedback in [0.0, 1.0], when given.
    pub feedback_score: Option<f64>,
    /// Origin: "gui", "matrix", "cli", "api".
    pub source: String,
    pub source_meta: Option<String>,
    pub archived: bool,
}

/// Per-session rollup used by session pickers and the archive worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub source: String,
    pub first_ts: f64,
    pub last_ts: f64,
    pub msg_count: i64,
    pub first_message: String,
    pub source_meta: Option<String>,
}

/// An evolving knowledge context, upserted by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: String,
    pub key: String,
    /// Arbitrary JSON-serialisable value.
    pub value: serde_json::Value,
    pub domain: Option<String>,
    pub confidence: f64,
    pub created_at: f64,
    pub updated_at: f64,
    pub access_count: i64,
}

/// A recorded mistake and its fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub id: String,
    pub original_response: String,
    pub correction: String,
    pub reason: Option<String>,
    pub domain: Option<String>,
    pub learned_at: f64,
    pub applied_count: i64,
}

/// Append-only audit record of a system evolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionEvent {
    pub id: String,
    pub evolution_type: String,
    pub description: String,
    pub metrics_before: Option<serde_json::Value>,
    pub metrics_after: Option<serde_json::Value>,
    pub timestamp: f64,
}

/// A user preference signal, upserted by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub id: String,
    pub key: String,
    pub value: String,
    pub confidence: f64,
    pub last_updated: f64,
}

/// One point in a personality trait's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraitSample {
    pub value: f64,
    pub timestamp: f64,
}

/// A personality trait with its full change history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalityTrait {
    pub id: String,
    pub trait_name: String,
    pub value: f64,
    pub history: Vec<TraitSample>,
    pub updated_at: f64,
}

/// A learned behavior rule as persisted by the bank.
///
/// The reflection crate owns the richer in-memory form; this row is the
/// durable representation injected into the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorRuleRow {
    pub rule_id: String,
    pub trigger: String,
    pub action: String,
    pub confidence: f64,
    pub source: String,
    pub created_at: f64,
    pub active: bool,
}

/// A high-signal memory extracted during archival.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub text: String,
    pub category: String,
}

/// A learning insight extracted during archival.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningRecord {
    pub record_type: String,
    pub insight: String,
}

/// A summarized batch of stale sessions. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub archive_id: String,
    /// Calendar date label, e.g. "2026-07-30".
    pub batch_label: String,
    pub session_ids: Vec<String>,
    pub interaction_ids: Vec<String>,
    pub interaction_count: i64,
    pub time_range_start: f64,
    pub time_range_end: f64,
    pub memory_entries: Vec<MemoryEntry>,
    pub learning_records: Vec<LearningRecord>,
    pub mind_sync_status: String,
    pub narrative_summary: String,
    pub topics: Vec<String>,
    pub mood_summary: String,
    pub avg_sentiment: f64,
    pub created_at: f64,
    pub source_breakdown: std::collections::BTreeMap<String, i64>,
    /// "complete" when the narrative came from an LLM, "partial" otherwise.
    pub status: String,
}

/// A context key with its read count, for the hot-contexts stat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotContext {
    pub key: String,
    pub access_count: i64,
}

/// Aggregate database statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankStats {
    pub interactions: i64,
    pub contexts: i64,
    pub corrections: i64,
    pub evolutions: i64,
    pub preferences: i64,
    pub personality_traits: i64,
    pub behavior_rules: i64,
    pub avg_sentiment: f64,
    pub avg_feedback: f64,
    pub total_corrections_applied: i64,
    pub high_confidence_contexts: i64,
    pub hot_contexts: Vec<HotContext>,
    pub distinct_sessions: i64,
}
