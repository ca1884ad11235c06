//! Archive worker: summarise and retire stale chat sessions.
//!
//! Pipeline per cycle:
//! 1. Find sessions whose every interaction is older than the threshold
//! 2. Group them into batches by UTC calendar date
//! 3. Extract memory entries and learning records programmatically
//! 4. Generate a narrative summary via the gateway, template fallback
//! 5. Save the archive record and mark interactions as archived
//!
//! Interactions are never deleted; archival only flips their flag.

use chrono::{TimeZone, Utc};
use kait_bank::{
    ArchiveRecord, Interaction, LearningRecord, MemoryEntry, ReasoningBank, SessionSummary,
};
use kait_core::{generate_id, now_ts, KaitError};
use kait_llm::{ChatMessage, CompletionParams, LlmGateway};
use serde::Serialize;
use std::collections::BTreeMap;

const PREFERENCE_KEYWORDS: &[&str] = &[
    "prefer", "always", "never", "like", "hate", "want", "please", "don't", "stop", "use",
    "favorite",
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveOutcome {
    pub batches_created: u32,
    pub interactions_archived: u64,
    pub errors: Vec<String>,
}

struct NarrativeResult {
    narrative: String,
    topics: Vec<String>,
    mood_label: String,
    llm_used: bool,
}

pub struct ArchiveWorker<'a> {
    bank: &'a ReasoningBank,
    gateway: Option<&'a LlmGateway>,
    archive_age_seconds: i64,
}

impl<'a> ArchiveWorker<'a> {
    pub fn new(
        bank: &'a ReasoningBank,
        gateway: Option<&'a LlmGateway>,
        archive_age_seconds: i64,
    ) -> Self {
        Self {
            bank,
            gateway,
            archive_age_seconds,
        }
    }

    /// Find stale sessions, group by calendar date, archive each batch.
    pub async fn run_archive_cycle(&self) -> ArchiveOutcome {
        let mut outcome = ArchiveOutcome::default();

        let sessions = match self.bank.get_archivable_sessions(self.archive_age_seconds).await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!("Failed to query archivable sessions: {}", e);
                outcome.errors.push(e.to_string());
                return outcome;
            }
        };
        if sessions.is_empty() {
            return outcome;
        }

        // Bucket sessions by UTC day of their last activity
        let mut date_buckets: BTreeMap<String, Vec<SessionSummary>> = BTreeMap::new();
        for session in sessions {
            let day = Utc
                .timestamp_opt(session.last_ts as i64, 0)
                .single()
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            date_buckets.entry(day).or_default().push(session);
        }

        for (batch_date, batch_sessions) in date_buckets {
            match self.archive_batch(&batch_date, &batch_sessions).await {
                Ok(count) => {
                    outcome.batches_created += 1;
                    outcome.interactions_archived += count;
                }
                Err(e) => {
                    tracing::error!("Archive batch {} failed: {}", batch_date, e);
                    outcome.errors.push(format!("{batch_date}: {e}"));
                }
            }
        }

        outcome
    }

    /// Process one date's sessions into an archive record.
    /// Returns the number of interactions archived.
    async fn archive_batch(
        &self,
        batch_date: &str,
        sessions: &[SessionSummary],
    ) -> Result<u64, KaitError> {
        let mut all_interactions: Vec<Interaction> = Vec::new();
        let mut session_ids: Vec<String> = Vec::new();
        for session in sessions {
            session_ids.push(session.session_id.clone());
            let history = self
                .bank
                .get_interaction_history(500, Some(&session.session_id), None, false)
                .await?;
            all_interactions.extend(history);
        }
        if all_interactions.is_empty() {
            return Ok(0);
        }

        let interaction_ids: Vec<String> =
            all_interactions.iter().map(|i| i.id.clone()).collect();

        let avg_sentiment = all_interactions.iter().map(|i| i.sentiment_score).sum::<f64>()
            / all_interactions.len() as f64;
        let time_start = all_interactions
            .iter()
            .map(|i| i.timestamp)
            .fold(f64::INFINITY, f64::min);
        let time_end = all_interactions
            .iter()
            .map(|i| i.timestamp)
            .fold(f64::NEG_INFINITY, f64::max);

        let mut source_breakdown: BTreeMap<String, i64> = BTreeMap::new();
        for i in &all_interactions {
            *source_breakdown.entry(i.source.clone()).or_default() += 1;
        }

        let mut mood_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for i in &all_interactions {
            if let Some(m) = &i.mood {
                *mood_counts.entry(m).or_default() += 1;
            }
        }
        let dominant_mood = mood_counts
            .into_iter()
            .max_by_key(|(_, c)| *c)
            .map(|(m, _)| m.to_string())
            .unwrap_or_else(|| "neutral".to_string());

        let memory_entries = extract_memory_entries(&all_interactions);
        let learning_records = extract_learning_records(&all_interactions);
        let narrative = self
            .generate_narrative(&all_interactions, &session_ids, batch_date, avg_sentiment)
            .await;

        let record = ArchiveRecord {
            archive_id: generate_id(),
            batch_label: batch_date.to_string(),
            session_ids,
            interaction_ids: interaction_ids.clone(),
            interaction_count: interaction_ids.len() as i64,
            time_range_start: time_start,
            time_range_end: time_end,
            memory_entries,
            learning_records,
            mind_sync_status: "pending".to_string(),
            narrative_summary: narrative.narrative,
            topics: narrative.topics,
            mood_summary: if narrative.mood_label.is_empty() {
                dominant_mood
            } else {
                narrative.mood_label
            },
            avg_sentiment: (avg_sentiment * 10_000.0).round() / 10_000.0,
            created_at: now_ts(),
            source_breakdown,
            status: if narrative.llm_used { "complete" } else { "partial" }.to_string(),
        };

        self.bank.save_archive(&record).await?;
        let archived = self.bank.mark_interactions_archived(&interaction_ids).await?;
        Ok(archived)
    }

    /// Narrative via the gateway with a deterministic template fallback.
    async fn generate_narrative(
        &self,
        interactions: &[Interaction],
        session_ids: &[String],
        batch_date: &str,
        avg_sentiment: f64,
    ) -> NarrativeResult {
        let topic_list = top_topics(interactions, 10);
        let sentiment_label = if avg_sentiment > 0.2 {
            "positive"
        } else if avg_sentiment < -0.2 {
            "negative"
        } else {
            "neutral"
        };

        if let Some(gateway) = self.gateway {
            let digest = format!(
                "Date: {batch_date}\nSessions: {}, Messages: {}\nTopics: {}\nSentiment arc: avg={avg_sentiment:.2} ({sentiment_label})",
                session_ids.len(),
                interactions.len(),
                topic_list.join(", "),
            );
            let system = "You are summarizing a day's archived chat sessions for Kait, an AI sidekick. \
                          Return ONLY valid JSON with keys: narrative (1-3 sentence summary), \
                          topics (list of 3-7 topic strings), mood_label (one word). \
                          Be concise. Focus on what the user was working on and the overall tone.";
            let params = CompletionParams {
                max_tokens: 300,
                temperature: 0.3,
            };
            let messages = vec![ChatMessage::user(digest)];
            if let Some(response) = gateway.chat(&messages, Some(system), &params, None).await {
                if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&response) {
                    let narrative = parsed["narrative"].as_str().unwrap_or("").to_string();
                    if !narrative.is_empty() {
                        let topics = parsed["topics"]
                            .as_array()
                            .map(|arr| {
                                arr.iter()
                                    .filter_map(|t| t.as_str().map(str::to_string))
                                    .collect::<Vec<_>>()
                            })
                            .filter(|t| !t.is_empty())
                            .unwrap_or_else(|| topic_list.iter().take(7).cloned().collect());
                        return NarrativeResult {
                            narrative,
                            topics,
                            mood_label: parsed["mood_label"]
                                .as_str()
                                .unwrap_or(sentiment_label)
                                .to_string(),
                            llm_used: true,
                        };
                    }
                }
                tracing::debug!("Archive narrative response was not usable JSON, using template");
            }
        }

        // Template fallback
        let topics_str = if topic_list.is_empty() {
            "general conversation".to_string()
        } else {
            topic_list.iter().take(5).cloned().collect::<Vec<_>>().join(", ")
        };
        let plural = if session_ids.len() == 1 { "" } else { "s" };
        NarrativeResult {
            narrative: format!(
                "On {batch_date}, {} messages across {} session{plural} covered {topics_str}. Sentiment: {sentiment_label}.",
                interactions.len(),
                session_ids.len(),
            ),
            topics: topic_list.into_iter().take(7).collect(),
            mood_label: sentiment_label.to_string(),
            llm_used: false,
        }
    }
}

/// High-signal interactions become memory entries: strong sentiment or an
/// explicit preference statement.
fn extract_memory_entries(interactions: &[Interaction]) -> Vec<MemoryEntry> {
    let mut entries = Vec::new();
    for interaction in interactions {
        let text_lower = interaction.user_input.to_lowercase();
        let has_preference = PREFERENCE_KEYWORDS.iter().any(|kw| text_lower.contains(kw));
        let strong_sentiment = interaction.sentiment_score.abs() > 0.5;

        if strong_sentiment || has_preference {
            let mut text = interaction.user_input.clone();
            text.truncate(300);
            entries.push(MemoryEntry {
                text,
                category: if has_preference {
                    "user_understanding".to_string()
                } else {
                    "reasoning".to_string()
                },
            });
        }
    }
    entries
}

/// Topic repetition and struggle streaks become learning records.
fn extract_learning_records(interactions: &[Interaction]) -> Vec<LearningRecord> {
    let mut records = Vec::new();

    let repeated = top_topics_with_counts(interactions)
        .into_iter()
        .filter(|(_, c)| *c >= 3)
        .map(|(w, _)| w)
        .take(5)
        .collect::<Vec<_>>();
    if !repeated.is_empty() {
        records.push(LearningRecord {
            record_type: "user_preference".to_string(),
            insight: format!("Frequent topics: {}", repeated.join(", ")),
        });
    }

    // Struggle streaks: 3+ consecutive low-sentiment interactions
    let mut streak = 0usize;
    let mut streak_topic = String::new();
    for interaction in interactions {
        if interaction.sentiment_score < -0.3 {
            if streak == 0 {
                streak_topic = interaction.user_input.chars().take(60).collect();
            }
            streak += 1;
        } else {
            if streak >= 3 {
                records.push(LearningRecord {
                    record_type: "struggle_area".to_string(),
                    insight: format!("Struggle streak ({streak} msgs): {streak_topic}"),
                });
            }
            streak = 0;
            streak_topic.clear();
        }
    }
    if streak >= 3 {
        records.push(LearningRecord {
            record_type: "struggle_area".to_string(),
            insight: format!("Struggle streak ({streak} msgs): {streak_topic}"),
        });
    }

    records
}

fn top_topics_with_counts(interactions: &[Interaction]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for interaction in interactions {
        let mut seen = std::collections::HashSet::new();
        for word in interaction.user_input.to_lowercase().split_whitespace() {
            let cleaned: String = word.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
            if cleaned.len() > 3 && seen.insert(cleaned.clone()) {
                *counts.entry(cleaned).or_default() += 1;
            }
        }
    }
    let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    sorted
}

fn top_topics(interactions: &[Interaction], limit: usize) -> Vec<String> {
    top_topics_with_counts(interactions)
        .into_iter()
        .take(limit)
        .map(|(w, _)| w)
        .collect()
}
