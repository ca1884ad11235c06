//! Periodic self-reflection over recent interaction history.
//!
//! A cycle analyses three streams (interactions, corrections, evolution
//! history) and produces insights, behaviour adjustments, prompt
//! refinement suggestions, and newly detected behavior rules. The cycle
//! itself is a pure function of its inputs; the pipeline persists its
//! output.

use kait_bank::{Correction, EvolutionEvent, Interaction};
use kait_core::{generate_id, now_ts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::rules::{is_stop_word, BehaviorRule, PatternDetector};

/// Minimum interactions for a meaningful reflection.
const MIN_INTERACTIONS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorAdjustment {
    pub adjustment_type: String,
    pub description: String,
    pub priority: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionResult {
    pub reflection_id: String,
    pub timestamp: f64,
    pub insights: Vec<String>,
    pub behavior_adjustments: Vec<BehaviorAdjustment>,
    pub prompt_refinements: Vec<String>,
    pub new_rules: Vec<BehaviorRule>,
    pub confidence_score: f64,
    pub interactions_analyzed: usize,
    pub corrections_analyzed: usize,
}

pub struct ReflectionCycle {
    detector: PatternDetector,
}

impl Default for ReflectionCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ReflectionCycle {
    pub fn new() -> Self {
        Self {
            detector: PatternDetector::new(),
        }
    }

    /// Run a full reflection cycle.
    pub fn reflect(
        &self,
        interactions: &[Interaction],
        corrections: &[Correction],
        evolution_history: &[EvolutionEvent],
        existing_rules: &[BehaviorRule],
    ) -> ReflectionResult {
        let insights = self.extract_insights(interactions, corrections);
        let adjustments = self.propose_adjustments(interactions, corrections, evolution_history);
        let refinements = self.suggest_prompt_refinements(interactions, corrections);
        let new_rules = self
            .detector
            .detect_rules(interactions, corrections, existing_rules);
        let confidence = self.compute_confidence(interactions, &insights);

        ReflectionResult {
            reflection_id: generate_id(),
            timestamp: now_ts(),
            insights,
            behavior_adjustments: adjustments,
            prompt_refinements: refinements,
            new_rules,
            confidence_score: (confidence * 10_000.0).round() / 10_000.0,
            interactions_analyzed: interactions.len(),
            corrections_analyzed: corrections.len(),
        }
    }

    // ------------------------------------------------------------------
    // Insight extraction
    // ------------------------------------------------------------------

    fn extract_insights(
        &self,
        interactions: &[Interaction],
        corrections: &[Correction],
    ) -> Vec<String> {
        let mut insights = Vec::new();
        if interactions.is_empty() {
            return vec!["Insufficient interaction data for reflection.".to_string()];
        }

        // 1. Sentiment trend over the window
        let sentiments: Vec<f64> = interactions
            .iter()
            .take(20)
            .map(|ix| ix.sentiment_score)
            .collect();
        if !sentiments.is_empty() {
            let avg = sentiments.iter().sum::<f64>() / sentiments.len() as f64;
            if avg > 0.3 {
                insights.push(
                    "Overall user sentiment is positive. Current approach is working well."
                        .to_string(),
                );
            } else if avg < -0.2 {
                insights.push(
                    "User sentiment is trending negative. Review recent responses for tone or accuracy issues."
                        .to_string(),
                );
            } else {
                insights.push("User sentiment is neutral/mixed.".to_string());
            }
        }

        // 2. Correction categories
        if !corrections.is_empty() {
            let mut categories: BTreeMap<String, usize> = BTreeMap::new();
            for c in corrections {
                let cat = c.domain.clone().unwrap_or_else(|| "unknown".to_string());
                *categories.entry(cat).or_default() += 1;
            }
            let mut top: Vec<(String, usize)> = categories.into_iter().collect();
            top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            let cats = top
                .iter()
                .take(3)
                .map(|(cat, cnt)| format!("{cat} ({cnt})"))
                .collect::<Vec<_>>()
                .join(", ");
            insights.push(format!(
                "Most common correction categories: {cats}. Focus improvement efforts here."
            ));
        }

        // 3. Response length vs feedback
        let rated: Vec<(&Interaction, f64)> = interactions
            .iter()
            .filter_map(|ix| ix.feedback_score.map(|fb| (ix, fb)))
            .collect();
        if !rated.is_empty() {
            let avg_len = interactions
                .iter()
                .map(|ix| ix.ai_response.split_whitespace().count())
                .sum::<usize>() as f64
                / interactions.len() as f64;
            let short_fb: Vec<f64> = rated
                .iter()
                .filter(|(ix, _)| (ix.ai_response.split_whitespace().count() as f64) < avg_len * 0.5)
                .map(|(_, fb)| *fb)
                .collect();
            let long_fb: Vec<f64> = rated
                .iter()
                .filter(|(ix, _)| (ix.ai_response.split_whitespace().count() as f64) > avg_len * 1.5)
                .map(|(_, fb)| *fb)
                .collect();
            if short_fb.len() >= 2 && short_fb.iter().sum::<f64>() / short_fb.len() as f64 > 0.3 {
                insights.push("Shorter responses tend to receive better feedback.".to_string());
            }
            if long_fb.len() >= 2 && long_fb.iter().sum::<f64>() / long_fb.len() as f64 > 0.3 {
                insights.push("Longer, more detailed responses are appreciated.".to_string());
            }
        }

        // 4. Topic clustering (keyword frequency minus stop words)
        let mut topic_counts: BTreeMap<String, usize> = BTreeMap::new();
        for ix in interactions {
            for word in ix.user_input.to_lowercase().split_whitespace() {
                let cleaned: String = word.chars().filter(|c| c.is_ascii_alphabetic()).collect();
                if cleaned.len() >= 4 && !is_stop_word(&cleaned) {
                    *topic_counts.entry(cleaned).or_default() += 1;
                }
            }
        }
        let mut top_topics: Vec<(String, usize)> = topic_counts.into_iter().collect();
        top_topics.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        if !top_topics.is_empty() {
            let topics = top_topics
                .iter()
                .take(5)
                .map(|(w, _)| w.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            insights.push(format!("Recurring user topics: {topics}."));
        }

        insights
    }

    // ------------------------------------------------------------------
    // Behaviour adjustments
    // ------------------------------------------------------------------

    fn propose_adjustments(
        &self,
        interactions: &[Interaction],
        corrections: &[Correction],
        evolution_history: &[EvolutionEvent],
    ) -> Vec<BehaviorAdjustment> {
        let mut adjustments = Vec::new();
        let past_types: std::collections::HashSet<&str> = evolution_history
            .iter()
            .map(|e| e.evolution_type.as_str())
            .collect();

        // Correction-driven
        let mut cat_counts: BTreeMap<String, usize> = BTreeMap::new();
        for c in corrections {
            let cat = c.domain.clone().unwrap_or_else(|| "unknown".to_string());
            *cat_counts.entry(cat).or_default() += 1;
        }
        let mut sorted: Vec<(String, usize)> = cat_counts.into_iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        for (cat, count) in sorted.into_iter().take(3) {
            let adj_type = format!("reduce_{cat}_errors");
            if !past_types.contains(adj_type.as_str()) || count > 3 {
                adjustments.push(BehaviorAdjustment {
                    description: format!(
                        "Reduce {cat} errors (seen {count} time(s) in recent window). \
                         Add explicit verification step for {cat}-related outputs."
                    ),
                    priority: (0.3 + count as f64 * 0.15).min(1.0),
                    adjustment_type: adj_type,
                });
            }
        }

        // Feedback-driven
        let feedbacks: Vec<f64> = interactions.iter().filter_map(|ix| ix.feedback_score).collect();
        if !feedbacks.is_empty() {
            let avg = feedbacks.iter().sum::<f64>() / feedbacks.len() as f64;
            if avg < -0.1 {
                adjustments.push(BehaviorAdjustment {
                    adjustment_type: "improve_response_quality".to_string(),
                    description: "Average feedback is negative. Consider being more concise, \
                                  asking clarifying questions, or verifying assumptions before responding."
                        .to_string(),
                    priority: 0.8,
                });
            }
            let negative_streak = feedbacks.iter().rev().take_while(|fb| **fb < 0.0).count();
            if negative_streak >= 3 {
                adjustments.push(BehaviorAdjustment {
                    adjustment_type: "break_negative_streak".to_string(),
                    description: format!(
                        "Last {negative_streak} interactions received negative feedback. \
                         Significant style shift may be needed."
                    ),
                    priority: 0.95,
                });
            }
        }

        // Staleness: no evolution in over an hour
        if let Some(last_ts) = evolution_history.iter().map(|e| e.timestamp).fold(None, |acc: Option<f64>, t| {
            Some(acc.map_or(t, |a| a.max(t)))
        }) {
            if now_ts() - last_ts > 3600.0 {
                adjustments.push(BehaviorAdjustment {
                    adjustment_type: "freshness_check".to_string(),
                    description: "No evolution applied recently. Consider a proactive style \
                                  refresh based on recent interactions."
                        .to_string(),
                    priority: 0.3,
                });
            }
        }

        adjustments
    }

    // ------------------------------------------------------------------
    // Prompt refinement suggestions
    // ------------------------------------------------------------------

    fn suggest_prompt_refinements(
        &self,
        interactions: &[Interaction],
        corrections: &[Correction],
    ) -> Vec<String> {
        let mut refinements = Vec::new();

        let mut cats: BTreeMap<String, usize> = BTreeMap::new();
        for c in corrections {
            let cat = c.domain.clone().unwrap_or_else(|| "unknown".to_string());
            *cats.entry(cat).or_default() += 1;
        }
        let mut sorted: Vec<(String, usize)> = cats.into_iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        for (cat, cnt) in sorted.into_iter().take(2) {
            refinements.push(format!(
                "Add explicit instruction to double-check {cat} (corrected {cnt} time(s) recently)."
            ));
        }

        let rated: Vec<(f64, usize)> = interactions
            .iter()
            .filter_map(|ix| {
                ix.feedback_score
                    .map(|fb| (fb, ix.ai_response.split_whitespace().count()))
            })
            .collect();
        if rated.len() >= 3 {
            let short_good = rated.iter().filter(|(fb, len)| *fb > 0.3 && *len < 50).count();
            let long_good = rated.iter().filter(|(fb, len)| *fb > 0.3 && *len > 100).count();
            if short_good > long_good && short_good >= 2 {
                refinements
                    .push("Add instruction: 'Keep responses concise and to the point.'".to_string());
            } else if long_good > short_good && long_good >= 2 {
                refinements
                    .push("Add instruction: 'Provide thorough, detailed responses.'".to_string());
            }
        }

        refinements
    }

    // ------------------------------------------------------------------
    // Confidence
    // ------------------------------------------------------------------

    /// More data and clearer signal mean higher confidence.
    fn compute_confidence(&self, interactions: &[Interaction], insights: &[String]) -> f64 {
        let n = interactions.len();
        let volume_score = if n < MIN_INTERACTIONS {
            0.2
        } else if n < 10 {
            0.5
        } else if n < 30 {
            0.7
        } else {
            0.9
        };

        let feedbacks: Vec<f64> = interactions.iter().filter_map(|ix| ix.feedback_score).collect();
        let clarity_score = if feedbacks.len() >= 3 {
            let mean = feedbacks.iter().sum::<f64>() / feedbacks.len() as f64;
            let variance =
                feedbacks.iter().map(|f| (f - mean).powi(2)).sum::<f64>() / feedbacks.len() as f64;
            (1.0 - variance).max(0.3)
        } else {
            0.4
        };

        let insight_score = (insights.len() as f64 * 0.2).min(1.0);

        0.4 * volume_score + 0.35 * clarity_score + 0.25 * insight_score
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Decides when the next reflection cycle should run: after N interactions
/// or M seconds since the last cycle, whichever comes first.
#[derive(Debug, Clone)]
pub struct ReflectionScheduler {
    interaction_threshold: u32,
    interval_seconds: f64,
}

impl ReflectionScheduler {
    pub fn new(interaction_threshold: u32, interval_seconds: f64) -> Self {
        Self {
            interaction_threshold: interaction_threshold.max(1),
            interval_seconds: interval_seconds.max(60.0),
        }
    }

    pub fn should_reflect(&self, last_reflection_ts: f64, interactions_since: u32) -> bool {
        if interactions_since >= self.interaction_threshold {
            return true;
        }
        let now = now_ts();
        if last_reflection_ts <= 0.0 {
            // Never reflected: trigger after half the interval
            return now > self.interval_seconds / 2.0;
        }
        now - last_reflection_ts >= self.interval_seconds
    }
}
