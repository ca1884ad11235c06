//! User resonance tracking.
//!
//! Combines sentiment trend, explicit feedback, preference alignment, and
//! engagement into a single 0-1 resonance score that the evolution engine
//! consumes as its success signal.

use kait_core::now_ts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sentiment::{SentimentAnalyzer, SentimentResult};

// ---------------------------------------------------------------------------
// PreferenceTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPreference {
    pub value: String,
    pub confidence: f64,
    pub observation_count: u32,
    pub updated_at: f64,
}

/// Records and infers user preferences from interaction data.
///
/// Confidence rises with repeated agreement and is dampened when the
/// observed value flips, allowing preference drift.
#[derive(Debug, Clone, Default)]
pub struct PreferenceTracker {
    prefs: BTreeMap<String, TrackedPreference>,
}

impl PreferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or update a preference.
    ///
    /// Same value: reinforce (+0.05, capped at 1.0). Different value:
    /// replace with the new confidence dampened to 90%.
    pub fn record_preference(&mut self, key: &str, value: &str, confidence: f64) {
        let confidence = confidence.clamp(0.0, 1.0);
        match self.prefs.get_mut(key) {
            Some(existing) if existing.value == value => {
                existing.confidence = (existing.confidence.max(confidence) + 0.05).min(1.0);
                existing.observation_count += 1;
                existing.updated_at = now_ts();
            }
            _ => {
                let dampen = if self.prefs.contains_key(key) { 0.9 } else { 1.0 };
                self.prefs.insert(
                    key.to_string(),
                    TrackedPreference {
                        value: value.to_string(),
                        confidence: confidence * dampen,
                        observation_count: 1,
                        updated_at: now_ts(),
                    },
                );
            }
        }
    }

    pub fn get_preference(&self, key: &str) -> Option<&TrackedPreference> {
        self.prefs.get(key)
    }

    pub fn get_profile(&self) -> &BTreeMap<String, TrackedPreference> {
        &self.prefs
    }

    /// Infer response-length and topic-interest preferences from a batch
    /// of (user_input, ai_response, feedback) samples.
    pub fn infer_preferences(&mut self, samples: &[(String, String, Option<f64>)]) {
        if samples.is_empty() {
            return;
        }

        // Response length: where does positive feedback cluster?
        let positive_lengths: Vec<usize> = samples
            .iter()
            .filter(|(_, _, fb)| fb.map(|f| f > 0.3).unwrap_or(false))
            .map(|(_, resp, _)| resp.split_whitespace().count())
            .collect();
        if positive_lengths.len() >= 2 {
            let avg = positive_lengths.iter().sum::<usize>() as f64 / positive_lengths.len() as f64;
            if avg < 60.0 {
                self.record_preference("response_length", "short", 0.6);
            } else if avg > 120.0 {
                self.record_preference("response_length", "long", 0.6);
            }
        }

        // Formality from the user's own writing
        let avg_formality: f64 = samples
            .iter()
            .map(|(input, _, _)| estimate_formality(input))
            .sum::<f64>()
            / samples.len() as f64;
        if avg_formality < 0.35 {
            self.record_preference("formality", "casual", 0.6);
        } else if avg_formality > 0.65 {
            self.record_preference("formality", "formal", 0.6);
        }

        // Topic interests: recurring non-trivial words
        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        for (input, _, _) in samples {
            for word in input.to_lowercase().split_whitespace() {
                let cleaned: String = word.chars().filter(|c| c.is_ascii_alphabetic()).collect();
                if cleaned.len() > 4 && !crate::rules::is_stop_word(&cleaned) {
                    *counts.entry(cleaned).or_default() += 1;
                }
            }
        }
        let mut recurring: Vec<(String, u32)> =
            counts.into_iter().filter(|(_, c)| *c >= 2).collect();
        recurring.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        if !recurring.is_empty() {
            let topics: Vec<String> = recurring.into_iter().take(5).map(|(w, _)| w).collect();
            self.record_preference("topic_interests", &topics.join(","), 0.5);
        }
    }
}

/// Heuristic formality score of a text sample in [0, 1].
fn estimate_formality(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let casual_markers = ["lol", "gonna", "wanna", "yeah", "hey", "btw", "thx", "u ", "!!"];
    let formal_markers = ["therefore", "however", "regarding", "furthermore", "kindly", "please"];
    let casual = casual_markers.iter().filter(|m| lower.contains(*m)).count() as f64;
    let formal = formal_markers.iter().filter(|m| lower.contains(*m)).count() as f64;
    if casual + formal == 0.0 {
        return 0.5;
    }
    formal / (casual + formal)
}

// ---------------------------------------------------------------------------
// ResonanceEngine
// ---------------------------------------------------------------------------

/// Number of recent interactions in the sliding window.
const WINDOW_SIZE: usize = 50;

pub struct ResonanceEngine {
    analyzer: SentimentAnalyzer,
    preferences: PreferenceTracker,
    sentiment_scores: Vec<f64>,
    feedback_scores: Vec<f64>,
    response_lengths: Vec<usize>,
    interaction_count: usize,
    pending_samples: Vec<(String, String, Option<f64>)>,
}

#[derive(Debug, Clone)]
pub struct InteractionOutcome {
    pub sentiment: SentimentResult,
    pub mood: String,
    pub resonance: f64,
}

impl Default for ResonanceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ResonanceEngine {
    pub fn new() -> Self {
        Self {
            analyzer: SentimentAnalyzer::new(),
            preferences: PreferenceTracker::new(),
            sentiment_scores: Vec::new(),
            feedback_scores: Vec::new(),
            response_lengths: Vec::new(),
            interaction_count: 0,
            pending_samples: Vec::new(),
        }
    }

    pub fn preferences(&self) -> &PreferenceTracker {
        &self.preferences
    }

    pub fn preferences_mut(&mut self) -> &mut PreferenceTracker {
        &mut self.preferences
    }

    /// Analyse one interaction and fold it into the rolling window.
    pub fn process_interaction(
        &mut self,
        user_input: &str,
        ai_response: &str,
        feedback: Option<f64>,
    ) -> InteractionOutcome {
        let sentiment = self.analyzer.analyze(user_input);
        let mood = self.analyzer.mood_label(user_input);

        self.sentiment_scores.push(sentiment.score);
        if let Some(fb) = feedback {
            self.feedback_scores.push(fb.clamp(-1.0, 1.0));
        }
        self.response_lengths.push(ai_response.split_whitespace().count());
        self.interaction_count += 1;

        self.pending_samples.push((
            user_input.to_string(),
            ai_response.to_string(),
            feedback,
        ));
        // Infer preferences from each batch of five interactions
        if self.pending_samples.len() >= 5 {
            let batch = std::mem::take(&mut self.pending_samples);
            self.preferences.infer_preferences(&batch);
        }

        trim_to_window(&mut self.sentiment_scores);
        trim_to_window(&mut self.feedback_scores);
        trim_to_window(&mut self.response_lengths);

        InteractionOutcome {
            sentiment,
            mood,
            resonance: self.resonance_score(),
        }
    }

    /// Overall resonance in [0, 1].
    ///
    /// With feedback: 40% sentiment trend, 30% feedback trend, 20%
    /// preference alignment, 10% engagement. Without feedback the
    /// sentiment weight grows to 55%.
    pub fn resonance_score(&self) -> f64 {
        if self.interaction_count == 0 {
            return 0.5;
        }

        let recent = &self.sentiment_scores[self.sentiment_scores.len().saturating_sub(20)..];
        let avg_sentiment = recent.iter().sum::<f64>() / recent.len().max(1) as f64;
        let sentiment_component = (avg_sentiment + 1.0) / 2.0;

        let alignment = self.preference_alignment();
        let engagement = (self.interaction_count as f64 / 20.0).min(1.0);

        let score = if self.feedback_scores.is_empty() {
            0.55 * sentiment_component + 0.25 * alignment + 0.20 * engagement
        } else {
            let recent_fb =
                &self.feedback_scores[self.feedback_scores.len().saturating_sub(20)..];
            let avg_fb = recent_fb.iter().sum::<f64>() / recent_fb.len() as f64;
            let feedback_component = (avg_fb + 1.0) / 2.0;
            0.40 * sentiment_component
                + 0.30 * feedback_component
                + 0.20 * alignment
                + 0.10 * engagement
        };

        score.clamp(0.0, 1.0)
    }

    /// How well recent responses match inferred preferences, 0-1.
    fn preference_alignment(&self) -> f64 {
        let Some(length_pref) = self.preferences.get_preference("response_length") else {
            // Unknown preferences read as neutral
            return 0.5;
        };
        if self.response_lengths.is_empty() {
            return 0.5;
        }
        let tail = &self.response_lengths[self.response_lengths.len().saturating_sub(10)..];
        let avg_len = tail.iter().sum::<usize>() as f64 / tail.len() as f64;
        match length_pref.value.as_str() {
            "short" if avg_len <= 80.0 => 0.9,
            "short" => 0.3,
            "long" if avg_len >= 60.0 => 0.9,
            "long" => 0.3,
            _ => 0.5,
        }
    }

    /// Actionable suggestions for improving resonance.
    pub fn adaptation_suggestions(&self) -> Vec<String> {
        let mut suggestions = Vec::new();
        let profile = self.preferences.get_profile();

        if let Some(length) = profile.get("response_length") {
            if !self.response_lengths.is_empty() {
                let tail =
                    &self.response_lengths[self.response_lengths.len().saturating_sub(10)..];
                let avg_len = tail.iter().sum::<usize>() as f64 / tail.len() as f64;
                if length.value == "short" && avg_len > 80.0 {
                    suggestions
                        .push("User prefers shorter responses. Aim for <80 words.".to_string());
                } else if length.value == "long" && avg_len < 60.0 {
                    suggestions.push(
                        "User prefers detailed responses. Consider expanding explanations."
                            .to_string(),
                    );
                }
            }
        }

        if let Some(formality) = profile.get("formality") {
            match formality.value.as_str() {
                "casual" => suggestions.push(
                    "User communicates casually. Match their tone with relaxed language."
                        .to_string(),
                ),
                "formal" => suggestions.push(
                    "User prefers formal communication. Avoid slang and keep a professional tone."
                        .to_string(),
                ),
                _ => {}
            }
        }

        if self.sentiment_scores.len() >= 5 {
            let tail = &self.sentiment_scores[self.sentiment_scores.len() - 5..];
            let trend = tail.iter().sum::<f64>() / 5.0;
            if trend < -0.2 {
                suggestions.push(
                    "Recent sentiment is declining. Ask the user if they need help with something specific."
                        .to_string(),
                );
            }
        }

        if suggestions.is_empty() {
            suggestions.push("Resonance is healthy. Continue current interaction style.".to_string());
        }
        suggestions
    }
}

fn trim_to_window<T>(values: &mut Vec<T>) {
    if values.len() > WINDOW_SIZE {
        values.drain(..values.len() - WINDOW_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_reinforcement() {
        let mut pt = PreferenceTracker::new();
        pt.record_preference("response_length", "short", 0.6);
        pt.record_preference("response_length", "short", 0.6);
        let pref = pt.get_preference("response_length").unwrap();
        assert_eq!(pref.value, "short");
        assert!(pref.confidence > 0.6);
        assert_eq!(pref.observation_count, 2);
    }

    #[test]
    fn test_preference_conflict_dampens() {
        let mut pt = PreferenceTracker::new();
        pt.record_preference("formality", "casual", 0.8);
        pt.record_preference("formality", "formal", 0.8);
        let pref = pt.get_preference("formality").unwrap();
        assert_eq!(pref.value, "formal");
        assert!((pref.confidence - 0.72).abs() < 1e-9);
        assert_eq!(pref.observation_count, 1);
    }

    #[test]
    fn test_confidence_capped_at_one() {
        let mut pt = PreferenceTracker::new();
        for _ in 0..20 {
            pt.record_preference("tone", "warm", 0.9);
        }
        assert!(pt.get_preference("tone").unwrap().confidence <= 1.0);
    }

    #[test]
    fn test_infer_length_preference() {
        let mut pt = PreferenceTracker::new();
        let short_reply = "short answer here".to_string();
        let samples = vec![
            ("question one".to_string(), short_reply.clone(), Some(0.8)),
            ("question two".to_string(), short_reply.clone(), Some(0.9)),
            ("question three".to_string(), short_reply, Some(0.7)),
        ];
        pt.infer_preferences(&samples);
        assert_eq!(pt.get_preference("response_length").unwrap().value, "short");
    }

    #[test]
    fn test_resonance_neutral_baseline() {
        let engine = ResonanceEngine::new();
        assert!((engine.resonance_score() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_resonance_rises_with_positive_signal() {
        let mut engine = ResonanceEngine::new();
        let baseline = engine.resonance_score();
        for _ in 0..10 {
            engine.process_interaction(
                "this is great, thanks, really helpful!",
                "glad to help",
                Some(0.9),
            );
        }
        assert!(engine.resonance_score() > baseline);
        assert!(engine.resonance_score() <= 1.0);
    }

    #[test]
    fn test_resonance_falls_with_negative_signal() {
        let mut engine = ResonanceEngine::new();
        for _ in 0..10 {
            engine.process_interaction(
                "this is wrong and broken, terrible",
                "sorry about that",
                Some(-0.8),
            );
        }
        assert!(engine.resonance_score() < 0.5);
        assert!(engine.resonance_score() >= 0.0);
    }

    #[test]
    fn test_outcome_carries_mood() {
        let mut engine = ResonanceEngine::new();
        let outcome =
            engine.process_interaction("this is absolutely amazing, thanks!", "happy to help", None);
        assert_eq!(outcome.mood, "enthusiastic");
        assert_eq!(outcome.sentiment.label, "positive");
    }

    #[test]
    fn test_declining_sentiment_suggestion() {
        let mut engine = ResonanceEngine::new();
        for _ in 0..6 {
            engine.process_interaction("this is awful and broken", "hmm", None);
        }
        let suggestions = engine.adaptation_suggestions();
        assert!(suggestions.iter().any(|s| s.contains("sentiment is declining")));
    }
}
