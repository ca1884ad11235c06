//! Actionable behavior rules derived from pattern analysis.
//!
//! Instead of producing generic insights ("user sentiment is neutral"),
//! the detector produces rules like "when the user asks about code,
//! include a code example" that are injected directly into the system
//! prompt so behaviour actually changes.

use kait_bank::{BehaviorRuleRow, Correction, Interaction};
use kait_core::{generate_id, now_ts};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A concrete, actionable rule: when `trigger`, do `action`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BehaviorRule {
    pub rule_id: String,
    pub trigger: String,
    pub action: String,
    pub confidence: f64,
    /// Evidence that created this rule, e.g. "topic_pattern:code:n=4".
    pub source: String,
    pub created_at: f64,
    pub active: bool,
}

impl BehaviorRule {
    fn new(trigger: String, action: String, confidence: f64, source: String) -> Self {
        Self {
            rule_id: generate_id(),
            trigger,
            action,
            confidence,
            source,
            created_at: now_ts(),
            active: true,
        }
    }

    /// Prompt-ready instruction line.
    pub fn to_prompt_instruction(&self) -> String {
        format!("When {}, {}", self.trigger, self.action)
    }

    pub fn to_row(&self) -> BehaviorRuleRow {
        BehaviorRuleRow {
            rule_id: self.rule_id.clone(),
            trigger: self.trigger.clone(),
            action: self.action.clone(),
            confidence: self.confidence,
            source: self.source.clone(),
            created_at: self.created_at,
            active: self.active,
        }
    }

    pub fn from_row(row: &BehaviorRuleRow) -> Self {
        Self {
            rule_id: row.rule_id.clone(),
            trigger: row.trigger.clone(),
            action: row.action.clone(),
            confidence: row.confidence,
            source: row.source.clone(),
            created_at: row.created_at,
            active: row.active,
        }
    }
}

/// Topic keyword families for topic-feedback correlation.
const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    ("code", &["code", "program", "function", "debug", "error", "bug", "script", "class", "api"]),
    ("math", &["calculate", "compute", "equation", "formula", "math", "number", "solve"]),
    ("creative", &["write", "story", "poem", "creative", "imagine", "design", "art"]),
    ("learning", &["learn", "explain", "teach", "understand", "how does", "what is"]),
    ("personal", &["feel", "think", "opinion", "advice", "recommend", "suggest"]),
];

const FOLLOWUP_SIGNALS: &[&str] = &[
    "can you also",
    "what about",
    "and how",
    "but what if",
    "one more thing",
    "follow up",
    "additionally",
    "also",
    "related to that",
    "building on that",
];

/// Detects actionable patterns in interaction history and emits rules.
#[derive(Debug, Default)]
pub struct PatternDetector;

impl PatternDetector {
    pub fn new() -> Self {
        Self
    }

    /// Analyse interactions and corrections, producing rules whose
    /// triggers don't already exist among the active rules.
    pub fn detect_rules(
        &self,
        interactions: &[Interaction],
        corrections: &[Correction],
        existing_rules: &[BehaviorRule],
    ) -> Vec<BehaviorRule> {
        let existing: HashSet<&str> = existing_rules
            .iter()
            .filter(|r| r.active)
            .map(|r| r.trigger.as_str())
            .collect();

        let mut rules = Vec::new();
        rules.extend(self.detect_topic_patterns(interactions, &existing));
        rules.extend(self.detect_correction_patterns(corrections, &existing));
        rules.extend(self.detect_length_preference(interactions, &existing));
        rules.extend(self.detect_followup_patterns(interactions, &existing));
        rules.extend(self.detect_time_patterns(interactions, &existing));
        rules
    }

    /// Repeated feedback on a topic: positive -> lean in; negative ->
    /// clarify first.
    fn detect_topic_patterns(
        &self,
        interactions: &[Interaction],
        existing: &HashSet<&str>,
    ) -> Vec<BehaviorRule> {
        let mut topic_feedback: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for ix in interactions {
            let Some(feedback) = ix.feedback_score else {
                continue;
            };
            let input = ix.user_input.to_lowercase();
            for (topic, keywords) in TOPIC_KEYWORDS {
                if keywords.iter().any(|kw| input.contains(kw)) {
                    topic_feedback.entry(topic).or_default().push(feedback);
                }
            }
        }

        let mut rules = Vec::new();
        for (topic, feedbacks) in topic_feedback {
            if feedbacks.len() < 2 {
                continue;
            }
            let avg = feedbacks.iter().sum::<f64>() / feedbacks.len() as f64;
            let trigger = format!("the user asks about {topic}");
            if existing.contains(trigger.as_str()) {
                continue;
            }
            let confidence = (0.4 + feedbacks.len() as f64 * 0.1).min(0.9);
            let source = format!("topic_pattern:{topic}:n={}:avg_fb={avg:.2}", feedbacks.len());
            if avg > 0.3 {
                rules.push(BehaviorRule::new(
                    trigger,
                    format!(
                        "provide detailed, example-rich responses about {topic} \
                         since the user consistently engages well with this topic"
                    ),
                    confidence,
                    source,
                ));
            } else if avg < -0.2 {
                rules.push(BehaviorRule::new(
                    trigger,
                    format!(
                        "be extra careful and ask clarifying questions about {topic} \
                         before diving deep, since past responses haven't landed well"
                    ),
                    confidence,
                    source,
                ));
            }
        }
        rules
    }

    /// Two or more corrections in a category become a preventive rule.
    fn detect_correction_patterns(
        &self,
        corrections: &[Correction],
        existing: &HashSet<&str>,
    ) -> Vec<BehaviorRule> {
        let mut category_counts: BTreeMap<String, usize> = BTreeMap::new();
        for c in corrections {
            let category = c.domain.clone().unwrap_or_else(|| "general".to_string());
            *category_counts.entry(category).or_default() += 1;
        }

        let mut rules = Vec::new();
        for (category, count) in category_counts {
            if count < 2 {
                continue;
            }
            let trigger = format!("generating a response about {category}");
            if existing.contains(trigger.as_str()) {
                continue;
            }
            rules.push(BehaviorRule::new(
                trigger,
                format!(
                    "double-check {category}-related claims before stating them, \
                     since {count} corrections have been needed in this area"
                ),
                (0.5 + count as f64 * 0.1).min(0.95),
                format!("correction_pattern:{category}:count={count}"),
            ));
        }
        rules
    }

    /// Where does positive feedback cluster on response length?
    fn detect_length_preference(
        &self,
        interactions: &[Interaction],
        existing: &HashSet<&str>,
    ) -> Vec<BehaviorRule> {
        let trigger = "composing any response";
        if existing.contains(trigger) {
            return Vec::new();
        }

        let mut positive_lengths = Vec::new();
        let mut negative_lengths = Vec::new();
        for ix in interactions {
            let Some(feedback) = ix.feedback_score else {
                continue;
            };
            let len = ix.ai_response.split_whitespace().count();
            if feedback > 0.3 {
                positive_lengths.push(len);
            } else if feedback < -0.2 {
                negative_lengths.push(len);
            }
        }
        if positive_lengths.len() < 3 {
            return Vec::new();
        }

        let avg_good =
            positive_lengths.iter().sum::<usize>() as f64 / positive_lengths.len() as f64;
        let avg_bad = if negative_lengths.is_empty() {
            avg_good
        } else {
            negative_lengths.iter().sum::<usize>() as f64 / negative_lengths.len() as f64
        };

        if avg_good < 60.0 && (negative_lengths.is_empty() || avg_bad > avg_good * 1.5) {
            vec![BehaviorRule::new(
                trigger.to_string(),
                "keep responses concise and focused (under 80 words when possible), \
                 since the user consistently prefers shorter answers"
                    .to_string(),
                0.7,
                format!("length_pref:avg_good={avg_good:.0}:avg_bad={avg_bad:.0}"),
            )]
        } else if avg_good > 120.0 {
            vec![BehaviorRule::new(
                trigger.to_string(),
                "provide thorough, detailed responses with examples, \
                 since the user appreciates depth and detail"
                    .to_string(),
                0.7,
                format!("length_pref:avg_good={avg_good:.0}"),
            )]
        } else {
            Vec::new()
        }
    }

    /// Frequent follow-ups suggest the initial response should anticipate
    /// them.
    fn detect_followup_patterns(
        &self,
        interactions: &[Interaction],
        existing: &HashSet<&str>,
    ) -> Vec<BehaviorRule> {
        let trigger = "the user might need follow-up information";
        if existing.contains(trigger) {
            return Vec::new();
        }

        let followup_count = interactions
            .iter()
            .filter(|ix| {
                let input = ix.user_input.to_lowercase();
                FOLLOWUP_SIGNALS.iter().any(|sig| input.contains(sig))
            })
            .count();

        if followup_count >= 3 && interactions.len() >= 5 {
            let ratio = followup_count as f64 / interactions.len() as f64;
            if ratio > 0.3 {
                return vec![BehaviorRule::new(
                    trigger.to_string(),
                    "anticipate follow-up questions and proactively address related \
                     aspects in the response, since the user frequently asks follow-ups"
                        .to_string(),
                    (0.5 + ratio).min(0.85),
                    format!("followup_pattern:count={followup_count}:ratio={ratio:.2}"),
                )];
            }
        }
        Vec::new()
    }

    /// Off-hours activity gets a relaxed-tone rule.
    fn detect_time_patterns(
        &self,
        interactions: &[Interaction],
        existing: &HashSet<&str>,
    ) -> Vec<BehaviorRule> {
        let trigger = "interacting during late hours";
        if existing.contains(trigger) {
            return Vec::new();
        }

        let evening_count = interactions
            .iter()
            .filter(|ix| {
                let hour = chrono::DateTime::from_timestamp(ix.timestamp as i64, 0)
                    .map(|dt| {
                        use chrono::Timelike;
                        dt.hour()
                    })
                    .unwrap_or(12);
                !(6..20).contains(&hour)
            })
            .count();

        if evening_count >= 3 {
            vec![BehaviorRule::new(
                trigger.to_string(),
                "adopt a more relaxed, conversational tone since the user tends \
                 to interact during off-hours"
                    .to_string(),
                0.5,
                format!("time_pattern:evening={evening_count}"),
            )]
        } else {
            Vec::new()
        }
    }
}

/// Words excluded from topic clustering.
pub fn is_stop_word(word: &str) -> bool {
    const STOP_WORDS: &[&str] = &[
        "this", "that", "with", "from", "have", "been", "were", "they", "their", "what", "when",
        "where", "which", "there", "about", "would", "could", "should", "will", "just", "more",
        "some", "than", "then", "them", "also", "into", "your", "other", "only", "does", "very",
        "much", "most", "such", "here", "each", "like", "make", "made", "over", "after", "before",
        "being", "these", "those", "think", "know", "want", "because", "really", "still", "even",
        "well", "back", "going", "doing", "using", "thing", "things", "something", "anything",
        "everything",
    ];
    STOP_WORDS.contains(&word)
}
