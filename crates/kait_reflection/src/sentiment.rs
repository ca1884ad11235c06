//! Rule-based sentiment analysis using curated word lists.
//!
//! Handles positive/negative keyword matching, intensity modifiers
//! ("very", "extremely", ...), and negation ("not happy" flips polarity).
//! No model dependency: sentiment only steers mood labels and resonance,
//! so a cheap deterministic scorer is the right tool.

use serde::{Deserialize, Serialize};

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "awesome", "excellent", "amazing", "wonderful", "fantastic", "love", "like",
    "enjoy", "happy", "pleased", "glad", "brilliant", "perfect", "beautiful", "nice", "cool",
    "superb", "outstanding", "delightful", "impressive", "helpful", "thanks", "thank",
    "appreciate", "solid", "yes", "right", "correct", "agree", "fun", "exciting", "interesting",
    "useful", "valuable", "clear", "elegant", "smooth", "fast", "reliable", "intuitive",
    "creative", "insightful", "thoughtful", "kind", "remarkable", "exceptional", "terrific",
    "marvelous", "phenomenal", "stellar",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "horrible", "poor", "hate", "dislike", "annoying", "frustrated",
    "angry", "sad", "disappointing", "disappointed", "wrong", "broken", "ugly", "slow",
    "confusing", "confused", "boring", "useless", "stupid", "dumb", "worst", "fail", "failed",
    "failure", "error", "bug", "crash", "sucks", "painful", "irritating", "problem", "issue",
    "difficult", "hard", "impossible", "ridiculous", "absurd", "lousy", "mediocre", "weak",
    "flawed", "clunky", "messy", "unclear", "pointless", "dreadful", "atrocious", "abysmal",
    "pathetic", "miserable", "appalling",
];

const INTENSIFIERS: &[(&str, f64)] = &[
    ("very", 1.5),
    ("really", 1.5),
    ("extremely", 2.0),
    ("incredibly", 2.0),
    ("absolutely", 2.0),
    ("totally", 1.8),
    ("completely", 1.8),
    ("utterly", 2.0),
    ("highly", 1.5),
    ("super", 1.6),
    ("so", 1.3),
    ("quite", 1.2),
    ("pretty", 1.2),
    ("somewhat", 0.7),
    ("slightly", 0.5),
    ("barely", 0.4),
    ("hardly", 0.4),
];

const NEGATION_WORDS: &[&str] = &[
    "not", "no", "never", "neither", "nobody", "nothing", "nowhere", "nor", "cannot", "can't",
    "won't", "don't", "doesn't", "didn't", "isn't", "aren't", "wasn't", "weren't", "shouldn't",
    "wouldn't", "couldn't", "hasn't", "haven't", "hadn't",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentimentResult {
    /// Score in [-1.0, 1.0].
    pub score: f64,
    /// "positive" | "negative" | "neutral"
    pub label: String,
    /// Confidence in [0.0, 1.0]; rises with more matched evidence.
    pub confidence: f64,
    /// Matched sentiment words, sorted and deduplicated.
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SentimentAnalyzer;

impl SentimentAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, text: &str) -> SentimentResult {
        if text.trim().is_empty() {
            return SentimentResult {
                score: 0.0,
                label: "neutral".to_string(),
                confidence: 1.0,
                keywords: Vec::new(),
            };
        }

        let tokens = tokenize(text);
        let (pos_total, neg_total, mut keywords) = score_tokens(&tokens);

        let raw = pos_total - neg_total;
        let total_hits = pos_total + neg_total;
        let score = squash(raw);

        let label = if score > 0.05 {
            "positive"
        } else if score < -0.05 {
            "negative"
        } else {
            "neutral"
        };

        // No signal means we are only guessing neutral
        let confidence = if total_hits == 0.0 {
            0.5
        } else {
            (0.5 + total_hits * 0.1).min(1.0)
        };

        keywords.sort();
        keywords.dedup();

        SentimentResult {
            score: (score * 10_000.0).round() / 10_000.0,
            label: label.to_string(),
            confidence: (confidence * 10_000.0).round() / 10_000.0,
            keywords,
        }
    }

    /// Mood label used on interactions: the sentiment label plus an
    /// "engaged" band for mildly positive inputs.
    pub fn mood_label(&self, text: &str) -> String {
        let result = self.analyze(text);
        if result.score > 0.4 {
            "enthusiastic".to_string()
        } else if result.score > 0.05 {
            "engaged".to_string()
        } else if result.score < -0.4 {
            "frustrated".to_string()
        } else if result.score < -0.05 {
            "dissatisfied".to_string()
        } else {
            "neutral".to_string()
        }
    }
}

/// Lowercase and split on non-alpha boundaries, keeping contractions.
fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in lower.chars() {
        if c.is_ascii_alphabetic() || (c == '\'' && !current.is_empty()) {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Walk tokens accumulating positive/negative evidence.
fn score_tokens(tokens: &[String]) -> (f64, f64, Vec<String>) {
    let mut pos_total = 0.0;
    let mut neg_total = 0.0;
    let mut keywords = Vec::new();

    // Tokens remaining under negation influence
    let mut negation_window = 0u32;
    let mut intensity = 1.0;

    for token in tokens {
        if NEGATION_WORDS.contains(&token.as_str()) {
            negation_window = 3;
            continue;
        }
        if let Some((_, mult)) = INTENSIFIERS.iter().find(|(w, _)| w == token) {
            intensity = *mult;
            continue;
        }

        let is_positive = POSITIVE_WORDS.contains(&token.as_str());
        let is_negative = NEGATIVE_WORDS.contains(&token.as_str());

        if is_positive || is_negative {
            let weight = intensity;
            let negated = negation_window > 0;
            if is_positive {
                if negated {
                    // "not good" is mildly negative
                    neg_total += weight * 0.75;
                } else {
                    pos_total += weight;
                }
            } else if negated {
                // "not bad" is mildly positive
                pos_total += weight * 0.5;
            } else {
                neg_total += weight;
            }
            keywords.push(token.clone());
            intensity = 1.0;
        }

        if negation_window > 0 {
            negation_window -= 1;
        }
    }

    (pos_total, neg_total, keywords)
}

/// Squash raw evidence into [-1, 1]; k controls sensitivity.
fn squash(raw: f64) -> f64 {
    (raw / 2.0).tanh()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_text() {
        let sa = SentimentAnalyzer::new();
        let r = sa.analyze("the meeting is at noon");
        assert_eq!(r.label, "neutral");
        assert!(r.score.abs() < 0.05);
        assert!(r.keywords.is_empty());
    }

    #[test]
    fn test_positive_text() {
        let sa = SentimentAnalyzer::new();
        let r = sa.analyze("I really love this new feature, thanks!");
        assert_eq!(r.label, "positive");
        assert!(r.score > 0.3);
        assert!(r.keywords.contains(&"love".to_string()));
    }

    #[test]
    fn test_negative_text() {
        let sa = SentimentAnalyzer::new();
        let r = sa.analyze("this is terrible and the bug is still broken");
        assert_eq!(r.label, "negative");
        assert!(r.score < -0.3);
    }

    #[test]
    fn test_negation_flips_polarity() {
        let sa = SentimentAnalyzer::new();
        let plain = sa.analyze("that was good");
        let negated = sa.analyze("that was not good");
        assert!(plain.score > 0.0);
        assert!(negated.score < 0.0);

        // "not bad" lands mildly positive
        let not_bad = sa.analyze("not bad at all");
        assert!(not_bad.score > 0.0);
    }

    #[test]
    fn test_intensifier_scales_score() {
        let sa = SentimentAnalyzer::new();
        let plain = sa.analyze("that was good");
        let intense = sa.analyze("that was extremely good");
        assert!(intense.score > plain.score);

        let damped = sa.analyze("that was slightly good");
        assert!(damped.score < plain.score);
    }

    #[test]
    fn test_empty_text() {
        let sa = SentimentAnalyzer::new();
        let r = sa.analyze("   ");
        assert_eq!(r.label, "neutral");
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn test_confidence_rises_with_evidence() {
        let sa = SentimentAnalyzer::new();
        let one = sa.analyze("good");
        let many = sa.analyze("good great awesome excellent amazing wonderful");
        assert!(many.confidence > one.confidence);
    }

    #[test]
    fn test_score_bounded() {
        let sa = SentimentAnalyzer::new();
        let r = sa.analyze(&"amazing wonderful fantastic brilliant perfect ".repeat(20));
        assert!(r.score <= 1.0);
        let r = sa.analyze(&"terrible awful horrible dreadful ".repeat(20));
        assert!(r.score >= -1.0);
    }

    #[test]
    fn test_mood_labels() {
        let sa = SentimentAnalyzer::new();
        assert_eq!(sa.mood_label("this is absolutely amazing, thank you!"), "enthusiastic");
        assert_eq!(sa.mood_label("this is terrible, everything is broken"), "frustrated");
        assert_eq!(sa.mood_label("the meeting is at noon"), "neutral");
    }
}
