//! Deterministic system prompt assembly.
//!
//! Rebuilds the system prompt from the base prompt, the active behavior
//! rules, the recent corrections (as avoid-directives), and the current
//! preferences. Pure: same inputs, same string.

use kait_bank::{Correction, Preference};

use crate::rules::BehaviorRule;

/// Assemble the refined system prompt.
pub fn refine_system_prompt(
    base_prompt: &str,
    rules: &[BehaviorRule],
    corrections: &[Correction],
    preferences: &[Preference],
) -> String {
    let mut sections = vec![base_prompt.trim_end().to_string()];

    let rule_lines: Vec<String> = rules
        .iter()
        .filter(|r| r.active)
        .map(|r| format!("- {}", r.to_prompt_instruction()))
        .collect();
    if !rule_lines.is_empty() {
        sections.push(format!(
            "## Learned Behaviours\nApply the following learned behaviours:\n{}",
            rule_lines.join("\n")
        ));
    }

    let correction_lines: Vec<String> = corrections
        .iter()
        .map(|c| {
            let reason = c
                .reason
                .as_deref()
                .filter(|r| !r.is_empty())
                .map(|r| format!(" ({r})"))
                .unwrap_or_default();
            format!("- Avoid: \"{}\". Instead: \"{}\"{}", c.original_response, c.correction, reason)
        })
        .collect();
    if !correction_lines.is_empty() {
        sections.push(format!(
            "## Recent Corrections\nDo not repeat these mistakes:\n{}",
            correction_lines.join("\n")
        ));
    }

    let pref_lines: Vec<String> = preferences.iter().filter_map(preference_instruction).collect();
    if !pref_lines.is_empty() {
        sections.push(format!("## User Preferences\n{}", pref_lines.join("\n")));
    }

    sections.join("\n\n")
}

fn preference_instruction(pref: &Preference) -> Option<String> {
    match (pref.key.as_str(), pref.value.as_str()) {
        ("formality", "casual") => {
            Some("- Use a casual, friendly tone. Contractions are fine.".to_string())
        }
        ("formality", "formal") => {
            Some("- Maintain a formal, professional tone throughout.".to_string())
        }
        ("response_length", "short") => {
            Some("- Keep responses concise (under 80 words when possible).".to_string())
        }
        ("response_length", "long") => {
            Some("- Provide thorough, detailed responses with examples.".to_string())
        }
        ("humor_appreciation", "high") => {
            Some("- Feel free to include light humour and wordplay.".to_string())
        }
        ("humor_appreciation", "low") => {
            Some("- Stay serious and factual. Avoid humour.".to_string())
        }
        ("topic_interests", topics) if !topics.is_empty() => {
            let top: Vec<&str> = topics.split(',').take(5).collect();
            Some(format!(
                "- The user is interested in: {}. Reference these when relevant.",
                top.join(", ")
            ))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kait_core::{generate_id, now_ts};

    fn rule(trigger: &str, action: &str, active: bool) -> BehaviorRule {
        BehaviorRule {
            rule_id: generate_id(),
            trigger: trigger.to_string(),
            action: action.to_string(),
            confidence: 0.8,
            source: "test".to_string(),
            created_at: now_ts(),
            active,
        }
    }

    fn pref(key: &str, value: &str) -> Preference {
        Preference {
            id: generate_id(),
            key: key.to_string(),
            value: value.to_string(),
            confidence: 0.7,
            last_updated: now_ts(),
        }
    }

    fn correction(original: &str, fixed: &str, reason: Option<&str>) -> Correction {
        Correction {
            id: generate_id(),
            original_response: original.to_string(),
            correction: fixed.to_string(),
            reason: reason.map(str::to_string),
            domain: None,
            learned_at: now_ts(),
            applied_count: 0,
        }
    }

    #[test]
    fn test_base_only() {
        let prompt = refine_system_prompt("You are Kait.", &[], &[], &[]);
        assert_eq!(prompt, "You are Kait.");
    }

    #[test]
    fn test_full_assembly() {
        let rules = vec![rule("the user asks about code", "include an example", true)];
        let corrections = vec![correction("Paris is in Italy", "Paris is in France", Some("geography"))];
        let prefs = vec![pref("response_length", "short"), pref("formality", "casual")];

        let prompt = refine_system_prompt("You are Kait.", &rules, &corrections, &prefs);

        assert!(prompt.starts_with("You are Kait."));
        assert!(prompt.contains("## Learned Behaviours"));
        assert!(prompt.contains("When the user asks about code, include an example"));
        assert!(prompt.contains("## Recent Corrections"));
        assert!(prompt.contains("Paris is in France"));
        assert!(prompt.contains("(geography)"));
        assert!(prompt.contains("## User Preferences"));
        assert!(prompt.contains("under 80 words"));
        assert!(prompt.contains("casual, friendly tone"));
    }

    #[test]
    fn test_inactive_rules_excluded() {
        let rules = vec![
            rule("active trigger", "act", true),
            rule("inactive trigger", "ignore", false),
        ];
        let prompt = refine_system_prompt("Base.", &rules, &[], &[]);
        assert!(prompt.contains("active trigger"));
        assert!(!prompt.contains("inactive trigger"));
    }

    #[test]
    fn test_unknown_preferences_skipped() {
        let prefs = vec![pref("favorite_color", "blue")];
        let prompt = refine_system_prompt("Base.", &[], &[], &prefs);
        assert!(!prompt.contains("User Preferences"));
    }

    #[test]
    fn test_deterministic() {
        let rules = vec![rule("t", "a", true)];
        let prefs = vec![pref("formality", "formal")];
        let a = refine_system_prompt("Base.", &rules, &[], &prefs);
        let b = refine_system_prompt("Base.", &rules, &[], &prefs);
        assert_eq!(a, b);
    }

    #[test]
    fn test_topic_interests_rendered() {
        let prefs = vec![pref("topic_interests", "rust,databases,music")];
        let prompt = refine_system_prompt("Base.", &[], &[], &prefs);
        assert!(prompt.contains("rust, databases, music"));
    }
}
