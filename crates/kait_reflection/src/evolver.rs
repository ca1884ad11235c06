//! Behaviour evolution: proposals, application, rollback.
//!
//! An evolution is a concrete, named change to the sidekick's operating
//! parameters. Each proposal carries its full change set so an applied
//! evolution can be rolled back by id.

use kait_core::{generate_id, now_ts};
use serde::{Deserialize, Serialize};

use crate::cycle::ReflectionResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterChange {
    pub parameter: String,
    /// "modify" | "enable" | "trigger" | "append_instruction"
    pub action: String,
    pub new_value: serde_json::Value,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Applied,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionProposal {
    pub evolution_id: String,
    pub changes: Vec<ParameterChange>,
    pub priority: f64,
    pub source_reflection: String,
    pub status: ProposalStatus,
    pub timestamp: f64,
    pub applied_at: Option<f64>,
    pub rolled_back_at: Option<f64>,
}

#[derive(Debug, Default)]
pub struct BehaviorEvolver {
    history: Vec<EvolutionProposal>,
}

impl BehaviorEvolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn reflection output into a concrete evolution proposal.
    pub fn propose_evolution(&self, reflection: &ReflectionResult) -> EvolutionProposal {
        let mut changes = Vec::new();

        for adj in &reflection.behavior_adjustments {
            if let Some(change) = adjustment_to_change(&adj.adjustment_type, &adj.description) {
                changes.push(change);
            }
        }
        for refinement in &reflection.prompt_refinements {
            changes.push(ParameterChange {
                parameter: "system_prompt".to_string(),
                action: "append_instruction".to_string(),
                new_value: serde_json::Value::String(refinement.clone()),
                reason: "Prompt refinement from reflection cycle.".to_string(),
            });
        }

        let priority = reflection
            .behavior_adjustments
            .iter()
            .map(|a| a.priority)
            .fold(0.5, f64::max);

        EvolutionProposal {
            evolution_id: generate_id(),
            changes,
            priority: (priority * 10_000.0).round() / 10_000.0,
            source_reflection: reflection.reflection_id.clone(),
            status: ProposalStatus::Proposed,
            timestamp: now_ts(),
            applied_at: None,
            rolled_back_at: None,
        }
    }

    /// Apply a proposal. Returns false for empty proposals.
    pub fn apply_evolution(&mut self, mut proposal: EvolutionProposal) -> bool {
        if proposal.changes.is_empty() {
            return false;
        }
        proposal.status = ProposalStatus::Applied;
        proposal.applied_at = Some(now_ts());
        self.history.push(proposal);
        true
    }

    /// Mark an applied evolution as rolled back.
    ///
    /// Returns true when the evolution was found in applied state.
    pub fn rollback_evolution(&mut self, evolution_id: &str) -> bool {
        for record in &mut self.history {
            if record.evolution_id == evolution_id {
                if record.status == ProposalStatus::Applied {
                    record.status = ProposalStatus::RolledBack;
                    record.rolled_back_at = Some(now_ts());
                    return true;
                }
                return false;
            }
        }
        false
    }

    pub fn history(&self) -> &[EvolutionProposal] {
        &self.history
    }

    /// Changes from applied (not rolled back) evolutions, oldest first.
    pub fn active_changes(&self) -> Vec<&ParameterChange> {
        self.history
            .iter()
            .filter(|p| p.status == ProposalStatus::Applied)
            .flat_map(|p| p.changes.iter())
            .collect()
    }
}

fn adjustment_to_change(adj_type: &str, description: &str) -> Option<ParameterChange> {
    if adj_type.contains("response_quality") || adj_type.contains("negative_streak") {
        return Some(ParameterChange {
            parameter: "response_strategy".to_string(),
            action: "modify".to_string(),
            new_value: serde_json::Value::String("ask_clarifying_questions_first".to_string()),
            reason: description.to_string(),
        });
    }
    if adj_type.contains("errors") {
        let category = adj_type
            .trim_start_matches("reduce_")
            .trim_end_matches("_errors");
        return Some(ParameterChange {
            parameter: format!("verification_{category}"),
            action: "enable".to_string(),
            new_value: serde_json::Value::Bool(true),
            reason: description.to_string(),
        });
    }
    if adj_type.contains("freshness") {
        return Some(ParameterChange {
            parameter: "style_refresh".to_string(),
            action: "trigger".to_string(),
            new_value: serde_json::json!(now_ts()),
            reason: description.to_string(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::BehaviorAdjustment;

    fn reflection_with(adjustments: Vec<BehaviorAdjustment>, refinements: Vec<String>) -> ReflectionResult {
        ReflectionResult {
            reflection_id: generate_id(),
            timestamp: now_ts(),
            insights: Vec::new(),
            behavior_adjustments: adjustments,
            prompt_refinements: refinements,
            new_rules: Vec::new(),
            confidence_score: 0.7,
            interactions_analyzed: 5,
            corrections_analyzed: 2,
        }
    }

    #[test]
    fn test_propose_converts_adjustments_and_refinements() {
        let evolver = BehaviorEvolver::new();
        let reflection = reflection_with(
            vec![BehaviorAdjustment {
                adjustment_type: "reduce_dates_errors".to_string(),
                description: "too many date slips".to_string(),
                priority: 0.75,
            }],
            vec!["Add instruction: 'Keep responses concise.'".to_string()],
        );

        let proposal = evolver.propose_evolution(&reflection);
        assert_eq!(proposal.changes.len(), 2);
        assert_eq!(proposal.changes[0].parameter, "verification_dates");
        assert_eq!(proposal.changes[0].action, "enable");
        assert_eq!(proposal.changes[1].parameter, "system_prompt");
        assert!((proposal.priority - 0.75).abs() < 1e-9);
        assert_eq!(proposal.status, ProposalStatus::Proposed);
    }

    #[test]
    fn test_apply_and_rollback() {
        let mut evolver = BehaviorEvolver::new();
        let reflection = reflection_with(
            vec![BehaviorAdjustment {
                adjustment_type: "break_negative_streak".to_string(),
                description: "style shift".to_string(),
                priority: 0.95,
            }],
            Vec::new(),
        );
        let proposal = evolver.propose_evolution(&reflection);
        let id = proposal.evolution_id.clone();

        assert!(evolver.apply_evolution(proposal));
        assert_eq!(evolver.active_changes().len(), 1);

        assert!(evolver.rollback_evolution(&id));
        assert!(evolver.active_changes().is_empty());
        // Second rollback is refused
        assert!(!evolver.rollback_evolution(&id));
        // Unknown id is refused
        assert!(!evolver.rollback_evolution("missing"));
    }

    #[test]
    fn test_empty_proposal_not_applied() {
        let mut evolver = BehaviorEvolver::new();
        let reflection = reflection_with(Vec::new(), Vec::new());
        let proposal = evolver.propose_evolution(&reflection);
        assert!(proposal.changes.is_empty());
        assert!(!evolver.apply_evolution(proposal));
        assert!(evolver.history().is_empty());
    }
}
