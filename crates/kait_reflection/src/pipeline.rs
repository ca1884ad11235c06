//! The reflection pipeline: the loop that closes the feedback cycle.
//!
//! Reads a consistent snapshot of the Reasoning Bank plus observability
//! aggregates, runs the (pure) reflection cycle over it, and applies the
//! resulting writes: new behavior rules, safety insights as meta-domain
//! contexts, an evolution proposal, and the refreshed system prompt.
//!
//! An interaction completing mid-cycle is picked up by the next cycle;
//! the snapshot taken at cycle start is never mixed with newer rows.

use std::sync::Arc;

use kait_bank::ReasoningBank;
use kait_core::{KaitError, ReflectionConfig};
use kait_llm::LlmObserver;
use serde::Serialize;

use crate::cycle::{ReflectionCycle, ReflectionResult, ReflectionScheduler};
use crate::evolution::{EvolutionEngine, EvolveReport};
use crate::evolver::BehaviorEvolver;
use crate::prompt::refine_system_prompt;
use crate::rules::BehaviorRule;

/// Provider error rate above this fraction (in the 5-minute window) is a
/// safety insight.
const ERROR_RATE_ALERT: f64 = 0.25;
/// p99 latency above this is considered degraded.
const DEGRADED_P99_MS: f64 = 20_000.0;
/// Observability window the pipeline inspects.
const OBS_WINDOW_S: f64 = 300.0;

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub reflection: ReflectionResult,
    pub safety_insights: Vec<String>,
    pub rules_persisted: usize,
    pub evolution_applied: bool,
    pub stage: EvolveReport,
    pub system_prompt: String,
}

pub struct ReflectionPipeline {
    bank: ReasoningBank,
    observer: Arc<LlmObserver>,
    cycle: ReflectionCycle,
    evolver: BehaviorEvolver,
    scheduler: ReflectionScheduler,
    base_prompt: String,
    last_reflection_ts: f64,
    interactions_since: u32,
}

impl ReflectionPipeline {
    pub fn new(
        bank: ReasoningBank,
        observer: Arc<LlmObserver>,
        config: &ReflectionConfig,
        base_prompt: &str,
    ) -> Self {
        Self {
            bank,
            observer,
            cycle: ReflectionCycle::new(),
            evolver: BehaviorEvolver::new(),
            scheduler: ReflectionScheduler::new(
                config.interaction_threshold,
                config.interval_seconds,
            ),
            base_prompt: base_prompt.to_string(),
            last_reflection_ts: 0.0,
            interactions_since: 0,
        }
    }

    /// Called by the bridge for every dispatched interaction.
    pub fn note_interaction(&mut self) {
        self.interactions_since += 1;
    }

    pub fn evolver(&mut self) -> &mut BehaviorEvolver {
        &mut self.evolver
    }

    /// Run a cycle if the scheduler says it is due.
    pub async fn maybe_run(
        &mut self,
        evolution: &mut EvolutionEngine,
    ) -> Result<Option<PipelineReport>, KaitError> {
        if !self
            .scheduler
            .should_reflect(self.last_reflection_ts, self.interactions_since)
        {
            return Ok(None);
        }
        self.run_cycle(evolution).await.map(Some)
    }

    /// Run one full reflection cycle unconditionally.
    pub async fn run_cycle(
        &mut self,
        evolution: &mut EvolutionEngine,
    ) -> Result<PipelineReport, KaitError> {
        // Snapshot: everything below reads state as of this point
        let interactions = self.bank.get_interaction_history(50, None, None, false).await?;
        let corrections = self.bank.get_recent_corrections(20).await?;
        let evolution_events = self.bank.get_evolution_timeline(50).await?;
        let existing_rules: Vec<BehaviorRule> = self
            .bank
            .get_active_behavior_rules()
            .await?
            .iter()
            .map(BehaviorRule::from_row)
            .collect();

        let reflection =
            self.cycle
                .reflect(&interactions, &corrections, &evolution_events, &existing_rules);

        // Persist newly detected rules
        for rule in &reflection.new_rules {
            self.bank.save_behavior_rule(&rule.to_row()).await?;
        }

        // Observability-driven safety insights land as meta-domain contexts
        let safety_insights = self.collect_safety_insights();
        for (key, insight) in &safety_insights {
            self.bank
                .save_context(key, &serde_json::json!(insight), Some("meta"), 0.8)
                .await?;
        }

        // Behaviour evolution: propose from the reflection, apply, audit
        let proposal = self.evolver.propose_evolution(&reflection);
        let evolution_applied = if proposal.changes.is_empty() {
            false
        } else {
            let description = format!(
                "Applied {} parameter change(s) from reflection {}",
                proposal.changes.len(),
                reflection.reflection_id
            );
            let metrics_after = serde_json::to_value(&proposal.changes).ok();
            self.bank
                .save_evolution(
                    "behavior_evolution",
                    &description,
                    None,
                    metrics_after.as_ref(),
                )
                .await?;
            self.evolver.apply_evolution(proposal)
        };

        // Count the cycle and try a stage advance
        evolution.record_reflection_cycle();
        let stage = evolution.evolve();
        if stage.evolved {
            self.bank
                .save_evolution(
                    "stage_advance",
                    &format!("Advanced to stage {} ({})", stage.stage, stage.stage_name),
                    None,
                    serde_json::to_value(evolution.metrics()).ok().as_ref(),
                )
                .await?;
        }

        let system_prompt = self.current_system_prompt().await?;

        self.last_reflection_ts = reflection.timestamp;
        self.interactions_since = 0;

        tracing::info!(
            "Reflection cycle {} complete: {} insights, {} new rules, confidence {:.2}",
            reflection.reflection_id,
            reflection.insights.len(),
            reflection.new_rules.len(),
            reflection.confidence_score
        );

        Ok(PipelineReport {
            rules_persisted: reflection.new_rules.len(),
            safety_insights: safety_insights.into_iter().map(|(_, v)| v).collect(),
            reflection,
            evolution_applied,
            stage,
            system_prompt,
        })
    }

    /// Rebuild the system prompt from current bank state. Deterministic for
    /// a fixed bank state.
    pub async fn current_system_prompt(&self) -> Result<String, KaitError> {
        let rules: Vec<BehaviorRule> = self
            .bank
            .get_active_behavior_rules()
            .await?
            .iter()
            .map(BehaviorRule::from_row)
            .collect();
        let corrections = self.bank.get_recent_corrections(5).await?;
        let preferences = self.bank.get_all_preferences().await?;
        Ok(refine_system_prompt(
            &self.base_prompt,
            &rules,
            &corrections,
            &preferences,
        ))
    }

    /// Provider-health warnings from the observability window.
    fn collect_safety_insights(&self) -> Vec<(String, String)> {
        let mut insights = Vec::new();
        for (provider, stats) in self.observer.get_provider_stats(OBS_WINDOW_S) {
            // A couple of failed calls shouldn't page anyone
            if stats.calls >= 4 && stats.error_rate > ERROR_RATE_ALERT {
                insights.push((
                    format!("provider_health.{provider}"),
                    format!(
                        "Provider {provider} error rate {:.0}% over the last 5 minutes ({} of {} calls failed)",
                        stats.error_rate * 100.0,
                        stats.errors,
                        stats.calls
                    ),
                ));
            }
            if stats.calls >= 4 && stats.p99_latency_ms > DEGRADED_P99_MS {
                insights.push((
                    format!("provider_latency.{provider}"),
                    format!(
                        "Provider {provider} p99 latency {:.0}ms exceeds the degradation threshold",
                        stats.p99_latency_ms
                    ),
                ));
            }
        }
        insights
    }
}
