//! Staged self-evolution engine.
//!
//! Tracks interaction quality, resonance, and corrections to decide when
//! the sidekick advances to the next of ten named stages. The current
//! stage only ever moves upward. State persists to a JSON file written
//! atomically after every mutation.

use anyhow::Result;
use kait_core::now_ts;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MAX_STAGE: u32 = 10;

/// Immutable definition of a single evolution stage.
#[derive(Debug, Clone, Copy)]
pub struct StageDefinition {
    pub level: u32,
    pub name: &'static str,
    pub description: &'static str,
    pub min_interactions: u64,
    pub min_corrections: u64,
    pub min_resonance: f64,
    pub min_quality: f64,
    pub min_reflection_cycles: u64,
}

pub const STAGES: [StageDefinition; 10] = [
    StageDefinition {
        level: 1,
        name: "Basic",
        description: "Default responses. Learning the ropes.",
        min_interactions: 0,
        min_corrections: 0,
        min_resonance: 0.0,
        min_quality: 0.0,
        min_reflection_cycles: 0,
    },
    StageDefinition {
        level: 2,
        name: "Adaptive",
        description: "Learning preferences. Adjusting to user patterns.",
        min_interactions: 25,
        min_corrections: 5,
        min_resonance: 0.20,
        min_quality: 0.40,
        min_reflection_cycles: 1,
    },
    StageDefinition {
        level: 3,
        name: "Resonant",
        description: "Personality emerging. Finding shared frequency.",
        min_interactions: 75,
        min_corrections: 15,
        min_resonance: 0.35,
        min_quality: 0.50,
        min_reflection_cycles: 3,
    },
    StageDefinition {
        level: 4,
        name: "Creative",
        description: "Generating novel responses. Breaking templates.",
        min_interactions: 200,
        min_corrections: 30,
        min_resonance: 0.45,
        min_quality: 0.58,
        min_reflection_cycles: 7,
    },
    StageDefinition {
        level: 5,
        name: "Insightful",
        description: "Deep pattern recognition. Connecting dots across domains.",
        min_interactions: 500,
        min_corrections: 60,
        min_resonance: 0.55,
        min_quality: 0.65,
        min_reflection_cycles: 15,
    },
    StageDefinition {
        level: 6,
        name: "Anticipatory",
        description: "Predicting user needs before they arise.",
        min_interactions: 1000,
        min_corrections: 100,
        min_resonance: 0.65,
        min_quality: 0.72,
        min_reflection_cycles: 30,
    },
    StageDefinition {
        level: 7,
        name: "Empathic",
        description: "Emotional intelligence. Reading between the lines.",
        min_interactions: 2000,
        min_corrections: 150,
        min_resonance: 0.74,
        min_quality: 0.78,
        min_reflection_cycles: 50,
    },
    StageDefinition {
        level: 8,
        name: "Wise",
        description: "Synthesizing cross-domain knowledge. Seeing the bigger picture.",
        min_interactions: 4000,
        min_corrections: 200,
        min_resonance: 0.82,
        min_quality: 0.84,
        min_reflection_cycles: 80,
    },
    StageDefinition {
        level: 9,
        name: "Transcendent",
        description: "Creating new knowledge. Pushing beyond known boundaries.",
        min_interactions: 8000,
        min_corrections: 300,
        min_resonance: 0.90,
        min_quality: 0.90,
        min_reflection_cycles: 120,
    },
    StageDefinition {
        level: 10,
        name: "God-like",
        description: "Peak performance. Absolute mastery of self-evolution.",
        min_interactions: 15000,
        min_corrections: 500,
        min_resonance: 0.95,
        min_quality: 0.95,
        min_reflection_cycles: 200,
    },
];

pub fn stage(level: u32) -> &'static StageDefinition {
    let idx = level.clamp(1, MAX_STAGE) as usize - 1;
    &STAGES[idx]
}

/// Snapshot of accumulated evolution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionMetrics {
    pub total_interactions: u64,
    pub successful_interactions: u64,
    pub corrections_applied: u64,
    pub reflection_cycles: u64,
    pub personality_shifts: u64,
    pub avg_resonance_score: f64,
    pub avg_response_quality: f64,
    pub evolution_stage: u32,
    pub learnings_count: u64,
}

impl Default for EvolutionMetrics {
    fn default() -> Self {
        Self {
            total_interactions: 0,
            successful_interactions: 0,
            corrections_applied: 0,
            reflection_cycles: 0,
            personality_shifts: 0,
            avg_resonance_score: 0.0,
            avg_response_quality: 0.0,
            evolution_stage: 1,
            learnings_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub timestamp: f64,
    pub from_stage: u32,
    pub to_stage: u32,
    pub from_name: String,
    pub to_name: String,
    pub metrics_snapshot: EvolutionMetrics,
}

/// Outcome of an `evolve()` attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolveReport {
    pub evolved: bool,
    pub reason: String,
    pub stage: u32,
    pub stage_name: String,
    /// Unmet requirements ("interactions: 12/25"), empty when evolved.
    pub gaps: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedState {
    version: u32,
    created_at: f64,
    updated_at: f64,
    last_evolution_at: Option<f64>,
    metrics: EvolutionMetrics,
    resonance_sum: f64,
    quality_sum: f64,
    sample_count: u64,
    history: Vec<StageTransition>,
}

pub struct EvolutionEngine {
    state_path: PathBuf,
    metrics: EvolutionMetrics,
    resonance_sum: f64,
    quality_sum: f64,
    sample_count: u64,
    history: Vec<StageTransition>,
    created_at: f64,
    last_evolution_at: Option<f64>,
}

impl EvolutionEngine {
    pub fn new<P: AsRef<Path>>(state_path: P) -> Self {
        let mut engine = Self {
            state_path: state_path.as_ref().to_path_buf(),
            metrics: EvolutionMetrics::default(),
            resonance_sum: 0.0,
            quality_sum: 0.0,
            sample_count: 0,
            history: Vec::new(),
            created_at: now_ts(),
            last_evolution_at: None,
        };
        engine.load();
        engine
    }

    pub fn metrics(&self) -> &EvolutionMetrics {
        &self.metrics
    }

    pub fn history(&self) -> &[StageTransition] {
        &self.history
    }

    pub fn current_stage(&self) -> &'static StageDefinition {
        stage(self.metrics.evolution_stage)
    }

    /// Record the result of a single interaction.
    pub fn record_interaction_outcome(&mut self, success: bool, resonance: f64, quality: f64) {
        let resonance = resonance.clamp(0.0, 1.0);
        let quality = quality.clamp(0.0, 1.0);

        self.metrics.total_interactions += 1;
        if success {
            self.metrics.successful_interactions += 1;
        }
        self.resonance_sum += resonance;
        self.quality_sum += quality;
        self.sample_count += 1;
        self.metrics.avg_resonance_score =
            round4(self.resonance_sum / self.sample_count as f64);
        self.metrics.avg_response_quality = round4(self.quality_sum / self.sample_count as f64);
        self.save();
    }

    pub fn record_correction(&mut self) {
        self.metrics.corrections_applied += 1;
        self.metrics.learnings_count += 1;
        self.save();
    }

    pub fn record_reflection_cycle(&mut self) {
        self.metrics.reflection_cycles += 1;
        self.save();
    }

    pub fn record_personality_shift(&mut self) {
        self.metrics.personality_shifts += 1;
        self.save();
    }

    /// Whether all requirements for the next stage are satisfied.
    pub fn check_evolution_threshold(&self) -> bool {
        let current = self.metrics.evolution_stage;
        if current >= MAX_STAGE {
            return false;
        }
        let target = stage(current + 1);
        self.metrics.total_interactions >= target.min_interactions
            && self.metrics.corrections_applied >= target.min_corrections
            && self.metrics.avg_resonance_score >= target.min_resonance
            && self.metrics.avg_response_quality >= target.min_quality
            && self.metrics.reflection_cycles >= target.min_reflection_cycles
    }

    /// Attempt to advance to the next stage.
    pub fn evolve(&mut self) -> EvolveReport {
        let current = self.metrics.evolution_stage;

        if current >= MAX_STAGE {
            return EvolveReport {
                evolved: false,
                reason: "already_at_max_stage".to_string(),
                stage: current,
                stage_name: stage(current).name.to_string(),
                gaps: Vec::new(),
            };
        }
        if !self.check_evolution_threshold() {
            return self.gap_report();
        }

        let new_stage = current + 1;
        self.metrics.evolution_stage = new_stage;
        let ts = now_ts();
        self.last_evolution_at = Some(ts);
        self.history.push(StageTransition {
            timestamp: ts,
            from_stage: current,
            to_stage: new_stage,
            from_name: stage(current).name.to_string(),
            to_name: stage(new_stage).name.to_string(),
            metrics_snapshot: self.metrics.clone(),
        });
        self.save();

        EvolveReport {
            evolved: true,
            reason: "thresholds_met".to_string(),
            stage: new_stage,
            stage_name: stage(new_stage).name.to_string(),
            gaps: Vec::new(),
        }
    }

    /// Human-readable status report.
    pub fn report(&self) -> String {
        let m = &self.metrics;
        let current = stage(m.evolution_stage);
        let mut lines = vec![
            "=== Kait Sidekick Evolution Report ===".to_string(),
            String::new(),
            format!("Current Stage: {}/{} - {}", m.evolution_stage, MAX_STAGE, current.name),
            format!("  {}", current.description),
            String::new(),
            "--- Metrics ---".to_string(),
            format!("  Total interactions:    {}", m.total_interactions),
            format!("  Successful:            {}", m.successful_interactions),
            format!("  Corrections applied:   {}", m.corrections_applied),
            format!("  Reflection cycles:     {}", m.reflection_cycles),
            format!("  Personality shifts:    {}", m.personality_shifts),
            format!("  Avg resonance:         {:.4}", m.avg_resonance_score),
            format!("  Avg quality:           {:.4}", m.avg_response_quality),
        ];

        if m.evolution_stage < MAX_STAGE {
            let next = stage(m.evolution_stage + 1);
            lines.push(String::new());
            lines.push(format!("--- Progress to Stage {}: {} ---", next.level, next.name));
            lines.push(format!(
                "  Interactions:  {}/{}",
                m.total_interactions, next.min_interactions
            ));
            lines.push(format!(
                "  Corrections:   {}/{}",
                m.corrections_applied, next.min_corrections
            ));
            lines.push(format!(
                "  Resonance:     {:.4}/{:.2}",
                m.avg_resonance_score, next.min_resonance
            ));
            lines.push(format!(
                "  Quality:       {:.4}/{:.2}",
                m.avg_response_quality, next.min_quality
            ));
            lines.push(format!(
                "  Reflections:   {}/{}",
                m.reflection_cycles, next.min_reflection_cycles
            ));
            lines.push(String::new());
            lines.push(
                if self.check_evolution_threshold() {
                    "  READY TO EVOLVE"
                } else {
                    "  Not yet ready for evolution"
                }
                .to_string(),
            );
        } else {
            lines.push(String::new());
            lines.push("  Maximum evolution stage reached.".to_string());
        }

        for h in &self.history {
            lines.push(format!(
                "  Stage {} ({}) -> Stage {} ({})",
                h.from_stage, h.from_name, h.to_stage, h.to_name
            ));
        }
        lines.push(String::new());
        lines.join("\n")
    }

    fn gap_report(&self) -> EvolveReport {
        let current = self.metrics.evolution_stage;
        let target = stage(current + 1);
        let m = &self.metrics;
        let mut gaps = Vec::new();

        if m.total_interactions < target.min_interactions {
            gaps.push(format!(
                "interactions: {}/{}",
                m.total_interactions, target.min_interactions
            ));
        }
        if m.corrections_applied < target.min_corrections {
            gaps.push(format!(
                "corrections: {}/{}",
                m.corrections_applied, target.min_corrections
            ));
        }
        if m.avg_resonance_score < target.min_resonance {
            gaps.push(format!(
                "resonance: {:.4}/{:.2}",
                m.avg_resonance_score, target.min_resonance
            ));
        }
        if m.avg_response_quality < target.min_quality {
            gaps.push(format!(
                "quality: {:.4}/{:.2}",
                m.avg_response_quality, target.min_quality
            ));
        }
        if m.reflection_cycles < target.min_reflection_cycles {
            gaps.push(format!(
                "reflections: {}/{}",
                m.reflection_cycles, target.min_reflection_cycles
            ));
        }

        EvolveReport {
            evolved: false,
            reason: "thresholds_not_met".to_string(),
            stage: current,
            stage_name: stage(current).name.to_string(),
            gaps,
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn save(&self) {
        let payload = PersistedState {
            version: 1,
            created_at: self.created_at,
            updated_at: now_ts(),
            last_evolution_at: self.last_evolution_at,
            metrics: self.metrics.clone(),
            resonance_sum: self.resonance_sum,
            quality_sum: self.quality_sum,
            sample_count: self.sample_count,
            history: self.history.clone(),
        };
        // Best-effort persistence: never crash the engine on write failure
        if let Err(e) = self.write_atomic(&payload) {
            tracing::warn!("Failed to persist evolution state: {}", e);
        }
    }

    fn write_atomic(&self, payload: &PersistedState) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(payload)?;
        let tmp = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    fn load(&mut self) {
        let Ok(raw) = std::fs::read_to_string(&self.state_path) else {
            return;
        };
        let Ok(state) = serde_json::from_str::<PersistedState>(&raw) else {
            tracing::warn!(
                "Ignoring malformed evolution state at {}",
                self.state_path.display()
            );
            return;
        };
        self.metrics = state.metrics;
        self.resonance_sum = state.resonance_sum;
        self.quality_sum = state.quality_sum;
        self.sample_count = state.sample_count;
        self.history = state.history;
        self.created_at = if state.created_at > 0.0 {
            state.created_at
        } else {
            now_ts()
        };
        self.last_evolution_at = state.last_evolution_at;
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(dir: &tempfile::TempDir) -> EvolutionEngine {
        EvolutionEngine::new(dir.path().join("sidekick_evolution.json"))
    }

    /// Feed enough signal to satisfy stage 2 thresholds.
    fn feed_to_stage_two(e: &mut EvolutionEngine) {
        for _ in 0..25 {
            e.record_interaction_outcome(true, 0.6, 0.7);
        }
        for _ in 0..5 {
            e.record_correction();
        }
        e.record_reflection_cycle();
    }

    #[test]
    fn test_initial_stage_is_basic() {
        let dir = tempdir().unwrap();
        let e = engine(&dir);
        assert_eq!(e.metrics().evolution_stage, 1);
        assert_eq!(e.current_stage().name, "Basic");
    }

    #[test]
    fn test_gap_report_lists_missing() {
        let dir = tempdir().unwrap();
        let mut e = engine(&dir);
        e.record_interaction_outcome(true, 0.9, 0.9);

        let report = e.evolve();
        assert!(!report.evolved);
        assert_eq!(report.reason, "thresholds_not_met");
        assert!(report.gaps.iter().any(|g| g.starts_with("interactions:")));
        assert!(report.gaps.iter().any(|g| g.starts_with("corrections:")));
        assert!(report.gaps.iter().any(|g| g.starts_with("reflections:")));
    }

    #[test]
    fn test_evolution_advances_when_ready() {
        let dir = tempdir().unwrap();
        let mut e = engine(&dir);
        feed_to_stage_two(&mut e);

        assert!(e.check_evolution_threshold());
        let report = e.evolve();
        assert!(report.evolved);
        assert_eq!(report.stage, 2);
        assert_eq!(report.stage_name, "Adaptive");
        assert_eq!(e.history().len(), 1);

        // Immediately evolving again fails: stage 3 needs more
        let report = e.evolve();
        assert!(!report.evolved);
        assert_eq!(e.metrics().evolution_stage, 2);
    }

    #[test]
    fn test_stage_monotonic_across_restart() {
        let dir = tempdir().unwrap();
        {
            let mut e = engine(&dir);
            feed_to_stage_two(&mut e);
            assert!(e.evolve().evolved);
        }
        // Reload from disk: stage survives and never goes down
        let e = engine(&dir);
        assert_eq!(e.metrics().evolution_stage, 2);
        assert_eq!(e.metrics().total_interactions, 25);
        assert_eq!(e.history().len(), 1);
    }

    #[test]
    fn test_averages_accumulate() {
        let dir = tempdir().unwrap();
        let mut e = engine(&dir);
        e.record_interaction_outcome(true, 1.0, 1.0);
        e.record_interaction_outcome(false, 0.0, 0.0);
        assert!((e.metrics().avg_resonance_score - 0.5).abs() < 1e-9);
        assert!((e.metrics().avg_response_quality - 0.5).abs() < 1e-9);
        assert_eq!(e.metrics().successful_interactions, 1);
    }

    #[test]
    fn test_out_of_range_scores_clamped() {
        let dir = tempdir().unwrap();
        let mut e = engine(&dir);
        e.record_interaction_outcome(true, 5.0, -2.0);
        assert!(e.metrics().avg_resonance_score <= 1.0);
        assert!(e.metrics().avg_response_quality >= 0.0);
    }

    #[test]
    fn test_report_renders() {
        let dir = tempdir().unwrap();
        let mut e = engine(&dir);
        feed_to_stage_two(&mut e);
        let text = e.report();
        assert!(text.contains("Current Stage: 1/10 - Basic"));
        assert!(text.contains("READY TO EVOLVE"));
    }

    #[test]
    fn test_stage_lookup_bounds() {
        assert_eq!(stage(0).level, 1);
        assert_eq!(stage(1).name, "Basic");
        assert_eq!(stage(10).name, "God-like");
        assert_eq!(stage(99).level, 10);
    }
}
