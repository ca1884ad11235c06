pub mod archive;
pub mod cycle;
pub mod evolution;
pub mod evolver;
pub mod pipeline;
pub mod prompt;
pub mod resonance;
pub mod rules;
pub mod sentiment;

pub use archive::ArchiveWorker;
pub use cycle::{ReflectionCycle, ReflectionResult, ReflectionScheduler};
pub use evolution::{EvolutionEngine, EvolutionMetrics, EvolveReport, StageDefinition};
pub use evolver::{BehaviorEvolver, EvolutionProposal, ParameterChange};
pub use pipeline::{PipelineReport, ReflectionPipeline};
pub use prompt::refine_system_prompt;
pub use resonance::{PreferenceTracker, ResonanceEngine};
pub use rules::{BehaviorRule, PatternDetector};
pub use sentiment::{SentimentAnalyzer, SentimentResult};
