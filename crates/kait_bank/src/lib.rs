pub mod bank;
pub mod models;

pub use bank::{NewInteraction, ReasoningBank};
pub use models::{
    ArchiveRecord, BankStats, BehaviorRuleRow, ContextEntry, Correction, EvolutionEvent,
    HotContext, Interaction, LearningRecord, MemoryEntry, PersonalityTrait, Preference,
    SessionSummary, TraitSample,
};
