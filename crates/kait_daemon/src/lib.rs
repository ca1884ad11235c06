pub mod ingest;
pub mod pulse;
pub mod queue;
pub mod quarantine;
pub mod ratelimit;

pub use ingest::{ingest_app, IngestState};
pub use pulse::{pulse_app, OpsProvider, PulseState};
pub use quarantine::Quarantine;
pub use queue::EventQueue;
pub use ratelimit::SlidingWindowLimiter;
