pub mod breaker;
pub mod cost;
pub mod gateway;
pub mod observability;
pub mod providers;
pub mod retry;
pub mod router;

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitState};
pub use cost::CostTracker;
pub use gateway::{GatewayHealth, LlmGateway};
pub use observability::{classify_error, observed, LlmCallRecord, LlmObserver, ObserverSummary};
pub use providers::{ChatMessage, CompletionParams, ProviderClient, Role, StreamEvent};
pub use router::{Availability, ComplexityScorer, Provider, Router, RoutingDecision};
