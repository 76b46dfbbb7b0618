pub mod agent;
pub mod error;
pub mod scoring;
pub mod validation;

pub use agent::{
    AgentConfig, AgentInput, AgentOutput, AgentResult, AgentStatus, EvaluationContext,
    EvaluationTier, Latency, PriorityClass,
};
pub use error::{AgentError, ErrorClass, ValidationError};
pub use scoring::{aggregate_scores, AggregateScore};
pub use validation::{validate_output, validate_results};
