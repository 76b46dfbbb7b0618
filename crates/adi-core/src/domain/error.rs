//! Domain-level error taxonomy for ADI.

use serde::{Deserialize, Serialize};

/// Coarse classification recorded in output metadata and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    Validation,
    Provider,
    CircuitOpen,
    Persistence,
    Cancelled,
    Unknown,
}

/// Reasons an agent output fails its contract checks.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("agent name mismatch: expected {expected}, got {actual}")]
    NameMismatch { expected: String, actual: String },

    #[error("completed output has no results")]
    EmptyCompleted,

    #[error("result {index} ({result_type}) has normalized score {score} outside 0..=100")]
    ScoreOutOfRange {
        index: usize,
        result_type: String,
        score: f64,
    },

    #[error("result {index} ({result_type}) has confidence {confidence} outside 0..=1")]
    ConfidenceOutOfRange {
        index: usize,
        result_type: String,
        confidence: f64,
    },

    #[error("result {index} has an empty result type")]
    EmptyResultType { index: usize },
}

/// Errors produced while executing a single agent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("agent {agent} timed out after {timeout_ms}ms")]
    Timeout { agent: String, timeout_ms: u64 },

    #[error("agent {agent} output failed validation: {reason}")]
    Validation {
        agent: String,
        reason: ValidationError,
    },

    #[error("provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent {agent} cancelled")]
    Cancelled { agent: String },

    #[error("agent {agent} failed after {retries} retries: {source}")]
    RetriesExhausted {
        agent: String,
        retries: u32,
        #[source]
        source: Box<AgentError>,
    },

    #[error("{0}")]
    Unknown(String),
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::Timeout { .. } => ErrorClass::Timeout,
            AgentError::Validation { .. } => ErrorClass::Validation,
            AgentError::Provider { .. } => ErrorClass::Provider,
            AgentError::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            AgentError::Cancelled { .. } => ErrorClass::Cancelled,
            AgentError::RetriesExhausted { source, .. } => source.class(),
            AgentError::UnknownAgent(_) | AgentError::Unknown(_) => ErrorClass::Unknown,
        }
    }

    /// Whether this failure should count against a provider's circuit breaker.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self.class(), ErrorClass::Provider | ErrorClass::Timeout)
    }
}
