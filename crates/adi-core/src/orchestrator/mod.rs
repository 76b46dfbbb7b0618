//! Hybrid fast/slow orchestration.
//!
//! - `queue`: priority work queue with a concurrency cap and dependency gating
//! - `dispatcher`: [`SlowAgentDispatcher`] strategy (in-process queue or remote worker)
//! - `status`: evaluation status assembled from execution records
//! - `hybrid`: [`HybridOrchestrator`], the evaluation state machine

pub mod dispatcher;
pub mod hybrid;
pub mod queue;
pub mod status;

use crate::config::ConfigError;
use crate::tracker::TrackerError;

pub use dispatcher::{HttpDispatcher, QueueDispatcher, SlowAgentDispatcher};
pub use hybrid::{
    dependency_waves, CancelSummary, EvaluationPhase, FinalResults, HybridOrchestrator,
    PartialResults, SlowAgentTicket,
};
pub use queue::{JobRunner, QueueConfig, QueueMetrics, WorkQueue};
pub use status::{AgentStatusEntry, EvaluationStatus, OverallStatus};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The tracker could not durably record state; fails the evaluation.
    #[error("persistence failure: {0}")]
    Persistence(#[from] TrackerError),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("evaluation {0} was cancelled")]
    Cancelled(String),

    #[error("evaluation not found: {0}")]
    EvaluationNotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;
