//! Storage trait definitions for ADI
//!
//! - `ExecutionRecord`: durable status object for one agent run
//! - `ExecutionStore`: backend-agnostic persistence of those records
//!
//! State machine (strict one-way DAG):
//!
//! ```text
//! pending ──▶ running ──▶ completed
//!    │           │
//!    └───────────┴──────▶ failed
//! ```
//!
//! `pending → failed` exists for cancellation and dispatch failures. There is
//! no edge out of `completed` or `failed`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Unique identifier for one agent run within one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    /// Generate a fresh id scoped to an evaluation and agent.
    pub fn generate(evaluation_id: &str, agent_name: &str) -> Self {
        ExecutionId(format!(
            "{}-{}-{}",
            evaluation_id,
            agent_name,
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        ExecutionId(s.to_string())
    }
}

/// Status of an execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Running,
    Completed {
        result: serde_json::Value,
        duration_ms: u64,
    },
    Failed {
        error: String,
    },
    /// Terminal failure caused by evaluation cancellation.
    Cancelled {
        reason: String,
    },
}

impl Transition {
    pub fn target(&self) -> ExecutionStatus {
        match self {
            Transition::Running => ExecutionStatus::Running,
            Transition::Completed { .. } => ExecutionStatus::Completed,
            Transition::Failed { .. } | Transition::Cancelled { .. } => ExecutionStatus::Failed,
        }
    }
}

/// Durable status object tracking one agent run within one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub evaluation_id: String,
    pub agent_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Serialized agent output (present only when completed)
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    /// Set when the terminal failure came from a cancellation.
    #[serde(default)]
    pub cancelled: bool,
}

impl ExecutionRecord {
    /// A fresh `pending` record.
    pub fn pending(id: ExecutionId, evaluation_id: &str, agent_name: &str) -> Self {
        Self {
            id,
            evaluation_id: evaluation_id.to_string(),
            agent_name: agent_name.to_string(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error_message: None,
            duration_ms: None,
            cancelled: false,
        }
    }

    /// A record that is already `running`, for callers that create and
    /// start it in one write.
    pub fn running(id: ExecutionId, evaluation_id: &str, agent_name: &str) -> Self {
        Self {
            status: ExecutionStatus::Running,
            ..Self::pending(id, evaluation_id, agent_name)
        }
    }

    /// Apply a transition in place, enforcing the state machine.
    ///
    /// On error the record is left untouched.
    pub fn apply(&mut self, transition: Transition) -> StorageResult<()> {
        let next = transition.target();
        if !self.status.can_transition_to(next) {
            return Err(StorageError::InvalidTransition {
                execution_id: self.id.0.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match transition {
            Transition::Running => {
                // Actual start time, not enqueue time
                self.started_at = now;
            }
            Transition::Completed {
                result,
                duration_ms,
            } => {
                self.result = Some(result);
                self.duration_ms = Some(duration_ms);
                self.completed_at = Some(now);
            }
            Transition::Failed { error } => {
                self.error_message = Some(error);
                self.completed_at = Some(now);
            }
            Transition::Cancelled { reason } => {
                self.error_message = Some(reason);
                self.cancelled = true;
                self.completed_at = Some(now);
            }
        }
        self.status = next;
        Ok(())
    }
}

/// Execution record store.
///
/// Guarantees:
/// - `insert` rejects an id that already exists.
/// - `transition` is a compare-and-set against the state machine; a
///   terminal record is never modified.
/// - Reads may lag writes on eventually-consistent backends; callers that
///   need confirmation must re-read (see the tracker in `adi-core`).
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new record.
    async fn insert(&self, record: ExecutionRecord) -> StorageResult<()>;

    /// Move a record along the state machine, returning the updated record.
    async fn transition(
        &self,
        id: &ExecutionId,
        transition: Transition,
    ) -> StorageResult<ExecutionRecord>;

    /// Read a record. `None` if it does not exist (or is not yet visible).
    async fn get(&self, id: &ExecutionId) -> StorageResult<Option<ExecutionRecord>>;

    /// All records for an evaluation, oldest first.
    async fn list_by_evaluation(&self, evaluation_id: &str)
        -> StorageResult<Vec<ExecutionRecord>>;
}
