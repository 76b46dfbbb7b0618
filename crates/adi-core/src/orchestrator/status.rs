//! Evaluation status assembled from execution records.

use adi_state::{ExecutionRecord, ExecutionStatus};
use serde::{Deserialize, Serialize};

use super::queue::QueueMetrics;
use crate::domain::AgentOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OverallStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, OverallStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Running => "running",
            OverallStatus::Completed => "completed",
            OverallStatus::Failed => "failed",
            OverallStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusEntry {
    pub agent_name: String,
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fallback tier that served a completed output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub cancelled: bool,
}

impl From<&ExecutionRecord> for AgentStatusEntry {
    fn from(record: &ExecutionRecord) -> Self {
        let output = record
            .result
            .clone()
            .and_then(|v| serde_json::from_value::<AgentOutput>(v).ok());
        Self {
            agent_name: record.agent_name.clone(),
            execution_id: record.id.0.clone(),
            status: record.status,
            duration_ms: record.duration_ms,
            error: record.error_message.clone(),
            tier: output.as_ref().and_then(|o| o.tier().map(str::to_string)),
            degraded: output.as_ref().is_some_and(AgentOutput::is_degraded),
            cancelled: record.cancelled,
        }
    }
}

/// Snapshot returned by status polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationStatus {
    pub evaluation_id: String,
    pub overall_status: OverallStatus,
    /// Terminal records / total records, in `0.0..=1.0`.
    pub progress: f64,
    pub total_agents: usize,
    pub completed_agents: usize,
    pub running_agents: usize,
    pub pending_agents: usize,
    pub failed_agents: usize,
    pub fast_agents_completed: usize,
    pub agents: Vec<AgentStatusEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueMetrics>,
}

impl EvaluationStatus {
    /// Build from the evaluation's records. `cancelled` forces the overall
    /// status once every record is terminal.
    pub fn from_records(
        evaluation_id: &str,
        records: &[ExecutionRecord],
        cancelled: bool,
        queue: Option<QueueMetrics>,
    ) -> Self {
        let count = |s: ExecutionStatus| records.iter().filter(|r| r.status == s).count();
        let total = records.len();
        let completed = count(ExecutionStatus::Completed);
        let failed = count(ExecutionStatus::Failed);
        let terminal = completed + failed;
        let cancelled = cancelled || records.iter().any(|r| r.cancelled);

        let overall = if total > 0 && terminal < total {
            OverallStatus::Running
        } else if cancelled {
            OverallStatus::Cancelled
        } else if total > 0 && completed == 0 {
            OverallStatus::Failed
        } else if total > 0 {
            OverallStatus::Completed
        } else {
            OverallStatus::Running
        };

        Self {
            evaluation_id: evaluation_id.to_string(),
            overall_status: overall,
            progress: if total == 0 {
                0.0
            } else {
                terminal as f64 / total as f64
            },
            total_agents: total,
            completed_agents: completed,
            running_agents: count(ExecutionStatus::Running),
            pending_agents: count(ExecutionStatus::Pending),
            failed_agents: failed,
            fast_agents_completed: 0,
            agents: records.iter().map(AgentStatusEntry::from).collect(),
            queue,
        }
    }

    pub fn with_fast_agents(mut self, completed: usize) -> Self {
        self.fast_agents_completed = completed;
        self
    }
}
