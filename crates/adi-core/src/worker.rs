//! Slow-agent worker: wire protocol and the runtime that executes one
//! dispatched agent under the contract, tracker and finally-guard.

use std::time::Instant;

use adi_state::{ExecutionId, ExecutionStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::agents::{create_agent, AgentDeps, AgentKind};
use crate::contract::{elapsed_ms, ExecutionContract};
use crate::domain::{AgentError, AgentInput, AgentOutput, AgentStatus, PriorityClass};
use crate::orchestrator::JobRunner;
use crate::tracker::{ExecutionTracker, TrackerError, WriteOutcome, CANCELLED};

/// Body of `POST /agents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub agent_name: String,
    pub input: AgentInput,
    pub evaluation_id: String,
    pub execution_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<PriorityClass>,
}

impl DispatchRequest {
    pub fn new(agent_name: impl Into<String>, input: AgentInput, execution_id: ExecutionId) -> Self {
        Self {
            agent_name: agent_name.into(),
            evaluation_id: input.context.evaluation_id.clone(),
            input,
            execution_id,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Field checks that map to `400 Bad Request`.
    pub fn validate(&self) -> Result<(), WorkerError> {
        let missing = [
            ("agentName", self.agent_name.trim().is_empty()),
            ("evaluationId", self.evaluation_id.trim().is_empty()),
            ("executionId", self.execution_id.as_str().trim().is_empty()),
        ];
        if let Some((field, _)) = missing.iter().find(|(_, empty)| *empty) {
            return Err(WorkerError::InvalidRequest(format!("{field} is required")));
        }
        if self.input.context.evaluation_id != self.evaluation_id {
            return Err(WorkerError::InvalidRequest(
                "input.context.evaluationId does not match evaluationId".to_string(),
            ));
        }
        Ok(())
    }
}

/// Response of `POST /agents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub success: bool,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentOutput>,
    pub execution_time: u64,
    pub evaluation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchResponse {
    pub fn failure(request: &DispatchRequest, error: impl Into<String>, execution_time: u64) -> Self {
        Self {
            success: false,
            agent_name: request.agent_name.clone(),
            result: None,
            execution_time,
            evaluation_id: request.evaluation_id.clone(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    UnknownAgent(AgentError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

impl WorkerError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            WorkerError::InvalidRequest(_) | WorkerError::UnknownAgent(_) => 400,
            WorkerError::Tracker(TrackerError::NotFound(_)) => 400,
            WorkerError::Tracker(_) => 500,
        }
    }
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// Executes dispatched agents in this process.
#[derive(Clone)]
pub struct WorkerRuntime {
    deps: AgentDeps,
    tracker: ExecutionTracker,
    contract: ExecutionContract,
}

impl WorkerRuntime {
    pub fn new(deps: AgentDeps, tracker: ExecutionTracker, contract: ExecutionContract) -> Self {
        Self {
            deps,
            tracker,
            contract,
        }
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    /// Run one agent end to end.
    ///
    /// The record is moved to running, the agent runs under the contract, and
    /// the terminal state is written and verified. A record that is already
    /// terminal at pickup (cancelled) is not executed. Agent failures are a
    /// normal response with `success = false`; only tracker failures and bad
    /// requests are errors.
    #[instrument(skip(self, request), fields(agent = %request.agent_name, execution_id = %request.execution_id))]
    pub async fn handle(&self, request: DispatchRequest) -> WorkerResult<DispatchResponse> {
        request.validate()?;
        let started = Instant::now();

        let kind = match AgentKind::from_name(&request.agent_name) {
            Ok(kind) => kind,
            Err(err) => {
                if let Err(write_err) = self
                    .tracker
                    .fail_execution(&request.execution_id, &err.to_string())
                    .await
                {
                    warn!(error = %write_err, "could not fail record for unknown agent");
                }
                return Err(WorkerError::UnknownAgent(err));
            }
        };
        let agent = create_agent(kind, &self.deps).as_agent();
        let contract = self.contract.clone();

        // Slow dependencies finish after dispatch; pick up their outputs now
        let mut input = request.input.clone();
        if !kind.config().dependencies.is_empty() {
            for (name, output) in self.tracker.get_completed_results(&request.evaluation_id).await? {
                input.previous_results.entry(name).or_insert(output);
            }
        }
        let input = &input;

        let settled = self
            .tracker
            .run_guarded(request.execution_id.clone(), |guard| async move {
                if let WriteOutcome::AlreadyTerminal(status) = guard.mark_running().await? {
                    return Ok::<_, TrackerError>(Settled::Skipped(status));
                }
                let output = contract.run(agent.as_ref(), input, None).await;
                let duration = elapsed_ms(started);
                let record = match output.status {
                    AgentStatus::Completed | AgentStatus::Skipped => {
                        guard.complete_verified(&output, duration).await?
                    }
                    AgentStatus::Failed => {
                        let message = output
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "agent failed".to_string());
                        guard.fail_verified(&message).await?
                    }
                };
                Ok::<_, TrackerError>(Settled::Ran {
                    output,
                    record_status: record.status,
                    record_error: record.error_message,
                })
            })
            .await??;

        let execution_time = elapsed_ms(started);
        let response = match settled {
            Settled::Skipped(status) => {
                info!(%status, "record already terminal at pickup; not executed");
                DispatchResponse::failure(&request, CANCELLED, execution_time)
            }
            Settled::Ran {
                output,
                record_status,
                record_error,
            } => {
                // A cancellation that landed mid-run wins over the output
                let success = output.status != AgentStatus::Failed
                    && record_status == ExecutionStatus::Completed;
                DispatchResponse {
                    success,
                    agent_name: request.agent_name.clone(),
                    error: if success {
                        None
                    } else {
                        record_error.or_else(|| output.error_message.clone())
                    },
                    result: Some(output),
                    execution_time,
                    evaluation_id: request.evaluation_id.clone(),
                }
            }
        };
        Ok(response)
    }
}

enum Settled {
    Skipped(ExecutionStatus),
    Ran {
        output: AgentOutput,
        record_status: ExecutionStatus,
        record_error: Option<String>,
    },
}

#[async_trait]
impl JobRunner for WorkerRuntime {
    async fn run(&self, request: DispatchRequest) -> DispatchResponse {
        let started = Instant::now();
        match self.handle(request.clone()).await {
            Ok(response) => response,
            Err(err) => {
                warn!(agent = %request.agent_name, error = %err, "dispatched job failed");
                DispatchResponse::failure(&request, err.to_string(), elapsed_ms(started))
            }
        }
    }
}
