//! ADI worker service.
//!
//! Exposes the slow-agent dispatch endpoint over HTTP. Every accepted job
//! goes through the in-process [`WorkQueue`], so the concurrency cap and
//! priority ordering hold no matter how many requests arrive at once.
//!
//! Routes:
//! - `POST /agents`: run one agent (dispatch request in, dispatch response out)
//! - `GET /queue`: queue metrics
//! - `GET /evaluations/{id}`: evaluation status from the execution records
//! - `DELETE /evaluations/{id}`: cancel an evaluation
//! - `GET /health`

use std::sync::Arc;

use adi_core::orchestrator::OrchestratorError;
use adi_core::{
    AgentDeps, AgentKind, DispatchRequest, DispatchResponse, EvaluationStatus, ExecutionContract,
    ExecutionTracker, OrchestratorConfig, QueueConfig, QueueMetrics, TrackerError, WorkQueue,
    WorkerError, WorkerRuntime, CANCELLED,
};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Service Unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Worker(err) => {
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::Tracker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(%status, error = %self, "request failed");
        }
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Shared handler state.
#[derive(Clone)]
pub struct WorkerState {
    queue: WorkQueue,
    tracker: ExecutionTracker,
}

impl WorkerState {
    pub fn new(queue: WorkQueue, tracker: ExecutionTracker) -> Self {
        Self { queue, tracker }
    }

    /// Runtime and queue wired from configuration. Must be called inside a
    /// tokio runtime.
    pub fn from_config(config: &OrchestratorConfig, deps: AgentDeps, tracker: ExecutionTracker) -> Self {
        let runtime = WorkerRuntime::new(deps, tracker.clone(), ExecutionContract::default());
        let queue = WorkQueue::new(QueueConfig::from(config), Arc::new(runtime), tracker.clone());
        Self::new(queue, tracker)
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }
}

pub fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/agents", post(dispatch_agent))
        .route("/queue", get(queue_metrics))
        .route("/evaluations/{id}", get(evaluation_status).delete(cancel_evaluation))
        .route("/health", get(health))
        .with_state(state)
}

async fn dispatch_agent(
    State(state): State<WorkerState>,
    payload: Result<Json<DispatchRequest>, JsonRejection>,
) -> ApiResult<Json<DispatchResponse>> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    request.validate()?;

    if state.tracker.get_execution(&request.execution_id).await?.is_none() {
        return Err(ApiError::BadRequest(format!(
            "no execution record {}",
            request.execution_id
        )));
    }

    let kind = match AgentKind::from_name(&request.agent_name) {
        Ok(kind) => kind,
        Err(err) => {
            // Nobody else will ever settle this record
            state.tracker.fail_execution(&request.execution_id, &err.to_string()).await?;
            return Err(WorkerError::UnknownAgent(err).into());
        }
    };
    let priority = request.priority.unwrap_or(kind.config().priority);

    let reply = match state.queue.submit(request.clone(), priority) {
        Ok(reply) => reply,
        Err(OrchestratorError::Cancelled(_)) => {
            return Ok(Json(DispatchResponse::failure(&request, CANCELLED, 0)));
        }
        Err(err) => {
            state.tracker.fail_execution(&request.execution_id, &err.to_string()).await?;
            return Err(ApiError::Unavailable(err.to_string()));
        }
    };

    match reply.await {
        Ok(response) => {
            info!(
                agent = %response.agent_name,
                success = response.success,
                execution_time = response.execution_time,
                "agent dispatch finished"
            );
            Ok(Json(response))
        }
        // Sender dropped: the job was removed from the queue by cancellation
        Err(_) => Ok(Json(DispatchResponse::failure(&request, CANCELLED, 0))),
    }
}

async fn queue_metrics(State(state): State<WorkerState>) -> Json<QueueMetrics> {
    Json(state.queue.metrics())
}

async fn evaluation_status(
    State(state): State<WorkerState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EvaluationStatus>> {
    let records = state.tracker.get_evaluation_executions(&id).await?;
    if records.is_empty() {
        return Err(ApiError::NotFound(format!("evaluation {id}")));
    }
    Ok(Json(EvaluationStatus::from_records(
        &id,
        &records,
        state.queue.is_cancelled(&id),
        Some(state.queue.metrics()),
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReply {
    pub dropped: usize,
    pub records_cancelled: usize,
}

async fn cancel_evaluation(
    State(state): State<WorkerState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelReply>> {
    let dropped = state.queue.cancel_evaluation(&id);
    let records_cancelled = state.tracker.cancel_evaluation(&id).await?;
    adi_core::obs::emit_evaluation_cancelled(&id, records_cancelled, dropped);
    Ok(Json(CancelReply {
        dropped,
        records_cancelled,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
