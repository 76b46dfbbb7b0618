//! Slow-agent dispatch strategies.
//!
//! [`QueueDispatcher`] feeds the in-process [`WorkQueue`]; [`HttpDispatcher`]
//! posts to a remote worker (`adi-worker`) and fails the execution record
//! itself when the worker cannot be reached.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::queue::{QueueMetrics, WorkQueue};
use super::{OrchestratorError, OrchestratorResult};
use crate::domain::PriorityClass;
use crate::tracker::ExecutionTracker;
use crate::worker::{DispatchRequest, DispatchResponse};

#[async_trait]
pub trait SlowAgentDispatcher: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Hand a job off. Returns once it is accepted, not when it finishes.
    async fn dispatch(&self, request: DispatchRequest, priority: PriorityClass) -> OrchestratorResult<()>;

    /// Drop not-yet-started work for an evaluation. Returns the number of
    /// jobs dropped when known.
    async fn cancel(&self, evaluation_id: &str) -> OrchestratorResult<usize>;

    async fn metrics(&self) -> Option<QueueMetrics>;
}

#[derive(Debug, Clone)]
pub struct QueueDispatcher {
    queue: WorkQueue,
}

impl QueueDispatcher {
    pub fn new(queue: WorkQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }
}

#[async_trait]
impl SlowAgentDispatcher for QueueDispatcher {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn dispatch(&self, request: DispatchRequest, priority: PriorityClass) -> OrchestratorResult<()> {
        // Outcome is read back from the tracker, not from the reply channel
        self.queue.submit(request, priority).map(drop)
    }

    async fn cancel(&self, evaluation_id: &str) -> OrchestratorResult<usize> {
        Ok(self.queue.cancel_evaluation(evaluation_id))
    }

    async fn metrics(&self) -> Option<QueueMetrics> {
        Some(self.queue.metrics())
    }
}

#[derive(Deserialize)]
struct CancelReply {
    dropped: usize,
}

/// Dispatch to a remote worker over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    base_url: String,
    client: reqwest::Client,
    tracker: ExecutionTracker,
}

impl HttpDispatcher {
    pub fn new(base_url: impl Into<String>, tracker: ExecutionTracker) -> Self {
        Self::with_client(base_url, reqwest::Client::new(), tracker)
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client, tracker: ExecutionTracker) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            tracker,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl SlowAgentDispatcher for HttpDispatcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn dispatch(&self, request: DispatchRequest, priority: PriorityClass) -> OrchestratorResult<()> {
        let request = request.with_priority(priority);
        let client = self.client.clone();
        let url = self.url("/agents");
        let tracker = self.tracker.clone();

        // The worker answers when the agent finishes; do not wait for it here
        tokio::spawn(async move {
            let sent = client.post(&url).json(&request).send().await;
            let failure = match sent {
                Err(err) => Some(format!("worker unreachable: {err}")),
                Ok(resp) => {
                    let status = resp.status();
                    match resp.json::<DispatchResponse>().await {
                        Ok(body) => {
                            debug!(agent = %body.agent_name, success = body.success, "worker replied");
                            None
                        }
                        Err(_) if status.is_success() => None,
                        Err(err) => Some(format!("worker returned HTTP {status}: {err}")),
                    }
                }
            };
            if let Some(message) = failure {
                warn!(agent = %request.agent_name, execution_id = %request.execution_id, %message, "remote dispatch failed");
                // The worker may never have seen the record; fail it here
                if let Err(err) = tracker.fail_execution(&request.execution_id, &message).await {
                    warn!(execution_id = %request.execution_id, error = %err, "could not fail record after dispatch error");
                }
            }
        });
        Ok(())
    }

    async fn cancel(&self, evaluation_id: &str) -> OrchestratorResult<usize> {
        let resp = self
            .client
            .delete(self.url(&format!("/evaluations/{evaluation_id}")))
            .send()
            .await
            .map_err(|e| OrchestratorError::Dispatch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::Dispatch(format!(
                "worker cancel returned HTTP {}",
                resp.status()
            )));
        }
        Ok(resp.json::<CancelReply>().await.map(|r| r.dropped).unwrap_or(0))
    }

    async fn metrics(&self) -> Option<QueueMetrics> {
        let resp = self.client.get(self.url("/queue")).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<QueueMetrics>().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentInput, EvaluationContext};
    use adi_state::{ExecutionStatus, MemoryExecutionStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unreachable_worker_fails_the_record() {
        let tracker = ExecutionTracker::new(Arc::new(MemoryExecutionStore::new()));
        let id = tracker.start_execution("eval-1", "citation_agent").await.unwrap();
        // Port 9 (discard) on loopback refuses connections
        let dispatcher = HttpDispatcher::new("http://127.0.0.1:9/", tracker.clone());
        let request = DispatchRequest::new(
            "citation_agent",
            AgentInput::new(EvaluationContext::new("eval-1", "https://acme.test", "Acme")),
            id.clone(),
        );
        dispatcher.dispatch(request, PriorityClass::Medium).await.unwrap();

        let mut status = ExecutionStatus::Pending;
        for _ in 0..200 {
            status = tracker.get_execution(&id).await.unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(status, ExecutionStatus::Failed);
        assert!(dispatcher.metrics().await.is_none());
    }
}
