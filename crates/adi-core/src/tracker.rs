//! Execution tracker over an [`ExecutionStore`].
//!
//! Terminal writes are idempotent: writing to a record that is already
//! completed or failed returns [`WriteOutcome::AlreadyTerminal`] and leaves it
//! untouched. Callers that need durable visibility use the `*_verified`
//! operations, which re-read with a bounded number of attempts and report
//! [`TrackerError::Persistence`] if the write never shows up.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adi_state::{
    ExecutionId, ExecutionRecord, ExecutionStatus, ExecutionStore, StorageError, Transition,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::domain::{AgentOutput, ErrorClass};
use crate::metrics::METRICS;
use crate::obs;

/// Message written by the finally-guard when no terminal state was recorded.
pub const UNHANDLED_EXIT: &str = "unhandled exit";

/// Error message recorded for cancelled executions.
pub const CANCELLED: &str = "Evaluation cancelled";

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("write to {execution_id} not visible after {attempts} verification reads")]
    Persistence { execution_id: String, attempts: u32 },

    #[error("execution not found: {0}")]
    NotFound(String),

    #[error("execution {execution_id} aborted: {message}")]
    Aborted {
        execution_id: String,
        message: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TrackerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TrackerError::Persistence { .. } | TrackerError::Storage(_) => ErrorClass::Persistence,
            TrackerError::NotFound(_) | TrackerError::Aborted { .. } => ErrorClass::Unknown,
        }
    }
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Result of a state write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Applied(ExecutionRecord),
    /// The record was already terminal; nothing changed.
    AlreadyTerminal(ExecutionStatus),
}

impl WriteOutcome {
    pub fn was_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied(_))
    }
}

/// Bounded read-after-write verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSummary {
    /// Every expected agent reached `completed`.
    pub all_completed: bool,
    /// Every expected agent reached a terminal state.
    pub all_terminal: bool,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub outstanding: Vec<String>,
}

#[derive(Clone)]
pub struct ExecutionTracker {
    store: Arc<dyn ExecutionStore>,
    verify: VerifyPolicy,
}

impl std::fmt::Debug for ExecutionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTracker")
            .field("verify", &self.verify)
            .finish_non_exhaustive()
    }
}

impl ExecutionTracker {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self::with_policy(store, VerifyPolicy::default())
    }

    pub fn with_policy(store: Arc<dyn ExecutionStore>, verify: VerifyPolicy) -> Self {
        Self { store, verify }
    }

    pub fn verify_policy(&self) -> VerifyPolicy {
        self.verify
    }

    /// Create a pending record and return its id.
    #[instrument(skip(self))]
    pub async fn start_execution(
        &self,
        evaluation_id: &str,
        agent_name: &str,
    ) -> TrackerResult<ExecutionId> {
        let id = ExecutionId::generate(evaluation_id, agent_name);
        self.store
            .insert(ExecutionRecord::pending(id.clone(), evaluation_id, agent_name))
            .await?;
        debug!(execution_id = %id, "execution record created");
        Ok(id)
    }

    /// Create a record that is already running, in a single write.
    #[instrument(skip(self))]
    pub async fn start_running(
        &self,
        evaluation_id: &str,
        agent_name: &str,
    ) -> TrackerResult<ExecutionId> {
        let id = ExecutionId::generate(evaluation_id, agent_name);
        self.store
            .insert(ExecutionRecord::running(id.clone(), evaluation_id, agent_name))
            .await?;
        debug!(execution_id = %id, "execution record created running");
        Ok(id)
    }

    pub async fn mark_running(&self, id: &ExecutionId) -> TrackerResult<WriteOutcome> {
        self.write(id, Transition::Running).await
    }

    /// Record a completed output. A record still pending is moved through
    /// running first.
    pub async fn complete_execution(
        &self,
        id: &ExecutionId,
        output: &AgentOutput,
        duration_ms: u64,
    ) -> TrackerResult<WriteOutcome> {
        let result = serde_json::to_value(output).map_err(StorageError::from)?;
        let completed = Transition::Completed {
            result: result.clone(),
            duration_ms,
        };
        match self.store.transition(id, completed).await {
            Ok(record) => Ok(WriteOutcome::Applied(record)),
            Err(StorageError::InvalidTransition { ref from, .. }) if from == "pending" => {
                self.write(id, Transition::Running).await?;
                self.write(
                    id,
                    Transition::Completed {
                        result,
                        duration_ms,
                    },
                )
                .await
            }
            Err(err) => Self::absorb_terminal(id, err),
        }
    }

    pub async fn fail_execution(
        &self,
        id: &ExecutionId,
        error_message: &str,
    ) -> TrackerResult<WriteOutcome> {
        self.write(
            id,
            Transition::Failed {
                error: error_message.to_string(),
            },
        )
        .await
    }

    pub async fn cancel_execution(
        &self,
        id: &ExecutionId,
        reason: &str,
    ) -> TrackerResult<WriteOutcome> {
        self.write(
            id,
            Transition::Cancelled {
                reason: reason.to_string(),
            },
        )
        .await
    }

    pub async fn get_execution(&self, id: &ExecutionId) -> TrackerResult<Option<ExecutionRecord>> {
        Ok(self.store.get(id).await?)
    }

    /// Re-read until the record shows `expected`, up to the verify budget.
    pub async fn get_execution_verified(
        &self,
        id: &ExecutionId,
        expected: ExecutionStatus,
    ) -> TrackerResult<ExecutionRecord> {
        let attempts = self.verify.attempts.max(1);
        for attempt in 1..=attempts {
            match self.store.get(id).await? {
                Some(record) if record.status == expected => return Ok(record),
                // Someone else's terminal write won; that is still durable
                Some(record) if expected.is_terminal() && record.status.is_terminal() => {
                    return Ok(record)
                }
                seen => {
                    debug!(
                        execution_id = %id,
                        attempt,
                        seen = seen.as_ref().map(|r| r.status.as_str()).unwrap_or("absent"),
                        expected = expected.as_str(),
                        "write not yet visible"
                    );
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.verify.delay).await;
            }
        }

        let err = TrackerError::Persistence {
            execution_id: id.0.clone(),
            attempts,
        };
        METRICS.inc_persistence_errors();
        obs::emit_persistence_error(id.as_str(), &err);
        Err(err)
    }

    /// `complete_execution` followed by verification.
    pub async fn complete_verified(
        &self,
        id: &ExecutionId,
        output: &AgentOutput,
        duration_ms: u64,
    ) -> TrackerResult<ExecutionRecord> {
        self.complete_execution(id, output, duration_ms).await?;
        self.get_execution_verified(id, ExecutionStatus::Completed)
            .await
    }

    /// `fail_execution` followed by verification.
    pub async fn fail_verified(
        &self,
        id: &ExecutionId,
        error_message: &str,
    ) -> TrackerResult<ExecutionRecord> {
        self.fail_execution(id, error_message).await?;
        self.get_execution_verified(id, ExecutionStatus::Failed).await
    }

    pub async fn get_evaluation_executions(
        &self,
        evaluation_id: &str,
    ) -> TrackerResult<Vec<ExecutionRecord>> {
        Ok(self.store.list_by_evaluation(evaluation_id).await?)
    }

    /// Cancel every non-terminal record of an evaluation. Returns how many
    /// records this call moved.
    pub async fn cancel_evaluation(&self, evaluation_id: &str) -> TrackerResult<usize> {
        let mut cancelled = 0;
        for record in self.get_evaluation_executions(evaluation_id).await? {
            if record.status.is_terminal() {
                continue;
            }
            if self.cancel_execution(&record.id, CANCELLED).await?.was_applied() {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub async fn are_all_agents_complete(
        &self,
        evaluation_id: &str,
        expected_agents: &[String],
    ) -> TrackerResult<CompletionSummary> {
        let records = self.get_evaluation_executions(evaluation_id).await?;
        let mut summary = CompletionSummary::default();
        for agent in expected_agents {
            // Latest record wins if an agent was re-run
            let status = records
                .iter()
                .rev()
                .find(|r| &r.agent_name == agent)
                .map(|r| r.status);
            match status {
                Some(ExecutionStatus::Completed) => summary.completed.push(agent.clone()),
                Some(ExecutionStatus::Failed) => summary.failed.push(agent.clone()),
                _ => summary.outstanding.push(agent.clone()),
            }
        }
        summary.all_terminal = summary.outstanding.is_empty();
        summary.all_completed = summary.all_terminal && summary.failed.is_empty();
        Ok(summary)
    }

    /// Outputs of completed records keyed by agent name.
    pub async fn get_completed_results(
        &self,
        evaluation_id: &str,
    ) -> TrackerResult<BTreeMap<String, AgentOutput>> {
        let mut out = BTreeMap::new();
        for record in self.get_evaluation_executions(evaluation_id).await? {
            if record.status != ExecutionStatus::Completed {
                continue;
            }
            let Some(value) = record.result else {
                continue;
            };
            match serde_json::from_value::<AgentOutput>(value) {
                Ok(output) => {
                    out.insert(record.agent_name, output);
                }
                Err(err) => {
                    warn!(execution_id = %record.id, error = %err, "stored result is not an agent output");
                }
            }
        }
        Ok(out)
    }

    pub fn guard(&self, id: ExecutionId) -> ExecutionGuard {
        ExecutionGuard {
            tracker: self.clone(),
            id,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run `body` under a finally-guard. If it returns or panics without a
    /// terminal write through its [`GuardHandle`], the record is failed with
    /// [`UNHANDLED_EXIT`].
    pub async fn run_guarded<F, Fut, T>(&self, id: ExecutionId, body: F) -> TrackerResult<T>
    where
        F: FnOnce(GuardHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.guard(id.clone());
        let outcome = AssertUnwindSafe(body(guard.handle()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(value) => {
                guard.finish().await?;
                Ok(value)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                error!(execution_id = %id, %message, "agent execution panicked");
                guard.finish_with(&format!("{UNHANDLED_EXIT}: {message}")).await?;
                Err(TrackerError::Aborted {
                    execution_id: id.0,
                    message,
                })
            }
        }
    }

    async fn write(&self, id: &ExecutionId, transition: Transition) -> TrackerResult<WriteOutcome> {
        match self.store.transition(id, transition).await {
            Ok(record) => Ok(WriteOutcome::Applied(record)),
            Err(err) => Self::absorb_terminal(id, err),
        }
    }

    fn absorb_terminal(id: &ExecutionId, err: StorageError) -> TrackerResult<WriteOutcome> {
        match err {
            StorageError::InvalidTransition { ref from, ref to, .. } if err.is_terminal_conflict() => {
                debug!(execution_id = %id, %from, %to, "ignoring write to terminal record");
                let status = ExecutionStatus::parse(from).unwrap_or(ExecutionStatus::Failed);
                Ok(WriteOutcome::AlreadyTerminal(status))
            }
            StorageError::NotFound { execution_id } => Err(TrackerError::NotFound(execution_id)),
            other => Err(TrackerError::Storage(other)),
        }
    }
}

/// Cloneable handle given to guarded code; terminal writes through it
/// settle the guard.
#[derive(Debug, Clone)]
pub struct GuardHandle {
    tracker: ExecutionTracker,
    id: ExecutionId,
    settled: Arc<AtomicBool>,
}

impl GuardHandle {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.id
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Move to running. `AlreadyTerminal` means the record was cancelled
    /// before pickup and also settles the guard.
    pub async fn mark_running(&self) -> TrackerResult<WriteOutcome> {
        let outcome = self.tracker.mark_running(&self.id).await?;
        if !outcome.was_applied() {
            self.settled.store(true, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    pub async fn complete(&self, output: &AgentOutput, duration_ms: u64) -> TrackerResult<WriteOutcome> {
        let outcome = self
            .tracker
            .complete_execution(&self.id, output, duration_ms)
            .await?;
        self.settled.store(true, Ordering::SeqCst);
        Ok(outcome)
    }

    pub async fn complete_verified(
        &self,
        output: &AgentOutput,
        duration_ms: u64,
    ) -> TrackerResult<ExecutionRecord> {
        self.complete(output, duration_ms).await?;
        self.tracker
            .get_execution_verified(&self.id, ExecutionStatus::Completed)
            .await
    }

    pub async fn fail(&self, error_message: &str) -> TrackerResult<WriteOutcome> {
        let outcome = self.tracker.fail_execution(&self.id, error_message).await?;
        self.settled.store(true, Ordering::SeqCst);
        Ok(outcome)
    }

    pub async fn fail_verified(&self, error_message: &str) -> TrackerResult<ExecutionRecord> {
        self.fail(error_message).await?;
        self.tracker
            .get_execution_verified(&self.id, ExecutionStatus::Failed)
            .await
    }
}

/// Finally-guard for one execution.
///
/// Prefer [`ExecutionTracker::run_guarded`]. If a guard is dropped unsettled
/// (the owning future was cancelled), the failure write is spawned onto the
/// current runtime.
pub struct ExecutionGuard {
    tracker: ExecutionTracker,
    id: ExecutionId,
    settled: Arc<AtomicBool>,
}

impl ExecutionGuard {
    pub fn handle(&self) -> GuardHandle {
        GuardHandle {
            tracker: self.tracker.clone(),
            id: self.id.clone(),
            settled: self.settled.clone(),
        }
    }

    /// Settle the guard. Returns `true` if the sentinel failure was written.
    pub async fn finish(self) -> TrackerResult<bool> {
        self.finish_with(UNHANDLED_EXIT).await
    }

    pub async fn finish_with(self, message: &str) -> TrackerResult<bool> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        warn!(execution_id = %self.id, %message, "no terminal state written, forcing failure");
        let outcome = self.tracker.fail_execution(&self.id, message).await?;
        Ok(outcome.was_applied())
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        let tracker = self.tracker.clone();
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(execution_id = %id, "execution guard dropped unsettled");
                handle.spawn(async move {
                    if let Err(err) = tracker.fail_execution(&id, UNHANDLED_EXIT).await {
                        error!(execution_id = %id, error = %err, "guard failure write failed");
                    }
                });
            }
            Err(_) => {
                error!(execution_id = %id, "execution guard dropped outside a runtime; record may stay running");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adi_state::MemoryExecutionStore;

    fn tracker() -> ExecutionTracker {
        ExecutionTracker::new(Arc::new(MemoryExecutionStore::new()))
    }

    fn output(agent: &str) -> AgentOutput {
        AgentOutput::completed(
            agent,
            vec![crate::domain::scoring::create_result("x", 1.0, 50.0, 0.5, Default::default())],
        )
    }

    #[tokio::test]
    async fn test_lifecycle_and_completed_results() {
        let t = tracker();
        let id = t.start_running("eval-1", "sentiment_agent").await.unwrap();
        let outcome = t
            .complete_execution(&id, &output("sentiment_agent"), 12)
            .await
            .unwrap();
        assert!(outcome.was_applied());

        let results = t.get_completed_results("eval-1").await.unwrap();
        assert_eq!(results["sentiment_agent"].agent_name, "sentiment_agent");
    }

    #[tokio::test]
    async fn test_complete_from_pending_passes_through_running() {
        let t = tracker();
        let id = t.start_execution("eval-1", "commerce_agent").await.unwrap();
        t.complete_execution(&id, &output("commerce_agent"), 3)
            .await
            .unwrap();
        let rec = t.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_write_is_a_no_op() {
        let t = tracker();
        let id = t.start_running("eval-1", "citation_agent").await.unwrap();
        t.fail_execution(&id, "boom").await.unwrap();

        let outcome = t
            .complete_execution(&id, &output("citation_agent"), 5)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::AlreadyTerminal(ExecutionStatus::Failed));

        let rec = t.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, ExecutionStatus::Failed);
        assert_eq!(rec.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let t = tracker();
        let err = t
            .mark_running(&ExecutionId::from("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_completion_summary() {
        let t = tracker();
        let a = t.start_running("eval-2", "a").await.unwrap();
        let b = t.start_running("eval-2", "b").await.unwrap();
        t.start_execution("eval-2", "c").await.unwrap();
        t.complete_execution(&a, &output("a"), 1).await.unwrap();
        t.fail_execution(&b, "down").await.unwrap();

        let expected = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let summary = t.are_all_agents_complete("eval-2", &expected).await.unwrap();
        assert_eq!(summary.completed, vec!["a"]);
        assert_eq!(summary.failed, vec!["b"]);
        assert_eq!(summary.outstanding, vec!["c"]);
        assert!(!summary.all_terminal);
        assert!(!summary.all_completed);
    }

    #[tokio::test]
    async fn test_guard_finish_fails_unsettled_record() {
        let t = tracker();
        let id = t.start_running("eval-3", "llm_test_agent").await.unwrap();
        let guard = t.guard(id.clone());
        assert!(guard.finish().await.unwrap());

        let rec = t.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, ExecutionStatus::Failed);
        assert_eq!(rec.error_message.as_deref(), Some(UNHANDLED_EXIT));
    }

    /// Counts writes on top of the in-memory store.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryExecutionStore,
        inserts: std::sync::atomic::AtomicUsize,
        transitions: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ExecutionStore for CountingStore {
        async fn insert(&self, record: ExecutionRecord) -> adi_state::StorageResult<()> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.inner.insert(record).await
        }

        async fn transition(
            &self,
            id: &ExecutionId,
            transition: Transition,
        ) -> adi_state::StorageResult<ExecutionRecord> {
            self.transitions.fetch_add(1, Ordering::SeqCst);
            self.inner.transition(id, transition).await
        }

        async fn get(&self, id: &ExecutionId) -> adi_state::StorageResult<Option<ExecutionRecord>> {
            self.inner.get(id).await
        }

        async fn list_by_evaluation(
            &self,
            evaluation_id: &str,
        ) -> adi_state::StorageResult<Vec<ExecutionRecord>> {
            self.inner.list_by_evaluation(evaluation_id).await
        }
    }

    #[tokio::test]
    async fn test_start_running_is_a_single_write() {
        let store = Arc::new(CountingStore::default());
        let t = ExecutionTracker::new(store.clone());
        let id = t.start_running("eval-4", "commerce_agent").await.unwrap();

        assert_eq!(store.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(store.transitions.load(Ordering::SeqCst), 0);
        let rec = t.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, ExecutionStatus::Running);
    }
}
