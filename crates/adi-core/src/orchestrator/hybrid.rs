//! Hybrid fast/slow evaluation orchestrator.
//!
//! An evaluation moves through
//! `queued -> fast-phase-running -> partial-results-available ->
//! slow-phase-dispatched -> completed | failed` (or `cancelled`).
//!
//! Fast agents run in-process, concurrently within each dependency wave,
//! under a shared wall-clock budget. Their outputs are returned immediately.
//! Slow agents get an execution record each and are handed to a
//! [`SlowAgentDispatcher`]; callers poll [`HybridOrchestrator::get_evaluation_status`]
//! until every record is terminal.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use adi_state::{ExecutionId, ExecutionStore};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::dispatcher::{HttpDispatcher, QueueDispatcher, SlowAgentDispatcher};
use super::queue::{QueueConfig, WorkQueue};
use super::status::EvaluationStatus;
use super::{OrchestratorError, OrchestratorResult};
use crate::agents::{create_agent, AgentDeps, AgentKind};
use crate::config::OrchestratorConfig;
use crate::contract::{elapsed_ms, CancelToken, ExecutionContract};
use crate::domain::{
    aggregate_scores, AgentInput, AgentOutput, AggregateScore, EvaluationContext, PriorityClass,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::tracker::ExecutionTracker;
use crate::worker::{DispatchRequest, WorkerRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvaluationPhase {
    Queued,
    FastPhaseRunning,
    PartialResultsAvailable,
    SlowPhaseDispatched,
    Completed,
    Failed,
    Cancelled,
}

impl EvaluationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EvaluationPhase::Completed | EvaluationPhase::Failed | EvaluationPhase::Cancelled
        )
    }
}

/// One slow agent as handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowAgentTicket {
    pub agent_name: String,
    pub execution_id: ExecutionId,
    pub priority: PriorityClass,
    pub dispatched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Returned by [`HybridOrchestrator::execute_evaluation`] as soon as the fast
/// phase is done.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialResults {
    pub evaluation_id: String,
    /// Always `"partial"`: slow agents are still outstanding.
    pub overall_status: &'static str,
    pub phase: EvaluationPhase,
    pub fast_results: BTreeMap<String, AgentOutput>,
    pub fast_phase_ms: u64,
    pub slow_agents: Vec<SlowAgentTicket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResults {
    pub evaluation_id: String,
    pub status: EvaluationStatus,
    pub results: BTreeMap<String, AgentOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateScore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSummary {
    pub records_cancelled: usize,
    pub jobs_dropped: usize,
}

struct EvaluationState {
    phase: EvaluationPhase,
    cancel: CancelToken,
    fast_results: BTreeMap<String, AgentOutput>,
}

impl EvaluationState {
    fn new() -> Self {
        Self {
            phase: EvaluationPhase::Queued,
            cancel: CancelToken::new(),
            fast_results: BTreeMap::new(),
        }
    }
}

/// Group `kinds` into waves; every dependency inside the set sits in an
/// earlier wave. Dependencies outside the set are ignored.
pub fn dependency_waves(kinds: &[AgentKind]) -> Vec<Vec<AgentKind>> {
    let mut remaining: Vec<AgentKind> = kinds.to_vec();
    let mut placed: Vec<&'static str> = Vec::new();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<AgentKind>, Vec<AgentKind>) =
            std::mem::take(&mut remaining).into_iter().partition(|kind| {
                kind.config().dependencies.iter().all(|dep| {
                    placed.iter().any(|p| p == dep) || !kinds.iter().any(|k| k.name() == *dep)
                })
            });
        if ready.is_empty() {
            // Cycle: run what is left together rather than never
            waves.push(blocked);
            break;
        }
        placed.extend(ready.iter().map(|k| k.name()));
        waves.push(ready);
        remaining = blocked;
    }
    waves
}

pub struct HybridOrchestrator {
    deps: AgentDeps,
    tracker: ExecutionTracker,
    contract: ExecutionContract,
    dispatcher: Arc<dyn SlowAgentDispatcher>,
    config: OrchestratorConfig,
    evaluations: Mutex<HashMap<String, EvaluationState>>,
}

impl std::fmt::Debug for HybridOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridOrchestrator")
            .field("dispatcher", &self.dispatcher.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HybridOrchestrator {
    pub fn new(
        deps: AgentDeps,
        tracker: ExecutionTracker,
        dispatcher: Arc<dyn SlowAgentDispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            deps,
            tracker,
            contract: ExecutionContract::default(),
            dispatcher,
            config,
            evaluations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_contract(mut self, contract: ExecutionContract) -> Self {
        self.contract = contract;
        self
    }

    /// Wire everything from configuration. Uses HTTP dispatch when
    /// `worker_url` is set, otherwise an in-process [`WorkQueue`].
    ///
    /// Must be called inside a tokio runtime (the queue spawns its scheduler).
    pub fn from_config(
        config: OrchestratorConfig,
        deps: AgentDeps,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let tracker = ExecutionTracker::with_policy(store, config.verify);
        let contract = ExecutionContract::default();
        let dispatcher: Arc<dyn SlowAgentDispatcher> = match &config.worker_url {
            Some(url) => Arc::new(HttpDispatcher::new(url.clone(), tracker.clone())),
            None => {
                let runtime = WorkerRuntime::new(deps.clone(), tracker.clone(), contract.clone());
                let queue = WorkQueue::new(QueueConfig::from(&config), Arc::new(runtime), tracker.clone());
                Arc::new(QueueDispatcher::new(queue))
            }
        };
        Self::new(deps, tracker, dispatcher, config).with_contract(contract)
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &Arc<dyn SlowAgentDispatcher> {
        &self.dispatcher
    }

    pub fn phase(&self, evaluation_id: &str) -> Option<EvaluationPhase> {
        self.lock().get(evaluation_id).map(|s| s.phase)
    }

    /// Fast-phase outputs kept for an evaluation.
    pub fn fast_results(&self, evaluation_id: &str) -> Option<BTreeMap<String, AgentOutput>> {
        self.lock().get(evaluation_id).map(|s| s.fast_results.clone())
    }

    /// Drop the in-memory state of a finished evaluation. Records stay in the store.
    pub fn forget(&self, evaluation_id: &str) {
        self.lock().remove(evaluation_id);
    }

    /// Run the fast phase, dispatch the slow phase, and return the fast
    /// results without waiting for slow agents.
    ///
    /// Fails only when the evaluation was cancelled beforehand or when a slow
    /// agent's execution record cannot be created.
    #[instrument(skip(self, ctx), fields(evaluation_id = %ctx.evaluation_id))]
    pub async fn execute_evaluation(&self, ctx: EvaluationContext) -> OrchestratorResult<PartialResults> {
        let evaluation_id = ctx.evaluation_id.clone();
        let cancel = self.begin(&evaluation_id)?;

        let fast: Vec<AgentKind> = AgentKind::fast().collect();
        let slow: Vec<AgentKind> = AgentKind::slow().collect();
        obs::emit_evaluation_started(&evaluation_id, fast.len(), slow.len());

        self.set_phase(&evaluation_id, EvaluationPhase::FastPhaseRunning);
        let started = Instant::now();
        let fast_results = self.run_fast_phase(&ctx, &fast, &cancel).await;
        let fast_phase_ms = elapsed_ms(started);

        let failed = fast_results.values().filter(|o| !o.is_completed()).count();
        obs::emit_fast_phase_finished(&evaluation_id, fast_phase_ms, fast_results.len() - failed, failed);
        if let Some(state) = self.lock().get_mut(&evaluation_id) {
            state.fast_results = fast_results.clone();
            if !state.phase.is_terminal() {
                state.phase = EvaluationPhase::PartialResultsAvailable;
            }
        }

        let slow_agents = match self.run_slow_phase(&ctx, &slow, &fast_results, &cancel).await {
            Ok(tickets) => tickets,
            Err(err) => {
                self.set_phase(&evaluation_id, EvaluationPhase::Failed);
                warn!(error = %err, "slow phase could not be recorded; evaluation failed");
                return Err(err);
            }
        };
        METRICS.flush();

        let phase = self.phase(&evaluation_id).unwrap_or(EvaluationPhase::SlowPhaseDispatched);
        Ok(PartialResults {
            evaluation_id,
            overall_status: "partial",
            phase,
            fast_results,
            fast_phase_ms,
            slow_agents,
        })
    }

    fn begin(&self, evaluation_id: &str) -> OrchestratorResult<CancelToken> {
        let mut evaluations = self.lock();
        let state = evaluations
            .entry(evaluation_id.to_string())
            .or_insert_with(EvaluationState::new);
        if state.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(evaluation_id.to_string()));
        }
        Ok(state.cancel.clone())
    }

    async fn run_fast_phase(
        &self,
        ctx: &EvaluationContext,
        kinds: &[AgentKind],
        cancel: &CancelToken,
    ) -> BTreeMap<String, AgentOutput> {
        let budget = self.config.fast_phase_budget;
        let deadline = Instant::now() + budget;
        let mut results = BTreeMap::new();

        for wave in dependency_waves(kinds) {
            let input = AgentInput::new(ctx.clone()).with_previous(results.clone());
            let remaining = deadline.saturating_duration_since(Instant::now());
            let runs = wave.into_iter().map(|kind| {
                let agent = create_agent(kind, &self.deps).as_agent();
                let input = &input;
                async move {
                    let run = self.contract.run(agent.as_ref(), input, Some(cancel));
                    let output = match tokio::time::timeout(remaining, run).await {
                        Ok(output) => output,
                        Err(_) => {
                            METRICS.inc_agents_failed();
                            AgentOutput::failed(
                                kind.name(),
                                format!("fast phase budget of {}ms exhausted", budget.as_millis()),
                            )
                        }
                    };
                    (kind, output)
                }
            });
            // One agent failing leaves the rest of the wave untouched
            for (kind, output) in join_all(runs).await {
                results.insert(kind.name().to_string(), output);
            }
        }
        results
    }

    async fn run_slow_phase(
        &self,
        ctx: &EvaluationContext,
        kinds: &[AgentKind],
        fast_results: &BTreeMap<String, AgentOutput>,
        cancel: &CancelToken,
    ) -> OrchestratorResult<Vec<SlowAgentTicket>> {
        let evaluation_id = ctx.evaluation_id.as_str();
        if cancel.is_cancelled() {
            info!("evaluation cancelled before slow phase; nothing dispatched");
            return Ok(Vec::new());
        }

        // Every record exists before anything runs, so status totals are stable
        let mut ids = HashMap::new();
        for kind in kinds {
            match self.tracker.start_execution(evaluation_id, kind.name()).await {
                Ok(id) => {
                    ids.insert(*kind, id);
                }
                Err(err) => {
                    self.abandon_records(ids.values(), &err.to_string()).await;
                    return Err(err.into());
                }
            }
        }

        let input = AgentInput::new(ctx.clone()).with_previous(fast_results.clone());
        let mut tickets = Vec::with_capacity(kinds.len());
        for kind in dependency_waves(kinds).into_iter().flatten() {
            let Some(execution_id) = ids.remove(&kind) else {
                continue;
            };
            let priority = PriorityClass::for_dispatch(kind.config().priority, ctx.tier, ctx.urgent);
            let mut ticket = SlowAgentTicket {
                agent_name: kind.name().to_string(),
                execution_id: execution_id.clone(),
                priority,
                dispatched: false,
                error: None,
            };

            if cancel.is_cancelled() {
                ticket.error = Some(crate::tracker::CANCELLED.to_string());
                tickets.push(ticket);
                continue;
            }

            let request = DispatchRequest::new(kind.name(), input.clone(), execution_id.clone())
                .with_priority(priority);
            match self.dispatcher.dispatch(request, priority).await {
                Ok(()) => {
                    METRICS.inc_dispatched();
                    obs::emit_job_dispatched(evaluation_id, kind.name(), priority.as_str(), self.dispatcher.name());
                    ticket.dispatched = true;
                }
                Err(err) => {
                    warn!(agent = kind.name(), error = %err, "slow agent dispatch failed");
                    let message = err.to_string();
                    self.tracker.fail_execution(&execution_id, &message).await?;
                    ticket.error = Some(message);
                }
            }
            tickets.push(ticket);
        }

        self.set_phase(evaluation_id, EvaluationPhase::SlowPhaseDispatched);
        Ok(tickets)
    }

    /// Fail records that were created for a slow phase that never started.
    /// Best effort: the store just refused a write.
    async fn abandon_records<'i>(&self, ids: impl Iterator<Item = &'i ExecutionId>, reason: &str) {
        let message = format!("slow phase aborted: {reason}");
        for id in ids {
            if let Err(err) = self.tracker.fail_execution(id, &message).await {
                warn!(execution_id = %id, error = %err, "could not fail abandoned record");
            }
        }
    }

    /// Progress and per-agent state read from the execution records, plus
    /// the dispatcher's queue metrics.
    #[instrument(skip(self))]
    pub async fn get_evaluation_status(&self, evaluation_id: &str) -> OrchestratorResult<EvaluationStatus> {
        let records = self.tracker.get_evaluation_executions(evaluation_id).await?;
        let known = self
            .lock()
            .get(evaluation_id)
            .map(|s| (s.cancel.is_cancelled(), s.fast_results.values().filter(|o| o.is_completed()).count()));
        if records.is_empty() && known.is_none() {
            return Err(OrchestratorError::EvaluationNotFound(evaluation_id.to_string()));
        }
        let (cancelled, fast_completed) = known.unwrap_or((false, 0));

        let queue = self.dispatcher.metrics().await;
        let status = EvaluationStatus::from_records(evaluation_id, &records, cancelled, queue)
            .with_fast_agents(fast_completed);

        if let Some(state) = self.lock().get_mut(evaluation_id) {
            if state.phase == EvaluationPhase::SlowPhaseDispatched && status.overall_status.is_finished() {
                state.phase = match status.overall_status {
                    super::OverallStatus::Failed => EvaluationPhase::Failed,
                    super::OverallStatus::Cancelled => EvaluationPhase::Cancelled,
                    _ => EvaluationPhase::Completed,
                };
            }
        }
        Ok(status)
    }

    /// Cancel an evaluation: queued work is dropped, non-terminal records are
    /// failed, and in-flight agents finish but their writes are ignored.
    #[instrument(skip(self))]
    pub async fn cancel_evaluation(&self, evaluation_id: &str) -> OrchestratorResult<CancelSummary> {
        {
            let mut evaluations = self.lock();
            let state = evaluations
                .entry(evaluation_id.to_string())
                .or_insert_with(EvaluationState::new);
            state.cancel.cancel();
            state.phase = EvaluationPhase::Cancelled;
        }

        let jobs_dropped = match self.dispatcher.cancel(evaluation_id).await {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "dispatcher could not drop queued work");
                0
            }
        };
        let records_cancelled = self.tracker.cancel_evaluation(evaluation_id).await?;
        obs::emit_evaluation_cancelled(evaluation_id, records_cancelled, jobs_dropped);

        Ok(CancelSummary {
            records_cancelled,
            jobs_dropped,
        })
    }

    /// Fast outputs merged with every completed slow output, plus the
    /// confidence-weighted aggregate.
    ///
    /// Once the evaluation has finished its in-memory state is dropped; later
    /// reads are served from the execution records alone.
    pub async fn final_results(
        &self,
        evaluation_id: &str,
        fast_results: &BTreeMap<String, AgentOutput>,
    ) -> OrchestratorResult<FinalResults> {
        let status = self.get_evaluation_status(evaluation_id).await?;
        let mut results = fast_results.clone();
        results.extend(self.tracker.get_completed_results(evaluation_id).await?);

        if status.overall_status.is_finished() {
            self.forget(evaluation_id);
        }

        let aggregator = AgentKind::ScoreAggregator.name();
        let aggregate = aggregate_scores(
            results
                .iter()
                .filter(|(name, _)| name.as_str() != aggregator)
                .map(|(_, output)| output),
        );
        Ok(FinalResults {
            evaluation_id: evaluation_id.to_string(),
            status,
            results,
            aggregate,
        })
    }

    /// Poll until the evaluation finishes or `timeout` passes.
    pub async fn wait_for_completion(
        &self,
        evaluation_id: &str,
        interval: Duration,
        timeout: Duration,
    ) -> OrchestratorResult<EvaluationStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.get_evaluation_status(evaluation_id).await?;
            if status.overall_status.is_finished() || Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn set_phase(&self, evaluation_id: &str, phase: EvaluationPhase) {
        if let Some(state) = self.lock().get_mut(evaluation_id) {
            // Cancellation sticks
            if state.phase != EvaluationPhase::Cancelled {
                state.phase = phase;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EvaluationState>> {
        self.evaluations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_waves_follow_dependencies() {
        let fast: Vec<_> = AgentKind::fast().collect();
        let waves = dependency_waves(&fast);
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec![AgentKind::Crawl]);
        assert_eq!(waves[1].len(), 5);
        assert_eq!(waves[2], vec![AgentKind::ScoreAggregator]);
    }

    #[test]
    fn test_slow_order_puts_dependencies_first() {
        let slow: Vec<_> = AgentKind::slow().collect();
        let order: Vec<_> = dependency_waves(&slow).into_iter().flatten().collect();
        let llm = order.iter().position(|k| *k == AgentKind::LlmTest).unwrap();
        let commerce = order.iter().position(|k| *k == AgentKind::Commerce).unwrap();
        assert!(llm < commerce);
        assert_eq!(order.len(), 5);
    }

    #[test]
    fn test_phase_serializes_kebab_case() {
        let v = serde_json::to_value(EvaluationPhase::PartialResultsAvailable).unwrap();
        assert_eq!(v, "partial-results-available");
        assert!(EvaluationPhase::Cancelled.is_terminal());
    }
}
