//! Structured lifecycle events for evaluations and agent runs.
//!
//! Every event carries an `event` field so log pipelines can filter on it,
//! e.g. `event=agent.finished`. Level and format are controlled by
//! [`crate::telemetry::init_tracing`].

use tracing::{info, warn, Span};

/// Evaluation-scoped span for work that runs on its own task, away from the
/// caller's span. Attach it with [`tracing::Instrument`].
///
/// ```ignore
/// tokio::spawn(job.instrument(obs::evaluation_span("eval-42")));
/// ```
pub fn evaluation_span(evaluation_id: &str) -> Span {
    tracing::info_span!("adi.evaluation", evaluation_id = %evaluation_id)
}

pub fn emit_evaluation_started(evaluation_id: &str, fast_agents: usize, slow_agents: usize) {
    info!(
        event = "evaluation.started",
        evaluation_id = %evaluation_id,
        fast_agents = fast_agents,
        slow_agents = slow_agents,
    );
}

pub fn emit_fast_phase_finished(evaluation_id: &str, duration_ms: u64, completed: usize, failed: usize) {
    info!(
        event = "evaluation.fast_phase_finished",
        evaluation_id = %evaluation_id,
        duration_ms = duration_ms,
        completed = completed,
        failed = failed,
    );
}

pub fn emit_agent_finished(agent: &str, status: &str, duration_ms: u64, tier: Option<&str>) {
    info!(
        event = "agent.finished",
        agent = %agent,
        status = %status,
        duration_ms = duration_ms,
        tier = tier.unwrap_or("primary"),
    );
}

/// A fallback chain produced its output from tier `tier_index`.
pub fn emit_tier_served(agent: &str, tier: &str, tier_index: usize, degraded: bool) {
    info!(
        event = "tier.served",
        agent = %agent,
        tier = %tier,
        tier_index = tier_index,
        degraded = degraded,
    );
}

pub fn emit_breaker_opened(provider: &str, failure_count: u32) {
    warn!(event = "breaker.opened", provider = %provider, failure_count = failure_count);
}

pub fn emit_job_dispatched(evaluation_id: &str, agent: &str, priority: &str, dispatcher: &str) {
    info!(
        event = "job.dispatched",
        evaluation_id = %evaluation_id,
        agent = %agent,
        priority = %priority,
        dispatcher = %dispatcher,
    );
}

pub fn emit_evaluation_cancelled(evaluation_id: &str, records: usize, dropped_jobs: usize) {
    info!(
        event = "evaluation.cancelled",
        evaluation_id = %evaluation_id,
        records = records,
        dropped_jobs = dropped_jobs,
    );
}

pub fn emit_persistence_error(execution_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "tracker.persistence_error", execution_id = %execution_id, error = %error);
}
