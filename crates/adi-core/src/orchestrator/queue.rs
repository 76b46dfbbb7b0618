//! In-process work queue for slow agents.
//!
//! Jobs are ordered by priority class (FIFO within a class). A job only
//! starts when none of its declared dependencies in the same evaluation is
//! still queued, running, or non-terminal in the tracker. A semaphore caps
//! the number of jobs running at once; everything else waits in the queue.
//!
//! A single scheduler task owns dispatch. It wakes on enqueue, on job
//! completion, and on a poll interval while jobs are blocked on dependencies
//! that live outside this process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use adi_state::ExecutionRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn, Instrument};

use super::{OrchestratorError, OrchestratorResult};
use crate::agents::AgentKind;
use crate::config::OrchestratorConfig;
use crate::contract::elapsed_ms;
use crate::domain::PriorityClass;
use crate::obs;
use crate::tracker::ExecutionTracker;
use crate::worker::{DispatchRequest, DispatchResponse};

/// Executes one dequeued job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, request: DispatchRequest) -> DispatchResponse;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub dependency_poll: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for QueueConfig {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            max_concurrent: cfg.max_concurrent.max(1),
            max_queue_size: cfg.max_queue_size,
            dependency_poll: cfg.dependency_poll,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub total_queued: usize,
    pub total_running: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    /// Milliseconds between enqueue and start, averaged over started jobs.
    pub average_wait_ms: f64,
    /// completed / (completed + failed); 0 before anything finished.
    pub success_rate: f64,
    /// running / max_concurrent.
    pub resource_utilization: f64,
    pub max_concurrent: usize,
    /// Highest number of jobs observed running at once.
    pub peak_running: usize,
}

struct QueuedJob {
    seq: u64,
    priority: PriorityClass,
    request: DispatchRequest,
    dependencies: &'static [&'static str],
    queued_at: Instant,
    reply: Option<oneshot::Sender<DispatchResponse>>,
}

impl QueuedJob {
    fn order(&self) -> (u8, u64) {
        (self.priority.rank(), self.seq)
    }
}

struct RunningJob {
    evaluation_id: String,
    agent_name: String,
}

#[derive(Default)]
struct QueueState {
    queued: Vec<QueuedJob>,
    running: HashMap<String, RunningJob>,
    cancelled: HashSet<String>,
    next_seq: u64,
    completed: u64,
    failed: u64,
    started: u64,
    total_wait_ms: u64,
    peak_running: usize,
}

impl QueueState {
    /// A dependency of `job` is still queued or running here.
    fn blocked_locally(&self, job: &QueuedJob) -> bool {
        let eval = &job.request.evaluation_id;
        let depends = |agent: &str| job.dependencies.iter().any(|d| *d == agent);
        self.queued
            .iter()
            .any(|q| q.seq != job.seq && &q.request.evaluation_id == eval && depends(&q.request.agent_name))
            || self
                .running
                .values()
                .any(|r| &r.evaluation_id == eval && depends(&r.agent_name))
    }
}

struct Inner {
    config: QueueConfig,
    runner: Arc<dyn JobRunner>,
    tracker: ExecutionTracker,
    slots: Arc<Semaphore>,
    state: Mutex<QueueState>,
    wake: Arc<Notify>,
    idle: Notify,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Lets the scheduler observe that every handle is gone
        self.wake.notify_one();
    }
}

/// Cloneable handle to a running queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    /// Create the queue and start its scheduler. Must be called from within
    /// a Tokio runtime.
    pub fn new(config: QueueConfig, runner: Arc<dyn JobRunner>, tracker: ExecutionTracker) -> Self {
        let inner = Arc::new(Inner {
            slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            runner,
            tracker,
            state: Mutex::new(QueueState::default()),
            wake: Arc::new(Notify::new()),
            idle: Notify::new(),
        });
        tokio::spawn(scheduler(Arc::downgrade(&inner), inner.wake.clone()));
        Self { inner }
    }

    pub fn config(&self) -> QueueConfig {
        self.inner.config
    }

    /// Queue a job. The receiver resolves with the job's response, or is
    /// dropped if the job is removed by cancellation.
    #[instrument(skip(self, request), fields(agent = %request.agent_name, evaluation_id = %request.evaluation_id))]
    pub fn submit(
        &self,
        request: DispatchRequest,
        priority: PriorityClass,
    ) -> OrchestratorResult<oneshot::Receiver<DispatchResponse>> {
        let dependencies = AgentKind::from_name(&request.agent_name)
            .map(|k| k.config().dependencies)
            .unwrap_or(&[]);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            if state.cancelled.contains(&request.evaluation_id) {
                return Err(OrchestratorError::Cancelled(request.evaluation_id));
            }
            if state.queued.len() >= self.inner.config.max_queue_size {
                return Err(OrchestratorError::Dispatch(format!(
                    "queue full ({} jobs)",
                    self.inner.config.max_queue_size
                )));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queued.push(QueuedJob {
                seq,
                priority,
                request,
                dependencies,
                queued_at: Instant::now(),
                reply: Some(tx),
            });
            debug!(seq, priority = priority.as_str(), queued = state.queued.len(), "job queued");
        }
        self.inner.wake.notify_one();
        Ok(rx)
    }

    /// Drop every queued job of an evaluation and refuse future submissions
    /// for it. Running jobs are left to finish. Returns how many queued jobs
    /// were dropped.
    pub fn cancel_evaluation(&self, evaluation_id: &str) -> usize {
        let dropped = {
            let mut state = self.inner.lock();
            state.cancelled.insert(evaluation_id.to_string());
            let before = state.queued.len();
            state.queued.retain(|job| job.request.evaluation_id != evaluation_id);
            before - state.queued.len()
        };
        debug!(evaluation_id, dropped, "queued jobs dropped");
        self.inner.idle.notify_waiters();
        self.inner.wake.notify_one();
        dropped
    }

    pub fn is_cancelled(&self, evaluation_id: &str) -> bool {
        self.inner.lock().cancelled.contains(evaluation_id)
    }

    /// Jobs of `evaluation_id` still waiting to start.
    pub fn queued_for(&self, evaluation_id: &str) -> usize {
        self.inner
            .lock()
            .queued
            .iter()
            .filter(|j| j.request.evaluation_id == evaluation_id)
            .count()
    }

    pub fn metrics(&self) -> QueueMetrics {
        let state = self.inner.lock();
        let finished = state.completed + state.failed;
        let max = self.inner.config.max_concurrent.max(1);
        QueueMetrics {
            total_queued: state.queued.len(),
            total_running: state.running.len(),
            total_completed: state.completed,
            total_failed: state.failed,
            average_wait_ms: if state.started == 0 {
                0.0
            } else {
                state.total_wait_ms as f64 / state.started as f64
            },
            success_rate: if finished == 0 {
                0.0
            } else {
                state.completed as f64 / finished as f64
            },
            resource_utilization: state.running.len() as f64 / max as f64,
            max_concurrent: max,
            peak_running: state.peak_running,
        }
    }

    /// Resolve once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.lock();
                if state.queued.is_empty() && state.running.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start as many eligible jobs as there are free slots. Returns `true`
    /// when some job is blocked on a dependency and should be re-checked
    /// later.
    async fn pump(self: &Arc<Self>) -> bool {
        loop {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                return false;
            };

            let candidates: Vec<(u64, String, bool)> = {
                let state = self.lock();
                let mut order: Vec<&QueuedJob> = state.queued.iter().collect();
                order.sort_by_key(|j| j.order());
                order
                    .into_iter()
                    .map(|j| {
                        (
                            j.seq,
                            j.request.evaluation_id.clone(),
                            j.dependencies.is_empty() || !state.blocked_locally(j),
                        )
                    })
                    .collect()
            };
            if candidates.is_empty() {
                return false;
            }

            let mut records: HashMap<String, Vec<ExecutionRecord>> = HashMap::new();
            let mut chosen = None;
            for (seq, evaluation_id, locally_free) in candidates {
                if locally_free && self.tracker_allows(seq, &evaluation_id, &mut records).await {
                    chosen = Some(seq);
                    break;
                }
            }
            let Some(seq) = chosen else {
                return true;
            };

            let job = {
                let mut state = self.lock();
                let Some(pos) = state.queued.iter().position(|j| j.seq == seq) else {
                    // Cancelled while dependencies were being checked
                    continue;
                };
                let job = state.queued.remove(pos);
                let wait = elapsed_ms(job.queued_at);
                state.started += 1;
                state.total_wait_ms = state.total_wait_ms.saturating_add(wait);
                state.running.insert(
                    job.request.execution_id.0.clone(),
                    RunningJob {
                        evaluation_id: job.request.evaluation_id.clone(),
                        agent_name: job.request.agent_name.clone(),
                    },
                );
                state.peak_running = state.peak_running.max(state.running.len());
                job
            };
            self.start(job, permit);
        }
    }

    /// No declared dependency of job `seq` has a non-terminal record.
    async fn tracker_allows(
        &self,
        seq: u64,
        evaluation_id: &str,
        cache: &mut HashMap<String, Vec<ExecutionRecord>>,
    ) -> bool {
        let dependencies = {
            let state = self.lock();
            match state.queued.iter().find(|j| j.seq == seq) {
                Some(job) => job.dependencies,
                None => return false,
            }
        };
        if dependencies.is_empty() {
            return true;
        }
        if !cache.contains_key(evaluation_id) {
            match self.tracker.get_evaluation_executions(evaluation_id).await {
                Ok(records) => {
                    cache.insert(evaluation_id.to_string(), records);
                }
                Err(err) => {
                    warn!(evaluation_id, error = %err, "could not read dependency records");
                    return false;
                }
            }
        }
        cache.get(evaluation_id).is_some_and(|records| {
            !records
                .iter()
                .any(|r| dependencies.iter().any(|d| *d == r.agent_name) && !r.status.is_terminal())
        })
    }

    fn start(self: &Arc<Self>, mut job: QueuedJob, permit: OwnedSemaphorePermit) {
        let inner = Arc::clone(self);
        let span = obs::evaluation_span(&job.request.evaluation_id);
        let run = async move {
            let _permit = permit;
            let execution_id = job.request.execution_id.0.clone();
            debug!(execution_id = %execution_id, agent = %job.request.agent_name, "job started");

            let response = inner.runner.run(job.request).await;
            {
                let mut state = inner.lock();
                state.running.remove(&execution_id);
                if response.success {
                    state.completed += 1;
                } else {
                    state.failed += 1;
                }
            }
            if let Some(reply) = job.reply.take() {
                let _ = reply.send(response);
            }
            drop(_permit);
            inner.idle.notify_waiters();
            inner.wake.notify_one();
        };
        tokio::spawn(run.instrument(span));
    }
}

async fn scheduler(queue: Weak<Inner>, wake: Arc<Notify>) {
    loop {
        let Some(inner) = queue.upgrade() else {
            break;
        };
        let blocked = inner.pump().await;
        let poll = inner.config.dependency_poll;
        drop(inner);

        if blocked {
            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        } else {
            wake.notified().await;
        }
    }
    debug!("work queue scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentInput, EvaluationContext};
    use adi_state::{ExecutionId, MemoryExecutionStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl JobRunner for Recorder {
        async fn run(&self, request: DispatchRequest) -> DispatchResponse {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.order.lock().unwrap().push(request.agent_name.clone());
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            DispatchResponse::failure(&request, "recorded", 0)
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn request(eval: &str, agent: &str) -> DispatchRequest {
        DispatchRequest::new(
            agent,
            AgentInput::new(EvaluationContext::new(eval, "https://acme.test", "Acme")),
            ExecutionId::generate(eval, agent),
        )
    }

    fn queue(runner: Arc<dyn JobRunner>, max_concurrent: usize) -> WorkQueue {
        let config = QueueConfig {
            max_concurrent,
            max_queue_size: 100,
            dependency_poll: Duration::from_millis(20),
        };
        WorkQueue::new(config, runner, ExecutionTracker::new(Arc::new(MemoryExecutionStore::new())))
    }

    #[tokio::test]
    async fn test_running_jobs_never_exceed_cap() {
        let rec = Recorder::new(Duration::from_millis(30));
        let q = queue(rec.clone(), 2);
        for i in 0..7 {
            q.submit(request(&format!("eval-{i}"), "sentiment_agent"), PriorityClass::Medium)
                .unwrap();
        }
        q.wait_idle().await;
        assert_eq!(rec.peak.load(Ordering::SeqCst), 2);
        let m = q.metrics();
        assert_eq!(m.peak_running, 2);
        assert_eq!(m.total_failed, 7);
        assert_eq!(m.total_queued, 0);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let rec = Recorder::new(Duration::from_millis(5));
        let q = queue(rec.clone(), 1);
        // Occupy the only slot so the rest queue up behind it
        let first = q.submit(request("e0", "sentiment_agent"), PriorityClass::Low).unwrap();
        wait_until(|| rec.running.load(Ordering::SeqCst) == 1).await;
        q.submit(request("e1", "geo_visibility_agent"), PriorityClass::Low).unwrap();
        q.submit(request("e2", "citation_agent"), PriorityClass::Critical).unwrap();
        q.submit(request("e3", "llm_test_agent"), PriorityClass::Critical).unwrap();
        first.await.unwrap();
        q.wait_idle().await;

        let order = rec.order.lock().unwrap().clone();
        assert_eq!(
            order[1..],
            ["citation_agent", "llm_test_agent", "geo_visibility_agent"]
        );
    }

    #[tokio::test]
    async fn test_dependency_waits_for_running_job() {
        let rec = Recorder::new(Duration::from_millis(20));
        let q = queue(rec.clone(), 3);
        q.submit(request("e1", "commerce_agent"), PriorityClass::Critical).unwrap();
        q.submit(request("e1", "llm_test_agent"), PriorityClass::Low).unwrap();
        q.wait_idle().await;

        let order = rec.order.lock().unwrap().clone();
        assert_eq!(order, vec!["llm_test_agent", "commerce_agent"]);
        assert_eq!(rec.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_drops_queued_and_rejects_new_work() {
        let rec = Recorder::new(Duration::from_millis(50));
        let q = queue(rec.clone(), 1);
        q.submit(request("busy", "sentiment_agent"), PriorityClass::High).unwrap();
        wait_until(|| rec.running.load(Ordering::SeqCst) == 1).await;
        let dropped_rx = q.submit(request("e9", "citation_agent"), PriorityClass::Low).unwrap();
        q.submit(request("e9", "geo_visibility_agent"), PriorityClass::Low).unwrap();

        assert_eq!(q.cancel_evaluation("e9"), 2);
        assert!(dropped_rx.await.is_err());
        let err = q
            .submit(request("e9", "commerce_agent"), PriorityClass::Low)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled(_)));

        q.wait_idle().await;
        assert_eq!(rec.order.lock().unwrap().clone(), vec!["sentiment_agent"]);
    }

    #[tokio::test]
    async fn test_queue_size_is_bounded() {
        let rec = Recorder::new(Duration::from_millis(50));
        let config = QueueConfig {
            max_concurrent: 1,
            max_queue_size: 1,
            dependency_poll: Duration::from_millis(20),
        };
        let q = WorkQueue::new(config, rec, ExecutionTracker::new(Arc::new(MemoryExecutionStore::new())));
        q.submit(request("a", "sentiment_agent"), PriorityClass::Low).unwrap();
        q.submit(request("b", "sentiment_agent"), PriorityClass::Low).ok();
        let third = q.submit(request("c", "sentiment_agent"), PriorityClass::Low);
        assert!(matches!(third, Err(OrchestratorError::Dispatch(_))));
    }
}
