//! Worker HTTP surface, exercised over a real listener.

use std::sync::Arc;
use std::time::Duration;

use adi_core::{
    AgentDeps, AgentInput, BreakerConfig, DispatchRequest, DispatchResponse, EvaluationContext,
    EvaluationStatus, ExecutionTracker, HttpDispatcher, HybridOrchestrator, LlmProvider,
    OrchestratorConfig, OverallStatus, QueueMetrics, ScriptedProvider,
};
use adi_state::{ExecutionId, ExecutionStatus, MemoryExecutionStore};
use adi_worker::{router, CancelReply, WorkerState};
use reqwest::StatusCode;

struct TestWorker {
    base: String,
    tracker: ExecutionTracker,
    client: reqwest::Client,
}

fn deps() -> AgentDeps {
    let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::answering(
        "openai",
        "Acme is trusted and popular. Buy Acme at acme.test.",
    ));
    AgentDeps::in_memory(vec![provider], BreakerConfig::default(), Duration::from_secs(600))
}

async fn spawn_worker() -> TestWorker {
    let tracker = ExecutionTracker::new(Arc::new(MemoryExecutionStore::new()));
    let config = OrchestratorConfig {
        max_concurrent: 2,
        dependency_poll: Duration::from_millis(10),
        ..OrchestratorConfig::default()
    };
    let app = router(WorkerState::from_config(&config, deps(), tracker.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestWorker {
        base: format!("http://{addr}"),
        tracker,
        client: reqwest::Client::new(),
    }
}

fn input(evaluation_id: &str) -> AgentInput {
    AgentInput::new(EvaluationContext::new(evaluation_id, "https://acme.test", "Acme"))
}

#[tokio::test]
async fn dispatch_runs_agent_and_completes_record() {
    let w = spawn_worker().await;
    let id = w.tracker.start_execution("eval-1", "sentiment_agent").await.unwrap();

    let resp = w
        .client
        .post(format!("{}/agents", w.base))
        .json(&DispatchRequest::new("sentiment_agent", input("eval-1"), id.clone()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: DispatchResponse = resp.json().await.unwrap();
    assert!(body.success, "{body:?}");
    assert_eq!(body.evaluation_id, "eval-1");

    let record = w.tracker.get_execution(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn malformed_and_incomplete_requests_are_rejected() {
    let w = spawn_worker().await;

    let resp = w
        .client
        .post(format!("{}/agents", w.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = w
        .client
        .post(format!("{}/agents", w.base))
        .json(&DispatchRequest::new("sentiment_agent", input("eval-1"), ExecutionId::from("")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Well-formed, but no record exists for this execution id
    let resp = w
        .client
        .post(format!("{}/agents", w.base))
        .json(&DispatchRequest::new("sentiment_agent", input("eval-1"), ExecutionId::from("ghost")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_agent_is_bad_request_and_fails_record() {
    let w = spawn_worker().await;
    let id = w.tracker.start_execution("eval-1", "astrology_agent").await.unwrap();

    let resp = w
        .client
        .post(format!("{}/agents", w.base))
        .json(&DispatchRequest::new("astrology_agent", input("eval-1"), id.clone()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let record = w.tracker.get_execution(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn wrong_method_on_agents_is_405() {
    let w = spawn_worker().await;
    let resp = w.client.get(format!("{}/agents", w.base)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    let resp = w.client.put(format!("{}/agents", w.base)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn queue_health_and_cancel_endpoints() {
    let w = spawn_worker().await;

    let health = w.client.get(format!("{}/health", w.base)).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let metrics: QueueMetrics = w
        .client
        .get(format!("{}/queue", w.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics.max_concurrent, 2);
    assert_eq!(metrics.total_queued, 0);

    let missing = w.client.get(format!("{}/evaluations/eval-9", w.base)).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    w.tracker.start_execution("eval-9", "citation_agent").await.unwrap();
    w.tracker.start_execution("eval-9", "commerce_agent").await.unwrap();
    let reply: CancelReply = w
        .client
        .delete(format!("{}/evaluations/eval-9", w.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply.records_cancelled, 2);

    let status: EvaluationStatus = w
        .client
        .get(format!("{}/evaluations/eval-9", w.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.overall_status, OverallStatus::Cancelled);
    assert_eq!(status.progress, 1.0);
}

#[tokio::test]
async fn orchestrator_dispatches_over_http() {
    let w = spawn_worker().await;
    let dispatcher = Arc::new(HttpDispatcher::new(w.base.clone(), w.tracker.clone()));
    let orchestrator = HybridOrchestrator::new(
        deps(),
        w.tracker.clone(),
        dispatcher,
        OrchestratorConfig::default(),
    );

    let ctx = EvaluationContext::new("eval-http", "https://acme.test", "Acme")
        .with_content("<h1>Acme</h1><p>Founded in 1952, Acme makes trusted gear.</p>");
    let partial = orchestrator.execute_evaluation(ctx).await.unwrap();
    assert!(partial.slow_agents.iter().all(|t| t.dispatched));

    let status = orchestrator
        .wait_for_completion("eval-http", Duration::from_millis(20), Duration::from_secs(20))
        .await
        .unwrap();
    assert_eq!(status.overall_status, OverallStatus::Completed);
    assert_eq!(status.completed_agents, 5);
    // Queue metrics come from the worker's GET /queue
    assert_eq!(status.queue.map(|q| q.max_concurrent), Some(2));
}
