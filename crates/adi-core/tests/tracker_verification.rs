//! Read-after-write verification and the finally-guard against lagging and
//! misbehaving execution paths.

use std::sync::Arc;
use std::time::Duration;

use adi_core::domain::scoring::create_result;
use adi_core::tracker::WriteOutcome;
use adi_core::{AgentOutput, ExecutionTracker, TrackerError, VerifyPolicy, CANCELLED, UNHANDLED_EXIT};
use adi_state::{ExecutionStatus, LaggedExecutionStore, MemoryExecutionStore};

fn output() -> AgentOutput {
    AgentOutput::completed(
        "sentiment_agent",
        vec![create_result("sentiment", 0.4, 70.0, 0.7, Default::default())],
    )
}

fn lagged() -> (Arc<LaggedExecutionStore>, ExecutionTracker) {
    let store = Arc::new(LaggedExecutionStore::new(0));
    let tracker = ExecutionTracker::with_policy(
        store.clone(),
        VerifyPolicy {
            attempts: 3,
            delay: Duration::from_millis(500),
        },
    );
    (store, tracker)
}

#[tokio::test(start_paused = true)]
async fn verification_rides_out_two_stale_reads() {
    let (store, tracker) = lagged();
    let id = tracker.start_running("eval-1", "sentiment_agent").await.unwrap();

    store.set_lag(2);
    let started = tokio::time::Instant::now();
    let record = tracker.complete_verified(&id, &output(), 40).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.duration_ms, Some(40));
    // Two retry intervals were needed
    assert!(started.elapsed() >= Duration::from_millis(1_000));
}

#[tokio::test(start_paused = true)]
async fn verification_reports_persistence_error_past_budget() {
    let (store, tracker) = lagged();
    let id = tracker.start_running("eval-1", "sentiment_agent").await.unwrap();

    store.set_lag(3);
    let err = tracker.complete_verified(&id, &output(), 40).await.unwrap_err();
    match err {
        TrackerError::Persistence { execution_id, attempts } => {
            assert_eq!(execution_id, id.0);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected persistence error, got {other:?}"),
    }

    // The write itself landed; it just was not visible in time
    let record = tracker.get_execution(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn panic_inside_guarded_body_fails_the_record() {
    let tracker = ExecutionTracker::new(Arc::new(MemoryExecutionStore::new()));
    let id = tracker.start_running("eval-2", "citation_agent").await.unwrap();

    let result: Result<(), _> = tracker
        .run_guarded(id.clone(), |_guard| async { panic!("kaboom") })
        .await;

    match result {
        Err(TrackerError::Aborted { message, .. }) => assert_eq!(message, "kaboom"),
        other => panic!("expected aborted, got {other:?}"),
    }
    let record = tracker.get_execution(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some(format!("{UNHANDLED_EXIT}: kaboom").as_str())
    );
}

#[tokio::test]
async fn body_returning_without_terminal_write_is_failed() {
    let tracker = ExecutionTracker::new(Arc::new(MemoryExecutionStore::new()));
    let id = tracker.start_running("eval-2", "citation_agent").await.unwrap();

    let value = tracker
        .run_guarded(id.clone(), |_guard| async { 7 })
        .await
        .unwrap();
    assert_eq!(value, 7);

    let record = tracker.get_execution(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some(UNHANDLED_EXIT));
}

#[tokio::test]
async fn settled_guard_leaves_completed_record_alone() {
    let tracker = ExecutionTracker::new(Arc::new(MemoryExecutionStore::new()));
    let id = tracker.start_execution("eval-2", "citation_agent").await.unwrap();

    tracker
        .run_guarded(id.clone(), |guard| async move {
            guard.mark_running().await?;
            guard.complete_verified(&output(), 5).await
        })
        .await
        .unwrap()
        .unwrap();

    let record = tracker.get_execution(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn aborted_task_still_fails_its_record() {
    let tracker = ExecutionTracker::new(Arc::new(MemoryExecutionStore::new()));
    let id = tracker.start_running("eval-3", "geo_visibility_agent").await.unwrap();

    let t = tracker.clone();
    let task_id = id.clone();
    let task = tokio::spawn(async move {
        t.run_guarded(task_id, |_guard| async {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        })
        .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    task.abort();

    let mut status = ExecutionStatus::Running;
    for _ in 0..100 {
        status = tracker.get_execution(&id).await.unwrap().unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn completion_after_cancellation_is_ignored() {
    let tracker = ExecutionTracker::new(Arc::new(MemoryExecutionStore::new()));
    let running = tracker.start_running("eval-4", "llm_test_agent").await.unwrap();
    let pending = tracker.start_execution("eval-4", "commerce_agent").await.unwrap();

    assert_eq!(tracker.cancel_evaluation("eval-4").await.unwrap(), 2);

    let outcome = tracker.complete_execution(&running, &output(), 9).await.unwrap();
    assert!(matches!(outcome, WriteOutcome::AlreadyTerminal(ExecutionStatus::Failed)));

    for id in [&running, &pending] {
        let record = tracker.get_execution(id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.cancelled);
        assert_eq!(record.error_message.as_deref(), Some(CANCELLED));
    }
}
