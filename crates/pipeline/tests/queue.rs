mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use imgflow_core::error::CoreError;
use imgflow_core::process::Process;
use imgflow_core::service::ExecutionSpec;
use imgflow_core::status::{StatusCode, StatusRecord};
use imgflow_pipeline::CancelOutcome;
use imgflow_store::EntityKey;
use serde_json::json;

use common::{harness, harness_with, process, test_config};

#[tokio::test]
async fn dispatches_in_fifo_order() {
    let h = harness().await;
    for name in ["first", "second", "third"] {
        h.algorithm(name, name).await;
    }

    let mut ids = Vec::new();
    for name in ["first", "second", "third"] {
        let exec = h
            .engine
            .execute(&format!("/algorithms/{name}/1.0"), json!({}))
            .await
            .unwrap();
        ids.push(exec.identifier);
    }
    h.engine.trigger();

    for id in &ids {
        let p = process(h.settled(*id).await);
        assert_eq!(p.status.status_code, StatusCode::Done);
    }
    assert_eq!(h.runtime.images(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn admission_returns_pending_without_running() {
    let h = harness().await;
    h.algorithm("binarize", "binarize").await;

    let exec = h
        .engine
        .execute("/algorithms/binarize/1.0", json!({"image": "a.png"}))
        .await
        .unwrap();
    assert_eq!(exec.status.status_code, StatusCode::Pending);

    let p = process(h.engine.status(exec.identifier).await.unwrap());
    assert_eq!(p.status.status_code, StatusCode::Pending);
    assert!(h.runtime.calls().is_empty());
    assert_eq!(h.queue.depth(), (1, 0));
}

#[tokio::test]
async fn never_exceeds_concurrency_limit() {
    let mut config = test_config();
    config.max_concurrent = 2;
    let h = harness_with(config).await;
    h.algorithm("slow", "slow").await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        let exec = h.engine.execute("/algorithms/slow/1.0", json!({})).await.unwrap();
        ids.push(exec.identifier);
    }
    h.engine.trigger();
    h.engine.trigger();

    let mut peak = 0;
    while h.queue.depth() != (0, 0) {
        peak = peak.max(h.queue.depth().1);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(peak <= 2, "ran {peak} at once");
    for id in ids {
        assert_eq!(process(h.settled(id).await).status.status_code, StatusCode::Done);
    }
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let h = harness().await;
    h.algorithm("flaky", "flaky").await;

    let exec = h.engine.execute("/algorithms/flaky/1.0", json!({})).await.unwrap();
    h.engine.trigger();

    let p = process(h.settled(exec.identifier).await);
    assert_eq!(p.status.status_code, StatusCode::Done);
    assert_eq!(p.retry_count, 1);
    assert_eq!(h.runtime.calls().len(), 2);
    assert!(p.result_location.unwrap().ends_with("result.json"));
}

#[tokio::test]
async fn container_failure_writes_diagnostics() {
    let h = harness().await;
    h.algorithm("broken", "fail").await;

    let exec = h.engine.execute("/algorithms/broken/1.0", json!({})).await.unwrap();
    h.engine.trigger();

    let p = process(h.settled(exec.identifier).await);
    assert_eq!(p.status.status_code, StatusCode::Error);
    assert_eq!(
        p.status.status_message,
        "Container execution failed: Container exited with code 1: boom"
    );
    assert_eq!(p.retry_count, 0);
    assert!(p.result_location.is_none());
    let log = p.error_log.expect("error log recorded");
    assert_eq!(std::fs::read_to_string(log).unwrap(), "boom");

    assert_matches!(
        h.engine.result(exec.identifier).await,
        Err(CoreError::Conflict(_))
    );
}

#[tokio::test]
async fn timeout_marks_process_failed() {
    let h = harness().await;
    h.algorithm_with_timeout("sleepy", "hang", Some(1)).await;

    let exec = h.engine.execute("/algorithms/sleepy/1.0", json!({})).await.unwrap();
    h.engine.trigger();

    let p = process(h.settled(exec.identifier).await);
    assert_eq!(p.status.status_code, StatusCode::Error);
    assert_eq!(p.status.status_message, "timeout");
}

#[tokio::test]
async fn panicking_worker_is_recorded() {
    let h = harness().await;
    h.algorithm("crash", "panic").await;
    h.algorithm("after", "after").await;

    let crashed = h.engine.execute("/algorithms/crash/1.0", json!({})).await.unwrap();
    let after = h.engine.execute("/algorithms/after/1.0", json!({})).await.unwrap();
    h.engine.trigger();

    let p = process(h.settled(crashed.identifier).await);
    assert_eq!(p.status, StatusRecord::error("worker crashed"));

    // The crash released its slot.
    let p = process(h.settled(after.identifier).await);
    assert_eq!(p.status.status_code, StatusCode::Done);
}

#[tokio::test]
async fn cancel_pending_and_running() {
    let h = harness().await;
    h.algorithm("hang", "hang").await;
    h.algorithm("never", "never").await;

    let running = h.engine.execute("/algorithms/hang/1.0", json!({})).await.unwrap();
    let queued = h.engine.execute("/algorithms/never/1.0", json!({})).await.unwrap();
    h.engine.trigger();
    h.wait_for_status(running.identifier, |s| s.status_code == StatusCode::InProgress)
        .await;

    assert_eq!(
        h.queue.cancel(queued.identifier).await.unwrap(),
        CancelOutcome::Removed
    );
    let p = process(h.engine.status(queued.identifier).await.unwrap());
    assert_eq!(p.status, StatusRecord::cancelled("cancelled before execution"));

    assert_eq!(
        h.queue.cancel(running.identifier).await.unwrap(),
        CancelOutcome::Signalled
    );
    let p = process(h.settled(running.identifier).await);
    assert_eq!(p.status, StatusRecord::cancelled("cancelled by request"));
    assert!(p.result_location.is_none());

    assert_eq!(h.runtime.images(), vec!["hang"]);
    while h.queue.depth() != (0, 0) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_matches!(
        h.queue.cancel(running.identifier).await,
        Err(CoreError::Conflict(_))
    );
}

#[tokio::test]
async fn cancel_unknown_process_is_not_found() {
    let h = harness().await;
    assert_matches!(
        h.queue.cancel(uuid::Uuid::new_v4()).await,
        Err(CoreError::NotFound { entity: "Process", .. })
    );
}

#[tokio::test]
async fn restart_fails_interrupted_processes() {
    let h = harness().await;
    let mut interrupted = Process::new(
        uuid::Uuid::new_v4(),
        "/algorithms/binarize/1.0",
        ExecutionSpec {
            image: "binarize".into(),
            command: vec![],
            timeout_secs: None,
        },
        json!({}),
    );
    interrupted.set_status(StatusRecord::in_progress("running", 0));
    let id = interrupted.identifier;
    h.tracker
        .create(&EntityKey::Process(id), &interrupted)
        .await
        .unwrap();

    assert_eq!(h.queue.recover_interrupted().await.unwrap(), 1);
    let p = process(h.engine.status(id).await.unwrap());
    assert_eq!(p.status, StatusRecord::error("interrupted by restart"));
    assert_eq!(h.queue.recover_interrupted().await.unwrap(), 0);
}

#[tokio::test]
async fn shutdown_refuses_new_work() {
    let h = harness().await;
    h.algorithm("binarize", "binarize").await;
    h.queue.shutdown().await;

    assert_matches!(
        h.engine.execute("/algorithms/binarize/1.0", json!({})).await,
        Err(CoreError::Conflict(_))
    );
}
