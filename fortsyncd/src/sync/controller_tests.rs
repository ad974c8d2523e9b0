use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{body_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::sync::progress::ProgressAggregator;
use crate::sync::task::{TaskErrorKind, TaskStatus};

fn controller_with(server: &MockServer, workers: usize) -> SyncController {
    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    SyncController::with_options(
        client,
        SyncOptions {
            worker_count: workers,
            idle_poll: Duration::from_millis(20),
        },
    )
}

async fn mount_empty_listings(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/file-entries"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(server)
        .await;
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn uploads_tree_and_completes() {
    let server = MockServer::start().await;
    mount_empty_listings(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/folders"))
        .and(body_json(json!({"name": "sub", "type": "folder", "parentId": 10})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 77})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("a.txt"))
        .and(body_string_contains("parentId"))
        .and(body_string_contains("10"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("c.txt"))
        .and(body_string_contains("77"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/c.txt"), b"x".repeat(20)).unwrap();

    let controller = controller_with(&server, 3);
    let mut events = controller.subscribe();
    controller.start(dir.path(), 10).await.unwrap();
    assert_eq!(controller.wait_until_settled().await, Phase::Completed);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.total, 2);
    assert_eq!(snapshot.succeeded, 2);
    assert_eq!(snapshot.failed, 0);
    assert_eq!(snapshot.bytes_transferred, 30);

    let events = drain_events(&mut events);
    let succeeded: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::TaskSucceeded { relative_path, .. } => Some(relative_path.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(succeeded.len(), 2);
    assert!(succeeded.contains(&"a.txt".to_string()));
    assert!(succeeded.contains(&"sub/c.txt".to_string()));
    assert!(
        events
            .iter()
            .any(|event| matches!(event, SyncEvent::PhaseChanged { phase: Phase::Completed }))
    );
}

#[tokio::test]
async fn failed_upload_surfaces_and_retry_completes_the_run() {
    let server = MockServer::start().await;
    mount_empty_listings(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/folders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 77})))
        .mount(&server)
        .await;
    // c.txt fails once with a server error, then uploads cleanly.
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("c.txt"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("c.txt"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("a.txt"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
    std::fs::create_dir(dir.path().join("b")).unwrap();
    std::fs::write(dir.path().join("b/c.txt"), b"x".repeat(20)).unwrap();

    let controller = controller_with(&server, 2);
    let aggregator = ProgressAggregator::new(controller.queue());
    controller.start(dir.path(), 10).await.unwrap();
    assert_eq!(controller.wait_until_settled().await, Phase::Completed);

    let report = aggregator.report();
    assert_eq!(report.files_total, 2);
    assert_eq!(report.files_done, 1);
    assert_eq!(report.files_failed, 1);
    assert_eq!(report.bytes_total, 30);
    assert_eq!(report.bytes_done, 10);

    let failed = controller
        .tasks()
        .into_iter()
        .find(|task| task.relative_path == "b/c.txt")
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.attempt_count, 1);
    let error = failed.last_error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::Network);
    assert!(error.message.contains("502"));

    assert_eq!(controller.retry_failed().unwrap(), 1);
    assert_eq!(controller.wait_until_settled().await, Phase::Completed);

    let report = aggregator.report();
    assert_eq!(report.files_done, 2);
    assert_eq!(report.files_failed, 0);
    assert_eq!(report.bytes_done, 30);

    let retried = controller
        .tasks()
        .into_iter()
        .find(|task| task.relative_path == "b/c.txt")
        .unwrap();
    assert_eq!(retried.status, TaskStatus::Succeeded);
    assert_eq!(retried.attempt_count, 2);
    assert!(retried.last_error.is_none());
}

#[tokio::test]
async fn pause_gates_new_dequeues_while_in_flight_finishes() {
    let server = MockServer::start().await;
    mount_empty_listings(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::write(dir.path().join(name), b"data").unwrap();
    }

    let controller = controller_with(&server, 1);
    let mut events = controller.subscribe();
    controller.start(dir.path(), 10).await.unwrap();

    // Let the single worker claim the first task, then pause mid-flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.pause().unwrap();
    assert_eq!(controller.phase(), Phase::Paused);

    // The in-flight upload drains; nothing new is dequeued afterwards.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.succeeded, 1);
    assert_eq!(snapshot.in_progress, 0);
    assert_eq!(snapshot.pending, 2);

    let started = drain_events(&mut events)
        .iter()
        .filter(|event| matches!(event, SyncEvent::TaskStarted { .. }))
        .count();
    assert_eq!(started, 1);

    controller.resume().unwrap();
    assert_eq!(controller.wait_until_settled().await, Phase::Completed);
    assert_eq!(controller.snapshot().succeeded, 3);
}

#[tokio::test]
async fn stop_cancels_pending_and_retry_resumes_without_reupload() {
    let server = MockServer::start().await;
    mount_empty_listings(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("a.txt"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("b.txt"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("c.txt"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::write(dir.path().join(name), b"data").unwrap();
    }

    let controller = controller_with(&server, 1);
    controller.start(dir.path(), 10).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.stop().unwrap();
    assert_eq!(controller.wait_until_settled().await, Phase::Stopped);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.succeeded, 1);
    assert_eq!(snapshot.cancelled, 2);
    assert_eq!(snapshot.pending, 0);

    // Retrying a stopped session revives only what never finished.
    assert_eq!(controller.retry_failed().unwrap(), 2);
    assert_eq!(controller.wait_until_settled().await, Phase::Completed);
    assert_eq!(controller.snapshot().succeeded, 3);
    assert_eq!(controller.snapshot().cancelled, 0);
}

#[tokio::test]
async fn source_changed_is_reported_as_its_own_error_kind() {
    let server = MockServer::start().await;
    mount_empty_listings(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"data").unwrap();
    std::fs::write(dir.path().join("z.txt"), b"doomed").unwrap();

    let controller = controller_with(&server, 1);
    controller.start(dir.path(), 10).await.unwrap();

    // Delete the second file while the first is still uploading.
    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::remove_file(dir.path().join("z.txt")).unwrap();

    assert_eq!(controller.wait_until_settled().await, Phase::Completed);
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.succeeded, 1);
    assert_eq!(snapshot.failed, 1);

    let failed = controller
        .tasks()
        .into_iter()
        .find(|task| task.relative_path == "z.txt")
        .unwrap();
    let error = failed.last_error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::SourceChanged);
    assert_ne!(error.kind, TaskErrorKind::Network);
}

#[tokio::test]
async fn size_drift_fails_without_touching_the_network() {
    let server = MockServer::start().await;
    mount_empty_listings(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("a.txt"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"data").unwrap();
    std::fs::write(dir.path().join("z.txt"), b"original").unwrap();

    let controller = controller_with(&server, 1);
    controller.start(dir.path(), 10).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::write(dir.path().join("z.txt"), b"grown past enumeration size").unwrap();

    assert_eq!(controller.wait_until_settled().await, Phase::Completed);
    let failed = controller
        .tasks()
        .into_iter()
        .find(|task| task.relative_path == "z.txt")
        .unwrap();
    let error = failed.last_error.unwrap();
    assert_eq!(error.kind, TaskErrorKind::SourceChanged);
    assert!(error.message.contains("size changed"));
}

#[tokio::test]
async fn illegal_commands_are_rejected_and_change_nothing() {
    let server = MockServer::start().await;
    let controller = controller_with(&server, 1);

    for (result, command) in [
        (controller.pause().unwrap_err(), "pause"),
        (controller.resume().unwrap_err(), "resume"),
        (controller.stop().unwrap_err(), "stop"),
        (controller.retry_failed().unwrap_err(), "retry_failed"),
    ] {
        match result {
            ControllerError::InvalidStateTransition {
                command: rejected,
                phase,
            } => {
                assert_eq!(rejected, command);
                assert_eq!(phase, Phase::Idle);
            }
            other => panic!("expected InvalidStateTransition, got {other:?}"),
        }
    }
    assert_eq!(controller.phase(), Phase::Idle);
}

#[tokio::test]
async fn commands_invalid_for_the_current_phase_leave_it_unchanged() {
    let server = MockServer::start().await;
    mount_empty_listings(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"data").unwrap();

    let controller = controller_with(&server, 1);
    controller.start(dir.path(), 10).await.unwrap();

    // Double-start while running.
    let err = controller.start(dir.path(), 10).await.unwrap_err();
    assert!(matches!(
        err,
        ControllerError::InvalidStateTransition {
            command: "start",
            phase: Phase::Running,
        }
    ));

    controller.pause().unwrap();
    assert!(matches!(
        controller.pause().unwrap_err(),
        ControllerError::InvalidStateTransition {
            command: "pause",
            phase: Phase::Paused,
        }
    ));
    assert!(matches!(
        controller.retry_failed().unwrap_err(),
        ControllerError::InvalidStateTransition {
            command: "retry_failed",
            phase: Phase::Paused,
        }
    ));
    assert_eq!(controller.phase(), Phase::Paused);

    controller.resume().unwrap();
    assert!(matches!(
        controller.resume().unwrap_err(),
        ControllerError::InvalidStateTransition {
            command: "resume",
            phase: Phase::Running,
        }
    ));

    assert_eq!(controller.wait_until_settled().await, Phase::Completed);
}

#[tokio::test]
async fn empty_root_completes_immediately() {
    let server = MockServer::start().await;
    mount_empty_listings(&server).await;

    let dir = tempdir().unwrap();
    let controller = controller_with(&server, 3);
    controller.start(dir.path(), 10).await.unwrap();

    assert_eq!(controller.wait_until_settled().await, Phase::Completed);
    assert_eq!(controller.snapshot().total, 0);
}

#[tokio::test]
async fn missing_root_restores_the_previous_phase() {
    let server = MockServer::start().await;
    let controller = controller_with(&server, 1);

    let err = controller
        .start(Path::new("/no/such/dir"), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::Enumeration(_)));
    assert_eq!(controller.phase(), Phase::Idle);
}

#[tokio::test]
async fn starting_again_discards_the_previous_session() {
    let server = MockServer::start().await;
    mount_empty_listings(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("a.txt"))
        .respond_with(ResponseTemplate::new(201))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("late.txt"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"data").unwrap();

    let controller = controller_with(&server, 2);
    controller.start(dir.path(), 10).await.unwrap();
    assert_eq!(controller.wait_until_settled().await, Phase::Completed);
    assert_eq!(controller.snapshot().total, 1);

    // Uploads are unconditional: a second session re-uploads everything it
    // enumerates, including files that succeeded before.
    std::fs::write(dir.path().join("late.txt"), b"new").unwrap();
    controller.start(dir.path(), 10).await.unwrap();
    assert_eq!(controller.wait_until_settled().await, Phase::Completed);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.total, 2);
    assert_eq!(snapshot.succeeded, 2);
}

#[tokio::test]
async fn terminal_statuses_account_for_every_enqueued_task() {
    let server = MockServer::start().await;
    mount_empty_listings(&server).await;
    // Every second file fails; the rest succeed.
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .and(body_string_contains("odd"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/uploads"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    for i in 0..20 {
        let name = if i % 2 == 0 {
            format!("even-{i}.bin")
        } else {
            format!("odd-{i}.bin")
        };
        std::fs::write(dir.path().join(name), b"x").unwrap();
    }

    let controller = controller_with(&server, 5);
    controller.start(dir.path(), 10).await.unwrap();
    assert_eq!(controller.wait_until_settled().await, Phase::Completed);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.total, 20);
    assert_eq!(snapshot.succeeded + snapshot.failed + snapshot.cancelled, 20);
    assert_eq!(snapshot.succeeded, 10);
    assert_eq!(snapshot.failed, 10);
    assert!(snapshot.is_quiescent());

    // Every failed task carries a cause.
    for task in controller.tasks() {
        if task.status == TaskStatus::Failed {
            assert!(task.last_error.is_some());
        }
    }
}
