//! Task fan-out against an in-process WebSocket server

mod common;

use std::time::Duration;

use batchflow::config::ReconnectPolicy;
use batchflow::fanout::{FanoutDispatcher, TARGETS};
use batchflow::{DispatchError, Notifier};
use common::{FakeConn, FakeServer, STEP};
use serde_json::json;
use shared_types::StepStatus;
use tokio::task::JoinHandle;
use tokio::time::timeout;

async fn connected() -> (FakeServer, FakeConn, FanoutDispatcher) {
    let mut server = FakeServer::start().await;
    let (dispatcher, _pump) = FanoutDispatcher::spawn(
        ReconnectPolicy {
            max_attempts: 5,
            delay: Duration::from_millis(50),
        },
        Notifier::disabled(),
        200,
    );
    dispatcher.connect(&server.url()).await.expect("connect");
    let conn = server.accept().await;
    (server, conn, dispatcher)
}

fn launch(dispatcher: &FanoutDispatcher, numbers: &[&str]) -> JoinHandle<Result<(), DispatchError>> {
    let dispatcher = dispatcher.clone();
    let numbers = numbers.iter().map(|s| s.to_string()).collect();
    tokio::spawn(async move { dispatcher.launch(numbers).await })
}

async fn finished(run: JoinHandle<Result<(), DispatchError>>) -> Result<(), DispatchError> {
    timeout(STEP, run)
        .await
        .expect("Timeout waiting for launch to settle")
        .expect("launch task panicked")
}

async fn wait_until_running(dispatcher: &FanoutDispatcher, server_type: u8) {
    timeout(STEP, async {
        while dispatcher.snapshot().current_target != Some(server_type) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timeout waiting for outstanding task");
}

#[tokio::test]
async fn test_targets_run_in_order_with_normalized_numbers() {
    let (_server, mut conn, dispatcher) = connected().await;
    let run = launch(&dispatcher, &["0123456789", "234567890"]);

    for target in TARGETS {
        let frame = conn.recv().await;
        assert_eq!(
            frame,
            json!({
                "action": "start_task",
                "serverType": target.server_type,
                "cusnoList": ["123456789", "234567890"]
            })
        );
        conn.send(json!({"type": "task_start", "serverType": target.server_type}));
        conn.send(json!({
            "type": "task_log",
            "serverType": target.server_type,
            "value": format!("{} working", target.name)
        }));
        conn.send(json!({"type": "task_complete", "serverType": target.server_type}));
    }

    finished(run).await.expect("all targets complete");

    let snapshot = dispatcher.snapshot();
    assert!(!snapshot.running);
    assert_eq!(snapshot.statuses, [StepStatus::Success; 3]);
    assert_eq!(snapshot.current_target, None);
    assert!(snapshot.logs.iter().any(|l| l == "[edwap1t] edwap1t working"));
    assert!(snapshot
        .logs
        .iter()
        .any(|l| l == "[INFO] All task servers completed"));
}

#[tokio::test]
async fn test_completion_for_other_target_is_ignored() {
    let (_server, mut conn, dispatcher) = connected().await;
    let run = launch(&dispatcher, &["123456789"]);

    assert_eq!(conn.recv().await["serverType"], 1);
    wait_until_running(&dispatcher, 1).await;

    conn.send(json!({"type": "task_complete", "serverType": 2}));
    conn.send(json!({"type": "task_error", "serverType": 3, "message": "stale"}));
    // Nothing advances on foreign completions
    assert!(conn.try_recv(Duration::from_millis(200)).await.is_none());
    assert_eq!(dispatcher.snapshot().current_target, Some(1));
    assert!(!run.is_finished());

    conn.send(json!({"type": "task_complete", "serverType": 1}));
    assert_eq!(conn.recv().await["serverType"], 2);

    dispatcher.cancel();
    assert!(finished(run).await.unwrap_err().is_cancellation());
}

#[tokio::test]
async fn test_cancel_notifies_server_and_rejects_run() {
    let (_server, mut conn, dispatcher) = connected().await;
    let run = launch(&dispatcher, &["123456789"]);

    conn.recv().await;
    conn.send(json!({"type": "task_start", "serverType": 1}));
    wait_until_running(&dispatcher, 1).await;

    assert!(dispatcher.cancel());
    assert_eq!(
        conn.recv().await,
        json!({"action": "task_cancel", "serverType": 1, "cusnoList": null})
    );

    let err = finished(run).await.unwrap_err();
    assert!(err.is_cancellation());
    assert!(!dispatcher.snapshot().running);
    assert_eq!(dispatcher.snapshot().statuses[0], StepStatus::Error);

    // Late server acknowledgement is harmless
    conn.send(json!({"type": "task_cancelled", "serverType": 1}));
    assert!(!dispatcher.cancel());
}

#[tokio::test]
async fn test_remote_error_surfaces_and_allows_relaunch() {
    let (_server, mut conn, dispatcher) = connected().await;
    let run = launch(&dispatcher, &["123456789"]);

    conn.recv().await;
    conn.send(json!({"type": "task_complete", "serverType": 1}));
    conn.recv().await;
    conn.send(json!({"type": "task_error", "serverType": 2, "message": "disk full"}));

    let err = finished(run).await.unwrap_err();
    assert_eq!(
        err,
        DispatchError::RemoteTask {
            server: "edwap1t".to_string(),
            message: "disk full".to_string()
        }
    );
    assert!(!err.is_cancellation());
    let snapshot = dispatcher.snapshot();
    assert_eq!(
        snapshot.statuses,
        [StepStatus::Success, StepStatus::Error, StepStatus::Idle]
    );
    assert!(!snapshot.running);

    let rerun = launch(&dispatcher, &["123456789"]);
    assert_eq!(conn.recv().await["serverType"], 1);
    assert_eq!(dispatcher.snapshot().statuses, [StepStatus::Idle; 3]);
    dispatcher.cancel();
    finished(rerun).await.unwrap_err();
}

#[tokio::test]
async fn test_second_launch_while_running_is_rejected() {
    let (_server, mut conn, dispatcher) = connected().await;
    let run = launch(&dispatcher, &["123456789"]);
    conn.recv().await;
    wait_until_running(&dispatcher, 1).await;

    assert_eq!(
        dispatcher.launch(vec!["234567890".to_string()]).await,
        Err(DispatchError::AlreadyRunning)
    );
    assert!(conn.try_recv(Duration::from_millis(100)).await.is_none());
    assert_eq!(dispatcher.snapshot().current_target, Some(1));

    dispatcher.cancel();
    finished(run).await.unwrap_err();
}

#[tokio::test]
async fn test_remote_lock_blocks_launch() {
    let (_server, mut conn, dispatcher) = connected().await;
    conn.send(json!({"type": "task_state_update", "state": false}));

    timeout(STEP, async {
        while dispatcher.snapshot().remote_permits {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timeout waiting for lock update");

    assert_eq!(
        dispatcher.launch(vec!["123456789".to_string()]).await,
        Err(DispatchError::LockDenied)
    );
    assert!(conn.try_recv(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_connection_loss_rejects_outstanding_task() {
    let (mut server, mut conn, dispatcher) = connected().await;
    let run = launch(&dispatcher, &["123456789"]);
    conn.recv().await;
    wait_until_running(&dispatcher, 1).await;

    conn.drop_abruptly();
    let err = finished(run).await.unwrap_err();
    assert_eq!(err, DispatchError::Cancelled("connection lost".to_string()));
    assert_eq!(dispatcher.snapshot().statuses[0], StepStatus::Error);

    // The socket comes back on its own
    server.accept().await;
}
