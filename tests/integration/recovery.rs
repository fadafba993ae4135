//! Failure handling and recovery.
//!
//! These tests verify retries and the retry device policy, acknowledgement
//! timeouts, cancellation of assigned tasks by graph edits, propagation of
//! failures to dependents, and that a stuck oracle cannot wedge a run.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use constellation::core::{ErrorKind, GraphDelta, NewTask, TaskGraph, TaskId, TaskState};
use constellation::device::DeviceId;
use constellation::orchestration::{
    FnOracle, OracleError, OrchestrationEvent, RetryDevicePolicy, StrategyKind,
};

use crate::fixtures::{
    drain_events, fast_config, graph_from, id, task, Behaviour, Harness, ScriptedOracle,
};

fn single(name: &str) -> TaskGraph {
    graph_from(&[name], &[])
}

/// Test: Acknowledgement timeout
/// Given a device that never acknowledges
/// When the retry budget is spent on timeouts
/// Then the task fails with DispatchTimeout and never executed
#[tokio::test]
async fn test_ack_timeout_fails_task() {
    let mut config = fast_config();
    config.ack_timeout_ms = 50;
    config.max_retries = 1;
    let h = Harness::with_config(config);
    h.add_device("mute", &["general"], Behaviour::never_ack());
    let mut events = h.bus.subscribe();

    let report = h.run(single("ping")).await.unwrap();

    let ping = report.get("ping").unwrap();
    assert_eq!(ping.state, TaskState::Failed);
    assert_eq!(ping.attempts, 2);
    assert_eq!(
        ping.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::DispatchTimeout)
    );
    assert!(h.tracker.executions_of("ping").is_empty());
    assert_eq!(h.registry.total_load(), 0);

    let failed = drain_events(&mut events).into_iter().any(|e| {
        matches!(
            e,
            OrchestrationEvent::TaskFailed { kind: ErrorKind::DispatchTimeout, .. }
        )
    });
    assert!(failed);
}

/// Test: Timeout then recovery elsewhere
/// Given a mute device and a live device, with PreferDifferent retries
/// When the first dispatch times out on the mute device
/// Then the retry lands on the live device and completes
#[tokio::test]
async fn test_ack_timeout_retries_on_other_device() {
    let mut config = fast_config();
    config.ack_timeout_ms = 50;
    config.retry_policy = RetryDevicePolicy::PreferDifferent;
    let h = Harness::with_config(config);
    h.add_device("a-mute", &["general"], Behaviour::never_ack());
    h.add_device("b-live", &["general"], Behaviour::default());

    let report = h.run(single("ping")).await.unwrap();

    let ping = report.get("ping").unwrap();
    assert_eq!(ping.state, TaskState::Completed);
    assert_eq!(ping.attempts, 2);
    assert_eq!(ping.device, Some(DeviceId::from("b-live")));
}

/// Test: Retry policy Any
/// Given a broken device that sorts first and a healthy one
/// When retries use the plain strategy
/// Then every attempt goes back to the broken device and the task fails
#[tokio::test]
async fn test_retry_policy_any_follows_strategy() {
    let mut config = fast_config();
    config.max_retries = 2;
    config.retry_policy = RetryDevicePolicy::Any;
    let h = Harness::with_config(config);
    h.add_device("a-broken", &["general"], Behaviour::always_fail());
    h.add_device("b-healthy", &["general"], Behaviour::default());

    let report = h.run(single("job")).await.unwrap();

    let job = report.get("job").unwrap();
    assert_eq!(job.state, TaskState::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error.as_ref().map(|e| e.kind), Some(ErrorKind::ExecutionFailed));
    assert_eq!(job.result, Some(json!({ "exit_code": 1 })));
    let runs = h.tracker.executions_of("job");
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|r| r.device_id == DeviceId::from("a-broken")));
    let attempts: Vec<u32> = runs.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

/// Test: Retry policy PreferDifferent
/// Given the same broken and healthy devices
/// When retries prefer a different device
/// Then the second attempt completes on the healthy device
#[tokio::test]
async fn test_retry_policy_prefer_different() {
    let mut config = fast_config();
    config.retry_policy = RetryDevicePolicy::PreferDifferent;
    let h = Harness::with_config(config);
    h.add_device("a-broken", &["general"], Behaviour::always_fail());
    h.add_device("b-healthy", &["general"], Behaviour::default());

    let report = h.run(single("job")).await.unwrap();

    let job = report.get("job").unwrap();
    assert_eq!(job.state, TaskState::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.device, Some(DeviceId::from("b-healthy")));
}

/// Test: Retry policy SameDevice
/// Given round-robin placement and a device that fails each task once
/// When retries stay on the same device
/// Then the retry runs where the first attempt ran
#[tokio::test]
async fn test_retry_policy_same_device() {
    let mut config = fast_config();
    config.strategy = StrategyKind::RoundRobin;
    config.retry_policy = RetryDevicePolicy::SameDevice;
    let h = Harness::with_config(config);
    h.add_device("a-flaky", &["general"], Behaviour::fail_first(1));
    h.add_device("b-healthy", &["general"], Behaviour::default());

    let report = h.run(single("job")).await.unwrap();

    let job = report.get("job").unwrap();
    assert_eq!(job.state, TaskState::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.device, Some(DeviceId::from("a-flaky")));
    assert!(h
        .tracker
        .executions()
        .iter()
        .all(|e| e.device_id == DeviceId::from("a-flaky")));
}

/// Test: Backend errors
/// Given a device whose backend raises errors
/// When retries are exhausted
/// Then the task fails with DeviceError
#[tokio::test]
async fn test_backend_error_is_device_error() {
    let mut config = fast_config();
    config.max_retries = 0;
    let h = Harness::with_config(config);
    h.add_device(
        "crashy",
        &["general"],
        Behaviour {
            always_fail: true,
            error_instead: true,
            ..Default::default()
        },
    );

    let report = h.run(single("job")).await.unwrap();

    let job = report.get("job").unwrap();
    assert_eq!(job.state, TaskState::Failed);
    assert_eq!(job.attempts, 1);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::DeviceError);
    assert!(error.message.contains("crashy crashed"));
}

/// Test: Failure propagation
/// Given a -> b -> c where a can only run on a broken device
/// When a fails for good
/// Then b and c are cancelled as unreachable
#[tokio::test]
async fn test_failure_cancels_dependents_as_unreachable() {
    let mut config = fast_config();
    config.max_retries = 0;
    let h = Harness::with_config(config);
    h.add_device("broken", &["broken"], Behaviour::always_fail());
    h.add_device("healthy", &["general"], Behaviour::default());

    let mut graph = TaskGraph::new();
    graph.add_node(task("a").with_capabilities(["broken"])).unwrap();
    graph.add_node(task("b")).unwrap();
    graph.add_node(task("c")).unwrap();
    graph.add_edge(&id("a"), &id("b")).unwrap();
    graph.add_edge(&id("b"), &id("c")).unwrap();

    let report = h.run(graph).await.unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.get("a").unwrap().state, TaskState::Failed);
    for dependent in ["b", "c"] {
        let result = report.get(dependent).unwrap();
        assert_eq!(result.state, TaskState::Cancelled);
        assert_eq!(
            result.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Unreachable)
        );
        assert!(h.tracker.executions_of(dependent).is_empty());
    }
}

/// Test: Oracle routes around a failure
/// Given a -> b where a fails for good
/// When the oracle adds a replacement for a and rewires b onto it
/// Then the replacement and b both complete
#[tokio::test]
async fn test_oracle_replaces_failed_task() {
    let mut config = fast_config();
    config.max_retries = 0;
    let h = Harness::with_config(config);
    h.add_device("z-broken", &["broken"], Behaviour::always_fail());
    h.add_device("a-good", &["general"], Behaviour::default());

    let oracle = ScriptedOracle::new(|snapshot, ids| {
        let a_failed = snapshot
            .node(&id("a"))
            .is_some_and(|n| n.state == TaskState::Failed);
        if ids.contains(&id("a")) && a_failed && snapshot.node(&id("a-alt")).is_none() {
            GraphDelta::new()
                .add_node(NewTask::new("a-alt", "retry a elsewhere").with_capabilities(["general"]))
                .remove_edge("a", "b")
                .add_edge("a-alt", "b")
        } else {
            GraphDelta::new()
        }
    });

    let mut graph = TaskGraph::new();
    graph.add_node(task("a").with_capabilities(["broken"])).unwrap();
    graph.add_node(task("b").with_capabilities(["general"])).unwrap();
    graph.add_edge(&id("a"), &id("b")).unwrap();

    let report = h.run_with(graph, oracle).await.unwrap();

    assert_eq!(report.get("a").unwrap().state, TaskState::Failed);
    assert_eq!(report.get("a-alt").unwrap().state, TaskState::Completed);
    assert_eq!(report.get("b").unwrap().state, TaskState::Completed);
    assert_eq!(report.final_version, 1);
    let alt = &h.tracker.executions_of("a-alt")[0];
    let b = &h.tracker.executions_of("b")[0];
    assert!(b.started > alt.finished);
}

/// Test: Cancelling an assigned task
/// Given a task waiting on a slow acknowledgement
/// When an edit removes it while it is still assigned
/// Then the acknowledgement completes, execution never starts, and load is released
#[tokio::test]
async fn test_edit_cancels_assigned_task() {
    let h = Harness::new();
    h.add_device("quick-box", &["quick"], Behaviour::default());
    h.add_device("lag-box", &["lag"], Behaviour::ack_delay(1_000));
    let mut events = h.bus.subscribe();

    let oracle = ScriptedOracle::new(|snapshot, ids| {
        let stuck_assigned = snapshot
            .node(&id("stuck"))
            .is_some_and(|n| n.state == TaskState::Assigned);
        if ids.contains(&id("first")) && stuck_assigned {
            GraphDelta::new().remove_node("stuck")
        } else {
            GraphDelta::new()
        }
    });

    let mut graph = TaskGraph::new();
    graph
        .add_node(task("first").with_capabilities(["quick"]))
        .unwrap();
    graph.add_node(task("stuck").with_capabilities(["lag"])).unwrap();
    let report = h.run_with(graph, oracle).await.unwrap();

    assert_eq!(report.get("first").unwrap().state, TaskState::Completed);
    let stuck = report.get("stuck").unwrap();
    assert_eq!(stuck.state, TaskState::Cancelled);
    assert_eq!(
        stuck.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Cancelled)
    );
    assert!(h.tracker.executions_of("stuck").is_empty());
    assert_eq!(h.registry.total_load(), 0);

    let stuck_started = drain_events(&mut events).into_iter().any(|e| {
        matches!(e, OrchestrationEvent::TaskStarted { task_id, .. } if task_id == id("stuck"))
    });
    assert!(!stuck_started);
}

/// Test: Cancelling a task whose execution already began
/// Given a device that acknowledged a slow task while an edit cycle holds the graph
/// When the edit removes the task, still assigned in the graph
/// Then the device call runs to the end, its result is discarded, and load is released
#[tokio::test]
async fn test_edit_lets_started_execution_finish() {
    let h = Harness::new();
    h.add_device("quick-box", &["quick"], Behaviour::default());
    h.add_device(
        "slow-box",
        &["slow"],
        Behaviour {
            ack_delay: Duration::from_millis(20),
            exec_delay: Duration::from_millis(250),
            ..Default::default()
        },
    );
    let mut events = h.bus.subscribe();

    let oracle = FnOracle::new(|_snapshot, ids: Vec<TaskId>| async move {
        if ids.contains(&id("first")) {
            tokio::time::sleep(Duration::from_millis(120)).await;
            Ok::<_, OracleError>(GraphDelta::new().remove_node("stuck"))
        } else {
            Ok(GraphDelta::new())
        }
    });

    let mut graph = TaskGraph::new();
    graph
        .add_node(task("first").with_capabilities(["quick"]))
        .unwrap();
    graph.add_node(task("stuck").with_capabilities(["slow"])).unwrap();
    let report = h.run_with(graph, Arc::new(oracle)).await.unwrap();

    assert_eq!(report.get("first").unwrap().state, TaskState::Completed);
    let stuck = report.get("stuck").unwrap();
    assert_eq!(stuck.state, TaskState::Cancelled);
    assert!(stuck.result.is_none());
    assert_eq!(report.final_version, 1);

    let runs = h.tracker.executions_of("stuck");
    assert_eq!(runs.len(), 1, "execution should run to the end");
    assert_eq!(h.registry.total_load(), 0);

    let reported = drain_events(&mut events).into_iter().any(|e| match e {
        OrchestrationEvent::TaskStarted { task_id, .. }
        | OrchestrationEvent::TaskCompleted { task_id, .. } => task_id == id("stuck"),
        _ => false,
    });
    assert!(!reported);
}

/// Test: Stuck oracle
/// Given an oracle that never answers
/// When edit cycles time out and their signals are dropped
/// Then the run still finishes with every task completed
#[tokio::test]
async fn test_oracle_timeout_does_not_wedge_run() {
    let mut config = fast_config();
    config.edit_timeout_ms = 30;
    config.max_edit_attempts = 2;
    let h = Harness::with_config(config);
    h.add_device("d1", &["general"], Behaviour::default());

    let oracle = FnOracle::new(|_snapshot, _ids| async {
        std::future::pending::<Result<GraphDelta, OracleError>>().await
    });

    let graph = graph_from(&["a", "b"], &[("a", "b")]);
    let report = h.run_with(graph, Arc::new(oracle)).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.edit_cycles, 0);
    assert_eq!(report.final_version, 0);
}
