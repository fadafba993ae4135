//! Parallel dispatch correctness.
//!
//! These tests verify that a task is never executing on two devices at the
//! same time, even with retries and concurrent oracle edits, and that
//! dependencies hold under parallel execution.

use std::collections::HashMap;

use constellation::core::{GraphDelta, NewTask, TaskId, TaskState};

use crate::fixtures::{
    id, independent_graph, layered_graph, Behaviour, Execution, Harness, ScriptedOracle,
};

/// Last (successful) execution of every task.
fn last_executions(executions: &[Execution]) -> HashMap<TaskId, Execution> {
    let mut last = HashMap::new();
    for execution in executions {
        last.insert(execution.task_id.clone(), execution.clone());
    }
    last
}

/// Test: Single assignment under load
/// Given 200 independent tasks, four devices, one of them flaky
/// When the plan runs with retries
/// Then no task ever executes twice at once and all complete
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_task_runs_twice_concurrently() {
    let h = Harness::new();
    h.add_device("d1", &["general"], Behaviour::exec_delay(2));
    h.add_device("d2", &["general"], Behaviour::exec_delay(1));
    h.add_device("d3", &["general"], Behaviour::default());
    h.add_device("flaky", &["general"], Behaviour::fail_first(1));

    let report = h.run(independent_graph(200)).await.unwrap();

    assert!(report.succeeded(), "report: {:?}", report);
    assert_eq!(report.count(TaskState::Completed), 200);
    assert_eq!(h.tracker.double_runs(), 0);
    assert_eq!(h.registry.total_load(), 0);

    for (task, result) in &report.results {
        let runs = h.tracker.executions_of(task.as_str());
        assert_eq!(
            runs.len() as u32,
            result.attempts,
            "task {} executed {} times over {} attempts",
            task,
            runs.len(),
            result.attempts
        );
    }
}

/// Test: Parallel dispatch
/// Given 12 independent tasks and four slow devices
/// When the plan runs
/// Then several tasks execute at the same time
#[tokio::test]
async fn test_independent_tasks_run_in_parallel() {
    let h = Harness::new();
    for name in ["d1", "d2", "d3", "d4"] {
        h.add_device(name, &["general"], Behaviour::exec_delay(50));
    }

    let report = h.run(independent_graph(12)).await.unwrap();

    assert!(report.succeeded());
    assert!(
        h.tracker.max_concurrent() >= 4,
        "max concurrent executions was {}",
        h.tracker.max_concurrent()
    );
}

/// Test: Dependencies under parallelism
/// Given a layered plan where every task depends on the whole previous layer
/// When it runs on three devices
/// Then no task starts before all of its prerequisites finished
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_layered_plan_respects_dependencies() {
    let h = Harness::new();
    h.add_device("d1", &["general"], Behaviour::exec_delay(1));
    h.add_device("d2", &["general"], Behaviour::exec_delay(2));
    h.add_device("d3", &["general"], Behaviour::default());

    let graph = layered_graph(5, 4);
    let edges = graph.snapshot().edges;
    let report = h.run(graph).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.results.len(), 20);

    let last = last_executions(&h.tracker.executions());
    for edge in edges {
        let prerequisite = &last[&edge.from];
        let dependent = &last[&edge.to];
        assert!(
            dependent.started > prerequisite.finished,
            "{} started before {} finished",
            edge.to,
            edge.from
        );
    }
}

/// Test: Edits interleaved with dispatch
/// Given 40 independent tasks and an oracle adding a follow-up per completion
/// When edits and dispatches interleave
/// Then every task and follow-up runs exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_edits_keep_single_assignment() {
    let h = Harness::new();
    h.add_device("d1", &["general"], Behaviour::exec_delay(1));
    h.add_device("d2", &["general"], Behaviour::exec_delay(3));
    h.add_device("d3", &["general"], Behaviour::default());

    let oracle = ScriptedOracle::new(|snapshot, ids| {
        let mut delta = GraphDelta::new().with_base_version(snapshot.version);
        for task in ids {
            if task.as_str().ends_with("-next") {
                continue;
            }
            let next = format!("{}-next", task);
            if snapshot.node(&id(&next)).is_none() {
                delta = delta
                    .add_node(NewTask::new(next.as_str(), "follow-up"))
                    .add_edge(task.clone(), next.as_str());
            }
        }
        delta
    });

    let report = h
        .run_with(independent_graph(40), oracle.clone())
        .await
        .unwrap();

    assert!(report.succeeded(), "report: {:?}", report);
    assert_eq!(report.results.len(), 80);
    assert!(report.final_version >= 1);
    assert_eq!(h.tracker.double_runs(), 0);
    for i in 0..40 {
        assert_eq!(h.tracker.executions_of(&format!("t{}", i)).len(), 1);
        assert_eq!(h.tracker.executions_of(&format!("t{}-next", i)).len(), 1);
    }
    assert_eq!(oracle.signals_seen(), 80);
}
