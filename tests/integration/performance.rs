//! Performance thresholds.
//!
//! Loose wall-clock bounds that catch accidental quadratic behaviour in the
//! dispatch loop and in delta validation. They run in debug builds, so the
//! limits are generous.

use std::time::{Duration, Instant};

use constellation::core::{GraphDelta, NewTask, TaskGraph, TaskState};

use crate::fixtures::{id, independent_graph, task, Behaviour, Harness};

/// Test: Dispatch throughput
/// Given 1000 independent tasks and eight instant devices
/// When the plan runs
/// Then it finishes within 10 seconds
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_plan_throughput() {
    let h = Harness::new();
    for i in 0..8 {
        h.add_device(&format!("d{}", i), &["general"], Behaviour::default());
    }

    let start = Instant::now();
    let report = h.run(independent_graph(1_000)).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(report.count(TaskState::Completed), 1_000);
    assert!(
        elapsed < Duration::from_secs(10),
        "1000 tasks took {:?}",
        elapsed
    );
}

/// Test: Delta validation cost
/// Given a 1000-task graph where every task depends on the two before it
/// When 100 small deltas are applied one by one
/// Then all of them finish within 5 seconds
#[test]
fn test_apply_delta_on_large_graph() {
    let mut graph = TaskGraph::new();
    for i in 0..1_000 {
        graph.add_node(task(&format!("s{}", i))).unwrap();
        for back in 1..=2 {
            if i >= back {
                graph
                    .add_edge(&id(&format!("s{}", i - back)), &id(&format!("s{}", i)))
                    .unwrap();
            }
        }
    }
    assert_eq!(graph.edge_count(), 1_997);

    let start = Instant::now();
    for i in 0..100 {
        let next = format!("extra-{}", i);
        let delta = GraphDelta::new()
            .with_base_version(graph.version())
            .add_node(NewTask::new(next.as_str(), "appended"))
            .add_edge("s999", next.as_str());
        graph.apply_delta(&delta).unwrap();
    }
    let elapsed = start.elapsed();

    assert_eq!(graph.version(), 100);
    assert_eq!(graph.dependents(&id("s999")).len(), 100);
    assert!(
        elapsed < Duration::from_secs(5),
        "100 deltas took {:?}",
        elapsed
    );
}

/// Test: Readiness query cost
/// Given 5000 independent tasks
/// When ready tasks are computed 100 times
/// Then it takes under 2 seconds in total
#[test]
fn test_ready_tasks_scales() {
    let graph = independent_graph(5_000);

    let start = Instant::now();
    for _ in 0..100 {
        assert_eq!(graph.ready_tasks().len(), 5_000);
    }
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_secs(2),
        "ready_tasks x100 took {:?}",
        elapsed
    );
}
