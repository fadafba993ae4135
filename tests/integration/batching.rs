//! Edit cycle batching.
//!
//! These tests drive the `ModificationSynchronizer` directly over a shared
//! graph: signals arriving during a cycle form the next batch, batched and
//! one-at-a-time handling converge to the same graph, the cycle excludes
//! every other lock holder, and failing batches are retried then dropped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use constellation::core::{GraphDelta, NewTask, NodePatch, TaskGraph, TaskId};
use constellation::orchestration::{
    AssignmentLock, EventBus, FnOracle, ModificationSynchronizer, OracleError, ReasoningOracle,
    SyncProgress,
};

use crate::fixtures::{
    completed_event, fast_config, graph_from, id, wait_for_processed, with_timeout,
    ScriptedOracle,
};

struct Rig {
    lock: Arc<AssignmentLock>,
    bus: Arc<EventBus>,
    progress: Arc<SyncProgress>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Rig {
    fn start(graph: TaskGraph, oracle: Arc<dyn ReasoningOracle>, max_edit_attempts: u32) -> Self {
        let mut config = fast_config();
        config.max_edit_attempts = max_edit_attempts;
        let lock = Arc::new(AssignmentLock::new(graph));
        let bus = Arc::new(EventBus::new());
        let sync =
            ModificationSynchronizer::new(Arc::clone(&lock), Arc::clone(&bus), oracle, &config);
        let progress = sync.progress();
        let cancel = CancellationToken::new();
        let handle = sync.spawn(cancel.clone());
        Self {
            lock,
            bus,
            progress,
            cancel,
            handle,
        }
    }

    async fn stop(self) -> TaskGraph {
        self.cancel.cancel();
        self.handle.await.unwrap();
        let graph = self.lock.acquire().await;
        graph.clone()
    }
}

/// One follow-up node per handled signal.
fn follow_up_oracle() -> Arc<ScriptedOracle> {
    ScriptedOracle::new(|_snapshot, ids| {
        ids.iter().fold(GraphDelta::new(), |delta, task| {
            let next = format!("{}-f", task);
            delta
                .add_node(NewTask::new(next.as_str(), "follow-up"))
                .add_edge(task.clone(), next.as_str())
                .modify_node(NodePatch::new(task.clone()).description("handled"))
        })
    })
}

fn shape(graph: &TaskGraph) -> (Vec<(TaskId, String)>, Vec<(TaskId, TaskId)>) {
    let snapshot = graph.snapshot();
    let mut nodes: Vec<_> = snapshot
        .nodes
        .iter()
        .map(|n| (n.id.clone(), n.description.clone()))
        .collect();
    nodes.sort();
    let mut edges: Vec<_> = snapshot
        .edges
        .iter()
        .map(|e| (e.from.clone(), e.to.clone()))
        .collect();
    edges.sort();
    (nodes, edges)
}

/// Test: Signals queue behind a running cycle
/// Given an oracle that is slow on its first call
/// When three more signals arrive during that call
/// Then they are handled together in one second cycle
#[tokio::test]
async fn test_signals_during_cycle_form_next_batch() {
    let calls: Arc<Mutex<Vec<Vec<TaskId>>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&calls);
    let oracle = FnOracle::new(move |_snapshot, ids| {
        let recorded = Arc::clone(&recorded);
        async move {
            let first = {
                let mut calls = recorded.lock().unwrap();
                calls.push(ids);
                calls.len() == 1
            };
            if first {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok::<_, OracleError>(GraphDelta::new())
        }
    });

    let rig = Rig::start(graph_from(&["a", "b", "c", "d"], &[]), Arc::new(oracle), 3);
    rig.bus.publish(completed_event("a"));
    with_timeout(async {
        while calls.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;

    rig.bus.publish(completed_event("c"));
    rig.bus.publish(completed_event("b"));
    rig.bus.publish(completed_event("d"));
    wait_for_processed(&rig.progress, 4).await;

    assert_eq!(
        *calls.lock().unwrap(),
        vec![vec![id("a")], vec![id("b"), id("c"), id("d")]]
    );
    assert_eq!(rig.progress.edit_cycles(), 2);
    rig.stop().await;
}

/// Test: Batched and sequential handling converge
/// Given the same three signals for disjoint tasks
/// When handled in one batch versus one cycle each
/// Then the resulting graphs have the same nodes and edges
#[tokio::test]
async fn test_batched_edits_match_sequential() {
    let base = || graph_from(&["a", "b", "c"], &[("a", "c")]);

    let batched_oracle = follow_up_oracle();
    let batched = Rig::start(base(), batched_oracle.clone(), 3);
    for task in ["a", "b", "c"] {
        batched.bus.publish(completed_event(task));
    }
    wait_for_processed(&batched.progress, 3).await;
    let batched_graph = batched.stop().await;
    assert_eq!(batched_oracle.calls().len(), 1);
    assert_eq!(batched_graph.version(), 1);

    let sequential_oracle = follow_up_oracle();
    let sequential = Rig::start(base(), sequential_oracle.clone(), 3);
    for (n, task) in ["a", "b", "c"].into_iter().enumerate() {
        sequential.bus.publish(completed_event(task));
        wait_for_processed(&sequential.progress, n as u64 + 1).await;
    }
    let sequential_graph = sequential.stop().await;
    assert_eq!(sequential_oracle.calls().len(), 3);
    assert_eq!(sequential_graph.version(), 3);

    assert_eq!(shape(&batched_graph), shape(&sequential_graph));
    assert!(batched_graph.check_invariants().is_ok());
}

/// Test: Mutual exclusion
/// Given another holder of the assignment lock
/// When a signal arrives
/// Then the edit cycle waits for the lock and runs once it is released
#[tokio::test]
async fn test_edit_cycle_waits_for_lock_holder() {
    let oracle = follow_up_oracle();
    let rig = Rig::start(graph_from(&["a"], &[]), oracle.clone(), 3);

    let guard = rig.lock.acquire().await;
    rig.bus.publish(completed_event("a"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.progress.processed(), 0);
    assert!(oracle.calls().is_empty());
    drop(guard);

    wait_for_processed(&rig.progress, 1).await;
    let graph = rig.stop().await;
    assert!(graph.contains(&id("a-f")));
}

/// Test: Rejected batches
/// Given an oracle that always proposes a cycle
/// When the edit fails on every attempt
/// Then the signal is dropped and the graph is unchanged
#[tokio::test]
async fn test_rejected_batch_dropped_after_attempts() {
    let oracle = ScriptedOracle::new(|_snapshot, _ids| GraphDelta::new().add_edge("b", "a"));
    let rig = Rig::start(graph_from(&["a", "b"], &[("a", "b")]), oracle.clone(), 2);

    rig.bus.publish(completed_event("a"));
    wait_for_processed(&rig.progress, 1).await;

    assert_eq!(oracle.calls().len(), 2);
    assert_eq!(rig.progress.rejected(), 2);
    assert_eq!(rig.progress.dropped(), 1);
    assert_eq!(rig.progress.edit_cycles(), 0);

    let graph = rig.stop().await;
    assert_eq!(graph.version(), 0);
    assert!(!graph.has_edge(&id("b"), &id("a")));
}

/// Test: Stale base version
/// Given an oracle that computes its delta against an old version
/// When the delta is validated
/// Then it is rejected until the signal is dropped
#[tokio::test]
async fn test_stale_delta_rejected() {
    let oracle = ScriptedOracle::new(|_snapshot, _ids| {
        GraphDelta::new()
            .with_base_version(7)
            .add_node(NewTask::new("late", "computed against v7"))
    });
    let rig = Rig::start(graph_from(&["a"], &[]), oracle, 3);

    rig.bus.publish(completed_event("a"));
    wait_for_processed(&rig.progress, 1).await;
    assert_eq!(rig.progress.dropped(), 1);

    let graph = rig.stop().await;
    assert!(!graph.contains(&id("late")));
}

/// Test: Lifecycle events that are not signals
/// Given a graph-modified event on the bus
/// When the synchronizer sees it
/// Then no edit cycle runs
#[tokio::test]
async fn test_non_signal_events_ignored() {
    let oracle = follow_up_oracle();
    let rig = Rig::start(graph_from(&["a"], &[]), oracle.clone(), 3);
    let summary = rig.lock.acquire().await.summary();

    rig.bus
        .publish(constellation::OrchestrationEvent::GraphModified {
            affected: vec![id("a")],
            before: summary,
            after: summary,
        });
    rig.bus.publish(completed_event("a"));
    wait_for_processed(&rig.progress, 1).await;

    assert_eq!(oracle.calls(), vec![(0, vec![id("a")])]);
    rig.stop().await;
}
