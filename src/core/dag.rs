//! Task graph (the constellation) for dependency management.
//!
//! `TaskGraph` is the single owner of every task node and dependency edge of
//! one request. Nodes live in a petgraph arena; the rest of the system refers
//! to them by `TaskId` only. Structural changes after construction go through
//! `apply_delta`, which validates a whole edit on a scratch copy before
//! committing it.

use crate::core::delta::{DeltaOutcome, Edge, EditOp, GraphDelta, Rejection};
use crate::core::task::{ErrorKind, TaskError, TaskId, TaskNode, TaskResult, TaskState};
use crate::device::DeviceId;
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Per-state counts of a graph at one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphSummary {
    pub version: u64,
    pub total: usize,
    pub edges: usize,
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl std::fmt::Display for GraphSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "v{} tasks={} edges={} pending={} assigned={} running={} completed={} failed={} cancelled={}",
            self.version,
            self.total,
            self.edges,
            self.pending,
            self.assigned,
            self.running,
            self.completed,
            self.failed,
            self.cancelled
        )
    }
}

/// Serializable form of a graph: a node list plus an edge list.
///
/// This is also the view handed to the reasoning oracle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub version: u64,
    pub nodes: Vec<TaskNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

/// The task dependency graph.
#[derive(Clone)]
pub struct TaskGraph {
    /// Arena of task nodes; edges point from prerequisite to dependent.
    graph: StableDiGraph<TaskNode, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    index: HashMap<TaskId, NodeIndex>,
    /// Bumped on every committed edit.
    version: u64,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            version: 0,
        }
    }

    /// Rebuild a graph from its serialized form.
    ///
    /// The snapshot is validated like any other untrusted input.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let mut graph = Self::new();
        for node in snapshot.nodes {
            graph.add_node(node)?;
        }
        for edge in &snapshot.edges {
            graph.add_edge(&edge.from, &edge.to)?;
        }
        graph.check_invariants()?;
        graph.version = snapshot.version;
        Ok(graph)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    // ========== Construction ==========

    /// Add a task node.
    ///
    /// # Errors
    /// Returns `Error::DuplicateTask` if a node with the same id exists,
    /// including a cancelled tombstone.
    pub fn add_node(&mut self, node: TaskNode) -> Result<()> {
        if self.index.contains_key(&node.id) {
            return Err(Error::DuplicateTask(node.id));
        }
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(id, idx);
        Ok(())
    }

    /// Add a dependency: `from` must complete before `to` can start.
    ///
    /// Adding an edge that already exists is a no-op.
    ///
    /// # Errors
    /// Returns an error if either task is unknown, or if the edge would
    /// create a cycle (the graph is left unchanged).
    pub fn add_edge(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_idx = self.node_index(from)?;
        let to_idx = self.node_index(to)?;

        if from_idx == to_idx {
            return Err(Error::Validation(format!(
                "Task {} cannot depend on itself (would create a cycle)",
                from
            )));
        }
        if self.graph.find_edge(from_idx, to_idx).is_some() {
            return Ok(());
        }

        if self.depends_transitively(to, from) {
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                from, to
            )));
        }
        self.graph.add_edge(from_idx, to_idx, ());
        Ok(())
    }

    /// Remove a task from the dependency structure.
    ///
    /// Every incident edge is dropped and the node is kept as a `Cancelled`
    /// tombstone so it still shows up in the final results. Only pending or
    /// assigned tasks can be removed.
    pub fn remove_node(&mut self, id: &TaskId) -> Result<TaskNode> {
        let idx = self.node_index(id)?;
        self.graph[idx].cancel(ErrorKind::Cancelled, "removed by graph edit")?;
        self.detach(idx);
        Ok(self.graph[idx].clone())
    }

    fn detach(&mut self, idx: NodeIndex) {
        let edges: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .chain(self.graph.edges_directed(idx, Direction::Outgoing))
            .map(|e| e.id())
            .collect();
        for edge in edges {
            self.graph.remove_edge(edge);
        }
    }

    // ========== Queries ==========

    fn node_index(&self, id: &TaskId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    fn get_mut(&mut self, id: &TaskId) -> Result<&mut TaskNode> {
        let idx = self.node_index(id)?;
        Ok(&mut self.graph[idx])
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.get(id).map(|n| n.state)
    }

    /// Number of task nodes, tombstones included.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_edge(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    fn neighbours(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Tasks that must complete before `id` can start.
    pub fn prerequisites(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbours(id, Direction::Incoming)
    }

    /// Tasks that wait on `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbours(id, Direction::Outgoing)
    }

    /// Iterate over every node, tombstones included.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    /// Get all pending tasks whose prerequisites have all completed.
    ///
    /// Side-effect free; ids are returned in sorted order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph[idx].state == TaskState::Pending
                    && self
                        .graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .all(|dep| self.graph[dep].state == TaskState::Completed)
            })
            .map(|idx| self.graph[idx].id.clone())
            .collect();
        ready.sort();
        ready
    }

    /// Tasks currently holding a device assignment.
    pub fn active_tasks(&self) -> Vec<TaskId> {
        let mut active: Vec<TaskId> = self
            .tasks()
            .filter(|n| n.state.is_active())
            .map(|n| n.id.clone())
            .collect();
        active.sort();
        active
    }

    /// Whether every task has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.tasks().all(TaskNode::is_terminal)
    }

    /// Get task ids in topological order (prerequisites first).
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            Error::InvariantViolation(format!(
                "cycle detected at task {}",
                self.graph[cycle.node_id()].id
            ))
        })?;
        Ok(sorted
            .into_iter()
            .map(|idx| self.graph[idx].id.clone())
            .collect())
    }

    pub fn summary(&self) -> GraphSummary {
        let mut summary = GraphSummary {
            version: self.version,
            total: self.graph.node_count(),
            edges: self.graph.edge_count(),
            ..Default::default()
        };
        for node in self.tasks() {
            match node.state {
                TaskState::Pending => summary.pending += 1,
                TaskState::Assigned => summary.assigned += 1,
                TaskState::Running => summary.running += 1,
                TaskState::Completed => summary.completed += 1,
                TaskState::Failed => summary.failed += 1,
                TaskState::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    /// Serializable copy of the graph, sorted by id.
    pub fn snapshot(&self) -> GraphSnapshot {
        let mut nodes: Vec<TaskNode> = self.tasks().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut edges: Vec<Edge> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| Edge {
                from: self.graph[from].id.clone(),
                to: self.graph[to].id.clone(),
            })
            .collect();
        edges.sort();
        GraphSnapshot {
            version: self.version,
            nodes,
            edges,
        }
    }

    /// One entry per task ever added.
    pub fn results(&self) -> BTreeMap<TaskId, TaskResult> {
        self.tasks()
            .map(|n| (n.id.clone(), TaskResult::from(n)))
            .collect()
    }

    // ========== Orchestrator transitions ==========

    /// `Pending -> Assigned` on the given device.
    pub fn assign(&mut self, id: &TaskId, device: DeviceId) -> Result<()> {
        self.get_mut(id)?.assign(device)
    }

    /// `Assigned -> Running`.
    pub fn acknowledge(&mut self, id: &TaskId) -> Result<()> {
        self.get_mut(id)?.acknowledge()
    }

    /// `Running -> Completed`.
    pub fn complete(&mut self, id: &TaskId, result: serde_json::Value) -> Result<()> {
        self.get_mut(id)?.complete(result)
    }

    /// `Assigned | Running -> Failed`.
    pub fn fail(
        &mut self,
        id: &TaskId,
        error: TaskError,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        self.get_mut(id)?.fail(error, result)
    }

    /// `Assigned | Running -> Pending` for a retry.
    pub fn requeue(&mut self, id: &TaskId, error: TaskError) -> Result<()> {
        self.get_mut(id)?.requeue(error)
    }

    /// Note on a pending task that no live device can run it.
    pub fn mark_unplaceable(&mut self, id: &TaskId, error: TaskError) -> Result<()> {
        self.get_mut(id)?.mark_unplaceable(error)
    }

    /// Cancel every pending task, recording `Unreachable`.
    ///
    /// Called once nothing can make further progress: at that point every
    /// pending task sits behind a prerequisite that did not complete.
    pub fn cancel_unreachable(&mut self) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for node in self.graph.node_weights_mut() {
            if node.state == TaskState::Pending
                && node
                    .cancel(
                        ErrorKind::Unreachable,
                        "a prerequisite did not complete successfully",
                    )
                    .is_ok()
            {
                cancelled.push(node.id.clone());
            }
        }
        cancelled.sort();
        cancelled
    }

    // ========== Validation and edits ==========

    /// Check single assignment, index integrity, and acyclicity.
    pub fn check_invariants(&self) -> std::result::Result<(), Rejection> {
        if self.index.len() != self.graph.node_count() {
            return Err(Rejection::Invariant(format!(
                "index holds {} ids for {} nodes",
                self.index.len(),
                self.graph.node_count()
            )));
        }
        for (id, &idx) in &self.index {
            let node = self.graph.node_weight(idx).ok_or_else(|| {
                Rejection::Invariant(format!("task {} points at a missing node", id))
            })?;
            if &node.id != id {
                return Err(Rejection::Invariant(format!(
                    "index entry {} points at task {}",
                    id, node.id
                )));
            }
            if !node.assignment_consistent() {
                return Err(Rejection::Invariant(format!(
                    "task {} in state {} has assignment {:?}",
                    id, node.state, node.device
                )));
            }
        }
        toposort(&self.graph, None).map_err(|cycle| Rejection::Cycle {
            task: self.graph[cycle.node_id()].id.clone(),
        })?;
        Ok(())
    }

    /// Whether `to` is reachable from `from` along dependency edges.
    pub fn depends_transitively(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    /// Atomically apply a delta, or reject all of it.
    ///
    /// The delta is applied to a scratch clone in a fixed order: node
    /// removals, node additions, patches, edge removals, edge additions. The
    /// scratch graph is then checked against every invariant and only
    /// swapped in if all checks pass.
    pub fn apply_delta(
        &mut self,
        delta: &GraphDelta,
    ) -> std::result::Result<DeltaOutcome, Rejection> {
        if let Some(expected) = delta.base_version {
            if expected != self.version {
                return Err(Rejection::StaleBase {
                    expected,
                    actual: self.version,
                });
            }
        }

        let before = self.summary();
        if delta.is_empty() {
            return Ok(DeltaOutcome {
                affected: Vec::new(),
                cancelled_in_flight: Vec::new(),
                before,
                after: before,
            });
        }

        let mut delta = delta.clone();
        delta.canonicalize();

        let mut scratch = self.clone();
        let mut cancelled_in_flight = Vec::new();

        for id in &delta.remove_nodes {
            let idx = scratch
                .index
                .get(id)
                .copied()
                .ok_or_else(|| Rejection::UnknownTask { task: id.clone() })?;
            let state = scratch.graph[idx].state;
            match state {
                TaskState::Pending => {}
                TaskState::Assigned => cancelled_in_flight.push(id.clone()),
                _ => {
                    return Err(Rejection::ImmutableTask {
                        task: id.clone(),
                        state,
                        op: EditOp::Remove,
                    })
                }
            }
            scratch.graph[idx]
                .cancel(ErrorKind::Cancelled, "removed by graph edit")
                .map_err(|e| Rejection::Invariant(e.to_string()))?;
            scratch.detach(idx);
        }

        let mut seen = HashSet::new();
        for task in &delta.add_nodes {
            if !seen.insert(task.id.clone()) || scratch.contains(&task.id) {
                return Err(Rejection::DuplicateTask {
                    task: task.id.clone(),
                });
            }
            let idx = scratch.graph.add_node(task.clone().into_node());
            scratch.index.insert(task.id.clone(), idx);
        }

        for patch in &delta.modify_nodes {
            let node = scratch.pending_node_mut(&patch.id, EditOp::Modify)?;
            patch.apply_to(node);
        }

        for edge in &delta.remove_edges {
            scratch.pending_node_mut(&edge.to, EditOp::RemoveEdge)?;
            let from = scratch
                .index
                .get(&edge.from)
                .copied()
                .ok_or_else(|| Rejection::UnknownTask {
                    task: edge.from.clone(),
                })?;
            let to = scratch.index[&edge.to];
            let found = scratch
                .graph
                .find_edge(from, to)
                .ok_or_else(|| Rejection::UnknownEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                })?;
            scratch.graph.remove_edge(found);
        }

        for edge in &delta.add_edges {
            if edge.from == edge.to {
                return Err(Rejection::SelfLoop {
                    task: edge.from.clone(),
                });
            }
            scratch.pending_node_mut(&edge.to, EditOp::AddEdge)?;
            let from = scratch
                .index
                .get(&edge.from)
                .copied()
                .ok_or_else(|| Rejection::UnknownTask {
                    task: edge.from.clone(),
                })?;
            let from_state = scratch.graph[from].state;
            if from_state == TaskState::Cancelled {
                return Err(Rejection::ImmutableTask {
                    task: edge.from.clone(),
                    state: from_state,
                    op: EditOp::AddEdge,
                });
            }
            let to = scratch.index[&edge.to];
            if scratch.graph.find_edge(from, to).is_none() {
                scratch.graph.add_edge(from, to, ());
            }
        }

        scratch.check_invariants()?;
        scratch.version += 1;

        let after = scratch.summary();
        *self = scratch;

        Ok(DeltaOutcome {
            affected: delta.affected_tasks().into_iter().collect(),
            cancelled_in_flight,
            before,
            after,
        })
    }

    /// Look up a node an edit wants to change; it must still be pending.
    fn pending_node_mut(
        &mut self,
        id: &TaskId,
        op: EditOp,
    ) -> std::result::Result<&mut TaskNode, Rejection> {
        let idx = self
            .index
            .get(id)
            .copied()
            .ok_or_else(|| Rejection::UnknownTask { task: id.clone() })?;
        let node = &mut self.graph[idx];
        if node.state != TaskState::Pending {
            return Err(Rejection::ImmutableTask {
                task: id.clone(),
                state: node.state,
                op,
            });
        }
        Ok(node)
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("version", &self.version)
            .field("tasks", &self.len())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}

impl PartialEq for TaskGraph {
    /// Two graphs are equal when their snapshots are.
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}
