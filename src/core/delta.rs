//! Graph edits proposed by the reasoning oracle.
//!
//! A `GraphDelta` is untrusted input. `TaskGraph::apply_delta` validates the
//! whole delta against a scratch copy of the graph and either commits all of
//! it or returns a `Rejection` and leaves the graph untouched.

use crate::core::dag::GraphSummary;
use crate::core::task::{CapabilitySet, TaskId, TaskNode, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// A dependency edge: `from` must complete before `to` can start.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: TaskId,
    pub to: TaskId,
}

impl Edge {
    pub fn new(from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A node the delta wants to add.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub capabilities: CapabilitySet,
}

impl NewTask {
    pub fn new(id: impl Into<TaskId>, description: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            payload: serde_json::Value::Null,
            capabilities: CapabilitySet::new(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn into_node(self) -> TaskNode {
        let mut node = TaskNode::new(self.id, &self.description);
        node.payload = self.payload;
        node.capabilities = self.capabilities;
        node
    }
}

/// Changes to an existing node's description, payload, or requirements.
///
/// State and assignment are deliberately absent: only the orchestrator moves
/// tasks through their lifecycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodePatch {
    pub id: TaskId,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub capabilities: Option<CapabilitySet>,
}

impl NodePatch {
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(capabilities.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn apply_to(&self, node: &mut TaskNode) {
        if let Some(description) = &self.description {
            node.description = description.clone();
        }
        if let Some(payload) = &self.payload {
            node.payload = payload.clone();
        }
        if let Some(capabilities) = &self.capabilities {
            node.capabilities = capabilities.clone();
        }
    }
}

/// A structured add/remove/modify instruction set for the task graph.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphDelta {
    /// Graph version the delta was computed against, if the oracle tracks it.
    #[serde(default)]
    pub base_version: Option<u64>,
    #[serde(default)]
    pub add_nodes: Vec<NewTask>,
    #[serde(default)]
    pub remove_nodes: Vec<TaskId>,
    #[serde(default)]
    pub modify_nodes: Vec<NodePatch>,
    #[serde(default)]
    pub add_edges: Vec<Edge>,
    #[serde(default)]
    pub remove_edges: Vec<Edge>,
}

impl GraphDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.add_nodes.is_empty()
            && self.remove_nodes.is_empty()
            && self.modify_nodes.is_empty()
            && self.add_edges.is_empty()
            && self.remove_edges.is_empty()
    }

    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    pub fn add_node(mut self, task: NewTask) -> Self {
        self.add_nodes.push(task);
        self
    }

    pub fn remove_node(mut self, id: impl Into<TaskId>) -> Self {
        self.remove_nodes.push(id.into());
        self
    }

    pub fn modify_node(mut self, patch: NodePatch) -> Self {
        self.modify_nodes.push(patch);
        self
    }

    pub fn add_edge(mut self, from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        self.add_edges.push(Edge::new(from, to));
        self
    }

    pub fn remove_edge(mut self, from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        self.remove_edges.push(Edge::new(from, to));
        self
    }

    /// Fold another delta into this one.
    ///
    /// The base version of `self` is kept.
    pub fn merge(mut self, other: GraphDelta) -> Self {
        self.add_nodes.extend(other.add_nodes);
        self.remove_nodes.extend(other.remove_nodes);
        self.modify_nodes.extend(other.modify_nodes);
        self.add_edges.extend(other.add_edges);
        self.remove_edges.extend(other.remove_edges);
        self
    }

    /// Every task id the delta names.
    pub fn affected_tasks(&self) -> BTreeSet<TaskId> {
        let mut affected = BTreeSet::new();
        affected.extend(self.add_nodes.iter().map(|t| t.id.clone()));
        affected.extend(self.remove_nodes.iter().cloned());
        affected.extend(self.modify_nodes.iter().map(|p| p.id.clone()));
        for edge in self.add_edges.iter().chain(self.remove_edges.iter()) {
            affected.insert(edge.from.clone());
            affected.insert(edge.to.clone());
        }
        affected
    }

    /// Sort every list so application order does not depend on the order the
    /// oracle (or a batch merge) produced the entries in.
    pub(crate) fn canonicalize(&mut self) {
        self.add_nodes.sort_by(|a, b| a.id.cmp(&b.id));
        self.remove_nodes.sort();
        self.remove_nodes.dedup();
        // Stable: several patches for one node keep their relative order.
        self.modify_nodes.sort_by(|a, b| a.id.cmp(&b.id));
        self.add_edges.sort();
        self.add_edges.dedup();
        self.remove_edges.sort();
        self.remove_edges.dedup();
    }
}

/// Which part of a delta tripped a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOp {
    Remove,
    Modify,
    AddEdge,
    RemoveEdge,
}

impl std::fmt::Display for EditOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EditOp::Remove => "remove",
            EditOp::Modify => "modify",
            EditOp::AddEdge => "add edge",
            EditOp::RemoveEdge => "remove edge",
        };
        f.write_str(s)
    }
}

/// Typed reason a delta was rejected as a whole.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("delta computed against version {expected}, graph is at {actual}")]
    StaleBase { expected: u64, actual: u64 },

    #[error("unknown task {task}")]
    UnknownTask { task: TaskId },

    #[error("task {task} already exists")]
    DuplicateTask { task: TaskId },

    #[error("cannot {op} task {task} in state {state}")]
    ImmutableTask {
        task: TaskId,
        state: TaskState,
        op: EditOp,
    },

    #[error("task {task} cannot depend on itself")]
    SelfLoop { task: TaskId },

    #[error("edit would introduce a cycle through task {task}")]
    Cycle { task: TaskId },

    #[error("no edge from {from} to {to}")]
    UnknownEdge { from: TaskId, to: TaskId },

    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// What an accepted delta changed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaOutcome {
    /// Every task id named by the delta.
    pub affected: Vec<TaskId>,
    /// Tasks cancelled while a dispatch for them was in flight.
    pub cancelled_in_flight: Vec<TaskId>,
    pub before: GraphSummary,
    pub after: GraphSummary,
}

impl DeltaOutcome {
    pub fn is_noop(&self) -> bool {
        self.affected.is_empty()
    }
}
