//! Core domain models for the orchestration core.
//!
//! This module contains the task node model, the task graph with its
//! invariant checker, and the graph deltas the reasoning oracle proposes.

pub mod dag;
pub mod delta;
pub mod task;

pub use dag::{GraphSnapshot, GraphSummary, TaskGraph};
pub use delta::{DeltaOutcome, Edge, EditOp, GraphDelta, NewTask, NodePatch, Rejection};
pub use task::{CapabilitySet, ErrorKind, TaskError, TaskId, TaskNode, TaskResult, TaskState};
