//! Orchestration core for task constellations across heterogeneous devices.
//!
//! A reasoning oracle decomposes a request into a DAG of tasks (the
//! constellation). The `Orchestrator` dispatches ready tasks to capable
//! devices in parallel, while the `ModificationSynchronizer` applies the
//! oracle's revisions in batches, validated against the graph invariants.

pub mod config;
pub mod core;
pub mod device;
pub mod error;
pub mod log;
pub mod orchestration;

pub use crate::config::{DeviceConfig, OrchestratorConfig};
pub use crate::core::{
    GraphDelta, GraphSnapshot, GraphSummary, TaskGraph, TaskId, TaskNode, TaskResult, TaskState,
};
pub use crate::device::{DeviceBackend, DeviceId, DeviceRecord, DeviceRegistry};
pub use crate::error::{Error, Result};
pub use crate::orchestration::{EventBus, OrchestrationEvent, OrchestrationReport, Orchestrator};
