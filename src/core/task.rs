//! Task node model for the constellation graph.
//!
//! A task node is one unit of work dispatched to a device. The node tracks
//! its lifecycle state, its current device assignment, and the outcome the
//! device reported. State changes go through the transition methods below,
//! which enforce the task state machine.

use crate::device::DeviceId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Unique identifier for a task within a constellation.
///
/// Oracles may choose readable identifiers (`"fetch-report"`); `TaskId::new`
/// generates a UUID v4 string when no natural name exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Return at most the first 8 characters for display.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Set of capability tags a task requires or a device declares.
pub type CapabilitySet = BTreeSet<String>;

/// Lifecycle state of a task.
///
/// `Pending` is initial; `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for prerequisites or for a device.
    #[default]
    Pending,
    /// Handed to a device that has not acknowledged yet.
    Assigned,
    /// Acknowledged by its device and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully after exhausting retries.
    Failed,
    /// Removed by a graph edit, or unreachable when orchestration ended.
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Whether the task holds a device assignment in this state.
    pub fn is_active(self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Classification of a task-level failure, carried on nodes and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No live device matched the required capabilities.
    DeviceUnavailable,
    /// The device never acknowledged the dispatch.
    DispatchTimeout,
    /// The device backend returned an error.
    DeviceError,
    /// The device ran the task and reported failure.
    ExecutionFailed,
    /// The task was removed by a graph edit.
    Cancelled,
    /// The task could never run because a prerequisite did not complete.
    Unreachable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::DeviceUnavailable => "device_unavailable",
            ErrorKind::DispatchTimeout => "dispatch_timeout",
            ErrorKind::DeviceError => "device_error",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Failure details recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A single task in the constellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable description.
    pub description: String,
    /// Backend-specific payload, opaque to the orchestration core.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Current lifecycle state.
    #[serde(default)]
    pub state: TaskState,
    /// Device currently (or last) assigned to the task.
    #[serde(default)]
    pub device: Option<DeviceId>,
    /// Result payload reported by the device.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Failure details for failed or cancelled tasks.
    #[serde(default)]
    pub error: Option<TaskError>,
    /// Capabilities a device must declare to run this task.
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Number of dispatch attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    /// When the task was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When a device acknowledged the current attempt.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    /// Create a pending task with no payload and no capability requirements.
    pub fn new(id: impl Into<TaskId>, description: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            payload: serde_json::Value::Null,
            state: TaskState::Pending,
            device: None,
            result: None,
            error: None,
            capabilities: CapabilitySet::new(),
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
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

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition_error(&self, to: TaskState) -> Error {
        Error::InvalidTransition {
            task: self.id.clone(),
            from: self.state,
            to,
        }
    }

    /// `Pending -> Assigned`. Requires that no assignment is active.
    pub fn assign(&mut self, device: DeviceId) -> Result<()> {
        if self.state != TaskState::Pending {
            return Err(self.transition_error(TaskState::Assigned));
        }
        if self.device.is_some() {
            return Err(Error::InvariantViolation(format!(
                "task {} is pending but still holds an assignment",
                self.id
            )));
        }
        self.state = TaskState::Assigned;
        self.device = Some(device);
        self.attempts += 1;
        Ok(())
    }

    /// `Assigned -> Running` on device acknowledgement.
    pub fn acknowledge(&mut self) -> Result<()> {
        if self.state != TaskState::Assigned {
            return Err(self.transition_error(TaskState::Running));
        }
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `Running -> Completed`.
    pub fn complete(&mut self, result: serde_json::Value) -> Result<()> {
        if self.state != TaskState::Running {
            return Err(self.transition_error(TaskState::Completed));
        }
        self.state = TaskState::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `Assigned | Running -> Failed`, once the retry budget is spent.
    pub fn fail(&mut self, error: TaskError, result: Option<serde_json::Value>) -> Result<()> {
        if !self.state.is_active() {
            return Err(self.transition_error(TaskState::Failed));
        }
        self.state = TaskState::Failed;
        self.error = Some(error);
        self.result = result;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `Assigned | Running -> Pending` for another attempt.
    ///
    /// The assignment is released; the last device stays visible through
    /// `error` so retry policies can steer away from it.
    pub fn requeue(&mut self, error: TaskError) -> Result<()> {
        if !self.state.is_active() {
            return Err(self.transition_error(TaskState::Pending));
        }
        self.state = TaskState::Pending;
        self.device = None;
        self.started_at = None;
        self.error = Some(error);
        Ok(())
    }

    /// Record why a pending task cannot be placed. The state is unchanged.
    pub fn mark_unplaceable(&mut self, error: TaskError) -> Result<()> {
        if self.state != TaskState::Pending {
            return Err(Error::Validation(format!(
                "task {} is {}, only pending tasks can be unplaceable",
                self.id, self.state
            )));
        }
        self.error = Some(error);
        Ok(())
    }

    /// `Pending | Assigned -> Cancelled`.
    pub fn cancel(&mut self, kind: ErrorKind, message: &str) -> Result<()> {
        if !matches!(self.state, TaskState::Pending | TaskState::Assigned) {
            return Err(self.transition_error(TaskState::Cancelled));
        }
        self.state = TaskState::Cancelled;
        self.device = None;
        self.error = Some(TaskError::new(kind, message));
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Check the structural form of the single-assignment invariant.
    pub fn assignment_consistent(&self) -> bool {
        if self.state.is_active() {
            self.device.is_some()
        } else {
            self.device.is_none() || self.state.is_terminal()
        }
    }
}

/// Terminal entry for one task in the final report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub state: TaskState,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub device: Option<DeviceId>,
    pub attempts: u32,
}

impl From<&TaskNode> for TaskResult {
    fn from(node: &TaskNode) -> Self {
        Self {
            state: node.state,
            result: node.result.clone(),
            error: node.error.clone(),
            device: node.device.clone(),
            attempts: node.attempts,
        }
    }
}
