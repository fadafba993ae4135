use thiserror::Error;

use crate::core::delta::Rejection;
use crate::core::task::{TaskId, TaskState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Device not found: {0}")]
    DeviceNotFound(crate::device::DeviceId),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Invalid transition for task {task} from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("Edit rejected: {0}")]
    EditRejected(#[from] Rejection),

    #[error("Reasoning oracle timed out after {0:?}")]
    EditTimeout(std::time::Duration),

    #[error("Reasoning oracle error: {0}")]
    Oracle(String),

    #[error("No live device provides capabilities {required:?} for task {task}")]
    DeviceUnavailable {
        task: TaskId,
        required: Vec<String>,
    },

    #[error("Task {task} has no capable device after {rounds} reasoning rounds")]
    Unschedulable { task: TaskId, rounds: u32 },

    #[error("Graph invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error aborts an orchestration run.
    ///
    /// Everything else is recovered per task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvariantViolation(_) | Error::Unschedulable { .. } | Error::TaskJoin(_)
        )
    }
}
