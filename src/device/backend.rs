//! Device execution backends.
//!
//! The orchestrator only depends on the `DeviceBackend` contract: acknowledge
//! a dispatch, then execute it and report success or failure with a result
//! payload. Whether a backend drives a UI, calls an API, or runs a shell
//! command is invisible to the core.

use crate::core::task::TaskId;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

/// What a device receives for one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub description: String,
    pub payload: serde_json::Value,
    /// 1-based attempt number; retries of the same task increase it.
    pub attempt: u32,
}

/// Result reported by a device after executing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceOutput {
    pub success: bool,
    pub result: serde_json::Value,
}

impl DeviceOutput {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result,
        }
    }

    pub fn failure(result: serde_json::Value) -> Self {
        Self {
            success: false,
            result,
        }
    }
}

/// Errors raised by a backend instead of a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("device rejected task: {0}")]
    Rejected(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Execution contract implemented once per backend kind.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Backend kind label, e.g. `shell`.
    fn kind(&self) -> &str;

    /// Wait for the device to accept the task.
    ///
    /// Backends without an explicit handshake acknowledge immediately.
    async fn acknowledge(&self, _request: &TaskRequest) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Run the task to completion.
    async fn execute(&self, request: &TaskRequest) -> Result<DeviceOutput, DeviceError>;
}

type ExecuteFn =
    dyn Fn(TaskRequest) -> BoxFuture<'static, Result<DeviceOutput, DeviceError>> + Send + Sync;

/// In-process backend driven by a closure.
#[derive(Clone)]
pub struct FnBackend {
    kind: String,
    execute: Arc<ExecuteFn>,
}

impl FnBackend {
    pub fn new<F, Fut>(kind: &str, f: F) -> Self
    where
        F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DeviceOutput, DeviceError>> + Send + 'static,
    {
        Self {
            kind: kind.to_string(),
            execute: Arc::new(move |request| f(request).boxed()),
        }
    }
}

impl std::fmt::Debug for FnBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnBackend").field("kind", &self.kind).finish()
    }
}

#[async_trait]
impl DeviceBackend for FnBackend {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, request: &TaskRequest) -> Result<DeviceOutput, DeviceError> {
        (self.execute)(request.clone()).await
    }
}

/// Runs `payload.command` through a local shell.
///
/// The payload is either a string (the command line) or an object with a
/// `command` field. The result carries the exit code plus captured output.
#[derive(Debug, Clone)]
pub struct ShellBackend {
    shell: String,
    working_dir: Option<PathBuf>,
}

impl Default for ShellBackend {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: None,
        }
    }
}

impl ShellBackend {
    pub fn new(shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn command_line(payload: &serde_json::Value) -> Result<&str, DeviceError> {
        match payload {
            serde_json::Value::String(cmd) => Ok(cmd.as_str()),
            serde_json::Value::Object(map) => map
                .get("command")
                .and_then(|c| c.as_str())
                .ok_or_else(|| DeviceError::InvalidPayload("missing `command` field".into())),
            other => Err(DeviceError::InvalidPayload(format!(
                "expected a command string or object, got {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl DeviceBackend for ShellBackend {
    fn kind(&self) -> &str {
        "shell"
    }

    async fn execute(&self, request: &TaskRequest) -> Result<DeviceOutput, DeviceError> {
        let line = Self::command_line(&request.payload)?;
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(line).kill_on_drop(false);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(task = %request.task_id, command = line, "running shell task");
        let output = cmd
            .output()
            .await
            .map_err(|e| DeviceError::Unreachable(format!("failed to spawn {}: {}", self.shell, e)))?;

        let result = serde_json::json!({
            "exit_code": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout).trim_end(),
            "stderr": String::from_utf8_lossy(&output.stderr).trim_end(),
        });
        Ok(DeviceOutput {
            success: output.status.success(),
            result,
        })
    }
}
