//! Interface to the external reasoning oracle.
//!
//! The oracle sees a snapshot of the graph plus the ids of the tasks whose
//! outcome triggered the edit cycle, and answers with a `GraphDelta`. Its
//! output is untrusted: the synchronizer validates every delta through
//! `TaskGraph::apply_delta` before anything is committed.

use crate::core::dag::GraphSnapshot;
use crate::core::delta::GraphDelta;
use crate::core::task::TaskId;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Reasons an oracle call produced no delta.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("malformed edit: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for OracleError {
    fn from(err: serde_json::Error) -> Self {
        OracleError::Malformed(err.to_string())
    }
}

/// Source of graph edits.
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    /// Propose one delta covering every task in `task_ids`.
    async fn propose_edit(
        &self,
        snapshot: &GraphSnapshot,
        task_ids: &[TaskId],
    ) -> Result<GraphDelta, OracleError>;
}

/// Oracle for static plans: never edits the graph.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOracle;

#[async_trait]
impl ReasoningOracle for NoopOracle {
    async fn propose_edit(
        &self,
        _snapshot: &GraphSnapshot,
        _task_ids: &[TaskId],
    ) -> Result<GraphDelta, OracleError> {
        Ok(GraphDelta::new())
    }
}

type ProposeFn = dyn Fn(GraphSnapshot, Vec<TaskId>) -> BoxFuture<'static, Result<GraphDelta, OracleError>>
    + Send
    + Sync;

/// Oracle driven by a closure, for embedding and tests.
#[derive(Clone)]
pub struct FnOracle {
    propose: Arc<ProposeFn>,
}

impl FnOracle {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(GraphSnapshot, Vec<TaskId>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GraphDelta, OracleError>> + Send + 'static,
    {
        Self {
            propose: Arc::new(move |snapshot, ids| f(snapshot, ids).boxed()),
        }
    }
}

impl std::fmt::Debug for FnOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnOracle").finish_non_exhaustive()
    }
}

#[async_trait]
impl ReasoningOracle for FnOracle {
    async fn propose_edit(
        &self,
        snapshot: &GraphSnapshot,
        task_ids: &[TaskId],
    ) -> Result<GraphDelta, OracleError> {
        (self.propose)(snapshot.clone(), task_ids.to_vec()).await
    }
}

/// Parse an oracle's textual answer into a delta.
///
/// Accepts bare JSON or JSON wrapped in a fenced code block, which is how
/// language-model oracles usually answer.
pub fn parse_delta(text: &str) -> Result<GraphDelta, OracleError> {
    let trimmed = text.trim();
    let body = match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.strip_prefix("json").unwrap_or(rest);
            rest.strip_suffix("```")
                .ok_or_else(|| OracleError::Malformed("unterminated code block".into()))?
        }
        None => trimmed,
    };
    Ok(serde_json::from_str(body.trim())?)
}
