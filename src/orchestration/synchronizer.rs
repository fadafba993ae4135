//! Modification synchronizer: batched graph edits from the reasoning oracle.
//!
//! The synchronizer listens on the event bus for completion, failure, and
//! unplaceable signals. Whenever it is idle and at least one signal is queued
//! it drains the whole queue into one batch and runs a single edit cycle for
//! it: take the assignment lock, snapshot the graph, ask the oracle for a
//! delta, validate and apply it, publish `GraphModified`, release the lock.
//! Signals that arrive during a cycle form the next batch.

use crate::config::OrchestratorConfig;
use crate::core::delta::DeltaOutcome;
use crate::core::task::{ErrorKind, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::bus::{EventBus, EventSubscription, OrchestrationEvent};
use crate::orchestration::lock::AssignmentLock;
use crate::orchestration::oracle::ReasoningOracle;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What triggered a modification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Completed,
    Failed(ErrorKind),
    Unplaceable,
}

/// A request to re-evaluate the graph in light of one task's outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub task_id: TaskId,
    pub kind: SignalKind,
}

impl Signal {
    pub fn new(task_id: TaskId, kind: SignalKind) -> Self {
        Self { task_id, kind }
    }
}

#[derive(Debug, Clone)]
struct QueuedSignal {
    signal: Signal,
    attempts: u32,
}

/// Counters shared with the orchestrator.
///
/// `processed` only grows once a signal's edit has been committed (or the
/// signal was given up on), and it is bumped before the edit lock is
/// released. A reader holding the lock therefore never sees a processed
/// signal whose edit is not yet visible.
#[derive(Debug, Default)]
pub struct SyncProgress {
    processed: AtomicU64,
    edit_cycles: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    changed: Notify,
}

impl SyncProgress {
    /// Signals fully handled (applied or dropped).
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Edit cycles whose delta was accepted, empty deltas included.
    pub fn edit_cycles(&self) -> u64 {
        self.edit_cycles.load(Ordering::Acquire)
    }

    /// Edit cycles that failed (rejection, timeout, or oracle error).
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Acquire)
    }

    /// Signals given up on after exhausting their edit attempts.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Resolves after the next progress update.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    fn record_processed(&self, n: usize) {
        self.processed.fetch_add(n as u64, Ordering::AcqRel);
        self.changed.notify_one();
    }
}

/// Applies oracle edits to the shared graph, one batch at a time.
///
/// The assignment lock is held from snapshot to commit, oracle call
/// included, so the oracle always reasons about the graph it edits. While a
/// cycle runs the orchestrator dispatches nothing new and only queues device
/// outcomes; a slow oracle stalls dispatch for up to `edit_timeout`.
pub struct ModificationSynchronizer {
    lock: Arc<AssignmentLock>,
    bus: Arc<EventBus>,
    oracle: Arc<dyn ReasoningOracle>,
    edit_timeout: Duration,
    max_edit_attempts: u32,
    progress: Arc<SyncProgress>,
}

impl ModificationSynchronizer {
    pub fn new(
        lock: Arc<AssignmentLock>,
        bus: Arc<EventBus>,
        oracle: Arc<dyn ReasoningOracle>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            lock,
            bus,
            oracle,
            edit_timeout: config.edit_timeout(),
            max_edit_attempts: config.max_edit_attempts.max(1),
            progress: Arc::new(SyncProgress::default()),
        }
    }

    pub fn progress(&self) -> Arc<SyncProgress> {
        Arc::clone(&self.progress)
    }

    /// Subscribe to the bus and run the batching loop on a new task.
    ///
    /// The subscription is taken before this returns, so no signal published
    /// afterwards can be missed.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let subscription = self.bus.subscribe();
        tokio::spawn(self.run(subscription, cancel))
    }

    async fn run(self, mut subscription: EventSubscription, cancel: CancellationToken) {
        let mut queue: Vec<QueuedSignal> = Vec::new();

        loop {
            if queue.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => enqueue(&mut queue, &event),
                        None => break,
                    },
                }
            }
            while let Some(event) = subscription.try_recv() {
                enqueue(&mut queue, &event);
            }
            if queue.is_empty() {
                continue;
            }

            let batch = std::mem::take(&mut queue);
            tracing::debug!(signals = batch.len(), "starting edit cycle");

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.edit_cycle(&batch) => result,
            };

            if let Err(err) = result {
                self.progress.rejected.fetch_add(1, Ordering::AcqRel);
                tracing::warn!(error = %err, signals = batch.len(), "edit cycle failed, graph unchanged");
                let mut given_up = 0;
                for mut queued in batch {
                    queued.attempts += 1;
                    if queued.attempts >= self.max_edit_attempts {
                        given_up += 1;
                        tracing::error!(
                            task = %queued.signal.task_id,
                            attempts = queued.attempts,
                            "dropping modification request after repeated edit failures"
                        );
                    } else {
                        queue.push(queued);
                    }
                }
                if given_up > 0 {
                    self.progress.dropped.fetch_add(given_up as u64, Ordering::AcqRel);
                    self.progress.record_processed(given_up);
                }
            }
        }
        tracing::debug!("synchronizer stopped");
    }

    /// Run one edit cycle for `batch` while holding the assignment lock.
    async fn edit_cycle(&self, batch: &[QueuedSignal]) -> Result<DeltaOutcome> {
        let task_ids: Vec<TaskId> = batch
            .iter()
            .map(|q| q.signal.task_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut graph = self.lock.acquire_for_edit().await;
        let snapshot = graph.snapshot();

        let delta = tokio::time::timeout(
            self.edit_timeout,
            self.oracle.propose_edit(&snapshot, &task_ids),
        )
        .await
        .map_err(|_| Error::EditTimeout(self.edit_timeout))?
        .map_err(|e| Error::Oracle(e.to_string()))?;

        let outcome = graph.apply_delta(&delta)?;

        if !outcome.is_noop() {
            tracing::info!(
                before = %outcome.before,
                after = %outcome.after,
                affected = outcome.affected.len(),
                "graph modified"
            );
            for task in &outcome.cancelled_in_flight {
                tracing::info!(task = %task, "in-flight dispatch cancelled by edit");
            }
            self.bus.publish(OrchestrationEvent::GraphModified {
                affected: outcome.affected.clone(),
                before: outcome.before,
                after: outcome.after,
            });
        }

        self.progress.edit_cycles.fetch_add(1, Ordering::AcqRel);
        self.progress.record_processed(batch.len());
        drop(graph);
        Ok(outcome)
    }
}

fn enqueue(queue: &mut Vec<QueuedSignal>, event: &OrchestrationEvent) {
    if let Some(signal) = event.signal() {
        tracing::trace!(task = %signal.task_id, kind = ?signal.kind, "signal queued");
        queue.push(QueuedSignal {
            signal,
            attempts: 0,
        });
    }
}
