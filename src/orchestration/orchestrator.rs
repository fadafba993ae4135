//! Orchestrator: the scheduling loop that drives a task graph to completion.
//!
//! The orchestrator watches the graph for ready tasks, asks the assignment
//! strategy for a device, and dispatches each task on its own tokio task.
//! Device outcomes come back over a channel and are applied as state
//! transitions. It never waits on the assignment lock: while the
//! synchronizer holds it for an edit cycle, outcomes are queued and applied
//! once the lock is free again.

use crate::config::OrchestratorConfig;
use crate::core::dag::TaskGraph;
use crate::core::task::{ErrorKind, TaskError, TaskId, TaskNode, TaskResult, TaskState};
use crate::device::{
    DeviceBackend, DeviceError, DeviceId, DeviceOutput, DeviceRecord, DeviceRegistry, TaskRequest,
};
use crate::error::{Error, Result};
use crate::orchestration::bus::{EventBus, OrchestrationEvent};
use crate::orchestration::lock::AssignmentLock;
use crate::orchestration::oracle::ReasoningOracle;
use crate::orchestration::strategy::{AssignmentStrategy, NoCapableDevice};
use crate::orchestration::synchronizer::{ModificationSynchronizer, SyncProgress};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which device a retried task may go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDevicePolicy {
    /// Whatever the strategy picks.
    #[default]
    Any,
    /// Avoid the device of the failed attempt when another candidate exists.
    PreferDifferent,
    /// Stay on the device of the failed attempt while it is still a candidate.
    SameDevice,
}

/// Final state of every task of one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationReport {
    /// One entry per task ever added, removed ones included.
    pub results: BTreeMap<TaskId, TaskResult>,
    /// Edit cycles the synchronizer committed.
    pub edit_cycles: u64,
    pub final_version: u64,
}

impl OrchestrationReport {
    pub fn count(&self, state: TaskState) -> usize {
        self.results.values().filter(|r| r.state == state).count()
    }

    /// Whether every task completed.
    pub fn succeeded(&self) -> bool {
        self.results
            .values()
            .all(|r| r.state == TaskState::Completed)
    }

    pub fn get(&self, id: &str) -> Option<&TaskResult> {
        self.results.get(&TaskId::from(id))
    }
}

#[derive(Debug)]
enum DispatchEvent {
    Acknowledged,
    AckFailed(TaskError),
    Finished(std::result::Result<DeviceOutput, DeviceError>),
    /// The task was cancelled before execution began; the device is free.
    Withdrawn,
}

impl DispatchEvent {
    /// Whether the dispatch unit sends nothing after this event.
    fn is_last(&self) -> bool {
        !matches!(self, DispatchEvent::Acknowledged)
    }
}

/// Message from a dispatch unit back to the scheduling loop.
#[derive(Debug)]
struct DispatchOutcome {
    task_id: TaskId,
    /// Attempt number of the dispatch; outcomes of older attempts are stale.
    attempt: u32,
    event: DispatchEvent,
}

struct InFlight {
    device: Arc<DeviceRecord>,
    attempt: u32,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Unplaceable {
    rounds: u32,
    retry_at: Instant,
}

/// Schedules and dispatches tasks, and owns one run's bookkeeping.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use constellation::config::OrchestratorConfig;
/// use constellation::device::{DeviceRecord, DeviceRegistry, ShellBackend};
/// use constellation::orchestration::{NoopOracle, Orchestrator};
///
/// let registry = Arc::new(DeviceRegistry::new());
/// registry.register(
///     DeviceRecord::new("build-box", ["shell"], "shell"),
///     Arc::new(ShellBackend::default()),
/// );
/// let orchestrator = Orchestrator::new(OrchestratorConfig::default(), registry, Arc::new(NoopOracle));
/// let report = orchestrator.orchestrate(graph).await?;
/// ```
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<DeviceRegistry>,
    oracle: Arc<dyn ReasoningOracle>,
    strategy: Arc<dyn AssignmentStrategy>,
    bus: Arc<EventBus>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<DeviceRegistry>,
        oracle: Arc<dyn ReasoningOracle>,
    ) -> Self {
        let strategy = config.strategy.build();
        Self {
            config,
            registry,
            oracle,
            strategy,
            bus: Arc::new(EventBus::new()),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AssignmentStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run `graph` until every reachable task is terminal.
    ///
    /// Tasks stuck behind a failed or cancelled prerequisite are cancelled as
    /// unreachable at the end, so the report holds a terminal entry for every
    /// task. Only structural failures abort the run: an invariant violation,
    /// or a task no device can run after `max_reasoning_rounds` escalations.
    pub async fn orchestrate(&self, graph: TaskGraph) -> Result<OrchestrationReport> {
        graph
            .check_invariants()
            .map_err(|r| Error::Validation(r.to_string()))?;
        if let Some(active) = graph.active_tasks().first() {
            return Err(Error::Validation(format!(
                "task {} is already assigned; plans must start without assignments",
                active
            )));
        }

        tracing::info!(
            tasks = graph.len(),
            dependencies = graph.edge_count(),
            devices = self.registry.len(),
            strategy = self.strategy.name(),
            "orchestration started"
        );

        let lock = Arc::new(AssignmentLock::new(graph));
        let synchronizer = ModificationSynchronizer::new(
            Arc::clone(&lock),
            Arc::clone(&self.bus),
            Arc::clone(&self.oracle),
            &self.config,
        );
        let progress = synchronizer.progress();
        let sync_cancel = CancellationToken::new();
        let sync_handle = synchronizer.spawn(sync_cancel.clone());

        let (outcome_tx, mut outcome_rx) = mpsc::channel(self.config.outcome_buffer.max(1));
        let mut run = Run {
            orch: self,
            progress: Arc::clone(&progress),
            outcome_tx,
            in_flight: HashMap::new(),
            draining: HashMap::new(),
            deferred: VecDeque::new(),
            retry_at: HashMap::new(),
            last_device: HashMap::new(),
            unplaceable: HashMap::new(),
            signals_published: 0,
            seen_version: None,
        };

        let result = loop {
            while let Ok(outcome) = outcome_rx.try_recv() {
                run.deferred.push_back(outcome);
            }

            if let Some(mut graph) = lock.try_acquire() {
                match run.step(&mut graph) {
                    Ok(true) => {
                        let unreachable = graph.cancel_unreachable();
                        if !unreachable.is_empty() {
                            tracing::warn!(
                                count = unreachable.len(),
                                "cancelling tasks blocked behind unsuccessful prerequisites"
                            );
                        }
                        break Ok(OrchestrationReport {
                            results: graph.results(),
                            edit_cycles: progress.edit_cycles(),
                            final_version: graph.version(),
                        });
                    }
                    Ok(false) => {}
                    Err(err) => break Err(err),
                }
            } else if !run.deferred.is_empty() {
                tracing::trace!(
                    deferred = run.deferred.len(),
                    "graph locked by edit cycle, deferring outcomes"
                );
            }

            tokio::select! {
                outcome = outcome_rx.recv() => {
                    if let Some(outcome) = outcome {
                        run.deferred.push_back(outcome);
                    }
                }
                _ = lock.released() => {}
                _ = progress.changed() => {}
                _ = tokio::time::sleep(self.config.tick_interval()) => {}
            }
        };

        run.abort_in_flight();
        sync_cancel.cancel();
        let joined = sync_handle
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()));

        match &result {
            Ok(report) => tracing::info!(
                completed = report.count(TaskState::Completed),
                failed = report.count(TaskState::Failed),
                cancelled = report.count(TaskState::Cancelled),
                edit_cycles = report.edit_cycles,
                version = report.final_version,
                "orchestration finished"
            ),
            Err(err) => tracing::error!(error = %err, "orchestration aborted"),
        }

        let report = result?;
        joined?;
        Ok(report)
    }
}

/// Mutable state of one `orchestrate` call.
struct Run<'a> {
    orch: &'a Orchestrator,
    progress: Arc<SyncProgress>,
    outcome_tx: mpsc::Sender<DispatchOutcome>,
    in_flight: HashMap<TaskId, InFlight>,
    /// Dispatches of cancelled tasks whose device call is still running.
    /// Their results are discarded; the device stays loaded until they end.
    draining: HashMap<TaskId, InFlight>,
    /// Outcomes received but not yet applied to the graph, in arrival order.
    deferred: VecDeque<DispatchOutcome>,
    /// Earliest redispatch time of tasks in retry backoff.
    retry_at: HashMap<TaskId, Instant>,
    /// Device of the last failed attempt, for the retry device policy.
    last_device: HashMap<TaskId, DeviceId>,
    unplaceable: HashMap<TaskId, Unplaceable>,
    signals_published: u64,
    seen_version: Option<u64>,
}

impl Run<'_> {
    /// One pass with the lock held. Returns `true` once the graph is terminal.
    fn step(&mut self, graph: &mut TaskGraph) -> Result<bool> {
        if self.seen_version != Some(graph.version()) {
            graph
                .check_invariants()
                .map_err(|r| Error::InvariantViolation(r.to_string()))?;
            self.seen_version = Some(graph.version());
        }
        self.reconcile(graph);

        while let Some(outcome) = self.deferred.pop_front() {
            self.apply_outcome(graph, outcome)?;
        }

        self.dispatch_ready(graph)?;
        self.check_assignments(graph)?;

        Ok(self.in_flight.is_empty()
            && self.draining.is_empty()
            && self.deferred.is_empty()
            && self.unplaceable.is_empty()
            && graph.ready_tasks().is_empty()
            && self.progress.processed() >= self.signals_published)
    }

    /// Drop bookkeeping for tasks an edit cancelled or removed.
    fn reconcile(&mut self, graph: &TaskGraph) {
        let cancelled: Vec<TaskId> = self
            .in_flight
            .keys()
            .filter(|id| !graph.state(id).is_some_and(TaskState::is_active))
            .cloned()
            .collect();
        for id in cancelled {
            if let Some(flight) = self.in_flight.remove(&id) {
                flight.cancel.cancel();
                tracing::info!(task = %id, device = %flight.device.id, "task cancelled, result of its dispatch will be discarded");
                self.draining.insert(id, flight);
            }
        }

        let pending = |id: &TaskId| graph.state(id) == Some(TaskState::Pending);
        self.unplaceable.retain(|id, _| pending(id));
        self.retry_at.retain(|id, _| pending(id));
        self.last_device.retain(|id, _| pending(id));
    }

    fn apply_outcome(&mut self, graph: &mut TaskGraph, outcome: DispatchOutcome) -> Result<()> {
        let DispatchOutcome {
            task_id,
            attempt,
            event,
        } = outcome;
        let current = self
            .in_flight
            .get(&task_id)
            .is_some_and(|f| f.attempt == attempt);
        if !current {
            let draining = self
                .draining
                .get(&task_id)
                .is_some_and(|f| f.attempt == attempt);
            if draining && event.is_last() {
                if let Some(flight) = self.draining.remove(&task_id) {
                    flight.device.release();
                    tracing::debug!(task = %task_id, device = %flight.device.id, "dispatch of cancelled task ended");
                }
            }
            tracing::debug!(task = %task_id, attempt, "discarding stale dispatch outcome");
            return Ok(());
        }

        match event {
            DispatchEvent::Acknowledged => {
                graph.acknowledge(&task_id)?;
                if let Some(flight) = self.in_flight.get(&task_id) {
                    tracing::info!(task = %task_id, device = %flight.device.id, attempt, "task running");
                    let event = OrchestrationEvent::TaskStarted {
                        task_id: task_id.clone(),
                        device_id: flight.device.id.clone(),
                        attempt,
                    };
                    self.publish(event);
                }
            }
            DispatchEvent::AckFailed(error) => self.attempt_failed(graph, &task_id, error, None)?,
            DispatchEvent::Finished(Ok(output)) if output.success => {
                graph.complete(&task_id, output.result.clone())?;
                if let Some(flight) = self.in_flight.remove(&task_id) {
                    flight.device.release();
                    tracing::info!(task = %task_id, device = %flight.device.id, "task completed");
                    self.publish(OrchestrationEvent::TaskCompleted {
                        task_id: task_id.clone(),
                        device_id: flight.device.id.clone(),
                        result: output.result,
                    });
                }
            }
            DispatchEvent::Finished(Ok(output)) => {
                let error = TaskError::new(ErrorKind::ExecutionFailed, "device reported failure");
                self.attempt_failed(graph, &task_id, error, Some(output.result))?
            }
            DispatchEvent::Finished(Err(err)) => {
                let error = TaskError::new(ErrorKind::DeviceError, err.to_string());
                self.attempt_failed(graph, &task_id, error, None)?
            }
            DispatchEvent::Withdrawn => {
                tracing::debug!(task = %task_id, attempt, "dispatch withdrawn while task still active");
            }
        }
        Ok(())
    }

    /// Retry the task while budget remains, otherwise fail it for good.
    fn attempt_failed(
        &mut self,
        graph: &mut TaskGraph,
        id: &TaskId,
        error: TaskError,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        let Some(flight) = self.in_flight.remove(id) else {
            return Ok(());
        };
        flight.device.release();

        let attempts = graph.get(id).map(|n| n.attempts).unwrap_or_default();
        let config = &self.orch.config;
        if attempts <= config.max_retries {
            tracing::warn!(
                task = %id,
                device = %flight.device.id,
                attempt = attempts,
                kind = %error.kind,
                error = %error.message,
                "attempt failed, retrying"
            );
            graph.requeue(id, error)?;
            self.last_device.insert(id.clone(), flight.device.id.clone());
            if !config.retry_backoff().is_zero() {
                self.retry_at
                    .insert(id.clone(), Instant::now() + config.retry_backoff());
            }
        } else {
            tracing::warn!(
                task = %id,
                device = %flight.device.id,
                attempts,
                kind = %error.kind,
                error = %error.message,
                "task failed, retries exhausted"
            );
            let event = OrchestrationEvent::TaskFailed {
                task_id: id.clone(),
                device_id: Some(flight.device.id.clone()),
                kind: error.kind,
                message: error.message.clone(),
            };
            graph.fail(id, error, result)?;
            self.publish(event);
        }
        Ok(())
    }

    fn dispatch_ready(&mut self, graph: &mut TaskGraph) -> Result<()> {
        let now = Instant::now();
        let mut devices: Option<Vec<Arc<DeviceRecord>>> = None;

        for id in graph.ready_tasks() {
            if self.in_flight.contains_key(&id)
                || self.retry_at.get(&id).is_some_and(|t| *t > now)
                || self.unplaceable.get(&id).is_some_and(|u| u.retry_at > now)
            {
                continue;
            }
            let Some(node) = graph.get(&id) else {
                continue;
            };
            let devices = devices.get_or_insert_with(|| self.orch.registry.snapshot());
            let choice = select_device(
                self.orch.strategy.as_ref(),
                self.orch.config.retry_policy,
                node,
                devices,
                self.last_device.get(&id),
            );

            match choice {
                Ok(device_id) => {
                    let record = devices.iter().find(|d| d.id == device_id).cloned();
                    let backend = self.orch.registry.backend(&device_id);
                    let (Some(record), Some(backend)) = (record, backend) else {
                        tracing::debug!(task = %id, device = %device_id, "device vanished before dispatch");
                        continue;
                    };
                    self.dispatch(graph, &id, record, backend)?;
                }
                Err(unavailable) => self.escalate(graph, unavailable, now)?,
            }
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        graph: &mut TaskGraph,
        id: &TaskId,
        record: Arc<DeviceRecord>,
        backend: Arc<dyn DeviceBackend>,
    ) -> Result<()> {
        graph.assign(id, record.id.clone())?;
        record.acquire();
        self.unplaceable.remove(id);
        self.retry_at.remove(id);

        let node = graph
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let request = TaskRequest {
            task_id: id.clone(),
            description: node.description.clone(),
            payload: node.payload.clone(),
            attempt: node.attempts,
        };
        tracing::debug!(
            task = %id,
            device = %record.id,
            attempt = request.attempt,
            load = record.load(),
            "dispatching task"
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatch_unit(
            backend,
            request,
            self.orch.config.ack_timeout(),
            cancel.clone(),
            self.outcome_tx.clone(),
        ));
        self.in_flight.insert(
            id.clone(),
            InFlight {
                device: record,
                attempt: node.attempts,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    /// No capable device: back off, escalate to the oracle, give up eventually.
    fn escalate(
        &mut self,
        graph: &mut TaskGraph,
        unavailable: NoCapableDevice,
        now: Instant,
    ) -> Result<()> {
        let max_rounds = self.orch.config.max_reasoning_rounds;
        let entry = self
            .unplaceable
            .entry(unavailable.task.clone())
            .or_insert(Unplaceable {
                rounds: 0,
                retry_at: now,
            });
        entry.rounds += 1;
        if entry.rounds > max_rounds {
            return Err(Error::Unschedulable {
                task: unavailable.task,
                rounds: max_rounds,
            });
        }
        entry.retry_at = now + self.orch.config.no_device_backoff();
        let round = entry.rounds;

        let reason = Error::DeviceUnavailable {
            task: unavailable.task.clone(),
            required: unavailable.required.iter().cloned().collect(),
        };
        graph.mark_unplaceable(
            &unavailable.task,
            TaskError::new(ErrorKind::DeviceUnavailable, reason.to_string()),
        )?;

        tracing::warn!(
            task = %unavailable.task,
            required = ?unavailable.required,
            round,
            "no capable device, escalating"
        );
        self.publish(OrchestrationEvent::TaskUnplaceable {
            task_id: unavailable.task,
            required: unavailable.required,
            round,
        });
        Ok(())
    }

    /// Single assignment: every active task has exactly one live dispatch on
    /// the device recorded in the graph, and vice versa.
    fn check_assignments(&self, graph: &TaskGraph) -> Result<()> {
        let active = graph.active_tasks();
        for id in &active {
            let recorded = graph.get(id).and_then(|n| n.device.as_ref());
            let dispatched = self.in_flight.get(id).map(|f| &f.device.id);
            if recorded.is_none() || recorded != dispatched {
                return Err(Error::InvariantViolation(format!(
                    "task {} is assigned to {:?} but dispatched to {:?}",
                    id, recorded, dispatched
                )));
            }
        }
        if active.len() != self.in_flight.len() {
            return Err(Error::InvariantViolation(format!(
                "{} active tasks but {} dispatches in flight",
                active.len(),
                self.in_flight.len()
            )));
        }
        Ok(())
    }

    fn publish(&mut self, event: OrchestrationEvent) {
        if event.signal().is_some() {
            self.signals_published += 1;
        }
        self.orch.bus.publish(event);
    }

    fn abort_in_flight(&mut self) {
        for (id, flight) in self.in_flight.drain().chain(self.draining.drain()) {
            flight.cancel.cancel();
            flight.handle.abort();
            flight.device.release();
            tracing::debug!(task = %id, "aborted in-flight dispatch");
        }
    }
}

/// Pick a device for `node`, honouring the retry device policy.
fn select_device(
    strategy: &dyn AssignmentStrategy,
    policy: RetryDevicePolicy,
    node: &TaskNode,
    devices: &[Arc<DeviceRecord>],
    last: Option<&DeviceId>,
) -> std::result::Result<DeviceId, NoCapableDevice> {
    match (policy, last) {
        (RetryDevicePolicy::Any, _) | (_, None) => strategy.select_device(node, devices),
        (RetryDevicePolicy::PreferDifferent, Some(last)) => {
            let others: Vec<Arc<DeviceRecord>> = devices
                .iter()
                .filter(|d| &d.id != last)
                .cloned()
                .collect();
            strategy
                .select_device(node, &others)
                .or_else(|_| strategy.select_device(node, devices))
        }
        (RetryDevicePolicy::SameDevice, Some(last)) => {
            let same = devices
                .iter()
                .find(|d| &d.id == last && d.is_healthy() && d.provides(&node.capabilities));
            match same {
                Some(d) => Ok(d.id.clone()),
                None => strategy.select_device(node, devices),
            }
        }
    }
}

/// One dispatch attempt: acknowledgement bounded by `ack_timeout`, then
/// execution. Every phase reports back over `tx`.
///
/// Device calls are never dropped part way. Cancellation only stops an
/// acknowledged task from starting; a running call finishes and the loop
/// discards its result.
async fn dispatch_unit(
    backend: Arc<dyn DeviceBackend>,
    request: TaskRequest,
    ack_timeout: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<DispatchOutcome>,
) {
    let report = |event| DispatchOutcome {
        task_id: request.task_id.clone(),
        attempt: request.attempt,
        event,
    };

    let ack = tokio::time::timeout(ack_timeout, backend.acknowledge(&request)).await;
    let event = match ack {
        Ok(Ok(())) => DispatchEvent::Acknowledged,
        Ok(Err(err)) => DispatchEvent::AckFailed(TaskError::new(
            ErrorKind::DeviceError,
            err.to_string(),
        )),
        Err(_) => DispatchEvent::AckFailed(TaskError::new(
            ErrorKind::DispatchTimeout,
            format!("no acknowledgement within {:?}", ack_timeout),
        )),
    };
    let acknowledged = matches!(event, DispatchEvent::Acknowledged);
    if tx.send(report(event)).await.is_err() || !acknowledged {
        return;
    }

    if cancel.is_cancelled() {
        let _ = tx.send(report(DispatchEvent::Withdrawn)).await;
        return;
    }
    let result = backend.execute(&request).await;
    let _ = tx.send(report(DispatchEvent::Finished(result))).await;
}
