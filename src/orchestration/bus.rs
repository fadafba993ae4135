//! In-process event bus for task lifecycle signals.
//!
//! Every subscriber owns an unbounded channel, so publishing never blocks and
//! never drops an event for a live subscriber. Subscribers consume events
//! independently of each other; a slow handler only delays itself.

use crate::core::dag::GraphSummary;
use crate::core::task::{CapabilitySet, ErrorKind, TaskId};
use crate::device::DeviceId;
use crate::orchestration::synchronizer::{Signal, SignalKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle signals published by the orchestrator and the synchronizer.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationEvent {
    /// A device acknowledged a task and started running it.
    TaskStarted {
        task_id: TaskId,
        device_id: DeviceId,
        attempt: u32,
    },
    /// A task finished successfully.
    TaskCompleted {
        task_id: TaskId,
        device_id: DeviceId,
        result: serde_json::Value,
    },
    /// A task failed for good (retry budget exhausted).
    TaskFailed {
        task_id: TaskId,
        device_id: Option<DeviceId>,
        kind: ErrorKind,
        message: String,
    },
    /// No live device can run a task; escalated to the reasoning oracle.
    TaskUnplaceable {
        task_id: TaskId,
        required: CapabilitySet,
        round: u32,
    },
    /// An edit cycle committed a delta.
    GraphModified {
        affected: Vec<TaskId>,
        before: GraphSummary,
        after: GraphSummary,
    },
}

impl OrchestrationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrchestrationEvent::TaskStarted { .. } => "task_started",
            OrchestrationEvent::TaskCompleted { .. } => "task_completed",
            OrchestrationEvent::TaskFailed { .. } => "task_failed",
            OrchestrationEvent::TaskUnplaceable { .. } => "task_unplaceable",
            OrchestrationEvent::GraphModified { .. } => "graph_modified",
        }
    }

    /// The modification request this event asks the synchronizer to handle.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            OrchestrationEvent::TaskCompleted { task_id, .. } => {
                Some(Signal::new(task_id.clone(), SignalKind::Completed))
            }
            OrchestrationEvent::TaskFailed { task_id, kind, .. } => {
                Some(Signal::new(task_id.clone(), SignalKind::Failed(*kind)))
            }
            OrchestrationEvent::TaskUnplaceable { task_id, .. } => {
                Some(Signal::new(task_id.clone(), SignalKind::Unplaceable))
            }
            OrchestrationEvent::TaskStarted { .. } | OrchestrationEvent::GraphModified { .. } => {
                None
            }
        }
    }
}

/// Receiving end of a bus subscription.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<OrchestrationEvent>,
}

impl EventSubscription {
    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<OrchestrationEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<OrchestrationEvent> {
        self.rx.try_recv().ok()
    }
}

/// Callback-style consumer, run on its own task by `subscribe_handler`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &OrchestrationEvent);
}

/// Publish/subscribe channel for lifecycle events.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<OrchestrationEvent>>>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live subscriber. Returns how many received it.
    pub fn publish(&self, event: OrchestrationEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(event = event.name(), "publishing event");

        let (delivered, closed) = {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let mut delivered = 0;
            let mut closed = false;
            for tx in subscribers.iter() {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed = true;
                }
            }
            (delivered, closed)
        };

        if closed {
            self.subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|tx| !tx.is_closed());
        }
        delivered
    }

    /// Subscribe with a channel; events published from now on are queued.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        EventSubscription { rx }
    }

    /// Run `handler` for every event on a dedicated task until `cancel` fires.
    pub fn subscribe_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => handler.handle(&event).await,
                        None => break,
                    },
                }
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Total events published over the bus lifetime.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}
