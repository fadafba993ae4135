//! Orchestration layer: scheduling, dispatch, and batched graph editing.
//!
//! The `Orchestrator` drives the task graph and dispatches ready tasks to
//! devices chosen by an `AssignmentStrategy`. Lifecycle events go out on the
//! `EventBus`, where the `ModificationSynchronizer` turns them into batched
//! edit cycles against the `ReasoningOracle`. Both sides share the graph
//! through the `AssignmentLock`.

mod bus;
mod lock;
mod oracle;
mod orchestrator;
mod strategy;
mod synchronizer;

pub use bus::{EventBus, EventHandler, EventSubscription, OrchestrationEvent};
pub use lock::{AssignmentLock, EditGuard};
pub use oracle::{parse_delta, FnOracle, NoopOracle, OracleError, ReasoningOracle};
pub use orchestrator::{OrchestrationReport, Orchestrator, RetryDevicePolicy};
pub use strategy::{
    candidates, AssignmentStrategy, CapabilityMatch, LeastLoaded, NoCapableDevice, RoundRobin,
    Scored, StrategyKind,
};
pub use synchronizer::{ModificationSynchronizer, Signal, SignalKind, SyncProgress};
