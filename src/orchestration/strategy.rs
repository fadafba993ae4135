//! Assignment strategies: which device runs a ready task.
//!
//! Every strategy only considers healthy devices whose capability set is a
//! superset of the task's requirements. Strategies read device records but
//! never write the task graph or load counters; the orchestrator does the
//! bookkeeping once a dispatch decision is made.

use crate::core::task::{CapabilitySet, TaskId, TaskNode};
use crate::device::{DeviceId, DeviceRecord};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// No healthy device declares the capabilities a task requires.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no capable device for task {task} (requires {required:?})")]
pub struct NoCapableDevice {
    pub task: TaskId,
    pub required: CapabilitySet,
}

impl NoCapableDevice {
    pub fn for_task(task: &TaskNode) -> Self {
        Self {
            task: task.id.clone(),
            required: task.capabilities.clone(),
        }
    }
}

/// Policy mapping a ready task to a capable device.
pub trait AssignmentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick a device for `task` among `devices`.
    fn select_device(
        &self,
        task: &TaskNode,
        devices: &[Arc<DeviceRecord>],
    ) -> Result<DeviceId, NoCapableDevice>;
}

/// Healthy devices that provide every capability `task` requires.
pub fn candidates<'a>(task: &TaskNode, devices: &'a [Arc<DeviceRecord>]) -> Vec<&'a DeviceRecord> {
    devices
        .iter()
        .filter(|d| d.is_healthy() && d.provides(&task.capabilities))
        .map(|d| d.as_ref())
        .collect()
}

/// Cycles through the candidates in id order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssignmentStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select_device(
        &self,
        task: &TaskNode,
        devices: &[Arc<DeviceRecord>],
    ) -> Result<DeviceId, NoCapableDevice> {
        let mut pool = candidates(task, devices);
        if pool.is_empty() {
            return Err(NoCapableDevice::for_task(task));
        }
        pool.sort_by(|a, b| a.id.cmp(&b.id));
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        Ok(pool[slot].id.clone())
    }
}

/// Picks the candidate with the fewest active assignments.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

impl AssignmentStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn select_device(
        &self,
        task: &TaskNode,
        devices: &[Arc<DeviceRecord>],
    ) -> Result<DeviceId, NoCapableDevice> {
        candidates(task, devices)
            .into_iter()
            .min_by(|a, b| a.load().cmp(&b.load()).then_with(|| a.id.cmp(&b.id)))
            .map(|d| d.id.clone())
            .ok_or_else(|| NoCapableDevice::for_task(task))
    }
}

/// Prefers the most specialised candidate: fewest capabilities beyond the
/// required set, then least loaded.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapabilityMatch;

impl AssignmentStrategy for CapabilityMatch {
    fn name(&self) -> &'static str {
        "capability_match"
    }

    fn select_device(
        &self,
        task: &TaskNode,
        devices: &[Arc<DeviceRecord>],
    ) -> Result<DeviceId, NoCapableDevice> {
        let surplus = |d: &DeviceRecord| d.capabilities.len() - task.capabilities.len();
        candidates(task, devices)
            .into_iter()
            .min_by(|a, b| {
                surplus(a)
                    .cmp(&surplus(b))
                    .then_with(|| a.load().cmp(&b.load()))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|d| d.id.clone())
            .ok_or_else(|| NoCapableDevice::for_task(task))
    }
}

/// Custom scorer: the highest-scoring candidate wins, ties go to the lower id.
pub struct Scored<F> {
    scorer: F,
}

impl<F> Scored<F>
where
    F: Fn(&TaskNode, &DeviceRecord) -> i64 + Send + Sync,
{
    pub fn new(scorer: F) -> Self {
        Self { scorer }
    }
}

impl<F> AssignmentStrategy for Scored<F>
where
    F: Fn(&TaskNode, &DeviceRecord) -> i64 + Send + Sync,
{
    fn name(&self) -> &'static str {
        "scored"
    }

    fn select_device(
        &self,
        task: &TaskNode,
        devices: &[Arc<DeviceRecord>],
    ) -> Result<DeviceId, NoCapableDevice> {
        candidates(task, devices)
            .into_iter()
            .max_by(|a, b| {
                (self.scorer)(task, a)
                    .cmp(&(self.scorer)(task, b))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|d| d.id.clone())
            .ok_or_else(|| NoCapableDevice::for_task(task))
    }
}

/// Built-in strategies selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    #[default]
    LeastLoaded,
    CapabilityMatch,
}

impl StrategyKind {
    pub fn build(self) -> Arc<dyn AssignmentStrategy> {
        match self {
            StrategyKind::RoundRobin => Arc::new(RoundRobin::new()),
            StrategyKind::LeastLoaded => Arc::new(LeastLoaded),
            StrategyKind::CapabilityMatch => Arc::new(CapabilityMatch),
        }
    }
}
