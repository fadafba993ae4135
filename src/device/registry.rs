//! Device registry for execution endpoints.
//!
//! The `DeviceRegistry` tracks every registered device, its declared
//! capabilities, liveness, and current load, together with the backend used
//! to reach it. It is read-mostly: readers take a cheap snapshot of
//! `Arc<DeviceRecord>`s, and load counters are atomics so the orchestrator
//! can update bookkeeping without locking the registry.

use crate::core::task::CapabilitySet;
use crate::device::backend::DeviceBackend;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Unique identifier for an execution device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Connectivity and liveness of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceStatus {
    /// Connected and accepting work.
    #[default]
    Healthy = 0,
    /// Connected but misbehaving; not offered new work.
    Degraded = 1,
    /// Unreachable.
    Offline = 2,
}

impl DeviceStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DeviceStatus::Healthy,
            1 => DeviceStatus::Degraded,
            _ => DeviceStatus::Offline,
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceStatus::Healthy => "healthy",
            DeviceStatus::Degraded => "degraded",
            DeviceStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// One execution endpoint.
#[derive(Debug)]
pub struct DeviceRecord {
    pub id: DeviceId,
    /// Capabilities the device declared at registration.
    pub capabilities: CapabilitySet,
    /// Backend kind label, e.g. `shell` or `in_process`.
    pub kind: String,
    status: AtomicU8,
    load: AtomicUsize,
}

impl DeviceRecord {
    pub fn new<I, S>(id: impl Into<DeviceId>, capabilities: I, kind: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            kind: kind.to_string(),
            status: AtomicU8::new(DeviceStatus::Healthy as u8),
            load: AtomicUsize::new(0),
        }
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: DeviceStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == DeviceStatus::Healthy
    }

    /// Number of active assignments on this device.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// Whether the device declares every capability in `required`.
    pub fn provides(&self, required: &CapabilitySet) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub(crate) fn acquire(&self) {
        self.load.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        // Saturate at zero: a device re-registered mid-run starts from zero.
        let _ = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

struct DeviceEntry {
    record: Arc<DeviceRecord>,
    backend: Arc<dyn DeviceBackend>,
}

/// Lookup of available devices, consulted by the assignment strategy.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use constellation::device::{DeviceRecord, DeviceRegistry, ShellBackend};
///
/// let registry = DeviceRegistry::new();
/// registry.register(
///     DeviceRecord::new("build-box", ["shell"], "shell"),
///     Arc::new(ShellBackend::default()),
/// );
/// assert_eq!(registry.len(), 1);
/// ```
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<DeviceId, DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a device. Returns the record now in the registry.
    pub fn register(
        &self,
        record: DeviceRecord,
        backend: Arc<dyn DeviceBackend>,
    ) -> Arc<DeviceRecord> {
        let record = Arc::new(record);
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = devices.insert(
            record.id.clone(),
            DeviceEntry {
                record: Arc::clone(&record),
                backend,
            },
        );
        if replaced.is_some() {
            tracing::info!(device = %record.id, "device re-registered");
        } else {
            tracing::info!(
                device = %record.id,
                kind = %record.kind,
                capabilities = ?record.capabilities,
                "device registered"
            );
        }
        record
    }

    /// Remove a device. In-flight calls keep their backend handle.
    pub fn deregister(&self, id: &DeviceId) -> Result<()> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        devices
            .remove(id)
            .map(|_| tracing::info!(device = %id, "device deregistered"))
            .ok_or_else(|| Error::DeviceNotFound(id.clone()))
    }

    pub fn set_status(&self, id: &DeviceId, status: DeviceStatus) -> Result<()> {
        let record = self
            .get(id)
            .ok_or_else(|| Error::DeviceNotFound(id.clone()))?;
        record.set_status(status);
        tracing::debug!(device = %id, %status, "device status changed");
        Ok(())
    }

    pub fn get(&self, id: &DeviceId) -> Option<Arc<DeviceRecord>> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.get(id).map(|e| Arc::clone(&e.record))
    }

    pub fn backend(&self, id: &DeviceId) -> Option<Arc<dyn DeviceBackend>> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.get(id).map(|e| Arc::clone(&e.backend))
    }

    /// Every registered device, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<DeviceRecord>> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.values().map(|e| Arc::clone(&e.record)).collect()
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of active assignments across all devices.
    pub fn total_load(&self) -> usize {
        self.snapshot().iter().map(|d| d.load()).sum()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.len())
            .finish()
    }
}
