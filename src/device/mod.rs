//! Execution devices: the registry of endpoints and the backends that reach them.

mod backend;
mod registry;

pub use backend::{DeviceBackend, DeviceError, DeviceOutput, FnBackend, ShellBackend, TaskRequest};
pub use registry::{DeviceId, DeviceRecord, DeviceRegistry, DeviceStatus};
