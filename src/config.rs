use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::{RetryDevicePolicy, StrategyKind};
use crate::{Error, Result};

/// A device the CLI registers with a shell backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_device_kind")]
    pub kind: String,
    /// Working directory for shell devices.
    #[serde(default)]
    pub working_dir: Option<String>,
}

fn default_device_kind() -> String {
    "shell".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Extra attempts after the first failed dispatch of a task.
    pub max_retries: u32,
    pub retry_policy: RetryDevicePolicy,
    pub retry_backoff_ms: u64,
    pub ack_timeout_ms: u64,
    pub edit_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub no_device_backoff_ms: u64,
    /// Escalations allowed for a task no device can run before giving up.
    pub max_reasoning_rounds: u32,
    /// Failed edit cycles a signal survives before it is dropped.
    pub max_edit_attempts: u32,
    pub outcome_buffer: usize,
    pub strategy: StrategyKind,
    pub devices: Vec<DeviceConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_policy: RetryDevicePolicy::Any,
            retry_backoff_ms: 0,
            ack_timeout_ms: 30_000,
            edit_timeout_ms: 300_000,
            tick_interval_ms: 250,
            no_device_backoff_ms: 1_000,
            max_reasoning_rounds: 3,
            max_edit_attempts: 3,
            outcome_buffer: 256,
            strategy: StrategyKind::LeastLoaded,
            devices: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn constellation_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".constellation"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::constellation_dir()?.join("constellation.toml"))
    }

    /// Load from the default location. A missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            strategy = ?config.strategy,
            max_retries = config.max_retries,
            devices = config.devices.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("edit_timeout_ms", self.edit_timeout_ms),
            ("tick_interval_ms", self.tick_interval_ms),
            ("outcome_buffer", self.outcome_buffer as u64),
            ("max_edit_attempts", u64::from(self.max_edit_attempts)),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        if let Some((key, _)) = zero {
            return Err(Error::Validation(format!("{} must be greater than zero", key)));
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(Error::Validation("device id must not be empty".into()));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(Error::Validation(format!(
                    "device {} is declared twice",
                    device.id
                )));
            }
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn edit_timeout(&self) -> Duration {
        Duration::from_millis(self.edit_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn no_device_backoff(&self) -> Duration {
        Duration::from_millis(self.no_device_backoff_ms)
    }
}
