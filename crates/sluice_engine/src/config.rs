//! Control plane configuration.

use serde::{Deserialize, Serialize};
use sluice_interrupt::{InterruptMonitor, InterruptMonitorConfig};
use sluice_restraint::RestraintMonitor;
use sluice_runtime::{IteratorConfig, IteratorConfigError};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Config file
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not a valid configuration document
    #[error("cannot parse config {path}: {source}")]
    Parse {
        /// Config file
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },

    /// A lock timeout of zero would make every registration fail
    #[error("{field} must be at least 1 second")]
    ZeroLockTimeout {
        /// Offending field
        field: &'static str,
    },

    /// Stuck threshold of zero would treat every interrupt as stuck
    #[error("interrupt_monitor.stuck_threshold_secs must be at least 1")]
    ZeroStuckThreshold,

    /// Invalid iterator schedule
    #[error(transparent)]
    Iterator(#[from] IteratorConfigError),
}

/// Everything a replica needs to know to run the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// How long interrupt registration waits for the plan lock
    pub interrupt_lock_timeout_secs: u64,
    /// How long restraint admission waits for the unit lock
    pub restraint_lock_timeout_secs: u64,
    /// Stuck-interrupt sweep
    pub interrupt_monitor: InterruptMonitorConfig,
    /// Restraint reconciliation sweep
    pub restraint_monitor: IteratorConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            interrupt_lock_timeout_secs: 15,
            restraint_lock_timeout_secs: 15,
            interrupt_monitor: InterruptMonitorConfig::default(),
            restraint_monitor: RestraintMonitor::default_config(),
        }
    }
}

impl ControlPlaneConfig {
    /// Load and validate a JSON configuration file
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field for values the control plane cannot run with
    ///
    /// # Errors
    ///
    /// Returns the first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interrupt_lock_timeout_secs == 0 {
            return Err(ConfigError::ZeroLockTimeout {
                field: "interrupt_lock_timeout_secs",
            });
        }
        if self.restraint_lock_timeout_secs == 0 {
            return Err(ConfigError::ZeroLockTimeout {
                field: "restraint_lock_timeout_secs",
            });
        }
        if self.interrupt_monitor.stuck_threshold_secs == 0 {
            return Err(ConfigError::ZeroStuckThreshold);
        }
        self.interrupt_monitor.iterator.validate(InterruptMonitor::NAME)?;
        self.restraint_monitor.validate(RestraintMonitor::NAME)?;
        Ok(())
    }

    /// Interrupt lock timeout
    #[must_use]
    pub fn interrupt_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.interrupt_lock_timeout_secs)
    }

    /// Restraint lock timeout
    #[must_use]
    pub fn restraint_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.restraint_lock_timeout_secs)
    }
}
