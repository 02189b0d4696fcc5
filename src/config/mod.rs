//! # Scheduler Configuration
//!
//! Layered configuration for the multi-acquisition scheduler: built-in defaults, an
//! optional configuration file, then `ACQ_SCHEDULER_*` environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use acquisition_scheduler::config::SchedulerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SchedulerConfig::load(None)?;
//! assert!(!config.default_unit_name.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};

use crate::constants::system;
use crate::error::{Result, SchedulerError};

/// Root scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Display name given to units created with `add_new`
    pub default_unit_name: String,

    /// Whether groups are dispatched to the engine as interleaved acquisitions
    pub interleaved_dispatch: bool,

    /// Name of the dedicated worker thread that drives a round
    pub worker_thread_name: String,

    /// Emit JSON log lines instead of human-readable ones
    pub log_json: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_unit_name: system::DEFAULT_UNIT_NAME.to_string(),
            interleaved_dispatch: true,
            worker_thread_name: system::DEFAULT_WORKER_THREAD_NAME.to_string(),
            log_json: false,
        }
    }
}

impl SchedulerConfig {
    /// Reject values that would produce unnamed units or an unnamed worker
    pub fn validate(&self) -> Result<()> {
        if self.default_unit_name.trim().is_empty() {
            return Err(SchedulerError::Configuration(
                "default_unit_name must not be empty".to_string(),
            ));
        }
        if self.worker_thread_name.trim().is_empty() {
            return Err(SchedulerError::Configuration(
                "worker_thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
