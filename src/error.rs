use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the grouping sequence and the execution scheduler.
///
/// Declined dispatches, cancellation breaks and refused removals of the last unit are
/// not errors; they show up as [`crate::scheduler::RunOutcome`] variants or as no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SchedulerError {
    /// Structural edit attempted while a run is in progress
    #[error("Scheduler busy: sequence cannot be edited while a run is in progress")]
    Busy,

    #[error("Index {index} out of range for sequence of {len} units")]
    IndexOutOfRange { index: usize, len: usize },

    /// The engine raised a fault while accepting a group
    #[error("Dispatch fault on group {group}: {message}")]
    DispatchFault { group: usize, message: String },

    /// A condition that the data structures make impossible has been observed
    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Failed to spawn scheduler worker: {0}")]
    WorkerSpawn(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SchedulerError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// True for conditions that indicate a defect rather than a runtime situation
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

impl From<::config::ConfigError> for SchedulerError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
