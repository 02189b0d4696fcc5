//! # Constants
//!
//! Labels and defaults shared by the sequence, the status tracker and the scheduler.

/// Display labels for unit statuses, as shown in the acquisition table
pub mod status_labels {
    pub const WAITING: &str = "Waiting";
    pub const RUNNING: &str = "Running";
    pub const FINISHED: &str = "Finished";
    pub const ABORTED: &str = "Aborted";
    /// Label used when no run is active
    pub const NONE: &str = "";
}

/// System-level defaults
pub mod system {
    pub const DEFAULT_UNIT_NAME: &str = "Untitled";
    pub const DEFAULT_WORKER_THREAD_NAME: &str = "multi-acquisition-scheduler";
    /// Prefix for environment variable overrides (`ACQ_SCHEDULER_INTERLEAVED_DISPATCH=false`)
    pub const ENV_PREFIX: &str = "ACQ_SCHEDULER";
    pub const ENVIRONMENT_VAR: &str = "ACQ_SCHEDULER_ENV";
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
}
