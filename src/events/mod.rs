//! # View Notifications
//!
//! The scheduler reports every status change and every structural edit to a
//! [`SchedulerObserver`]. Observers are notified after the change is visible and
//! outside of the scheduler's internal locks, so they may call back into it.

pub mod publisher;

pub use publisher::{EventPublisher, SchedulerEvent};

use crate::scheduler::RunReport;

/// Receiver for scheduler notifications
///
/// Calls may arrive from the caller's thread, the scheduler worker or an engine thread.
pub trait SchedulerObserver: Send + Sync {
    /// A unit status changed, or the status table appeared or disappeared
    fn on_status_changed(&self);

    /// Units were added, removed, reordered, regrouped or renamed
    fn on_sequence_changed(&self);

    /// A round returned to idle; called once per round
    fn on_run_finished(&self, _report: &RunReport) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SchedulerObserver for NoopObserver {
    fn on_status_changed(&self) {}

    fn on_sequence_changed(&self) {}
}
