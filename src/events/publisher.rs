use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::SchedulerObserver;
use crate::constants::system;
use crate::scheduler::{RunOutcome, RunReport};

/// Notification broadcast to subscribed views
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    StatusChanged {
        at: DateTime<Utc>,
    },
    SequenceChanged {
        at: DateTime<Utc>,
    },
    RunFinished {
        round: u64,
        outcome: RunOutcome,
        at: DateTime<Utc>,
    },
}

impl SchedulerEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::SequenceChanged { .. } => "sequence_changed",
            Self::RunFinished { .. } => "run_finished",
        }
    }
}

/// Observer that fans notifications out over a broadcast channel
///
/// Subscribers that fall behind lose the oldest events; views only need the latest
/// state anyway. Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: SchedulerEvent) {
        tracing::trace!(event_type = event.event_type(), "Publishing scheduler event");
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(system::EVENT_CHANNEL_CAPACITY)
    }
}

impl SchedulerObserver for EventPublisher {
    fn on_status_changed(&self) {
        self.publish(SchedulerEvent::StatusChanged { at: Utc::now() });
    }

    fn on_sequence_changed(&self) {
        self.publish(SchedulerEvent::SequenceChanged { at: Utc::now() });
    }

    fn on_run_finished(&self, report: &RunReport) {
        self.publish(SchedulerEvent::RunFinished {
            round: report.round,
            outcome: report.outcome.clone(),
            at: Utc::now(),
        });
    }
}
