//! # Unit Status Tracking
//!
//! Per-unit lifecycle status for the round currently in progress. The tracker is
//! only populated between `begin` and `end`; outside a round every query returns `None`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use crate::constants::status_labels;

/// Lifecycle of a unit within one round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Not yet dispatched
    #[default]
    Waiting,
    /// Its group has been handed to the engine
    Running,
    /// Its group completed the rendezvous
    Finished,
    /// Flagged by the engine or by an abort; never overwritten by `Finished`
    Aborted,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Waiting => status_labels::WAITING,
            Self::Running => status_labels::RUNNING,
            Self::Finished => status_labels::FINISHED,
            Self::Aborted => status_labels::ABORTED,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Default)]
pub struct StatusTracker {
    round: Option<u64>,
    slots: Vec<UnitStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `unit_count` units for `round`, all `Waiting`
    pub fn begin(&mut self, round: u64, unit_count: usize) {
        self.round = Some(round);
        self.slots = vec![UnitStatus::Waiting; unit_count];
    }

    pub fn is_active(&self) -> bool {
        self.round.is_some()
    }

    pub fn round(&self) -> Option<u64> {
        self.round
    }

    pub fn set_running(&mut self, range: Range<usize>) {
        for slot in self.slots_mut(range) {
            *slot = UnitStatus::Running;
        }
    }

    /// Mark a group finished; slots already `Aborted` keep their status
    pub fn set_finished(&mut self, range: Range<usize>) {
        for slot in self.slots_mut(range) {
            if *slot != UnitStatus::Aborted {
                *slot = UnitStatus::Finished;
            }
        }
    }

    /// Flag one unit as aborted regardless of its current status
    ///
    /// Returns false when no round is tracked or the index is out of range.
    pub fn mark_aborted(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) if self.round.is_some() => {
                *slot = UnitStatus::Aborted;
                true
            }
            _ => false,
        }
    }

    /// Like [`mark_aborted`](Self::mark_aborted), but only for the given round
    pub fn mark_aborted_in_round(&mut self, round: u64, index: usize) -> bool {
        self.round == Some(round) && self.mark_aborted(index)
    }

    pub fn status(&self, index: usize) -> Option<UnitStatus> {
        self.round?;
        self.slots.get(index).copied()
    }

    pub fn snapshot(&self) -> Vec<UnitStatus> {
        self.slots.clone()
    }

    /// Stop tracking, returning the final statuses of the round
    pub fn end(&mut self) -> Vec<UnitStatus> {
        self.round = None;
        std::mem::take(&mut self.slots)
    }

    fn slots_mut(&mut self, range: Range<usize>) -> &mut [UnitStatus] {
        let end = range.end.min(self.slots.len());
        let start = range.start.min(end);
        &mut self.slots[start..end]
    }
}
