//! Callback objects handed to the engine with each dispatched group.

use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::rendezvous::{Arrival, RoundToken};
use super::Shared;
use crate::error::{Result, SchedulerError};
use crate::logging::log_error;
use crate::sequence::UnitId;

/// Completion callback for one dispatched group
///
/// Consumed by [`complete`](Self::complete), so each dispatch yields exactly one arrival.
pub struct GroupCompletion {
    token: Arc<RoundToken>,
    group: usize,
    signal: AbortSignal,
}

impl GroupCompletion {
    pub(crate) fn new(shared: Weak<Shared>, token: Arc<RoundToken>, group: usize) -> Self {
        let signal = AbortSignal {
            shared,
            round: token.round(),
        };
        Self {
            token,
            group,
            signal,
        }
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn round(&self) -> u64 {
        self.token.round()
    }

    /// Handle for flagging individual units while the group is still running
    pub fn abort_signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn mark_aborted(&self, unit: UnitId) -> bool {
        self.signal.mark_aborted(unit)
    }

    /// Signal that every unit of the group is done
    ///
    /// Blocks until the scheduler worker picks the signal up. If the round was aborted or
    /// has ended this returns immediately. Must be called from an engine thread, never
    /// from inside `dispatch_group`.
    pub fn complete(self) -> Result<()> {
        let round = self.token.round();
        match self.token.arrive(self.group) {
            Ok(Arrival::Met) => {
                debug!(round, group = self.group, "Group completion met scheduler worker");
                Ok(())
            }
            Ok(Arrival::RoundOver) => {
                debug!(
                    round,
                    group = self.group,
                    "Group completed after its round ended; nothing to release"
                );
                Ok(())
            }
            Err(e) => {
                let error = SchedulerError::invariant(format!(
                    "rendezvous broken for round {round}, group {}: {e}",
                    self.group
                ));
                log_error("group_completion", "complete", &error.to_string(), None);
                Err(error)
            }
        }
    }
}

impl fmt::Debug for GroupCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupCompletion")
            .field("round", &self.token.round())
            .field("group", &self.group)
            .finish()
    }
}

/// Flags units of one round as aborted
///
/// Marks only apply while that round is still tracked; afterwards they are ignored.
#[derive(Clone)]
pub struct AbortSignal {
    shared: Weak<Shared>,
    round: u64,
}

impl AbortSignal {
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn mark_aborted(&self, unit: UnitId) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.mark_unit_aborted(Some(self.round), unit),
            None => false,
        }
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("round", &self.round)
            .finish()
    }
}
