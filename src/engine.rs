//! # Acquisition Engine Seam
//!
//! The scheduler never drives hardware itself. Each parallel group is handed to an
//! [`AcquisitionEngine`], which runs the group's units concurrently on threads it owns
//! and reports back through the [`GroupCompletion`] passed in with the dispatch.

use std::sync::Arc;
use thiserror::Error;

use crate::sequence::Unit;

pub use crate::scheduler::{AbortSignal, GroupCompletion};

/// Fault raised by an engine while accepting a group
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result of handing a group to the engine
pub enum DispatchOutcome {
    /// The group is running; the handle aborts it
    Started(Arc<dyn GroupHandle>),
    /// The engine refused to interrupt an overlapping run; the round stops quietly
    Declined,
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started(_) => f.write_str("Started"),
            Self::Declined => f.write_str("Declined"),
        }
    }
}

/// Handle to a group the engine is executing
pub trait GroupHandle: Send + Sync {
    /// Abort every unit of the group
    ///
    /// Must not return until the engine has unwound all of them and released their
    /// resources. The engine may still call [`GroupCompletion::complete`] while unwinding;
    /// that late arrival is ignored.
    fn abort(&self);
}

/// Engine that executes one parallel group at a time
pub trait AcquisitionEngine: Send + Sync {
    /// Start `units` concurrently
    ///
    /// On [`DispatchOutcome::Started`] the engine must call `completion.complete()`
    /// exactly once, from one of its own threads, when the whole group is done.
    fn dispatch_group(
        &self,
        units: Vec<Unit>,
        interleaved: bool,
        completion: GroupCompletion,
    ) -> Result<DispatchOutcome, EngineError>;
}
