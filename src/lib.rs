#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Acquisition Scheduler
//!
//! Scheduling core for running many microscope acquisitions one parallel group at a time.
//!
//! ## Overview
//!
//! An experiment is an ordered list of acquisition units. Adjacent units can be joined
//! into a *parallel group*; the units of a group are handed to the acquisition engine
//! together and run interleaved, while groups themselves run strictly in order. The
//! scheduler tracks every unit through `Waiting`, `Running`, `Finished` or `Aborted`,
//! and supports a cooperative abort that only reports idle once the engine has unwound.
//!
//! ## Module Organization
//!
//! - [`sequence`] - Units and the run-length grouping that partitions them
//! - [`status`] - Per-unit status tracking for the round in progress
//! - [`scheduler`] - Worker thread, per-round rendezvous and abort handling
//! - [`engine`] - Seam to the acquisition engine that actually drives hardware
//! - [`events`] - View notifications and a broadcast publisher
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use acquisition_scheduler::test_utils::ScriptedEngine;
//! use acquisition_scheduler::MultiAcquisitionScheduler;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = MultiAcquisitionScheduler::builder(Arc::new(ScriptedEngine::default())).build();
//! scheduler.add_new()?;
//! scheduler.add_to_parallel_grouping(0)?;
//!
//! scheduler.run_all()?;
//! let report = scheduler.join().expect("round finished");
//! println!("{:?}", report.statuses);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod scheduler;
pub mod sequence;
pub mod status;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::SchedulerConfig;
pub use engine::{AcquisitionEngine, DispatchOutcome, EngineError, GroupHandle};
pub use error::{Result, SchedulerError};
pub use events::{EventPublisher, NoopObserver, SchedulerEvent, SchedulerObserver};
pub use scheduler::{
    AbortConfirmation, AbortDisposition, AbortSignal, GroupCompletion, MultiAcquisitionScheduler,
    RunOutcome, RunReport, SchedulerBuilder, SchedulerState,
};
pub use sequence::{GroupSpan, GroupingSequence, SequenceRow, Unit, UnitId};
pub use status::{StatusTracker, UnitStatus};
