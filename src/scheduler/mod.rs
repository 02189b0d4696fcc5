//! # Multi-Acquisition Scheduler
//!
//! Runs the groups of a [`GroupingSequence`] strictly one after another on a dedicated
//! worker thread. Units inside a group are handed to the [`AcquisitionEngine`] together
//! and run concurrently under the engine's control; the worker then waits on the round's
//! rendezvous until the engine reports the group complete.
//!
//! ## States
//!
//! ```text
//! Idle --run_all--> Running --(groups exhausted | declined | fault)--> Idle
//!                      |
//!                    abort
//!                      v
//!                  Aborting --(engine unwound, worker joined)--> Idle
//! ```
//!
//! Structural edits are only accepted while Idle. Statuses are only tracked while a
//! round is in progress; the final statuses of a round are kept in its [`RunReport`].
//!
//! ## Cancellation
//!
//! `abort` cancels the round token, which interrupts the worker's rendezvous wait, then
//! aborts the engine handle of the running group and waits for the worker thread to
//! exit. Only then does the scheduler report Idle.

mod completion;
mod rendezvous;

#[cfg(test)]
mod tests;

pub use completion::{AbortSignal, GroupCompletion};
pub use rendezvous::{Arrival, RendezvousError, RoundToken};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::constants::status_labels;
use crate::engine::{AcquisitionEngine, DispatchOutcome, GroupHandle};
use crate::error::{Result, SchedulerError};
use crate::events::{NoopObserver, SchedulerObserver};
use crate::logging::{log_error, log_group_operation, log_run_operation};
use crate::sequence::{GroupingSequence, SequenceRow, Unit, UnitId};
use crate::status::{StatusTracker, UnitStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    /// Abort requested; waiting for the engine and the worker to unwind
    Aborting,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Aborting => write!(f, "aborting"),
        }
    }
}

/// How a round ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every group was dispatched and completed
    Completed,
    /// The engine declined to start `group`; later groups were not dispatched
    Declined { group: usize },
    /// Stopped by `abort`
    Aborted,
    /// Stopped by a dispatch fault or an internal defect
    Failed { error: SchedulerError },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn error(&self) -> Option<&SchedulerError> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Summary of one round, kept after the live status table is cleared
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub round: u64,
    pub outcome: RunOutcome,
    /// Status of every unit at the moment the round ended
    pub statuses: Vec<UnitStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortDisposition {
    /// No round was in progress
    NotRunning,
    /// The confirmation collaborator said no
    Refused,
    /// The round was aborted and the scheduler is Idle again
    Aborted,
}

/// Asks whether an in-progress round may really be aborted
pub trait AbortConfirmation: Send + Sync {
    fn confirm_abort(&self) -> bool;
}

impl<F> AbortConfirmation for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn confirm_abort(&self) -> bool {
        self()
    }
}

/// State shared between the caller, the worker thread and engine callbacks
///
/// Lock order: `state`, `sequence`, `round`, `tracker`, `current_handle`, `last_report`.
/// Observers are always notified with no lock held.
pub(crate) struct Shared {
    config: SchedulerConfig,
    engine: Arc<dyn AcquisitionEngine>,
    observer: Arc<dyn SchedulerObserver>,
    confirmation: Arc<dyn AbortConfirmation>,
    state: Mutex<SchedulerState>,
    sequence: RwLock<GroupingSequence>,
    round: Mutex<Arc<RoundToken>>,
    next_round: AtomicU64,
    tracker: Mutex<StatusTracker>,
    current_handle: Mutex<Option<Arc<dyn GroupHandle>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_report: Mutex<Option<RunReport>>,
}

impl Shared {
    /// Flag one unit as aborted, optionally only if `round` is the tracked round
    pub(crate) fn mark_unit_aborted(&self, round: Option<u64>, unit: UnitId) -> bool {
        let index = self.sequence.read().position_of(unit);
        let Some(index) = index else {
            warn!(%unit, "Cannot mark unknown unit as aborted");
            return false;
        };

        let marked = {
            let mut tracker = self.tracker.lock();
            match round {
                Some(round) => tracker.mark_aborted_in_round(round, index),
                None => tracker.mark_aborted(index),
            }
        };

        if marked {
            info!(%unit, index, "⛔ SCHEDULER: Unit marked as aborted");
            self.observer.on_status_changed();
        }
        marked
    }

    /// Return to Idle if still in `expected` state for `token`'s round
    ///
    /// Retires the token, manufactures the next one, clears the status table and reports
    /// the round. Returns false if another path already finished this round.
    fn finish_round(
        &self,
        token: &Arc<RoundToken>,
        outcome: RunOutcome,
        expected: SchedulerState,
    ) -> bool {
        let report = {
            let mut state = self.state.lock();
            if *state != expected {
                return false;
            }
            let mut round = self.round.lock();
            if !Arc::ptr_eq(&*round, token) {
                return false;
            }
            token.cancel();
            *round = Arc::new(RoundToken::new(self.next_round.fetch_add(1, Ordering::SeqCst)));
            drop(round);

            let statuses = self.tracker.lock().end();
            let stale_handle = self.current_handle.lock().take();
            drop(stale_handle);

            let report = RunReport {
                round: token.round(),
                outcome,
                statuses,
            };
            *self.last_report.lock() = Some(report.clone());
            *state = SchedulerState::Idle;
            report
        };

        let status = match &report.outcome {
            RunOutcome::Completed => "completed",
            RunOutcome::Declined { .. } => "declined",
            RunOutcome::Aborted => "aborted",
            RunOutcome::Failed { .. } => "failed",
        };
        log_run_operation("finish", report.round, report.statuses.len(), status);

        self.observer.on_status_changed();
        self.observer.on_run_finished(&report);
        true
    }

    fn fail_round(&self, token: &Arc<RoundToken>, error: SchedulerError, operation: &str) {
        log_error(
            "scheduler_worker",
            operation,
            &error.to_string(),
            Some(&format!("round {}", token.round())),
        );
        self.finish_round(token, RunOutcome::Failed { error }, SchedulerState::Running);
    }

    /// Abort the engine handle recorded for the running group, if nobody else took it
    fn abort_current_handle(&self) {
        let handle = self.current_handle.lock().take();
        if let Some(handle) = handle {
            info!("🛑 SCHEDULER: Aborting running group");
            handle.abort();
            info!("✅ SCHEDULER: Running group unwound");
        }
    }
}

/// Entry point of the worker thread
///
/// A panic anywhere in the round, including in an observer, fails the round so the
/// scheduler still returns to Idle.
fn run_worker(shared: Arc<Shared>, token: Arc<RoundToken>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        run_groups(Arc::clone(&shared), Arc::clone(&token));
    }));
    if let Err(payload) = result {
        let error = SchedulerError::invariant(format!(
            "scheduler worker panicked: {}",
            panic_message(payload.as_ref())
        ));
        shared.fail_round(&token, error, "run_groups");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Body of the worker thread for one round
fn run_groups(shared: Arc<Shared>, token: Arc<RoundToken>) {
    token.bind_worker(thread::current().id());
    let round = token.round();
    let group_count = shared.sequence.read().group_count();

    for group in 0..group_count {
        if token.is_cancelled() {
            debug!(round, group, "Cancellation observed before dispatch");
            return;
        }

        let dispatch = {
            let sequence = shared.sequence.read();
            sequence
                .group_span(group)
                .map(|span| (span, sequence.units()[span.range()].to_vec()))
        };
        let Some((span, units)) = dispatch else {
            let error = SchedulerError::invariant(format!(
                "group {group} vanished from the sequence during round {round}"
            ));
            shared.fail_round(&token, error, "dispatch");
            return;
        };

        shared.tracker.lock().set_running(span.range());
        shared.observer.on_status_changed();

        let names: Vec<String> = units.iter().map(|unit| unit.name.clone()).collect();
        log_group_operation("dispatch", round, group, &names, "running");

        let completion = GroupCompletion::new(Arc::downgrade(&shared), Arc::clone(&token), group);
        let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
            shared
                .engine
                .dispatch_group(units, shared.config.interleaved_dispatch, completion)
        }));
        let handle = match dispatched {
            Ok(Ok(DispatchOutcome::Started(handle))) => handle,
            Ok(Ok(DispatchOutcome::Declined)) => {
                log_group_operation("dispatch", round, group, &names, "declined");
                shared.finish_round(
                    &token,
                    RunOutcome::Declined { group },
                    SchedulerState::Running,
                );
                return;
            }
            Ok(Err(e)) => {
                let error = SchedulerError::DispatchFault {
                    group,
                    message: e.message,
                };
                shared.fail_round(&token, error, "dispatch");
                return;
            }
            Err(payload) => {
                let error = SchedulerError::DispatchFault {
                    group,
                    message: format!("engine panicked: {}", panic_message(payload.as_ref())),
                };
                shared.fail_round(&token, error, "dispatch");
                return;
            }
        };

        *shared.current_handle.lock() = Some(handle);

        match token.await_group(group) {
            Ok(()) => {}
            Err(RendezvousError::Interrupted) => {
                debug!(round, group, "Rendezvous wait interrupted by abort");
                // Covers a group whose handle was recorded after abort looked for it
                shared.abort_current_handle();
                return;
            }
            Err(e) => {
                shared.abort_current_handle();
                let error = SchedulerError::invariant(format!(
                    "rendezvous broken in round {round}, group {group}: {e}"
                ));
                shared.fail_round(&token, error, "await_group");
                return;
            }
        }

        let finished_handle = shared.current_handle.lock().take();
        drop(finished_handle);
        shared.tracker.lock().set_finished(span.range());
        shared.observer.on_status_changed();
        log_group_operation("complete", round, group, &names, "finished");
    }

    shared.finish_round(&token, RunOutcome::Completed, SchedulerState::Running);
}

/// Builder for [`MultiAcquisitionScheduler`]
pub struct SchedulerBuilder {
    engine: Arc<dyn AcquisitionEngine>,
    observer: Arc<dyn SchedulerObserver>,
    confirmation: Arc<dyn AbortConfirmation>,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn observer(mut self, observer: Arc<dyn SchedulerObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn confirmation(mut self, confirmation: Arc<dyn AbortConfirmation>) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> MultiAcquisitionScheduler {
        let first = Unit::new(self.config.default_unit_name.clone());
        self.build_with_sequence(GroupingSequence::new(first))
    }

    /// Build around an existing sequence instead of a single default unit
    pub fn build_with_sequence(self, sequence: GroupingSequence) -> MultiAcquisitionScheduler {
        let shared = Shared {
            config: self.config,
            engine: self.engine,
            observer: self.observer,
            confirmation: self.confirmation,
            state: Mutex::new(SchedulerState::Idle),
            sequence: RwLock::new(sequence),
            round: Mutex::new(Arc::new(RoundToken::new(1))),
            next_round: AtomicU64::new(2),
            tracker: Mutex::new(StatusTracker::new()),
            current_handle: Mutex::new(None),
            worker: Mutex::new(None),
            last_report: Mutex::new(None),
        };
        MultiAcquisitionScheduler {
            shared: Arc::new(shared),
        }
    }
}

/// Ordered, grouped acquisition list plus the machinery to run it
pub struct MultiAcquisitionScheduler {
    shared: Arc<Shared>,
}

impl MultiAcquisitionScheduler {
    /// Start building a scheduler around `engine`
    ///
    /// Defaults: no observer, aborts always confirmed, default configuration.
    pub fn builder(engine: Arc<dyn AcquisitionEngine>) -> SchedulerBuilder {
        SchedulerBuilder {
            engine,
            observer: Arc::new(NoopObserver),
            confirmation: Arc::new(|| true),
            config: SchedulerConfig::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    // ----- structural edits (Idle only) -----

    /// Append a new unit with the default name as its own group; returns its index
    pub fn add_new(&self) -> Result<usize> {
        let name = self.shared.config.default_unit_name.clone();
        self.edit("add_new", |sequence| {
            sequence.add_new(Unit::new(name));
            Ok(sequence.len() - 1)
        })
    }

    /// Append `unit` as its own group; returns its index
    pub fn add_unit(&self, unit: Unit) -> Result<usize> {
        self.edit("add_unit", |sequence| {
            sequence.add_new(unit);
            Ok(sequence.len() - 1)
        })
    }

    /// Remove the unit at `index`; the last remaining unit and bad indexes are ignored
    pub fn remove(&self, index: usize) -> Result<Option<UnitId>> {
        self.edit("remove", |sequence| {
            Ok(sequence.remove(index).map(|unit| unit.id()))
        })
    }

    pub fn move_up(&self, index: usize) -> Result<isize> {
        self.edit("move_up", |sequence| sequence.move_up(index))
    }

    pub fn move_down(&self, index: usize) -> Result<isize> {
        self.edit("move_down", |sequence| sequence.move_down(index))
    }

    pub fn add_to_parallel_grouping(&self, index: usize) -> Result<()> {
        self.edit("add_to_parallel_grouping", |sequence| {
            sequence.add_to_parallel_grouping(index)
        })
    }

    pub fn remove_from_parallel_grouping(&self, index: usize) -> Result<usize> {
        self.edit("remove_from_parallel_grouping", |sequence| {
            sequence.remove_from_parallel_grouping(index)
        })
    }

    pub fn set_settings(&self, index: usize, settings: Value) -> Result<()> {
        self.edit("set_settings", |sequence| {
            let len = sequence.len();
            let unit = sequence
                .unit_mut(index)
                .ok_or(SchedulerError::IndexOutOfRange { index, len })?;
            unit.settings = settings;
            Ok(())
        })
    }

    /// Rename a unit; allowed during a run since names are display-only
    pub fn set_name(&self, index: usize, name: impl Into<String>) -> Result<()> {
        {
            let mut sequence = self.shared.sequence.write();
            let len = sequence.len();
            let unit = sequence
                .unit_mut(index)
                .ok_or(SchedulerError::IndexOutOfRange { index, len })?;
            unit.name = name.into();
        }
        self.shared.observer.on_sequence_changed();
        Ok(())
    }

    fn edit<T>(
        &self,
        operation: &str,
        apply: impl FnOnce(&mut GroupingSequence) -> Result<T>,
    ) -> Result<T> {
        let result = {
            let state = self.shared.state.lock();
            if *state != SchedulerState::Idle {
                debug!(operation, state = %*state, "Rejected structural edit during run");
                return Err(SchedulerError::Busy);
            }
            let mut sequence = self.shared.sequence.write();
            let result = apply(&mut *sequence)?;
            debug_assert!(sequence.is_consistent(), "{operation} broke the grouping");
            result
        };
        self.shared.observer.on_sequence_changed();
        Ok(result)
    }

    // ----- queries -----

    pub fn size(&self) -> usize {
        self.shared.sequence.read().len()
    }

    pub fn group_count(&self) -> usize {
        self.shared.sequence.read().group_count()
    }

    pub fn run_lengths(&self) -> Vec<usize> {
        self.shared.sequence.read().run_lengths().to_vec()
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.shared.sequence.read().unit_ids()
    }

    pub fn name(&self, index: usize) -> Option<String> {
        self.shared
            .sequence
            .read()
            .unit(index)
            .map(|unit| unit.name.clone())
    }

    pub fn settings(&self, index: usize) -> Option<Value> {
        self.shared
            .sequence
            .read()
            .unit(index)
            .map(|unit| unit.settings.clone())
    }

    pub fn group_index_of(&self, index: usize) -> Result<usize> {
        self.shared.sequence.read().group_index_of(index)
    }

    /// Copy of the current sequence
    pub fn sequence_snapshot(&self) -> GroupingSequence {
        self.shared.sequence.read().clone()
    }

    /// Status of a unit in the running round; `None` while Idle
    pub fn status(&self, index: usize) -> Option<UnitStatus> {
        self.shared.tracker.lock().status(index)
    }

    /// Status label for display; empty while Idle
    pub fn status_label(&self, index: usize) -> &'static str {
        self.status(index)
            .map_or(status_labels::NONE, |status| status.label())
    }

    pub fn statuses(&self) -> Vec<UnitStatus> {
        self.shared.tracker.lock().snapshot()
    }

    /// Rows of the acquisition table: group number, name, status label
    pub fn rows(&self) -> Vec<SequenceRow> {
        let sequence = self.shared.sequence.read();
        let tracker = self.shared.tracker.lock();
        let mut rows = Vec::with_capacity(sequence.len());
        for group in 0..sequence.group_count() {
            let Some(span) = sequence.group_span(group) else {
                break;
            };
            for index in span.range() {
                rows.push(SequenceRow {
                    order: group + 1,
                    name: sequence.units()[index].name.clone(),
                    status: tracker
                        .status(index)
                        .map_or(status_labels::NONE, |status| status.label())
                        .to_string(),
                });
            }
        }
        rows
    }

    pub fn state(&self) -> SchedulerState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() != SchedulerState::Idle
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.shared.last_report.lock().clone()
    }

    // ----- execution -----

    /// Start a round on the worker thread; returns the round number
    #[instrument(skip(self))]
    pub fn run_all(&self) -> Result<u64> {
        let (token, unit_count) = {
            let mut state = self.shared.state.lock();
            if *state != SchedulerState::Idle {
                return Err(SchedulerError::Busy);
            }
            let unit_count = self.shared.sequence.read().len();
            let token = self.shared.round.lock().clone();
            self.shared.tracker.lock().begin(token.round(), unit_count);
            *state = SchedulerState::Running;
            (token, unit_count)
        };
        let round = token.round();
        log_run_operation("run_all", round, unit_count, "started");
        self.shared.observer.on_status_changed();

        let shared = Arc::clone(&self.shared);
        let worker_token = Arc::clone(&token);
        let spawned = {
            // Held across spawn so an abort cannot miss the worker it has to join
            let mut worker = self.shared.worker.lock();
            thread::Builder::new()
                .name(self.shared.config.worker_thread_name.clone())
                .spawn(move || run_worker(shared, worker_token))
                .map(|handle| {
                    // Any previous worker has already passed finish_round; detach it
                    *worker = Some(handle);
                })
        };

        match spawned {
            Ok(()) => Ok(round),
            Err(e) => {
                let error = SchedulerError::WorkerSpawn(e.to_string());
                self.shared.fail_round(&token, error.clone(), "run_all");
                Err(error)
            }
        }
    }

    /// Abort the round in progress
    ///
    /// After confirmation: cancels the worker, aborts the running group (blocking until
    /// the engine has unwound it), waits for the worker thread, then returns to Idle.
    #[instrument(skip(self))]
    pub fn abort(&self) -> AbortDisposition {
        if !self.is_running() {
            return AbortDisposition::NotRunning;
        }
        if !self.shared.confirmation.confirm_abort() {
            info!("Abort not confirmed; round continues");
            return AbortDisposition::Refused;
        }

        let token = {
            let mut state = self.shared.state.lock();
            if *state != SchedulerState::Running {
                return AbortDisposition::NotRunning;
            }
            *state = SchedulerState::Aborting;
            self.shared.round.lock().clone()
        };
        info!(round = token.round(), "🛑 SCHEDULER: Abort requested");
        self.shared.observer.on_status_changed();

        token.cancel();
        self.shared.abort_current_handle();
        self.join_worker();

        self.shared
            .finish_round(&token, RunOutcome::Aborted, SchedulerState::Aborting);
        AbortDisposition::Aborted
    }

    /// Flag a unit of the running round as aborted so its group's completion keeps it
    pub fn mark_as_aborted(&self, unit: UnitId) -> bool {
        self.shared.mark_unit_aborted(None, unit)
    }

    /// Wait for the current worker thread, then return the last round's report
    pub fn join(&self) -> Option<RunReport> {
        let panicked = self.join_worker();

        if panicked && self.state() == SchedulerState::Running {
            let token = self.shared.round.lock().clone();
            let error = SchedulerError::invariant("worker exited without finishing its round");
            self.shared.fail_round(&token, error, "join");
        }
        self.last_report()
    }

    /// Join the stored worker thread; returns true if it panicked
    fn join_worker(&self) -> bool {
        let handle = self.shared.worker.lock().take();
        let Some(handle) = handle else {
            return false;
        };
        if handle.thread().id() == thread::current().id() {
            // Called from an observer on the worker itself; it exits on its own
            *self.shared.worker.lock() = Some(handle);
            return false;
        }
        if handle.join().is_err() {
            log_error("scheduler", "join_worker", "worker thread panicked", None);
            return true;
        }
        false
    }
}

impl fmt::Debug for MultiAcquisitionScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiAcquisitionScheduler")
            .field("state", &self.state())
            .field("units", &self.size())
            .field("run_lengths", &self.run_lengths())
            .finish()
    }
}
