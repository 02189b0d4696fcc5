//! # Test Utilities
//!
//! A scripted acquisition engine and a recording observer, shared by the unit tests
//! and the integration tests. The engine runs every group on its own threads, the way
//! a real engine would, and can be told per group to complete, fault, decline, flag
//! units as aborted or hold until its handle is aborted.
//!
//! Only compiled for tests or with the `test-utils` feature.

use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::{
    AbortSignal, AcquisitionEngine, DispatchOutcome, EngineError, GroupCompletion, GroupHandle,
};
use crate::error::Result;
use crate::events::SchedulerObserver;
use crate::scheduler::RunReport;
use crate::sequence::{GroupingSequence, Unit};

/// What the scripted engine does with one dispatched group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupScript {
    /// Complete straight away from an engine thread
    Complete,
    /// Complete after running for the given time
    CompleteAfter(Duration),
    /// Flag the units at these in-group positions as aborted, then complete
    AbortUnitsThenComplete(Vec<usize>),
    /// Keep running until the group handle is aborted
    HoldUntilAborted,
    /// Raise a fault from `dispatch_group`
    Fault(String),
    /// Refuse to interrupt an overlapping run
    Decline,
    /// Complete synchronously from inside `dispatch_group`, which is a contract violation
    CompleteInline,
    /// Panic inside `dispatch_group`
    Panic(String),
}

/// One call to `dispatch_group` as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub round: u64,
    pub group: usize,
    pub names: Vec<String>,
    pub interleaved: bool,
}

type CompletionLog = Arc<Mutex<Vec<Result<()>>>>;

/// Engine that follows a per-dispatch script; unscripted dispatches complete at once
#[derive(Default)]
pub struct ScriptedEngine {
    scripts: Mutex<VecDeque<GroupScript>>,
    dispatched: Mutex<Vec<DispatchRecord>>,
    completions: CompletionLog,
    handle_aborts: Arc<AtomicUsize>,
    unwound: Arc<AtomicUsize>,
    abort_delay: Duration,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ScriptedEngine {
    pub fn new(scripts: impl IntoIterator<Item = GroupScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Make every held group take `delay` to unwind when aborted
    pub fn with_abort_delay(mut self, delay: Duration) -> Self {
        self.abort_delay = delay;
        self
    }

    pub fn dispatched(&self) -> Vec<DispatchRecord> {
        self.dispatched.lock().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().len()
    }

    /// Results of every `GroupCompletion::complete` call made so far
    pub fn completion_results(&self) -> Vec<Result<()>> {
        self.completions.lock().clone()
    }

    pub fn handle_abort_count(&self) -> usize {
        self.handle_aborts.load(Ordering::SeqCst)
    }

    /// Number of held groups that finished unwinding after an abort
    pub fn unwound_count(&self) -> usize {
        self.unwound.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` groups have been dispatched
    pub fn wait_for_dispatches(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.dispatch_count() < count {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    /// Wait for every completion thread spawned so far
    pub fn join_threads(&self) {
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }

    fn complete_later(
        &self,
        delay: Duration,
        aborted_positions: Vec<usize>,
        units: Vec<Unit>,
        completion: GroupCompletion,
    ) -> DispatchOutcome {
        let completions = Arc::clone(&self.completions);
        let runner = thread::spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            for position in aborted_positions {
                if let Some(unit) = units.get(position) {
                    completion.mark_aborted(unit.id());
                }
            }
            let result = completion.complete();
            completions.lock().push(result);
        });
        self.threads.lock().push(runner);

        DispatchOutcome::Started(Arc::new(CompletingGroup {
            aborts: Arc::clone(&self.handle_aborts),
        }))
    }
}

impl AcquisitionEngine for ScriptedEngine {
    fn dispatch_group(
        &self,
        units: Vec<Unit>,
        interleaved: bool,
        completion: GroupCompletion,
    ) -> std::result::Result<DispatchOutcome, EngineError> {
        self.dispatched.lock().push(DispatchRecord {
            round: completion.round(),
            group: completion.group(),
            names: units.iter().map(|unit| unit.name.clone()).collect(),
            interleaved,
        });
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or(GroupScript::Complete);

        match script {
            GroupScript::Fault(message) => Err(EngineError::new(message)),
            GroupScript::Decline => Ok(DispatchOutcome::Declined),
            GroupScript::Panic(message) => panic!("{message}"),
            GroupScript::CompleteInline => {
                let result = completion.complete();
                self.completions.lock().push(result);
                Ok(DispatchOutcome::Started(Arc::new(CompletingGroup {
                    aborts: Arc::clone(&self.handle_aborts),
                })))
            }
            GroupScript::Complete => {
                Ok(self.complete_later(Duration::ZERO, Vec::new(), units, completion))
            }
            GroupScript::CompleteAfter(delay) => {
                Ok(self.complete_later(delay, Vec::new(), units, completion))
            }
            GroupScript::AbortUnitsThenComplete(positions) => {
                Ok(self.complete_later(Duration::ZERO, positions, units, completion))
            }
            GroupScript::HoldUntilAborted => Ok(DispatchOutcome::Started(Arc::new(
                HeldGroup::start(
                    units,
                    completion,
                    Arc::clone(&self.completions),
                    Arc::clone(&self.handle_aborts),
                    Arc::clone(&self.unwound),
                    self.abort_delay,
                ),
            ))),
        }
    }
}

/// Handle for a group whose completion is already on its way
struct CompletingGroup {
    aborts: Arc<AtomicUsize>,
}

impl GroupHandle for CompletingGroup {
    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Group that runs until its handle is aborted
struct HeldGroup {
    units: Vec<Unit>,
    signal: AbortSignal,
    stop: Mutex<Option<Sender<()>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    aborts: Arc<AtomicUsize>,
    unwound: Arc<AtomicUsize>,
    delay: Duration,
}

impl HeldGroup {
    fn start(
        units: Vec<Unit>,
        completion: GroupCompletion,
        completions: CompletionLog,
        aborts: Arc<AtomicUsize>,
        unwound: Arc<AtomicUsize>,
        delay: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let signal = completion.abort_signal();
        let runner = thread::spawn(move || {
            // Returns once the sender is dropped
            let _ = stop_rx.recv();
            let result = completion.complete();
            completions.lock().push(result);
        });
        Self {
            units,
            signal,
            stop: Mutex::new(Some(stop_tx)),
            runner: Mutex::new(Some(runner)),
            aborts,
            unwound,
            delay,
        }
    }
}

impl GroupHandle for HeldGroup {
    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        for unit in &self.units {
            self.signal.mark_aborted(unit.id());
        }
        self.stop.lock().take();
        let runner = self.runner.lock().take();
        if let Some(runner) = runner {
            let _ = runner.join();
            self.unwound.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Observer that counts notifications and keeps every run report
#[derive(Default)]
pub struct RecordingObserver {
    status_changes: AtomicUsize,
    sequence_changes: AtomicUsize,
    reports: Mutex<Vec<RunReport>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_changes(&self) -> usize {
        self.status_changes.load(Ordering::SeqCst)
    }

    pub fn sequence_changes(&self) -> usize {
        self.sequence_changes.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<RunReport> {
        self.reports.lock().clone()
    }
}

impl SchedulerObserver for RecordingObserver {
    fn on_status_changed(&self) {
        self.status_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_sequence_changed(&self) {
        self.sequence_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_run_finished(&self, report: &RunReport) {
        self.reports.lock().push(report.clone());
    }
}

/// Build a sequence from group name lists, e.g. `&[&["A", "B"], &["C"]]`
pub fn sequence_of(groups: &[&[&str]]) -> GroupingSequence {
    let groups = groups
        .iter()
        .map(|group| group.iter().map(|name| Unit::new(*name)).collect())
        .collect();
    match GroupingSequence::from_groups(groups) {
        Ok(sequence) => sequence,
        Err(e) => panic!("invalid test sequence: {e}"),
    }
}
