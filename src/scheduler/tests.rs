use super::*;
use crate::constants::system;
use crate::engine::EngineError;
use crate::test_utils::{sequence_of, GroupScript, RecordingObserver, ScriptedEngine};
use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn scheduler_with(
    engine: &Arc<ScriptedEngine>,
    observer: &Arc<RecordingObserver>,
    groups: &[&[&str]],
) -> MultiAcquisitionScheduler {
    MultiAcquisitionScheduler::builder(engine.clone())
        .observer(observer.clone())
        .build_with_sequence(sequence_of(groups))
}

/// Poll until the scheduler is back to Idle, without joining the worker
fn wait_for_idle(scheduler: &MultiAcquisitionScheduler) {
    let deadline = Instant::now() + TIMEOUT;
    while scheduler.is_running() {
        assert!(Instant::now() < deadline, "scheduler stuck in {}", scheduler.state());
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_new_scheduler_has_one_default_unit() {
    let engine = Arc::new(ScriptedEngine::default());
    let scheduler = MultiAcquisitionScheduler::builder(engine).build();

    assert_eq!(scheduler.size(), 1);
    assert_eq!(scheduler.name(0).as_deref(), Some("Untitled"));
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert_eq!(scheduler.status(0), None);
    assert_eq!(scheduler.status_label(0), "");
}

#[test]
fn test_edits_notify_sequence_observer() {
    let engine = Arc::new(ScriptedEngine::default());
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A"]]);

    assert_eq!(scheduler.add_new().unwrap(), 1);
    scheduler.add_to_parallel_grouping(0).unwrap();
    scheduler.set_name(1, "B").unwrap();

    assert_eq!(scheduler.run_lengths(), vec![2]);
    assert_eq!(scheduler.name(1).as_deref(), Some("B"));
    assert_eq!(observer.sequence_changes(), 3);
}

#[test]
fn test_remove_last_unit_is_refused() {
    let engine = Arc::new(ScriptedEngine::default());
    let scheduler = MultiAcquisitionScheduler::builder(engine).build();
    assert_eq!(scheduler.remove(0).unwrap(), None);
    assert_eq!(scheduler.size(), 1);
}

#[test]
fn test_run_all_completes_every_group_in_order() {
    let engine = Arc::new(ScriptedEngine::default());
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A"], &["B"], &["C"]]);

    let round = scheduler.run_all().unwrap();
    let report = scheduler.join().unwrap();

    assert_eq!(report.round, round);
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.statuses, vec![UnitStatus::Finished; 3]);
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert_eq!(scheduler.status(0), None);

    let groups: Vec<Vec<String>> = engine.dispatched().into_iter().map(|d| d.names).collect();
    assert_eq!(groups, vec![vec!["A"], vec!["B"], vec!["C"]]);
    assert!(engine.dispatched().iter().all(|d| d.interleaved));
    assert_eq!(observer.reports().len(), 1);
}

#[test]
fn test_second_round_uses_fresh_token() {
    let engine = Arc::new(ScriptedEngine::default());
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A"], &["B"], &["C"]]);

    let first = scheduler.run_all().unwrap();
    assert!(scheduler.join().unwrap().outcome.is_success());
    let second = scheduler.run_all().unwrap();
    let report = scheduler.join().unwrap();

    assert_ne!(first, second);
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.statuses, vec![UnitStatus::Finished; 3]);
    assert_eq!(engine.dispatch_count(), 6);
}

#[test]
fn test_edits_are_busy_while_running() {
    let engine = Arc::new(ScriptedEngine::new([GroupScript::HoldUntilAborted]));
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A"], &["B"]]);

    scheduler.run_all().unwrap();
    assert!(engine.wait_for_dispatches(1, TIMEOUT));

    assert!(scheduler.is_running());
    assert_eq!(scheduler.add_new(), Err(SchedulerError::Busy));
    assert_eq!(scheduler.remove(0), Err(SchedulerError::Busy));
    assert_eq!(scheduler.move_down(0), Err(SchedulerError::Busy));
    assert_eq!(scheduler.run_all(), Err(SchedulerError::Busy));
    // Renaming is display-only and stays allowed
    scheduler.set_name(0, "Renamed").unwrap();
    assert_eq!(scheduler.status(0), Some(UnitStatus::Running));
    assert_eq!(scheduler.status_label(1), "Waiting");

    assert_eq!(scheduler.abort(), AbortDisposition::Aborted);
    assert_eq!(scheduler.size(), 2);
    assert!(scheduler.add_new().is_ok());
}

#[test]
fn test_marked_unit_stays_aborted_after_group_completes() {
    let engine = Arc::new(ScriptedEngine::new([GroupScript::AbortUnitsThenComplete(
        vec![0],
    )]));
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A", "B"], &["C"]]);

    scheduler.run_all().unwrap();
    let report = scheduler.join().unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(
        report.statuses,
        vec![
            UnitStatus::Aborted,
            UnitStatus::Finished,
            UnitStatus::Finished
        ]
    );
}

#[test]
fn test_abort_mid_run_waits_for_engine_unwind() {
    let engine = Arc::new(
        ScriptedEngine::new([GroupScript::Complete, GroupScript::HoldUntilAborted])
            .with_abort_delay(Duration::from_millis(50)),
    );
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A"], &["B"], &["C"]]);

    scheduler.run_all().unwrap();
    assert!(engine.wait_for_dispatches(2, TIMEOUT));

    assert_eq!(scheduler.abort(), AbortDisposition::Aborted);

    // abort returned, so the engine has unwound and the round is over
    assert_eq!(engine.unwound_count(), 1);
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    let report = scheduler.last_report().unwrap();
    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(
        report.statuses,
        vec![
            UnitStatus::Finished,
            UnitStatus::Aborted,
            UnitStatus::Waiting
        ]
    );
    assert_eq!(engine.dispatch_count(), 2);
    assert_eq!(observer.reports().len(), 1);

    // The held group's late completion is ignored rather than treated as a defect
    engine.join_threads();
    assert!(engine.completion_results().iter().all(Result::is_ok));
}

#[test]
fn test_dispatch_fault_stops_run() {
    let engine = Arc::new(ScriptedEngine::new([GroupScript::Fault(
        "stage not responding".to_string(),
    )]));
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A"], &["B"]]);

    scheduler.run_all().unwrap();
    let report = scheduler.join().unwrap();

    assert_eq!(
        report.outcome,
        RunOutcome::Failed {
            error: SchedulerError::DispatchFault {
                group: 0,
                message: "stage not responding".to_string()
            }
        }
    );
    assert_eq!(report.statuses, vec![UnitStatus::Running, UnitStatus::Waiting]);
    assert_eq!(engine.dispatch_count(), 1);
    assert_eq!(observer.reports().len(), 1);
    assert_eq!(scheduler.state(), SchedulerState::Idle);
}

#[test]
fn test_declined_dispatch_stops_quietly() {
    let engine = Arc::new(ScriptedEngine::new([
        GroupScript::Complete,
        GroupScript::Decline,
    ]));
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A"], &["B", "C"], &["D"]]);

    scheduler.run_all().unwrap();
    let report = scheduler.join().unwrap();

    assert_eq!(report.outcome, RunOutcome::Declined { group: 1 });
    assert_eq!(
        report.statuses,
        vec![
            UnitStatus::Finished,
            UnitStatus::Running,
            UnitStatus::Running,
            UnitStatus::Waiting
        ]
    );
    assert!(report.outcome.error().is_none());
    assert_eq!(engine.dispatch_count(), 2);
}

#[test]
fn test_abort_refused_by_confirmation() {
    let engine = Arc::new(ScriptedEngine::new([GroupScript::HoldUntilAborted]));
    let scheduler = MultiAcquisitionScheduler::builder(engine.clone())
        .confirmation(Arc::new(|| false))
        .build_with_sequence(sequence_of(&[&["A"]]));

    assert_eq!(scheduler.abort(), AbortDisposition::NotRunning);
    scheduler.run_all().unwrap();
    assert!(engine.wait_for_dispatches(1, TIMEOUT));

    assert_eq!(scheduler.abort(), AbortDisposition::Refused);
    assert!(scheduler.is_running());
    assert_eq!(engine.handle_abort_count(), 0);
}

#[test]
fn test_mark_as_aborted_requires_active_round() {
    let engine = Arc::new(ScriptedEngine::new([GroupScript::HoldUntilAborted]));
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A", "B"]]);
    let ids = scheduler.unit_ids();

    assert!(!scheduler.mark_as_aborted(ids[0]));

    scheduler.run_all().unwrap();
    assert!(engine.wait_for_dispatches(1, TIMEOUT));
    assert!(scheduler.mark_as_aborted(ids[1]));
    assert_eq!(scheduler.status(1), Some(UnitStatus::Aborted));

    scheduler.abort();
    assert!(!scheduler.mark_as_aborted(ids[1]));
}

#[test]
fn test_rows_show_group_order_and_status() {
    let engine = Arc::new(ScriptedEngine::default());
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A", "B"], &["C"]]);

    let rows = scheduler.rows();
    let orders: Vec<usize> = rows.iter().map(|row| row.order).collect();
    assert_eq!(orders, vec![1, 1, 2]);
    assert_eq!(rows[2].name, "C");
    assert!(rows.iter().all(|row| row.status.is_empty()));
}

#[test]
fn test_interleaved_flag_follows_config() {
    let engine = Arc::new(ScriptedEngine::default());
    let config = SchedulerConfig {
        interleaved_dispatch: false,
        ..Default::default()
    };
    let scheduler = MultiAcquisitionScheduler::builder(engine.clone())
        .config(config)
        .build_with_sequence(sequence_of(&[&["A"]]));

    scheduler.run_all().unwrap();
    scheduler.join().unwrap();
    assert!(!engine.dispatched()[0].interleaved);
}

#[test]
fn test_completion_inside_dispatch_fails_round() {
    let engine = Arc::new(ScriptedEngine::new([GroupScript::CompleteInline]));
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A"], &["B"]]);

    scheduler.run_all().unwrap();
    wait_for_idle(&scheduler);
    // Observers are notified after Idle; joining orders the reads after them
    scheduler.join();

    let report = scheduler.last_report().unwrap();
    assert!(matches!(
        report.outcome.error(),
        Some(SchedulerError::InvariantViolation(_))
    ));
    assert_eq!(report.statuses, vec![UnitStatus::Running, UnitStatus::Waiting]);
    assert_eq!(engine.dispatch_count(), 1);
    assert_eq!(engine.handle_abort_count(), 1);
    assert!(matches!(
        engine.completion_results().as_slice(),
        [Err(SchedulerError::InvariantViolation(_))]
    ));
    assert_eq!(observer.reports().len(), 1);
    assert!(scheduler.add_new().is_ok());
}

#[test]
fn test_engine_panic_during_dispatch_fails_round() {
    let engine = Arc::new(ScriptedEngine::new([GroupScript::Panic(
        "driver crashed".to_string(),
    )]));
    let observer = Arc::new(RecordingObserver::new());
    let scheduler = scheduler_with(&engine, &observer, &[&["A"], &["B"]]);

    scheduler.run_all().unwrap();
    wait_for_idle(&scheduler);
    // Observers are notified after Idle; joining orders the reads after them
    scheduler.join();

    let reports = observer.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].outcome,
        RunOutcome::Failed {
            error: SchedulerError::DispatchFault {
                group: 0,
                message: "engine panicked: driver crashed".to_string()
            }
        }
    );
    assert_eq!(engine.dispatch_count(), 1);
    assert!(scheduler.add_new().is_ok());
}

/// Panics on the first status change delivered on the scheduler worker
#[derive(Default)]
struct PanickingObserver {
    fired: AtomicBool,
    reports: Mutex<Vec<RunReport>>,
}

impl SchedulerObserver for PanickingObserver {
    fn on_status_changed(&self) {
        let on_worker = thread::current().name() == Some(system::DEFAULT_WORKER_THREAD_NAME);
        if on_worker && !self.fired.swap(true, Ordering::SeqCst) {
            panic!("view crashed");
        }
    }

    fn on_sequence_changed(&self) {}

    fn on_run_finished(&self, report: &RunReport) {
        self.reports.lock().push(report.clone());
    }
}

#[test]
fn test_observer_panic_on_worker_fails_round() {
    let engine = Arc::new(ScriptedEngine::default());
    let observer = Arc::new(PanickingObserver::default());
    let scheduler = MultiAcquisitionScheduler::builder(engine.clone())
        .observer(observer.clone())
        .build_with_sequence(sequence_of(&[&["A"], &["B"]]));

    scheduler.run_all().unwrap();
    wait_for_idle(&scheduler);
    // Observers are notified after Idle; joining orders the reads after them
    scheduler.join();

    let reports = observer.reports.lock().clone();
    assert_eq!(reports.len(), 1);
    match reports[0].outcome.error() {
        Some(SchedulerError::InvariantViolation(message)) => {
            assert!(message.contains("view crashed"), "{message}");
        }
        other => panic!("unexpected outcome error: {other:?}"),
    }
    assert_eq!(reports[0].statuses, vec![UnitStatus::Running, UnitStatus::Waiting]);
    assert_eq!(engine.dispatch_count(), 0);
    assert!(scheduler.add_new().is_ok());
}

/// Engine whose `dispatch_group` blocks until the test drops the gate sender
struct GatedEngine {
    entered: Sender<()>,
    gate: Receiver<()>,
    aborts: Arc<AtomicUsize>,
    completions: Arc<Mutex<Vec<Result<()>>>>,
}

struct GatedGroup {
    completion: Mutex<Option<GroupCompletion>>,
    aborts: Arc<AtomicUsize>,
    completions: Arc<Mutex<Vec<Result<()>>>>,
}

impl AcquisitionEngine for GatedEngine {
    fn dispatch_group(
        &self,
        _units: Vec<Unit>,
        _interleaved: bool,
        completion: GroupCompletion,
    ) -> std::result::Result<DispatchOutcome, EngineError> {
        let _ = self.entered.send(());
        let _ = self.gate.recv();
        Ok(DispatchOutcome::Started(Arc::new(GatedGroup {
            completion: Mutex::new(Some(completion)),
            aborts: Arc::clone(&self.aborts),
            completions: Arc::clone(&self.completions),
        })))
    }
}

impl GroupHandle for GatedGroup {
    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        let completion = self.completion.lock().take();
        if let Some(completion) = completion {
            let result = completion.complete();
            self.completions.lock().push(result);
        }
    }
}

#[test]
fn test_abort_during_blocking_dispatch_aborts_late_handle_once() {
    let (entered_tx, entered_rx) = bounded(1);
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let engine = Arc::new(GatedEngine {
        entered: entered_tx,
        gate: gate_rx,
        aborts: Arc::default(),
        completions: Arc::default(),
    });
    let scheduler = Arc::new(
        MultiAcquisitionScheduler::builder(engine.clone())
            .build_with_sequence(sequence_of(&[&["A"], &["B"]])),
    );

    scheduler.run_all().unwrap();
    entered_rx.recv_timeout(TIMEOUT).unwrap();

    let aborting = Arc::clone(&scheduler);
    let aborter = thread::spawn(move || aborting.abort());

    // Let abort cancel the round and find no handle before dispatch returns one
    let deadline = Instant::now() + TIMEOUT;
    while scheduler.state() != SchedulerState::Aborting {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    }
    thread::sleep(Duration::from_millis(50));
    drop(gate_tx);

    assert_eq!(aborter.join().unwrap(), AbortDisposition::Aborted);
    assert_eq!(engine.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    let report = scheduler.last_report().unwrap();
    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.statuses, vec![UnitStatus::Running, UnitStatus::Waiting]);
    // Completing while unwinding is a no-op, not a defect
    assert!(matches!(engine.completions.lock().as_slice(), [Ok(())]));
}
