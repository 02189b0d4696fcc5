//! # Acquisition Scheduler Simulator
//!
//! Runs a grouped acquisition sequence against a simulated engine that "acquires" by
//! sleeping, and prints the acquisition table before and after the round.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use parking_lot::Mutex;
use tracing::info;

use acquisition_scheduler::engine::{
    AcquisitionEngine, DispatchOutcome, EngineError, GroupCompletion, GroupHandle,
};
use acquisition_scheduler::logging::init_structured_logging;
use acquisition_scheduler::{
    EventPublisher, GroupingSequence, MultiAcquisitionScheduler, SchedulerConfig, SchedulerEvent,
    Unit,
};

#[derive(Parser)]
#[command(name = "acq-sim")]
#[command(about = "Run a grouped acquisition sequence against a simulated engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Group sizes in run order, e.g. "2,1,3"
    #[arg(short, long, default_value = "1,2,1")]
    groups: String,

    /// Simulated acquisition time per unit, in milliseconds
    #[arg(long, default_value_t = 200)]
    unit_ms: u64,

    /// Abort the round after this many milliseconds
    #[arg(long)]
    abort_after_ms: Option<u64>,
}

/// Engine that runs each unit of a group on its own sleeping thread
struct SimulatedEngine {
    unit_time: Duration,
}

struct SimulatedGroup {
    stop: Arc<AtomicBool>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl AcquisitionEngine for SimulatedEngine {
    fn dispatch_group(
        &self,
        units: Vec<Unit>,
        interleaved: bool,
        completion: GroupCompletion,
    ) -> Result<DispatchOutcome, EngineError> {
        info!(
            group = completion.group(),
            units = units.len(),
            interleaved,
            "Simulated engine starting group"
        );
        let stop = Arc::new(AtomicBool::new(false));
        let unit_time = self.unit_time;
        let runner_stop = Arc::clone(&stop);
        let signal = completion.abort_signal();

        let runner = thread::Builder::new()
            .name(format!("sim-group-{}", completion.group()))
            .spawn(move || {
                let workers: Vec<_> = units
                    .into_iter()
                    .map(|unit| {
                        let stop = Arc::clone(&runner_stop);
                        let signal = signal.clone();
                        thread::spawn(move || {
                            let step = Duration::from_millis(10);
                            let mut elapsed = Duration::ZERO;
                            while elapsed < unit_time {
                                if stop.load(Ordering::SeqCst) {
                                    signal.mark_aborted(unit.id());
                                    return;
                                }
                                thread::sleep(step);
                                elapsed += step;
                            }
                        })
                    })
                    .collect();
                for worker in workers {
                    let _ = worker.join();
                }
                if let Err(e) = completion.complete() {
                    tracing::error!(error = %e, "Group completion failed");
                }
            })
            .map_err(|e| EngineError::new(format!("cannot start group thread: {e}")))?;

        Ok(DispatchOutcome::Started(Arc::new(SimulatedGroup {
            stop,
            runner: Mutex::new(Some(runner)),
        })))
    }
}

impl GroupHandle for SimulatedGroup {
    fn abort(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let runner = self.runner.lock().take();
        if let Some(runner) = runner {
            let _ = runner.join();
        }
    }
}

fn parse_groups(spec: &str, default_name: &str) -> anyhow::Result<GroupingSequence> {
    let mut groups = Vec::new();
    let mut counter = 0;
    for size in spec.split(',') {
        let size: usize = size
            .trim()
            .parse()
            .with_context(|| format!("invalid group size '{size}'"))?;
        if size == 0 {
            bail!("group sizes must be at least 1");
        }
        let group: Vec<Unit> = (0..size)
            .map(|_| {
                counter += 1;
                Unit::new(format!("{default_name} {counter}"))
            })
            .collect();
        groups.push(group);
    }
    Ok(GroupingSequence::from_groups(groups)?)
}

fn print_table(scheduler: &MultiAcquisitionScheduler, statuses: &[String]) {
    println!("{:<6} {:<20} {}", "Order", "Name", "Status");
    for (index, row) in scheduler.rows().into_iter().enumerate() {
        let status = statuses.get(index).map_or(row.status.as_str(), String::as_str);
        println!("{:<6} {:<20} {}", row.order, row.name, status);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = SchedulerConfig::load(cli.config.as_deref())?;
    init_structured_logging(config.log_json);

    let sequence = parse_groups(&cli.groups, &config.default_unit_name)?;
    let publisher = Arc::new(EventPublisher::default());
    let mut events = publisher.subscribe();

    let scheduler = MultiAcquisitionScheduler::builder(Arc::new(SimulatedEngine {
        unit_time: Duration::from_millis(cli.unit_ms),
    }))
    .observer(publisher.clone())
    .config(config)
    .build_with_sequence(sequence);

    print_table(&scheduler, &[]);
    scheduler.run_all()?;

    if let Some(delay) = cli.abort_after_ms {
        thread::sleep(Duration::from_millis(delay));
        info!(disposition = ?scheduler.abort(), "Abort requested from command line");
    }

    let report = scheduler
        .join()
        .context("round ended without a report")?;

    let mut status_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SchedulerEvent::StatusChanged { .. }) {
            status_events += 1;
        }
    }

    println!();
    let statuses: Vec<String> = report.statuses.iter().map(ToString::to_string).collect();
    print_table(&scheduler, &statuses);
    println!();
    println!(
        "round {} ended: {} ({} status notifications)",
        report.round,
        serde_json::to_string(&report.outcome)?,
        status_events
    );
    Ok(())
}
