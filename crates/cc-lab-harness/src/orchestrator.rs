//! Drives a single (scheme, profile) run through its state machine.
//!
//! `Init -> RoleDetermined -> FirstStarted -> SecondStarted -> Running ->
//! {Completed | Crashed} -> CleanedUp`. Every path, including errors, ends in
//! `CleanedUp` with both process groups terminated.

use cc_lab_abstract::{HarnessConfig, Profile, Role, RunConfig, Scheme};
use cc_lab_loader::{RolePlan, SchemeWrapper, WrapperLoader};
use serde::Serialize;
use std::fmt;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::collector::{MetricsCollector, Observation, RecordedRun};
use crate::error::{HarnessError, Result};
use crate::probe::{MeasurementSource, SocketStatsProbe};
use crate::process::ProcessGroup;
use crate::sweep::{NoopSweeper, ProcessSweeper, Sweeper};

/// Time the first process gets to come up before its peer is started.
pub const WARMUP: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    RoleDetermined,
    FirstStarted,
    SecondStarted,
    Running,
    Completed,
    Crashed,
    CleanedUp,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Build a measurement source for the connection on the given port.
pub type ProbeFactory = Box<dyn Fn(u16) -> Box<dyn MeasurementSource>>;

#[derive(Debug)]
pub enum RunOutcome {
    Completed(RecordedRun),
    Crashed { role: Role, status: ExitStatus },
}

#[derive(Debug)]
pub struct RunReport {
    pub scheme: String,
    pub profile: String,
    pub history: Vec<RunState>,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed(_))
    }

    /// Path of the written artifact, or a [`HarnessError::RunCrashed`].
    pub fn into_result(self) -> Result<PathBuf> {
        match self.outcome {
            RunOutcome::Completed(recorded) => Ok(recorded.path),
            RunOutcome::Crashed { role, status } => Err(HarnessError::RunCrashed {
                scheme: self.scheme,
                role,
                status,
            }),
        }
    }
}

struct History {
    label: String,
    states: Vec<RunState>,
}

impl History {
    fn new(scheme: &Scheme, profile: &Profile) -> Self {
        Self {
            label: format!("{} on {}", scheme, profile),
            states: vec![RunState::Init],
        }
    }

    fn enter(&mut self, state: RunState) {
        if let Some(previous) = self.states.last() {
            debug!("{}: {} -> {}", self.label, previous, state);
        }
        self.states.push(state);
    }
}

/// The two process groups of a run. Dropping it terminates both.
#[derive(Default)]
struct Processes {
    first: Option<ProcessGroup>,
    second: Option<ProcessGroup>,
}

impl Processes {
    fn terminate(&mut self, grace: Duration) {
        for group in [&mut self.second, &mut self.first].into_iter().flatten() {
            group.terminate(grace);
        }
    }
}

/// Observes a measurement source on its own thread, so a stalled
/// observation never holds up crash detection or the deadline.
struct Sampler {
    stop: Arc<AtomicBool>,
    observations: Receiver<Observation>,
}

impl Sampler {
    fn start(
        mut source: Box<dyn MeasurementSource>,
        started: Instant,
        interval: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, observations) = mpsc::channel();
        let stopped = Arc::clone(&stop);
        thread::Builder::new()
            .name("cc-lab-sampler".to_string())
            .spawn(move || {
                while !stopped.load(Ordering::Relaxed) {
                    // The receiver is gone once supervision has ended.
                    if let Some(measurement) = source.observe()
                        && tx
                            .send(Observation::new(started.elapsed(), measurement))
                            .is_err()
                    {
                        break;
                    }
                    thread::sleep(interval);
                }
            })
            .map_err(|source| HarnessError::Spawn {
                program: "sampler thread".to_string(),
                source,
            })?;
        Ok(Self { stop, observations })
    }

    fn drain_into(&self, observations: &mut Vec<Observation>) {
        observations.extend(self.observations.try_iter());
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

enum Supervised {
    Completed(Vec<Observation>),
    Crashed { role: Role, status: ExitStatus },
}

/// Bind an ephemeral port on the loopback interface and release it for the
/// first process to take.
pub fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(HarnessError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(HarnessError::PortAllocation)?
        .port();
    Ok(port)
}

pub struct Orchestrator {
    run: RunConfig,
    loader: WrapperLoader,
    collector: MetricsCollector,
    sweeper: Box<dyn Sweeper>,
    probe: ProbeFactory,
    last_history: Vec<RunState>,
}

impl Orchestrator {
    pub fn new(config: &HarnessConfig) -> Self {
        let sweeper: Box<dyn Sweeper> = match &config.sweep {
            Some(sweep) => Box::new(ProcessSweeper::new(&sweep.marker)),
            None => Box::new(NoopSweeper),
        };
        Self {
            run: config.run.clone(),
            loader: WrapperLoader::from_config(config),
            collector: MetricsCollector::new(&config.layout),
            sweeper,
            probe: Box::new(|port: u16| -> Box<dyn MeasurementSource> {
                Box::new(SocketStatsProbe::new(port))
            }),
            last_history: Vec::new(),
        }
    }

    pub fn with_probe(mut self, probe: ProbeFactory) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_sweeper(mut self, sweeper: Box<dyn Sweeper>) -> Self {
        self.sweeper = sweeper;
        self
    }

    /// States the most recent run went through, including one that ended in
    /// `Err`.
    pub fn last_history(&self) -> &[RunState] {
        &self.last_history
    }

    /// Execute one run. A crash is a normal outcome; `Err` means the run
    /// could not be carried out at all, after cleanup and a global sweep.
    pub fn run(&mut self, scheme: &Scheme, profile: &Profile) -> Result<RunReport> {
        let mut history = History::new(scheme, profile);
        let mut processes = Processes::default();

        let supervised = self.drive(scheme, &mut history, &mut processes);

        processes.terminate(self.run.kill_grace());
        let supervised = match supervised {
            Ok(supervised) => supervised,
            Err(e) => {
                history.enter(RunState::CleanedUp);
                error!("{}: {}", history.label, e);
                self.sweeper.sweep();
                self.last_history = history.states;
                return Err(e);
            }
        };
        history.enter(RunState::CleanedUp);
        self.last_history = history.states.clone();

        let outcome = match supervised {
            Supervised::Completed(observations) => {
                let recorded = self
                    .collector
                    .record(&scheme.name, &profile.id, self.run.duration_secs, &observations)
                    .inspect_err(|_| self.sweeper.sweep())?;
                info!("{}: completed", history.label);
                RunOutcome::Completed(recorded)
            }
            Supervised::Crashed { role, status } => {
                error!("{}: {} exited with {}", history.label, role, status);
                RunOutcome::Crashed { role, status }
            }
        };

        Ok(RunReport {
            scheme: scheme.name.clone(),
            profile: profile.id.clone(),
            history: history.states,
            outcome,
        })
    }

    fn drive(
        &self,
        scheme: &Scheme,
        history: &mut History,
        processes: &mut Processes,
    ) -> Result<Supervised> {
        let wrapper = self.loader.load(scheme)?;
        let plan = wrapper.negotiate_roles()?;
        history.enter(RunState::RoleDetermined);
        info!("{}: {} starts first", history.label, plan.first);

        let port = allocate_port()?;
        debug!("{}: using port {}", history.label, port);
        processes.first = Some(ProcessGroup::spawn(
            format!("{} {}", scheme, plan.first),
            wrapper.first_command(plan.first, port),
        )?);
        history.enter(RunState::FirstStarted);

        thread::sleep(WARMUP);

        processes.second = Some(ProcessGroup::spawn(
            format!("{} {}", scheme, plan.second),
            wrapper.second_command(plan.second, &self.run.peer_host, port),
        )?);
        history.enter(RunState::SecondStarted);

        history.enter(RunState::Running);
        let supervised = self.supervise(&wrapper, plan, port, processes)?;
        history.enter(match supervised {
            Supervised::Completed(_) => RunState::Completed,
            Supervised::Crashed { .. } => RunState::Crashed,
        });
        Ok(supervised)
    }

    /// Poll both groups every tick until one exits non-zero or the deadline
    /// passes. A zero exit is not a crash. Measurements arrive from the
    /// sampler thread; the deadline holds however long they take.
    fn supervise(
        &self,
        wrapper: &SchemeWrapper,
        plan: RolePlan,
        port: u16,
        processes: &mut Processes,
    ) -> Result<Supervised> {
        let mut observations = Vec::with_capacity(self.run.duration_secs as usize);
        let started = Instant::now();
        let deadline = started + self.run.duration();
        let sampler = Sampler::start((self.probe)(port), started, self.run.poll_interval())?;

        loop {
            sampler.drain_into(&mut observations);

            let groups = [
                (plan.first, processes.first.as_mut()),
                (plan.second, processes.second.as_mut()),
            ];
            for (role, group) in groups {
                let Some(group) = group else { continue };
                if let Some(status) = group.try_exit_status()?
                    && !status.success()
                {
                    debug!(
                        "{} (group {}) exited with {}",
                        group.label(),
                        group.pgid(),
                        status
                    );
                    return Ok(Supervised::Crashed { role, status });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("{}: duration reached", wrapper.scheme());
                return Ok(Supervised::Completed(observations));
            }
            thread::sleep(self.run.poll_interval().min(deadline - now));
        }
    }
}
