//! Serial execution of the full (profile x scheme) matrix.

use cc_lab_abstract::{
    EmulatorConfig, HarnessConfig, LayoutConfig, Profile, RunConfigOverride, Scheme,
};
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::collector::promote_latest;
use crate::error::{HarnessError, Result};
use crate::orchestrator::{Orchestrator, RunOutcome};
use crate::process::ProcessGroup;

/// Name of the inner command the emulated launch re-invokes.
pub const RUN_SCHEME_COMMAND: &str = "run-scheme";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStatus {
    Completed,
    Failed(String),
}

/// Carries out one run of the matrix.
pub trait RunLauncher {
    /// `result_dir` exists when this is called. Errors abort the matrix only
    /// when they are environmental.
    fn launch(&mut self, scheme: &Scheme, profile: &Profile, result_dir: &Path)
    -> Result<LaunchStatus>;
}

/// Runs the orchestrator directly in this process, without link emulation.
pub struct InProcessLauncher {
    orchestrator: Orchestrator,
}

impl InProcessLauncher {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

impl RunLauncher for InProcessLauncher {
    fn launch(
        &mut self,
        scheme: &Scheme,
        profile: &Profile,
        _result_dir: &Path,
    ) -> Result<LaunchStatus> {
        let report = self.orchestrator.run(scheme, profile)?;
        Ok(match report.outcome {
            RunOutcome::Completed(_) => LaunchStatus::Completed,
            RunOutcome::Crashed { role, status } => {
                LaunchStatus::Failed(format!("{role} exited with {status}"))
            }
        })
    }
}

/// Runs each combination inside `mm-delay <ms> mm-link <up> <down> --`,
/// re-invoking `program` with the inner `run-scheme` command. Output of the
/// whole emulated run goes to `<result_dir>/log.txt`.
pub struct EmulatorLauncher {
    emulator: EmulatorConfig,
    program: PathBuf,
    config_path: Option<PathBuf>,
    overrides: RunConfigOverride,
}

impl EmulatorLauncher {
    pub fn new(emulator: EmulatorConfig, program: impl Into<PathBuf>) -> Self {
        Self {
            emulator,
            program: program.into(),
            config_path: None,
            overrides: RunConfigOverride::default(),
        }
    }

    /// Configuration file the inner command should load.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Command-line overrides the inner command should apply again.
    pub fn overrides(mut self, overrides: RunConfigOverride) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn command(&self, scheme: &Scheme, profile: &Profile) -> Command {
        let mut command = Command::new(&self.emulator.delay_program);
        command
            .arg(profile.delay_ms.to_string())
            .arg(&self.emulator.link_program)
            .arg(&profile.uplink)
            .arg(&profile.downlink)
            .arg("--")
            .arg(&self.program)
            .arg(RUN_SCHEME_COMMAND)
            .args(["--scheme", &scheme.name, "--profile", &profile.id]);
        if let Some(config) = &self.config_path {
            command.arg("--config").arg(config);
        }
        let RunConfigOverride {
            duration_secs,
            poll_interval_ms,
            cooldown_secs,
            peer_host,
            kill_grace_ms,
        } = &self.overrides;
        let numeric = [
            ("--duration", duration_secs),
            ("--poll-interval-ms", poll_interval_ms),
            ("--cooldown", cooldown_secs),
            ("--kill-grace-ms", kill_grace_ms),
        ];
        for (flag, value) in numeric {
            if let Some(value) = value {
                command.arg(flag).arg(value.to_string());
            }
        }
        if let Some(host) = peer_host {
            command.arg("--peer-host").arg(host);
        }
        command
    }
}

impl RunLauncher for EmulatorLauncher {
    fn launch(
        &mut self,
        scheme: &Scheme,
        profile: &Profile,
        result_dir: &Path,
    ) -> Result<LaunchStatus> {
        let log_path = result_dir.join("log.txt");
        let log = File::create(&log_path).map_err(|e| HarnessError::io(&log_path, e))?;
        let log_err = log.try_clone().map_err(|e| HarnessError::io(&log_path, e))?;

        let mut command = self.command(scheme, profile);
        command.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));

        let mut group = ProcessGroup::spawn(format!("{scheme} emulated"), command)?;
        let status = group.wait()?;
        group.terminate(Duration::ZERO);

        if status.success() {
            Ok(LaunchStatus::Completed)
        } else {
            Ok(LaunchStatus::Failed(format!(
                "emulated run exited with {status}, see {}",
                log_path.display()
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    Completed { artifact: PathBuf },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatrixEntry {
    pub profile: String,
    pub scheme: String,
    #[serde(flatten)]
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatrixReport {
    pub entries: Vec<MatrixEntry>,
}

impl MatrixReport {
    pub fn completed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Completed { .. }))
            .count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &MatrixEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Failed { .. }))
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| HarnessError::io(path, std::io::Error::other(e)))?;
        fs::write(path, json).map_err(|e| HarnessError::io(path, e))
    }
}

pub struct MatrixRunner<L> {
    profiles: Vec<Profile>,
    layout: LayoutConfig,
    cooldown: Duration,
    launcher: L,
}

impl<L: RunLauncher> MatrixRunner<L> {
    pub fn new(config: &HarnessConfig, launcher: L) -> Self {
        Self {
            profiles: config.profiles.clone(),
            layout: config.layout.clone(),
            cooldown: config.run.cooldown(),
            launcher,
        }
    }

    /// Run every scheme against every profile, one at a time. A failed run is
    /// recorded and skipped; only environmental errors stop the matrix.
    pub fn run(&mut self, schemes: &[Scheme]) -> Result<MatrixReport> {
        let mut report = MatrixReport::default();
        let total = self.profiles.len() * schemes.len();

        for profile in &self.profiles {
            info!(
                "=== Profile {} | delay {} ms | RTT ~ {} ms ===",
                profile.id,
                profile.delay_ms,
                profile.base_rtt_ms()
            );

            for scheme in schemes {
                if !report.entries.is_empty() {
                    thread::sleep(self.cooldown);
                }
                info!("Running {} ({}/{})", scheme, report.entries.len() + 1, total);

                let result_dir = self.layout.result_dir(&profile.id, &scheme.name);
                fs::create_dir_all(&result_dir).map_err(|e| HarnessError::io(&result_dir, e))?;

                let status = match self.launcher.launch(scheme, profile, &result_dir) {
                    Ok(LaunchStatus::Completed) => {
                        match promote_latest(&self.layout, &profile.id, &scheme.name) {
                            Ok(artifact) => EntryStatus::Completed { artifact },
                            Err(e) => {
                                warn!("{} on {}: {}", scheme, profile, e);
                                EntryStatus::Failed {
                                    reason: e.to_string(),
                                }
                            }
                        }
                    }
                    Ok(LaunchStatus::Failed(reason)) => {
                        error!("{} failed on {}: {}", scheme, profile, reason);
                        EntryStatus::Failed { reason }
                    }
                    Err(e) if e.is_environmental() => {
                        error!("Aborting matrix: {}", e);
                        return Err(e);
                    }
                    Err(e) => {
                        error!("{} failed on {}: {}", scheme, profile, e);
                        EntryStatus::Failed {
                            reason: e.to_string(),
                        }
                    }
                };

                report.entries.push(MatrixEntry {
                    profile: profile.id.clone(),
                    scheme: scheme.name.clone(),
                    status,
                });
            }
        }

        info!(
            "Matrix finished: {}/{} runs completed",
            report.completed(),
            report.entries.len()
        );
        Ok(report)
    }
}
