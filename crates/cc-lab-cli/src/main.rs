use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use cc_lab_abstract::{HarnessConfig, RunConfigOverride, SchemeSelection};
use cc_lab_harness::matrix::EntryStatus;
use cc_lab_harness::trace::{extend_trace_file, generate_trace_file};
use cc_lab_harness::{
    EmulatorLauncher, InProcessLauncher, MatrixRunner, Orchestrator, ProcessSweeper,
    ResultAggregator, RunOutcome, Sweeper,
};
use cc_lab_loader::spec::{parse_scheme_list, scheme_by_name, select_schemes};

#[derive(Parser, Debug)]
#[command(author, version, about = "Congestion-control comparison harness")]
struct Cli {
    /// Harness configuration (TOML). Built-in defaults are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheme x profile matrix.
    Run(RunArgs),

    /// Execute a single run in this process (used inside the emulator).
    RunScheme {
        #[arg(long)]
        scheme: String,
        #[arg(long)]
        profile: String,
        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Create or loop link traces.
    #[command(subcommand)]
    Trace(TraceCommand),

    /// Summarize the canonical results of every scheme and profile.
    Aggregate {
        /// Space-separated subset of schemes; all schemes when omitted.
        #[arg(long)]
        schemes: Option<String>,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct SelectionArgs {
    /// Run every known scheme.
    #[arg(long)]
    all: bool,

    /// Space-separated list, e.g. "cubic bbr".
    #[arg(long)]
    schemes: Option<String>,
}

impl SelectionArgs {
    fn selection(&self) -> SchemeSelection {
        match &self.schemes {
            Some(list) if !self.all => SchemeSelection::Named(parse_scheme_list(list)),
            _ => SchemeSelection::All,
        }
    }
}

#[derive(Args, Debug, Default)]
struct OverrideArgs {
    /// Run duration in seconds.
    #[arg(long)]
    duration: Option<u64>,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Pause between runs, in seconds.
    #[arg(long)]
    cooldown: Option<u64>,
    #[arg(long)]
    peer_host: Option<String>,
    /// Grace period between SIGTERM and SIGKILL, in milliseconds.
    #[arg(long)]
    kill_grace_ms: Option<u64>,
}

impl OverrideArgs {
    fn to_override(&self) -> RunConfigOverride {
        RunConfigOverride {
            duration_secs: self.duration,
            poll_interval_ms: self.poll_interval_ms,
            cooldown_secs: self.cooldown,
            peer_host: self.peer_host.clone(),
            kill_grace_ms: self.kill_grace_ms,
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    #[command(flatten)]
    overrides: OverrideArgs,

    /// Run directly on this host instead of under mm-delay/mm-link.
    #[arg(long, default_value_t = false)]
    no_emulator: bool,

    /// Write a JSON report of every run's status.
    #[arg(long)]
    report_out: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum TraceCommand {
    /// Spread a list of packet sizes uniformly over a duration.
    Generate {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Total trace length in seconds.
        #[arg(long, default_value_t = 60.0)]
        duration: f64,
    },

    /// Loop traces so they outlast a run.
    Extend {
        /// Source traces; each is written under the same name in --output-dir.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long, default_value_t = 23)]
        repeat: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt::init();

    match &cli.command {
        Command::Run(args) => run_matrix(cli.config.as_deref(), args),
        Command::RunScheme {
            scheme,
            profile,
            overrides,
        } => run_single(cli.config.as_deref(), scheme, profile, overrides),
        Command::Trace(trace) => run_trace(trace),
        Command::Aggregate { schemes } => aggregate(cli.config.as_deref(), schemes.as_deref()),
    }
}

fn load_config(path: Option<&Path>, overrides: &OverrideArgs) -> Result<HarnessConfig> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let mut config: HarnessConfig =
                toml::from_str(&content).context("Failed to parse config file")?;
            if let Some(base) = path.parent() {
                config.rebase(base);
            }
            config
        }
        None => HarnessConfig::default(),
    };
    overrides.to_override().apply_to(&mut config.run);
    config.validate().context("Invalid harness configuration")?;
    Ok(config)
}

fn sweep(config: &HarnessConfig) {
    if let Some(sweep) = &config.sweep {
        ProcessSweeper::new(&sweep.marker).sweep();
    }
}

fn run_matrix(config_path: Option<&Path>, args: &RunArgs) -> Result<()> {
    let config = load_config(config_path, &args.overrides)?;
    let schemes = select_schemes(&config, &args.selection.selection())?;
    info!(
        "Running {} scheme(s) across {} profile(s)",
        schemes.len(),
        config.profiles.len()
    );

    let result = match (&config.emulator, args.no_emulator) {
        (Some(emulator), false) => {
            let program = std::env::current_exe().context("Failed to locate harness binary")?;
            let mut launcher = EmulatorLauncher::new(emulator.clone(), program);
            if let Some(path) = config_path {
                let path = fs::canonicalize(path)
                    .with_context(|| format!("Failed to resolve {}", path.display()))?;
                launcher = launcher.config_path(path);
            }
            launcher = launcher.overrides(args.overrides.to_override());
            MatrixRunner::new(&config, launcher).run(&schemes)
        }
        _ => {
            let launcher = InProcessLauncher::new(Orchestrator::new(&config));
            MatrixRunner::new(&config, launcher).run(&schemes)
        }
    };

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            sweep(&config);
            return Err(e).context("Experiment matrix aborted");
        }
    };

    for entry in report.failed() {
        if let EntryStatus::Failed { reason } = &entry.status {
            warn!("{} on profile {} failed: {}", entry.scheme, entry.profile, reason);
        }
    }
    info!(
        "{}/{} runs completed",
        report.completed(),
        report.entries.len()
    );

    if let Some(path) = &args.report_out {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!("Report written to {}", path.display());
    }
    Ok(())
}

fn run_single(
    config_path: Option<&Path>,
    scheme: &str,
    profile: &str,
    overrides: &OverrideArgs,
) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    let scheme = scheme_by_name(&config, scheme)?.clone();
    let Some(profile) = config.profile(profile).cloned() else {
        bail!("Unknown profile '{}'", profile);
    };

    let report = Orchestrator::new(&config)
        .run(&scheme, &profile)
        .with_context(|| format!("Run of {} on {} failed", scheme, profile))?;
    if let RunOutcome::Completed(recorded) = &report.outcome {
        info!("Metrics written to {}", recorded.path.display());
    }
    report.into_result()?;
    Ok(())
}

fn run_trace(command: &TraceCommand) -> Result<()> {
    match command {
        TraceCommand::Generate {
            input,
            output,
            duration,
        } => {
            generate_trace_file(input, output, *duration)
                .with_context(|| format!("Failed to generate trace from {}", input.display()))?;
            Ok(())
        }
        TraceCommand::Extend {
            inputs,
            output_dir,
            repeat,
        } => {
            fs::create_dir_all(output_dir)
                .with_context(|| format!("Failed to create {}", output_dir.display()))?;
            let mut failed = 0;
            for input in inputs {
                let Some(name) = input.file_name() else {
                    error!("Not a file: {}", input.display());
                    failed += 1;
                    continue;
                };
                if let Err(e) = extend_trace_file(input, &output_dir.join(name), *repeat) {
                    error!("Failed to extend {}: {}", input.display(), e);
                    failed += 1;
                }
            }
            if failed > 0 {
                bail!("{} of {} trace(s) could not be extended", failed, inputs.len());
            }
            Ok(())
        }
    }
}

fn aggregate(config_path: Option<&Path>, schemes: Option<&str>) -> Result<()> {
    let config = load_config(config_path, &OverrideArgs::default())?;
    let selection = match schemes {
        Some(list) => SchemeSelection::Named(parse_scheme_list(list)),
        None => SchemeSelection::All,
    };
    let schemes = select_schemes(&config, &selection)?;

    let aggregator = ResultAggregator::new(config.layout.clone());
    let dataset = aggregator.load(&schemes, &config.profiles);
    if let Some(dir) = aggregator.write_outputs(&dataset)? {
        info!("Aggregated outputs saved to {}", dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_all_and_schemes_are_exclusive() {
        assert!(Cli::try_parse_from(["cc-lab", "run", "--all", "--schemes", "cubic"]).is_err());
        assert!(Cli::try_parse_from(["cc-lab", "run"]).is_err());

        let cli = Cli::try_parse_from(["cc-lab", "run", "--schemes", "cubic bbr"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(
            args.selection.selection(),
            SchemeSelection::Named(vec!["cubic".to_string(), "bbr".to_string()])
        );
    }

    #[test]
    fn test_trace_extend_defaults_to_23_repeats() {
        let cli = Cli::try_parse_from([
            "cc-lab",
            "trace",
            "extend",
            "a.up",
            "b.down",
            "--output-dir",
            "out",
        ])
        .unwrap();
        let Command::Trace(TraceCommand::Extend { inputs, repeat, .. }) = cli.command else {
            panic!("expected trace extend");
        };
        assert_eq!(repeat, 23);
        assert_eq!(inputs.len(), 2);
    }

    #[test]
    fn test_run_scheme_accepts_every_forwarded_override() {
        let cli = Cli::try_parse_from([
            "cc-lab",
            "run-scheme",
            "--scheme",
            "cubic",
            "--profile",
            "1",
            "--duration",
            "10",
            "--poll-interval-ms",
            "250",
            "--cooldown",
            "1",
            "--kill-grace-ms",
            "300",
            "--peer-host",
            "10.0.0.1",
        ])
        .unwrap();
        let Command::RunScheme { overrides, .. } = cli.command else {
            panic!("expected run-scheme");
        };
        let overrides = overrides.to_override();
        assert_eq!(overrides.duration_secs, Some(10));
        assert_eq!(overrides.poll_interval_ms, Some(250));
        assert_eq!(overrides.cooldown_secs, Some(1));
        assert_eq!(overrides.kill_grace_ms, Some(300));
        assert_eq!(overrides.peer_host.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_load_config_rebases_and_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.toml");
        fs::write(
            &path,
            r#"
            wrapper_dir = "wrappers"

            [[schemes]]
            name = "cubic"

            [[profiles]]
            id = "1"
            delay_ms = 5
            uplink = "traces/a.up"
            downlink = "traces/a.down"
            "#,
        )
        .unwrap();

        let overrides = OverrideArgs {
            duration: Some(10),
            ..Default::default()
        };
        let config = load_config(Some(path.as_path()), &overrides).unwrap();
        assert_eq!(config.run.duration_secs, 10);
        assert_eq!(config.wrapper_dir, dir.path().join("wrappers"));
        assert_eq!(config.profiles[0].uplink, dir.path().join("traces/a.up"));
    }

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.toml");
        fs::write(&path, "schemes = []\n").unwrap();
        assert!(load_config(Some(path.as_path()), &OverrideArgs::default()).is_err());
        let missing = dir.path().join("missing.toml");
        assert!(load_config(Some(missing.as_path()), &OverrideArgs::default()).is_err());
    }
}
