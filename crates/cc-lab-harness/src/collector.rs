//! Per-run metrics artifacts.
//!
//! Every invocation writes into its own `logs-N` directory. Artifacts are
//! never rewritten; a repeated run gets a fresh epoch in its file name and
//! the most recent one is copied to the canonical results path.

use cc_lab_abstract::{LayoutConfig, Measurement, MetricSample};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::sequence::SequenceAllocator;

pub const CSV_HEADER: &str = "timestamp,throughput,loss_rate,rtt";

/// A measurement together with the time it was taken, relative to the start
/// of the supervised phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub elapsed: Duration,
    pub measurement: Measurement,
}

impl Observation {
    pub fn new(elapsed: Duration, measurement: Measurement) -> Self {
        Self {
            elapsed,
            measurement,
        }
    }
}

/// Turn irregular observations into exactly one sample per elapsed second.
///
/// Second `s` takes the last observation made during `[s, s+1)`; seconds
/// without one repeat the previous value, and start at zero.
pub fn samples_per_second(duration_secs: u64, observations: &[Observation]) -> Vec<MetricSample> {
    let mut buckets: Vec<Option<Measurement>> = vec![None; duration_secs as usize];
    for obs in observations {
        let second = obs.elapsed.as_secs();
        if let Some(slot) = buckets.get_mut(second as usize) {
            *slot = Some(obs.measurement);
        }
    }

    let mut current = Measurement::default();
    buckets
        .into_iter()
        .enumerate()
        .map(|(second, bucket)| {
            if let Some(m) = bucket {
                current = m;
            }
            MetricSample::at(second as u64, current)
        })
        .collect()
}

/// The persisted series of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLog {
    pub scheme: String,
    pub profile: String,
    pub samples: Vec<MetricSample>,
}

impl RunLog {
    pub fn from_observations(
        scheme: impl Into<String>,
        profile: impl Into<String>,
        duration_secs: u64,
        observations: &[Observation],
    ) -> Self {
        Self {
            scheme: scheme.into(),
            profile: profile.into(),
            samples: samples_per_second(duration_secs, observations),
        }
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::with_capacity(32 * (self.samples.len() + 1));
        out.push_str(CSV_HEADER);
        out.push('\n');
        for s in &self.samples {
            let _ = writeln!(
                out,
                "{},{:.2},{:.3},{:.2}",
                s.timestamp, s.throughput, s.loss_rate, s.rtt
            );
        }
        out
    }

    /// Parse an artifact written by [`to_csv`](Self::to_csv). The tag is not
    /// stored in the file and has to be supplied.
    pub fn from_csv(
        scheme: impl Into<String>,
        profile: impl Into<String>,
        path: &Path,
        text: &str,
    ) -> Result<Self> {
        let malformed = |line: usize, reason: String| HarnessError::MalformedArtifact {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let mut lines = text.lines().enumerate();
        match lines.next() {
            Some((_, header)) if header.trim() == CSV_HEADER => {}
            Some((_, header)) => {
                return Err(malformed(1, format!("unexpected header '{}'", header.trim())));
            }
            None => return Err(malformed(1, "empty file".to_string())),
        }

        let mut samples = Vec::new();
        for (idx, line) in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [timestamp, throughput, loss_rate, rtt] = fields[..] else {
                return Err(malformed(idx + 1, format!("expected 4 fields, got {}", fields.len())));
            };
            let number = |name: &str, value: &str| -> Result<f64> {
                value
                    .parse()
                    .map_err(|e| malformed(idx + 1, format!("bad {name} '{value}': {e}")))
            };
            samples.push(MetricSample {
                timestamp: timestamp
                    .parse()
                    .map_err(|e| malformed(idx + 1, format!("bad timestamp '{timestamp}': {e}")))?,
                throughput: number("throughput", throughput)?,
                loss_rate: number("loss_rate", loss_rate)?,
                rtt: number("rtt", rtt)?,
            });
        }

        Ok(Self {
            scheme: scheme.into(),
            profile: profile.into(),
            samples,
        })
    }

    pub fn load(scheme: &str, profile: &str, path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HarnessError::MissingArtifact {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(HarnessError::io(path, e)),
        };
        Self::from_csv(scheme, profile, path, &text)
    }
}

/// A run log and where it was written.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub log: RunLog,
    pub path: PathBuf,
}

/// Writes run logs for one harness invocation.
pub struct MetricsCollector {
    allocator: SequenceAllocator,
    logs_dir: Option<PathBuf>,
}

impl MetricsCollector {
    pub fn new(layout: &LayoutConfig) -> Self {
        Self {
            allocator: SequenceAllocator::new(&layout.root, &layout.logs_prefix),
            logs_dir: None,
        }
    }

    /// The `logs-N` directory of this invocation, created on first use.
    pub fn logs_dir(&mut self) -> Result<&Path> {
        let dir = match self.logs_dir.take() {
            Some(dir) => dir,
            None => {
                let dir = self.allocator.allocate()?;
                info!("Writing run logs to {}", dir.display());
                dir
            }
        };
        Ok(self.logs_dir.insert(dir).as_path())
    }

    /// Build one sample per elapsed second of `duration_secs` and persist the
    /// result as `metrics_<scheme>_<epoch>.csv`.
    pub fn record(
        &mut self,
        scheme: &str,
        profile: &str,
        duration_secs: u64,
        observations: &[Observation],
    ) -> Result<RecordedRun> {
        let log = RunLog::from_observations(scheme, profile, duration_secs, observations);
        let dir = self.logs_dir()?.to_path_buf();

        let mut epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = loop {
            let candidate = dir.join(artifact_name(scheme, epoch));
            if !candidate.exists() {
                break candidate;
            }
            epoch += 1;
        };

        fs::write(&path, log.to_csv()).map_err(|e| HarnessError::io(&path, e))?;
        info!(
            "Recorded {} samples for {} on profile {} -> {}",
            log.samples.len(),
            scheme,
            profile,
            path.display()
        );
        Ok(RecordedRun { log, path })
    }
}

fn artifact_name(scheme: &str, epoch: u64) -> String {
    format!("metrics_{scheme}_{epoch}.csv")
}

fn artifact_epoch(file_name: &str, scheme: &str) -> Option<u64> {
    file_name
        .strip_prefix("metrics_")?
        .strip_prefix(scheme)?
        .strip_prefix('_')?
        .strip_suffix(".csv")?
        .parse()
        .ok()
}

/// Most recent artifact of `scheme` in `dir`, by modification time (ties go
/// to the larger epoch).
pub fn latest_artifact(dir: &Path, scheme: &str) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(HarnessError::io(dir, e)),
    };

    let mut best: Option<((SystemTime, u64), PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| HarnessError::io(dir, e))?;
        let Some(epoch) = entry
            .file_name()
            .to_str()
            .and_then(|name| artifact_epoch(name, scheme))
        else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map_err(|e| HarnessError::io(entry.path(), e))?;
        let key = (modified, epoch);
        if best.as_ref().is_none_or(|(k, _)| key > *k) {
            best = Some((key, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// Copy the newest artifact of `scheme` from the latest `logs-N` directory to
/// `results/profile_<id>/<scheme>/<scheme>_log.csv`.
pub fn promote_latest(layout: &LayoutConfig, profile: &str, scheme: &str) -> Result<PathBuf> {
    let logs = SequenceAllocator::new(&layout.root, &layout.logs_prefix);
    let missing = |path: PathBuf| HarnessError::MissingArtifact { path };
    let dir = logs
        .latest()?
        .ok_or_else(|| missing(layout.root.join(format!("{}-*", layout.logs_prefix))))?;
    let source = latest_artifact(&dir, scheme)?
        .ok_or_else(|| missing(dir.join(format!("metrics_{scheme}_*.csv"))))?;

    let target = layout.canonical_artifact(profile, scheme);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| HarnessError::io(parent, e))?;
    }
    fs::copy(&source, &target).map_err(|e| HarnessError::io(&target, e))?;
    debug!("Promoted {} -> {}", source.display(), target.display());
    info!("Saved {} results to {}", scheme, target.display());
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(throughput: f64, rtt: f64) -> Measurement {
        Measurement {
            throughput,
            loss_rate: 0.0,
            rtt,
        }
    }

    #[test]
    fn test_one_sample_per_second_without_gaps() {
        let obs = vec![
            Observation::new(Duration::from_millis(10), m(1.0, 10.0)),
            Observation::new(Duration::from_millis(1200), m(2.0, 20.0)),
            Observation::new(Duration::from_millis(1900), m(3.0, 30.0)),
            Observation::new(Duration::from_millis(4100), m(5.0, 50.0)),
            Observation::new(Duration::from_secs(9), m(9.0, 90.0)),
        ];
        let samples = samples_per_second(5, &obs);
        let stamps: Vec<u64> = samples.iter().map(|s| s.timestamp).collect();
        let rtts: Vec<f64> = samples.iter().map(|s| s.rtt).collect();
        assert_eq!(stamps, vec![0, 1, 2, 3, 4]);
        assert_eq!(rtts, vec![10.0, 30.0, 30.0, 30.0, 50.0]);
    }

    #[test]
    fn test_leading_seconds_without_observation_are_zero() {
        let obs = vec![Observation::new(Duration::from_secs(2), m(4.0, 40.0))];
        let samples = samples_per_second(3, &obs);
        assert_eq!(samples[0].rtt, 0.0);
        assert_eq!(samples[1].throughput, 0.0);
        assert_eq!(samples[2].rtt, 40.0);
        assert!(samples_per_second(0, &obs).is_empty());
    }

    #[test]
    fn test_csv_format_and_parse() {
        let log = RunLog {
            scheme: "cubic".to_string(),
            profile: "1".to_string(),
            samples: vec![MetricSample {
                timestamp: 0,
                throughput: 12.346,
                loss_rate: 0.01234,
                rtt: 48.129,
            }],
        };
        let csv = log.to_csv();
        assert_eq!(csv, "timestamp,throughput,loss_rate,rtt\n0,12.35,0.012,48.13\n");

        let parsed = RunLog::from_csv("cubic", "1", Path::new("x.csv"), &csv).unwrap();
        assert_eq!(parsed.samples[0].rtt, 48.13);
        assert_eq!(parsed.scheme, "cubic");
    }

    #[test]
    fn test_malformed_csv_reports_line() {
        let bad = "timestamp,throughput,loss_rate,rtt\n0,1,0,2\n1,abc,0,2\n";
        let err = RunLog::from_csv("bbr", "2", Path::new("bad.csv"), bad).unwrap_err();
        assert!(matches!(err, HarnessError::MalformedArtifact { line: 3, .. }));

        let err = RunLog::from_csv("bbr", "2", Path::new("bad.csv"), "a,b\n").unwrap_err();
        assert!(matches!(err, HarnessError::MalformedArtifact { line: 1, .. }));
    }

    #[test]
    fn test_record_writes_into_single_logs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LayoutConfig::rooted_at(dir.path());
        let mut collector = MetricsCollector::new(&layout);

        let obs = vec![Observation::new(Duration::ZERO, m(1.0, 10.0))];
        let first = collector.record("vegas", "1", 4, &obs).unwrap();
        let second = collector.record("vegas", "1", 4, &obs).unwrap();

        assert_ne!(first.path, second.path);
        assert_eq!(first.path.parent(), Some(dir.path().join("logs-1").as_path()));
        assert_eq!(second.path.parent(), first.path.parent());
        assert_eq!(first.log.samples.len(), 4);

        let loaded = RunLog::load("vegas", "1", &first.path).unwrap();
        assert_eq!(loaded.samples.len(), 4);
        assert!(!dir.path().join("logs-2").exists());
    }

    #[test]
    fn test_latest_artifact_matches_scheme_exactly() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("metrics_bbr_100.csv"), CSV_HEADER).unwrap();
        fs::write(dir.path().join("metrics_bbr_x_200.csv"), CSV_HEADER).unwrap();
        fs::write(dir.path().join("metrics_cubic_300.csv"), CSV_HEADER).unwrap();

        assert_eq!(
            latest_artifact(dir.path(), "bbr").unwrap(),
            Some(dir.path().join("metrics_bbr_100.csv"))
        );
        assert_eq!(latest_artifact(dir.path(), "vegas").unwrap(), None);
    }

    #[test]
    fn test_promote_copies_newest_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LayoutConfig::rooted_at(dir.path());
        assert!(matches!(
            promote_latest(&layout, "1", "cubic"),
            Err(HarnessError::MissingArtifact { .. })
        ));

        let mut collector = MetricsCollector::new(&layout);
        let obs = vec![Observation::new(Duration::ZERO, m(7.0, 70.0))];
        collector.record("cubic", "1", 2, &obs).unwrap();

        let target = promote_latest(&layout, "1", "cubic").unwrap();
        assert_eq!(target, dir.path().join("results/profile_1/cubic/cubic_log.csv"));
        let log = RunLog::load("cubic", "1", &target).unwrap();
        assert_eq!(log.samples.len(), 2);
        assert_eq!(log.samples[1].rtt, 70.0);
    }
}
