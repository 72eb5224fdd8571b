//! Collects canonical run artifacts into one dataset and derives the RTT
//! summaries from it.

use cc_lab_abstract::{LayoutConfig, MetricSample, Profile, Scheme, SummaryRow};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::collector::RunLog;
use crate::error::{HarnessError, Result};
use crate::sequence::allocate_dir;
use crate::stats;

pub const SUMMARY_FILE: &str = "rtt_summary.csv";
pub const SCATTER_FILE: &str = "rtt_vs_throughput.csv";
pub const SCHEME_SUMMARY_FILE: &str = "scheme_rtt_summary.csv";
pub const DATASET_FILE: &str = "dataset.csv";

/// A (profile, scheme) pair that had no usable canonical artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRun {
    pub profile: String,
    pub scheme: String,
    pub path: PathBuf,
}

/// One row of the merged dataset. `time` is synthesized from the row's
/// position in its run, independent of the artifact's own timestamps.
#[derive(Debug, Clone, Copy)]
pub struct DatasetRow<'a> {
    pub profile: &'a str,
    pub scheme: &'a str,
    pub time: usize,
    pub sample: &'a MetricSample,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatedDataset {
    runs: Vec<RunLog>,
    missing: Vec<MissingRun>,
}

impl AggregatedDataset {
    pub fn runs(&self) -> &[RunLog] {
        &self.runs
    }

    pub fn missing(&self) -> &[MissingRun] {
        &self.missing
    }

    pub fn is_empty(&self) -> bool {
        self.runs.iter().all(|run| run.samples.is_empty())
    }

    pub fn contains(&self, profile: &str, scheme: &str) -> bool {
        self.runs
            .iter()
            .any(|run| run.profile == profile && run.scheme == scheme)
    }

    pub fn rows(&self) -> impl Iterator<Item = DatasetRow<'_>> {
        self.runs.iter().flat_map(|run| {
            run.samples.iter().enumerate().map(|(time, sample)| DatasetRow {
                profile: &run.profile,
                scheme: &run.scheme,
                time,
                sample,
            })
        })
    }
}

/// Mean RTT against mean throughput for one combination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputPoint {
    pub scheme: String,
    pub profile: String,
    pub avg_rtt: f64,
    pub avg_throughput: f64,
}

/// Per-scheme mean of the per-profile RTT statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemeSummary {
    pub scheme: String,
    pub avg_rtt: f64,
    pub p95_rtt: f64,
}

/// Group the dataset by (scheme, profile), keyed in sorted order.
fn group<'a>(
    dataset: &'a AggregatedDataset,
) -> BTreeMap<(&'a str, &'a str), Vec<&'a MetricSample>> {
    let mut groups: BTreeMap<(&str, &str), Vec<&MetricSample>> = BTreeMap::new();
    for row in dataset.rows() {
        groups
            .entry((row.scheme, row.profile))
            .or_default()
            .push(row.sample);
    }
    groups
}

/// Mean and 95th percentile of RTT per (scheme, profile) present.
pub fn summarize(dataset: &AggregatedDataset) -> Vec<SummaryRow> {
    group(dataset)
        .into_iter()
        .filter_map(|((scheme, profile), samples)| {
            let rtts: Vec<f64> = samples.iter().map(|s| s.rtt).collect();
            Some(SummaryRow {
                scheme: scheme.to_string(),
                profile: profile.to_string(),
                avg_rtt: stats::mean(&rtts)?,
                p95_rtt: stats::percentile(&rtts, 95.0)?,
            })
        })
        .collect()
}

pub fn rtt_vs_throughput(dataset: &AggregatedDataset) -> Vec<ThroughputPoint> {
    group(dataset)
        .into_iter()
        .filter_map(|((scheme, profile), samples)| {
            let rtts: Vec<f64> = samples.iter().map(|s| s.rtt).collect();
            let throughputs: Vec<f64> = samples.iter().map(|s| s.throughput).collect();
            Some(ThroughputPoint {
                scheme: scheme.to_string(),
                profile: profile.to_string(),
                avg_rtt: stats::mean(&rtts)?,
                avg_throughput: stats::mean(&throughputs)?,
            })
        })
        .collect()
}

pub fn summarize_by_scheme(summary: &[SummaryRow]) -> Vec<SchemeSummary> {
    let mut by_scheme: BTreeMap<&str, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for row in summary {
        let (avg, p95) = by_scheme.entry(row.scheme.as_str()).or_default();
        avg.push(row.avg_rtt);
        p95.push(row.p95_rtt);
    }
    by_scheme
        .into_iter()
        .filter_map(|(scheme, (avg, p95))| {
            Some(SchemeSummary {
                scheme: scheme.to_string(),
                avg_rtt: stats::mean(&avg)?,
                p95_rtt: stats::mean(&p95)?,
            })
        })
        .collect()
}

/// Render the summary the way it is printed after aggregation.
pub fn summary_table(summary: &[SummaryRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:<10} {:>12} {:>12}",
        "Scheme", "Profile", "Avg RTT", "95th RTT"
    );
    for row in summary {
        let _ = writeln!(
            out,
            "{:<10} {:<10} {:>12.2} {:>12.2}",
            row.scheme, row.profile, row.avg_rtt, row.p95_rtt
        );
    }
    out
}

fn write_csv(dir: &Path, name: &str, body: String) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, body).map_err(|e| HarnessError::io(&path, e))?;
    info!("Wrote {}", path.display());
    Ok(path)
}

pub struct ResultAggregator {
    layout: LayoutConfig,
}

impl ResultAggregator {
    pub fn new(layout: LayoutConfig) -> Self {
        Self { layout }
    }

    /// Read the canonical artifact of every (profile, scheme) pair. Missing
    /// or unreadable artifacts are reported and left out, never zero-filled.
    pub fn load(&self, schemes: &[Scheme], profiles: &[Profile]) -> AggregatedDataset {
        let mut dataset = AggregatedDataset::default();
        for profile in profiles {
            for scheme in schemes {
                let path = self.layout.canonical_artifact(&profile.id, &scheme.name);
                match RunLog::load(&scheme.name, &profile.id, &path) {
                    Ok(log) => dataset.runs.push(log),
                    Err(e) => {
                        match &e {
                            HarnessError::MissingArtifact { .. } => warn!(
                                "Missing results for {} on {}: {}",
                                scheme,
                                profile,
                                path.display()
                            ),
                            other => warn!("Skipping {} on {}: {}", scheme, profile, other),
                        }
                        dataset.missing.push(MissingRun {
                            profile: profile.id.clone(),
                            scheme: scheme.name.clone(),
                            path,
                        });
                    }
                }
            }
        }
        dataset
    }

    /// Write all derived tables into a fresh `graphs-N` directory and print
    /// the summary. Returns `None` without touching disk when there is
    /// nothing to aggregate.
    pub fn write_outputs(&self, dataset: &AggregatedDataset) -> Result<Option<PathBuf>> {
        if dataset.is_empty() {
            error!("No data collected, nothing to aggregate");
            return Ok(None);
        }

        let dir = allocate_dir(&self.layout.root, &self.layout.graphs_prefix)?;
        let summary = summarize(dataset);

        let mut body = String::from("Scheme,Profile,Avg RTT,95th RTT\n");
        for row in &summary {
            let _ = writeln!(
                body,
                "{},{},{},{}",
                row.scheme, row.profile, row.avg_rtt, row.p95_rtt
            );
        }
        write_csv(&dir, SUMMARY_FILE, body)?;

        let mut body = String::from("Scheme,Profile,Avg RTT,Avg Throughput\n");
        for point in rtt_vs_throughput(dataset) {
            let _ = writeln!(
                body,
                "{},{},{},{}",
                point.scheme, point.profile, point.avg_rtt, point.avg_throughput
            );
        }
        write_csv(&dir, SCATTER_FILE, body)?;

        let mut body = String::from("Scheme,Avg RTT,95th RTT\n");
        for row in summarize_by_scheme(&summary) {
            let _ = writeln!(body, "{},{},{}", row.scheme, row.avg_rtt, row.p95_rtt);
        }
        write_csv(&dir, SCHEME_SUMMARY_FILE, body)?;

        let mut body = String::from("scheme,profile,time,timestamp,throughput,loss_rate,rtt\n");
        for row in dataset.rows() {
            let s = row.sample;
            let _ = writeln!(
                body,
                "{},{},{},{},{},{},{}",
                row.scheme, row.profile, row.time, s.timestamp, s.throughput, s.loss_rate, s.rtt
            );
        }
        write_csv(&dir, DATASET_FILE, body)?;

        info!("RTT summary:\n{}", summary_table(&summary));
        Ok(Some(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CSV_HEADER;

    fn write_artifact(layout: &LayoutConfig, profile: &str, scheme: &str, rows: &[(f64, f64)]) {
        let path = layout.canonical_artifact(profile, scheme);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut body = format!("{CSV_HEADER}\n");
        for (i, (throughput, rtt)) in rows.iter().enumerate() {
            // Offset timestamps to show the time index is synthesized.
            body.push_str(&format!("{},{},0.000,{}\n", i + 100, throughput, rtt));
        }
        fs::write(path, body).unwrap();
    }

    fn matrix() -> (Vec<Scheme>, Vec<Profile>) {
        (
            ["cubic", "bbr"].into_iter().map(Scheme::new).collect(),
            vec![
                Profile::new("1", 5, "a.up", "a.down"),
                Profile::new("2", 200, "b.up", "b.down"),
            ],
        )
    }

    #[test]
    fn test_missing_pair_is_omitted_not_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LayoutConfig::rooted_at(dir.path());
        write_artifact(&layout, "1", "cubic", &[(10.0, 30.0), (12.0, 50.0)]);
        write_artifact(&layout, "1", "bbr", &[(20.0, 20.0)]);
        write_artifact(&layout, "2", "cubic", &[(5.0, 400.0)]);

        let (schemes, profiles) = matrix();
        let dataset = ResultAggregator::new(layout).load(&schemes, &profiles);

        assert_eq!(dataset.runs().len(), 3);
        assert!(!dataset.contains("2", "bbr"));
        assert_eq!(dataset.missing().len(), 1);
        assert_eq!(dataset.missing()[0].scheme, "bbr");

        let summary = summarize(&dataset);
        assert_eq!(summary.len(), 3);
        assert!(!summary.iter().any(|r| r.scheme == "bbr" && r.profile == "2"));
    }

    #[test]
    fn test_time_index_is_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LayoutConfig::rooted_at(dir.path());
        write_artifact(&layout, "1", "cubic", &[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)]);

        let dataset = ResultAggregator::new(layout)
            .load(&[Scheme::new("cubic")], &[Profile::new("1", 5, "u", "d")]);
        let times: Vec<usize> = dataset.rows().map(|r| r.time).collect();
        let stamps: Vec<u64> = dataset.rows().map(|r| r.sample.timestamp).collect();
        assert_eq!(times, vec![0, 1, 2]);
        assert_eq!(stamps, vec![100, 101, 102]);
    }

    #[test]
    fn test_summary_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LayoutConfig::rooted_at(dir.path());
        let rows: Vec<(f64, f64)> = (1..=20).map(|i| (2.0, i as f64)).collect();
        write_artifact(&layout, "1", "cubic", &rows);
        write_artifact(&layout, "2", "cubic", &[(4.0, 100.0)]);

        let (schemes, profiles) = matrix();
        let dataset = ResultAggregator::new(layout).load(&schemes, &profiles);
        let summary = summarize(&dataset);

        assert_eq!(summary[0].profile, "1");
        assert!((summary[0].avg_rtt - 10.5).abs() < 1e-9);
        assert!((summary[0].p95_rtt - 19.05).abs() < 1e-9);
        assert_eq!(summary[1].p95_rtt, 100.0);

        let by_scheme = summarize_by_scheme(&summary);
        assert_eq!(by_scheme.len(), 1);
        assert!((by_scheme[0].avg_rtt - 55.25).abs() < 1e-9);

        let points = rtt_vs_throughput(&dataset);
        assert_eq!(points[0].avg_throughput, 2.0);
    }

    #[test]
    fn test_malformed_artifact_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LayoutConfig::rooted_at(dir.path());
        let path = layout.canonical_artifact("1", "cubic");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "garbage\n1,2\n").unwrap();

        let dataset = ResultAggregator::new(layout)
            .load(&[Scheme::new("cubic")], &[Profile::new("1", 5, "u", "d")]);
        assert!(dataset.is_empty());
        assert_eq!(dataset.missing().len(), 1);
    }

    #[test]
    fn test_outputs_go_to_fresh_graphs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LayoutConfig::rooted_at(dir.path());
        write_artifact(&layout, "1", "bbr", &[(8.0, 40.0), (10.0, 60.0)]);

        let (schemes, profiles) = matrix();
        let aggregator = ResultAggregator::new(layout);
        let dataset = aggregator.load(&schemes, &profiles);

        let first = aggregator.write_outputs(&dataset).unwrap().unwrap();
        let second = aggregator.write_outputs(&dataset).unwrap().unwrap();
        assert_eq!(first, dir.path().join("graphs-1"));
        assert_eq!(second, dir.path().join("graphs-2"));

        let summary = fs::read_to_string(first.join(SUMMARY_FILE)).unwrap();
        assert_eq!(summary, "Scheme,Profile,Avg RTT,95th RTT\nbbr,1,50,59\n");
        let merged = fs::read_to_string(first.join(DATASET_FILE)).unwrap();
        assert_eq!(merged.lines().count(), 3);
        assert!(merged.contains("bbr,1,1,101,10,0,60"));
        assert!(first.join(SCATTER_FILE).is_file());
        assert!(first.join(SCHEME_SUMMARY_FILE).is_file());
    }

    #[test]
    fn test_empty_dataset_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = ResultAggregator::new(LayoutConfig::rooted_at(dir.path()));
        let (schemes, profiles) = matrix();
        let dataset = aggregator.load(&schemes, &profiles);

        assert_eq!(dataset.missing().len(), 4);
        assert_eq!(aggregator.write_outputs(&dataset).unwrap(), None);
        assert!(!dir.path().join("graphs-1").exists());
    }

    #[test]
    fn test_summary_table_lists_each_row() {
        let table = summary_table(&[SummaryRow {
            scheme: "vegas".to_string(),
            profile: "2".to_string(),
            avg_rtt: 412.345,
            p95_rtt: 480.0,
        }]);
        assert!(table.lines().next().unwrap().contains("95th RTT"));
        assert!(table.contains("vegas"));
        assert!(table.contains("480.00"));
    }
}
