//! Packet-arrival traces consumed by the link emulator.
//!
//! A trace is plain text with one arrival per line,
//! `"<timestamp_seconds:%.6f> <byte_count>"`, in ascending time order.

use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{HarnessError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceEntry {
    pub timestamp: f64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Timestamp of the last arrival, i.e. the length of one loop.
    pub fn duration(&self) -> Option<f64> {
        self.entries.last().map(|e| e.timestamp)
    }

    pub fn is_strictly_increasing(&self) -> bool {
        self.entries
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp)
    }

    pub fn is_non_decreasing(&self) -> bool {
        self.entries
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let invalid = |reason: String| HarnessError::InvalidTrace {
                line: idx + 1,
                reason,
            };

            let mut fields = line.split_whitespace();
            let (Some(time), Some(size), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(invalid(format!("expected '<timestamp> <size>', got '{line}'")));
            };
            let timestamp: f64 = time
                .parse()
                .map_err(|e| invalid(format!("bad timestamp '{time}': {e}")))?;
            let size: u64 = size
                .parse()
                .map_err(|e| invalid(format!("bad packet size '{size}': {e}")))?;
            entries.push(TraceEntry { timestamp, size });
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        Self::parse(&text)
    }

    /// Write the trace to `path`. The parent directory must already exist.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string()).map_err(|e| HarnessError::io(path, e))
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{:.6} {}", entry.timestamp, entry.size)?;
        }
        Ok(())
    }
}

/// Keep only entries made entirely of ASCII digits. Anything else (headers,
/// blank lines, stray text) is dropped before counting. A digit-only size
/// that does not fit in a `u64` is an error, not noise.
fn usable_sizes<S: AsRef<str>>(raw: &[S]) -> Result<Vec<u64>> {
    let mut sizes = Vec::with_capacity(raw.len());
    for (idx, entry) in raw.iter().enumerate() {
        let entry = entry.as_ref().trim();
        if entry.is_empty() || !entry.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let size = entry.parse::<u64>().map_err(|e| HarnessError::InvalidTrace {
            line: idx + 1,
            reason: format!("packet size '{entry}' out of range: {e}"),
        })?;
        sizes.push(size);
    }
    Ok(sizes)
}

/// Spread the usable packet sizes uniformly over `total_duration` seconds.
pub fn generate_from_sizes<S: AsRef<str>>(raw_sizes: &[S], total_duration: f64) -> Result<Trace> {
    if !(total_duration.is_finite() && total_duration > 0.0) {
        return Err(HarnessError::InvalidParameter(format!(
            "total duration must be positive, got {total_duration}"
        )));
    }

    let sizes = usable_sizes(raw_sizes)?;
    if sizes.is_empty() {
        return Err(HarnessError::EmptyInput);
    }

    let gap = total_duration / sizes.len() as f64;
    let entries = sizes
        .into_iter()
        .enumerate()
        .map(|(i, size)| TraceEntry {
            timestamp: i as f64 * gap,
            size,
        })
        .collect();
    Ok(Trace { entries })
}

/// Loop `source` `repeat_count` times; copy `i` is shifted by
/// `i * base_duration`, where `base_duration` is the last timestamp.
pub fn extend_trace(source: &Trace, repeat_count: usize) -> Result<Trace> {
    if repeat_count == 0 {
        return Err(HarnessError::InvalidParameter(
            "repeat count must be at least 1".to_string(),
        ));
    }
    let base_duration = source.duration().ok_or(HarnessError::EmptyInput)?;

    let mut entries = Vec::with_capacity(repeat_count * source.len());
    for i in 0..repeat_count {
        let offset = i as f64 * base_duration;
        entries.extend(source.entries.iter().map(|e| TraceEntry {
            timestamp: e.timestamp + offset,
            size: e.size,
        }));
    }
    Ok(Trace { entries })
}

/// Read a raw size list (one size per line) and write the generated trace.
pub fn generate_trace_file(input: &Path, output: &Path, total_duration: f64) -> Result<Trace> {
    let text = fs::read_to_string(input).map_err(|e| HarnessError::io(input, e))?;
    let lines: Vec<&str> = text.lines().collect();
    let trace = generate_from_sizes(&lines, total_duration)?;
    trace.write_to(output)?;
    info!(
        "Trace saved to {} | duration {}s | packets {} | avg gap {:.6}s",
        output.display(),
        total_duration,
        trace.len(),
        total_duration / trace.len() as f64
    );
    Ok(trace)
}

pub fn extend_trace_file(input: &Path, output: &Path, repeat_count: usize) -> Result<Trace> {
    let source = Trace::load(input)?;
    let extended = extend_trace(&source, repeat_count)?;
    extended.write_to(output)?;
    info!(
        "Extended {} -> {} ({} x {} entries)",
        input.display(),
        output.display(),
        repeat_count,
        source.len()
    );
    Ok(extended)
}
