//! Live measurements taken while a run is supervised.

use cc_lab_abstract::Measurement;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest a single `ss` invocation may take before it is killed.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Something that can be sampled once per supervision tick.
///
/// `None` means nothing could be observed this tick; the collector then
/// carries the previous value forward.
pub trait MeasurementSource: Send {
    fn observe(&mut self) -> Option<Measurement>;
}

/// Samples kernel TCP statistics (`ss -tin`) of the connection on `port`.
#[derive(Debug, Clone)]
pub struct SocketStatsProbe {
    port: u16,
    program: String,
    timeout: Duration,
}

impl SocketStatsProbe {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            program: "ss".to_string(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn command(&self) -> Command {
        let port = format!(":{}", self.port);
        let mut command = Command::new(&self.program);
        command
            .args(["-t", "-i", "-n", "state", "established"])
            .args(["(", "sport", "=", &port, "or", "dport", "=", &port, ")"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        command
    }

    /// Run `ss` once, killing it if it outlives the timeout.
    fn capture(&self) -> Option<String> {
        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!("Failed to run {}: {}", self.program, e);
                return None;
            }
        };
        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => break,
                Ok(Some(status)) => {
                    debug!("{} exited with {}", self.program, status);
                    return None;
                }
                Ok(None) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10));
                }
                Ok(None) => {
                    debug!("{} timed out after {:?}", self.program, self.timeout);
                    if let Err(e) = child.kill() {
                        debug!("Failed to kill {}: {}", self.program, e);
                    }
                    // Reap; the exit status of a killed probe is irrelevant.
                    let _ = child.wait();
                    return None;
                }
                Err(e) => {
                    debug!("Failed to wait for {}: {}", self.program, e);
                    return None;
                }
            }
        }

        let mut stdout = Vec::new();
        child.stdout.take()?.read_to_end(&mut stdout).ok()?;
        Some(String::from_utf8_lossy(&stdout).into_owned())
    }
}

impl MeasurementSource for SocketStatsProbe {
    fn observe(&mut self) -> Option<Measurement> {
        parse_socket_stats(&self.capture()?)
    }
}

/// Counters of one socket as printed by `ss -i`.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct SocketInfo {
    rtt_ms: Option<f64>,
    delivery_mbps: Option<f64>,
    retrans_total: u64,
    segs_out: u64,
}

impl SocketInfo {
    fn parse(line: &str) -> Self {
        let mut info = SocketInfo::default();
        let mut data_segs_out = None;
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "delivery_rate" {
                info.delivery_mbps = tokens.next().and_then(parse_rate_mbps);
                continue;
            }
            let Some((key, value)) = token.split_once(':') else {
                continue;
            };
            match key {
                "rtt" => {
                    info.rtt_ms = value.split('/').next().and_then(|v| v.parse().ok());
                }
                "retrans" => {
                    info.retrans_total = value
                        .split('/')
                        .nth(1)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                }
                "segs_out" => info.segs_out = value.parse().unwrap_or(0),
                "data_segs_out" => data_segs_out = value.parse().ok(),
                _ => {}
            }
        }
        if let Some(data) = data_segs_out {
            info.segs_out = data;
        }
        info
    }

    fn to_measurement(self) -> Option<Measurement> {
        let rtt = self.rtt_ms?;
        let loss_rate = if self.segs_out == 0 {
            0.0
        } else {
            (self.retrans_total as f64 / self.segs_out as f64).min(1.0)
        };
        Some(Measurement {
            throughput: self.delivery_mbps.unwrap_or(0.0),
            loss_rate,
            rtt,
        })
    }
}

/// `6553.6Mbps` -> 6553.6, `1.2Gbps` -> 1200.0, `800bps` -> 0.0008.
fn parse_rate_mbps(token: &str) -> Option<f64> {
    let (number, per_mbit) = if let Some(n) = token.strip_suffix("Gbps") {
        (n, 1e-3)
    } else if let Some(n) = token.strip_suffix("Mbps") {
        (n, 1.0)
    } else if let Some(n) = token.strip_suffix("Kbps") {
        (n, 1e3)
    } else if let Some(n) = token.strip_suffix("bps") {
        (n, 1e6)
    } else {
        return None;
    };
    number.parse::<f64>().ok().map(|v| v / per_mbit)
}

/// Pick the busiest socket (the sending side) out of `ss -tin` output and
/// turn its counters into a measurement.
pub fn parse_socket_stats(output: &str) -> Option<Measurement> {
    output
        .lines()
        // Detail lines are indented; socket and header lines are not.
        .filter(|line| line.starts_with(char::is_whitespace) && line.contains("rtt:"))
        .map(SocketInfo::parse)
        .max_by_key(|info| info.segs_out)
        .and_then(SocketInfo::to_measurement)
}
