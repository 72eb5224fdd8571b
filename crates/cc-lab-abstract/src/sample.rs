use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role a wrapper process plays in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn peer(&self) -> Self {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sender" => Ok(Role::Sender),
            "receiver" => Ok(Role::Receiver),
            other => Err(format!("expected 'sender' or 'receiver', got '{other}'")),
        }
    }
}

/// One raw observation taken while a run is in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Mbit/s
    pub throughput: f64,
    /// Fraction in [0, 1].
    pub loss_rate: f64,
    /// Milliseconds.
    pub rtt: f64,
}

/// One row of a per-run metrics artifact. `timestamp` is the elapsed second
/// the row describes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: u64,
    pub throughput: f64,
    pub loss_rate: f64,
    pub rtt: f64,
}

impl MetricSample {
    pub fn at(timestamp: u64, measurement: Measurement) -> Self {
        Self {
            timestamp,
            throughput: measurement.throughput,
            loss_rate: measurement.loss_rate.clamp(0.0, 1.0),
            rtt: measurement.rtt,
        }
    }
}

/// RTT statistics for one (scheme, profile) combination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub scheme: String,
    pub profile: String,
    pub avg_rtt: f64,
    pub p95_rtt: f64,
}
