use crate::config::RunConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A congestion-control scheme under test. The harness only knows its name
/// and where its wrapper program lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheme {
    pub name: String,
    /// Explicit wrapper location; defaults to `<wrapper_dir>/<name>.py`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapper: Option<PathBuf>,
}

impl Scheme {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            wrapper: None,
        }
    }

    pub fn with_wrapper(mut self, path: impl Into<PathBuf>) -> Self {
        self.wrapper = Some(path.into());
        self
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A named network scenario: one-way delay plus the link traces that shape
/// each direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    pub delay_ms: u64,
    pub uplink: PathBuf,
    pub downlink: PathBuf,
}

impl Profile {
    pub fn new(
        id: impl Into<String>,
        delay_ms: u64,
        uplink: impl Into<PathBuf>,
        downlink: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            delay_ms,
            uplink: uplink.into(),
            downlink: downlink.into(),
        }
    }

    /// Base round-trip time the emulated delay alone adds.
    pub fn base_rtt_ms(&self) -> u64 {
        2 * self.delay_ms
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "profile {}", self.id)
    }
}

/// Which schemes of the matrix a command should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemeSelection {
    All,
    Named(Vec<String>),
}

/// Command-line overrides layered on top of a loaded [`RunConfig`].
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RunConfigOverride {
    pub duration_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub cooldown_secs: Option<u64>,
    pub peer_host: Option<String>,
    pub kill_grace_ms: Option<u64>,
}

impl RunConfigOverride {
    pub fn apply_to(&self, config: &mut RunConfig) {
        if let Some(v) = self.duration_secs {
            config.duration_secs = v;
        }
        if let Some(v) = self.poll_interval_ms {
            config.poll_interval_ms = v;
        }
        if let Some(v) = self.cooldown_secs {
            config.cooldown_secs = v;
        }
        if let Some(v) = &self.peer_host {
            config.peer_host = v.clone();
        }
        if let Some(v) = self.kill_grace_ms {
            config.kill_grace_ms = v;
        }
    }
}
