use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::scenario::{Profile, Scheme};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration lists no schemes")]
    NoSchemes,
    #[error("configuration lists no profiles")]
    NoProfiles,
    #[error("scheme '{0}' is listed more than once")]
    DuplicateScheme(String),
    #[error("profile '{0}' is listed more than once")]
    DuplicateProfile(String),
    #[error("run.{field} must be greater than zero")]
    ZeroValue { field: &'static str },
}

/// Timing of a single run and of the matrix around it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Hard ceiling on the supervised part of a run.
    pub duration_secs: u64,
    pub poll_interval_ms: u64,
    /// Pause between two consecutive runs of the matrix.
    pub cooldown_secs: u64,
    /// Address handed to the second process to reach the first one.
    pub peer_host: String,
    /// How long a process group gets between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            poll_interval_ms: 1000,
            cooldown_secs: 5,
            peer_host: "127.0.0.1".to_string(),
            kill_grace_ms: 500,
        }
    }
}

impl RunConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Where raw logs, canonical results and aggregated outputs live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayoutConfig {
    pub root: PathBuf,
    pub results_dir: String,
    pub logs_prefix: String,
    pub graphs_prefix: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            results_dir: "results".to_string(),
            logs_prefix: "logs".to_string(),
            graphs_prefix: "graphs".to_string(),
        }
    }
}

impl LayoutConfig {
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn results_root(&self) -> PathBuf {
        self.root.join(&self.results_dir)
    }

    /// `results/profile_<id>/<scheme>/`
    pub fn result_dir(&self, profile: &str, scheme: &str) -> PathBuf {
        self.results_root()
            .join(format!("profile_{profile}"))
            .join(scheme)
    }

    /// `results/profile_<id>/<scheme>/<scheme>_log.csv`
    pub fn canonical_artifact(&self, profile: &str, scheme: &str) -> PathBuf {
        self.result_dir(profile, scheme)
            .join(format!("{scheme}_log.csv"))
    }
}

/// Programs used to wrap a run in an emulated link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmulatorConfig {
    pub delay_program: String,
    pub link_program: String,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            delay_program: "mm-delay".to_string(),
            link_program: "mm-link".to_string(),
        }
    }
}

/// Scope of the global best-effort process sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepConfig {
    /// Any process whose command line mentions this path is considered
    /// harness-owned.
    pub marker: PathBuf,
}

/// Complete, immutable description of one experiment matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    pub wrapper_dir: PathBuf,
    pub schemes: Vec<Scheme>,
    pub profiles: Vec<Profile>,
    pub run: RunConfig,
    pub layout: LayoutConfig,
    pub emulator: Option<EmulatorConfig>,
    pub sweep: Option<SweepConfig>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            wrapper_dir: PathBuf::from("src/wrappers"),
            schemes: ["cubic", "bbr", "vegas"].into_iter().map(Scheme::new).collect(),
            profiles: vec![
                Profile::new(
                    "1",
                    5,
                    "mahimahi/traces/TMobile-LTE-driving.up",
                    "mahimahi/traces/TMobile-LTE-driving.down",
                ),
                Profile::new(
                    "2",
                    200,
                    "mahimahi/traces/TMobile-LTE-short.up",
                    "mahimahi/traces/TMobile-LTE-short.down",
                ),
            ],
            run: RunConfig::default(),
            layout: LayoutConfig::default(),
            emulator: Some(EmulatorConfig::default()),
            sweep: Some(SweepConfig {
                marker: PathBuf::from("src/wrappers"),
            }),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schemes.is_empty() {
            return Err(ConfigError::NoSchemes);
        }
        if self.profiles.is_empty() {
            return Err(ConfigError::NoProfiles);
        }

        let mut seen = HashSet::new();
        for scheme in &self.schemes {
            if !seen.insert(scheme.name.as_str()) {
                return Err(ConfigError::DuplicateScheme(scheme.name.clone()));
            }
        }
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if !seen.insert(profile.id.as_str()) {
                return Err(ConfigError::DuplicateProfile(profile.id.clone()));
            }
        }

        if self.run.duration_secs == 0 {
            return Err(ConfigError::ZeroValue {
                field: "duration_secs",
            });
        }
        if self.run.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroValue {
                field: "poll_interval_ms",
            });
        }
        Ok(())
    }

    pub fn scheme(&self, name: &str) -> Option<&Scheme> {
        self.schemes.iter().find(|s| s.name == name)
    }

    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Resolve relative paths against `base`, typically the directory that
    /// holds the configuration file.
    pub fn rebase(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.wrapper_dir);
        join(&mut self.layout.root);
        for scheme in &mut self.schemes {
            if let Some(wrapper) = scheme.wrapper.as_mut() {
                join(wrapper);
            }
        }
        for profile in &mut self.profiles {
            join(&mut profile.uplink);
            join(&mut profile.downlink);
        }
        if let Some(sweep) = self.sweep.as_mut() {
            join(&mut sweep.marker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matrix_matches_known_schemes() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        let names: Vec<_> = config.schemes.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["cubic", "bbr", "vegas"]);
        assert_eq!(config.profile("2").map(|p| p.delay_ms), Some(200));
        assert!(config.scheme("reno").is_none());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zero_duration() {
        let mut config = HarnessConfig::default();
        config.schemes.push(Scheme::new("bbr"));
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateScheme("bbr".to_string()))
        );

        let mut config = HarnessConfig::default();
        config.run.duration_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroValue { .. })
        ));
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let text = r#"
            wrapper_dir = "wrappers"

            [[schemes]]
            name = "cubic"

            [[profiles]]
            id = "low"
            delay_ms = 10
            uplink = "traces/a.up"
            downlink = "traces/a.down"

            [run]
            duration_secs = 30
        "#;
        let config: HarnessConfig = toml::from_str(text).unwrap();
        assert_eq!(config.schemes.len(), 1);
        assert_eq!(config.run.duration_secs, 30);
        assert_eq!(config.run.poll_interval_ms, 1000);
        assert_eq!(config.layout.results_dir, "results");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_layout_paths() {
        let layout = LayoutConfig::rooted_at("/tmp/lab");
        assert_eq!(
            layout.canonical_artifact("1", "bbr"),
            PathBuf::from("/tmp/lab/results/profile_1/bbr/bbr_log.csv")
        );
    }

    #[test]
    fn test_rebase_only_touches_relative_paths() {
        let mut config = HarnessConfig::default();
        config.layout.root = PathBuf::from("/abs");
        config.rebase(Path::new("/etc/lab"));
        assert_eq!(config.wrapper_dir, PathBuf::from("/etc/lab/src/wrappers"));
        assert_eq!(config.layout.root, PathBuf::from("/abs"));
    }
}
