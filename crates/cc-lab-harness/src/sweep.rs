use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

/// Last-resort cleanup after an unexpected failure: kill every process the
/// harness might have left behind. Never fails.
pub trait Sweeper {
    fn sweep(&self);
}

/// Does nothing. Used when no sweep marker is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSweeper;

impl Sweeper for NoopSweeper {
    fn sweep(&self) {}
}

/// Kills every process whose command line mentions `marker`, except the
/// harness itself and its parent.
#[derive(Debug, Clone)]
pub struct ProcessSweeper {
    marker: PathBuf,
}

impl ProcessSweeper {
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    fn matching_pids(&self) -> Vec<i32> {
        let output = match Command::new("pgrep")
            .arg("-f")
            .arg(&self.marker)
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                warn!("Sweep skipped, pgrep unavailable: {}", e);
                return Vec::new();
            }
        };
        // pgrep exits 1 when nothing matched.
        parse_pids(&String::from_utf8_lossy(&output.stdout))
    }
}

impl Sweeper for ProcessSweeper {
    fn sweep(&self) {
        let own = unsafe { [libc::getpid(), libc::getppid()] };
        let mut killed = 0;
        for pid in self.matching_pids() {
            if own.contains(&pid) {
                continue;
            }
            let ret = unsafe { libc::kill(pid, libc::SIGKILL) };
            if ret == 0 {
                killed += 1;
            } else {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!("Sweep could not kill {}: {}", pid, err);
                }
            }
        }
        if killed > 0 {
            info!(
                "Swept {} leftover process(es) under {}",
                killed,
                self.marker.display()
            );
        }
    }
}

fn parse_pids(stdout: &str) -> Vec<i32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}
