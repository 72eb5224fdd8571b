use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};

const DEFAULT_GRACE: Duration = Duration::from_millis(500);
const REAP_POLL: Duration = Duration::from_millis(50);

/// Owns a spawned process and every process it forks.
///
/// The child is started as the leader of a fresh process group, so the whole
/// tree can be signalled at once. Termination is idempotent and also runs on
/// drop.
pub struct ProcessGroup {
    label: String,
    child: Child,
    pgid: i32,
    terminated: bool,
}

impl ProcessGroup {
    pub fn spawn(label: impl Into<String>, mut command: Command) -> Result<Self> {
        let label = label.into();
        let program = command.get_program().to_string_lossy().into_owned();
        command.process_group(0).stdin(Stdio::null());

        let child = command
            .spawn()
            .map_err(|source| HarnessError::Spawn { program, source })?;
        let pgid = child.id() as i32;
        debug!("Started {} as process group {}", label, pgid);

        Ok(Self {
            label,
            child,
            pgid,
            terminated: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Exit status of the group leader if it has exited, without blocking.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        self.child
            .try_wait()
            .map_err(|source| HarnessError::Cleanup {
                pgid: self.pgid,
                source,
            })
    }

    /// Block until the group leader exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().map_err(|source| HarnessError::Cleanup {
            pgid: self.pgid,
            source,
        })
    }

    /// Deliver `signal` to every process in the group. A group that no longer
    /// exists is not an error.
    pub fn signal(&self, signal: libc::c_int) -> Result<()> {
        let ret = unsafe { libc::killpg(self.pgid, signal) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(HarnessError::Cleanup {
                pgid: self.pgid,
                source: err,
            });
        }
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// SIGTERM the group, give the leader `grace` to exit, then SIGKILL
    /// whatever is left and reap the leader. Failures are logged, never
    /// returned.
    pub fn terminate(&mut self, grace: Duration) {
        if self.terminated {
            return;
        }

        if let Err(e) = self.signal(libc::SIGTERM) {
            warn!("{}: {}", self.label, e);
        }

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => break,
                Ok(None) => thread::sleep(REAP_POLL),
                Err(e) => {
                    warn!("{}: failed to poll process group {}: {}", self.label, self.pgid, e);
                    break;
                }
            }
        }

        // Members that ignored SIGTERM, or outlived the leader.
        if let Err(e) = self.signal(libc::SIGKILL) {
            warn!("{}: {}", self.label, e);
        }
        match self.child.wait() {
            Ok(status) => debug!("{} (group {}) ended with {}", self.label, self.pgid, status),
            Err(e) => warn!("{}: failed to reap group leader {}: {}", self.label, self.pgid, e),
        }
        self.terminated = true;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.terminate(DEFAULT_GRACE);
    }
}
