pub mod spec;

use cc_lab_abstract::{HarnessConfig, Role, Scheme};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

/// Argument that asks a wrapper which role has to start first.
pub const RUN_FIRST: &str = "run_first";

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Unknown scheme '{name}'. Known schemes: {known}")]
    UnknownScheme { name: String, known: String },

    #[error("Wrapper for '{scheme}' not found at {}", path.display())]
    WrapperNotFound { scheme: String, path: PathBuf },

    #[error("Failed to determine starting role for '{scheme}': {reason}")]
    RoleNegotiation { scheme: String, reason: String },
}

/// Which role starts first and which one follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolePlan {
    pub first: Role,
    pub second: Role,
}

impl RolePlan {
    pub fn starting_with(first: Role) -> Self {
        Self {
            first,
            second: first.peer(),
        }
    }
}

/// An external wrapper program driving one scheme.
///
/// The wrapper contract: `<wrapper> run_first` prints `sender` or `receiver`
/// and exits zero; `<wrapper> <role> <port>` starts the listening side and
/// `<wrapper> <role> <host> <port>` starts the connecting side. Both run
/// until killed.
#[derive(Debug, Clone)]
pub struct SchemeWrapper {
    scheme: String,
    program: PathBuf,
}

impl SchemeWrapper {
    pub fn new(scheme: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            scheme: scheme.into(),
            program: program.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Ask the wrapper which role has to start first.
    pub fn negotiate_roles(&self) -> Result<RolePlan, LoaderError> {
        let output = Command::new(&self.program)
            .arg(RUN_FIRST)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.negotiation_error(format!("failed to invoke wrapper: {e}")))?;

        if !output.status.success() {
            return Err(self.negotiation_error(format!(
                "wrapper exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first: Role = stdout.parse().map_err(|e| self.negotiation_error(e))?;
        debug!("{} starts with the {}", self.scheme, first);
        Ok(RolePlan::starting_with(first))
    }

    /// Command for the process that starts first and listens on `port`.
    pub fn first_command(&self, role: Role, port: u16) -> Command {
        let mut command = Command::new(&self.program);
        command.arg(role.as_str()).arg(port.to_string());
        command
    }

    /// Command for the process that connects to `host:port`.
    pub fn second_command(&self, role: Role, host: &str, port: u16) -> Command {
        let mut command = Command::new(&self.program);
        command.arg(role.as_str()).arg(host).arg(port.to_string());
        command
    }

    fn negotiation_error(&self, reason: impl Into<String>) -> LoaderError {
        LoaderError::RoleNegotiation {
            scheme: self.scheme.clone(),
            reason: reason.into(),
        }
    }
}

/// Resolves schemes of a matrix to their wrapper programs.
pub struct WrapperLoader {
    wrapper_dir: PathBuf,
    require_existing: bool,
}

/// Builder for [`WrapperLoader`].
pub struct LoaderBuilder {
    wrapper_dir: PathBuf,
    require_existing: bool,
}

impl Default for LoaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderBuilder {
    pub fn new() -> Self {
        Self {
            wrapper_dir: PathBuf::from("src/wrappers"),
            require_existing: true,
        }
    }

    pub fn wrapper_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.wrapper_dir = dir.into();
        self
    }

    /// Skip the on-disk existence check (useful when wrappers are resolved
    /// through `PATH`).
    pub fn allow_missing(mut self) -> Self {
        self.require_existing = false;
        self
    }

    pub fn build(self) -> WrapperLoader {
        WrapperLoader {
            wrapper_dir: self.wrapper_dir,
            require_existing: self.require_existing,
        }
    }
}

impl WrapperLoader {
    pub fn builder() -> LoaderBuilder {
        LoaderBuilder::new()
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::builder().wrapper_dir(config.wrapper_dir.clone()).build()
    }

    pub fn load(&self, scheme: &Scheme) -> Result<SchemeWrapper, LoaderError> {
        let program = match &scheme.wrapper {
            Some(path) => path.clone(),
            None => self.wrapper_dir.join(format!("{}.py", scheme.name)),
        };
        if self.require_existing && !program.is_file() {
            return Err(LoaderError::WrapperNotFound {
                scheme: scheme.name.clone(),
                path: program,
            });
        }
        Ok(SchemeWrapper::new(scheme.name.clone(), program))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_wrapper(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_negotiate_receiver_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wrapper(dir.path(), "vegas.py", "echo receiver");
        let wrapper = SchemeWrapper::new("vegas", path);
        let plan = wrapper.negotiate_roles().unwrap();
        assert_eq!(plan.first, Role::Receiver);
        assert_eq!(plan.second, Role::Sender);
    }

    #[test]
    fn test_negotiate_rejects_garbage_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = write_wrapper(dir.path(), "a.py", "echo maybe");
        let failing = write_wrapper(dir.path(), "b.py", "exit 2");

        for path in [garbage, failing] {
            let err = SchemeWrapper::new("x", path).negotiate_roles().unwrap_err();
            assert!(matches!(err, LoaderError::RoleNegotiation { .. }));
        }

        let missing = SchemeWrapper::new("x", dir.path().join("nope.py"));
        assert!(matches!(
            missing.negotiate_roles(),
            Err(LoaderError::RoleNegotiation { .. })
        ));
    }

    #[test]
    fn test_commands_follow_wrapper_contract() {
        let wrapper = SchemeWrapper::new("cubic", "/w/cubic.py");
        let first = wrapper.first_command(Role::Sender, 4242);
        let args: Vec<_> = first.get_args().collect();
        assert_eq!(args, vec!["sender", "4242"]);

        let second = wrapper.second_command(Role::Receiver, "127.0.0.1", 4242);
        let args: Vec<_> = second.get_args().collect();
        assert_eq!(args, vec!["receiver", "127.0.0.1", "4242"]);
    }

    #[test]
    fn test_loader_checks_wrapper_exists() {
        let dir = tempfile::tempdir().unwrap();
        write_wrapper(dir.path(), "bbr.py", "echo sender");
        let loader = WrapperLoader::builder().wrapper_dir(dir.path()).build();

        let wrapper = loader.load(&Scheme::new("bbr")).unwrap();
        assert_eq!(wrapper.program(), dir.path().join("bbr.py"));
        assert!(matches!(
            loader.load(&Scheme::new("cubic")),
            Err(LoaderError::WrapperNotFound { .. })
        ));

        let lenient = WrapperLoader::builder()
            .wrapper_dir(dir.path())
            .allow_missing()
            .build();
        assert!(lenient.load(&Scheme::new("cubic")).is_ok());
    }

    #[test]
    fn test_explicit_wrapper_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let custom = write_wrapper(dir.path(), "my-vegas", "echo receiver");
        let loader = WrapperLoader::builder().wrapper_dir("/nonexistent").build();

        let wrapper = loader
            .load(&Scheme::new("vegas").with_wrapper(&custom))
            .unwrap();
        assert_eq!(wrapper.program(), custom);
        assert_eq!(wrapper.negotiate_roles().unwrap().first, Role::Receiver);
    }
}
