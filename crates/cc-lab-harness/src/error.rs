use cc_lab_abstract::Role;
use cc_lab_loader::LoaderError;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("No usable entries in trace input")]
    EmptyInput,

    #[error("Invalid trace line {line}: {reason}")]
    InvalidTrace { line: usize, reason: String },

    #[error("Invalid trace parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("{scheme} {role} process exited with {status}")]
    RunCrashed {
        scheme: String,
        role: Role,
        status: ExitStatus,
    },

    #[error("Missing artifact {}", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("Malformed artifact {} (line {line}): {reason}", path.display())]
    MalformedArtifact {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Failed to allocate a free port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process group {pgid}: {source}")]
    Cleanup {
        pgid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HarnessError::Io {
            path: path.into(),
            source,
        }
    }

    /// Failures of the harness's own execution environment rather than of
    /// the scheme under test. These abort the whole matrix.
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            HarnessError::PortAllocation(_) | HarnessError::Spawn { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environmental_classification() {
        let spawn = HarnessError::Spawn {
            program: "cubic.py".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(spawn.is_environmental());

        let role = HarnessError::from(LoaderError::RoleNegotiation {
            scheme: "bbr".to_string(),
            reason: "no output".to_string(),
        });
        assert!(!role.is_environmental());
        assert!(role.to_string().contains("bbr"));
        assert!(!HarnessError::EmptyInput.is_environmental());
    }
}
