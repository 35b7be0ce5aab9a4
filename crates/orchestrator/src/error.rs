use std::path::PathBuf;

use events::ErrorCode;
use thiserror::Error;

/// Exit status for a command that could not be found
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit status for a command that exists but cannot be executed
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Exit status after an interrupt
pub const EXIT_INTERRUPTED: i32 = 130;
/// Exit status for every other fatal run error
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Timeout waiting for log file: {} (after {secs}s)", path.display())]
    SourceTimeout { path: PathBuf, secs: u64 },

    #[error("Command '{0}' not found")]
    CommandNotFound(String),

    #[error("Permission denied executing '{0}'")]
    PermissionDenied(String),

    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No command specified")]
    EmptyCommand,

    #[error("Pseudo-terminal error: {0}")]
    Pty(#[from] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interrupted")]
    Interrupted,

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl RelayError {
    /// Classify a spawn failure the way a shell would
    pub fn spawn(command: impl Into<String>, source: std::io::Error) -> Self {
        let command = command.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::CommandNotFound(command),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(command),
            _ => Self::Spawn { command, source },
        }
    }

    /// Process exit status this error maps to
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CommandNotFound(_) => EXIT_NOT_FOUND,
            Self::PermissionDenied(_) => EXIT_NOT_EXECUTABLE,
            Self::Interrupted => EXIT_INTERRUPTED,
            _ => EXIT_FAILURE,
        }
    }

    /// Wire code reported to the observer
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SourceTimeout { .. } => ErrorCode::Timeout,
            Self::CommandNotFound(_)
            | Self::PermissionDenied(_)
            | Self::Spawn { .. }
            | Self::EmptyCommand
            | Self::Pty(_) => ErrorCode::SpawnError,
            _ => ErrorCode::StreamError,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_spawn_not_found_maps_to_127() {
        let err = RelayError::spawn("nextflow", Error::from(ErrorKind::NotFound));
        assert!(matches!(err, RelayError::CommandNotFound(_)));
        assert_eq!(err.exit_code(), 127);
        assert_eq!(err.code(), ErrorCode::SpawnError);
    }

    #[test]
    fn test_spawn_permission_denied_maps_to_126() {
        let err = RelayError::spawn("./run.sh", Error::from(ErrorKind::PermissionDenied));
        assert_eq!(err.exit_code(), 126);
        assert_eq!(err.to_string(), "Permission denied executing './run.sh'");
    }

    #[test]
    fn test_other_errors_map_to_1() {
        let err = RelayError::SourceTimeout {
            path: PathBuf::from("/shared/nextflow.out"),
            secs: 30,
        };
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(err.to_string().contains("/shared/nextflow.out"));
    }

    #[test]
    fn test_interrupted_maps_to_130() {
        assert_eq!(RelayError::Interrupted.exit_code(), 130);
    }
}
