//! Executor errors.

use std::{io, path::PathBuf, time::Duration};

use session_broker_core::ErrorKind;
use thiserror::Error;

use crate::command::CommandBuildError;

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Path not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("Is a directory: {}", .0.display())]
    IsADirectory(PathBuf),
    #[error("File is not valid UTF-8 text: {}", .0.display())]
    Decode(PathBuf),
    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("I/O error while {operation} at {}: {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Spawn failed: {0}")]
    SpawnFailed(#[source] io::Error),
    #[error("Command build error: {0}")]
    CommandBuild(#[from] CommandBuildError),
    #[error("Command timed out after {:.1} seconds", .timeout.as_secs_f64())]
    Timeout {
        timeout: Duration,
        stdout: String,
        stderr: String,
    },
}

impl ExecError {
    /// Classify an I/O error against the path it concerns.
    #[must_use]
    pub fn from_io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ => Self::Io {
                operation,
                path,
                source,
            },
        }
    }

    /// Whether this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Caller-facing category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidRequest(_) => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NotADirectory(_)
            | Self::IsADirectory(_)
            | Self::Decode(_)
            | Self::PermissionDenied(_)
            | Self::Io { .. }
            | Self::SpawnFailed(_)
            | Self::CommandBuild(_) => ErrorKind::Execution,
        }
    }
}
