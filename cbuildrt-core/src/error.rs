//! Error types for cbuildrt

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// cbuildrt error types
///
/// Every variant is fatal to the run and is returned only after teardown
/// has completed. A build command that exits non-zero is *not* an error;
/// it is reported through [`RunResult`](crate::RunResult).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or incomplete run configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// A mount declaration was rejected while building the plan
    #[error("Invalid mount spec for {}: {reason}", path.display())]
    InvalidMountSpec {
        /// Offending container (or host) path
        path: PathBuf,
        /// Why the declaration was rejected
        reason: String,
    },

    /// The host refused to create a namespace
    #[error("Namespace unavailable: {operation}: {source}")]
    NamespaceUnavailable {
        /// Operation that was denied
        operation: String,
        /// Underlying errno
        #[source]
        source: nix::Error,
    },

    /// A mount syscall failed
    #[error("Mount failed for {spec}: {source}")]
    MountFailed {
        /// Human-readable description of the mount
        spec: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Working directory does not exist inside the new root
    #[error("Invalid working directory {}: {source}", path.display())]
    InvalidWorkingDirectory {
        /// Requested working directory (container path)
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// The build command could not be executed
    #[error("Failed to execute {program}: {message}")]
    ExecFailed {
        /// Program that was requested
        program: String,
        /// Failure description
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidConfig`]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::InvalidMountSpec`]
    pub fn invalid_mount(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidMountSpec {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Error::MountFailed`] from a syscall errno
    pub fn mount_failed(spec: impl fmt::Display, errno: nix::Error) -> Self {
        Self::MountFailed {
            spec: spec.to_string(),
            source: std::io::Error::from(errno),
        }
    }

    /// Whether the error was raised before any namespace syscall ran.
    ///
    /// These errors guarantee the host was not touched.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::InvalidMountSpec { .. }
        )
    }
}

/// Non-fatal problem encountered while tearing a run down
///
/// Collected in the [`RunReport`](crate::RunReport); never overrides a
/// successful run result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownWarning {
    /// Resource that could not be released
    pub target: PathBuf,
    /// What went wrong
    pub message: String,
}

impl TeardownWarning {
    /// Create a new warning
    pub fn new(target: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TeardownWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target.display(), self.message)
    }
}

/// [`Error`] in a form that can cross a process boundary
///
/// Errno values survive the trip; other OS error details are kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorReport {
    /// See [`Error::InvalidConfig`]
    InvalidConfig {
        /// Error message
        message: String,
    },
    /// See [`Error::InvalidMountSpec`]
    InvalidMountSpec {
        /// Offending path
        path: PathBuf,
        /// Why the declaration was rejected
        reason: String,
    },
    /// See [`Error::NamespaceUnavailable`]
    NamespaceUnavailable {
        /// Operation that was denied
        operation: String,
        /// Raw errno
        errno: i32,
    },
    /// See [`Error::MountFailed`]
    MountFailed {
        /// Mount description
        spec: String,
        /// Raw errno, when the failure came from a syscall
        errno: Option<i32>,
        /// OS error text
        message: String,
    },
    /// See [`Error::InvalidWorkingDirectory`]
    InvalidWorkingDirectory {
        /// Requested working directory
        path: PathBuf,
        /// Raw errno, when the failure came from a syscall
        errno: Option<i32>,
        /// OS error text
        message: String,
    },
    /// See [`Error::ExecFailed`]
    ExecFailed {
        /// Program that was requested
        program: String,
        /// Failure description
        message: String,
    },
    /// See [`Error::Io`]
    Io {
        /// Raw errno, when the failure came from a syscall
        errno: Option<i32>,
        /// OS error text
        message: String,
    },
    /// See [`Error::System`]
    System {
        /// Raw errno
        errno: i32,
    },
}

impl ErrorReport {
    /// Rebuild the error on the receiving side
    #[must_use]
    pub fn into_error(self) -> Error {
        match self {
            Self::InvalidConfig { message } => Error::InvalidConfig { message },
            Self::InvalidMountSpec { path, reason } => Error::InvalidMountSpec { path, reason },
            Self::NamespaceUnavailable { operation, errno } => Error::NamespaceUnavailable {
                operation,
                source: nix::Error::from_raw(errno),
            },
            Self::MountFailed {
                spec,
                errno,
                message,
            } => Error::MountFailed {
                spec,
                source: os_error(errno, message),
            },
            Self::InvalidWorkingDirectory {
                path,
                errno,
                message,
            } => Error::InvalidWorkingDirectory {
                path,
                source: os_error(errno, message),
            },
            Self::ExecFailed { program, message } => Error::ExecFailed { program, message },
            Self::Io { errno, message } => Error::Io(os_error(errno, message)),
            Self::System { errno } => Error::System(nix::Error::from_raw(errno)),
        }
    }
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidConfig { message } => Self::InvalidConfig {
                message: message.clone(),
            },
            Error::InvalidMountSpec { path, reason } => Self::InvalidMountSpec {
                path: path.clone(),
                reason: reason.clone(),
            },
            Error::NamespaceUnavailable { operation, source } => Self::NamespaceUnavailable {
                operation: operation.clone(),
                errno: *source as i32,
            },
            Error::MountFailed { spec, source } => Self::MountFailed {
                spec: spec.clone(),
                errno: source.raw_os_error(),
                message: source.to_string(),
            },
            Error::InvalidWorkingDirectory { path, source } => Self::InvalidWorkingDirectory {
                path: path.clone(),
                errno: source.raw_os_error(),
                message: source.to_string(),
            },
            Error::ExecFailed { program, message } => Self::ExecFailed {
                program: program.clone(),
                message: message.clone(),
            },
            Error::Io(source) => Self::Io {
                errno: source.raw_os_error(),
                message: source.to_string(),
            },
            Error::System(errno) => Self::System {
                errno: *errno as i32,
            },
        }
    }
}

fn os_error(errno: Option<i32>, message: String) -> std::io::Error {
    errno.map_or_else(
        || std::io::Error::other(message),
        std::io::Error::from_raw_os_error,
    )
}

/// Result type alias for cbuildrt operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors() {
        assert!(Error::invalid_config("missing args").is_validation());
        assert!(Error::invalid_mount("/input", "duplicate").is_validation());
        assert!(!Error::mount_failed("/input", nix::Error::EPERM).is_validation());
    }

    #[test]
    fn test_mount_failed_keeps_errno() {
        let err = Error::mount_failed("bind /src -> /input", nix::Error::EBUSY);
        match err {
            Error::MountFailed { spec, source } => {
                assert_eq!(spec, "bind /src -> /input");
                assert_eq!(source.raw_os_error(), Some(ebusy()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = Error::invalid_mount("/a/../..", "escapes the container root");
        assert_eq!(
            err.to_string(),
            "Invalid mount spec for /a/../..: escapes the container root"
        );
    }

    #[test]
    fn test_teardown_warning_display() {
        let warning = TeardownWarning::new("/tmp/root/input", "target is busy");
        assert_eq!(warning.to_string(), "/tmp/root/input: target is busy");
    }

    #[test]
    fn test_error_report_keeps_kind_and_errno() {
        let err = Error::NamespaceUnavailable {
            operation: "unshare(CLONE_NEWUSER)".to_string(),
            source: nix::Error::EPERM,
        };
        let report = ErrorReport::from(&err);
        let back = report.into_error();
        assert_eq!(back.to_string(), err.to_string());
        assert!(matches!(
            back,
            Error::NamespaceUnavailable {
                source: nix::Error::EPERM,
                ..
            }
        ));

        let err = Error::mount_failed("proc on /proc", nix::Error::EBUSY);
        match ErrorReport::from(&err).into_error() {
            Error::MountFailed { source, .. } => assert_eq!(source.raw_os_error(), Some(ebusy())),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_report_without_errno_keeps_text() {
        let err = Error::Io(std::io::Error::other("run process vanished"));
        let back = ErrorReport::from(&err).into_error();
        assert_eq!(back.to_string(), "I/O error: run process vanished");
        assert!(!back.is_validation());
    }

    fn ebusy() -> i32 {
        nix::Error::EBUSY as i32
    }
}
