//! Core type definitions for run outcomes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::{SIGNAL_EXIT_OFFSET, TeardownWarning};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ProcessId(i32);

impl ProcessId {
    /// Create from raw PID
    #[must_use]
    pub const fn from_raw(pid: i32) -> Self {
        Self(pid)
    }

    /// Convert to `nix::unistd::Pid`
    #[must_use]
    pub const fn as_nix_pid(self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.0)
    }

    /// Get raw PID value
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<nix::unistd::Pid> for ProcessId {
    fn from(pid: nix::unistd::Pid) -> Self {
        Self(pid.as_raw())
    }
}

impl From<ProcessId> for nix::unistd::Pid {
    fn from(pid: ProcessId) -> Self {
        Self::from_raw(pid.0)
    }
}

/// How the build command terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Termination {
    /// Exited normally with the given code
    Exited(i32),
    /// Killed by the given signal number
    Signaled(i32),
}

impl Termination {
    /// Terminating signal, if the command was killed
    #[must_use]
    pub const fn signal(self) -> Option<i32> {
        match self {
            Self::Exited(_) => None,
            Self::Signaled(signal) => Some(signal),
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Outcome of one supervised build command
///
/// A non-zero exit is still a successful run of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// How the child terminated
    pub termination: Termination,
    /// Wall-clock time from launch to termination
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl RunResult {
    /// Create a run result
    #[must_use]
    pub const fn new(termination: Termination, duration: Duration) -> Self {
        Self {
            termination,
            duration,
        }
    }

    /// Shell-style status of the command
    ///
    /// Mirrors the child's code on normal exit; encodes a terminating signal
    /// as `128 + signal`. Only a fallback for callers that cannot die from
    /// the signal themselves: `128 + n` is also a valid exit code.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self.termination {
            Termination::Exited(code) => code,
            Termination::Signaled(signal) => SIGNAL_EXIT_OFFSET + signal,
        }
    }

    /// Whether the build command exited with status zero
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.termination, Termination::Exited(0))
    }
}

/// Everything the caller learns about a completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Child outcome
    pub result: RunResult,
    /// Problems encountered while tearing down
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<TeardownWarning>,
}

impl RunReport {
    /// Exit status for the runtime process
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.result.exit_code()
    }
}

// Duration serialization as milliseconds
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
