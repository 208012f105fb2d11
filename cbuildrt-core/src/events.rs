//! Run lifecycle events with structured tracing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

use crate::ProcessId;
use crate::types::duration_serde;

/// Events emitted while a build command is launched and supervised
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Child replaced its image with the build command
    Launched {
        /// Child PID (as seen from the runtime)
        pid: ProcessId,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// A cancellation signal was forwarded to the child
    SignalForwarded {
        /// Child PID
        pid: ProcessId,
        /// Signal received by the runtime
        received: i32,
        /// Signal actually delivered to the child
        delivered: i32,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Child exited normally
    Exited {
        /// Child PID
        pid: ProcessId,
        /// Exit code
        exit_code: i32,
        /// Time since launch
        #[serde(with = "duration_serde")]
        duration: Duration,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// Child was killed by a signal
    Signaled {
        /// Child PID
        pid: ProcessId,
        /// Signal number
        signal: i32,
        /// Time since launch
        #[serde(with = "duration_serde")]
        duration: Duration,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// All run resources were released
    TeardownFinished {
        /// Number of handle entries reversed
        released: usize,
        /// Number of non-fatal warnings
        warnings: usize,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },
}

impl RunEvent {
    /// Get the timestamp from any event
    #[must_use]
    pub const fn timestamp(&self) -> SystemTime {
        match self {
            Self::Launched { timestamp, .. }
            | Self::SignalForwarded { timestamp, .. }
            | Self::Exited { timestamp, .. }
            | Self::Signaled { timestamp, .. }
            | Self::TeardownFinished { timestamp, .. } => *timestamp,
        }
    }

    /// Whether the event marks the end of the child process
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Signaled { .. })
    }

    /// Emit structured tracing event
    pub fn emit_trace(&self) {
        match self {
            Self::Launched { pid, .. } => {
                tracing::info!(pid = %pid, event = "launched", "Build command launched");
            }
            Self::SignalForwarded {
                pid,
                received,
                delivered,
                ..
            } => {
                tracing::warn!(
                    pid = %pid,
                    received,
                    delivered,
                    event = "signal_forwarded",
                    "Forwarded signal to build command"
                );
            }
            Self::Exited {
                pid,
                exit_code,
                duration,
                ..
            } => {
                tracing::info!(
                    pid = %pid,
                    exit_code,
                    duration_ms = duration.as_millis(),
                    event = "exited",
                    "Build command exited"
                );
            }
            Self::Signaled {
                pid,
                signal,
                duration,
                ..
            } => {
                tracing::warn!(
                    pid = %pid,
                    signal,
                    duration_ms = duration.as_millis(),
                    event = "signaled",
                    "Build command killed by signal"
                );
            }
            Self::TeardownFinished {
                released, warnings, ..
            } => {
                if *warnings == 0 {
                    tracing::debug!(released, event = "teardown_finished", "Teardown complete");
                } else {
                    tracing::warn!(
                        released,
                        warnings,
                        event = "teardown_finished",
                        "Teardown complete with warnings"
                    );
                }
            }
        }
    }
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launched { pid, .. } => write!(f, "Build command launched as PID {pid}"),
            Self::SignalForwarded {
                received,
                delivered,
                ..
            } => write!(f, "Signal {received} forwarded as {delivered}"),
            Self::Exited { exit_code, .. } => write!(f, "Build command exited with code {exit_code}"),
            Self::Signaled { signal, .. } => write!(f, "Build command killed by signal {signal}"),
            Self::TeardownFinished {
                released, warnings, ..
            } => write!(f, "Teardown released {released} entries ({warnings} warnings)"),
        }
    }
}

// Custom SystemTime serialization
mod systemtime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(since_epoch.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + std::time::Duration::from_secs(secs))
    }
}
