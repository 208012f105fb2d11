//! cbuildrt Core - Foundation types, errors, and lifecycle events
//!
//! This crate provides the abstractions shared by every stage of a run:
//! the error taxonomy, the run result handed back to the caller, and the
//! structured events emitted while a build command is supervised.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod events;
pub mod types;

pub use error::{Error, ErrorReport, Result, TeardownWarning};
pub use events::RunEvent;
pub use types::{ProcessId, RunReport, RunResult, Termination};

/// Exit status reported by the runtime itself when isolation could not be
/// set up (as opposed to the build command failing).
///
/// A build command may exit with the same code; the run report written on
/// request records which of the two happened.
pub const RUNTIME_FAILURE_EXIT_CODE: i32 = 125;

/// Offset added to a signal number to encode "killed by signal" as an exit status.
pub const SIGNAL_EXIT_OFFSET: i32 = 128;
