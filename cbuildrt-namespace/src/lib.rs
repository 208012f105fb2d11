//! Namespace setup, process launch and supervision for one build run
//!
//! This crate drives a run inside Linux namespaces:
//! - User namespace - unprivileged mounting through a single id mapping
//! - Mount namespace - private mount table and root switch
//! - PID namespace - a small init runs as PID 1 and relays signals
//! - Network namespace - optional, denies network access
//!
//! [`Runtime::run`] ties the pieces together in a forked run process and
//! always tears down what it set up before returning.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod config;
pub mod launcher;
pub mod manager;
pub mod runtime;
mod session;
pub mod supervisor;

pub use config::{IdMap, NamespaceConfig};
pub use launcher::{ChildSpec, FALLBACK_PATH, LaunchStage, Launched, Launcher, search_candidates};
pub use manager::{NamespaceInfo, NamespaceManager, NamespaceSet};
pub use runtime::{RootSpec, RunContext, RunSpec, Runtime};
pub use supervisor::{BlockedSignals, ESCALATE_AFTER, Supervisor, SupervisorState};

// Re-export commonly used types
pub use cbuildrt_core::{Error, Result, RunReport, RunResult, Termination};
