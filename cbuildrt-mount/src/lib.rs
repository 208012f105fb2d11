//! Mount planning, execution and teardown with pluggable backends
//!
//! This crate turns mount declarations into a validated [`MountPlan`],
//! realizes it below a locked [`ContainerRoot`] through a [`MountBackend`],
//! and reverses every recorded change with [`Teardown`].

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod dev;
pub mod executor;
pub mod handle;
pub mod plan;
pub mod root;
pub mod spec;
pub mod teardown;

pub use backend::{LinuxBackend, MockBackend, MountBackend, MountOp};
pub use executor::MountExecutor;
pub use handle::{HandleEntry, MountHandle};
pub use plan::{Essentials, MountPlan, MountPlanBuilder};
pub use root::ContainerRoot;
pub use spec::{MountKind, MountMode, MountSpec};
pub use teardown::{Teardown, TeardownReport};

// Re-export commonly used types
pub use cbuildrt_core::{Error, Result, TeardownWarning};
