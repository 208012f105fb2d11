//! The run process: the forked child that owns a run's namespaces
//!
//! [`Runtime::run`](crate::Runtime::run) forks this process so the caller's
//! own namespaces never change. The run process enters the configured
//! namespaces, realizes the mount plan, launches the init, waits for it and
//! unwinds its mounts. It then writes a [`SessionReport`] to the caller and
//! exits; its mount namespace disappears with it.

use cbuildrt_core::{
    Error, ErrorReport, RUNTIME_FAILURE_EXIT_CODE, Result, RunResult, TeardownWarning, Termination,
};
use cbuildrt_mount::{ContainerRoot, MountBackend, MountExecutor, MountPlan};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::wait::WaitStatus;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error};

use crate::launcher::{Launcher, exit_now};
use crate::manager::NamespaceManager;
use crate::runtime::{RunContext, RunSpec};
use crate::supervisor::Supervisor;

/// What the run process sends back before exiting
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SessionReport {
    /// Build command result, or the setup error
    pub outcome: std::result::Result<RunResult, ErrorReport>,
    /// Handle entries reversed without a warning
    pub released: usize,
    /// Teardown problems inside the run's mount namespace
    #[serde(default)]
    pub warnings: Vec<TeardownWarning>,
    /// Mounts that could not be detached
    pub failed_unmounts: usize,
}

impl SessionReport {
    /// Interpret what a run process wrote before it exited with `status`
    ///
    /// A run process killed by an escalated cancellation cannot report; the
    /// build command died with it.
    pub(crate) fn decode(
        data: &[u8],
        status: WaitStatus,
        escalated: bool,
        elapsed: Duration,
    ) -> Result<Self> {
        if !data.is_empty() {
            return serde_json::from_slice(data).map_err(|e| {
                Error::Io(io::Error::other(format!("unreadable run report: {e}")))
            });
        }

        match status {
            WaitStatus::Signaled(_, Signal::SIGKILL, _) if escalated => Ok(Self {
                outcome: Ok(RunResult::new(
                    Termination::Signaled(Signal::SIGKILL as i32),
                    elapsed,
                )),
                released: 0,
                warnings: Vec::new(),
                failed_unmounts: 0,
            }),
            other => Err(Error::Io(io::Error::other(format!(
                "run process ended without a report ({other:?})"
            )))),
        }
    }
}

/// Body of the run process; never returns
pub(crate) fn enter<B: MountBackend>(
    backend: &B,
    plan: &MountPlan,
    root: &ContainerRoot,
    spec: &RunSpec,
    saved_mask: SigSet,
    mut report: io::PipeWriter,
) -> ! {
    let Ok(session) = panic::catch_unwind(AssertUnwindSafe(|| {
        run(backend, plan, root, spec, saved_mask)
    })) else {
        exit_now(RUNTIME_FAILURE_EXIT_CODE)
    };

    match serde_json::to_vec(&session) {
        Ok(bytes) => {
            if let Err(e) = report.write_all(&bytes) {
                error!(error = %e, "Could not send run report");
            }
        }
        Err(e) => error!(error = %e, "Could not encode run report"),
    }
    drop(report);
    // The caller owns the root lock; no destructor may run here
    exit_now(0)
}

fn run<B: MountBackend>(
    backend: &B,
    plan: &MountPlan,
    root: &ContainerRoot,
    spec: &RunSpec,
    saved_mask: SigSet,
) -> SessionReport {
    let mut ctx = RunContext::detached(backend);
    let outcome = drive(&mut ctx, plan, root, spec, saved_mask);
    let teardown = ctx.finalize();
    debug!(
        reversed = teardown.reversed.len(),
        failed_unmounts = teardown.failed_unmounts,
        "Run process teardown finished"
    );

    SessionReport {
        outcome: outcome.map_err(|e| ErrorReport::from(&e)),
        released: teardown.released(),
        failed_unmounts: teardown.failed_unmounts,
        warnings: teardown.warnings,
    }
}

fn drive<B: MountBackend>(
    ctx: &mut RunContext<'_, B>,
    plan: &MountPlan,
    root: &ContainerRoot,
    spec: &RunSpec,
    saved_mask: SigSet,
) -> Result<RunResult> {
    let mut relay = Supervisor::relay()?;
    let backend = ctx.backend;

    ctx.namespaces = Some(NamespaceManager::new(spec.namespaces.clone()).enter(backend)?);
    ctx.handle = Some(MountExecutor::new(backend).execute(plan, root)?);

    let launched = Launcher::new(backend, plan, root.path())
        .fresh_procfs(spec.namespaces.use_pid_ns)
        .clear_groups(!spec.namespaces.use_user_ns)
        .signal_mask(saved_mask)
        .launch(spec.child.clone())?;
    ctx.child = Some(launched.pid());

    if spec.namespaces.use_pid_ns {
        if let Some(namespaces) = ctx.namespaces.as_mut() {
            namespaces.hold_pid(launched.pid())?;
        }
    }

    let result = relay.wait_init(launched)?;
    ctx.child = None;
    Ok(result)
}
