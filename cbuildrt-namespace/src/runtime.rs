//! One complete run: plan, namespaces, mounts, launch, supervision, teardown
//!
//! Process layout of a run:
//! - the caller validates, plans, locks the root and watches the run process
//! - the run process enters the namespaces, mounts and unwinds the plan
//! - the init (PID 1) relays signals, reaps orphans and reports the command
//! - the build command

#![allow(unsafe_code)]

use cbuildrt_core::{Error, ErrorReport, ProcessId, Result, RunReport};
use cbuildrt_mount::{
    ContainerRoot, Essentials, LinuxBackend, MountBackend, MountHandle, MountPlan,
    MountPlanBuilder, MountSpec, Teardown, TeardownReport,
};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, fork};
use std::io;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NamespaceConfig;
use crate::launcher::ChildSpec;
use crate::manager::NamespaceSet;
use crate::session::{self, SessionReport};
use crate::supervisor::{BlockedSignals, Supervisor};

/// Where the new root lives on the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RootSpec {
    /// Fresh directory under the temp dir, removed after the run
    #[default]
    Scratch,
    /// Caller-supplied directory (created and removed if absent)
    Path(PathBuf),
}

/// Fully validated input of one run
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Declared mounts, in declaration order
    pub mounts: Vec<MountSpec>,
    /// Implicit mounts added to the plan
    pub essentials: Essentials,
    /// Host location of the root
    pub root: RootSpec,
    /// Remount the root read-only once every mount is in place
    pub root_read_only: bool,
    /// Namespaces to create
    pub namespaces: NamespaceConfig,
    /// Build command
    pub child: ChildSpec,
}

impl RunSpec {
    /// Run `child` with default essentials in a read-only scratch root
    #[must_use]
    pub fn new(child: ChildSpec, namespaces: NamespaceConfig) -> Self {
        Self {
            mounts: Vec::new(),
            essentials: Essentials::default(),
            root: RootSpec::Scratch,
            root_read_only: true,
            namespaces,
            child,
        }
    }

    /// Add a mount declaration
    #[must_use]
    pub fn mount(mut self, spec: MountSpec) -> Self {
        self.mounts.push(spec);
        self
    }

    /// Check everything that can be checked without touching the host
    ///
    /// # Errors
    /// [`Error::InvalidConfig`] for inconsistent namespace or child settings
    pub fn validate(&self) -> Result<()> {
        self.namespaces.validate()?;
        self.child.validate()?;

        if !self.namespaces.maps_identity(self.child.uid(), self.child.gid()) {
            return Err(Error::invalid_config(format!(
                "uid {} / gid {} is not mapped into the user namespace",
                self.child.uid(),
                self.child.gid()
            )));
        }
        if let RootSpec::Path(path) = &self.root {
            if !path.is_absolute() {
                return Err(Error::invalid_config(format!(
                    "root {} is not absolute",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Runs build commands through a mount backend
///
/// Namespaces are entered by a forked run process, so the caller's own
/// namespaces are the same before and after [`Runtime::run`] and a runtime
/// can be used for any number of runs. The calling thread's signal mask is
/// changed for the duration of a run.
#[derive(Debug, Default)]
pub struct Runtime<B: MountBackend = LinuxBackend> {
    backend: B,
}

impl Runtime<LinuxBackend> {
    /// Runtime issuing real mount syscalls
    #[must_use]
    pub const fn new() -> Self {
        Self {
            backend: LinuxBackend,
        }
    }
}

impl<B: MountBackend> Runtime<B> {
    /// Runtime over a custom backend
    pub const fn with_backend(backend: B) -> Self {
        Self { backend }
    }

    /// Execute one run to completion
    ///
    /// Teardown has always finished when this returns, whether the run
    /// succeeded or not. A build command exiting non-zero is an `Ok`.
    ///
    /// # Errors
    /// Any setup failure: invalid input is rejected before the host is
    /// touched; later failures are reported after teardown.
    pub fn run(&self, spec: RunSpec) -> Result<RunReport> {
        spec.validate()?;
        let plan = MountPlanBuilder::new()
            .essentials(spec.essentials)
            .mounts(spec.mounts.iter().cloned())
            .build()?;
        info!(mounts = plan.len(), "Mount plan ready");

        let root = match &spec.root {
            RootSpec::Scratch => ContainerRoot::scratch(spec.root_read_only)?,
            RootSpec::Path(path) => ContainerRoot::acquire(path, spec.root_read_only)?,
        };
        info!(root = %root.path().display(), ephemeral = root.is_ephemeral(), "Container root acquired");

        let mut ctx = RunContext::new(&self.backend, root);
        ctx.signals = Some(BlockedSignals::block()?);
        let mut supervisor = Supervisor::new()?;

        let session = spawn_session(&mut ctx, &mut supervisor, &plan, &spec);
        if let Ok(SessionReport {
            outcome: Ok(result),
            ..
        }) = &session
        {
            supervisor.conclude(result.termination);
        }

        supervisor.finalizing();
        let (outcome, mut warnings, released) = match session {
            Ok(session) => {
                ctx.mounts_detached = session.failed_unmounts == 0;
                (
                    session.outcome.map_err(ErrorReport::into_error),
                    session.warnings,
                    session.released,
                )
            }
            Err(e) => (Err(e), Vec::new(), 0),
        };
        let teardown = ctx.finalize();
        warnings.extend(teardown.warnings);
        supervisor.done(released, warnings.len());

        let result = outcome?;
        info!(result = %result.termination, "Run finished");
        Ok(RunReport { result, warnings })
    }
}

/// Fork the run process and wait for its report
fn spawn_session<B: MountBackend>(
    ctx: &mut RunContext<'_, B>,
    supervisor: &mut Supervisor,
    plan: &MountPlan,
    spec: &RunSpec,
) -> Result<SessionReport> {
    let Some(root) = ctx.root.as_ref() else {
        return Err(Error::invalid_config("container root already released"));
    };
    let saved_mask = ctx
        .signals
        .as_ref()
        .map_or_else(SigSet::empty, BlockedSignals::saved);
    let (mut reader, writer) = io::pipe()?;

    // SAFETY: the child is single-threaded after fork, enters namespaces,
    // and leaves through _exit without returning into the caller
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(reader);
            session::enter(ctx.backend, plan, root, spec, saved_mask, writer)
        }
        Ok(ForkResult::Parent { child }) => {
            let started = Instant::now();
            drop(writer);
            let pid = ProcessId::from(child);
            ctx.child = Some(pid);
            supervisor.running();
            debug!(pid = %pid, "Run process started");

            let data = supervisor.watch(pid, &mut reader)?;
            let status = Supervisor::reap_peer(pid)?;
            ctx.child = None;
            SessionReport::decode(&data, status, supervisor.escalated(), started.elapsed())
        }
        Err(e) => Err(Error::System(e)),
    }
}

/// Every resource a run holds, released exactly once
///
/// Fields are filled in as each resource is acquired. [`RunContext::finalize`]
/// releases them in reverse; dropping an unfinalized context does the same.
/// The caller's context owns the root and the run process; the run
/// process's context owns the mounts, namespaces and the init.
#[derive(Debug)]
pub struct RunContext<'b, B: MountBackend> {
    pub(crate) backend: &'b B,
    pub(crate) root: Option<ContainerRoot>,
    pub(crate) handle: Option<MountHandle>,
    pub(crate) namespaces: Option<NamespaceSet>,
    pub(crate) child: Option<ProcessId>,
    pub(crate) signals: Option<BlockedSignals>,
    pub(crate) mounts_detached: bool,
    finalized: bool,
}

impl<'b, B: MountBackend> RunContext<'b, B> {
    /// Context owning `root`
    pub fn new(backend: &'b B, root: ContainerRoot) -> Self {
        let mut ctx = Self::detached(backend);
        ctx.root = Some(root);
        ctx
    }

    /// Context without a root
    pub(crate) const fn detached(backend: &'b B) -> Self {
        Self {
            backend,
            root: None,
            handle: None,
            namespaces: None,
            child: None,
            signals: None,
            mounts_detached: true,
            finalized: false,
        }
    }

    /// Whether [`RunContext::finalize`] already ran
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Release everything: child, mounts, root, namespaces, signal mask
    ///
    /// Later calls return an empty report.
    pub fn finalize(&mut self) -> TeardownReport {
        if self.finalized {
            return TeardownReport::default();
        }
        self.finalized = true;

        if let Some(pid) = self.child.take() {
            warn!(pid = %pid, "Killing process left running");
            match kill(pid.as_nix_pid(), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid = %pid, error = %e, "Could not kill process"),
            }
            if let Err(e) = waitpid(pid.as_nix_pid(), None) {
                debug!(pid = %pid, error = %e, "Could not reap process");
            }
        }

        let teardown = Teardown::new(self.backend);
        let report = match (self.handle.take(), self.root.take()) {
            (Some(handle), Some(root)) => teardown.finish(handle, root),
            (Some(handle), None) => teardown.unwind(handle),
            (None, Some(root)) => TeardownReport {
                warnings: teardown.release_root(root, self.mounts_detached),
                ..TeardownReport::default()
            },
            (None, None) => TeardownReport::default(),
        };

        if let Some(namespaces) = self.namespaces.take() {
            let released = namespaces.release();
            debug!(released, "Closed namespace descriptors");
        }
        drop(self.signals.take());

        for warning in &report.warnings {
            warn!(%warning, "Teardown warning");
        }
        report
    }
}

impl<B: MountBackend> Drop for RunContext<'_, B> {
    fn drop(&mut self) {
        if !self.finalized {
            warn!("Run context dropped without finalize");
            self.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdMap;
    use cbuildrt_mount::{MockBackend, MountExecutor, MountOp};

    fn mapped() -> NamespaceConfig {
        NamespaceConfig::new().with_maps(IdMap::single(0, 1000), IdMap::single(0, 1000))
    }

    #[test]
    fn test_run_spec_validation() {
        let spec = RunSpec::new(ChildSpec::new(["true"]), mapped());
        assert!(spec.validate().is_ok());

        let unmapped = RunSpec::new(ChildSpec::new(["true"]).identity(1000, 1000), mapped());
        assert!(unmapped.validate().unwrap_err().is_validation());

        let mut relative = RunSpec::new(ChildSpec::new(["true"]), mapped());
        relative.root = RootSpec::Path(PathBuf::from("rootfs"));
        assert!(relative.validate().is_err());
    }

    #[test]
    fn test_invalid_run_touches_nothing() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("root");
        let src = tempfile::tempdir().unwrap();

        let mut spec = RunSpec::new(ChildSpec::new(["true"]), mapped())
            .mount(MountSpec::bind(src.path(), "/input"))
            .mount(MountSpec::bind(src.path(), "/input"));
        spec.root = RootSpec::Path(root.clone());

        let backend = MockBackend::new();
        let err = Runtime::with_backend(backend.clone()).run(spec).unwrap_err();

        assert!(matches!(err, Error::InvalidMountSpec { .. }));
        assert!(!root.exists());
        assert!(backend.ops().is_empty());
    }

    #[test]
    fn test_context_finalizes_mounts_and_root() {
        let parent = tempfile::tempdir().unwrap();
        let path = parent.path().join("root");
        let root = ContainerRoot::acquire(&path, false).unwrap();
        let plan = MountPlanBuilder::new()
            .essentials(Essentials::none())
            .mount(MountSpec::tmpfs("/tmp"))
            .build()
            .unwrap();

        let backend = MockBackend::new();
        let handle = MountExecutor::new(&backend).execute(&plan, &root).unwrap();

        let mut ctx = RunContext::new(&backend, root);
        ctx.handle = Some(handle);
        let report = ctx.finalize();

        assert!(report.is_clean());
        assert!(backend.mounted().is_empty());
        assert!(!path.exists());
        assert!(ctx.is_finalized());
        assert!(ctx.finalize().reversed.is_empty());
    }

    #[test]
    fn test_dropped_context_still_tears_down() {
        let parent = tempfile::tempdir().unwrap();
        let path = parent.path().join("root");
        let backend = MockBackend::new();

        {
            let root = ContainerRoot::acquire(&path, false).unwrap();
            let plan = MountPlanBuilder::new()
                .essentials(Essentials::none())
                .mount(MountSpec::tmpfs("/work"))
                .build()
                .unwrap();
            let handle = MountExecutor::new(&backend).execute(&plan, &root).unwrap();
            let mut ctx = RunContext::new(&backend, root);
            ctx.handle = Some(handle);
        }

        assert!(backend.mounted().is_empty());
        assert!(
            backend
                .ops()
                .iter()
                .any(|op| matches!(op, MountOp::Unmount { .. }))
        );
        assert!(!path.exists());
    }

    #[test]
    fn test_context_reaps_leftover_child() {
        let backend = MockBackend::new();
        let root = ContainerRoot::scratch(false).unwrap();
        let path = root.path().to_path_buf();

        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        #[allow(clippy::cast_possible_wrap)]
        let pid = ProcessId::from_raw(child.id() as i32);

        let mut ctx = RunContext::new(&backend, root);
        ctx.child = Some(pid);
        ctx.finalize();

        // Reaped: the pid no longer refers to our child
        assert!(waitpid(pid.as_nix_pid(), None).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_root_kept_when_run_process_left_mounts() {
        let backend = MockBackend::new();
        let root = ContainerRoot::scratch(false).unwrap();
        let path = root.path().to_path_buf();

        let mut ctx = RunContext::new(&backend, root);
        ctx.mounts_detached = false;
        let report = ctx.finalize();

        assert_eq!(report.warnings.len(), 1);
        assert!(path.exists());
        std::fs::remove_dir(&path).unwrap();
    }

    #[test]
    fn test_runs_leave_caller_namespaces_untouched() {
        let before = crate::NamespaceInfo::current();

        for _ in 0..2 {
            let mut spec = RunSpec::new(
                ChildSpec::new(["true"]),
                NamespaceConfig::new().with_identity(0, 0),
            );
            spec.essentials = Essentials::none();

            // Mock mounts leave nothing to pivot into, so setup fails in the
            // run process after it entered its namespaces (or was refused)
            let err = Runtime::with_backend(MockBackend::new()).run(spec).unwrap_err();
            assert!(
                matches!(
                    err,
                    Error::NamespaceUnavailable { .. } | Error::MountFailed { .. }
                ),
                "unexpected error: {err}"
            );
        }

        let after = crate::NamespaceInfo::current();
        assert_eq!(before.user, after.user);
        assert_eq!(before.mnt, after.mnt);
        assert_eq!(before.pid, after.pid);
        assert_eq!(before.net, after.net);
    }
}
