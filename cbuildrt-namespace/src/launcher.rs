//! Process launch inside the prepared namespaces
//!
//! This module uses `unsafe` for fork() which is inherently unsafe
//! but necessary for proper PID namespace isolation.
//!
//! The launcher forks an init process that becomes PID 1 of the new PID
//! namespace, switches into the container root and forks the build command.
//! The init stays behind to relay signals, reap orphans and report the
//! command's termination over a status pipe.
//!
//! Both processes report any failure before `execve` over a close-on-exec
//! pipe; end-of-file on that pipe without data means the build command is
//! running.

#![allow(unsafe_code)]

use cbuildrt_core::{Error, ProcessId, Result};
use cbuildrt_mount::{MountBackend, MountExecutor, MountPlan};
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::sys::prctl::set_pdeathsig;
use nix::sys::signal::{SigHandler, SigSet, Signal, signal};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Gid, Uid, chdir, execve, fork, pivot_root, setgid, setgroups, setuid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::ffi::{CStr, CString};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::supervisor::Supervisor;

/// Search path used when the environment declares no `PATH`
pub const FALLBACK_PATH: &str = "/usr/bin:/bin";

/// Exit status of a child that failed before `execve`
const SETUP_FAILURE_STATUS: i32 = 127;

/// Interpreter for executables the kernel cannot load (`ENOEXEC`)
const SCRIPT_SHELL: &CStr = c"/bin/sh";

/// Everything needed to start the build command
///
/// Immutable once built and consumed by [`Launcher::launch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpec {
    executable_path: String,
    argv: Vec<String>,
    envp: BTreeMap<String, String>,
    working_dir: PathBuf,
    uid: u32,
    gid: u32,
}

impl ChildSpec {
    /// Command line whose first element names the executable
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        Self {
            executable_path: argv.first().cloned().unwrap_or_default(),
            argv,
            envp: BTreeMap::new(),
            working_dir: PathBuf::from("/"),
            uid: 0,
            gid: 0,
        }
    }

    /// Execute `path` instead of `argv[0]`
    #[must_use]
    pub fn executable(mut self, path: impl Into<String>) -> Self {
        self.executable_path = path.into();
        self
    }

    /// Add one environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envp.insert(key.into(), value.into());
        self
    }

    /// Add several environment variables
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.envp
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Working directory inside the container
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Identity the command runs as (inside the user namespace)
    #[must_use]
    pub const fn identity(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Executable as requested (bare name or path)
    #[must_use]
    pub fn executable_path(&self) -> &str {
        &self.executable_path
    }

    /// Full argument vector
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The complete environment of the command
    #[must_use]
    pub const fn envp(&self) -> &BTreeMap<String, String> {
        &self.envp
    }

    /// Working directory inside the container
    #[must_use]
    pub fn working_dir_path(&self) -> &Path {
        &self.working_dir
    }

    /// Target uid
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// Target gid
    #[must_use]
    pub const fn gid(&self) -> u32 {
        self.gid
    }

    /// Reject specs that can never be executed
    ///
    /// # Errors
    /// [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.argv.is_empty() {
            return Err(Error::invalid_config("command must not be empty"));
        }
        if self.executable_path.is_empty() {
            return Err(Error::invalid_config("executable path must not be empty"));
        }
        if !self.working_dir.is_absolute() {
            return Err(Error::invalid_config(format!(
                "working directory {} must be absolute",
                self.working_dir.display()
            )));
        }
        if let Some(key) = self
            .envp
            .keys()
            .find(|k| k.is_empty() || k.contains('='))
        {
            return Err(Error::invalid_config(format!(
                "invalid environment variable name {key:?}"
            )));
        }
        Ok(())
    }
}

/// Paths tried, in order, when executing `program`
///
/// A name containing `/` is used as-is; a bare name is looked up in every
/// entry of `path_var` (an empty entry means the working directory).
#[must_use]
pub fn search_candidates(program: &str, path_var: Option<&str>) -> Vec<PathBuf> {
    if program.contains('/') {
        return vec![PathBuf::from(program)];
    }

    path_var
        .unwrap_or(FALLBACK_PATH)
        .split(':')
        .map(|dir| if dir.is_empty() { "." } else { dir })
        .map(|dir| Path::new(dir).join(program))
        .collect()
}

/// Strings handed to `execve`, converted before forking
struct PreparedExec {
    program: String,
    candidates: Vec<CString>,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl PreparedExec {
    fn new(spec: &ChildSpec) -> Result<Self> {
        let to_c = |s: String| {
            CString::new(s).map_err(|e| Error::invalid_config(format!("NUL byte in command: {e}")))
        };

        let path_var = spec.envp.get("PATH").map(String::as_str);
        let candidates = search_candidates(&spec.executable_path, path_var)
            .into_iter()
            .map(|p| to_c(p.to_string_lossy().into_owned()))
            .collect::<Result<Vec<_>>>()?;
        let argv = spec
            .argv
            .iter()
            .cloned()
            .map(to_c)
            .collect::<Result<Vec<_>>>()?;
        let envp = spec
            .envp
            .iter()
            .map(|(k, v)| to_c(format!("{k}={v}")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            program: spec.executable_path.clone(),
            candidates,
            argv,
            envp,
        })
    }

    /// Try every candidate like `execvpe`; returns only on failure
    fn execute(&self) -> LaunchFailure {
        let mut denied = false;
        let mut last = Errno::ENOENT;

        for candidate in &self.candidates {
            let errno = match execve(candidate, &self.argv, &self.envp) {
                Ok(never) => match never {},
                Err(errno) => errno,
            };
            match errno {
                Errno::ENOENT | Errno::ENOTDIR => last = errno,
                Errno::EACCES => denied = true,
                // No interpreter line: run it as a shell script
                Errno::ENOEXEC => return self.execute_script(candidate),
                other => return LaunchFailure::new(LaunchStage::Exec, &self.program, other),
            }
        }

        let errno = if denied { Errno::EACCES } else { last };
        let mut failure = LaunchFailure::new(LaunchStage::Exec, &self.program, errno);
        if errno == Errno::ENOENT && !self.program.contains('/') {
            failure.message = "command not found in PATH".to_string();
        }
        failure
    }

    fn execute_script(&self, script: &CStr) -> LaunchFailure {
        let errno = match execve(SCRIPT_SHELL, &self.script_argv(script), &self.envp) {
            Ok(never) => match never {},
            Err(errno) => errno,
        };
        LaunchFailure::new(LaunchStage::Exec, SCRIPT_SHELL.to_string_lossy(), errno)
    }

    /// `sh <script> <args...>`, keeping the original arguments after `argv[0]`
    fn script_argv(&self, script: &CStr) -> Vec<CString> {
        let mut argv = Vec::with_capacity(self.argv.len() + 1);
        argv.push(SCRIPT_SHELL.to_owned());
        argv.push(script.to_owned());
        argv.extend(self.argv.iter().skip(1).cloned());
        argv
    }
}

/// Step of the child setup that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStage {
    /// Creating the child's own mount namespace
    MountNamespace,
    /// Mounting procfs inside the PID namespace
    ProcMount,
    /// Switching into the container root
    PivotRoot,
    /// Entering the working directory
    WorkingDirectory,
    /// Restoring signal state
    Signals,
    /// Dropping to the configured uid/gid
    Identity,
    /// Arming the parent-death signal
    ParentDeath,
    /// Replacing the process image
    Exec,
    /// Running the init that supervises the command
    Init,
}

/// Failure report sent from the child to the parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchFailure {
    /// Failed step
    pub stage: LaunchStage,
    /// Path or operation the step acted on
    pub target: String,
    /// Raw errno
    pub errno: i32,
    /// Human-readable description
    pub message: String,
}

impl LaunchFailure {
    fn new(stage: LaunchStage, target: impl Into<String>, errno: Errno) -> Self {
        Self {
            stage,
            target: target.into(),
            errno: errno as i32,
            message: errno.desc().to_string(),
        }
    }

    fn from_error(stage: LaunchStage, target: impl Into<String>, err: &Error) -> Self {
        let errno = match err {
            Error::MountFailed { source, .. } | Error::Io(source) => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
            Error::System(errno) => *errno as i32,
            _ => libc::EIO,
        };
        Self {
            stage,
            target: target.into(),
            errno,
            message: err.to_string(),
        }
    }

    /// Convert into the runtime error the caller sees
    #[must_use]
    pub fn into_error(self) -> Error {
        let os_error = || io::Error::from_raw_os_error(self.errno);
        match self.stage {
            LaunchStage::MountNamespace => Error::NamespaceUnavailable {
                operation: self.target,
                source: Errno::from_raw(self.errno),
            },
            LaunchStage::ProcMount | LaunchStage::PivotRoot => Error::MountFailed {
                spec: self.target.clone(),
                source: os_error(),
            },
            LaunchStage::WorkingDirectory => Error::InvalidWorkingDirectory {
                path: PathBuf::from(&self.target),
                source: os_error(),
            },
            LaunchStage::Exec => Error::ExecFailed {
                program: self.target,
                message: self.message,
            },
            LaunchStage::Signals
            | LaunchStage::Identity
            | LaunchStage::ParentDeath
            | LaunchStage::Init => {
                Error::System(Errno::from_raw(self.errno))
            }
        }
    }
}

/// A running build command under its init
#[derive(Debug)]
pub struct Launched {
    pid: ProcessId,
    started: Instant,
    status: io::PipeReader,
}

impl Launched {
    /// PID of the init as seen from the launching process
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    /// When the init was forked
    #[must_use]
    pub const fn started(&self) -> Instant {
        self.started
    }

    pub(crate) fn into_parts(self) -> (ProcessId, Instant, io::PipeReader) {
        (self.pid, self.started, self.status)
    }
}

/// Forks the build command into the prepared root
#[derive(Debug)]
pub struct Launcher<'a, B: MountBackend> {
    backend: &'a B,
    plan: &'a MountPlan,
    root: &'a Path,
    fresh_procfs: bool,
    clear_groups: bool,
    signal_mask: SigSet,
}

impl<'a, B: MountBackend> Launcher<'a, B> {
    /// Launcher for a root prepared from `plan`
    pub fn new(backend: &'a B, plan: &'a MountPlan, root: &'a Path) -> Self {
        Self {
            backend,
            plan,
            root,
            fresh_procfs: true,
            clear_groups: false,
            signal_mask: SigSet::empty(),
        }
    }

    /// Mount a fresh procfs (PID namespace active) or bind the host one
    #[must_use]
    pub const fn fresh_procfs(mut self, fresh: bool) -> Self {
        self.fresh_procfs = fresh;
        self
    }

    /// Drop supplementary groups (only possible outside a user namespace)
    #[must_use]
    pub const fn clear_groups(mut self, clear: bool) -> Self {
        self.clear_groups = clear;
        self
    }

    /// Signal mask the command starts with
    #[must_use]
    pub const fn signal_mask(mut self, mask: SigSet) -> Self {
        self.signal_mask = mask;
        self
    }

    /// Fork the init, set the root up and exec the build command
    ///
    /// Returns once the command is running or a failure was reported; never
    /// both. The returned [`Launched`] must be waited for with
    /// [`Supervisor::wait_init`].
    ///
    /// # Errors
    /// - [`Error::InvalidConfig`] if `spec` is malformed (nothing forked)
    /// - [`Error::InvalidWorkingDirectory`], [`Error::ExecFailed`],
    ///   [`Error::MountFailed`] as reported by the init or the command
    pub fn launch(&self, spec: ChildSpec) -> Result<Launched> {
        spec.validate()?;
        let exec = PreparedExec::new(&spec)?;
        let (mut reader, writer) = io::pipe()?;
        let (status, status_writer) = io::pipe()?;

        debug!(program = %spec.executable_path, argv = ?spec.argv, "Forking init");

        // SAFETY: the run process is single-threaded; the child only issues
        // syscalls and leaves through execve or _exit
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(reader);
                drop(status);
                self.init_main(&spec, &exec, writer, status_writer)
            }
            Ok(ForkResult::Parent { child }) => {
                let started = Instant::now();
                drop(writer);
                drop(status_writer);

                let mut report = Vec::new();
                if let Err(e) = reader.read_to_end(&mut report) {
                    let _ = nix::sys::signal::kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, None);
                    return Err(e.into());
                }

                if report.is_empty() {
                    info!(pid = %child, program = %spec.executable_path, "Build command started");
                    return Ok(Launched {
                        pid: ProcessId::from(child),
                        started,
                        status,
                    });
                }

                // The init exits right after reporting or reaping the command
                let _ = waitpid(child, None);
                let failure = serde_json::from_slice::<LaunchFailure>(&report).unwrap_or_else(|e| {
                    LaunchFailure {
                        stage: LaunchStage::Exec,
                        target: spec.executable_path.clone(),
                        errno: libc::EIO,
                        message: format!("unreadable launch report: {e}"),
                    }
                });
                error!(
                    stage = ?failure.stage,
                    target = %failure.target,
                    message = %failure.message,
                    "Build command could not be started"
                );
                Err(failure.into_error())
            }
            Err(e) => Err(Error::System(e)),
        }
    }

    /// Body of the init process; never returns
    fn init_main(
        &self,
        spec: &ChildSpec,
        exec: &PreparedExec,
        writer: io::PipeWriter,
        mut status: io::PipeWriter,
    ) -> ! {
        if let Err(failure) = self.enter_container() {
            report_and_exit(writer, &failure);
        }
        let mut reaper = match Supervisor::relay() {
            Ok(reaper) => reaper,
            Err(e) => {
                let failure = LaunchFailure::from_error(LaunchStage::Init, "signalfd", &e);
                report_and_exit(writer, &failure)
            }
        };

        // SAFETY: the init is single-threaded
        let command = match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let failure = match self.command_setup(spec, exec) {
                    Ok(never) => match never {},
                    Err(failure) => failure,
                };
                report_and_exit(writer, &failure)
            }
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => report_and_exit(writer, &LaunchFailure::new(LaunchStage::Init, "fork", e)),
        };
        drop(writer);

        let code = match reaper.reap_as_init(ProcessId::from(command)) {
            Ok(termination) => {
                if let Ok(bytes) = serde_json::to_vec(&termination) {
                    let _ = status.write_all(&bytes);
                }
                0
            }
            Err(e) => {
                error!(error = %e, "Init lost track of the build command");
                SETUP_FAILURE_STATUS
            }
        };
        drop(status);
        exit_now(code)
    }

    /// Private mount table, procfs and root switch (runs in the init)
    fn enter_container(&self) -> std::result::Result<(), LaunchFailure> {
        // The init must not outlive the run process holding the mounts
        set_pdeathsig(Signal::SIGKILL)
            .map_err(|e| LaunchFailure::new(LaunchStage::ParentDeath, "PR_SET_PDEATHSIG", e))?;

        // pivot_root acts on the whole mount namespace; take a private copy
        unshare(CloneFlags::CLONE_NEWNS)
            .map_err(|e| LaunchFailure::new(LaunchStage::MountNamespace, "unshare(CLONE_NEWNS)", e))?;
        self.backend
            .make_private(Path::new("/"))
            .map_err(|e| LaunchFailure::new(LaunchStage::MountNamespace, "make / private", e))?;

        MountExecutor::new(self.backend)
            .mount_pid_scoped(self.plan, self.root, self.fresh_procfs)
            .map_err(|e| LaunchFailure::from_error(LaunchStage::ProcMount, "procfs", &e))?;

        enter_root(self.root)
    }

    /// Working directory, signal state and identity (runs in the command)
    fn command_setup(
        &self,
        spec: &ChildSpec,
        exec: &PreparedExec,
    ) -> std::result::Result<Infallible, LaunchFailure> {
        chdir(spec.working_dir_path()).map_err(|e| {
            LaunchFailure::new(
                LaunchStage::WorkingDirectory,
                spec.working_dir_path().to_string_lossy(),
                e,
            )
        })?;

        // SAFETY: restoring the default disposition installs no handler
        unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }
            .map_err(|e| LaunchFailure::new(LaunchStage::Signals, "SIGPIPE", e))?;
        self.signal_mask
            .thread_set_mask()
            .map_err(|e| LaunchFailure::new(LaunchStage::Signals, "sigprocmask", e))?;

        let gid = Gid::from_raw(spec.gid);
        if self.clear_groups {
            setgroups(&[gid]).map_err(|e| LaunchFailure::new(LaunchStage::Identity, "setgroups", e))?;
        }
        setgid(gid).map_err(|e| LaunchFailure::new(LaunchStage::Identity, "setgid", e))?;
        setuid(Uid::from_raw(spec.uid))
            .map_err(|e| LaunchFailure::new(LaunchStage::Identity, "setuid", e))?;

        // Cleared by credential changes, so armed last
        set_pdeathsig(Signal::SIGKILL)
            .map_err(|e| LaunchFailure::new(LaunchStage::ParentDeath, "PR_SET_PDEATHSIG", e))?;

        Err(exec.execute())
    }
}

/// Make `root` the process's `/` and detach the old root
fn enter_root(root: &Path) -> std::result::Result<(), LaunchFailure> {
    let target = root.to_string_lossy().into_owned();
    let fail = |errno| LaunchFailure::new(LaunchStage::PivotRoot, target.clone(), errno);

    chdir(root).map_err(fail)?;
    // Stacking the old root under the new one avoids a put_old directory
    pivot_root(".", ".").map_err(fail)?;
    umount2(".", MntFlags::MNT_DETACH).map_err(fail)?;
    chdir("/").map_err(fail)?;
    Ok(())
}

fn report_and_exit(mut writer: io::PipeWriter, failure: &LaunchFailure) -> ! {
    if let Ok(bytes) = serde_json::to_vec(failure) {
        let _ = writer.write_all(&bytes);
    }
    drop(writer);
    exit_now(SETUP_FAILURE_STATUS)
}

/// Leave a forked process without running destructors or atexit handlers
pub(crate) fn exit_now(code: i32) -> ! {
    // SAFETY: _exit only terminates the calling process
    unsafe { libc::_exit(code) }
}
