//! Supervision of the processes of a run
//!
//! Every supervisor polls one `signalfd` that delivers child state changes
//! (`SIGCHLD`) and cancellation requests (`SIGINT`, `SIGTERM`) as ordinary
//! reads, so each wait loop stays linear.

use cbuildrt_core::{Error, ProcessId, Result, RunEvent, RunResult, Termination};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::fmt;
use std::io::{self, PipeReader, Read};
use std::os::fd::AsFd;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::launcher::Launched;

/// Forwarded cancellation signals after which the run is killed outright
pub const ESCALATE_AFTER: u32 = 3;

/// Signals routed through the supervisor instead of default handlers
fn supervised_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// Supervised signals blocked for the calling thread
///
/// Must be created before the child is forked so no signal is lost; the
/// previous mask is restored on drop and handed to the child.
#[derive(Debug)]
pub struct BlockedSignals {
    saved: SigSet,
}

impl BlockedSignals {
    /// Block `SIGCHLD`, `SIGINT` and `SIGTERM`
    ///
    /// # Errors
    /// Returns error if the signal mask cannot be changed
    pub fn block() -> Result<Self> {
        let saved = supervised_signals().thread_swap_mask(SigmaskHow::SIG_BLOCK)?;
        debug!("Blocked supervised signals");
        Ok(Self { saved })
    }

    /// Mask in effect before blocking
    #[must_use]
    pub const fn saved(&self) -> SigSet {
        self.saved
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        if let Err(e) = self.saved.thread_set_mask() {
            warn!(error = %e, "Could not restore signal mask");
        }
    }
}

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Child not started yet
    Launching,
    /// Build command running
    Running,
    /// Child exited with a code
    Exited(i32),
    /// Child was killed by a signal
    Signaled(i32),
    /// Teardown in progress
    Finalizing,
    /// Everything released
    Done,
}

impl SupervisorState {
    /// Whether moving to `next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Launching, Self::Running | Self::Finalizing)
                | (Self::Running, Self::Exited(_) | Self::Signaled(_) | Self::Finalizing)
                | (Self::Exited(_) | Self::Signaled(_), Self::Finalizing)
                | (Self::Finalizing, Self::Done)
        )
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launching => write!(f, "launching"),
            Self::Running => write!(f, "running"),
            Self::Exited(code) => write!(f, "exited({code})"),
            Self::Signaled(signal) => write!(f, "signaled({signal})"),
            Self::Finalizing => write!(f, "finalizing"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Waits for a child process and forwards cancellation to it
///
/// Three processes of a run each hold one: the caller watches the run
/// process, the run process watches the init, and the init reaps the build
/// command. Only the caller's supervisor escalates.
#[derive(Debug)]
pub struct Supervisor {
    state: SupervisorState,
    signals: SignalFd,
    forwarded: u32,
    escalate: bool,
}

impl Supervisor {
    /// Create an escalating supervisor in the `Launching` state
    ///
    /// The supervised signals must already be blocked (see
    /// [`BlockedSignals`]).
    ///
    /// # Errors
    /// Returns error if the signal descriptor cannot be created
    pub fn new() -> Result<Self> {
        let signals = SignalFd::with_flags(
            &supervised_signals(),
            SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK,
        )?;
        Ok(Self {
            state: SupervisorState::Launching,
            signals,
            forwarded: 0,
            escalate: true,
        })
    }

    /// Supervisor that passes every signal on unchanged
    pub(crate) fn relay() -> Result<Self> {
        Ok(Self {
            escalate: false,
            ..Self::new()?
        })
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// Number of cancellation signals forwarded to the child
    #[must_use]
    pub const fn forwarded(&self) -> u32 {
        self.forwarded
    }

    /// Whether a cancellation was escalated to `SIGKILL`
    #[must_use]
    pub const fn escalated(&self) -> bool {
        self.escalate && self.forwarded >= ESCALATE_AFTER
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state.can_transition_to(next) {
            debug!(from = %self.state, to = %next, "Supervisor transition");
            self.state = next;
        } else {
            warn!(from = %self.state, to = %next, "Ignoring invalid supervisor transition");
        }
    }

    /// Enter `Running` once the child exists
    pub fn running(&mut self) {
        self.transition(SupervisorState::Running);
    }

    /// Record how the build command ended
    pub fn conclude(&mut self, termination: Termination) {
        self.transition(match termination {
            Termination::Exited(code) => SupervisorState::Exited(code),
            Termination::Signaled(signal) => SupervisorState::Signaled(signal),
        });
    }

    /// Read `reader` to end-of-file while forwarding cancellation to `peer`
    ///
    /// `peer` holds the write end, so end-of-file means it is exiting.
    /// Does not depend on `SIGCHLD` reaching this thread.
    ///
    /// # Errors
    /// Returns error if polling, reading the pipe or the signal descriptor fails
    pub fn watch(&mut self, peer: ProcessId, reader: &mut PipeReader) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];

        loop {
            let (signalled, readable) = self.poll(Some(&*reader))?;
            if signalled {
                self.drain_signals(peer)?;
            }
            if readable {
                match reader.read(&mut buf) {
                    Ok(0) => return Ok(data),
                    Ok(n) => data.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    /// Block until `pid` has exited and collect its status
    ///
    /// # Errors
    /// Returns error if `pid` is not a child of the caller
    pub fn reap_peer(pid: ProcessId) -> Result<WaitStatus> {
        loop {
            match waitpid(pid.as_nix_pid(), None) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    return Ok(status);
                }
                Ok(other) => debug!(status = ?other, "Child state change"),
                Err(Errno::EINTR) => {}
                Err(e) => return Err(Error::System(e)),
            }
        }
    }

    /// Wait for the init process started by [`Launcher::launch`](crate::Launcher::launch)
    ///
    /// The init reports the build command's termination over its status
    /// pipe before exiting; an init that dies without reporting took the
    /// command down with it.
    ///
    /// # Errors
    /// Returns error if the init cannot be watched or reaped
    pub fn wait_init(&mut self, launched: Launched) -> Result<RunResult> {
        let (pid, started, mut status) = launched.into_parts();
        self.running();
        RunEvent::Launched {
            pid,
            timestamp: SystemTime::now(),
        }
        .emit_trace();

        let report = self.watch(pid, &mut status)?;
        let init_status = Self::reap_peer(pid)?;
        let duration = started.elapsed();

        let termination = match serde_json::from_slice::<Termination>(&report) {
            Ok(termination) => termination,
            Err(_) => match init_status {
                WaitStatus::Signaled(_, signal, _) => Termination::Signaled(signal as i32),
                other => {
                    return Err(Error::Io(io::Error::other(format!(
                        "init exited without reporting the build command ({other:?})"
                    ))));
                }
            },
        };

        let event = match termination {
            Termination::Exited(exit_code) => RunEvent::Exited {
                pid,
                exit_code,
                duration,
                timestamp: SystemTime::now(),
            },
            Termination::Signaled(signal) => RunEvent::Signaled {
                pid,
                signal,
                duration,
                timestamp: SystemTime::now(),
            },
        };
        event.emit_trace();
        self.conclude(termination);
        Ok(RunResult::new(termination, duration))
    }

    /// Reaper loop of the PID-1 init
    ///
    /// Forwards cancellation to `command`, reaps every child that exits
    /// (including re-parented orphans) and returns once `command` is gone.
    pub(crate) fn reap_as_init(&mut self, command: ProcessId) -> Result<Termination> {
        loop {
            if let Some(termination) = reap_all(command)? {
                return Ok(termination);
            }
            let (signalled, _) = self.poll(None)?;
            if signalled {
                self.drain_signals(command)?;
            }
        }
    }

    fn poll(&self, reader: Option<&PipeReader>) -> Result<(bool, bool)> {
        let mut fds = vec![PollFd::new(self.signals.as_fd(), PollFlags::POLLIN)];
        if let Some(reader) = reader {
            fds.push(PollFd::new(reader.as_fd(), PollFlags::POLLIN));
        }

        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => {}
                Err(e) => return Err(Error::System(e)),
            }
        }

        let ready = |fd: &PollFd<'_>| fd.revents().is_some_and(|r| !r.is_empty());
        Ok((ready(&fds[0]), fds.get(1).is_some_and(ready)))
    }

    fn drain_signals(&mut self, peer: ProcessId) -> Result<()> {
        loop {
            let info = match self.signals.read_signal() {
                Ok(Some(info)) => info,
                Ok(None) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::System(e)),
            };

            #[allow(clippy::cast_possible_wrap)]
            let signo = info.ssi_signo as i32;
            match Signal::try_from(signo) {
                // Children are collected by reap_peer or reap_all
                Ok(Signal::SIGCHLD) => {}
                Ok(received @ (Signal::SIGINT | Signal::SIGTERM)) => self.forward(peer, received),
                _ => debug!(signo, "Ignoring unexpected signal"),
            }
        }
    }

    fn forward(&mut self, pid: ProcessId, received: Signal) {
        self.forwarded += 1;
        let delivered = if self.escalated() {
            Signal::SIGKILL
        } else {
            received
        };

        match kill(pid.as_nix_pid(), delivered) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid = %pid, error = %e, "Could not forward signal"),
        }

        if self.escalate {
            RunEvent::SignalForwarded {
                pid,
                received: received as i32,
                delivered: delivered as i32,
                timestamp: SystemTime::now(),
            }
            .emit_trace();
        } else {
            debug!(pid = %pid, signal = %received, "Relayed signal");
        }
    }

    /// Enter `Finalizing`; teardown follows
    pub fn finalizing(&mut self) {
        self.transition(SupervisorState::Finalizing);
    }

    /// Enter `Done` after teardown released `released` entries
    pub fn done(&mut self, released: usize, warnings: usize) {
        self.transition(SupervisorState::Done);
        RunEvent::TeardownFinished {
            released,
            warnings,
            timestamp: SystemTime::now(),
        }
        .emit_trace();
    }
}

/// Reap every exited child, returning `command`'s termination if among them
fn reap_all(command: ProcessId) -> Result<Option<Termination>> {
    let mut found = None;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(found),
            Ok(WaitStatus::Exited(pid, code)) if pid == command.as_nix_pid() => {
                found = Some(Termination::Exited(code));
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) if pid == command.as_nix_pid() => {
                found = Some(Termination::Signaled(signal as i32));
            }
            Ok(other) => debug!(status = ?other, "Reaped orphan"),
            Err(Errno::EINTR) => {}
            Err(e) => return Err(Error::System(e)),
        }
    }
}
