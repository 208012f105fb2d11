//! cbuildrt command-line entry point
//!
//! Runs one build command inside private namespaces and ends the same way
//! the command did:
//! - the command exited with `n`: cbuildrt exits with `n`
//! - the command was killed by signal `s`: cbuildrt kills itself with `s`
//! - the runtime failed: cbuildrt exits with 125, and `--report` records
//!   `"status": "failed"`, so a command exiting 125 stays distinguishable

#![allow(unsafe_code)]

use cbuildrt_core::{RUNTIME_FAILURE_EXIT_CODE, SIGNAL_EXIT_OFFSET, Termination};
use clap::Parser;
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::{SigHandler, SigSet, Signal, raise, signal};
use std::process;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod check;
mod cli;
mod config;
mod run;

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout belongs to the build command
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run(args) => run::execute(&args),
        Commands::Check => check::execute().map(Termination::Exited),
    };

    match result {
        Ok(Termination::Exited(code)) => process::exit(code),
        Ok(Termination::Signaled(signo)) => die_by_signal(signo),
        Err(e) => {
            report_error(&e);
            process::exit(RUNTIME_FAILURE_EXIT_CODE);
        }
    }
}

/// Terminate with the build command's signal so our parent sees it too
fn die_by_signal(signo: i32) -> ! {
    if let Ok(sig) = Signal::try_from(signo) {
        // The command already dumped core if it was going to
        if let Err(e) = setrlimit(Resource::RLIMIT_CORE, 0, 0) {
            debug!(error = %e, "Could not disable core dumps");
        }
        // SAFETY: restoring the default disposition installs no handler
        if let Err(e) = unsafe { signal(sig, SigHandler::SigDfl) } {
            debug!(error = %e, "Could not reset signal disposition");
        }
        let mut set = SigSet::empty();
        set.add(sig);
        if let Err(e) = set.thread_unblock() {
            debug!(error = %e, "Could not unblock signal");
        }
        if let Err(e) = raise(sig) {
            debug!(error = %e, "Could not raise signal");
        }
    }

    // Only reached for signals whose default action does not terminate
    process::exit(SIGNAL_EXIT_OFFSET + signo)
}

fn report_error(err: &anyhow::Error) {
    match err.downcast_ref::<cbuildrt_core::Error>() {
        Some(core) if core.is_validation() => eprintln!("Error: configuration rejected: {err:#}"),
        Some(_) => eprintln!("Error: run failed: {err:#}"),
        None => eprintln!("Error: {err:#}"),
    }
}
