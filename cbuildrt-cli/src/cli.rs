//! CLI argument definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cbuildrt")]
#[command(about = "Reproducible build runtime: one command in a private root", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the build command described by a cbuild.json file
    Run(RunArgs),

    /// Check whether this host supports unprivileged runs
    Check,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run configuration (cbuild.json)
    pub config: PathBuf,

    /// Root directory, overriding `rootfs` from the configuration
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Write the run report as JSON to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
}
