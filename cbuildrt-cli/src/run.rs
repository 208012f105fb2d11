//! Build command execution

use anyhow::{Context, Result};
use cbuildrt_core::{RunReport, Termination};
use cbuildrt_namespace::Runtime;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::config::BuildConfig;

/// Contents of the `--report` file
///
/// Written for failed runs too: the exit code alone cannot tell a runtime
/// failure from a build command exiting 125.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ReportFile<'a> {
    /// The build command ran; its result and teardown warnings
    Completed(&'a RunReport),
    /// The runtime could not run the command
    Failed {
        /// Error chain, outermost first
        error: String,
    },
}

/// Run the configured build command, returning how it terminated
pub fn execute(args: &RunArgs) -> Result<Termination> {
    let outcome = run(args);

    if let Some(path) = args.report.as_deref() {
        match &outcome {
            Ok(report) => write_report(path, &ReportFile::Completed(report))?,
            Err(e) => {
                let file = ReportFile::Failed {
                    error: format!("{e:#}"),
                };
                if let Err(write_err) = write_report(path, &file) {
                    warn!(error = %write_err, "Could not record the failure");
                }
            }
        }
    }

    let report = outcome?;
    if report.result.success() {
        info!(duration_ms = report.result.duration.as_millis(), "Build command succeeded");
    } else {
        warn!(result = %report.result.termination, "Build command failed");
    }
    Ok(report.result.termination)
}

fn run(args: &RunArgs) -> Result<RunReport> {
    let config = BuildConfig::load(&args.config)?;
    info!(
        config = %args.config.display(),
        command = ?config.process.args,
        "Starting build run"
    );

    let spec = config.into_run_spec(args.root.clone());
    let report = Runtime::new().run(spec)?;

    for warning in &report.warnings {
        warn!(%warning, "Teardown left something behind");
    }
    Ok(report)
}

fn write_report(path: &Path, report: &ReportFile<'_>) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    fs::write(path, json).with_context(|| format!("Failed to write report to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbuildrt_core::RunResult;
    use std::time::Duration;

    #[test]
    fn test_completed_report_keeps_run_report_shape() {
        let report = RunReport {
            result: RunResult::new(Termination::Exited(125), Duration::from_millis(5)),
            warnings: Vec::new(),
        };
        let json = serde_json::to_value(ReportFile::Completed(&report)).unwrap();

        assert_eq!(json["status"], "completed");
        assert_eq!(json["result"]["termination"]["kind"], "exited");
        assert_eq!(json["result"]["termination"]["value"], 125);
    }

    #[test]
    fn test_failed_report_names_the_error() {
        let file = ReportFile::Failed {
            error: "run failed: Namespace unavailable".to_string(),
        };
        let json = serde_json::to_value(file).unwrap();

        assert_eq!(json["status"], "failed");
        assert!(json.get("result").is_none());
    }
}
