use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const RUNTIME_FAILURE: i32 = 125;

fn cbuildrt() -> Command {
    Command::new(env!("CARGO_BIN_EXE_cbuildrt"))
}

fn write_config(dir: &Path, config: &Value) -> PathBuf {
    let path = dir.join("cbuild.json");
    fs::write(&path, serde_json::to_vec_pretty(config).unwrap()).unwrap();
    path
}

/// Host toolchain directories bound read-only so `sh` and `cp` work
fn host_system_binds() -> Vec<Value> {
    ["/usr", "/bin", "/sbin", "/lib", "/lib64"]
        .into_iter()
        .filter(|dir| Path::new(dir).exists())
        .map(|dir| json!({"source": dir, "destination": dir, "readOnly": true}))
        .collect()
}

/// Config with default namespaces (user, mount and PID)
fn build_config(root: &Path, script: &str, extra_binds: Vec<Value>) -> Value {
    let mut binds = host_system_binds();
    binds.extend(extra_binds);
    json!({
        "rootfs": root,
        "process": {"args": ["sh", "-c", script]},
        "bindMounts": binds,
        "essentials": {"resolvConf": false}
    })
}

fn read_report(path: &Path) -> Value {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

#[test]
fn test_help_command() {
    cbuildrt()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Reproducible build runtime"))
        .stdout(predicate::str::contains("Commands:"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check"));
}

#[test]
fn test_version_command() {
    cbuildrt()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cbuildrt"));
}

#[test]
fn test_invalid_command() {
    cbuildrt()
        .arg("invalid")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_run_without_config() {
    cbuildrt()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_run_help() {
    cbuildrt()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--root"))
        .stdout(predicate::str::contains("--report"));
}

#[test]
fn test_missing_config_file() {
    cbuildrt()
        .args(["run", "/nonexistent/cbuild.json"])
        .assert()
        .code(RUNTIME_FAILURE)
        .stderr(predicate::str::contains("Unable to open"));
}

#[test]
fn test_unknown_field_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &json!({"process": {"args": ["true"]}, "hostname": "builder"}),
    );

    cbuildrt()
        .arg("run")
        .arg(&config)
        .assert()
        .code(RUNTIME_FAILURE)
        .stderr(predicate::str::contains("unknown field"));
}

#[test]
fn test_empty_args_rejected_before_root_exists() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let config = write_config(dir.path(), &json!({"rootfs": root, "process": {"args": []}}));

    cbuildrt()
        .arg("run")
        .arg(&config)
        .assert()
        .code(RUNTIME_FAILURE)
        .stderr(predicate::str::contains("configuration rejected"));

    assert!(!root.exists());
}

#[test]
fn test_runtime_failure_is_recorded_in_report() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report.json");
    let config = write_config(dir.path(), &json!({"process": {"args": []}}));

    cbuildrt()
        .arg("run")
        .arg(&config)
        .arg("--report")
        .arg(&report)
        .assert()
        .code(RUNTIME_FAILURE);

    let report = read_report(&report);
    assert_eq!(report["status"], "failed");
    assert!(
        report["error"]
            .as_str()
            .is_some_and(|e| e.contains("command must not be empty"))
    );
    assert!(report.get("result").is_none());
}

#[test]
fn test_duplicate_binds_rejected_before_root_exists() {
    let dir = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let config = write_config(
        dir.path(),
        &json!({
            "rootfs": root,
            "process": {"args": ["true"]},
            "bindMounts": [
                {"source": input.path(), "destination": "/input"},
                {"source": input.path(), "destination": "/input/../input"}
            ]
        }),
    );

    cbuildrt()
        .arg("run")
        .arg(&config)
        .assert()
        .code(RUNTIME_FAILURE)
        .stderr(predicate::str::contains("/input"));

    assert!(!root.exists());
}

#[test]
fn test_escaping_destination_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &json!({
            "process": {"args": ["true"]},
            "bindMounts": [{"source": input.path(), "destination": "/../etc"}]
        }),
    );

    cbuildrt()
        .arg("run")
        .arg(&config)
        .assert()
        .code(RUNTIME_FAILURE);
}

#[test]
fn test_check_reports_host_state() {
    cbuildrt()
        .arg("check")
        .assert()
        .code(predicate::in_iter([0, 1]))
        .stdout(predicate::str::contains("namespace support"));
}

#[test]
#[ignore] // Requires unprivileged user namespaces
fn test_copy_from_read_only_input_to_output() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    fs::write(input.path().join("a.txt"), "reproducible\n").unwrap();

    let report = dir.path().join("report.json");
    let config = write_config(
        dir.path(),
        &build_config(
            root.path(),
            "cp /input/a.txt /output/a.txt",
            vec![
                json!({"source": input.path(), "destination": "/input", "readOnly": true}),
                json!({"source": output.path(), "destination": "/output"}),
            ],
        ),
    );

    cbuildrt()
        .arg("run")
        .arg(&config)
        .arg("--report")
        .arg(&report)
        .assert()
        .success();

    assert_eq!(
        fs::read_to_string(output.path().join("a.txt")).unwrap(),
        "reproducible\n"
    );
    // Mount points created in the supplied root were removed again
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    assert_eq!(fs::read_dir(input.path()).unwrap().count(), 1);

    let report = read_report(&report);
    assert_eq!(report["status"], "completed");
    assert_eq!(report["result"]["termination"]["kind"], "exited");
    assert_eq!(report["result"]["termination"]["value"], 0);
}

#[test]
#[ignore] // Requires unprivileged user namespaces
fn test_exit_code_is_mirrored() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &build_config(root.path(), "exit 7", vec![]));

    cbuildrt().arg("run").arg(&config).assert().code(7);
}

#[test]
#[ignore] // Requires unprivileged user namespaces
fn test_command_exit_125_is_reported_as_completed() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let report = dir.path().join("report.json");
    let config = write_config(dir.path(), &build_config(root.path(), "exit 125", vec![]));

    cbuildrt()
        .arg("run")
        .arg(&config)
        .arg("--report")
        .arg(&report)
        .assert()
        .code(RUNTIME_FAILURE);

    // Same code as a runtime failure; the report tells them apart
    let report = read_report(&report);
    assert_eq!(report["status"], "completed");
    assert_eq!(report["result"]["termination"]["value"], 125);
}

#[test]
#[ignore] // Requires unprivileged user namespaces
fn test_command_exit_130_is_not_a_signal_death() {
    use std::os::unix::process::ExitStatusExt;

    let dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &build_config(root.path(), "exit 130", vec![]));

    let status = std::process::Command::new(env!("CARGO_BIN_EXE_cbuildrt"))
        .arg("run")
        .arg(&config)
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(130));
    assert_eq!(status.signal(), None);
}

#[test]
#[ignore] // Requires unprivileged user namespaces
fn test_command_runs_under_an_init() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    // PID 1 is the init; the command is its child
    let config = write_config(
        dir.path(),
        &build_config(root.path(), "test $$ -ne 1 && test $PPID -eq 1", vec![]),
    );

    cbuildrt().arg("run").arg(&config).assert().success();
}

#[test]
#[ignore] // Requires unprivileged user namespaces
fn test_write_outside_targets_fails() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &build_config(root.path(), "echo stray > /stray", vec![]),
    );

    cbuildrt()
        .arg("run")
        .arg(&config)
        .assert()
        .code(predicate::function(|code: &i32| {
            *code != 0 && *code != RUNTIME_FAILURE
        }));

    assert!(!root.path().join("stray").exists());
}

#[test]
#[ignore] // Requires unprivileged user namespaces
fn test_read_only_bind_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &build_config(
            root.path(),
            "touch /input/new; echo rc=$? > /output/rc",
            vec![
                json!({"source": input.path(), "destination": "/input", "readOnly": true}),
                json!({"source": output.path(), "destination": "/output"}),
            ],
        ),
    );

    // The script itself succeeds: only the write into /input failed
    cbuildrt().arg("run").arg(&config).assert().success();

    let rc = fs::read_to_string(output.path().join("rc")).unwrap();
    assert!(rc.starts_with("rc="), "unexpected rc file: {rc}");
    assert_ne!(rc.trim(), "rc=0");
    assert!(!input.path().join("new").exists());
}

#[test]
#[ignore] // Requires unprivileged user namespaces
fn test_interrupt_is_forwarded() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use std::os::unix::process::ExitStatusExt;

    let dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let report = dir.path().join("report.json");
    let mut config = build_config(root.path(), "", vec![]);
    config["process"]["args"] = json!(["sleep", "30"]);
    let config = write_config(dir.path(), &config);

    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_cbuildrt"))
        .arg("run")
        .arg(&config)
        .arg("--report")
        .arg(&report)
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_secs(1));
    #[allow(clippy::cast_possible_wrap)]
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();

    // One interrupt is enough, and the runtime dies from it as well
    let status = child.wait().unwrap();
    assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
    assert_eq!(status.code(), None);
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);

    let report = read_report(&report);
    assert_eq!(report["result"]["termination"]["kind"], "signaled");
    assert_eq!(report["result"]["termination"]["value"], Signal::SIGINT as i32);
}
