//! CLI tests: spawn the binary and check exit codes and output.

use std::fs;
use std::process::Command;

use buildrun::exit_codes;
use buildrun::io::init::BuildrunPaths;
use buildrun::test_support::TestRepo;

fn buildrun(dir: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_buildrun"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn buildrun")
}

#[test]
fn init_twice_without_force_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let first = buildrun(temp.path(), &["init"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    assert!(BuildrunPaths::new(temp.path()).config_path.is_file());

    let second = buildrun(temp.path(), &["init"]);
    assert_eq!(second.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&second.stderr).contains("already exists"));

    let forced = buildrun(temp.path(), &["init", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn parse_ci_prints_counts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("ci.log");
    fs::write(&log, "collected 7 items\n\n===== 5 passed, 2 failed in 0.12s =====\n").expect("log");

    let output = buildrun(temp.path(), &["parse-ci", "ci.log"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(json["passed"], 5);
    assert_eq!(json["failed"], 2);
    assert_eq!(json["shape"], "pytest");
}

#[test]
fn parse_ci_missing_log_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = buildrun(temp.path(), &["parse-ci", "nope.log"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn run_with_empty_plan_completes() {
    let repo = TestRepo::new().expect("repo");
    let output = buildrun(repo.root(), &["run"]);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn run_outside_workspace_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = buildrun(temp.path(), &["run"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn reset_phase_without_state_is_invalid() {
    let repo = TestRepo::new().expect("repo");
    let output = buildrun(repo.root(), &["reset-phase", "p1"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn cancel_writes_sentinel() {
    let repo = TestRepo::new().expect("repo");
    let output = buildrun(repo.root(), &["cancel"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(repo.paths().cancel_path.is_file());
}
