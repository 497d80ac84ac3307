//! Verification runner: one shell command, a bounded wait and a parsed
//! summary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::ci_parse::parse_summary;
use crate::core::types::CiResult;
use crate::io::cancel::CancelToken;
use crate::io::config::CiConfig;
use crate::io::process::{ProcessLimits, run_command};

/// Which attempt a CI run belongs to; used to place the log.
#[derive(Debug, Clone, Copy)]
pub struct CiRequest<'a> {
    pub run_id: &'a str,
    pub phase_id: &'a str,
    pub attempt_index: u32,
}

pub trait CiRunner {
    fn run(&self, request: &CiRequest<'_>, cancel: &CancelToken) -> Result<CiResult>;
}

/// Build a `CiResult` from captured output.
pub fn ci_result_from_output(output: &str, exit_code: Option<i32>, timed_out: bool) -> CiResult {
    let summary = parse_summary(output);
    CiResult {
        passed: summary.passed,
        failed: summary.failed,
        errors: summary.errors,
        collection_errors: summary.collection_errors,
        exit_code,
        timed_out,
        log_path: None,
        shape: summary.shape.map(str::to_string),
    }
}

/// Runs `sh -c <command>` from the workspace root.
#[derive(Debug, Clone)]
pub struct ShellCiRunner {
    root: PathBuf,
    config: CiConfig,
    log_dir: PathBuf,
}

impl ShellCiRunner {
    pub fn new(root: impl Into<PathBuf>, config: CiConfig, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config,
            log_dir: log_dir.into(),
        }
    }

    fn log_path(&self, request: &CiRequest<'_>) -> PathBuf {
        self.log_dir
            .join(request.run_id)
            .join(request.phase_id)
            .join(format!("{}.log", request.attempt_index))
    }
}

impl CiRunner for ShellCiRunner {
    #[instrument(skip_all, fields(phase_id = request.phase_id, attempt = request.attempt_index))]
    fn run(&self, request: &CiRequest<'_>, cancel: &CancelToken) -> Result<CiResult> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.config.command).current_dir(&self.root);
        let limits = ProcessLimits {
            timeout: Duration::from_secs(self.config.timeout_secs),
            head_bytes: self.config.log_head_bytes,
            tail_bytes: self.config.log_tail_bytes,
        };
        let output = run_command(cmd, None, limits, cancel)
            .with_context(|| format!("run ci command `{}`", self.config.command))?;

        let stdout = output.stdout.to_string_lossy();
        let stderr = output.stderr.to_string_lossy();
        let combined = format!("{stdout}\n{stderr}");
        let mut result = ci_result_from_output(&combined, output.exit_code(), output.timed_out);

        let log_path = self.log_path(request);
        write_log(&log_path, &self.config.command, &stdout, &stderr)?;
        result.log_path = Some(log_path);

        if result.shape.is_none() {
            warn!(exit_code = ?result.exit_code, "no known summary shape in ci output");
        }
        info!(
            passed = result.passed,
            failed = result.failed,
            errors = ?result.errors,
            collection_errors = result.collection_errors,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            cancelled = output.cancelled,
            "ci finished"
        );
        Ok(result)
    }
}

fn write_log(path: &Path, command: &str, stdout: &str, stderr: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let body = format!("$ {command}\n{stdout}\n--- stderr ---\n{stderr}");
    fs::write(path, body).with_context(|| format!("write ci log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(temp: &Path, command: &str) -> ShellCiRunner {
        let config = CiConfig {
            command: command.to_string(),
            timeout_secs: 30,
            ..CiConfig::default()
        };
        ShellCiRunner::new(temp, config, temp.join("ci"))
    }

    fn request() -> CiRequest<'static> {
        CiRequest {
            run_id: "run-1",
            phase_id: "p1",
            attempt_index: 2,
        }
    }

    #[test]
    fn parses_cargo_summary_and_persists_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ci = runner(
            temp.path(),
            "echo 'test result: ok. 4 passed; 0 failed; 0 ignored'",
        )
        .run(&request(), &CancelToken::new())
        .expect("run");

        assert_eq!(ci.passed, 4);
        assert_eq!(ci.errors, Some(0));
        assert!(ci.is_green());
        let log = ci.log_path.expect("log path");
        assert!(log.ends_with("ci/run-1/p1/2.log"));
        assert!(fs::read_to_string(log).expect("read").contains("4 passed"));
    }

    /// Verifies a clean exit with no recognizable summary is not green.
    #[test]
    fn unrecognized_output_keeps_errors_unknown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ci = runner(temp.path(), "echo all good")
            .run(&request(), &CancelToken::new())
            .expect("run");
        assert_eq!(ci.exit_code, Some(0));
        assert_eq!(ci.errors, None);
        assert!(!ci.is_green());
    }

    #[test]
    fn stderr_collection_errors_are_counted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ci = runner(
            temp.path(),
            "echo 'ERROR collecting tests/test_a.py' >&2; echo '1 passed, 1 error in 0.1s'; exit 1",
        )
        .run(&request(), &CancelToken::new())
        .expect("run");
        assert_eq!(ci.collection_errors, 1);
        assert_eq!(ci.exit_code, Some(1));
    }
}
