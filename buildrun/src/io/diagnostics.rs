//! Failure digests fed to the next proposal after a defect outcome.

use std::fmt::Write as _;
use std::fs;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::{ApplyResult, AttemptOutcome, CiResult};

/// What the previous attempt left behind.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsInput<'a> {
    pub phase_id: &'a str,
    pub attempt_index: u32,
    pub outcome: AttemptOutcome,
    pub message: &'a str,
    pub apply: Option<&'a ApplyResult>,
    pub ci: Option<&'a CiResult>,
}

pub trait Diagnostics {
    /// Render a digest for the next proposer call.
    fn digest(&self, input: &DiagnosticsInput<'_>) -> Result<String>;
}

/// Markdown digest: last reason, touched paths, CI counts and the last lines
/// of the CI log.
#[derive(Debug, Clone, Copy)]
pub struct FailureDigest {
    tail_lines: usize,
}

impl Default for FailureDigest {
    fn default() -> Self {
        Self { tail_lines: 60 }
    }
}

impl FailureDigest {
    pub fn new(tail_lines: usize) -> Self {
        Self { tail_lines }
    }
}

impl Diagnostics for FailureDigest {
    fn digest(&self, input: &DiagnosticsInput<'_>) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "## Previous attempt {} of phase {}: {}",
            input.attempt_index, input.phase_id, input.outcome
        );
        let _ = writeln!(out, "\n{}", input.message);

        if let Some(apply) = input.apply
            && !apply.touched_paths.is_empty()
        {
            out.push_str("\n### Touched paths\n");
            for path in &apply.touched_paths {
                let _ = writeln!(out, "- {path}");
            }
        }

        if let Some(ci) = input.ci {
            let _ = writeln!(out, "\n### Verification\n{}", ci.counts());
            if let Some(log_path) = &ci.log_path {
                let log = fs::read(log_path)
                    .with_context(|| format!("read ci log {}", log_path.display()))?;
                let log = String::from_utf8_lossy(&log);
                let tail = tail_lines(&log, self.tail_lines);
                if !tail.is_empty() {
                    let _ = writeln!(out, "\n```\n{tail}\n```");
                }
            }
        }
        debug!(bytes = out.len(), "failure digest rendered");
        Ok(out)
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
