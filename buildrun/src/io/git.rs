//! Thin wrapper around `git` subprocess calls.
//!
//! Only the checkpoint adapter talks to version control, and it only uses
//! plumbing commands, so the wrapper stays small and explicit.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    envs: Vec<(String, String)>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            envs: Vec::new(),
        }
    }

    /// Same workdir with one more environment variable for every call.
    pub fn with_env(&self, key: &str, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.envs.push((key.to_string(), value.into()));
        next
    }

    /// Use `index` instead of `.git/index`.
    pub fn with_index_file(&self, index: &Path) -> Self {
        self.with_env("GIT_INDEX_FILE", index.display().to_string())
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_work_tree(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Resolve a revision to a full object id, `None` if it does not exist.
    pub fn resolve(&self, rev: &str) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", rev])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Paths recorded in the current index (`-z` separated, so no quoting).
    pub fn ls_files(&self) -> Result<Vec<String>> {
        let out = self.run_checked(&["ls-files", "-z"])?;
        Ok(out
            .stdout
            .split(|b| *b == 0)
            .filter(|p| !p.is_empty())
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect())
    }

    pub fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    pub fn run(&self, args: &[&str]) -> Result<Output> {
        trace!(args = %args.join(" "), "git");
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0");
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd.output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
