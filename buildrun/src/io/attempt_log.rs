//! Per-attempt artifacts under `.buildrun/attempts/<run>/<phase>/<n>/`.
//!
//! These are product output, written for every attempt regardless of the
//! tracing level.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::retry::AttemptDecision;
use crate::core::types::{ApplyResult, AttemptOutcome, CiResult, PatchProposal};

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub run_id: String,
    pub phase_id: String,
    pub attempt_index: u32,
    pub escalation_level: u32,
    pub revision_epoch: u32,
    pub handler: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub outcome: AttemptOutcome,
    pub decision: AttemptDecision,
    pub context_files: usize,
    pub repairs: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub proposal_path: PathBuf,
    pub apply_path: PathBuf,
    pub ci_path: PathBuf,
    pub diagnostics_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(attempts_dir: &Path, run_id: &str, phase_id: &str, attempt_index: u32) -> Self {
        let dir = attempts_dir
            .join(run_id)
            .join(phase_id)
            .join(attempt_index.to_string());
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            proposal_path: dir.join("proposal.json"),
            apply_path: dir.join("apply.json"),
            ci_path: dir.join("ci.json"),
            diagnostics_path: dir.join("diagnostics.md"),
        }
    }
}

pub struct AttemptWriteRequest<'a> {
    pub attempts_dir: &'a Path,
    pub meta: &'a AttemptMeta,
    pub proposal: Option<&'a PatchProposal>,
    pub apply: Option<&'a ApplyResult>,
    pub ci: Option<&'a CiResult>,
    pub diagnostics: Option<&'a str>,
}

pub fn write_attempt(request: &AttemptWriteRequest<'_>) -> Result<AttemptPaths> {
    let meta = request.meta;
    let paths = AttemptPaths::new(
        request.attempts_dir,
        &meta.run_id,
        &meta.phase_id,
        meta.attempt_index,
    );
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, meta)?;
    if let Some(proposal) = request.proposal {
        write_json(&paths.proposal_path, proposal)?;
    }
    if let Some(apply) = request.apply {
        write_json(&paths.apply_path, apply)?;
    }
    if let Some(ci) = request.ci {
        write_json(&paths.ci_path, ci)?;
    }
    if let Some(text) = request.diagnostics {
        fs::write(&paths.diagnostics_path, text)
            .with_context(|| format!("write {}", paths.diagnostics_path.display()))?;
    }
    Ok(paths)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
