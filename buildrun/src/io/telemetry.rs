//! Best-effort JSONL sinks under `.buildrun/telemetry/`.
//!
//! Nothing here may fail a run: write errors are logged and dropped.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::types::TokenBudgetEvent;

/// One proposer call's token use, attributed to a provider and model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub run_id: String,
    pub phase_id: String,
    pub attempt_index: u32,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Append one JSON line to `path`, creating parents as needed.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(value).context("serialize telemetry record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

fn append_best_effort<T: Serialize>(path: &Path, value: &T, what: &'static str) {
    if let Err(err) = append_jsonl(path, value) {
        warn!(path = %path.display(), what, err = %format!("{err:#}"), "telemetry write dropped");
    }
}

#[derive(Debug, Clone)]
pub struct TelemetrySink {
    token_budget_path: PathBuf,
    usage_path: PathBuf,
}

impl TelemetrySink {
    pub fn new(token_budget_path: impl Into<PathBuf>, usage_path: impl Into<PathBuf>) -> Self {
        Self {
            token_budget_path: token_budget_path.into(),
            usage_path: usage_path.into(),
        }
    }

    pub fn record_token_budget(&self, event: &TokenBudgetEvent) {
        append_best_effort(&self.token_budget_path, event, "token budget");
    }

    pub fn record_usage(&self, record: &UsageRecord) {
        append_best_effort(&self.usage_path, record, "usage");
    }
}
