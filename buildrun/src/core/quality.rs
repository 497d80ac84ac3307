//! Structural checks that catch patches which parse fine but are clearly
//! not what the proposer meant: truncated output, diffs against the wrong
//! text, and edits that wipe most of a file.
//!
//! Validation also computes the exact bytes each path will hold afterwards,
//! so the apply step only writes what was checked here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::diff::apply_diff;
use crate::core::sanitizer::{OpBody, SanitizedOp, SanitizedPatch};
use crate::core::types::{FileOpKind, PlannedWrite};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Fraction of a file's symbols a modify may drop before it looks like a wipe.
    pub wipe_symbol_ratio: f64,
    /// Files with fewer symbols than this are never flagged as wiped.
    pub wipe_min_symbols: usize,
    /// Additional literal markers treated as truncation.
    pub extra_truncation_markers: Vec<String>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            wipe_symbol_ratio: 0.5,
            wipe_min_symbols: 4,
            extra_truncation_markers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum QualityIssue {
    #[error("{path}:{line}: truncation marker '{marker}'")]
    TruncationMarker {
        path: String,
        line: usize,
        marker: String,
    },
    #[error("{path}: {detail}")]
    ContextMismatch { path: String, detail: String },
    #[error("{path}: add targets an existing file with different contents")]
    AddTargetsExistingFile { path: String },
    #[error("{path}: modify targets a missing file")]
    ModifyTargetsMissingFile { path: String },
    #[error("{path}: looks like a wipe ({kept} of {before} symbols kept)")]
    SuspectedWipe {
        path: String,
        before: usize,
        kept: usize,
    },
}

impl QualityIssue {
    pub fn path(&self) -> &str {
        match self {
            QualityIssue::TruncationMarker { path, .. }
            | QualityIssue::ContextMismatch { path, .. }
            | QualityIssue::AddTargetsExistingFile { path }
            | QualityIssue::ModifyTargetsMissingFile { path }
            | QualityIssue::SuspectedWipe { path, .. } => path,
        }
    }
}

static TRUNCATION_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^\s*(//|#|/\*|<!--|--|\*)\s*\.{3}\s*(rest|remaining|existing|other|previous|unchanged)\b",
        r"(?i)\.{3}\s*(rest of (the )?(file|code|implementation|function|class))",
        r"(?i)^\s*(//|#|/\*|<!--)\s*(rest of (the )?(file|code)|remaining (code|content)|existing code)\b",
        r"(?i)\b(unchanged|existing) code (here|omitted|remains)\b",
        r"(?i)\[\s*(content\s+)?truncated\s*\]",
        r"(?i)<\s*truncated\s*>",
        r"(?i)\(\s*(output|content)\s+truncated\s*\)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static SYMBOL_DEFS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?(?:fn|struct|enum|trait|mod|type|const|static)\s+(?P<name>[A-Za-z_]\w*)",
        r"^\s*(?:async\s+)?(?:def|class)\s+(?P<name>[A-Za-z_]\w*)",
        r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function\*?|class|interface|type|enum)\s+(?P<name>[A-Za-z_$][\w$]*)",
        r"^\s*(?:export\s+)?(?:const|let)\s+(?P<name>[A-Za-z_$][\w$]*)\s*=\s*(?:async\s*)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*=>",
        r"^func\s+(?:\([^)]*\)\s+)?(?P<name>[A-Za-z_]\w*)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Names of top-level-looking definitions in `text`.
pub fn symbols(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for line in text.lines() {
        for re in SYMBOL_DEFS.iter() {
            if let Some(name) = re.captures(line).and_then(|c| c.name("name")) {
                out.insert(name.as_str().to_string());
                break;
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct QualityValidator {
    config: QualityConfig,
    extra_markers: Vec<String>,
}

impl QualityValidator {
    pub fn new(config: QualityConfig) -> Self {
        let extra_markers = config
            .extra_truncation_markers
            .iter()
            .map(|m| m.to_lowercase())
            .filter(|m| !m.trim().is_empty())
            .collect();
        Self {
            config,
            extra_markers,
        }
    }

    /// Validate every operation against the current file contents and return
    /// the planned writes in proposal order.
    ///
    /// `originals` maps each path to its current text (`None` when absent).
    pub fn validate(
        &self,
        patch: &SanitizedPatch,
        originals: &BTreeMap<String, Option<String>>,
    ) -> Result<Vec<PlannedWrite>, QualityIssue> {
        patch
            .operations
            .iter()
            .map(|op| {
                let before = originals.get(&op.path).cloned().flatten();
                self.plan(op, before)
            })
            .collect()
    }

    fn plan(&self, op: &SanitizedOp, before: Option<String>) -> Result<PlannedWrite, QualityIssue> {
        let path = op.path.clone();
        let after = match (op.kind, &op.body) {
            (FileOpKind::Delete, _) | (_, OpBody::None) => None,
            (FileOpKind::Add, OpBody::Content(content)) => {
                if let Some(existing) = &before
                    && existing != content
                {
                    return Err(QualityIssue::AddTargetsExistingFile { path });
                }
                Some(content.clone())
            }
            (FileOpKind::Modify, OpBody::Content(content)) => {
                if before.is_none() {
                    return Err(QualityIssue::ModifyTargetsMissingFile { path });
                }
                Some(content.clone())
            }
            (kind, OpBody::Diff(diff)) => {
                let base = match (&before, kind) {
                    (Some(text), _) => text.as_str(),
                    (None, FileOpKind::Add) => "",
                    (None, _) => return Err(QualityIssue::ModifyTargetsMissingFile { path }),
                };
                let applied = apply_diff(base, diff).map_err(|err| QualityIssue::ContextMismatch {
                    path: path.clone(),
                    detail: err.to_string(),
                })?;
                Some(applied)
            }
        };

        if let Some(after) = &after {
            self.check_truncation(&path, before.as_deref(), after)?;
            if op.kind == FileOpKind::Modify
                && let Some(before) = &before
            {
                self.check_wipe(&path, before, after)?;
            }
        }

        let kind = match (op.kind, &before) {
            (FileOpKind::Delete, _) => FileOpKind::Delete,
            (_, None) => FileOpKind::Add,
            (_, Some(_)) => FileOpKind::Modify,
        };
        Ok(PlannedWrite {
            path,
            kind,
            before,
            after,
        })
    }

    /// Markers only count on lines the patch introduces; a file that already
    /// documents "[truncated]" output is not penalized.
    fn check_truncation(
        &self,
        path: &str,
        before: Option<&str>,
        after: &str,
    ) -> Result<(), QualityIssue> {
        let existing: BTreeSet<&str> = before.map(|b| b.lines().collect()).unwrap_or_default();
        for (n, line) in after.lines().enumerate() {
            if existing.contains(line) {
                continue;
            }
            if let Some(marker) = self.marker_in(line) {
                return Err(QualityIssue::TruncationMarker {
                    path: path.to_string(),
                    line: n + 1,
                    marker,
                });
            }
        }
        Ok(())
    }

    fn marker_in(&self, line: &str) -> Option<String> {
        for re in TRUNCATION_MARKERS.iter() {
            if let Some(m) = re.find(line) {
                return Some(m.as_str().trim().to_string());
            }
        }
        let lowered = line.to_lowercase();
        self.extra_markers
            .iter()
            .find(|m| lowered.contains(m.as_str()))
            .cloned()
    }

    fn check_wipe(&self, path: &str, before: &str, after: &str) -> Result<(), QualityIssue> {
        let had = symbols(before);
        if had.len() < self.config.wipe_min_symbols {
            return Ok(());
        }
        let has = symbols(after);
        let kept = had.intersection(&has).count();
        let lost_fraction = (had.len() - kept) as f64 / had.len() as f64;
        let shrink_limit = before.len() as f64 * (1.0 - self.config.wipe_symbol_ratio);
        if lost_fraction > self.config.wipe_symbol_ratio && (after.len() as f64) < shrink_limit {
            return Err(QualityIssue::SuspectedWipe {
                path: path.to_string(),
                before: had.len(),
                kept,
            });
        }
        Ok(())
    }
}
