//! Repair of recoverable malformations in a proposed patch.
//!
//! `sanitize` is a pure transformation: it either returns a normalized patch
//! plus the list of repairs it made, or says the proposal cannot be repaired.
//! It does not judge whether paths are allowed; that is the policy step.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::diff::{DEV_NULL, DiffError, UnifiedDiff, parse_unified_diff};
use crate::core::path_pattern::normalize_path;
use crate::core::types::{FileOp, FileOpKind, PatchProposal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpBody {
    Content(String),
    Diff(UnifiedDiff),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedOp {
    pub path: String,
    pub kind: FileOpKind,
    pub body: OpBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedPatch {
    pub operations: Vec<SanitizedOp>,
    pub repairs: Vec<Repair>,
}

impl SanitizedPatch {
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.operations.iter().map(|op| op.path.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "repair", rename_all = "snake_case")]
pub enum Repair {
    NormalizedPath { from: String, to: String },
    StrippedCarriageReturns { path: String },
    AddedDiffHeaders { path: String },
    RecountedHunks { path: String },
    NewFileDiffToContent { path: String },
    EmptyNewFile { path: String },
    ModifyOfNewFile { path: String },
    DroppedDeleteBody { path: String },
    CollapsedDuplicate { path: String },
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repair::NormalizedPath { from, to } => write!(f, "normalized path {from} -> {to}"),
            Repair::StrippedCarriageReturns { path } => write!(f, "{path}: stripped CRLF"),
            Repair::AddedDiffHeaders { path } => write!(f, "{path}: added diff headers"),
            Repair::RecountedHunks { path } => write!(f, "{path}: recounted hunk headers"),
            Repair::NewFileDiffToContent { path } => {
                write!(f, "{path}: new-file diff converted to content")
            }
            Repair::EmptyNewFile { path } => write!(f, "{path}: empty new-file diff"),
            Repair::ModifyOfNewFile { path } => {
                write!(f, "{path}: modify of new file treated as add")
            }
            Repair::DroppedDeleteBody { path } => write!(f, "{path}: ignored body on delete"),
            Repair::CollapsedDuplicate { path } => write!(f, "{path}: collapsed duplicate op"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SanitizeError {
    #[error("proposal contains no file operations")]
    EmptyProposal,
    #[error("{path}: {op} has neither content nor diff")]
    MissingBody { path: String, op: &'static str },
    #[error("{path}: both content and diff supplied")]
    AmbiguousBody { path: String },
    #[error("{path}: {source}")]
    MalformedDiff {
        path: String,
        #[source]
        source: DiffError,
    },
    #[error("{path}: diff header names {header}")]
    HeaderMismatch { path: String, header: String },
    #[error("{path}: conflicting operations")]
    ConflictingOps { path: String },
}

pub fn sanitize(proposal: &PatchProposal) -> Result<SanitizedPatch, SanitizeError> {
    if proposal.operations.is_empty() {
        return Err(SanitizeError::EmptyProposal);
    }

    let mut repairs = Vec::new();
    let mut operations: Vec<SanitizedOp> = Vec::with_capacity(proposal.operations.len());
    for raw in &proposal.operations {
        let op = sanitize_op(raw, &mut repairs)?;
        match operations.iter().find(|existing| existing.path == op.path) {
            Some(existing) if *existing == op => {
                repairs.push(Repair::CollapsedDuplicate { path: op.path });
            }
            Some(_) => return Err(SanitizeError::ConflictingOps { path: op.path }),
            None => operations.push(op),
        }
    }

    Ok(SanitizedPatch {
        operations,
        repairs,
    })
}

fn sanitize_op(raw: &FileOp, repairs: &mut Vec<Repair>) -> Result<SanitizedOp, SanitizeError> {
    let path = clean_path(&raw.path);
    if path != raw.path {
        repairs.push(Repair::NormalizedPath {
            from: raw.path.clone(),
            to: path.clone(),
        });
    }

    match raw.op {
        FileOpKind::Delete => {
            if raw.content.is_some() || raw.diff.is_some() {
                repairs.push(Repair::DroppedDeleteBody { path: path.clone() });
            }
            Ok(SanitizedOp {
                path,
                kind: FileOpKind::Delete,
                body: OpBody::None,
            })
        }
        kind => match (&raw.content, &raw.diff) {
            (Some(_), Some(_)) => Err(SanitizeError::AmbiguousBody { path }),
            (None, None) => Err(SanitizeError::MissingBody {
                path,
                op: kind.as_str(),
            }),
            (Some(content), None) => Ok(SanitizedOp {
                path,
                kind,
                body: OpBody::Content(content.clone()),
            }),
            (None, Some(diff)) => sanitize_diff(path, kind, diff, repairs),
        },
    }
}

fn sanitize_diff(
    path: String,
    kind: FileOpKind,
    text: &str,
    repairs: &mut Vec<Repair>,
) -> Result<SanitizedOp, SanitizeError> {
    let text = if text.contains('\r') {
        repairs.push(Repair::StrippedCarriageReturns { path: path.clone() });
        text.replace("\r\n", "\n")
    } else {
        text.to_string()
    };

    let empty_file =
        |repairs: &mut Vec<Repair>, path: String| -> Result<SanitizedOp, SanitizeError> {
            repairs.push(Repair::EmptyNewFile { path: path.clone() });
            Ok(SanitizedOp {
                path,
                kind: FileOpKind::Add,
                body: OpBody::Content(String::new()),
            })
        };

    if kind == FileOpKind::Add && text.trim().is_empty() {
        return empty_file(repairs, path);
    }

    let mut diff = match parse_unified_diff(&text) {
        Ok(diff) => diff,
        Err(DiffError::NoHunks) if kind == FileOpKind::Add && declares_new_file(&text) => {
            return empty_file(repairs, path);
        }
        Err(source) => return Err(SanitizeError::MalformedDiff { path, source }),
    };

    for header in [&diff.old_path, &diff.new_path].into_iter().flatten() {
        if header == DEV_NULL {
            continue;
        }
        let named = clean_path(strip_side_prefix(header));
        if named != path {
            return Err(SanitizeError::HeaderMismatch {
                path,
                header: header.clone(),
            });
        }
    }

    if diff.has_headers() {
        let old = diff.old_path.as_deref().map(strip_side_prefix).map(clean_path);
        let new = diff.new_path.as_deref().map(strip_side_prefix).map(clean_path);
        diff.old_path = old;
        diff.new_path = new;
    } else {
        repairs.push(Repair::AddedDiffHeaders { path: path.clone() });
        let old = if kind == FileOpKind::Add {
            DEV_NULL.to_string()
        } else {
            path.clone()
        };
        diff.old_path = Some(old);
        diff.new_path = Some(path.clone());
    }

    if diff.recount() {
        repairs.push(Repair::RecountedHunks { path: path.clone() });
    }

    let new_file = kind == FileOpKind::Add || diff.is_new_file();
    if new_file && diff.is_pure_addition() {
        if kind == FileOpKind::Modify {
            repairs.push(Repair::ModifyOfNewFile { path: path.clone() });
        }
        repairs.push(Repair::NewFileDiffToContent { path: path.clone() });
        return Ok(SanitizedOp {
            body: OpBody::Content(diff.added_text()),
            path,
            kind: FileOpKind::Add,
        });
    }

    Ok(SanitizedOp {
        path,
        kind,
        body: OpBody::Diff(diff),
    })
}

fn declares_new_file(text: &str) -> bool {
    text.lines()
        .any(|line| {
            line.trim_end() == format!("--- {DEV_NULL}") || line.starts_with("new file mode")
        })
}

/// Normalize separators and `.` segments. Paths that cannot be normalized
/// are returned trimmed so the policy step can reject them by name.
fn clean_path(raw: &str) -> String {
    normalize_path(raw).unwrap_or_else(|_| raw.trim().to_string())
}

fn strip_side_prefix(header: &str) -> &str {
    header
        .strip_prefix("a/")
        .or_else(|| header.strip_prefix("b/"))
        .unwrap_or(header)
}
