//! Shared deterministic types for the phase execution core.
//!
//! These types define stable contracts between the kernel, the retry policy,
//! the executor and the Supervisor wire format. They must not depend on
//! external state or I/O.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::policy::PolicyViolation;
use crate::core::quality::QualityIssue;

/// Lifecycle state of a phase. Phases are never deleted, only transitioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    #[default]
    Pending,
    InProgress,
    Complete,
    Blocked,
    Failed,
}

impl PhaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseState::Pending => "PENDING",
            PhaseState::InProgress => "IN_PROGRESS",
            PhaseState::Complete => "COMPLETE",
            PhaseState::Blocked => "BLOCKED",
            PhaseState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PhaseState::Complete | PhaseState::Blocked | PhaseState::Failed
        )
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work in a build run.
///
/// Identity fields come from the run plan. Attempt fields are owned by the
/// executor and retry policy; `attempt_index` only moves forward unless an
/// operator resets the phase, which also bumps `revision_epoch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub index: u32,
    pub tier_id: String,
    #[serde(default)]
    pub description: String,
    /// Targeted context category (e.g. `frontend`, `deployment`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Explicit scope. Empty means the phase declares no scope.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    /// Paths the phase is expected to produce or change.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub attempt_index: u32,
    #[serde(default)]
    pub escalation_level: u32,
    #[serde(default)]
    pub revision_epoch: u32,
    #[serde(default)]
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl Phase {
    pub fn new(id: impl Into<String>, index: u32, tier_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            index,
            tier_id: tier_id.into(),
            description: String::new(),
            category: None,
            scope: Vec::new(),
            deliverables: Vec::new(),
            attempt_index: 0,
            escalation_level: 0,
            revision_epoch: 0,
            state: PhaseState::Pending,
            stop_reason: None,
        }
    }

    pub fn has_scope(&self) -> bool {
        !self.scope.is_empty()
    }

    pub fn attempt_context(&self, max_attempts: u32) -> AttemptContext {
        AttemptContext {
            attempt_index: self.attempt_index,
            max_attempts,
            escalation_level: self.escalation_level,
        }
    }
}

/// Ephemeral per-attempt counters handed to the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptContext {
    pub attempt_index: u32,
    pub max_attempts: u32,
    pub escalation_level: u32,
}

/// Status token returned by the external Patch Proposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Complete,
    TokenEscalation,
    PatchFailed,
    Blocked,
}

impl ProposalStatus {
    /// Rank used when merging batched proposals: the worst status wins.
    pub fn severity(self) -> u8 {
        match self {
            ProposalStatus::Complete => 0,
            ProposalStatus::PatchFailed => 1,
            ProposalStatus::TokenEscalation => 2,
            ProposalStatus::Blocked => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOpKind {
    Add,
    Modify,
    Delete,
}

impl FileOpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileOpKind::Add => "add",
            FileOpKind::Modify => "modify",
            FileOpKind::Delete => "delete",
        }
    }
}

/// A single file operation as proposed. Either `content` (full new text) or
/// `diff` (unified diff fragment) carries the body; deletes carry neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOp {
    pub path: String,
    pub op: FileOpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl FileOp {
    pub fn with_content(
        path: impl Into<String>,
        op: FileOpKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            op,
            content: Some(content.into()),
            diff: None,
        }
    }

    pub fn with_diff(path: impl Into<String>, op: FileOpKind, diff: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op,
            content: None,
            diff: Some(diff.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: FileOpKind::Delete,
            content: None,
            diff: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Structured change returned by the Patch Proposer for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchProposal {
    pub status: ProposalStatus,
    #[serde(default)]
    pub operations: Vec<FileOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Question for a human when the proposer reports `BLOCKED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl PatchProposal {
    pub fn new(status: ProposalStatus, operations: Vec<FileOp>) -> Self {
        Self {
            status,
            operations,
            summary: None,
            question: None,
            usage: None,
        }
    }
}

/// A write computed in memory before anything touches disk.
///
/// `before` is `None` when the file did not exist; `after` is `None` for a
/// delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedWrite {
    pub path: String,
    pub kind: FileOpKind,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl PlannedWrite {
    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }
}

/// Why the kernel refused or failed to apply a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyFailure {
    #[error("policy violation: {}", render_violations(violations))]
    PolicyViolation { violations: Vec<PolicyViolation> },
    #[error("quality rejected: {issue}")]
    QualityRejected { issue: QualityIssue },
    #[error("apply io error: {detail}")]
    ApplyIoError { detail: String },
    #[error("unrepairable patch: {detail}")]
    UnrepairablePatch { detail: String },
}

impl ApplyFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ApplyFailure::PolicyViolation { .. } => "POLICY_VIOLATION",
            ApplyFailure::QualityRejected { .. } => "QUALITY_REJECTED",
            ApplyFailure::ApplyIoError { .. } => "APPLY_IO_ERROR",
            ApplyFailure::UnrepairablePatch { .. } => "UNREPAIRABLE_PATCH",
        }
    }
}

fn render_violations(violations: &[PolicyViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of one `GovernedApplyKernel::apply` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub success: bool,
    pub touched_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ApplyFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

impl ApplyResult {
    pub fn applied(touched_paths: Vec<String>, checkpoint_id: Option<String>) -> Self {
        Self {
            success: true,
            touched_paths,
            failure: None,
            checkpoint_id,
        }
    }

    pub fn failed(failure: ApplyFailure, checkpoint_id: Option<String>) -> Self {
        Self {
            success: false,
            touched_paths: Vec::new(),
            failure: Some(failure),
            checkpoint_id,
        }
    }
}

/// Verification outcome for one attempt.
///
/// `errors` is `None` when no known summary shape matched the output: an
/// unparseable run is never reported as zero errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiResult {
    pub passed: u32,
    pub failed: u32,
    pub errors: Option<u32>,
    pub collection_errors: u32,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
}

impl CiResult {
    pub fn has_collection_errors(&self) -> bool {
        self.collection_errors > 0
    }

    pub fn is_parsed(&self) -> bool {
        self.errors.is_some()
    }

    /// True only when the command exited cleanly and every count is known
    /// and zero.
    pub fn is_green(&self) -> bool {
        !self.timed_out
            && self.exit_code == Some(0)
            && self.failed == 0
            && self.errors == Some(0)
            && self.collection_errors == 0
    }

    pub fn counts(&self) -> CiCounts {
        CiCounts {
            passed: self.passed,
            failed: self.failed,
            errors: self.errors,
            collection_errors: self.collection_errors,
        }
    }
}

/// CI counts carried in reports and stop reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiCounts {
    pub passed: u32,
    pub failed: u32,
    pub errors: Option<u32>,
    pub collection_errors: u32,
}

impl fmt::Display for CiCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errors = match self.errors {
            Some(n) => n.to_string(),
            None => "unknown".to_string(),
        };
        write!(
            f,
            "{} passed, {} failed, {} errors, {} collection errors",
            self.passed, self.failed, errors, self.collection_errors
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    TimedOut,
}

/// A human sign-off bound to one exact payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub phase_id: String,
    pub payload_hash: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    pub status: ApprovalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClarificationStatus {
    Pending,
    Answered,
    Expired,
}

/// A question from the proposer routed to a human through the Supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub id: String,
    pub phase_id: String,
    pub question: String,
    pub status: ClarificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

/// Best-effort record of estimated vs actual token use for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBudgetEvent {
    pub run_id: String,
    pub phase_id: String,
    pub attempt_index: u32,
    pub estimated_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_tokens: Option<u64>,
    pub escalation_factor: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of one attempt, as fed to the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Complete,
    TokenEscalation,
    PatchFailed,
    ProposerBlocked,
    ProposerUnavailable,
    ClarificationAnswered,
    PolicyViolation,
    QualityRejected,
    UnrepairablePatch,
    ApplyIoError,
    CiFailed,
    CiCollectionErrors,
    CiUnparsed,
    ApprovalDenied,
    ApprovalTimedOut,
    ApprovalStale,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Complete => "COMPLETE",
            AttemptOutcome::TokenEscalation => "TOKEN_ESCALATION",
            AttemptOutcome::PatchFailed => "PATCH_FAILED",
            AttemptOutcome::ProposerBlocked => "PROPOSER_BLOCKED",
            AttemptOutcome::ProposerUnavailable => "PROPOSER_UNAVAILABLE",
            AttemptOutcome::ClarificationAnswered => "CLARIFICATION_ANSWERED",
            AttemptOutcome::PolicyViolation => "POLICY_VIOLATION",
            AttemptOutcome::QualityRejected => "QUALITY_REJECTED",
            AttemptOutcome::UnrepairablePatch => "UNREPAIRABLE_PATCH",
            AttemptOutcome::ApplyIoError => "APPLY_IO_ERROR",
            AttemptOutcome::CiFailed => "CI_FAILED",
            AttemptOutcome::CiCollectionErrors => "CI_COLLECTION_ERRORS",
            AttemptOutcome::CiUnparsed => "CI_UNPARSED",
            AttemptOutcome::ApprovalDenied => "APPROVAL_DENIED",
            AttemptOutcome::ApprovalTimedOut => "APPROVAL_TIMED_OUT",
            AttemptOutcome::ApprovalStale => "APPROVAL_STALE",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Taxonomy of reasons a phase ended BLOCKED or FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopKind {
    PolicyViolation,
    QualityRejected,
    UnrepairablePatch,
    ApplyIoError,
    VerificationFailed,
    CollectionErrors,
    VerificationUnparsed,
    PatchFailed,
    TokenCeiling,
    ProposerBlocked,
    ProposerUnavailable,
    ApprovalDenied,
    ApprovalTimedOut,
    ApprovalStale,
    NoProvider,
    Cancelled,
    /// The runner itself failed mid-attempt (context read, rollback).
    InfrastructureError,
}

impl StopKind {
    /// Stop kind for a terminal non-success outcome; `None` for `Complete`.
    pub fn from_outcome(outcome: AttemptOutcome) -> Option<Self> {
        let kind = match outcome {
            AttemptOutcome::PolicyViolation => StopKind::PolicyViolation,
            AttemptOutcome::QualityRejected => StopKind::QualityRejected,
            AttemptOutcome::UnrepairablePatch => StopKind::UnrepairablePatch,
            AttemptOutcome::ApplyIoError => StopKind::ApplyIoError,
            AttemptOutcome::CiFailed => StopKind::VerificationFailed,
            AttemptOutcome::CiCollectionErrors => StopKind::CollectionErrors,
            AttemptOutcome::CiUnparsed => StopKind::VerificationUnparsed,
            AttemptOutcome::PatchFailed => StopKind::PatchFailed,
            AttemptOutcome::TokenEscalation => StopKind::TokenCeiling,
            AttemptOutcome::ProposerBlocked | AttemptOutcome::ClarificationAnswered => {
                StopKind::ProposerBlocked
            }
            AttemptOutcome::ProposerUnavailable => StopKind::ProposerUnavailable,
            AttemptOutcome::ApprovalDenied => StopKind::ApprovalDenied,
            AttemptOutcome::ApprovalTimedOut => StopKind::ApprovalTimedOut,
            AttemptOutcome::ApprovalStale => StopKind::ApprovalStale,
            AttemptOutcome::Complete => return None,
        };
        Some(kind)
    }
}

/// Human-readable reason plus enough structure to diagnose without a rerun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReason {
    pub kind: StopKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub touched_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci: Option<CiCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
}

impl StopReason {
    pub fn new(kind: StopKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            touched_paths: Vec::new(),
            ci: None,
            approval_id: None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
