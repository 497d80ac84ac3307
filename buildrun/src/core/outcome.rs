//! Classification of one attempt's results into an `AttemptOutcome`, and
//! the stop reason recorded when that outcome ends the phase.

use crate::core::types::{
    ApplyFailure, ApplyResult, AttemptOutcome, CiResult, ProposalStatus, StopKind, StopReason,
};

/// Outcome implied by the proposer status alone. `None` for `COMPLETE`,
/// which still has to survive apply and CI.
pub fn classify_status(status: ProposalStatus) -> Option<AttemptOutcome> {
    match status {
        ProposalStatus::Complete => None,
        ProposalStatus::TokenEscalation => Some(AttemptOutcome::TokenEscalation),
        ProposalStatus::PatchFailed => Some(AttemptOutcome::PatchFailed),
        ProposalStatus::Blocked => Some(AttemptOutcome::ProposerBlocked),
    }
}

pub fn classify_apply(failure: &ApplyFailure) -> AttemptOutcome {
    match failure {
        ApplyFailure::PolicyViolation { .. } => AttemptOutcome::PolicyViolation,
        ApplyFailure::QualityRejected { .. } => AttemptOutcome::QualityRejected,
        ApplyFailure::ApplyIoError { .. } => AttemptOutcome::ApplyIoError,
        ApplyFailure::UnrepairablePatch { .. } => AttemptOutcome::UnrepairablePatch,
    }
}

/// Collection errors outrank everything else; an unparsed summary is never
/// read as success even when the command exited zero.
pub fn classify_ci(ci: &CiResult) -> AttemptOutcome {
    if ci.has_collection_errors() {
        AttemptOutcome::CiCollectionErrors
    } else if ci.timed_out {
        AttemptOutcome::CiFailed
    } else if !ci.is_parsed() {
        AttemptOutcome::CiUnparsed
    } else if ci.is_green() {
        AttemptOutcome::Complete
    } else {
        AttemptOutcome::CiFailed
    }
}

/// Build the stop reason for a terminal non-success outcome.
pub fn stop_reason(
    outcome: AttemptOutcome,
    message: impl Into<String>,
    apply: Option<&ApplyResult>,
    ci: Option<&CiResult>,
) -> Option<StopReason> {
    let kind = StopKind::from_outcome(outcome)?;
    let mut reason = StopReason::new(kind, message);
    if let Some(apply) = apply {
        reason.touched_paths.clone_from(&apply.touched_paths);
    }
    reason.ci = ci.map(CiResult::counts);
    Some(reason)
}

/// One-line human description of an outcome and its evidence.
pub fn describe(
    outcome: AttemptOutcome,
    apply: Option<&ApplyResult>,
    ci: Option<&CiResult>,
) -> String {
    if let Some(failure) = apply.and_then(|a| a.failure.as_ref()) {
        return failure.to_string();
    }
    match (outcome, ci) {
        (AttemptOutcome::CiCollectionErrors, Some(ci)) => format!(
            "{} collection errors; the change did not reach a testable state",
            ci.collection_errors
        ),
        (AttemptOutcome::CiUnparsed, Some(ci)) => format!(
            "verification output not recognized (exit code {})",
            ci.exit_code.map_or_else(|| "none".to_string(), |c| c.to_string())
        ),
        (AttemptOutcome::CiFailed, Some(ci)) if ci.timed_out => {
            "verification timed out".to_string()
        }
        (AttemptOutcome::CiFailed, Some(ci)) => format!("verification failed: {}", ci.counts()),
        (AttemptOutcome::TokenEscalation, _) => {
            "proposer exhausted its budget at the top of the escalation ladder".to_string()
        }
        (AttemptOutcome::PatchFailed, _) => "proposer could not produce a patch".to_string(),
        (AttemptOutcome::ProposerBlocked, _) => "proposer needs human input".to_string(),
        (other, _) => other.as_str().to_lowercase().replace('_', " "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::{PolicyViolation, ViolationRule};

    fn ci(passed: u32, failed: u32, errors: Option<u32>, collection: u32, exit: i32) -> CiResult {
        CiResult {
            passed,
            failed,
            errors,
            collection_errors: collection,
            exit_code: Some(exit),
            timed_out: false,
            log_path: None,
            shape: None,
        }
    }

    #[test]
    fn green_ci_is_complete() {
        assert_eq!(classify_ci(&ci(12, 0, Some(0), 0, 0)), AttemptOutcome::Complete);
    }

    #[test]
    fn collection_errors_outrank_everything() {
        let result = ci(0, 0, Some(10), 10, 0);
        assert_eq!(classify_ci(&result), AttemptOutcome::CiCollectionErrors);
        let reason = stop_reason(AttemptOutcome::CiCollectionErrors, "x", None, Some(&result))
            .expect("stop reason");
        assert_eq!(reason.kind, StopKind::CollectionErrors);
        assert_eq!(reason.ci.map(|c| c.collection_errors), Some(10));
    }

    #[test]
    fn unknown_counts_are_not_success() {
        assert_eq!(classify_ci(&ci(0, 0, None, 0, 0)), AttemptOutcome::CiUnparsed);
    }

    #[test]
    fn nonzero_exit_or_failures_fail() {
        assert_eq!(classify_ci(&ci(5, 1, Some(0), 0, 1)), AttemptOutcome::CiFailed);
        assert_eq!(classify_ci(&ci(5, 0, Some(0), 0, 2)), AttemptOutcome::CiFailed);
        let mut timed_out = ci(5, 0, Some(0), 0, 0);
        timed_out.timed_out = true;
        assert_eq!(classify_ci(&timed_out), AttemptOutcome::CiFailed);
        assert_eq!(
            describe(AttemptOutcome::CiFailed, None, Some(&timed_out)),
            "verification timed out"
        );
    }

    #[test]
    fn apply_failures_map_one_to_one() {
        let failure = ApplyFailure::PolicyViolation {
            violations: vec![PolicyViolation {
                path: ".git/config".to_string(),
                rule: ViolationRule::AlwaysProtected,
                pattern: Some(".git/**".to_string()),
            }],
        };
        assert_eq!(classify_apply(&failure), AttemptOutcome::PolicyViolation);
        let apply = ApplyResult::failed(failure, None);
        let text = describe(AttemptOutcome::PolicyViolation, Some(&apply), None);
        assert!(text.contains(".git/config"), "{text}");
    }

    #[test]
    fn complete_has_no_stop_reason() {
        assert!(stop_reason(AttemptOutcome::Complete, "done", None, None).is_none());
        assert_eq!(classify_status(ProposalStatus::Complete), None);
        assert_eq!(
            classify_status(ProposalStatus::Blocked),
            Some(AttemptOutcome::ProposerBlocked)
        );
    }
}
