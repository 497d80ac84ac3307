//! Pure retry and escalation decisions.
//!
//! `RetryPolicy::decide` maps an attempt context and an attempt outcome to
//! the next step. Every decided attempt consumes one attempt index, so the
//! index after `n` decisions is always `n`. Ceilings come from
//! configuration: `max_attempts` and the length of the escalation ladder.

use serde::{Deserialize, Serialize};

use crate::core::types::{AttemptContext, AttemptOutcome, PhaseState};

/// One step on the escalation ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRung {
    /// Capability tier handed to the provider resolver (e.g. `standard`).
    pub tier: String,
    /// Token budget granted to an attempt at this level.
    pub max_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EscalationLadder {
    rungs: Vec<EscalationRung>,
}

impl Default for EscalationLadder {
    fn default() -> Self {
        Self::new(vec![
            EscalationRung {
                tier: "standard".to_string(),
                max_tokens: 16_000,
            },
            EscalationRung {
                tier: "extended".to_string(),
                max_tokens: 32_000,
            },
            EscalationRung {
                tier: "maximum".to_string(),
                max_tokens: 64_000,
            },
        ])
    }
}

impl EscalationLadder {
    pub fn new(rungs: Vec<EscalationRung>) -> Self {
        Self { rungs }
    }

    pub fn rungs(&self) -> &[EscalationRung] {
        &self.rungs
    }

    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }

    /// Highest reachable escalation level.
    pub fn ceiling(&self) -> u32 {
        u32::try_from(self.rungs.len().saturating_sub(1)).unwrap_or(u32::MAX)
    }

    /// Rung for `level`, clamped to the top of the ladder.
    pub fn rung(&self, level: u32) -> Option<&EscalationRung> {
        let idx = (level as usize).min(self.rungs.len().checked_sub(1)?);
        self.rungs.get(idx)
    }

    /// Budget multiplier of `level` relative to the first rung.
    pub fn factor(&self, level: u32) -> f64 {
        match (self.rungs.first(), self.rung(level)) {
            (Some(base), Some(rung)) if base.max_tokens > 0 => {
                rung.max_tokens as f64 / base.max_tokens as f64
            }
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptDecision {
    pub next_attempt_index: u32,
    pub escalation_level: u32,
    pub should_escalate: bool,
    pub should_run_diagnostics: bool,
    pub terminal: bool,
    /// Phase state to record when `terminal`.
    pub final_state: Option<PhaseState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    ladder: EscalationLadder,
}

impl RetryPolicy {
    pub fn new(ladder: EscalationLadder) -> Self {
        Self { ladder }
    }

    pub fn ladder(&self) -> &EscalationLadder {
        &self.ladder
    }

    pub fn decide(&self, ctx: AttemptContext, outcome: AttemptOutcome) -> AttemptDecision {
        let next = ctx.attempt_index.saturating_add(1);
        let exhausted = next >= ctx.max_attempts;
        let can_escalate = ctx.escalation_level < self.ladder.ceiling();

        let stay = |terminal: bool, final_state: Option<PhaseState>| AttemptDecision {
            next_attempt_index: next,
            escalation_level: ctx.escalation_level,
            should_escalate: false,
            should_run_diagnostics: false,
            terminal,
            final_state,
        };

        match outcome {
            AttemptOutcome::Complete => stay(true, Some(PhaseState::Complete)),

            // A resource signal: bounded by the ladder, not by max_attempts.
            AttemptOutcome::TokenEscalation => {
                if can_escalate {
                    escalate(ctx, next, false)
                } else {
                    stay(true, Some(PhaseState::Failed))
                }
            }

            AttemptOutcome::PolicyViolation
            | AttemptOutcome::ProposerBlocked
            | AttemptOutcome::ApprovalDenied
            | AttemptOutcome::ApprovalTimedOut
            | AttemptOutcome::ApprovalStale => stay(true, Some(PhaseState::Blocked)),

            AttemptOutcome::ProposerUnavailable => {
                if exhausted {
                    stay(true, Some(PhaseState::Failed))
                } else if can_escalate {
                    escalate(ctx, next, false)
                } else {
                    stay(false, None)
                }
            }

            AttemptOutcome::ClarificationAnswered => {
                if exhausted {
                    stay(true, Some(PhaseState::Failed))
                } else {
                    stay(false, None)
                }
            }

            AttemptOutcome::PatchFailed
            | AttemptOutcome::QualityRejected
            | AttemptOutcome::UnrepairablePatch
            | AttemptOutcome::ApplyIoError
            | AttemptOutcome::CiFailed
            | AttemptOutcome::CiCollectionErrors
            | AttemptOutcome::CiUnparsed => {
                if exhausted {
                    stay(true, Some(PhaseState::Failed))
                } else if can_escalate {
                    escalate(ctx, next, true)
                } else {
                    AttemptDecision {
                        should_run_diagnostics: true,
                        ..stay(false, None)
                    }
                }
            }
        }
    }
}

fn escalate(ctx: AttemptContext, next: u32, diagnostics: bool) -> AttemptDecision {
    AttemptDecision {
        next_attempt_index: next,
        escalation_level: ctx.escalation_level + 1,
        should_escalate: true,
        should_run_diagnostics: diagnostics,
        terminal: false,
        final_state: None,
    }
}
