//! Persisted run state (`.buildrun/state/run_state.json`).
//!
//! Written after every attempt so a crashed run resumes with its attempt
//! counters intact.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::types::{Phase, PhaseState};
use crate::io::init::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Phases in plan order.
    pub phases: Vec<Phase>,
    /// Phases that were dropped from the plan. Kept, never deleted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retired: Vec<Phase>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, phases: Vec<Phase>, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: now,
            updated_at: now,
            phases,
            retired: Vec::new(),
        }
    }

    /// Merge a freshly materialized plan into previously persisted state.
    ///
    /// Identity and intent come from the plan; attempt counters, state and
    /// revision come from the persisted phase with the same id.
    pub fn reconcile(previous: RunState, planned: Vec<Phase>, now: DateTime<Utc>) -> Self {
        let RunState {
            run_id,
            started_at,
            phases: old_phases,
            mut retired,
            ..
        } = previous;

        let mut old_phases: Vec<Option<Phase>> = old_phases.into_iter().map(Some).collect();
        let mut phases = Vec::with_capacity(planned.len());
        for mut phase in planned {
            let prior = old_phases
                .iter_mut()
                .find(|p| p.as_ref().is_some_and(|p| p.id == phase.id))
                .and_then(Option::take)
                .or_else(|| {
                    let pos = retired.iter().position(|p| p.id == phase.id)?;
                    Some(retired.remove(pos))
                });
            if let Some(prior) = prior {
                phase.attempt_index = prior.attempt_index;
                phase.escalation_level = prior.escalation_level;
                phase.revision_epoch = prior.revision_epoch;
                phase.state = prior.state;
                phase.stop_reason = prior.stop_reason;
            }
            phases.push(phase);
        }
        retired.extend(old_phases.into_iter().flatten());

        Self {
            run_id,
            started_at,
            updated_at: now,
            phases,
            retired,
        }
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_mut(&mut self, id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == id)
    }

    /// Operator reset: the only path that moves `attempt_index` backwards.
    /// Bumps `revision_epoch` so approvals for the old revision go stale.
    pub fn reset_phase(&mut self, id: &str) -> Result<&Phase> {
        let phase = self
            .phase_mut(id)
            .ok_or_else(|| anyhow!("unknown phase {id}"))?;
        if phase.state == PhaseState::InProgress {
            return Err(anyhow!("phase {id} is in progress"));
        }
        phase.attempt_index = 0;
        phase.escalation_level = 0;
        phase.revision_epoch += 1;
        phase.state = PhaseState::Pending;
        phase.stop_reason = None;
        info!(phase_id = id, revision_epoch = phase.revision_epoch, "phase reset");
        Ok(phase)
    }
}

pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(run_id = %state.run_id, phases = state.phases.len(), "run state loaded");
    Ok(state)
}

/// Load run state if present.
pub fn load_run_state_opt(path: &Path) -> Result<Option<RunState>> {
    if !path.exists() {
        return Ok(None);
    }
    load_run_state(path).map(Some)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), run_id = %state.run_id, "writing run state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    /// Verifies write then read preserves all fields.
    #[test]
    fn run_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/run_state.json");
        let mut phase = Phase::new("p1", 0, "t1");
        phase.attempt_index = 2;
        phase.state = PhaseState::Failed;
        let state = RunState::new("run-1", vec![phase], now());

        write_run_state(&path, &state).expect("write");
        assert_eq!(load_run_state(&path).expect("load"), state);
        assert!(load_run_state_opt(&temp.path().join("none.json")).expect("opt").is_none());
    }

    /// Verifies counters survive a plan reload and removed phases are retired.
    #[test]
    fn reconcile_keeps_counters_and_retires_dropped_phases() {
        let mut a = Phase::new("a", 0, "t");
        a.attempt_index = 3;
        a.state = PhaseState::Complete;
        let b = Phase::new("b", 1, "t");
        let previous = RunState::new("run-1", vec![a, b], now());

        let mut planned_a = Phase::new("a", 0, "t");
        planned_a.description = "updated".to_string();
        let planned_c = Phase::new("c", 1, "t");
        let merged = RunState::reconcile(previous, vec![planned_a, planned_c], now());

        let a = merged.phase("a").expect("a");
        assert_eq!(a.attempt_index, 3);
        assert_eq!(a.state, PhaseState::Complete);
        assert_eq!(a.description, "updated");
        assert_eq!(merged.phase("c").expect("c").attempt_index, 0);
        assert_eq!(merged.retired.len(), 1);
        assert_eq!(merged.retired[0].id, "b");
    }

    #[test]
    fn reset_phase_bumps_revision() {
        let mut phase = Phase::new("p1", 0, "t1");
        phase.attempt_index = 3;
        phase.escalation_level = 2;
        phase.state = PhaseState::Blocked;
        let mut state = RunState::new("run-1", vec![phase], now());

        let reset = state.reset_phase("p1").expect("reset");
        assert_eq!(reset.attempt_index, 0);
        assert_eq!(reset.escalation_level, 0);
        assert_eq!(reset.revision_epoch, 1);
        assert_eq!(reset.state, PhaseState::Pending);
        assert!(state.reset_phase("missing").is_err());
    }
}
