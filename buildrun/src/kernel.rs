//! Governed patch application.
//!
//! Every proposal goes through the same gate: sanitize, policy, quality,
//! checkpoint, write. Each step short-circuits with a structured
//! `ApplyFailure`, and nothing reaches disk before the checkpoint.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::policy::{PatchPolicy, PolicyViolation, ViolationRule};
use crate::core::quality::QualityValidator;
use crate::core::sanitizer::{Repair, sanitize};
use crate::core::types::{ApplyFailure, ApplyResult, PatchProposal, PlannedWrite};
use crate::io::apply::ApplyEngine;
use crate::io::checkpoint::RunCheckpoint;
use crate::io::config::RunConfig;

/// A proposal that passed every check, with the exact bytes it will write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPatch {
    pub writes: Vec<PlannedWrite>,
    pub repairs: Vec<Repair>,
}

impl PreparedPatch {
    /// Paths that will actually change.
    pub fn changed_paths(&self) -> Vec<String> {
        self.writes
            .iter()
            .filter(|w| !w.is_noop())
            .map(|w| w.path.clone())
            .collect()
    }
}

pub struct GovernedApplyKernel<'a> {
    policy: PatchPolicy,
    quality: QualityValidator,
    engine: ApplyEngine,
    checkpoint: &'a dyn RunCheckpoint,
}

impl<'a> GovernedApplyKernel<'a> {
    pub fn new(
        policy: PatchPolicy,
        quality: QualityValidator,
        engine: ApplyEngine,
        checkpoint: &'a dyn RunCheckpoint,
    ) -> Self {
        Self {
            policy,
            quality,
            engine,
            checkpoint,
        }
    }

    pub fn from_config(
        root: impl Into<PathBuf>,
        config: &RunConfig,
        checkpoint: &'a dyn RunCheckpoint,
    ) -> Result<Self> {
        let policy = PatchPolicy::from_config(&config.policy).context("build patch policy")?;
        Ok(Self::new(
            policy,
            QualityValidator::new(config.quality.clone()),
            ApplyEngine::new(root),
            checkpoint,
        ))
    }

    /// Sanitize, check policy and validate quality without writing.
    #[instrument(skip_all, fields(operations = proposal.operations.len()))]
    pub fn preflight(
        &self,
        proposal: &PatchProposal,
        scope: &[String],
    ) -> Result<PreparedPatch, ApplyFailure> {
        let sanitized = sanitize(proposal).map_err(|err| ApplyFailure::UnrepairablePatch {
            detail: err.to_string(),
        })?;
        for repair in &sanitized.repairs {
            debug!(%repair, "patch repaired");
        }

        let policy = self.policy.clone().with_scope(scope).map_err(|err| {
            ApplyFailure::PolicyViolation {
                violations: vec![PolicyViolation {
                    path: scope.join(", "),
                    rule: ViolationRule::InvalidPath,
                    pattern: Some(err.to_string()),
                }],
            }
        })?;
        policy
            .check_paths(sanitized.paths())
            .map_err(|violations| {
                warn!(count = violations.len(), "policy rejected patch");
                ApplyFailure::PolicyViolation { violations }
            })?;
        self.engine
            .check_containment(sanitized.paths())
            .map_err(|violations| {
                warn!(count = violations.len(), "patch leaves the workspace on disk");
                ApplyFailure::PolicyViolation { violations }
            })?;

        let originals = self.engine.read_originals(sanitized.paths())?;
        let writes = self
            .quality
            .validate(&sanitized, &originals)
            .map_err(|issue| {
                warn!(%issue, "quality rejected patch");
                ApplyFailure::QualityRejected { issue }
            })?;
        Ok(PreparedPatch {
            writes,
            repairs: sanitized.repairs,
        })
    }

    /// Checkpoint the tree, then write a prepared patch.
    #[instrument(skip_all, fields(label = %label, writes = prepared.writes.len()))]
    pub fn apply_prepared(&self, prepared: &PreparedPatch, label: &str) -> ApplyResult {
        let checkpoint_id = match self.checkpoint.checkpoint(label) {
            Ok(id) => id,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "checkpoint failed, nothing written");
                return ApplyResult::failed(
                    ApplyFailure::ApplyIoError {
                        detail: format!("checkpoint failed: {err:#}"),
                    },
                    None,
                );
            }
        };
        match self.engine.apply(&prepared.writes) {
            Ok(touched) => {
                info!(touched = touched.len(), checkpoint = %checkpoint_id, "patch applied");
                ApplyResult::applied(touched, Some(checkpoint_id))
            }
            Err(failure) => {
                if let Err(err) = self.checkpoint.rollback(&checkpoint_id) {
                    warn!(
                        err = %format!("{err:#}"),
                        checkpoint = %checkpoint_id,
                        "rollback after failed write failed"
                    );
                }
                ApplyResult::failed(failure, Some(checkpoint_id))
            }
        }
    }

    /// Full gate in one call.
    pub fn apply(&self, proposal: &PatchProposal, scope: &[String], label: &str) -> ApplyResult {
        match self.preflight(proposal, scope) {
            Ok(prepared) => self.apply_prepared(&prepared, label),
            Err(failure) => ApplyResult::failed(failure, None),
        }
    }

    /// Undo an applied patch: restore the checkpoint, then put each planned
    /// path back to its `before` bytes. The second step covers paths the
    /// checkpoint does not track, such as git-ignored files.
    pub fn rollback(&self, checkpoint_id: &str, prepared: &PreparedPatch) -> Result<()> {
        self.checkpoint
            .rollback(checkpoint_id)
            .with_context(|| format!("rollback to checkpoint {checkpoint_id}"))?;
        self.engine
            .restore(&prepared.writes)
            .map_err(|failure| anyhow!("restore planned writes: {failure}"))
    }
}
