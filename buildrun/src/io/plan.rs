//! Run plan stored at `.buildrun/plan.toml`.
//!
//! The plan is the human-authored list of phases. It only carries identity
//! and intent; attempt counters live in the run state.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::path_pattern::PatternSet;
use crate::core::types::Phase;
use crate::io::init::write_atomic;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlanFile {
    /// Explicit run id. Generated at run start when absent.
    pub run_id: Option<String>,
    #[serde(rename = "phase")]
    pub phases: Vec<PlannedPhase>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannedPhase {
    pub id: String,
    pub tier: String,
    pub description: String,
    pub category: Option<String>,
    pub scope: Vec<String>,
    pub deliverables: Vec<String>,
}

impl PlanFile {
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for phase in &self.phases {
            if phase.id.trim().is_empty() {
                return Err(anyhow!("phase.id must be non-empty"));
            }
            if !seen.insert(phase.id.as_str()) {
                return Err(anyhow!("duplicate phase id {}", phase.id));
            }
            PatternSet::parse(&phase.scope)
                .with_context(|| format!("phase {} scope", phase.id))?;
        }
        Ok(())
    }

    /// Materialize plan entries as fresh phases, in plan order.
    pub fn phases(&self) -> Vec<Phase> {
        self.phases
            .iter()
            .zip(0u32..)
            .map(|(planned, index)| {
                let mut phase = Phase::new(&planned.id, index, &planned.tier);
                phase.description.clone_from(&planned.description);
                phase.category.clone_from(&planned.category);
                phase.scope.clone_from(&planned.scope);
                phase.deliverables.clone_from(&planned.deliverables);
                phase
            })
            .collect()
    }
}

pub fn load_plan(path: &Path) -> Result<PlanFile> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let plan: PlanFile =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    plan.validate()
        .with_context(|| format!("invalid plan {}", path.display()))?;
    Ok(plan)
}

pub fn write_plan(path: &Path, plan: &PlanFile) -> Result<()> {
    plan.validate()?;
    let mut buf = toml::to_string_pretty(plan).context("serialize plan toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
