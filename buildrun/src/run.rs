//! `buildrun run` and `buildrun reset-phase`.
//!
//! Phases execute strictly in plan order under a workspace lease. The run
//! stops at the first phase that ends BLOCKED or FAILED; COMPLETE phases from
//! an earlier run are skipped.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::{Phase, PhaseState, StopKind};
use crate::exit_codes;
use crate::executor::{ExecutorDeps, PhaseExecutor};
use crate::io::cancel::CancelToken;
use crate::io::config::{RunConfig, load_config};
use crate::io::init::BuildrunPaths;
use crate::io::lease::WorkspaceLease;
use crate::io::plan::load_plan;
use crate::io::run_state::{RunState, load_run_state, load_run_state_opt, write_run_state};

/// Overrides for the default `.buildrun/` locations.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub plan_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    Blocked { phase_id: String },
    Failed { phase_id: String },
    Cancelled { phase_id: String },
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Complete => exit_codes::OK,
            RunStatus::Blocked { .. } => exit_codes::BLOCKED,
            RunStatus::Failed { .. } => exit_codes::FAILED,
            RunStatus::Cancelled { .. } => exit_codes::CANCELLED,
        }
    }

    fn for_phase(phase: &Phase) -> Option<Self> {
        let phase_id = phase.id.clone();
        match phase.state {
            PhaseState::Blocked => Some(RunStatus::Blocked { phase_id }),
            PhaseState::Failed
                if phase
                    .stop_reason
                    .as_ref()
                    .is_some_and(|r| r.kind == StopKind::Cancelled) =>
            {
                Some(RunStatus::Cancelled { phase_id })
            }
            PhaseState::Failed => Some(RunStatus::Failed { phase_id }),
            PhaseState::Pending | PhaseState::InProgress | PhaseState::Complete => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    /// Phases that ran at least one attempt in this invocation.
    pub phases_executed: u32,
    pub status: RunStatus,
}

/// Execute the plan until every phase is COMPLETE or one stops the run.
///
/// `on_phase` is called with each phase after it reaches a terminal state.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_plan<F>(
    root: &Path,
    options: &RunOptions,
    deps: ExecutorDeps<'_>,
    cancel: CancelToken,
    mut on_phase: F,
) -> Result<RunOutcome>
where
    F: FnMut(&Phase),
{
    let paths = BuildrunPaths::new(root);
    let config_path = options.config_path.as_ref().unwrap_or(&paths.config_path);
    let plan_path = options.plan_path.as_ref().unwrap_or(&paths.plan_path);
    let config = load_config(config_path)?;
    let plan = load_plan(plan_path)?;

    let previous = load_run_state_opt(&paths.run_state_path)?;
    let now = deps.clock.now();
    let run_id = plan
        .run_id
        .clone()
        .or_else(|| previous.as_ref().map(|s| s.run_id.clone()))
        .unwrap_or_else(|| now.format("run-%Y%m%dT%H%M%SZ").to_string());

    let _lease = WorkspaceLease::acquire(&paths.lease_path, &run_id)?;
    clear_stale_cancel(&paths.cancel_path)?;

    let mut state = match previous {
        Some(previous) if previous.run_id == run_id => {
            info!(run_id = %run_id, "resuming run");
            RunState::reconcile(previous, plan.phases(), now)
        }
        Some(previous) => {
            info!(previous = %previous.run_id, run_id = %run_id, "starting new run");
            RunState::new(&run_id, plan.phases(), now)
        }
        None => RunState::new(&run_id, plan.phases(), now),
    };
    write_run_state(&paths.run_state_path, &state)?;

    let mut executor = PhaseExecutor::new(root, &run_id, &config, deps, cancel)?;
    let mut phases_executed = 0u32;
    for index in 0..state.phases.len() {
        let mut phase = state.phases[index].clone();
        if phase.state == PhaseState::Complete {
            continue;
        }
        if !phase.state.is_terminal() {
            phases_executed += 1;
            executor.execute(&mut phase, |current| {
                state.phases[index] = current.clone();
                state.updated_at = deps.clock.now();
                write_run_state(&paths.run_state_path, &state)
            })?;
            on_phase(&phase);
        }
        if let Some(status) = RunStatus::for_phase(&phase) {
            warn!(phase_id = %phase.id, state = %phase.state, "run stopped");
            return Ok(RunOutcome {
                run_id,
                phases_executed,
                status,
            });
        }
    }
    info!(run_id = %run_id, phases_executed, "run complete");
    Ok(RunOutcome {
        run_id,
        phases_executed,
        status: RunStatus::Complete,
    })
}

/// Load the workspace config, for callers that build dependencies before
/// starting a run.
pub fn load_run_config(root: &Path, options: &RunOptions) -> Result<RunConfig> {
    let paths = BuildrunPaths::new(root);
    load_config(options.config_path.as_ref().unwrap_or(&paths.config_path))
}

/// Operator reset of one phase: counters back to zero, revision bumped.
#[instrument(skip_all, fields(phase_id = %phase_id))]
pub fn reset_phase(root: &Path, phase_id: &str) -> Result<Phase> {
    let paths = BuildrunPaths::new(root);
    let mut state = load_run_state(&paths.run_state_path)
        .context("no run state to reset (run `buildrun run` first)")?;
    let _lease = WorkspaceLease::acquire(&paths.lease_path, &state.run_id)?;
    let phase = state.reset_phase(phase_id)?.clone();
    write_run_state(&paths.run_state_path, &state)?;
    Ok(phase)
}

/// Ask a running executor to stop at its next suspension point.
pub fn request_cancel(root: &Path) -> Result<PathBuf> {
    let paths = BuildrunPaths::new(root);
    fs::write(&paths.cancel_path, b"cancel\n")
        .with_context(|| format!("write {}", paths.cancel_path.display()))?;
    Ok(paths.cancel_path)
}

fn clear_stale_cancel(path: &Path) -> Result<()> {
    if path.exists() {
        warn!(path = %path.display(), "removing stale cancel request");
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}
