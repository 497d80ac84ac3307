//! Workspace layout under `.buildrun/` and scaffolding for new workspaces.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::config::{RunConfig, write_config};
use crate::io::plan::{PlanFile, write_plan};

const BUILDRUN_GITIGNORE: &str = "state/\nattempts/\ntelemetry/\nci/\nlease.lock\nCANCEL\n";

/// Well-known paths inside a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildrunPaths {
    pub root: PathBuf,
    pub buildrun_dir: PathBuf,
    pub state_dir: PathBuf,
    pub attempts_dir: PathBuf,
    pub ci_dir: PathBuf,
    pub telemetry_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub plan_path: PathBuf,
    pub run_state_path: PathBuf,
    pub lease_path: PathBuf,
    pub cancel_path: PathBuf,
    pub token_budget_path: PathBuf,
    pub usage_path: PathBuf,
}

impl BuildrunPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let buildrun_dir = root.join(".buildrun");
        let state_dir = buildrun_dir.join("state");
        let telemetry_dir = buildrun_dir.join("telemetry");
        Self {
            root: root.clone(),
            buildrun_dir: buildrun_dir.clone(),
            state_dir: state_dir.clone(),
            attempts_dir: buildrun_dir.join("attempts"),
            ci_dir: buildrun_dir.join("ci"),
            telemetry_dir: telemetry_dir.clone(),
            gitignore_path: buildrun_dir.join(".gitignore"),
            config_path: buildrun_dir.join("config.toml"),
            plan_path: buildrun_dir.join("plan.toml"),
            run_state_path: state_dir.join("run_state.json"),
            lease_path: buildrun_dir.join("lease.lock"),
            cancel_path: buildrun_dir.join("CANCEL"),
            token_budget_path: telemetry_dir.join("token_budget.jsonl"),
            usage_path: telemetry_dir.join("usage.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite an existing config and plan.
    pub force: bool,
}

/// Create `.buildrun/` with a default config and an empty plan.
#[instrument(skip_all, fields(root = %root.display(), force = options.force))]
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<BuildrunPaths> {
    let paths = BuildrunPaths::new(root);
    if paths.buildrun_dir.exists() && !paths.buildrun_dir.is_dir() {
        return Err(anyhow!("buildrun init: .buildrun exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "buildrun init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    for dir in [&paths.buildrun_dir, &paths.state_dir, &paths.attempts_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(&paths.gitignore_path, BUILDRUN_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &RunConfig::default())?;
    if options.force || !paths.plan_path.exists() {
        write_plan(&paths.plan_path, &PlanFile::default())?;
    }
    debug!("workspace initialized");
    Ok(paths)
}

/// Atomically replace `path` with `contents` (temp file + rename).
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
