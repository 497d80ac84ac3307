//! Run configuration stored at `.buildrun/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::approval::{ApprovalPolicy, ApprovalRules};
use crate::core::path_pattern::PatternSet;
use crate::core::policy::{PatchPolicy, PolicyConfig};
use crate::core::quality::QualityConfig;
use crate::core::retry::EscalationLadder;
use crate::io::init::write_atomic;

/// Run configuration (TOML).
///
/// Loaded once at run start and read-only afterwards. Missing sections fall
/// back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub run: RunSection,
    pub policy: PolicyConfig,
    /// Escalation ladder, lowest rung first (`[[escalation]]`).
    pub escalation: EscalationLadder,
    /// Provider fallback chain, highest priority first (`[[providers]]`).
    pub providers: Vec<ProviderConfig>,
    pub proposer: ProposerConfig,
    pub ci: CiConfig,
    pub context: ContextConfig,
    pub approval: ApprovalConfig,
    pub clarification: ClarificationConfig,
    pub supervisor: SupervisorConfig,
    pub dispatch: DispatchConfig,
    pub quality: QualityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunSection {
    /// Attempts per phase before a defect outcome becomes terminal.
    pub max_attempts: u32,
    /// Fresh approval requests allowed after a stale one, per attempt.
    pub max_stale_reissues: u32,
    /// Restore the pre-apply checkpoint after a failed verification.
    pub rollback_on_ci_failure: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_stale_reissues: 1,
            rollback_on_ci_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    /// Models by escalation level; the last one is reused above its length.
    pub models: Vec<String>,
    /// Consecutive infrastructure failures before the provider is disabled.
    pub disable_after: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            models: vec!["default".to_string()],
            disable_after: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProposerConfig {
    /// Program and arguments of the Patch Proposer adapter.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            command: vec!["buildrun-proposer".to_string()],
            timeout_secs: 15 * 60,
            output_limit_bytes: 4_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CiConfig {
    /// Shell command run with `sh -c` from the workspace root.
    pub command: String,
    pub timeout_secs: u64,
    /// Bytes kept from the start and from the end of the persisted log.
    pub log_head_bytes: usize,
    pub log_tail_bytes: usize,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            command: "just ci".to_string(),
            timeout_secs: 20 * 60,
            log_head_bytes: 20_000,
            log_tail_bytes: 80_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub max_files: usize,
    pub max_bytes: usize,
    /// Globs ranked above recently touched files by the heuristic tier.
    pub priority_globs: Vec<String>,
    /// Targeted file sets keyed by phase category.
    pub categories: BTreeMap<String, Vec<String>>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        let mut categories = BTreeMap::new();
        categories.insert(
            "frontend".to_string(),
            vec![
                "**/*.tsx".to_string(),
                "**/*.jsx".to_string(),
                "**/*.css".to_string(),
                "package.json".to_string(),
            ],
        );
        categories.insert(
            "deployment".to_string(),
            vec![
                "Dockerfile".to_string(),
                "**/*.yaml".to_string(),
                "**/*.yml".to_string(),
                "deploy/**".to_string(),
            ],
        );
        Self {
            max_files: 40,
            max_bytes: 400_000,
            priority_globs: vec!["README.md".to_string(), "Cargo.toml".to_string()],
            categories,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApprovalConfig {
    #[serde(flatten)]
    pub rules: ApprovalRules,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            rules: ApprovalRules::default(),
            poll_interval_secs: 15,
            timeout_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClarificationConfig {
    /// Ask the Supervisor when the proposer reports BLOCKED with a question.
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ClarificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 15,
            timeout_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Base URL of the Supervisor API. Unset runs offline.
    pub base_url: Option<String>,
    /// Environment variable holding the bearer token.
    pub token_env: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token_env: Some("BUILDRUN_SUPERVISOR_TOKEN".to_string()),
            timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Phase id to handler name.
    pub handlers: BTreeMap<String, String>,
    /// Deliverables per proposer call for the batched handler.
    pub batch_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
            batch_size: 8,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run: RunSection::default(),
            policy: PolicyConfig::default(),
            escalation: EscalationLadder::default(),
            providers: vec![ProviderConfig::default()],
            proposer: ProposerConfig::default(),
            ci: CiConfig::default(),
            context: ContextConfig::default(),
            approval: ApprovalConfig::default(),
            clarification: ClarificationConfig::default(),
            supervisor: SupervisorConfig::default(),
            dispatch: DispatchConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run.max_attempts == 0 {
            return Err(anyhow!("run.max_attempts must be > 0"));
        }
        if self.escalation.is_empty() {
            return Err(anyhow!("escalation must list at least one rung"));
        }
        if self.escalation.rungs().iter().any(|r| r.max_tokens == 0) {
            return Err(anyhow!("escalation rungs must have max_tokens > 0"));
        }
        if self.providers.is_empty() {
            return Err(anyhow!("providers must list at least one provider"));
        }
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(anyhow!("providers[].name must be non-empty"));
            }
            if provider.models.is_empty() {
                return Err(anyhow!("provider {} must list at least one model", provider.name));
            }
            if provider.disable_after == 0 {
                return Err(anyhow!("provider {} disable_after must be > 0", provider.name));
            }
        }
        if self.proposer.command.is_empty() || self.proposer.command[0].trim().is_empty() {
            return Err(anyhow!("proposer.command must be a non-empty array"));
        }
        if self.proposer.timeout_secs == 0 || self.proposer.output_limit_bytes == 0 {
            return Err(anyhow!("proposer.timeout_secs and output_limit_bytes must be > 0"));
        }
        if self.ci.command.trim().is_empty() {
            return Err(anyhow!("ci.command must be non-empty"));
        }
        if self.ci.timeout_secs == 0 {
            return Err(anyhow!("ci.timeout_secs must be > 0"));
        }
        if self.context.max_files == 0 || self.context.max_bytes == 0 {
            return Err(anyhow!("context.max_files and max_bytes must be > 0"));
        }
        if self.approval.poll_interval_secs == 0 || self.approval.timeout_secs == 0 {
            return Err(anyhow!("approval poll interval and timeout must be > 0"));
        }
        if self.clarification.poll_interval_secs == 0 || self.clarification.timeout_secs == 0 {
            return Err(anyhow!("clarification poll interval and timeout must be > 0"));
        }
        if self.supervisor.timeout_secs == 0 {
            return Err(anyhow!("supervisor.timeout_secs must be > 0"));
        }
        if self.dispatch.batch_size == 0 {
            return Err(anyhow!("dispatch.batch_size must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.quality.wipe_symbol_ratio) {
            return Err(anyhow!("quality.wipe_symbol_ratio must be within 0..=1"));
        }

        PatchPolicy::from_config(&self.policy).context("policy patterns")?;
        ApprovalPolicy::from_rules(&self.approval.rules).context("approval patterns")?;
        PatternSet::parse(&self.context.priority_globs).context("context.priority_globs")?;
        for (category, patterns) in &self.context.categories {
            PatternSet::parse(patterns)
                .with_context(|| format!("context.categories.{category}"))?;
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        let cfg = RunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
