//! Patch Proposer adapter.
//!
//! The proposer is an external program: it receives a JSON
//! `ProposalRequest` on stdin and prints a `PatchProposal` as JSON on
//! stdout. Output is validated against `schemas/patch_proposal.schema.json`
//! before it is trusted. Exit code 69 means the provider was unreachable and
//! 77 means authentication failed; both count against the provider.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::PatchProposal;
use crate::io::cancel::CancelToken;
use crate::io::config::ProposerConfig;
use crate::io::context::FileContext;
use crate::io::process::{ProcessLimits, run_command};
use crate::io::resolver::InfraFailure;

pub const EXIT_CONNECTIVITY: i32 = 69;
pub const EXIT_AUTHENTICATION: i32 = 77;

const PROPOSAL_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/patch_proposal.schema.json"
));

/// Everything the proposer gets for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub run_id: String,
    pub phase_id: String,
    pub description: String,
    pub attempt_index: u32,
    pub escalation_level: u32,
    pub provider: String,
    pub model: String,
    pub max_tokens: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    /// Deliverables this call is responsible for (a batch, for batched phases).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deliverables: Vec<String>,
    pub context: FileContext,
    /// Failure digest from the previous attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    /// Human answer to the proposer's last question.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposerError {
    #[error("proposer could not reach its provider: {0}")]
    Connectivity(String),
    #[error("proposer authentication failed: {0}")]
    Authentication(String),
    #[error("proposer timed out after {0}s")]
    Timeout(u64),
    #[error("proposer cancelled")]
    Cancelled,
    #[error("proposer output rejected: {0}")]
    InvalidOutput(String),
    #[error("proposer failed: {0}")]
    Failed(String),
}

impl ProposerError {
    /// Failures that count against the provider's health.
    pub fn infra_failure(&self) -> Option<InfraFailure> {
        match self {
            ProposerError::Connectivity(_) => Some(InfraFailure::Connectivity),
            ProposerError::Authentication(_) => Some(InfraFailure::Authentication),
            _ => None,
        }
    }
}

pub trait PatchProposer {
    fn propose(
        &self,
        request: &ProposalRequest,
        cancel: &CancelToken,
    ) -> Result<PatchProposal, ProposerError>;
}

/// Compiled proposal schema plus typed decoding.
pub struct ProposalDecoder {
    validator: Validator,
}

impl ProposalDecoder {
    pub fn new() -> Result<Self> {
        let schema: Value =
            serde_json::from_str(PROPOSAL_SCHEMA).context("parse embedded proposal schema")?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .context("compile proposal schema")?;
        Ok(Self { validator })
    }

    pub fn decode(&self, raw: &str) -> Result<PatchProposal, ProposerError> {
        let value: Value = serde_json::from_str(raw.trim())
            .map_err(|e| ProposerError::InvalidOutput(format!("not JSON: {e}")))?;
        let messages: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(ProposerError::InvalidOutput(messages.join("; ")));
        }
        serde_json::from_value(value).map_err(|e| ProposerError::InvalidOutput(e.to_string()))
    }
}

/// Runs the configured proposer program from the workspace root.
pub struct CommandProposer {
    root: PathBuf,
    config: ProposerConfig,
    decoder: ProposalDecoder,
}

impl CommandProposer {
    pub fn new(root: impl Into<PathBuf>, config: ProposerConfig) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            config,
            decoder: ProposalDecoder::new()?,
        })
    }
}

impl PatchProposer for CommandProposer {
    #[instrument(
        skip_all,
        fields(
            phase_id = %request.phase_id,
            attempt = request.attempt_index,
            model = %request.model
        )
    )]
    fn propose(
        &self,
        request: &ProposalRequest,
        cancel: &CancelToken,
    ) -> Result<PatchProposal, ProposerError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| ProposerError::Failed("empty proposer command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.root);

        let input = serde_json::to_vec(request)
            .map_err(|e| ProposerError::Failed(format!("serialize request: {e}")))?;
        let limits = ProcessLimits {
            timeout: Duration::from_secs(self.config.timeout_secs),
            head_bytes: self.config.output_limit_bytes,
            tail_bytes: 0,
        };
        info!(program = %program, "invoking proposer");
        let output = run_command(cmd, Some(&input), limits, cancel)
            .map_err(|e| ProposerError::Failed(format!("{e:#}")))?;

        if output.cancelled {
            return Err(ProposerError::Cancelled);
        }
        if output.timed_out {
            return Err(ProposerError::Timeout(self.config.timeout_secs));
        }
        let stderr = output.stderr.to_string_lossy();
        let detail = stderr.trim().lines().last().unwrap_or("").to_string();
        match output.exit_code() {
            Some(0) => {}
            Some(EXIT_CONNECTIVITY) => return Err(ProposerError::Connectivity(detail)),
            Some(EXIT_AUTHENTICATION) => return Err(ProposerError::Authentication(detail)),
            code => {
                warn!(exit_code = ?code, "proposer exited with failure");
                return Err(ProposerError::Failed(format!("exit code {code:?}: {detail}")));
            }
        }
        if output.stdout.omitted > 0 {
            return Err(ProposerError::InvalidOutput(format!(
                "output exceeded {} bytes",
                self.config.output_limit_bytes
            )));
        }

        let proposal = self.decoder.decode(&output.stdout.to_string_lossy())?;
        debug!(
            status = ?proposal.status,
            operations = proposal.operations.len(),
            "proposal decoded"
        );
        Ok(proposal)
    }
}
