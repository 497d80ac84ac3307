//! Phase execution state machine.
//!
//! PENDING -> IN_PROGRESS -> {COMPLETE | BLOCKED | FAILED}. Each attempt
//! loads context, asks the phase handler for a proposal, runs it through the
//! kernel (with an approval gate when required), verifies, and hands the
//! outcome to the retry policy. Every decided attempt consumes one attempt
//! index and is persisted before the next one starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::core::approval::{ApprovalPolicy, Authorization, authorize, payload_hash};
use crate::core::outcome::{classify_apply, classify_ci, classify_status, describe, stop_reason};
use crate::core::retry::{AttemptDecision, RetryPolicy};
use crate::core::types::{
    ApplyResult, AttemptOutcome, CiResult, ClarificationStatus, PatchProposal, Phase,
    PhaseState, StopKind, StopReason, TokenBudgetEvent,
};
use crate::dispatch::{HandlerRequest, PhaseDispatcher};
use crate::io::attempt_log::{AttemptMeta, AttemptWriteRequest, write_attempt};
use crate::io::cancel::CancelToken;
use crate::io::checkpoint::RunCheckpoint;
use crate::io::ci::{CiRequest, CiRunner};
use crate::io::clock::{Clock, PollOutcome, poll_until};
use crate::io::config::RunConfig;
use crate::io::context::ContextLoader;
use crate::io::diagnostics::{Diagnostics, DiagnosticsInput};
use crate::io::init::BuildrunPaths;
use crate::io::proposer::{PatchProposer, ProposerError};
use crate::io::resolver::{LlmClientResolver, ResolvedClient};
use crate::io::supervisor::{
    AttemptReport, NewApproval, NewClarification, PhaseStatusUpdate, Supervisor, SupervisorError,
};
use crate::io::telemetry::TelemetrySink;
use crate::kernel::{GovernedApplyKernel, PreparedPatch};

/// External collaborators of the executor.
#[derive(Clone, Copy)]
pub struct ExecutorDeps<'a> {
    pub proposer: &'a dyn PatchProposer,
    pub ci: &'a dyn CiRunner,
    pub supervisor: &'a dyn Supervisor,
    pub checkpoint: &'a dyn RunCheckpoint,
    pub diagnostics: &'a dyn Diagnostics,
    pub clock: &'a dyn Clock,
}

/// Everything one attempt produced.
#[derive(Debug, Default)]
struct AttemptRecord {
    outcome: Option<AttemptOutcome>,
    message: String,
    handler: String,
    client: Option<ResolvedClient>,
    context_files: usize,
    proposal: Option<PatchProposal>,
    repairs: Vec<String>,
    apply: Option<ApplyResult>,
    ci: Option<CiResult>,
    approval_id: Option<String>,
    clarification: Option<String>,
    cancelled: bool,
}

impl AttemptRecord {
    fn finish(&mut self, outcome: AttemptOutcome, message: impl Into<String>) {
        self.outcome = Some(outcome);
        self.message = message.into();
    }

    fn cancel(&mut self) {
        self.cancelled = true;
        self.message = "run cancelled".to_string();
    }
}

enum GateOutcome {
    Authorized(String),
    Refused {
        outcome: AttemptOutcome,
        message: String,
        approval_id: Option<String>,
    },
    Cancelled,
}

enum ClarifyOutcome {
    Answered(String),
    Unanswered(String),
    Cancelled,
}

pub struct PhaseExecutor<'a> {
    run_id: String,
    root: PathBuf,
    paths: BuildrunPaths,
    config: RunConfig,
    deps: ExecutorDeps<'a>,
    kernel: GovernedApplyKernel<'a>,
    dispatcher: PhaseDispatcher,
    context: ContextLoader,
    approval: ApprovalPolicy,
    retry: RetryPolicy,
    resolver: LlmClientResolver,
    telemetry: TelemetrySink,
    cancel: CancelToken,
}

impl<'a> PhaseExecutor<'a> {
    pub fn new(
        root: &Path,
        run_id: impl Into<String>,
        config: &RunConfig,
        deps: ExecutorDeps<'a>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let paths = BuildrunPaths::new(root);
        let telemetry = TelemetrySink::new(&paths.token_budget_path, &paths.usage_path);
        Ok(Self {
            run_id: run_id.into(),
            root: root.to_path_buf(),
            kernel: GovernedApplyKernel::from_config(root, config, deps.checkpoint)?,
            dispatcher: PhaseDispatcher::bind(&config.dispatch).context("bind phase handlers")?,
            context: ContextLoader::from_config(&config.context)?,
            approval: ApprovalPolicy::from_rules(&config.approval.rules)
                .context("build approval policy")?,
            retry: RetryPolicy::new(config.escalation.clone()),
            resolver: LlmClientResolver::new(&config.providers, config.escalation.clone())
                .with_telemetry(telemetry.clone()),
            telemetry,
            paths,
            config: config.clone(),
            deps,
            cancel,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Drive `phase` to a terminal state. `persist` is called after every
    /// state change so a crash never loses attempt counters.
    #[instrument(skip_all, fields(run_id = %self.run_id, phase_id = %phase.id))]
    pub fn execute<F>(&mut self, phase: &mut Phase, persist: F) -> Result<PhaseState>
    where
        F: FnMut(&Phase) -> Result<()>,
    {
        let mut checkpoints = Vec::new();
        let result = self.drive(phase, persist, &mut checkpoints);
        if phase.state.is_terminal() {
            self.release_checkpoints(&checkpoints);
        }
        result
    }

    fn drive<F>(
        &mut self,
        phase: &mut Phase,
        mut persist: F,
        checkpoints: &mut Vec<String>,
    ) -> Result<PhaseState>
    where
        F: FnMut(&Phase) -> Result<()>,
    {
        if phase.state.is_terminal() {
            debug!(state = %phase.state, "phase already terminal");
            return Ok(phase.state);
        }
        phase.state = PhaseState::InProgress;
        self.report_status(phase);
        persist(phase)?;
        info!(attempt = phase.attempt_index, level = phase.escalation_level, "phase started");

        let mut diagnostics: Option<String> = None;
        let mut clarification: Option<String> = None;
        loop {
            if self.cancel.is_cancelled() {
                return self.stop_cancelled(phase, &mut persist);
            }
            let client = match self.resolver.resolve(phase.escalation_level) {
                Ok(client) => client,
                Err(err) => {
                    error!(%err, "no client available");
                    let reason = StopReason::new(StopKind::NoProvider, err.to_string());
                    return self.stop(phase, PhaseState::Failed, reason, &mut persist);
                }
            };

            let started_at = self.deps.clock.now();
            let attempt =
                self.run_attempt(phase, client, diagnostics.as_deref(), clarification.take());
            let mut record = match attempt {
                Ok(record) => record,
                Err(err) => {
                    error!(err = %format!("{err:#}"), "attempt aborted");
                    let reason =
                        StopReason::new(StopKind::InfrastructureError, format!("{err:#}"));
                    return self.stop(phase, PhaseState::Failed, reason, &mut persist);
                }
            };
            if let Some(id) = record.apply.as_ref().and_then(|a| a.checkpoint_id.clone()) {
                checkpoints.push(id);
            }
            if record.cancelled {
                return self.stop_cancelled(phase, &mut persist);
            }
            let Some(outcome) = record.outcome else {
                return self.stop_cancelled(phase, &mut persist);
            };

            let decision = self
                .retry
                .decide(phase.attempt_context(self.config.run.max_attempts), outcome);
            info!(
                attempt = phase.attempt_index,
                %outcome,
                next_attempt = decision.next_attempt_index,
                escalation_level = decision.escalation_level,
                terminal = decision.terminal,
                "attempt decided"
            );

            diagnostics = if decision.should_run_diagnostics && !decision.terminal {
                self.diagnose(phase, outcome, &record)
            } else {
                None
            };
            clarification = record.clarification.take();

            self.log_attempt(
                phase,
                &record,
                outcome,
                decision,
                started_at,
                diagnostics.as_deref(),
            )?;
            self.report_attempt(phase, &record, outcome, decision);

            phase.attempt_index = decision.next_attempt_index;
            phase.escalation_level = decision.escalation_level;
            if decision.terminal {
                let state = decision.final_state.unwrap_or(PhaseState::Failed);
                phase.state = state;
                phase.stop_reason = stop_reason(
                    outcome,
                    record.message.clone(),
                    record.apply.as_ref(),
                    record.ci.as_ref(),
                )
                .map(|mut reason| {
                    reason.approval_id = record.approval_id.clone();
                    reason
                });
                self.report_status(phase);
                persist(phase)?;
                info!(state = %state, "phase finished");
                return Ok(state);
            }
            persist(phase)?;
        }
    }

    fn run_attempt(
        &mut self,
        phase: &Phase,
        client: ResolvedClient,
        diagnostics: Option<&str>,
        clarification: Option<String>,
    ) -> Result<AttemptRecord> {
        let mut record = AttemptRecord::default();
        let context = self.context.load(phase, &self.root)?;
        record.context_files = context.files.len();
        let handler = self.dispatcher.resolve(&phase.id);
        record.handler = handler.name().to_string();

        let request = HandlerRequest {
            run_id: &self.run_id,
            phase,
            client: &client,
            context: &context,
            diagnostics,
            clarification: clarification.as_deref(),
        };
        let proposed = handler.propose(self.deps.proposer, &request, &self.cancel);
        let provider = client.provider.clone();
        record.client = Some(client);

        let proposal = match proposed {
            Ok(proposal) => {
                self.resolver.record_success(&provider);
                proposal
            }
            Err(ProposerError::Cancelled) => {
                record.cancel();
                return Ok(record);
            }
            Err(err) => {
                warn!(%err, "proposer call failed");
                if let Some(failure) = err.infra_failure() {
                    self.resolver.record_failure(&provider, failure);
                }
                let outcome = match err {
                    ProposerError::InvalidOutput(_) => AttemptOutcome::PatchFailed,
                    _ => AttemptOutcome::ProposerUnavailable,
                };
                record.finish(outcome, err.to_string());
                return Ok(record);
            }
        };
        if let (Some(usage), Some(client)) = (proposal.usage, &record.client) {
            self.resolver
                .record_usage(&self.run_id, &phase.id, phase.attempt_index, client, &usage);
        }

        if let Some(outcome) = classify_status(proposal.status) {
            let message = describe(outcome, None, None);
            let question = proposal.question.clone();
            record.proposal = Some(proposal);
            match (outcome, question) {
                (AttemptOutcome::ProposerBlocked, Some(question))
                    if self.config.clarification.enabled =>
                {
                    match self.clarify(phase, &question) {
                        ClarifyOutcome::Answered(answer) => {
                            record.clarification = Some(answer);
                            record.finish(
                                AttemptOutcome::ClarificationAnswered,
                                format!("clarification answered: {question}"),
                            );
                        }
                        ClarifyOutcome::Unanswered(why) => {
                            record.finish(outcome, format!("{message}: {question} ({why})"));
                        }
                        ClarifyOutcome::Cancelled => record.cancel(),
                    }
                }
                (AttemptOutcome::ProposerBlocked, Some(question)) => {
                    record.finish(outcome, format!("{message}: {question}"));
                }
                _ => record.finish(outcome, message),
            }
            return Ok(record);
        }

        let prepared = match self.kernel.preflight(&proposal, &phase.scope) {
            Ok(prepared) => prepared,
            Err(failure) => {
                let outcome = classify_apply(&failure);
                let apply = ApplyResult::failed(failure, None);
                record.finish(outcome, describe(outcome, Some(&apply), None));
                record.apply = Some(apply);
                record.proposal = Some(proposal);
                return Ok(record);
            }
        };
        record.repairs = prepared.repairs.iter().map(ToString::to_string).collect();
        record.proposal = Some(proposal);

        if self.approval.requires_approval(&phase.id, &prepared.writes) {
            match self.approval_gate(phase, &prepared, record.proposal.as_ref()) {
                GateOutcome::Authorized(id) => record.approval_id = Some(id),
                GateOutcome::Refused {
                    outcome,
                    message,
                    approval_id,
                } => {
                    record.approval_id = approval_id;
                    record.finish(outcome, message);
                    return Ok(record);
                }
                GateOutcome::Cancelled => {
                    record.cancel();
                    return Ok(record);
                }
            }
        }

        let label = format!("{}-{}-{}", self.run_id, phase.id, phase.attempt_index);
        let apply = self.kernel.apply_prepared(&prepared, &label);
        if let Some(failure) = &apply.failure {
            let outcome = classify_apply(failure);
            record.finish(outcome, describe(outcome, Some(&apply), None));
            record.apply = Some(apply);
            return Ok(record);
        }

        let ci = self.deps.ci.run(
            &CiRequest {
                run_id: &self.run_id,
                phase_id: &phase.id,
                attempt_index: phase.attempt_index,
            },
            &self.cancel,
        );
        let ci = match ci {
            Ok(ci) => ci,
            Err(err) => {
                // Nothing verified this patch, so it never stays on disk.
                error!(err = %format!("{err:#}"), "verification could not run");
                if let Some(checkpoint_id) = &apply.checkpoint_id {
                    info!(checkpoint = %checkpoint_id, "rolling back unverified attempt");
                    self.kernel.rollback(checkpoint_id, &prepared)?;
                }
                record.apply = Some(apply);
                record.finish(
                    AttemptOutcome::CiFailed,
                    format!("verification could not run: {err:#}"),
                );
                return Ok(record);
            }
        };
        let cancelled = self.cancel.is_cancelled();
        let outcome = classify_ci(&ci);
        if (cancelled || outcome != AttemptOutcome::Complete)
            && self.config.run.rollback_on_ci_failure
            && let Some(checkpoint_id) = &apply.checkpoint_id
        {
            info!(checkpoint = %checkpoint_id, "rolling back failed attempt");
            self.kernel.rollback(checkpoint_id, &prepared)?;
        }
        record.apply = Some(apply);
        if cancelled {
            record.ci = Some(ci);
            record.cancel();
            return Ok(record);
        }
        record.finish(outcome, describe(outcome, record.apply.as_ref(), Some(&ci)));
        record.ci = Some(ci);
        Ok(record)
    }

    /// Request approval for the exact prepared payload and wait for a
    /// decision. A stale approval forces a fresh request, a bounded number
    /// of times.
    fn approval_gate(
        &self,
        phase: &Phase,
        prepared: &PreparedPatch,
        proposal: Option<&PatchProposal>,
    ) -> GateOutcome {
        let hash = payload_hash(&phase.id, phase.revision_epoch, &prepared.writes);
        let settings = &self.config.approval;
        let mut reissues = 0u32;
        loop {
            let request = NewApproval {
                run_id: self.run_id.clone(),
                phase_id: phase.id.clone(),
                payload_hash: hash.clone(),
                summary: proposal
                    .and_then(|p| p.summary.clone())
                    .unwrap_or_else(|| phase.description.clone()),
                paths: prepared.changed_paths(),
            };
            let approval = match self.deps.supervisor.request_approval(&request) {
                Ok(approval) => approval,
                Err(err) => {
                    warn!(%err, "approval request failed");
                    return GateOutcome::Refused {
                        outcome: AttemptOutcome::ApprovalDenied,
                        message: format!("approval could not be requested: {err}"),
                        approval_id: None,
                    };
                }
            };
            info!(approval_id = %approval.id, "waiting for approval");

            let polled = poll_until(
                self.deps.clock,
                &self.cancel,
                Duration::from_secs(settings.poll_interval_secs),
                Duration::from_secs(settings.timeout_secs),
                || match self.deps.supervisor.poll_approval(&approval.id) {
                    Ok(current) => match authorize(&current, &hash) {
                        Authorization::Pending => Ok(None),
                        decided => Ok(Some(decided)),
                    },
                    Err(err) if err.is_transient() => {
                        debug!(%err, "approval poll failed, retrying");
                        Ok(None)
                    }
                    Err(err) => Err(err),
                },
            );
            let refused = |outcome, message: String| GateOutcome::Refused {
                outcome,
                message,
                approval_id: Some(approval.id.clone()),
            };
            match polled {
                Ok(PollOutcome::Ready(Authorization::Authorized)) => {
                    info!(approval_id = %approval.id, "approval granted");
                    return GateOutcome::Authorized(approval.id.clone());
                }
                Ok(PollOutcome::Ready(Authorization::Stale))
                    if reissues < self.config.run.max_stale_reissues =>
                {
                    reissues += 1;
                    warn!(
                        approval_id = %approval.id,
                        reissues,
                        "approval bound to another payload, requesting again"
                    );
                }
                Ok(PollOutcome::Ready(Authorization::Stale)) => {
                    return refused(
                        AttemptOutcome::ApprovalStale,
                        format!("approval {} does not match the payload", approval.id),
                    );
                }
                Ok(PollOutcome::Ready(Authorization::Denied)) => {
                    return refused(
                        AttemptOutcome::ApprovalDenied,
                        format!("approval {} denied", approval.id),
                    );
                }
                Ok(PollOutcome::Ready(Authorization::TimedOut | Authorization::Pending))
                | Ok(PollOutcome::TimedOut) => {
                    return refused(
                        AttemptOutcome::ApprovalTimedOut,
                        format!("approval {} not granted in time", approval.id),
                    );
                }
                Ok(PollOutcome::Cancelled) => return GateOutcome::Cancelled,
                Err(err) => {
                    return refused(
                        AttemptOutcome::ApprovalDenied,
                        format!("approval {} could not be read: {err}", approval.id),
                    );
                }
            }
        }
    }

    fn clarify(&self, phase: &Phase, question: &str) -> ClarifyOutcome {
        let settings = &self.config.clarification;
        let request = NewClarification {
            run_id: self.run_id.clone(),
            phase_id: phase.id.clone(),
            question: question.to_string(),
        };
        let pending = match self.deps.supervisor.request_clarification(&request) {
            Ok(pending) => pending,
            Err(err) => {
                warn!(%err, "clarification request failed");
                return ClarifyOutcome::Unanswered(err.to_string());
            }
        };
        info!(clarification_id = %pending.id, "waiting for clarification");
        let polled = poll_until(
            self.deps.clock,
            &self.cancel,
            Duration::from_secs(settings.poll_interval_secs),
            Duration::from_secs(settings.timeout_secs),
            || -> Result<Option<Result<String, String>>, SupervisorError> {
                match self.deps.supervisor.poll_clarification(&pending.id) {
                    Ok(current) => Ok(match current.status {
                        ClarificationStatus::Pending => None,
                        ClarificationStatus::Answered => {
                            Some(current.answer.ok_or_else(|| "answered without text".to_string()))
                        }
                        ClarificationStatus::Expired => Some(Err("expired".to_string())),
                    }),
                    Err(err) if err.is_transient() => Ok(None),
                    Err(err) => Err(err),
                }
            },
        );
        match polled {
            Ok(PollOutcome::Ready(Ok(answer))) => ClarifyOutcome::Answered(answer),
            Ok(PollOutcome::Ready(Err(why))) => ClarifyOutcome::Unanswered(why),
            Ok(PollOutcome::TimedOut) => {
                ClarifyOutcome::Unanswered("no answer in time".to_string())
            }
            Ok(PollOutcome::Cancelled) => ClarifyOutcome::Cancelled,
            Err(err) => ClarifyOutcome::Unanswered(err.to_string()),
        }
    }

    fn diagnose(
        &self,
        phase: &Phase,
        outcome: AttemptOutcome,
        record: &AttemptRecord,
    ) -> Option<String> {
        let input = DiagnosticsInput {
            phase_id: &phase.id,
            attempt_index: phase.attempt_index,
            outcome,
            message: &record.message,
            apply: record.apply.as_ref(),
            ci: record.ci.as_ref(),
        };
        match self.deps.diagnostics.digest(&input) {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "diagnostics failed");
                None
            }
        }
    }

    fn log_attempt(
        &self,
        phase: &Phase,
        record: &AttemptRecord,
        outcome: AttemptOutcome,
        decision: AttemptDecision,
        started_at: DateTime<Utc>,
        diagnostics: Option<&str>,
    ) -> Result<()> {
        let client = record.client.as_ref();
        if let Some(client) = client {
            self.telemetry.record_token_budget(&TokenBudgetEvent {
                run_id: self.run_id.clone(),
                phase_id: phase.id.clone(),
                attempt_index: phase.attempt_index,
                estimated_tokens: client.max_tokens,
                actual_tokens: record
                    .proposal
                    .as_ref()
                    .and_then(|p| p.usage)
                    .map(|u| u.total()),
                escalation_factor: self.retry.ladder().factor(client.escalation_level),
                recorded_at: self.deps.clock.now(),
            });
        }
        let meta = AttemptMeta {
            run_id: self.run_id.clone(),
            phase_id: phase.id.clone(),
            attempt_index: phase.attempt_index,
            escalation_level: phase.escalation_level,
            revision_epoch: phase.revision_epoch,
            handler: record.handler.clone(),
            provider: client.map(|c| c.provider.clone()),
            model: client.map(|c| c.model.clone()),
            outcome,
            decision,
            context_files: record.context_files,
            repairs: record.repairs.clone(),
            started_at,
            ended_at: self.deps.clock.now(),
        };
        write_attempt(&AttemptWriteRequest {
            attempts_dir: &self.paths.attempts_dir,
            meta: &meta,
            proposal: record.proposal.as_ref(),
            apply: record.apply.as_ref(),
            ci: record.ci.as_ref(),
            diagnostics,
        })?;
        Ok(())
    }

    fn report_attempt(
        &self,
        phase: &Phase,
        record: &AttemptRecord,
        outcome: AttemptOutcome,
        decision: AttemptDecision,
    ) {
        let apply = record.apply.as_ref();
        let report = AttemptReport {
            attempt_index: phase.attempt_index,
            escalation_level: phase.escalation_level,
            handler: record.handler.clone(),
            provider: record.client.as_ref().map(|c| c.provider.clone()),
            model: record.client.as_ref().map(|c| c.model.clone()),
            outcome,
            message: record.message.clone(),
            terminal: decision.terminal,
            touched_paths: apply.map(|a| a.touched_paths.clone()).unwrap_or_default(),
            checkpoint_id: apply.and_then(|a| a.checkpoint_id.clone()),
            ci: record.ci.as_ref().map(CiResult::counts),
            usage: record.proposal.as_ref().and_then(|p| p.usage),
            repairs: record.repairs.clone(),
            reported_at: self.deps.clock.now(),
        };
        if let Err(err) = self
            .deps
            .supervisor
            .submit_attempt(&self.run_id, &phase.id, &report)
        {
            warn!(%err, "attempt report dropped");
        }
    }

    fn report_status(&self, phase: &Phase) {
        let update = PhaseStatusUpdate {
            state: phase.state,
            attempt_index: phase.attempt_index,
            escalation_level: phase.escalation_level,
            revision_epoch: phase.revision_epoch,
            stop_reason: phase.stop_reason.clone(),
            updated_at: self.deps.clock.now(),
        };
        if let Err(err) = self
            .deps
            .supervisor
            .update_phase_status(&self.run_id, &phase.id, &update)
        {
            warn!(%err, state = %phase.state, "phase status update dropped");
        }
    }

    fn release_checkpoints(&self, checkpoints: &[String]) {
        for id in checkpoints {
            if let Err(err) = self.deps.checkpoint.release(id) {
                warn!(err = %format!("{err:#}"), checkpoint = %id, "checkpoint release failed");
            }
        }
    }

    fn stop<F>(
        &self,
        phase: &mut Phase,
        state: PhaseState,
        reason: StopReason,
        persist: &mut F,
    ) -> Result<PhaseState>
    where
        F: FnMut(&Phase) -> Result<()>,
    {
        phase.state = state;
        phase.stop_reason = Some(reason);
        self.report_status(phase);
        persist(phase)?;
        info!(state = %state, "phase stopped");
        Ok(state)
    }

    fn stop_cancelled<F>(&self, phase: &mut Phase, persist: &mut F) -> Result<PhaseState>
    where
        F: FnMut(&Phase) -> Result<()>,
    {
        warn!("phase cancelled");
        self.stop(
            phase,
            PhaseState::Failed,
            StopReason::new(StopKind::Cancelled, "run cancelled"),
            persist,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::approval::ApprovalRules;
    use crate::core::types::{FileOp, FileOpKind, ProposalStatus};
    use crate::test_support::{
        CountingDiagnostics, FakeApproval, FakeSupervisor, ManualClock, MemoryCheckpoint,
        ScriptedCiRunner, ScriptedProposer, ci_result, green_ci,
    };

    struct Harness {
        temp: tempfile::TempDir,
        proposer: ScriptedProposer,
        ci: ScriptedCiRunner,
        supervisor: FakeSupervisor,
        checkpoint: MemoryCheckpoint,
        diagnostics: CountingDiagnostics,
        clock: ManualClock,
    }

    impl Harness {
        fn new(
            proposals: Vec<Result<PatchProposal, ProposerError>>,
            ci: Vec<CiResult>,
            supervisor: FakeSupervisor,
        ) -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let checkpoint = MemoryCheckpoint::new(temp.path());
            Self {
                temp,
                proposer: ScriptedProposer::new(proposals),
                ci: ScriptedCiRunner::new(ci),
                supervisor,
                checkpoint,
                diagnostics: CountingDiagnostics::default(),
                clock: ManualClock::new(),
            }
        }

        fn deps(&self) -> ExecutorDeps<'_> {
            ExecutorDeps {
                proposer: &self.proposer,
                ci: &self.ci,
                supervisor: &self.supervisor,
                checkpoint: &self.checkpoint,
                diagnostics: &self.diagnostics,
                clock: &self.clock,
            }
        }

        fn run(&self, config: &RunConfig, phase: &mut Phase) -> PhaseState {
            let deps = self.deps();
            let mut executor =
                PhaseExecutor::new(self.temp.path(), "run-1", config, deps, CancelToken::new())
                    .expect("executor");
            executor.execute(phase, |_| Ok(())).expect("execute")
        }
    }

    fn add(path: &str, content: &str) -> PatchProposal {
        PatchProposal::new(
            ProposalStatus::Complete,
            vec![FileOp::with_content(path, FileOpKind::Add, content)],
        )
    }

    fn status(status: ProposalStatus) -> PatchProposal {
        PatchProposal::new(status, Vec::new())
    }

    #[test]
    fn complete_on_first_attempt() {
        let h = Harness::new(
            vec![Ok(add("a.txt", "a\n"))],
            vec![green_ci()],
            FakeSupervisor::new(),
        );
        let mut phase = Phase::new("p1", 0, "t1");
        let state = h.run(&RunConfig::default(), &mut phase);

        assert_eq!(state, PhaseState::Complete);
        assert_eq!(phase.attempt_index, 1);
        assert!(phase.stop_reason.is_none());
        assert_eq!(h.supervisor.attempts.borrow().len(), 1);
        let statuses = h.supervisor.statuses.borrow();
        assert_eq!(statuses.first().map(|(_, u)| u.state), Some(PhaseState::InProgress));
        assert_eq!(statuses.last().map(|(_, u)| u.state), Some(PhaseState::Complete));
    }

    /// Verifies a budget escalation retries at the next level without diagnostics.
    #[test]
    fn token_escalation_then_complete() {
        let h = Harness::new(
            vec![Ok(status(ProposalStatus::TokenEscalation)), Ok(add("a.txt", "a\n"))],
            vec![green_ci()],
            FakeSupervisor::new(),
        );
        let mut phase = Phase::new("p1", 0, "t1");
        let state = h.run(&RunConfig::default(), &mut phase);

        assert_eq!(state, PhaseState::Complete);
        assert_eq!(phase.attempt_index, 2);
        assert_eq!(phase.escalation_level, 1);
        assert_eq!(h.diagnostics.calls(), 0);
        let requests = h.proposer.requests();
        assert!(requests[1].max_tokens > requests[0].max_tokens);
        assert!(requests[1].diagnostics.is_none());
    }

    #[test]
    fn collection_errors_never_complete() {
        let h = Harness::new(
            vec![Ok(add("a.txt", "a\n"))],
            vec![ci_result(0, 0, Some(10), 10)],
            FakeSupervisor::new(),
        );
        let config = RunConfig {
            run: crate::io::config::RunSection {
                max_attempts: 1,
                ..Default::default()
            },
            ..RunConfig::default()
        };
        let mut phase = Phase::new("p1", 0, "t1");
        let state = h.run(&config, &mut phase);

        assert_eq!(state, PhaseState::Failed);
        let reason = phase.stop_reason.expect("stop reason");
        assert_eq!(reason.kind, StopKind::CollectionErrors);
        assert_eq!(reason.ci.map(|c| c.collection_errors), Some(10));
        assert_eq!(h.checkpoint.rollbacks().len(), 1);
        assert!(!h.temp.path().join("a.txt").exists(), "rolled back");
    }

    #[test]
    fn ci_failure_feeds_diagnostics_to_next_attempt() {
        let h = Harness::new(
            vec![Ok(add("a.txt", "a\n")), Ok(add("a.txt", "fixed\n"))],
            vec![ci_result(3, 1, Some(0), 0), green_ci()],
            FakeSupervisor::new(),
        );
        let mut phase = Phase::new("p1", 0, "t1");
        let state = h.run(&RunConfig::default(), &mut phase);

        assert_eq!(state, PhaseState::Complete);
        assert_eq!(h.diagnostics.calls(), 1);
        assert_eq!(h.checkpoint.releases(), vec!["mem-0".to_string(), "mem-1".to_string()]);
        let requests = h.proposer.requests();
        assert!(requests[1].diagnostics.as_deref().is_some_and(|d| d.contains("CI_FAILED")));
        assert_eq!(
            std::fs::read_to_string(h.temp.path().join("a.txt")).expect("read"),
            "fixed\n"
        );
    }

    #[test]
    fn policy_violation_blocks_after_one_attempt() {
        let h = Harness::new(
            vec![Ok(add(".git/config", "[core]\n"))],
            Vec::new(),
            FakeSupervisor::new(),
        );
        let mut phase = Phase::new("p1", 0, "t1");
        let state = h.run(&RunConfig::default(), &mut phase);

        assert_eq!(state, PhaseState::Blocked);
        assert_eq!(phase.attempt_index, 1);
        assert_eq!(
            phase.stop_reason.map(|r| r.kind),
            Some(StopKind::PolicyViolation)
        );
        assert_eq!(h.ci.runs(), 0);
        assert!(h.checkpoint.labels().is_empty());
    }

    fn approval_config() -> RunConfig {
        let mut config = RunConfig::default();
        config.approval.rules = ApprovalRules {
            require_for: vec!["**".to_string()],
            ..ApprovalRules::default()
        };
        config
    }

    #[test]
    fn approved_payload_is_applied() {
        let supervisor =
            FakeSupervisor::new().with_approvals(vec![
                FakeApproval::Pending,
                FakeApproval::Unreachable,
                FakeApproval::Approved,
            ]);
        let h = Harness::new(vec![Ok(add("a.txt", "a\n"))], vec![green_ci()], supervisor);
        let mut phase = Phase::new("p1", 0, "t1");
        let state = h.run(&approval_config(), &mut phase);

        assert_eq!(state, PhaseState::Complete);
        assert_eq!(h.supervisor.approval_requests.borrow().len(), 1);
        assert!(h.clock.slept() > Duration::ZERO);
    }

    /// Verifies a hash-mismatched approval is reissued once, then blocks.
    #[test]
    fn stale_approval_reissues_then_blocks() {
        let supervisor = FakeSupervisor::new()
            .with_approvals(vec![FakeApproval::ApprovedStale, FakeApproval::ApprovedStale]);
        let h = Harness::new(vec![Ok(add("a.txt", "a\n"))], Vec::new(), supervisor);
        let mut phase = Phase::new("p1", 0, "t1");
        let state = h.run(&approval_config(), &mut phase);

        assert_eq!(state, PhaseState::Blocked);
        assert_eq!(h.supervisor.approval_requests.borrow().len(), 2);
        let reason = phase.stop_reason.expect("stop reason");
        assert_eq!(reason.kind, StopKind::ApprovalStale);
        assert_eq!(reason.approval_id.as_deref(), Some("apr-1"));
        assert!(!h.temp.path().join("a.txt").exists());
    }

    #[test]
    fn approval_times_out_on_manual_clock() {
        let mut config = approval_config();
        config.approval.poll_interval_secs = 10;
        config.approval.timeout_secs = 30;
        let h = Harness::new(vec![Ok(add("a.txt", "a\n"))], Vec::new(), FakeSupervisor::new());
        let mut phase = Phase::new("p1", 0, "t1");
        let state = h.run(&config, &mut phase);

        assert_eq!(state, PhaseState::Blocked);
        assert_eq!(phase.stop_reason.map(|r| r.kind), Some(StopKind::ApprovalTimedOut));
        assert_eq!(h.clock.slept(), Duration::from_secs(30));
    }

    #[test]
    fn answered_clarification_retries_with_answer() {
        let mut blocked = status(ProposalStatus::Blocked);
        blocked.question = Some("Which port?".to_string());
        let supervisor = FakeSupervisor::new().with_clarification_answer("8080");
        let h = Harness::new(
            vec![Ok(blocked), Ok(add("a.txt", "a\n"))],
            vec![green_ci()],
            supervisor,
        );
        let mut phase = Phase::new("p1", 0, "t1");
        let state = h.run(&RunConfig::default(), &mut phase);

        assert_eq!(state, PhaseState::Complete);
        assert_eq!(phase.escalation_level, 0);
        let requests = h.proposer.requests();
        assert_eq!(requests[1].clarification.as_deref(), Some("8080"));
    }

    #[test]
    fn blocked_without_question_is_terminal() {
        let h = Harness::new(
            vec![Ok(status(ProposalStatus::Blocked))],
            Vec::new(),
            FakeSupervisor::new(),
        );
        let mut phase = Phase::new("p1", 0, "t1");
        assert_eq!(h.run(&RunConfig::default(), &mut phase), PhaseState::Blocked);
        assert_eq!(phase.stop_reason.map(|r| r.kind), Some(StopKind::ProposerBlocked));
    }

    #[test]
    fn repeated_connectivity_failures_exhaust_providers() {
        let h = Harness::new(
            vec![
                Err(ProposerError::Connectivity("down".to_string())),
                Err(ProposerError::Connectivity("down".to_string())),
            ],
            Vec::new(),
            FakeSupervisor::new(),
        );
        let mut phase = Phase::new("p1", 0, "t1");
        let state = h.run(&RunConfig::default(), &mut phase);

        assert_eq!(state, PhaseState::Failed);
        assert_eq!(phase.attempt_index, 2);
        assert_eq!(phase.stop_reason.map(|r| r.kind), Some(StopKind::NoProvider));
    }

    #[test]
    fn cancelled_before_start_fails_phase() {
        let h = Harness::new(Vec::new(), Vec::new(), FakeSupervisor::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut executor =
            PhaseExecutor::new(h.temp.path(), "run-1", &RunConfig::default(), h.deps(), cancel)
                .expect("executor");
        let mut phase = Phase::new("p1", 0, "t1");
        let state = executor.execute(&mut phase, |_| Ok(())).expect("execute");

        assert_eq!(state, PhaseState::Failed);
        assert_eq!(phase.stop_reason.map(|r| r.kind), Some(StopKind::Cancelled));
        assert_eq!(phase.attempt_index, 0);
    }

    #[test]
    fn attempt_artifacts_are_written() {
        let h = Harness::new(
            vec![Ok(add("a.txt", "a\n"))],
            vec![green_ci()],
            FakeSupervisor::new(),
        );
        let mut phase = Phase::new("p1", 0, "t1");
        h.run(&RunConfig::default(), &mut phase);

        let dir = h.temp.path().join(".buildrun/attempts/run-1/p1/0");
        assert!(dir.join("meta.json").is_file());
        assert!(dir.join("apply.json").is_file());
        assert!(dir.join("ci.json").is_file());
        let budget_path = h.temp.path().join(".buildrun/telemetry/token_budget.jsonl");
        let budget = std::fs::read_to_string(budget_path)
            .expect("telemetry");
        assert_eq!(budget.lines().count(), 1);
    }

    /// Verifies a CI runner error undoes the patch and is decided like a failed run.
    #[test]
    fn ci_runner_error_rolls_back_and_is_decided() {
        let h = Harness::new(vec![Ok(add("a.txt", "a\n"))], Vec::new(), FakeSupervisor::new());
        let config = RunConfig {
            run: crate::io::config::RunSection {
                max_attempts: 1,
                ..Default::default()
            },
            ..RunConfig::default()
        };
        let mut executor =
            PhaseExecutor::new(h.temp.path(), "run-1", &config, h.deps(), CancelToken::new())
                .expect("executor");
        let mut phase = Phase::new("p1", 0, "t1");
        let mut persisted = Vec::new();
        let state = executor
            .execute(&mut phase, |p| {
                persisted.push(p.state);
                Ok(())
            })
            .expect("execute");

        assert_eq!(state, PhaseState::Failed);
        assert_eq!(phase.attempt_index, 1);
        let reason = phase.stop_reason.expect("stop reason");
        assert_eq!(reason.kind, StopKind::VerificationFailed);
        assert!(reason.message.contains("ci script exhausted"), "{}", reason.message);
        assert_eq!(h.checkpoint.rollbacks().len(), 1);
        assert!(!h.temp.path().join("a.txt").exists());
        assert_eq!(persisted.last(), Some(&PhaseState::Failed));
    }

    struct BrokenRollback;

    impl RunCheckpoint for BrokenRollback {
        fn checkpoint(&self, _label: &str) -> Result<String> {
            Ok("cp-0".to_string())
        }

        fn rollback(&self, _checkpoint_id: &str) -> Result<()> {
            Err(anyhow::anyhow!("index lock held"))
        }
    }

    #[test]
    fn failed_rollback_stops_phase_as_infrastructure_error() {
        let h = Harness::new(vec![Ok(add("a.txt", "a\n"))], Vec::new(), FakeSupervisor::new());
        let broken = BrokenRollback;
        let deps = ExecutorDeps {
            checkpoint: &broken,
            ..h.deps()
        };
        let config = RunConfig::default();
        let mut executor =
            PhaseExecutor::new(h.temp.path(), "run-1", &config, deps, CancelToken::new())
                .expect("executor");
        let mut phase = Phase::new("p1", 0, "t1");
        let mut persisted = Vec::new();
        let state = executor
            .execute(&mut phase, |p| {
                persisted.push(p.state);
                Ok(())
            })
            .expect("execute");

        assert_eq!(state, PhaseState::Failed);
        let reason = phase.stop_reason.expect("stop reason");
        assert_eq!(reason.kind, StopKind::InfrastructureError);
        assert!(reason.message.contains("index lock held"), "{}", reason.message);
        assert_eq!(persisted.last(), Some(&PhaseState::Failed));
        assert_eq!(
            h.supervisor.statuses.borrow().last().map(|(_, u)| u.state),
            Some(PhaseState::Failed)
        );
    }
}
