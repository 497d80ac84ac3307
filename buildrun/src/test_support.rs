//! Scripted collaborators and throwaway workspaces for tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::core::types::{
    ApprovalRequest, ApprovalStatus, CiResult, ClarificationRequest, ClarificationStatus,
    PatchProposal,
};
use crate::io::cancel::CancelToken;
use crate::io::checkpoint::RunCheckpoint;
use crate::io::ci::{CiRequest, CiRunner};
use crate::io::clock::Clock;
use crate::io::config::{RunConfig, write_config};
use crate::io::diagnostics::{Diagnostics, DiagnosticsInput};
use crate::io::init::{BuildrunPaths, InitOptions, init_workspace};
use crate::io::plan::{PlanFile, PlannedPhase, write_plan};
use crate::io::proposer::{PatchProposer, ProposalRequest, ProposerError};
use crate::io::supervisor::{
    AttemptReport, NewApproval, NewClarification, PhaseStatusUpdate, Supervisor, SupervisorError,
};

/// Proposer that replays canned responses and records every request.
#[derive(Debug, Default)]
pub struct ScriptedProposer {
    script: RefCell<VecDeque<Result<PatchProposal, ProposerError>>>,
    requests: RefCell<Vec<ProposalRequest>>,
}

impl ScriptedProposer {
    pub fn new(script: Vec<Result<PatchProposal, ProposerError>>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ProposalRequest> {
        self.requests.borrow().clone()
    }
}

impl PatchProposer for ScriptedProposer {
    fn propose(
        &self,
        request: &ProposalRequest,
        _cancel: &CancelToken,
    ) -> Result<PatchProposal, ProposerError> {
        self.requests.borrow_mut().push(request.clone());
        self.script
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProposerError::Failed(
                    "proposer script exhausted".to_string(),
                ))
            })
    }
}

/// CI result with the given counts and a matching exit code.
pub fn ci_result(
    passed: u32,
    failed: u32,
    errors: Option<u32>,
    collection_errors: u32,
) -> CiResult {
    let clean = failed == 0 && errors == Some(0) && collection_errors == 0;
    CiResult {
        passed,
        failed,
        errors,
        collection_errors,
        exit_code: Some(if clean { 0 } else { 1 }),
        timed_out: false,
        log_path: None,
        shape: errors.map(|_| "generic".to_string()),
    }
}

pub fn green_ci() -> CiResult {
    ci_result(10, 0, Some(0), 0)
}

/// CI runner that replays canned results.
#[derive(Debug, Default)]
pub struct ScriptedCiRunner {
    script: RefCell<VecDeque<CiResult>>,
    runs: Cell<usize>,
}

impl ScriptedCiRunner {
    pub fn new(script: Vec<CiResult>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            runs: Cell::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.get()
    }
}

impl CiRunner for ScriptedCiRunner {
    fn run(&self, _request: &CiRequest<'_>, _cancel: &CancelToken) -> Result<CiResult> {
        self.runs.set(self.runs.get() + 1);
        self.script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("ci script exhausted"))
    }
}

/// What the next approval poll returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeApproval {
    Pending,
    Approved,
    Denied,
    /// Approved, but bound to some other payload.
    ApprovedStale,
    /// Transient transport failure.
    Unreachable,
}

/// In-memory Supervisor that records traffic and replays approval decisions.
#[derive(Debug, Default)]
pub struct FakeSupervisor {
    approvals: RefCell<VecDeque<FakeApproval>>,
    clarification_answer: Option<String>,
    pub statuses: RefCell<Vec<(String, PhaseStatusUpdate)>>,
    pub attempts: RefCell<Vec<AttemptReport>>,
    pub approval_requests: RefCell<Vec<NewApproval>>,
    pub clarification_requests: RefCell<Vec<NewClarification>>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_approvals(mut self, script: Vec<FakeApproval>) -> Self {
        self.approvals = RefCell::new(script.into());
        self
    }

    pub fn with_clarification_answer(mut self, answer: impl Into<String>) -> Self {
        self.clarification_answer = Some(answer.into());
        self
    }

    fn requested_hash(&self, id: &str) -> Option<String> {
        let index: usize = id.strip_prefix("apr-")?.parse().ok()?;
        self.approval_requests
            .borrow()
            .get(index)
            .map(|r| r.payload_hash.clone())
    }
}

impl Supervisor for FakeSupervisor {
    fn update_phase_status(
        &self,
        _run_id: &str,
        phase_id: &str,
        update: &PhaseStatusUpdate,
    ) -> Result<(), SupervisorError> {
        self.statuses
            .borrow_mut()
            .push((phase_id.to_string(), update.clone()));
        Ok(())
    }

    fn submit_attempt(
        &self,
        _run_id: &str,
        _phase_id: &str,
        report: &AttemptReport,
    ) -> Result<(), SupervisorError> {
        self.attempts.borrow_mut().push(report.clone());
        Ok(())
    }

    fn request_approval(&self, request: &NewApproval) -> Result<ApprovalRequest, SupervisorError> {
        let mut requests = self.approval_requests.borrow_mut();
        let id = format!("apr-{}", requests.len());
        requests.push(request.clone());
        Ok(ApprovalRequest {
            id,
            phase_id: request.phase_id.clone(),
            payload_hash: request.payload_hash.clone(),
            requested_at: Utc::now(),
            approved_at: None,
            status: ApprovalStatus::Pending,
        })
    }

    fn poll_approval(&self, id: &str) -> Result<ApprovalRequest, SupervisorError> {
        let hash = self
            .requested_hash(id)
            .ok_or_else(|| SupervisorError::Http {
                status: 404,
                message: format!("unknown approval {id}"),
            })?;
        let next = self
            .approvals
            .borrow_mut()
            .pop_front()
            .unwrap_or(FakeApproval::Pending);
        let (status, payload_hash) = match next {
            FakeApproval::Pending => (ApprovalStatus::Pending, hash),
            FakeApproval::Approved => (ApprovalStatus::Approved, hash),
            FakeApproval::Denied => (ApprovalStatus::Denied, hash),
            FakeApproval::ApprovedStale => (ApprovalStatus::Approved, format!("stale-{hash}")),
            FakeApproval::Unreachable => return Err(SupervisorError::Timeout),
        };
        Ok(ApprovalRequest {
            id: id.to_string(),
            phase_id: String::new(),
            payload_hash,
            requested_at: Utc::now(),
            approved_at: (status == ApprovalStatus::Approved).then(Utc::now),
            status,
        })
    }

    fn request_clarification(
        &self,
        request: &NewClarification,
    ) -> Result<ClarificationRequest, SupervisorError> {
        let mut requests = self.clarification_requests.borrow_mut();
        let id = format!("clr-{}", requests.len());
        requests.push(request.clone());
        Ok(ClarificationRequest {
            id,
            phase_id: request.phase_id.clone(),
            question: request.question.clone(),
            status: ClarificationStatus::Pending,
            answer: None,
        })
    }

    fn poll_clarification(&self, id: &str) -> Result<ClarificationRequest, SupervisorError> {
        let (status, answer) = match &self.clarification_answer {
            Some(answer) => (ClarificationStatus::Answered, Some(answer.clone())),
            None => (ClarificationStatus::Pending, None),
        };
        Ok(ClarificationRequest {
            id: id.to_string(),
            phase_id: String::new(),
            question: String::new(),
            status,
            answer,
        })
    }
}

/// Checkpoint that snapshots file bytes in memory.
#[derive(Debug)]
pub struct MemoryCheckpoint {
    root: PathBuf,
    snapshots: RefCell<Vec<(String, BTreeMap<String, Vec<u8>>)>>,
    rollbacks: RefCell<Vec<String>>,
    releases: RefCell<Vec<String>>,
}

impl MemoryCheckpoint {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshots: RefCell::new(Vec::new()),
            rollbacks: RefCell::new(Vec::new()),
            releases: RefCell::new(Vec::new()),
        }
    }

    pub fn labels(&self) -> Vec<String> {
        self.snapshots
            .borrow()
            .iter()
            .map(|(label, _)| label.clone())
            .collect()
    }

    pub fn rollbacks(&self) -> Vec<String> {
        self.rollbacks.borrow().clone()
    }

    pub fn releases(&self) -> Vec<String> {
        self.releases.borrow().clone()
    }

    fn files(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(&self.root).into_iter().filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || (name != ".git" && name != ".buildrun")
        });
        for entry in walker {
            let entry = entry.context("walk workspace")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .context("strip root")?
                .to_string_lossy()
                .replace('\\', "/");
            let bytes = fs::read(entry.path())
                .with_context(|| format!("read {}", entry.path().display()))?;
            files.insert(rel, bytes);
        }
        Ok(files)
    }
}

impl RunCheckpoint for MemoryCheckpoint {
    fn checkpoint(&self, label: &str) -> Result<String> {
        let files = self.files()?;
        let mut snapshots = self.snapshots.borrow_mut();
        snapshots.push((label.to_string(), files));
        Ok(format!("mem-{}", snapshots.len() - 1))
    }

    fn rollback(&self, checkpoint_id: &str) -> Result<()> {
        let index: usize = checkpoint_id
            .strip_prefix("mem-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| anyhow!("unknown checkpoint {checkpoint_id}"))?;
        let snapshots = self.snapshots.borrow();
        let (_, saved) = snapshots
            .get(index)
            .ok_or_else(|| anyhow!("unknown checkpoint {checkpoint_id}"))?;
        for path in self.files()?.keys() {
            if !saved.contains_key(path) {
                fs::remove_file(self.root.join(path)).with_context(|| format!("remove {path}"))?;
            }
        }
        for (path, bytes) in saved {
            let full = self.root.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&full, bytes).with_context(|| format!("restore {path}"))?;
        }
        self.rollbacks.borrow_mut().push(checkpoint_id.to_string());
        Ok(())
    }

    fn release(&self, checkpoint_id: &str) -> Result<()> {
        self.releases.borrow_mut().push(checkpoint_id.to_string());
        Ok(())
    }
}

/// Clock that only moves when something sleeps on it.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
    slept: Cell<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Cell::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default()),
            slept: Cell::new(Duration::ZERO),
        }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slept(&self) -> Duration {
        self.slept.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        let step = chrono::Duration::from_std(duration).unwrap_or_default();
        self.now.set(self.now.get() + step);
        self.slept.set(self.slept.get() + duration);
    }
}

/// Diagnostics that count calls and return a fixed marker.
#[derive(Debug, Default)]
pub struct CountingDiagnostics {
    calls: Cell<usize>,
}

impl CountingDiagnostics {
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Diagnostics for CountingDiagnostics {
    fn digest(&self, input: &DiagnosticsInput<'_>) -> Result<String> {
        self.calls.set(self.calls.get() + 1);
        Ok(format!("digest for attempt {}: {}", input.attempt_index, input.outcome))
    }
}

/// Temporary git repository with an initialized `.buildrun/`.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { temp };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.write("README.md", "# fixture\n")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "init"])?;
        init_workspace(repo.root(), &InitOptions::default())?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> BuildrunPaths {
        BuildrunPaths::new(self.root())
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.root().join(rel)).ok()
    }

    pub fn write_config(&self, config: &RunConfig) -> Result<()> {
        write_config(&self.paths().config_path, config)
    }

    /// Plan with one phase per id, all on tier `t1`.
    pub fn write_phases(&self, ids: &[&str]) -> Result<()> {
        let plan = PlanFile {
            run_id: Some("run-test".to_string()),
            phases: ids
                .iter()
                .map(|id| PlannedPhase {
                    id: (*id).to_string(),
                    tier: "t1".to_string(),
                    description: format!("phase {id}"),
                    ..PlannedPhase::default()
                })
                .collect(),
        };
        write_plan(&self.paths().plan_path, &plan)
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
