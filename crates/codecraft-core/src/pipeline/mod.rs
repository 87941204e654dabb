//! The mutation pipeline facade.
//!
//! One run: Parse, quarantine gate, feature branch, baseline, Modify,
//! generated test and regression gate, Commit. Every failure is converted to
//! a [`ValidationResult`]; failures after the first file write restore the
//! backups, remove the generated test and abandon the feature branch before
//! the run returns.

pub mod results;
pub mod state;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

pub use results::{ResultStore, StatusBoard, StatusReport};
pub use state::{PipelineState, StateMachine};
pub use worker::Worker;

use crate::cancel::CancelSignal;
use crate::config::CodecraftConfig;
use crate::domain::error::{CodecraftError, ErrorKind, Result};
use crate::domain::result::{ChangeResult, OverallStatus, Phase, ValidationResult};
use crate::domain::spec::TechnicalSpec;
use crate::git::{branch_name, FeatureBranch, GitAutomator, VcsAutomator};
use crate::modifier::{AstModifier, BackupStore, Modifier};
use crate::obs;
use crate::parser::{Proposal, ProposalParser, SpecParser};
use crate::quarantine::QuarantineManager;
use crate::queue::{ExecutionQueue, Priority, QueueTask, TaskPayload};
use crate::safety::SafetyValidator;
use crate::testgen::{GateStatus, PytestRunner, TestGenerator};

/// Everything the facade is composed of.
pub struct PipelineComponents {
    pub parser: Arc<dyn SpecParser>,
    pub modifier: Arc<dyn Modifier>,
    pub backups: Arc<BackupStore>,
    pub tests: TestGenerator,
    pub vcs: Arc<dyn VcsAutomator>,
    pub quarantine: Arc<QuarantineManager>,
    pub results: ResultStore,
    pub queue: Arc<ExecutionQueue>,
}

impl PipelineComponents {
    /// Production wiring for `config`.
    pub fn from_config(config: &CodecraftConfig) -> Result<Self> {
        let backups = Arc::new(BackupStore::new());
        let validator = Arc::new(SafetyValidator::from_config(config)?);
        let runner = Arc::new(PytestRunner::new(
            config.test_command.clone(),
            config.repo_root.clone(),
            config.test_timeout(),
        ));
        let queue = match config.queue_capacity {
            Some(capacity) => ExecutionQueue::bounded(capacity, config.user_reserved_slots),
            None => ExecutionQueue::unbounded(),
        };
        Ok(Self {
            parser: Arc::new(ProposalParser::from_config(config)?),
            modifier: Arc::new(AstModifier::new(validator, backups.clone())),
            backups,
            tests: TestGenerator::from_config(config, runner),
            vcs: Arc::new(GitAutomator::from_config(config)),
            quarantine: Arc::new(QuarantineManager::open(&config.state_path())?),
            results: ResultStore::new(&config.state_path()),
            queue: Arc::new(queue),
        })
    }
}

pub struct CodeMutationPipeline {
    parser: Arc<dyn SpecParser>,
    modifier: Arc<dyn Modifier>,
    backups: Arc<BackupStore>,
    tests: TestGenerator,
    vcs: Arc<dyn VcsAutomator>,
    quarantine: Arc<QuarantineManager>,
    results: ResultStore,
    queue: Arc<ExecutionQueue>,
    board: StatusBoard,
    /// Single writer for the working tree and the git index.
    repo: Mutex<()>,
}

/// A failure inside the mutating part of a run, tagged with its phase.
type PhaseError = (Phase, CodecraftError);

enum Previous {
    Stored(ChangeResult),
    Committed(String),
}

/// Bookkeeping for one run.
struct RunTracker<'a> {
    proposal_id: String,
    machine: StateMachine,
    board: &'a StatusBoard,
    results: &'a ResultStore,
    phases: Vec<ValidationResult>,
    phase_started: Instant,
    branch_name: Option<String>,
    commit_hash: Option<String>,
    spec_digest: Option<String>,
}

impl<'a> RunTracker<'a> {
    fn new(proposal_id: &str, board: &'a StatusBoard, results: &'a ResultStore) -> Self {
        Self {
            proposal_id: proposal_id.to_string(),
            machine: StateMachine::new(),
            board,
            results,
            phases: Vec::new(),
            phase_started: Instant::now(),
            branch_name: None,
            commit_hash: None,
            spec_digest: None,
        }
    }

    fn advance(&mut self, state: PipelineState) {
        if let Err(e) = self.machine.advance(state) {
            warn!(proposal_id = %self.proposal_id, error = %e, "state transition rejected");
            return;
        }
        if !state.is_terminal() {
            self.board.set(&self.proposal_id, state);
            if let Err(e) = self.results.mark_running(&self.proposal_id, state) {
                warn!(proposal_id = %self.proposal_id, error = %e, "failed to record run state");
            }
        }
    }

    fn enter(&mut self, state: PipelineState, phase: Phase) {
        self.advance(state);
        self.phase_started = Instant::now();
        obs::emit_phase_started(&self.proposal_id, phase);
    }

    fn record(&mut self, result: ValidationResult) {
        obs::emit_phase_finished(
            &self.proposal_id,
            result.phase,
            result.is_ok(),
            self.phase_started.elapsed().as_millis() as u64,
        );
        self.phases.push(result);
    }

    fn fail(&mut self, phase: Phase, err: &CodecraftError) {
        self.record(ValidationResult::failed(phase, err));
    }

    fn finish(mut self, status: OverallStatus) -> ChangeResult {
        self.advance(match status {
            OverallStatus::Ready => PipelineState::Ready,
            OverallStatus::Failed => PipelineState::Failed,
            OverallStatus::RolledBack => PipelineState::RolledBack,
        });
        ChangeResult {
            proposal_id: self.proposal_id,
            overall_status: status,
            branch_name: self.branch_name,
            commit_hash: self.commit_hash,
            phase_results: self.phases,
            spec_digest: self.spec_digest,
            finished_at: Utc::now(),
        }
    }
}

/// Failures that repeat for unchanged inputs.
fn is_deterministic(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Parse | ErrorKind::Validation)
}

/// Value recorded in the quarantine store for `spec`.
pub fn quarantine_value(spec: &TechnicalSpec) -> String {
    spec.new_value().python_literal()
}

impl CodeMutationPipeline {
    pub fn new(components: PipelineComponents) -> Self {
        Self {
            parser: components.parser,
            modifier: components.modifier,
            backups: components.backups,
            tests: components.tests,
            vcs: components.vcs,
            quarantine: components.quarantine,
            results: components.results,
            queue: components.queue,
            board: StatusBoard::default(),
            repo: Mutex::new(()),
        }
    }

    pub fn from_config(config: &CodecraftConfig) -> Result<Self> {
        Ok(Self::new(PipelineComponents::from_config(config)?))
    }

    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }

    pub fn quarantine(&self) -> &QuarantineManager {
        &self.quarantine
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    /// Queue a raw proposal. Returns the proposal id.
    pub fn submit(&self, proposal: Proposal, priority: Priority) -> Result<String> {
        self.enqueue(QueueTask::from_proposal(proposal, priority)?)
    }

    /// Queue an already parsed spec. Returns the proposal id.
    pub fn submit_spec(&self, spec: TechnicalSpec, priority: Priority) -> Result<String> {
        self.enqueue(QueueTask::from_spec(spec, priority))
    }

    fn enqueue(&self, task: QueueTask) -> Result<String> {
        let id = task.proposal_id.clone();
        self.queue.enqueue(task)?;
        Ok(id)
    }

    /// Remove a queued task. Running work is not affected.
    pub fn cancel_queued(&self, proposal_id: &str) -> Option<QueueTask> {
        self.queue.cancel(proposal_id)
    }

    pub fn status(&self, proposal_id: &str) -> Result<StatusReport> {
        if let Some(state) = self.board.get(proposal_id) {
            return Ok(StatusReport::InProgress { state });
        }
        if let Some(state) = self.results.running(proposal_id)? {
            return Ok(StatusReport::InProgress { state });
        }
        if self.queue.contains(proposal_id) {
            return Ok(StatusReport::Queued);
        }
        Ok(match self.results.get(proposal_id)? {
            Some(result) => StatusReport::Finished { result },
            None => StatusReport::NotFound,
        })
    }

    /// Run one task to a terminal state. Never returns an error: every
    /// failure ends up in the returned result, which is also persisted.
    pub async fn process(&self, task: QueueTask, cancel: &CancelSignal) -> ChangeResult {
        let run_id = Uuid::new_v4();
        let span = obs::proposal_span(&task.proposal_id, &run_id);
        self.process_run(task, run_id, cancel).instrument(span).await
    }

    async fn process_run(
        &self,
        task: QueueTask,
        run_id: Uuid,
        cancel: &CancelSignal,
    ) -> ChangeResult {
        let _repo = self.repo.lock().await;
        let started = Instant::now();
        let proposal_id = task.proposal_id.clone();
        obs::emit_pipeline_started(&proposal_id, &run_id);

        let mut run = RunTracker::new(&proposal_id, &self.board, &self.results);
        let result = self.execute(task.payload, cancel, &mut run).await;
        let result = match result {
            Ok(previous) => previous,
            Err(status) => run.finish(status),
        };

        if let Err(e) = self.results.put(&result) {
            warn!(proposal_id = %proposal_id, error = %e, "failed to persist result");
        }
        if let Err(e) = self.results.clear_running(&proposal_id) {
            warn!(proposal_id = %proposal_id, error = %e, "failed to clear run state");
        }
        self.board.clear(&proposal_id);
        obs::emit_pipeline_finished(
            &proposal_id,
            result.overall_status.as_str(),
            started.elapsed().as_millis() as u64,
        );
        result
    }

    pub async fn run_proposal(
        &self,
        proposal: Proposal,
        cancel: &CancelSignal,
    ) -> Result<ChangeResult> {
        let task = QueueTask::from_proposal(proposal, Priority::User)?;
        Ok(self.process(task, cancel).await)
    }

    pub async fn run_spec(&self, spec: TechnicalSpec, cancel: &CancelSignal) -> ChangeResult {
        self.process(QueueTask::from_spec(spec, Priority::User), cancel).await
    }

    /// `Ok` carries a previously recorded result returned unchanged; `Err`
    /// carries the terminal status of this run, whose details are in `run`.
    async fn execute(
        &self,
        payload: TaskPayload,
        cancel: &CancelSignal,
        run: &mut RunTracker<'_>,
    ) -> std::result::Result<ChangeResult, OverallStatus> {
        run.enter(PipelineState::Parsing, Phase::Parse);
        let parsed = match payload {
            TaskPayload::Spec(spec) => Ok(spec),
            TaskPayload::Proposal(proposal) => self.parser.parse(&proposal).await,
        };
        let spec = match parsed.and_then(|spec| cancel.check().map(|()| spec)) {
            Ok(spec) => spec,
            Err(e) => {
                run.fail(Phase::Parse, &e);
                return Err(OverallStatus::Failed);
            }
        };
        run.spec_digest = Some(spec.spec_digest().to_string());

        let recorded_failure = match self.previous_outcome(&spec).await {
            Ok(Some(Previous::Stored(result))) if result.is_ready() => {
                debug!("returning recorded result");
                return Ok(result);
            }
            Ok(Some(Previous::Stored(result))) => Some(result),
            Ok(Some(Previous::Committed(hash))) => {
                run.record(
                    ValidationResult::ok(Phase::Parse, spec.short_description())
                        .with_artifact(spec.spec_digest()),
                );
                run.record(
                    ValidationResult::skipped(Phase::Commit, "proposal already committed")
                        .with_artifact(hash.clone()),
                );
                run.branch_name = Some(branch_name(spec.proposal_id()));
                run.commit_hash = Some(hash);
                return Err(OverallStatus::Ready);
            }
            Ok(None) => None,
            Err(e) => {
                run.fail(Phase::Parse, &e);
                return Err(OverallStatus::Failed);
            }
        };
        run.record(
            ValidationResult::ok(Phase::Parse, spec.short_description())
                .with_artifact(spec.spec_digest()),
        );

        run.enter(PipelineState::Modifying, Phase::Modify);
        let key = spec.parameter_key();
        match self.quarantine.check(&key, &quarantine_value(&spec)) {
            Ok(None) => {}
            Ok(Some(entry)) => {
                obs::emit_quarantine_blocked(spec.proposal_id(), &key, entry.occurrence_count);
                run.fail(Phase::Modify, &entry.to_error());
                return Err(OverallStatus::Failed);
            }
            Err(e) => {
                run.fail(Phase::Modify, &e);
                return Err(OverallStatus::Failed);
            }
        }
        // A recorded deterministic failure stands until the key is released.
        if let Some(result) = recorded_failure {
            if !self.quarantine.released_since(&key, result.finished_at) {
                debug!("returning recorded failure");
                return Ok(result);
            }
            debug!(key = %key, "quarantine released since the recorded failure; running again");
        }

        let branch = match self.vcs.create_feature_branch(spec.proposal_id()).await {
            Ok(branch) => branch,
            Err(e) => {
                run.fail(Phase::Modify, &e);
                return Err(OverallStatus::Failed);
            }
        };
        run.branch_name = Some(branch.name.clone());

        match self.mutate_and_commit(&spec, cancel, run).await {
            Ok(hash) => {
                self.backups.release(spec.proposal_id());
                if let Err(e) = self.vcs.checkout_branch(&branch.base).await {
                    warn!(base = %branch.base, error = %e, "committed but could not return to base branch");
                }
                obs::emit_committed(spec.proposal_id(), &branch.name, &hash);
                run.record(
                    ValidationResult::ok(Phase::Commit, format!("committed on {}", branch.name))
                        .with_artifact(hash.clone()),
                );
                run.commit_hash = Some(hash);
                Err(OverallStatus::Ready)
            }
            Err((phase, e)) => {
                run.fail(phase, &e);
                let (mutated, abandoned) = self.rollback(&spec, &branch).await;
                if abandoned {
                    run.branch_name = None;
                }
                if e.is_attributable_to_change() {
                    let value = quarantine_value(&spec);
                    if let Err(qe) = self.quarantine.quarantine(&key, &value, &e.to_string()) {
                        warn!(error = %qe, "failed to record quarantine entry");
                    }
                }
                if mutated {
                    obs::emit_rolled_back(spec.proposal_id(), phase, &e);
                    Err(OverallStatus::RolledBack)
                } else {
                    Err(OverallStatus::Failed)
                }
            }
        }
    }

    /// A recorded outcome for the same proposal that makes this run a no-op.
    async fn previous_outcome(&self, spec: &TechnicalSpec) -> Result<Option<Previous>> {
        if let Some(prev) = self.results.get(spec.proposal_id())? {
            let same_inputs = prev.spec_digest.as_deref() == Some(spec.spec_digest());
            match prev.overall_status {
                OverallStatus::Ready if same_inputs => return Ok(Some(Previous::Stored(prev))),
                OverallStatus::Ready => {
                    return Err(CodecraftError::ProposalConflict(spec.proposal_id().to_string()))
                }
                OverallStatus::Failed
                    if same_inputs
                        && prev
                            .failed_phase()
                            .and_then(|p| p.error_kind)
                            .is_some_and(is_deterministic) =>
                {
                    return Ok(Some(Previous::Stored(prev)))
                }
                _ => {}
            }
        }
        Ok(self
            .vcs
            .find_proposal_commit(spec.proposal_id())
            .await?
            .map(Previous::Committed))
    }

    /// Baseline, Modify, gate and Commit on the checked-out feature branch.
    async fn mutate_and_commit(
        &self,
        spec: &TechnicalSpec,
        cancel: &CancelSignal,
        run: &mut RunTracker<'_>,
    ) -> std::result::Result<String, PhaseError> {
        let modify = |e| (Phase::Modify, e);
        let baseline = self.tests.capture_baseline(spec, cancel).await.map_err(modify)?;
        cancel.check().map_err(modify)?;
        let modification = self.modifier.apply(spec).map_err(modify)?;
        run.record(
            ValidationResult::ok(
                Phase::Modify,
                format!("edited {}", modification.touched.join(", ")),
            )
            .with_artifact(modification.backup.backup.display().to_string())
            .with_confidence(modification.confidence),
        );
        cancel.check().map_err(|e| (Phase::Test, e))?;

        run.enter(PipelineState::Validating, Phase::Test);
        let gate = self
            .tests
            .generate_and_validate(spec, &modification.file_path, &baseline, cancel)
            .await
            .map_err(|e| (Phase::Test, e))?;
        match gate.status {
            GateStatus::Ready => {}
            GateStatus::NeedsFix => {
                return Err((
                    Phase::Test,
                    CodecraftError::TestFailure {
                        failing: gate.failing_tests(),
                    },
                ))
            }
            GateStatus::Regression => {
                return Err((
                    Phase::Test,
                    CodecraftError::Regression {
                        failing: gate.failing_tests(),
                    },
                ))
            }
        }
        run.record(
            ValidationResult::ok(Phase::Test, gate.summary())
                .with_artifact(gate.generated_test.clone()),
        );
        cancel.check().map_err(|e| (Phase::Commit, e))?;

        run.enter(PipelineState::Committing, Phase::Commit);
        let files: Vec<PathBuf> = vec![
            spec.file_path().to_path_buf(),
            self.tests.generated_test_path(spec),
        ];
        self.vcs
            .commit_changes(spec, &files)
            .await
            .map_err(|e| (Phase::Commit, e))
    }

    /// Restore backups, drop the generated test and abandon the branch.
    /// Returns whether a file had been mutated and whether the branch is gone.
    async fn rollback(&self, spec: &TechnicalSpec, branch: &FeatureBranch) -> (bool, bool) {
        let had_backups = !self.backups.active(spec.proposal_id()).is_empty();
        if let Err(e) = self.backups.restore_all(spec.proposal_id()) {
            obs::emit_rollback_error(spec.proposal_id(), &e);
        }
        if let Err(e) = self.tests.remove_generated(spec) {
            obs::emit_rollback_error(spec.proposal_id(), &e);
        }
        let abandoned = match self.vcs.abandon_feature_branch(branch).await {
            Ok(()) => true,
            Err(e) => {
                obs::emit_rollback_error(spec.proposal_id(), &e);
                false
            }
        };
        (had_backups, abandoned)
    }
}
