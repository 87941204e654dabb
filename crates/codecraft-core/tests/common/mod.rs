//! Shared fixtures: a throwaway git repository holding a small Python
//! project, and a scripted test runner so no Python toolchain is needed.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use codecraft_core::parser::ParseCache;
use codecraft_core::pipeline::{CodeMutationPipeline, PipelineComponents, ResultStore};
use codecraft_core::{
    AstModifier, BackupStore, CancelSignal, CodecraftConfig, CodecraftError, ExecutionQueue,
    ExtractionProvider, FeatureBranch, GitAutomator, GitError, Modification, Modifier,
    ProposalParser, QuarantineManager, Result, SafetyValidator, SafetyViolation, TechnicalSpec,
    TestGenerator, TestOutcome, TestRun, TestRunner, TestStatus, VcsAutomator,
};

pub const ORACLE: &str = "\"\"\"Signal oracle.\"\"\"\n\n\nclass OracleEngine:\n    threshold: float = 0.3\n    window = 20\n\n    def score(self, x):\n        return x > self.threshold\n";

pub const ORACLE_TEST: &str = "from src.oracle import OracleEngine\n\n\ndef test_threshold_in_range():\n    assert 0 < OracleEngine.threshold < 1\n";

pub const THRESHOLD_PROPOSAL: &str = "update threshold from 0.3 to 0.65 in OracleEngine";

pub fn git(repo: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub fn git_succeeds(repo: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .unwrap()
        .status
        .success()
}

pub fn branch_exists(repo: &Path, branch: &str) -> bool {
    git_succeeds(
        repo,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )
}

/// A repository with the oracle project committed, checked out on `branch`.
pub fn make_repo(branch: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-q"]);
    git(dir.path(), &["config", "user.name", "test-user"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    git(dir.path(), &["config", "commit.gpgsign", "false"]);
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::create_dir_all(dir.path().join("tests")).unwrap();
    fs::write(dir.path().join("src/oracle.py"), ORACLE).unwrap();
    fs::write(dir.path().join("tests/test_oracle.py"), ORACLE_TEST).unwrap();
    git(dir.path(), &["add", "-A"]);
    git(dir.path(), &["commit", "-q", "-m", "initial"]);
    git(dir.path(), &["checkout", "-q", "-B", branch]);
    dir
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Pass,
    GeneratedFails,
    /// Regression tests fail once the threshold moved off 0.3.
    Regresses,
    /// The generated test never finishes within the time limit.
    TimesOut,
}

pub struct FakeRunner {
    repo: PathBuf,
    behaviour: Mutex<Behaviour>,
    pub calls: AtomicUsize,
}

impl FakeRunner {
    pub fn new(repo: &Path) -> Self {
        Self {
            repo: repo.to_path_buf(),
            behaviour: Mutex::new(Behaviour::Pass),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }
}

#[async_trait]
impl TestRunner for FakeRunner {
    async fn run(&self, paths: &[PathBuf], cancel: &CancelSignal) -> Result<TestRun> {
        cancel.check()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behaviour = *self.behaviour.lock().unwrap();
        let runs_generated = paths
            .iter()
            .any(|p| p.to_string_lossy().contains("codecraft_generated"));
        if behaviour == Behaviour::TimesOut && runs_generated {
            return Err(CodecraftError::Timeout {
                operation: "pytest".into(),
                limit_ms: 300_000,
            });
        }
        let changed = fs::read_to_string(self.repo.join("src/oracle.py"))
            .map(|s| !s.contains("threshold: float = 0.3\n"))
            .unwrap_or(true);
        let outcomes = paths
            .iter()
            .map(|p| {
                let id = p.to_string_lossy().replace('\\', "/");
                let generated = id.contains("codecraft_generated");
                let status = if !self.repo.join(p).is_file() {
                    TestStatus::Error
                } else {
                    match behaviour {
                        Behaviour::GeneratedFails if generated => TestStatus::Failed,
                        Behaviour::Regresses if !generated && changed => TestStatus::Failed,
                        _ => TestStatus::Passed,
                    }
                };
                TestOutcome::new(format!("{id}::test_case"), status)
            })
            .collect();
        Ok(TestRun {
            outcomes,
            ..TestRun::default()
        })
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: CodecraftConfig,
    pub runner: Arc<FakeRunner>,
    pub pipeline: CodeMutationPipeline,
}

impl Harness {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source(&self) -> String {
        fs::read_to_string(self.path().join("src/oracle.py")).unwrap()
    }
}

pub fn harness(branch: &str) -> Harness {
    harness_with(branch, |_, _| {})
}

/// Like [`harness`], with components swapped out by `customize`.
pub fn harness_with<F>(branch: &str, customize: F) -> Harness
where
    F: FnOnce(&CodecraftConfig, &mut PipelineComponents),
{
    let dir = make_repo(branch);
    let config = CodecraftConfig {
        source_root: PathBuf::from("src"),
        ..CodecraftConfig::for_repo(dir.path())
    };
    let runner = Arc::new(FakeRunner::new(dir.path()));
    let mut parts = components(&config, runner.clone());
    customize(&config, &mut parts);
    let pipeline = CodeMutationPipeline::new(parts);
    Harness {
        dir,
        config,
        runner,
        pipeline,
    }
}

pub fn components(config: &CodecraftConfig, runner: Arc<FakeRunner>) -> PipelineComponents {
    let backups = Arc::new(BackupStore::new());
    let validator = Arc::new(SafetyValidator::from_config(config).unwrap());
    let parser = ProposalParser::new(
        &config.repo_root,
        &config.source_path(),
        ExtractionProvider::Heuristic,
        ParseCache::new(&config.state_path()),
    )
    .unwrap();
    PipelineComponents {
        parser: Arc::new(parser),
        modifier: Arc::new(AstModifier::new(validator, backups.clone())),
        backups,
        tests: TestGenerator::from_config(config, runner),
        vcs: Arc::new(GitAutomator::from_config(config)),
        quarantine: Arc::new(QuarantineManager::open(&config.state_path()).unwrap()),
        results: ResultStore::new(&config.state_path()),
        queue: Arc::new(ExecutionQueue::unbounded()),
    }
}

/// Runs `hook` after the wrapped modifier edited the tree.
pub struct HookModifier<F> {
    pub inner: Arc<dyn Modifier>,
    pub hook: F,
}

impl<F> Modifier for HookModifier<F>
where
    F: Fn(&TechnicalSpec) + Send + Sync,
{
    fn apply(&self, spec: &TechnicalSpec) -> Result<Modification> {
        let modification = self.inner.apply(spec)?;
        (self.hook)(spec);
        Ok(modification)
    }
}

/// Always rejects the edit as touching other symbols.
#[derive(Default)]
pub struct CollateralModifier {
    pub calls: AtomicUsize,
}

impl Modifier for CollateralModifier {
    fn apply(&self, spec: &TechnicalSpec) -> Result<Modification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SafetyViolation::CollateralChange {
            expected: spec.parameter_key(),
            symbols: vec!["OracleEngine.window".to_string()],
        }
        .into())
    }
}

/// Real git, except that committing fails.
pub struct CommitRefusingVcs {
    pub inner: GitAutomator,
}

#[async_trait]
impl VcsAutomator for CommitRefusingVcs {
    async fn current_branch(&self) -> Result<String> {
        self.inner.current_branch().await
    }

    async fn create_feature_branch(&self, proposal_id: &str) -> Result<FeatureBranch> {
        self.inner.create_feature_branch(proposal_id).await
    }

    async fn commit_changes(&self, _spec: &TechnicalSpec, _files: &[PathBuf]) -> Result<String> {
        Err(GitError::CommandFailed {
            command: "commit".into(),
            stderr: "pre-commit hook rejected the change".into(),
        }
        .into())
    }

    async fn checkout_branch(&self, name: &str) -> Result<()> {
        self.inner.checkout_branch(name).await
    }

    async fn abandon_feature_branch(&self, branch: &FeatureBranch) -> Result<()> {
        self.inner.abandon_feature_branch(branch).await
    }

    async fn find_proposal_commit(&self, proposal_id: &str) -> Result<Option<String>> {
        self.inner.find_proposal_commit(proposal_id).await
    }
}
