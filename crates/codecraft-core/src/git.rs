//! Git automation: isolated feature branches and exact, structured commits.
//!
//! Every call shells out to `git` with a timeout. Nothing here pushes, merges
//! or rebases; branches stay local for human review.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::CodecraftConfig;
use crate::domain::error::{CodecraftError, GitError, Result};
use crate::domain::spec::TechnicalSpec;
use crate::symbols::to_slash;

/// Branches the pipeline never commits to or branches from.
pub const PROTECTED_BRANCHES: &[&str] = &["main", "master", "develop", "staging", "production"];

pub fn is_protected(branch: &str) -> bool {
    PROTECTED_BRANCHES.contains(&branch)
}

/// `feature/prop_<id>`.
pub fn branch_name(proposal_id: &str) -> String {
    format!("feature/prop_{proposal_id}")
}

/// A feature branch and the branch it was created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureBranch {
    pub name: String,
    pub base: String,
}

/// Structured commit message for `spec`.
pub fn commit_message(spec: &TechnicalSpec, files: &[String]) -> String {
    let change = match spec.old_value() {
        Some(old) => format!("{old} -> {}", spec.new_value()),
        None => format!("(none) -> {}", spec.new_value()),
    };
    let files = files
        .iter()
        .map(|f| format!("  - {f}"))
        .collect::<Vec<_>>()
        .join("\n");
    let original = spec
        .original_proposal()
        .trim()
        .lines()
        .map(|l| format!("  {l}").trim_end().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{}: {} (CodeCraft Sage)\n\n\
         Proposal ID: {}\n\
         Change Type: {}\n\n\
         Files changed:\n{files}\n\n\
         Class: {}\n\
         Attribute: {}\n\
         Change: {change}\n\n\
         Original Proposal:\n{original}\n",
        spec.change_type().commit_type(),
        spec.short_description(),
        spec.proposal_id(),
        spec.change_type(),
        spec.class_name().unwrap_or("N/A"),
        spec.attribute_name().unwrap_or("N/A"),
    )
}

/// Version-control operations the pipeline needs.
#[async_trait]
pub trait VcsAutomator: Send + Sync {
    async fn current_branch(&self) -> Result<String>;

    /// Gate on the current branch and a clean tree, then create and check
    /// out `feature/prop_<id>`.
    async fn create_feature_branch(&self, proposal_id: &str) -> Result<FeatureBranch>;

    /// Stage exactly `files` (repository-relative) and commit. Returns the
    /// commit hash.
    async fn commit_changes(&self, spec: &TechnicalSpec, files: &[PathBuf]) -> Result<String>;

    /// Check out an existing branch.
    async fn checkout_branch(&self, name: &str) -> Result<()>;

    /// Unstage everything, check `branch.base` back out and delete
    /// `branch.name` when it holds no commits of its own.
    async fn abandon_feature_branch(&self, branch: &FeatureBranch) -> Result<()>;

    /// Tip of `feature/prop_<id>` when its message carries the proposal id.
    async fn find_proposal_commit(&self, proposal_id: &str) -> Result<Option<String>>;
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

pub struct GitAutomator {
    repo_root: PathBuf,
    timeout: Duration,
    author_name: String,
    author_email: String,
}

impl GitAutomator {
    pub fn new(repo_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo_root: repo_root.into(),
            timeout,
            author_name: "CodeCraft Sage".to_string(),
            author_email: "codecraft-sage@localhost".to_string(),
        }
    }

    pub fn from_config(config: &CodecraftConfig) -> Self {
        Self::new(config.repo_root.clone(), config.git_timeout())
            .with_author(&config.commit_author_name, &config.commit_author_email)
    }

    pub fn with_author(mut self, name: &str, email: &str) -> Self {
        self.author_name = name.to_string();
        self.author_email = email.to_string();
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    async fn git(&self, args: &[&str]) -> Result<GitOutput> {
        let command = args.first().copied().unwrap_or_default();
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("git")
                .args(args)
                .current_dir(&self.repo_root)
                .env("GIT_TERMINAL_PROMPT", "0")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| CodecraftError::Timeout {
            operation: format!("git {command}"),
            limit_ms: self.timeout.as_millis() as u64,
        })?
        .map_err(|e| GitError::CommandFailed {
            command: command.to_string(),
            stderr: format!("failed to run git: {e}"),
        })?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn git_ok(&self, args: &[&str]) -> Result<String> {
        let out = self.git(args).await?;
        if !out.success {
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: out.stderr,
            }
            .into());
        }
        Ok(out.stdout)
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        Ok(self
            .git(&["rev-parse", "--verify", "--quiet", &reference])
            .await?
            .success)
    }

    /// Location of `repo_root` below the work tree top level, `""` or
    /// `dir/` with a trailing slash. Paths git reports are top-level relative.
    async fn prefix(&self) -> Result<String> {
        Ok(self
            .git_ok(&["rev-parse", "--show-prefix"])
            .await?
            .trim()
            .to_string())
    }

    /// Tracked files with staged or unstaged changes, top-level relative.
    async fn dirty_files(&self) -> Result<Vec<String>> {
        let out = self
            .git_ok(&["status", "--porcelain=v1", "-z", "--untracked-files=no"])
            .await?;
        Ok(porcelain_paths(&out))
    }

    async fn checkout(&self, args: &[&str]) -> Result<()> {
        let out = self.git(args).await?;
        if out.success {
            return Ok(());
        }
        let lower = out.stderr.to_lowercase();
        if lower.contains("conflict") || lower.contains("would be overwritten") {
            Err(GitError::Conflict(out.stderr).into())
        } else {
            Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: out.stderr,
            }
            .into())
        }
    }
}

#[async_trait]
impl VcsAutomator for GitAutomator {
    async fn current_branch(&self) -> Result<String> {
        let out = self.git(&["symbolic-ref", "--quiet", "--short", "HEAD"]).await?;
        let branch = out.stdout.trim();
        if !out.success || branch.is_empty() {
            return Err(GitError::DetachedHead.into());
        }
        Ok(branch.to_string())
    }

    async fn create_feature_branch(&self, proposal_id: &str) -> Result<FeatureBranch> {
        let base = self.current_branch().await?;
        if is_protected(&base) {
            return Err(GitError::ProtectedBranch(base).into());
        }
        let dirty = self.dirty_files().await?;
        if !dirty.is_empty() {
            return Err(GitError::DirtyTree { files: dirty }.into());
        }
        let name = branch_name(proposal_id);
        if self.branch_exists(&name).await? {
            return Err(GitError::BranchExists(name).into());
        }
        self.checkout(&["checkout", "-q", "-b", &name]).await?;
        debug!(branch = %name, base = %base, "feature branch created");
        Ok(FeatureBranch { name, base })
    }

    async fn commit_changes(&self, spec: &TechnicalSpec, files: &[PathBuf]) -> Result<String> {
        let current = self.current_branch().await?;
        if is_protected(&current) {
            return Err(GitError::ProtectedBranch(current).into());
        }
        let requested: BTreeSet<String> = files.iter().map(|f| to_slash(f)).collect();
        for file in &requested {
            if !self.repo_root.join(file).is_file() {
                return Err(GitError::MissingFile(file.clone()).into());
            }
        }

        let mut add: Vec<&str> = vec!["add", "--"];
        add.extend(requested.iter().map(String::as_str));
        self.git_ok(&add).await?;

        let prefix = self.prefix().await?;
        let expected: BTreeSet<String> =
            requested.iter().map(|f| format!("{prefix}{f}")).collect();
        let staged: BTreeSet<String> = self
            .git_ok(&["diff", "--cached", "--name-only", "-z", "--no-renames"])
            .await?
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if staged != expected {
            if let Err(e) = self.git_ok(&["reset", "-q"]).await {
                warn!(error = %e, "failed to unstage after staging mismatch");
            }
            return Err(GitError::StagingMismatch {
                staged: staged.into_iter().collect(),
                requested: expected.into_iter().collect(),
            }
            .into());
        }

        let listed: Vec<String> = requested.iter().cloned().collect();
        let message = commit_message(spec, &listed);
        let name = format!("user.name={}", self.author_name);
        let email = format!("user.email={}", self.author_email);
        self.git_ok(&[
            "-c",
            &name,
            "-c",
            &email,
            "-c",
            "commit.gpgsign=false",
            "commit",
            "-q",
            "-m",
            &message,
        ])
        .await?;
        let hash = self.git_ok(&["rev-parse", "HEAD"]).await?.trim().to_string();
        Ok(hash)
    }

    async fn checkout_branch(&self, name: &str) -> Result<()> {
        self.checkout(&["checkout", "-q", name]).await
    }

    async fn abandon_feature_branch(&self, branch: &FeatureBranch) -> Result<()> {
        self.git_ok(&["reset", "-q"]).await?;
        if self.current_branch().await.ok().as_deref() != Some(branch.base.as_str()) {
            self.checkout(&["checkout", "-q", &branch.base]).await?;
        }
        if !self.branch_exists(&branch.name).await? {
            return Ok(());
        }
        let range = format!("{}..{}", branch.base, branch.name);
        let ahead = self.git_ok(&["rev-list", "--count", &range]).await?;
        if ahead.trim() == "0" {
            self.git_ok(&["branch", "-q", "-D", &branch.name]).await?;
        } else {
            warn!(branch = %branch.name, "feature branch has commits; keeping it");
        }
        Ok(())
    }

    async fn find_proposal_commit(&self, proposal_id: &str) -> Result<Option<String>> {
        let branch = branch_name(proposal_id);
        if !self.branch_exists(&branch).await? {
            return Ok(None);
        }
        let out = self.git_ok(&["log", "-1", "--format=%H%n%B", &branch]).await?;
        let mut lines = out.lines();
        let hash = lines.next().unwrap_or_default().trim().to_string();
        let marker = format!("Proposal ID: {proposal_id}");
        Ok(lines
            .any(|l| l.trim() == marker)
            .then_some(hash)
            .filter(|h| !h.is_empty()))
    }
}

/// Paths from `git status --porcelain=v1 -z`. A rename or copy entry is
/// followed by its source path, which is skipped.
fn porcelain_paths(out: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut entries = out.split('\0');
    while let Some(entry) = entries.next() {
        let (Some(code), Some(path)) = (entry.get(..2), entry.get(3..)) else {
            continue;
        };
        if !path.is_empty() {
            paths.push(path.to_string());
        }
        if code.contains('R') || code.contains('C') {
            entries.next();
        }
    }
    paths
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::process::Command as StdCommand;

    pub fn run_git(repo_dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    /// A repository with one commit of `files`, checked out on `branch`.
    pub fn make_git_repo(branch: &str, files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "-q"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(dir.path(), &["config", "commit.gpgsign", "false"]);
        for (rel, content) in files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        run_git(dir.path(), &["add", "-A"]);
        run_git(dir.path(), &["commit", "-q", "--allow-empty", "-m", "initial"]);
        run_git(dir.path(), &["checkout", "-q", "-B", branch]);
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{make_git_repo, run_git};
    use super::*;
    use crate::domain::spec::{ChangeType, DataType, TechnicalSpecFields, Value};

    fn spec() -> TechnicalSpec {
        TechnicalSpec::new(TechnicalSpecFields {
            proposal_id: "p42".into(),
            change_type: ChangeType::ParameterChange,
            file_path: "src/oracle.py".into(),
            class_name: Some("OracleEngine".into()),
            attribute_name: Some("threshold".into()),
            old_value: Some(Value::Float(0.3)),
            new_value: Value::Float(0.65),
            data_type: DataType::Float,
            original_proposal: "Raise the oracle threshold\nto cut noise.".into(),
        })
        .unwrap()
    }

    fn automator(dir: &Path) -> GitAutomator {
        GitAutomator::new(dir, Duration::from_secs(30))
    }

    const ORACLE: &str = "class OracleEngine:\n    threshold: float = 0.3\n";

    #[test]
    fn test_commit_message_format() {
        let msg = commit_message(&spec(), &["src/oracle.py".to_string()]);
        assert!(msg.starts_with("feat: update OracleEngine.threshold (CodeCraft Sage)\n\n"));
        assert!(msg.contains("Proposal ID: p42\nChange Type: ParameterChange\n"));
        assert!(msg.contains("Files changed:\n  - src/oracle.py\n"));
        assert!(msg.contains("Class: OracleEngine\nAttribute: threshold\nChange: 0.3 -> 0.65\n"));
        assert!(msg.ends_with("Original Proposal:\n  Raise the oracle threshold\n  to cut noise.\n"));
    }

    #[tokio::test]
    async fn test_protected_branch_is_refused() {
        let repo = make_git_repo("main", &[("src/oracle.py", ORACLE)]);
        let git = automator(repo.path());
        let err = git.create_feature_branch("p42").await.unwrap_err();
        assert!(matches!(
            err,
            CodecraftError::Git(GitError::ProtectedBranch(ref b)) if b == "main"
        ));
        assert!(!git.branch_exists("feature/prop_p42").await.unwrap());
    }

    #[tokio::test]
    async fn test_dirty_tree_names_files() {
        let repo = make_git_repo("work", &[("src/oracle.py", ORACLE)]);
        std::fs::write(repo.path().join("src/oracle.py"), "x = 1\n").unwrap();
        std::fs::write(repo.path().join("scratch.txt"), "untracked\n").unwrap();
        let git = automator(repo.path());
        let err = git.create_feature_branch("p42").await.unwrap_err();
        match err {
            CodecraftError::Git(GitError::DirtyTree { files }) => {
                assert_eq!(files, vec!["src/oracle.py"])
            }
            other => panic!("expected dirty tree, got {other:?}"),
        }
        assert_eq!(git.current_branch().await.unwrap(), "work");
    }

    #[tokio::test]
    async fn test_branch_commit_and_lookup() {
        let repo = make_git_repo("work", &[("src/oracle.py", ORACLE)]);
        let git = automator(repo.path());
        let branch = git.create_feature_branch("p42").await.unwrap();
        assert_eq!(branch.name, "feature/prop_p42");
        assert_eq!(branch.base, "work");

        std::fs::write(
            repo.path().join("src/oracle.py"),
            "class OracleEngine:\n    threshold: float = 0.65\n",
        )
        .unwrap();
        std::fs::write(repo.path().join("notes.txt"), "not staged\n").unwrap();
        let hash = git
            .commit_changes(&spec(), &[PathBuf::from("src/oracle.py")])
            .await
            .unwrap();
        assert_eq!(hash.len(), 40);

        let shown = run_git(repo.path(), &["show", "--name-only", "--format=%an", "HEAD"]);
        assert!(shown.starts_with("CodeCraft Sage"));
        assert!(shown.contains("src/oracle.py"));
        assert!(!shown.contains("notes.txt"));

        assert_eq!(git.find_proposal_commit("p42").await.unwrap(), Some(hash));
        assert_eq!(git.find_proposal_commit("p43").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_abandon_deletes_empty_branch() {
        let repo = make_git_repo("work", &[("src/oracle.py", ORACLE)]);
        let git = automator(repo.path());
        let branch = git.create_feature_branch("p42").await.unwrap();
        git.abandon_feature_branch(&branch).await.unwrap();
        assert_eq!(git.current_branch().await.unwrap(), "work");
        assert!(!git.branch_exists("feature/prop_p42").await.unwrap());
    }

    #[test]
    fn test_porcelain_paths_skip_rename_sources() {
        let out = " M src/a.py\0R  src/new.py\0src/old.py\0M  src/été.py\0";
        assert_eq!(
            porcelain_paths(out),
            vec!["src/a.py", "src/new.py", "src/été.py"]
        );
    }

    #[tokio::test]
    async fn test_non_ascii_path_commits_and_reports_dirty() {
        let repo = make_git_repo("work", &[("src/été.py", ORACLE)]);
        let git = automator(repo.path());

        std::fs::write(repo.path().join("src/été.py"), "x = 1\n").unwrap();
        match git.create_feature_branch("p42").await.unwrap_err() {
            CodecraftError::Git(GitError::DirtyTree { files }) => {
                assert_eq!(files, vec!["src/été.py"])
            }
            other => panic!("expected dirty tree, got {other:?}"),
        }
        run_git(repo.path(), &["checkout", "-q", "--", "."]);

        git.create_feature_branch("p42").await.unwrap();
        std::fs::write(
            repo.path().join("src/été.py"),
            "class OracleEngine:\n    threshold: float = 0.65\n",
        )
        .unwrap();
        let hash = git
            .commit_changes(&spec(), &[PathBuf::from("src/été.py")])
            .await
            .unwrap();
        let shown = run_git(
            repo.path(),
            &["-c", "core.quotePath=false", "show", "--name-only", "--format=", &hash],
        );
        assert_eq!(shown.trim(), "src/été.py");
    }

    #[tokio::test]
    async fn test_repo_root_below_work_tree_top_level() {
        let repo = make_git_repo("work", &[("pkg/src/oracle.py", ORACLE), ("README", "x\n")]);
        let git = automator(&repo.path().join("pkg"));
        git.create_feature_branch("p42").await.unwrap();

        std::fs::write(
            repo.path().join("pkg/src/oracle.py"),
            "class OracleEngine:\n    threshold: float = 0.65\n",
        )
        .unwrap();
        let hash = git
            .commit_changes(&spec(), &[PathBuf::from("src/oracle.py")])
            .await
            .unwrap();
        let shown = run_git(repo.path(), &["show", "--name-only", "--format=", &hash]);
        assert_eq!(shown.trim(), "pkg/src/oracle.py");
        assert_eq!(git.find_proposal_commit("p42").await.unwrap(), Some(hash));
    }

    #[tokio::test]
    async fn test_commit_of_missing_file_is_refused() {
        let repo = make_git_repo("work", &[("src/oracle.py", ORACLE)]);
        let git = automator(repo.path());
        git.create_feature_branch("p42").await.unwrap();
        let err = git
            .commit_changes(&spec(), &[PathBuf::from("src/missing.py")])
            .await
            .unwrap_err();
        assert!(matches!(err, CodecraftError::Git(GitError::MissingFile(_))));
    }
}
