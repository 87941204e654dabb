//! Test execution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::cancel::CancelSignal;
use crate::domain::error::{CodecraftError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Skipped,
    Failed,
    Error,
}

/// Outcome of one test (or of a whole file when no per-test lines parse).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_id: String,
    pub status: TestStatus,
}

impl TestOutcome {
    pub fn new(test_id: impl Into<String>, status: TestStatus) -> Self {
        Self {
            test_id: test_id.into(),
            status,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }
}

/// Everything one runner invocation reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub outcomes: Vec<TestOutcome>,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl TestRun {
    pub fn outcome(&self, test_id: &str) -> Option<&TestOutcome> {
        self.outcomes.iter().find(|o| o.test_id == test_id)
    }

    pub fn failing(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, TestStatus::Failed | TestStatus::Error))
            .map(|o| o.test_id.clone())
            .collect()
    }

    pub fn passing(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|o| o.passed())
            .map(|o| o.test_id.as_str())
    }
}

/// Runs test files. Paths are relative to the repository root.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, paths: &[PathBuf], cancel: &CancelSignal) -> Result<TestRun>;
}

/// Runs `<command> -q -rA --rootdir=<repo> <paths>` in the repository.
#[derive(Debug, Clone)]
pub struct PytestRunner {
    command: Vec<String>,
    repo_root: PathBuf,
    timeout: Duration,
}

impl PytestRunner {
    pub fn new(command: Vec<String>, repo_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command,
            repo_root: repo_root.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TestRunner for PytestRunner {
    async fn run(&self, paths: &[PathBuf], cancel: &CancelSignal) -> Result<TestRun> {
        if paths.is_empty() {
            return Ok(TestRun::default());
        }
        let (exe, args) = self
            .command
            .split_first()
            .ok_or_else(|| CodecraftError::Config("test command is empty".to_string()))?;
        cancel.check()?;

        let start = Instant::now();
        let child = Command::new(exe)
            .args(args)
            .arg("-q")
            .arg("-rA")
            .arg("-p")
            .arg("no:cacheprovider")
            .arg(format!("--rootdir={}", self.repo_root.display()))
            .args(paths)
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CodecraftError::TestExecution(format!("failed to start {exe}: {e}")))?;

        // Dropping the pending wait kills the child.
        let output = tokio::select! {
            waited = tokio::time::timeout(self.timeout, child.wait_with_output()) => match waited {
                Ok(output) => output?,
                Err(_) => {
                    return Err(CodecraftError::Timeout {
                        operation: "test run".to_string(),
                        limit_ms: self.timeout.as_millis() as u64,
                    })
                }
            },
            _ = cancel.cancelled() => return Err(CodecraftError::Cancelled),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(exit_code, duration_ms, files = paths.len(), "test run finished");

        let mut outcomes = parse_summary(&stdout);
        if outcomes.is_empty() {
            outcomes = match exit_code {
                0 => per_file(paths, TestStatus::Passed),
                1 => per_file(paths, TestStatus::Failed),
                // No tests collected.
                5 => Vec::new(),
                _ => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(CodecraftError::TestExecution(format!(
                        "exit code {exit_code}: {}",
                        tail(if stderr.trim().is_empty() { &stdout } else { &stderr }, 20)
                    )));
                }
            };
        }
        Ok(TestRun {
            outcomes,
            exit_code,
            duration_ms,
        })
    }
}

/// Parse the `-rA` short summary. A test reported twice (a passing test with
/// a teardown error) keeps its worst status.
pub fn parse_summary(stdout: &str) -> Vec<TestOutcome> {
    let mut worst: BTreeMap<String, TestStatus> = BTreeMap::new();
    for line in stdout.lines() {
        let mut words = line.split_whitespace();
        let status = match words.next() {
            Some("PASSED" | "XFAIL") => TestStatus::Passed,
            Some("FAILED" | "XPASS") => TestStatus::Failed,
            Some("ERROR") => TestStatus::Error,
            _ => continue,
        };
        let Some(id) = words.next() else {
            continue;
        };
        let slot = worst.entry(id.to_string()).or_insert(status);
        if status > *slot {
            *slot = status;
        }
    }
    worst
        .into_iter()
        .map(|(test_id, status)| TestOutcome { test_id, status })
        .collect()
}

fn per_file(paths: &[PathBuf], status: TestStatus) -> Vec<TestOutcome> {
    paths
        .iter()
        .map(|p| TestOutcome::new(crate::symbols::to_slash(p), status))
        .collect()
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_summary_keeps_worst_status() {
        let out = "\
..F
=========================== short test summary info ============================
PASSED tests/test_oracle.py::test_threshold
PASSED tests/test_oracle.py::test_window
FAILED tests/test_oracle.py::test_score - AssertionError: assert 1 == 2
ERROR tests/test_oracle.py::test_window - RuntimeError: teardown
ERROR tests/test_broken.py - ImportError: no module
1 failed, 2 passed, 2 errors in 0.12s
";
        let outcomes = parse_summary(out);
        assert_eq!(outcomes.len(), 4);
        let window = outcomes
            .iter()
            .find(|o| o.test_id == "tests/test_oracle.py::test_window")
            .unwrap();
        assert_eq!(window.status, TestStatus::Error);
        let run = TestRun {
            outcomes,
            ..TestRun::default()
        };
        assert_eq!(run.passing().collect::<Vec<_>>(), vec!["tests/test_oracle.py::test_threshold"]);
        assert_eq!(run.failing().len(), 3);
    }

    #[tokio::test]
    async fn test_exit_code_fallback_is_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = PytestRunner::new(
            vec!["sh".into(), "-c".into(), "exit 1".into(), "sh".into()],
            dir.path(),
            Duration::from_secs(10),
        );
        let run = runner
            .run(&[PathBuf::from("tests/test_a.py")], &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(run.outcomes, vec![TestOutcome::new("tests/test_a.py", TestStatus::Failed)]);
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = PytestRunner::new(
            vec!["sh".into(), "-c".into(), "sleep 5".into(), "sh".into()],
            dir.path(),
            Duration::from_millis(100),
        );
        let err = runner
            .run(&[PathBuf::from("tests/test_a.py")], &CancelSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CodecraftError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = PytestRunner::new(
            vec!["sh".into(), "-c".into(), "sleep 5".into(), "sh".into()],
            dir.path(),
            Duration::from_secs(30),
        );
        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = runner
            .run(&[PathBuf::from("tests/test_a.py")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CodecraftError::Cancelled));
    }
}
