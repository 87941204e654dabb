//! Targeted test generation and the quality gate.

pub mod gate;
pub mod runner;
pub mod template;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use walkdir::WalkDir;

pub use gate::{
    evaluate_gate, Baseline, GateReport, GateRule, GateStatus, QualityGateResult, Violation,
};
pub use runner::{PytestRunner, TestOutcome, TestRun, TestRunner, TestStatus};

use crate::atomic::write_atomic;
use crate::cancel::CancelSignal;
use crate::config::CodecraftConfig;
use crate::domain::digest::sha256_hex;
use crate::domain::error::{CodecraftError, Result};
use crate::domain::spec::TechnicalSpec;
use crate::obs;
use crate::symbols::to_slash;

/// Directory (under the tests dir) holding generated tests.
pub const GENERATED_DIR: &str = "codecraft_generated";

pub struct TestGenerator {
    repo_root: PathBuf,
    /// Relative to `repo_root`.
    tests_dir: PathBuf,
    runner: Arc<dyn TestRunner>,
}

impl TestGenerator {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        tests_dir: impl Into<PathBuf>,
        runner: Arc<dyn TestRunner>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            tests_dir: tests_dir.into(),
            runner,
        }
    }

    pub fn from_config(config: &CodecraftConfig, runner: Arc<dyn TestRunner>) -> Self {
        Self::new(config.repo_root.clone(), config.tests_dir.clone(), runner)
    }

    /// Repository-relative path of the generated test for `spec`.
    pub fn generated_test_path(&self, spec: &TechnicalSpec) -> PathBuf {
        self.tests_dir
            .join(GENERATED_DIR)
            .join(generated_test_file_name(spec.proposal_id()))
    }

    /// Regression tests for the module `spec` touches: `test_*.py` /
    /// `*_test.py` files under the tests dir whose name or content mentions
    /// the module stem or the class. Generated tests are excluded.
    pub fn regression_suite(&self, spec: &TechnicalSpec) -> Vec<PathBuf> {
        let needles = regression_needles(spec);
        let root = self.repo_root.join(&self.tests_dir);
        let mut suite: Vec<PathBuf> = WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                let skipped =
                    name == GENERATED_DIR || name == "__pycache__" || name.starts_with('.');
                e.depth() == 0 || !(e.file_type().is_dir() && skipped)
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_test_file(e.path()))
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                needles.iter().any(|n| name.contains(n.as_str()))
                    || fs::read_to_string(e.path())
                        .map(|content| needles.iter().any(|n| content.contains(n.as_str())))
                        .unwrap_or(false)
            })
            .filter_map(|e| e.path().strip_prefix(&self.repo_root).ok().map(Path::to_path_buf))
            .collect();
        suite.sort();
        suite
    }

    /// Run the regression suite before the change.
    pub async fn capture_baseline(
        &self,
        spec: &TechnicalSpec,
        cancel: &CancelSignal,
    ) -> Result<Baseline> {
        let suite = self.regression_suite(spec);
        if suite.is_empty() {
            return Ok(Baseline::default());
        }
        let run = self.runner.run(&suite, cancel).await?;
        debug!(tests = run.outcomes.len(), passing = run.passing().count(), "baseline captured");
        Ok(Baseline::from_run(&run))
    }

    /// Write the targeted test for `spec`, run it and the regression suite,
    /// and evaluate the gate. `modified_file` is the edited module.
    pub async fn generate_and_validate(
        &self,
        spec: &TechnicalSpec,
        modified_file: &Path,
        baseline: &Baseline,
        cancel: &CancelSignal,
    ) -> Result<QualityGateResult> {
        if !modified_file.is_file() {
            return Err(CodecraftError::TestExecution(format!(
                "modified file {} does not exist",
                modified_file.display()
            )));
        }
        let rel = self.generated_test_path(spec);
        let source = template::render(spec, template::depth_below_root(&rel));
        write_atomic(&self.repo_root.join(&rel), source.as_bytes())?;

        let generated = self.runner.run(std::slice::from_ref(&rel), cancel).await?;
        cancel.check()?;
        let suite = self.regression_suite(spec);
        let regression = self.runner.run(&suite, cancel).await?;

        let (status, violations) = evaluate_gate(
            &GateRule::standard(),
            &GateReport {
                generated: &generated,
                regression: &regression,
                baseline,
            },
        );
        let passed = generated.passing().count() + regression.passing().count();
        let failed = generated.failing().len() + regression.failing().len();
        obs::emit_gate_evaluated(spec.proposal_id(), status.as_str(), passed, failed);

        Ok(QualityGateResult {
            status,
            generated_test: to_slash(&rel),
            generated: generated.outcomes,
            regression: regression.outcomes,
            violations,
        })
    }

    /// Delete the generated test for `spec`, if present.
    pub fn remove_generated(&self, spec: &TechnicalSpec) -> Result<()> {
        let path = self.repo_root.join(self.generated_test_path(spec));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `test_prop_<ident>_<tag>.py`. The tag is a prefix of the SHA-256 of the
/// raw id, so ids that map to the same identifier (`p-1`, `p_1`) still get
/// distinct files.
pub fn generated_test_file_name(proposal_id: &str) -> String {
    let digest = sha256_hex(proposal_id.as_bytes());
    let tag = digest.get(..8).unwrap_or(&digest);
    format!("test_prop_{}_{tag}.py", template::python_ident(proposal_id))
}

fn is_test_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".py") && (name.starts_with("test_") || name.ends_with("_test.py"))
}

/// Module stem (the package name for `__init__.py`) and class name.
fn regression_needles(spec: &TechnicalSpec) -> Vec<String> {
    let path = spec.file_path();
    let stem = match path.file_stem().and_then(|s| s.to_str()) {
        Some("__init__") => path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str()),
        other => other,
    };
    stem.into_iter()
        .map(str::to_string)
        .chain(spec.class_name().map(str::to_string))
        .filter(|n| !n.is_empty())
        .collect()
}
