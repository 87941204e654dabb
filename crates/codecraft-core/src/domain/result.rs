//! Per-phase validation results and the final change result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{CodecraftError, ErrorKind};

/// Pipeline phase a [`ValidationResult`] belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Parse,
    Modify,
    Test,
    Commit,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Parse => "parse",
            Phase::Modify => "modify",
            Phase::Test => "test",
            Phase::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Ok,
    Failed,
    Skipped,
}

/// How the edit was produced. `Reduced` marks the restricted text fallback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    Full,
    Reduced,
}

/// Outcome of a single pipeline phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub phase: Phase,
    pub status: PhaseStatus,
    /// Human-readable summary (rule name, failing tests, ...).
    pub details: String,
    /// Paths or identifiers produced by the phase (backup, test file, commit).
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ValidationResult {
    pub fn ok(phase: Phase, details: impl Into<String>) -> Self {
        Self {
            phase,
            status: PhaseStatus::Ok,
            details: details.into(),
            artifacts: Vec::new(),
            confidence: Confidence::Full,
            error_kind: None,
        }
    }

    pub fn failed(phase: Phase, err: &CodecraftError) -> Self {
        Self {
            phase,
            status: PhaseStatus::Failed,
            details: err.to_string(),
            artifacts: Vec::new(),
            confidence: Confidence::Full,
            error_kind: Some(err.kind()),
        }
    }

    pub fn skipped(phase: Phase, details: impl Into<String>) -> Self {
        Self {
            phase,
            status: PhaseStatus::Skipped,
            details: details.into(),
            artifacts: Vec::new(),
            confidence: Confidence::Full,
            error_kind: None,
        }
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifacts.push(artifact.into());
        self
    }

    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == PhaseStatus::Ok
    }
}

/// Terminal status of a pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// Committed on the feature branch, awaiting human review.
    Ready,
    /// Failed before any file was touched.
    Failed,
    /// Failed after a file mutation; every backup was restored.
    RolledBack,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Ready => "ready",
            OverallStatus::Failed => "failed",
            OverallStatus::RolledBack => "rolled_back",
        }
    }
}

/// Final record of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeResult {
    pub proposal_id: String,
    pub overall_status: OverallStatus,
    pub branch_name: Option<String>,
    pub commit_hash: Option<String>,
    pub phase_results: Vec<ValidationResult>,
    /// Digest of the parsed spec; absent when parsing failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_digest: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ChangeResult {
    pub fn is_ready(&self) -> bool {
        self.overall_status == OverallStatus::Ready
    }

    /// The first failed phase, if any.
    pub fn failed_phase(&self) -> Option<&ValidationResult> {
        self.phase_results
            .iter()
            .find(|r| r.status == PhaseStatus::Failed)
    }

    /// Whether any phase reported a reduced-confidence edit.
    pub fn has_reduced_confidence(&self) -> bool {
        self.phase_results
            .iter()
            .any(|r| r.confidence == Confidence::Reduced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::SafetyViolation;

    #[test]
    fn test_failed_result_carries_error_kind() {
        let err = CodecraftError::from(SafetyViolation::SymbolNotFound("A.b".into()));
        let r = ValidationResult::failed(Phase::Modify, &err);
        assert_eq!(r.status, PhaseStatus::Failed);
        assert_eq!(r.error_kind, Some(ErrorKind::Validation));
        assert!(r.details.contains("symbol_exists"));
    }

    #[test]
    fn test_change_result_serde_shape() {
        let result = ChangeResult {
            proposal_id: "p1".into(),
            overall_status: OverallStatus::RolledBack,
            branch_name: Some("feature/prop_p1".into()),
            commit_hash: None,
            phase_results: vec![
                ValidationResult::ok(Phase::Parse, "parsed"),
                ValidationResult::ok(Phase::Modify, "edited").with_confidence(Confidence::Reduced),
            ],
            spec_digest: None,
            finished_at: Utc::now(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["overall_status"], "rolled_back");
        assert_eq!(json["phase_results"][1]["confidence"], "reduced");
        assert!(json.get("spec_digest").is_none());
        assert!(result.has_reduced_confidence());

        let back: ChangeResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
