//! Domain-level error taxonomy for the mutation pipeline.

use serde::{Deserialize, Serialize};

/// A safety rule violated during pre- or post-change validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SafetyViolation {
    #[error("path escapes the allowed source root: {0}")]
    PathEscape(String),

    #[error("path {path} matches protected pattern {pattern}")]
    Denylisted { path: String, pattern: String },

    #[error("target file does not exist: {0}")]
    MissingFile(String),

    #[error("target symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("modified source does not parse (line {line}, column {column})")]
    SyntaxError { line: usize, column: usize },

    #[error("unintended structural change to [{}] (only {expected} may change)", .symbols.join(", "))]
    CollateralChange {
        expected: String,
        symbols: Vec<String>,
    },

    #[error("intended symbol {0} is unchanged after the edit")]
    NoEffect(String),
}

impl SafetyViolation {
    /// Short rule name surfaced in phase results.
    pub fn rule(&self) -> &'static str {
        match self {
            Self::PathEscape(_) => "path_confinement",
            Self::Denylisted { .. } => "denylist",
            Self::MissingFile(_) => "target_exists",
            Self::SymbolNotFound(_) => "symbol_exists",
            Self::SyntaxError { .. } => "syntax_valid",
            Self::CollateralChange { .. } => "scope_confinement",
            Self::NoEffect(_) => "intended_change_present",
        }
    }
}

/// Errors raised by the git automation layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GitError {
    #[error("refusing to operate on protected branch '{0}'")]
    ProtectedBranch(String),

    #[error("working tree has uncommitted changes: {}", .files.join(", "))]
    DirtyTree { files: Vec<String> },

    #[error("HEAD is detached; a named base branch is required")]
    DetachedHead,

    #[error("branch '{0}' already exists")]
    BranchExists(String),

    #[error("checkout conflict (not auto-resolved): {0}")]
    Conflict(String),

    #[error("file to commit does not exist: {0}")]
    MissingFile(String),

    #[error("staged files [{}] differ from requested [{}]", .staged.join(", "), .requested.join(", "))]
    StagingMismatch {
        staged: Vec<String>,
        requested: Vec<String>,
    },

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// Pipeline domain errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecraftError {
    #[error("ambiguous proposal: {0}")]
    AmbiguousProposal(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("invalid technical spec: {0}")]
    InvalidSpec(String),

    #[error("safety validation failed [{}]: {0}", .0.rule())]
    Safety(#[from] SafetyViolation),

    #[error("generated test failed: {}", .failing.join(", "))]
    TestFailure { failing: Vec<String> },

    #[error("regression in previously passing tests: {}", .failing.join(", "))]
    Regression { failing: Vec<String> },

    #[error("test execution error: {0}")]
    TestExecution(String),

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error(
        "quarantined: {key} = {value} ({reason}; seen {occurrences} time(s))"
    )]
    Quarantined {
        key: String,
        value: String,
        reason: String,
        occurrences: u32,
    },

    #[error("{operation} timed out after {limit_ms}ms")]
    Timeout { operation: String, limit_ms: u64 },

    #[error("cancelled by operator")]
    Cancelled,

    #[error("queue is full; {priority} submission rejected")]
    QueueFull { priority: String },

    #[error("queue is closed")]
    QueueClosed,

    #[error("illegal pipeline transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("proposal {0} was already recorded with different inputs")]
    ProposalConflict(String),

    #[error("llm backend error: {0}")]
    Llm(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backup integrity error for {path}: expected {expected}, got {actual}")]
    BackupMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse, machine-readable classification of a [`CodecraftError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parse,
    Validation,
    TestFailure,
    Regression,
    Git,
    Quarantine,
    Timeout,
    Cancelled,
    Queue,
    Internal,
}

impl CodecraftError {
    /// Classify this error into the pipeline's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AmbiguousProposal(_)
            | Self::InvalidTarget(_)
            | Self::TypeMismatch { .. }
            | Self::InvalidSpec(_)
            | Self::ProposalConflict(_)
            | Self::Llm(_) => ErrorKind::Parse,
            Self::Safety(_) => ErrorKind::Validation,
            Self::TestFailure { .. } | Self::TestExecution(_) => ErrorKind::TestFailure,
            Self::Regression { .. } => ErrorKind::Regression,
            Self::Git(_) => ErrorKind::Git,
            Self::Quarantined { .. } => ErrorKind::Quarantine,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::QueueFull { .. } | Self::QueueClosed => ErrorKind::Queue,
            Self::Config(_)
            | Self::InvalidTransition { .. }
            | Self::BackupMismatch { .. }
            | Self::Serialization(_)
            | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether this failure is caused by the proposed change itself (as
    /// opposed to the environment) and should count towards quarantine.
    pub fn is_attributable_to_change(&self) -> bool {
        match self {
            Self::Safety(v) => matches!(
                v,
                SafetyViolation::SyntaxError { .. }
                    | SafetyViolation::CollateralChange { .. }
                    | SafetyViolation::NoEffect(_)
            ),
            Self::TestFailure { .. } | Self::Regression { .. } => true,
            _ => false,
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, CodecraftError>;
