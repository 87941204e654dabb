//! CodeCraft Core Library
//!
//! Controlled code mutation: turns approved change proposals into validated,
//! committed edits of a Python source tree on isolated review branches.

pub mod atomic;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod git;
pub mod modifier;
pub mod obs;
pub mod parser;
pub mod pipeline;
pub mod python;
pub mod quarantine;
pub mod queue;
pub mod safety;
pub mod symbols;
pub mod telemetry;
pub mod testgen;

pub use cancel::CancelSignal;
pub use config::{CodecraftConfig, LlmConfig};

pub use domain::{
    ChangeResult, ChangeType, CodecraftError, Confidence, DataType, ErrorKind, GitError,
    OverallStatus, Phase, PhaseStatus, Result, SafetyViolation, TechnicalSpec,
    TechnicalSpecFields, ValidationResult, Value,
};

pub use git::{
    branch_name, commit_message, FeatureBranch, GitAutomator, VcsAutomator, PROTECTED_BRANCHES,
};
pub use modifier::{AstModifier, BackupRecord, BackupStore, Modification, Modifier};
pub use parser::{ExtractionProvider, Proposal, ProposalParser, SpecParser, StructuredProposal};
pub use pipeline::{
    CodeMutationPipeline, PipelineComponents, PipelineState, ResultStore, StatusReport, Worker,
};
pub use quarantine::{QuarantineEntry, QuarantineManager};
pub use queue::{ExecutionQueue, Priority, QueueTask, TaskPayload};
pub use safety::{SafetyValidator, Validator};
pub use symbols::SymbolIndex;
pub use testgen::{
    GateStatus, PytestRunner, QualityGateResult, TestGenerator, TestOutcome, TestRun, TestRunner,
    TestStatus,
};
