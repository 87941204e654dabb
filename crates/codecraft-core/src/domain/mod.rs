//! Domain models for CodeCraft.
//!
//! - `TechnicalSpec`: immutable description of one atomic change
//! - `ValidationResult` / `ChangeResult`: what a pipeline run reports
//! - `CodecraftError`: the error taxonomy shared by every phase

pub mod digest;
pub mod error;
pub mod result;
pub mod spec;

pub use error::{CodecraftError, ErrorKind, GitError, Result, SafetyViolation};
pub use result::{
    ChangeResult, Confidence, OverallStatus, Phase, PhaseStatus, ValidationResult,
};
pub use spec::{ChangeType, DataType, TechnicalSpec, TechnicalSpecFields, Value};
