//! Applies a [`TechnicalSpec`] to the source tree.
//!
//! Order of operations in [`AstModifier::apply`]:
//! 1. pre-check and locate the target (fail closed, nothing written)
//! 2. compute the edit in memory
//! 3. back up the original through the [`BackupStore`]
//! 4. write the edited file atomically
//! 5. post-check; any failure after step 3 restores the backup before
//!    returning, so an `Err` always leaves the original bytes in place

pub mod backup;
pub mod edit;
pub mod fallback;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::atomic::write_atomic;
use crate::domain::error::{CodecraftError, Result};
use crate::domain::result::Confidence;
use crate::domain::spec::TechnicalSpec;
use crate::obs;
use crate::python::locate::locate;
use crate::python::SourceFile;
use crate::safety::Validator;

pub use backup::{backup_path_for, BackupRecord, BackupStore};
pub use edit::Edit;

/// A successfully applied and post-checked modification.
#[derive(Debug, Clone)]
pub struct Modification {
    pub file_path: PathBuf,
    pub backup: BackupRecord,
    /// Outline keys the edit was allowed to change.
    pub touched: Vec<String>,
    pub confidence: Confidence,
    pub original: String,
    pub modified: String,
}

/// Applies one spec to the working tree.
pub trait Modifier: Send + Sync {
    fn apply(&self, spec: &TechnicalSpec) -> Result<Modification>;
}

pub struct AstModifier {
    validator: Arc<dyn Validator>,
    backups: Arc<BackupStore>,
}

impl AstModifier {
    pub fn new(validator: Arc<dyn Validator>, backups: Arc<BackupStore>) -> Self {
        Self { validator, backups }
    }

    fn restore_after(&self, record: &BackupRecord, cause: CodecraftError) -> CodecraftError {
        match self.backups.restore(record) {
            Ok(()) => cause,
            Err(restore_err) => {
                obs::emit_rollback_error(&record.proposal_id, &restore_err);
                restore_err
            }
        }
    }
}

impl Modifier for AstModifier {
    fn apply(&self, spec: &TechnicalSpec) -> Result<Modification> {
        let path = self.validator.pre_check(spec)?;
        let original = fs::read_to_string(&path)?;
        let file = SourceFile::parse(original.as_str())?;
        let located = locate(&file, spec)?;
        let edit = edit::compute_edit(&file, spec, &located)?;

        let backup = self.backups.create(spec.proposal_id(), &path)?;
        if let Err(e) = write_atomic(&path, edit.source.as_bytes()) {
            return Err(self.restore_after(&backup, e.into()));
        }
        if let Err(e) = self
            .validator
            .post_check(&original, &edit.source, &edit.touched)
        {
            return Err(self.restore_after(&backup, e));
        }

        if edit.confidence == Confidence::Reduced {
            obs::emit_text_fallback(spec.proposal_id(), &path.display().to_string());
        }
        debug!(file = %path.display(), touched = ?edit.touched, "modification applied");
        Ok(Modification {
            file_path: path,
            backup,
            touched: edit.touched,
            confidence: edit.confidence,
            original,
            modified: edit.source,
        })
    }
}
