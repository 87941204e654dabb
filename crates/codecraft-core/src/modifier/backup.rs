//! Backup/restore authority.
//!
//! Every file mutation goes through [`BackupStore::create`] first and every
//! rollback through [`BackupStore::restore`] / [`BackupStore::restore_all`].
//! Backups sit next to the original as `<original>.bak.<proposal_id>` and are
//! verified against the SHA-256 recorded at creation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atomic::write_atomic;
use crate::domain::digest::sha256_hex;
use crate::domain::error::{CodecraftError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub proposal_id: String,
    pub original: PathBuf,
    pub backup: PathBuf,
    /// SHA-256 of the original bytes.
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct BackupStore {
    active: Mutex<HashMap<String, Vec<BackupRecord>>>,
}

/// Deterministic backup location for `original` under `proposal_id`.
pub fn backup_path_for(original: &Path, proposal_id: &str) -> PathBuf {
    let mut name = original
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".bak.{proposal_id}"));
    original.with_file_name(name)
}

impl BackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `original` byte-for-byte to its backup path and remember it as
    /// active for `proposal_id`.
    pub fn create(&self, proposal_id: &str, original: &Path) -> Result<BackupRecord> {
        let bytes = fs::read(original)?;
        let sha256 = sha256_hex(&bytes);
        let backup = backup_path_for(original, proposal_id);
        write_atomic(&backup, &bytes)?;

        let written = sha256_hex(&fs::read(&backup)?);
        if written != sha256 {
            return Err(CodecraftError::BackupMismatch {
                path: backup.display().to_string(),
                expected: sha256,
                actual: written,
            });
        }

        let record = BackupRecord {
            proposal_id: proposal_id.to_string(),
            original: original.to_path_buf(),
            backup,
            sha256,
            created_at: Utc::now(),
        };
        debug!(backup = %record.backup.display(), "backup created");
        self.lock()
            .entry(proposal_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    /// Put the backed-up bytes back in place and verify the result.
    pub fn restore(&self, record: &BackupRecord) -> Result<()> {
        let bytes = fs::read(&record.backup)?;
        let actual = sha256_hex(&bytes);
        if actual != record.sha256 {
            return Err(CodecraftError::BackupMismatch {
                path: record.backup.display().to_string(),
                expected: record.sha256.clone(),
                actual,
            });
        }
        write_atomic(&record.original, &bytes)?;

        let restored = sha256_hex(&fs::read(&record.original)?);
        if restored != record.sha256 {
            return Err(CodecraftError::BackupMismatch {
                path: record.original.display().to_string(),
                expected: record.sha256.clone(),
                actual: restored,
            });
        }
        debug!(original = %record.original.display(), "backup restored");
        Ok(())
    }

    /// Restore every active backup of `proposal_id`, newest first, and
    /// forget them. Returns the restored paths.
    ///
    /// All restores are attempted; the first error is returned.
    pub fn restore_all(&self, proposal_id: &str) -> Result<Vec<PathBuf>> {
        let records = self.lock().remove(proposal_id).unwrap_or_default();
        let mut restored = Vec::new();
        let mut first_err = None;
        for record in records.iter().rev() {
            match self.restore(record) {
                Ok(()) => restored.push(record.original.clone()),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(restored),
        }
    }

    /// Forget the active backups of a committed proposal. The backup files
    /// themselves stay on disk for review.
    pub fn release(&self, proposal_id: &str) -> Vec<BackupRecord> {
        self.lock().remove(proposal_id).unwrap_or_default()
    }

    pub fn active(&self, proposal_id: &str) -> Vec<BackupRecord> {
        self.lock().get(proposal_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<BackupRecord>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_path_is_deterministic() {
        let p = backup_path_for(Path::new("src/oracle.py"), "prop-1");
        assert_eq!(p, PathBuf::from("src/oracle.py.bak.prop-1"));
    }

    #[test]
    fn test_restore_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        let original = b"x = 0.3\r\n# trailing\n\n".to_vec();
        fs::write(&path, &original).unwrap();

        let store = BackupStore::new();
        let record = store.create("p1", &path).unwrap();
        fs::write(&path, b"x = 0.65\n").unwrap();

        let restored = store.restore_all("p1").unwrap();
        assert_eq!(restored, vec![path.clone()]);
        assert_eq!(fs::read(&path).unwrap(), original);
        assert!(record.backup.exists());
        assert!(store.active("p1").is_empty());
    }

    #[test]
    fn test_tampered_backup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, b"x = 1\n").unwrap();
        let store = BackupStore::new();
        let record = store.create("p1", &path).unwrap();
        fs::write(&record.backup, b"x = 2\n").unwrap();
        assert!(matches!(
            store.restore(&record),
            Err(CodecraftError::BackupMismatch { .. })
        ));
    }
}
