//! Quarantine of parameter/value combinations that broke the code base.
//!
//! The store is an append-only JSON-lines log (`quarantine.jsonl`). Current
//! state is the fold of the log, so readers can open it at any time while the
//! pipeline appends.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::error::{CodecraftError, Result};
use crate::obs;

pub const QUARANTINE_FILE: &str = "quarantine.jsonl";

/// One blocked combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    /// `file::symbol`.
    pub parameter_key: String,
    pub blocked_value: String,
    pub reason: String,
    pub first_seen: DateTime<Utc>,
    pub occurrence_count: u32,
}

impl QuarantineEntry {
    pub fn to_error(&self) -> CodecraftError {
        CodecraftError::Quarantined {
            key: self.parameter_key.clone(),
            value: self.blocked_value.clone(),
            reason: self.reason.clone(),
            occurrences: self.occurrence_count,
        }
    }
}

/// A line of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum QuarantineRecord {
    Quarantine {
        key: String,
        value: String,
        reason: String,
        at: DateTime<Utc>,
    },
    Attempt {
        key: String,
        value: String,
        at: DateTime<Utc>,
    },
    Release {
        key: String,
        at: DateTime<Utc>,
    },
}

type EntryMap = BTreeMap<(String, String), QuarantineEntry>;

/// State folded from the log: live entries plus the last release per key.
#[derive(Default)]
struct Ledger {
    entries: EntryMap,
    released: BTreeMap<String, DateTime<Utc>>,
}

impl Ledger {
    fn fold(&mut self, record: &QuarantineRecord) {
        match record {
            QuarantineRecord::Quarantine {
                key,
                value,
                reason,
                at,
            } => {
                self.entries
                    .entry((key.clone(), value.clone()))
                    .and_modify(|e| e.occurrence_count += 1)
                    .or_insert_with(|| QuarantineEntry {
                        parameter_key: key.clone(),
                        blocked_value: value.clone(),
                        reason: reason.clone(),
                        first_seen: *at,
                        occurrence_count: 1,
                    });
            }
            QuarantineRecord::Attempt { key, value, .. } => {
                if let Some(e) = self.entries.get_mut(&(key.clone(), value.clone())) {
                    e.occurrence_count += 1;
                }
            }
            QuarantineRecord::Release { key, at } => {
                self.entries.retain(|(k, _), _| k != key);
                self.released.insert(key.clone(), *at);
            }
        }
    }
}

pub struct QuarantineManager {
    path: PathBuf,
    ledger: Mutex<Ledger>,
}

impl QuarantineManager {
    /// Open (or start) the log under `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(QUARANTINE_FILE);
        let mut ledger = Ledger::default();
        for record in read_log(&path)? {
            ledger.fold(&record);
        }
        Ok(Self {
            path,
            ledger: Mutex::new(ledger),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, ledger: &mut Ledger, record: QuarantineRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        ledger.fold(&record);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Whether any value of `key` is blocked.
    pub fn is_quarantined(&self, key: &str) -> bool {
        self.lock().entries.keys().any(|(k, _)| k == key)
    }

    /// Whether an operator released `key` after `at`.
    pub fn released_since(&self, key: &str, at: DateTime<Utc>) -> bool {
        self.lock().released.get(key).is_some_and(|r| *r > at)
    }

    /// The entry blocking `value` for `key`, if any. A hit is recorded as a
    /// repeated attempt and the returned entry carries the new count.
    pub fn check(&self, key: &str, value: &str) -> Result<Option<QuarantineEntry>> {
        let mut ledger = self.lock();
        let id = (key.to_string(), value.to_string());
        if !ledger.entries.contains_key(&id) {
            return Ok(None);
        }
        self.append(
            &mut ledger,
            QuarantineRecord::Attempt {
                key: key.to_string(),
                value: value.to_string(),
                at: Utc::now(),
            },
        )?;
        Ok(ledger.entries.get(&id).cloned())
    }

    /// Block `value` for `key`. Quarantining a blocked combination again
    /// increments its count and keeps the first reason.
    pub fn quarantine(&self, key: &str, value: &str, reason: &str) -> Result<QuarantineEntry> {
        let mut ledger = self.lock();
        self.append(
            &mut ledger,
            QuarantineRecord::Quarantine {
                key: key.to_string(),
                value: value.to_string(),
                reason: reason.to_string(),
                at: Utc::now(),
            },
        )?;
        obs::emit_quarantined(key, value, reason);
        ledger
            .entries
            .get(&(key.to_string(), value.to_string()))
            .cloned()
            .ok_or_else(|| CodecraftError::Config(format!("quarantine entry for {key} vanished")))
    }

    /// Operator release of every value blocked for `key`. Returns the number
    /// of entries removed.
    pub fn release(&self, key: &str) -> Result<usize> {
        let mut ledger = self.lock();
        let removed = ledger.entries.keys().filter(|(k, _)| k == key).count();
        if removed == 0 {
            return Ok(0);
        }
        self.append(
            &mut ledger,
            QuarantineRecord::Release {
                key: key.to_string(),
                at: Utc::now(),
            },
        )?;
        obs::emit_quarantine_released(key, removed);
        Ok(removed)
    }

    pub fn list(&self) -> Vec<QuarantineEntry> {
        self.lock().entries.values().cloned().collect()
    }
}

/// Records of the log at `path`; a missing file is an empty log. Lines that
/// do not parse are skipped with a warning.
pub fn read_log(path: &Path) -> Result<Vec<QuarantineRecord>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .filter_map(|(n, l)| match serde_json::from_str(l) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), line = n + 1, error = %e, "skipping malformed quarantine record");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "src/oracle.py::OracleEngine.threshold";

    #[test]
    fn test_quarantine_blocks_only_the_failed_value() {
        let dir = tempfile::tempdir().unwrap();
        let q = QuarantineManager::open(dir.path()).unwrap();
        q.quarantine(KEY, "0.65", "regression in tests/test_oracle.py").unwrap();

        assert!(q.is_quarantined(KEY));
        assert!(q.check(KEY, "0.7").unwrap().is_none());
        let hit = q.check(KEY, "0.65").unwrap().unwrap();
        assert_eq!(hit.occurrence_count, 2);
        assert_eq!(hit.reason, "regression in tests/test_oracle.py");
    }

    #[test]
    fn test_state_survives_reopen_and_counts_grow() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = QuarantineManager::open(dir.path()).unwrap();
            q.quarantine(KEY, "0.65", "first").unwrap();
            q.quarantine(KEY, "0.65", "second").unwrap();
        }
        let q = QuarantineManager::open(dir.path()).unwrap();
        let entries = q.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].occurrence_count, 2);
        assert_eq!(entries[0].reason, "first");
    }

    #[test]
    fn test_release_removes_and_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let q = QuarantineManager::open(dir.path()).unwrap();
        q.quarantine(KEY, "0.65", "boom").unwrap();
        q.quarantine(KEY, "0.9", "boom").unwrap();
        let before = Utc::now() - chrono::Duration::seconds(1);
        assert!(!q.released_since(KEY, before));
        assert_eq!(q.release(KEY).unwrap(), 2);
        assert!(q.released_since(KEY, before));
        assert!(!q.released_since(KEY, Utc::now() + chrono::Duration::seconds(60)));
        assert_eq!(q.release(KEY).unwrap(), 0);
        assert!(!q.is_quarantined(KEY));

        let records = read_log(q.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[2], QuarantineRecord::Release { .. }));
        let reopened = QuarantineManager::open(dir.path()).unwrap();
        assert!(reopened.list().is_empty());
        assert!(reopened.released_since(KEY, before));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let q = QuarantineManager::open(dir.path()).unwrap();
        q.quarantine(KEY, "0.65", "boom").unwrap();
        let mut file = OpenOptions::new().append(true).open(q.path()).unwrap();
        file.write_all(b"not json\n").unwrap();
        assert_eq!(QuarantineManager::open(dir.path()).unwrap().list().len(), 1);
    }
}
