//! Durable run results and live run status.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::PipelineState;
use crate::atomic::write_atomic;
use crate::domain::error::Result;
use crate::domain::result::ChangeResult;

/// One JSON file per proposal under `<state_dir>/results`. A later run of
/// the same proposal overwrites the earlier record.
///
/// While a run executes, `<id>.running` holds its current state so other
/// processes can answer status queries. It is removed once the result is
/// stored; a marker left by a crashed process keeps reporting the last
/// state until the proposal runs again.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("results"),
        }
    }

    fn path_for(&self, proposal_id: &str) -> PathBuf {
        self.dir.join(format!("{proposal_id}.json"))
    }

    fn marker_for(&self, proposal_id: &str) -> PathBuf {
        self.dir.join(format!("{proposal_id}.running"))
    }

    pub fn get(&self, proposal_id: &str) -> Result<Option<ChangeResult>> {
        match fs::read(self.path_for(proposal_id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put(&self, result: &ChangeResult) -> Result<()> {
        let json = serde_json::to_vec_pretty(result)?;
        write_atomic(&self.path_for(&result.proposal_id), &json)?;
        Ok(())
    }

    pub fn mark_running(&self, proposal_id: &str, state: PipelineState) -> Result<()> {
        let marker = RunningMarker {
            proposal_id: proposal_id.to_string(),
            state,
            updated_at: Utc::now(),
        };
        write_atomic(&self.marker_for(proposal_id), &serde_json::to_vec(&marker)?)?;
        Ok(())
    }

    pub fn clear_running(&self, proposal_id: &str) -> Result<()> {
        match fs::remove_file(self.marker_for(proposal_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// State of a run in progress, as last recorded by whichever process
    /// executes it.
    pub fn running(&self, proposal_id: &str) -> Result<Option<PipelineState>> {
        match fs::read(self.marker_for(proposal_id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice::<RunningMarker>(&bytes)?.state)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored result, oldest first.
    pub fn list(&self) -> Result<Vec<ChangeResult>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut results = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            results.push(serde_json::from_slice::<ChangeResult>(&fs::read(&path)?)?);
        }
        results.sort_by_key(|r| r.finished_at);
        Ok(results)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RunningMarker {
    proposal_id: String,
    state: PipelineState,
    updated_at: DateTime<Utc>,
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusReport {
    Queued,
    InProgress { state: PipelineState },
    Finished { result: ChangeResult },
    NotFound,
}

/// States of runs currently executing.
#[derive(Debug, Default)]
pub struct StatusBoard {
    running: Mutex<HashMap<String, PipelineState>>,
}

impl StatusBoard {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PipelineState>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set(&self, proposal_id: &str, state: PipelineState) {
        self.lock().insert(proposal_id.to_string(), state);
    }

    pub fn clear(&self, proposal_id: &str) {
        self.lock().remove(proposal_id);
    }

    pub fn get(&self, proposal_id: &str) -> Option<PipelineState> {
        self.lock().get(proposal_id).copied()
    }
}
