//! On-disk cache of LLM extraction results, one JSON file per input hash.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::proposal::StructuredProposal;
use crate::atomic::write_atomic;
use crate::domain::error::Result;

#[derive(Debug, Clone)]
pub struct ParseCache {
    dir: PathBuf,
}

impl ParseCache {
    /// Cache rooted at `<state_dir>/parse-cache`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("parse-cache"),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Cached extraction for `key`. Missing and malformed entries are misses.
    pub fn get(&self, key: &str) -> Option<StructuredProposal> {
        let path = self.entry_path(key);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "ignoring malformed cache entry");
                None
            }
        }
    }

    pub fn put(&self, key: &str, entry: &StructuredProposal) -> Result<()> {
        let json = serde_json::to_vec_pretty(entry)?;
        write_atomic(&self.entry_path(key), &json)?;
        Ok(())
    }
}
