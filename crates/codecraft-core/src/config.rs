//! Pipeline configuration.
//!
//! Defaults, optionally overlaid by a TOML file and then by `CODECRAFT_*`
//! environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::{CodecraftError, Result};

/// Regexes (matched against repo-relative `/` paths) that are never edited.
pub const DEFAULT_DENYLIST: &[&str] = &[
    r"(^|/)\.git(/|$)",
    r"(^|/)\.?venv/",
    r"(^|/)site-packages/",
    r"(^|/)safety[^/]*\.py$",
    r"(^|/)codecraft[^/]*(/|$)",
    r"(^|/)conftest\.py$",
];

/// LLM extraction backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    /// Endpoint speaking the `/api/generate` protocol; the model must answer
    /// with the structured proposal fields as JSON.
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/api/generate".to_string(),
            model: "codecraft-extractor".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CodecraftConfig {
    /// Root of the git repository being mutated.
    pub repo_root: PathBuf,
    /// Allowed source tree, relative to `repo_root`.
    pub source_root: PathBuf,
    /// Test directory, relative to `repo_root`.
    pub tests_dir: PathBuf,
    /// Pipeline state (results, quarantine log, parse cache), relative to
    /// `repo_root` unless absolute.
    pub state_dir: PathBuf,
    pub denylist: Vec<String>,
    /// Test command; test paths are appended.
    pub test_command: Vec<String>,
    pub test_timeout_secs: u64,
    pub git_timeout_secs: u64,
    pub commit_author_name: String,
    pub commit_author_email: String,
    /// Maximum queued tasks; `None` means unbounded.
    pub queue_capacity: Option<usize>,
    /// Slots of a bounded queue only User submissions may take.
    pub user_reserved_slots: usize,
    /// When absent, parsing uses the deterministic rules only.
    pub llm: Option<LlmConfig>,
}

impl Default for CodecraftConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            source_root: PathBuf::from("."),
            tests_dir: PathBuf::from("tests"),
            state_dir: PathBuf::from(".codecraft"),
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
            test_command: vec!["python".into(), "-m".into(), "pytest".into()],
            test_timeout_secs: 300,
            git_timeout_secs: 30,
            commit_author_name: "CodeCraft Sage".to_string(),
            commit_author_email: "codecraft-sage@localhost".to_string(),
            queue_capacity: None,
            user_reserved_slots: 1,
            llm: None,
        }
    }
}

impl CodecraftConfig {
    /// Config rooted at `repo_root` with all other values defaulted.
    pub fn for_repo(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden from `CODECRAFT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|k| std::env::var(k).ok())?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&text)
            .map_err(|e| CodecraftError::Config(format!("{}: {e}", path.display())))?;
        config.apply_env(|k| std::env::var(k).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (an environment accessor).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("CODECRAFT_REPO_ROOT") {
            self.repo_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("CODECRAFT_SOURCE_ROOT") {
            self.source_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("CODECRAFT_TESTS_DIR") {
            self.tests_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CODECRAFT_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CODECRAFT_TEST_COMMAND") {
            let parts: Vec<String> = v.split_whitespace().map(str::to_string).collect();
            if parts.is_empty() {
                return Err(CodecraftError::Config(
                    "CODECRAFT_TEST_COMMAND is empty".to_string(),
                ));
            }
            self.test_command = parts;
        }
        if let Some(v) = lookup("CODECRAFT_TEST_TIMEOUT_SECS") {
            self.test_timeout_secs = parse_secs("CODECRAFT_TEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("CODECRAFT_GIT_TIMEOUT_SECS") {
            self.git_timeout_secs = parse_secs("CODECRAFT_GIT_TIMEOUT_SECS", &v)?;
        }
        if let Some(endpoint) = lookup("CODECRAFT_LLM_ENDPOINT") {
            let llm = self.llm.get_or_insert_with(LlmConfig::default);
            llm.endpoint = endpoint;
        }
        if let Some(llm) = self.llm.as_mut() {
            if let Some(model) = lookup("CODECRAFT_LLM_MODEL") {
                llm.model = model;
            }
            if let Some(key) = lookup("CODECRAFT_LLM_API_KEY") {
                llm.api_key = Some(key);
            }
        }
        Ok(())
    }

    fn under_repo(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.repo_root.join(p)
        }
    }

    pub fn source_path(&self) -> PathBuf {
        self.repo_root.join(&self.source_root)
    }

    pub fn tests_path(&self) -> PathBuf {
        self.repo_root.join(&self.tests_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        self.under_repo(&self.state_dir)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

fn parse_secs(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| CodecraftError::Config(format!("{name} must be an integer, got {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CODECRAFT_TESTS_DIR", "test"),
            ("CODECRAFT_TEST_COMMAND", "pytest -x"),
            ("CODECRAFT_GIT_TIMEOUT_SECS", "5"),
            ("CODECRAFT_LLM_ENDPOINT", "http://llm.local/extract"),
            ("CODECRAFT_LLM_MODEL", "small"),
        ]);
        let mut config = CodecraftConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.tests_dir, PathBuf::from("test"));
        assert_eq!(config.test_command, vec!["pytest", "-x"]);
        assert_eq!(config.git_timeout(), Duration::from_secs(5));
        let llm = config.llm.unwrap();
        assert_eq!(llm.endpoint, "http://llm.local/extract");
        assert_eq!(llm.model, "small");
    }

    #[test]
    fn test_bad_timeout_is_config_error() {
        let mut config = CodecraftConfig::default();
        let err = config
            .apply_env(|k| (k == "CODECRAFT_TEST_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, CodecraftError::Config(_)));
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codecraft.toml");
        fs::write(
            &path,
            "repo_root = \"/srv/app\"\ntests_dir = \"qa\"\nqueue_capacity = 8\n\n[llm]\nmodel = \"m\"\n",
        )
        .unwrap();
        let config = CodecraftConfig::load(&path).unwrap();
        assert_eq!(config.tests_path(), PathBuf::from("/srv/app/qa"));
        assert_eq!(config.queue_capacity, Some(8));
        assert_eq!(config.state_path(), PathBuf::from("/srv/app/.codecraft"));
        assert_eq!(config.llm.unwrap().timeout_secs, 30);
    }
}
