//! Pre- and post-change safety checks.
//!
//! Pre-check: the target path is confined to the allowed source root (both
//! lexically and after resolving symlinks), is not denylisted, exists, parses,
//! and contains the target symbol. Post-check: the modified source parses and
//! its structural outline differs from the original in exactly the intended
//! symbols.

use std::fs;
use std::path::{Component, Path, PathBuf};

use regex::Regex;

use crate::config::CodecraftConfig;
use crate::domain::error::{CodecraftError, Result, SafetyViolation};
use crate::domain::spec::{ChangeType, TechnicalSpec};
use crate::python::locate::{self, find_function, Target};
use crate::python::outline::key_within;
use crate::python::{diff_outlines, normalize_ws, Outline, SourceFile};
use crate::symbols::to_slash;

/// Safety checks around a modification.
pub trait Validator: Send + Sync {
    /// Validate `spec` against the tree; returns the resolved target path.
    fn pre_check(&self, spec: &TechnicalSpec) -> Result<PathBuf>;

    /// Validate an edit: `modified` must parse and differ from `original`
    /// only within the `expected` outline keys.
    fn post_check(&self, original: &str, modified: &str, expected: &[String]) -> Result<()>;
}

pub struct SafetyValidator {
    repo_root: PathBuf,
    source_root: PathBuf,
    denylist: Vec<Regex>,
}

impl SafetyValidator {
    /// Both roots must exist; `source_root` must lie inside `repo_root`.
    pub fn new(repo_root: &Path, source_root: &Path, denylist: &[String]) -> Result<Self> {
        let repo_root = repo_root.canonicalize()?;
        let source_root = source_root.canonicalize()?;
        if !source_root.starts_with(&repo_root) {
            return Err(CodecraftError::Config(format!(
                "source root {} is outside the repository {}",
                source_root.display(),
                repo_root.display()
            )));
        }
        let denylist = denylist
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| CodecraftError::Config(format!("bad denylist pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            repo_root,
            source_root,
            denylist,
        })
    }

    pub fn from_config(config: &CodecraftConfig) -> Result<Self> {
        Self::new(&config.repo_root, &config.source_path(), &config.denylist)
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn denylisted(&self, rel: &str) -> Option<SafetyViolation> {
        self.denylist
            .iter()
            .find(|re| re.is_match(rel))
            .map(|re| SafetyViolation::Denylisted {
                path: rel.to_string(),
                pattern: re.as_str().to_string(),
            })
    }

    /// Confine `rel` to the source root and return its canonical path.
    pub fn check_path(&self, rel: &Path) -> Result<PathBuf> {
        let display = to_slash(rel);
        let lexical_escape = rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if lexical_escape || display.is_empty() {
            return Err(SafetyViolation::PathEscape(display).into());
        }
        if let Some(v) = self.denylisted(&display) {
            return Err(v.into());
        }

        let joined = self.repo_root.join(rel);
        if !joined.is_file() {
            return Err(SafetyViolation::MissingFile(display).into());
        }
        let canonical = joined.canonicalize()?;
        if !canonical.starts_with(&self.source_root) {
            return Err(SafetyViolation::PathEscape(display).into());
        }
        // A symlink may point at a denylisted file.
        if let Ok(real_rel) = canonical.strip_prefix(&self.repo_root) {
            if let Some(v) = self.denylisted(&to_slash(real_rel)) {
                return Err(v.into());
            }
        }
        Ok(canonical)
    }
}

impl Validator for SafetyValidator {
    fn pre_check(&self, spec: &TechnicalSpec) -> Result<PathBuf> {
        let path = self.check_path(spec.file_path())?;
        let file = SourceFile::parse(fs::read_to_string(&path)?)?;
        if let Some((line, column)) = file.syntax_error() {
            return Err(CodecraftError::InvalidTarget(format!(
                "{} does not parse before modification (line {line}, column {column})",
                to_slash(spec.file_path())
            )));
        }
        let located = locate::locate(&file, spec)?;
        check_not_present(&file, spec, &located.target)?;
        Ok(path)
    }

    fn post_check(&self, original: &str, modified: &str, expected: &[String]) -> Result<()> {
        let after = SourceFile::parse(modified)?;
        if let Some((line, column)) = after.syntax_error() {
            return Err(SafetyViolation::SyntaxError { line, column }.into());
        }
        let before = SourceFile::parse(original)?;
        let changed = diff_outlines(&Outline::build(&before), &Outline::build(&after));
        if changed.is_empty() {
            return Err(SafetyViolation::NoEffect(expected.join(", ")).into());
        }
        let collateral: Vec<String> = changed
            .into_iter()
            .filter(|k| !expected.iter().any(|e| key_within(k, e)))
            .collect();
        if !collateral.is_empty() {
            return Err(SafetyViolation::CollateralChange {
                expected: expected.join(", "),
                symbols: collateral,
            }
            .into());
        }
        Ok(())
    }
}

/// Additive changes must not collide with what is already there.
fn check_not_present(file: &SourceFile, spec: &TechnicalSpec, target: &Target<'_>) -> Result<()> {
    match (spec.change_type(), target) {
        (ChangeType::MethodAddition, Target::ClassBody { body, .. }) => {
            let name = spec.attribute_name().unwrap_or_default();
            if find_function(file.source(), *body, name).is_some() {
                return Err(CodecraftError::InvalidTarget(format!(
                    "{}.{name} already exists",
                    spec.class_name().unwrap_or_default()
                )));
            }
            Ok(())
        }
        (ChangeType::ImportAddition, _) => {
            let wanted = normalize_ws(&spec.new_value().source_text());
            let exists = locate::statements(file.root())
                .into_iter()
                .filter(|n| locate::is_import(*n))
                .any(|n| normalize_ws(file.text(n)) == wanted);
            if exists {
                return Err(CodecraftError::InvalidTarget(format!(
                    "import already present: {wanted}"
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
