//! Proposal parsing: free text or structured JSON in, [`TechnicalSpec`] out.
//!
//! Deterministic rules run first. Whatever they cannot decide goes to the
//! configured [`ExtractionProvider`]; LLM answers are cached by input hash.
//! The extracted target is then resolved against the tree: the file through a
//! [`SymbolIndex`], the current value from the file itself.

pub mod cache;
pub mod proposal;
pub mod provider;
pub mod rules;

use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use tree_sitter::Node;

pub use cache::ParseCache;
pub use proposal::{Proposal, StructuredProposal};
pub use provider::{build_prompt, ExtractionProvider, HttpLlmBackend, LlmBackend};
pub use rules::{Extraction, RuleSet};

use crate::config::CodecraftConfig;
use crate::domain::error::{CodecraftError, Result};
use crate::domain::spec::{
    validate_relative_path, ChangeType, TechnicalSpec, TechnicalSpecFields, Value,
};
use crate::python::locate::{locate, Target};
use crate::python::{dedent, literal_value, node_text, normalize_ws, SourceFile};
use crate::symbols::{from_slash, SymbolIndex, SymbolKind};

/// Turns a proposal into a validated spec.
#[async_trait]
pub trait SpecParser: Send + Sync {
    async fn parse(&self, proposal: &Proposal) -> Result<TechnicalSpec>;
}

fn ambiguous(msg: impl Into<String>) -> CodecraftError {
    CodecraftError::AmbiguousProposal(msg.into())
}

fn invalid(msg: impl Into<String>) -> CodecraftError {
    CodecraftError::InvalidTarget(msg.into())
}

/// A target after resolution against the symbol index.
#[derive(Debug, Clone, PartialEq)]
struct Resolved {
    change_type: ChangeType,
    file: String,
    class_name: Option<String>,
    attribute_name: Option<String>,
}

pub struct ProposalParser {
    repo_root: PathBuf,
    source_root: PathBuf,
    rules: RuleSet,
    provider: ExtractionProvider,
    cache: ParseCache,
}

impl ProposalParser {
    pub fn new(
        repo_root: &Path,
        source_root: &Path,
        provider: ExtractionProvider,
        cache: ParseCache,
    ) -> Result<Self> {
        Ok(Self {
            repo_root: repo_root.canonicalize()?,
            source_root: source_root.canonicalize()?,
            rules: RuleSet::new()?,
            provider,
            cache,
        })
    }

    pub fn from_config(config: &CodecraftConfig) -> Result<Self> {
        Self::new(
            &config.repo_root,
            &config.source_path(),
            ExtractionProvider::from_config(config.llm.as_ref())?,
            ParseCache::new(&config.state_path()),
        )
    }

    pub fn provider(&self) -> &ExtractionProvider {
        &self.provider
    }

    async fn extract(&self, proposal: &Proposal) -> Result<Extraction> {
        let mut extraction = match proposal {
            Proposal::Text(text) => self.rules.extract(text).unwrap_or_default(),
            Proposal::Structured(s) => {
                let mut explicit = self.from_structured(s)?;
                if let Some(found) = self.rules.extract(&s.description) {
                    explicit.merge_missing(found);
                }
                explicit
            }
        };
        if extraction.is_actionable() {
            return Ok(extraction);
        }

        let structured = match &self.provider {
            ExtractionProvider::Heuristic => {
                return Err(ambiguous(format!(
                    "no extraction rule matches {:?} and no extraction backend is configured",
                    preview(proposal.description())
                )));
            }
            ExtractionProvider::Llm(backend) => self.llm_extract(backend.as_ref(), proposal).await?,
        };
        extraction.merge_missing(self.from_structured(&structured)?);
        if !extraction.is_actionable() {
            return Err(ambiguous(
                "could not determine the change type and new value",
            ));
        }
        Ok(extraction)
    }

    async fn llm_extract(
        &self,
        backend: &dyn LlmBackend,
        proposal: &Proposal,
    ) -> Result<StructuredProposal> {
        let key = proposal.input_hash()?;
        if let Some(hit) = self.cache.get(&key) {
            debug!(key = %key, "parse cache hit");
            return Ok(hit);
        }
        let description = proposal.description();
        if description.trim().is_empty() {
            return Err(ambiguous("proposal has no description to extract from"));
        }

        let raw = backend
            .extract(&build_prompt(description))
            .await
            .map_err(|e| match e {
                CodecraftError::Llm(msg) => {
                    ambiguous(format!("extraction backend unavailable: {msg}"))
                }
                other => other,
            })?;
        let structured = provider::parse_backend_output(raw, description)?;
        if let Err(e) = self.cache.put(&key, &structured) {
            warn!(key = %key, error = %e, "failed to write parse cache entry");
        }
        Ok(structured)
    }

    fn from_structured(&self, s: &StructuredProposal) -> Result<Extraction> {
        let hinted = match s.change_type_hint.as_deref() {
            Some(hint) => Some(
                ChangeType::from_hint(hint)
                    .ok_or_else(|| ambiguous(format!("unknown change type {hint:?}")))?,
            ),
            None => None,
        };
        let (attribute_name, subscripted) = match s.attribute_name.as_deref().map(str::trim) {
            Some(a) if !a.is_empty() => {
                let (target, subscripted) = rules::normalize_target(a);
                (Some(target), subscripted)
            }
            _ => (None, false),
        };
        let new_raw = s.new_value.as_ref().and_then(Value::raw_from_json);
        let change_type = hinted.or_else(|| match (&attribute_name, &new_raw) {
            (Some(a), Some(_)) => Some(self.rules.classify(a, s.class_name.is_some(), subscripted)),
            _ => None,
        });
        Ok(Extraction {
            change_type,
            file_path: s.file_path.clone().filter(|f| !f.trim().is_empty()),
            class_name: s.class_name.clone().filter(|c| !c.trim().is_empty()),
            attribute_name,
            doc_target: None,
            old_raw: s.old_value.as_ref().and_then(Value::raw_from_json),
            new_raw,
        })
    }

    /// Lexical confinement first (no I/O), then the canonical path must lie
    /// under the source root.
    fn confine(&self, file: &str) -> Result<String> {
        validate_relative_path(file)?;
        let rel = normalize_rel(file);
        let canonical = from_slash(&self.repo_root, &rel)
            .canonicalize()
            .map_err(|_| invalid(format!("file does not exist: {rel}")))?;
        if !canonical.starts_with(&self.source_root) || !canonical.is_file() {
            return Err(invalid(format!("{rel} is not a file under the allowed source root")));
        }
        Ok(rel)
    }

    fn index_for(&self, file: Option<&str>) -> Result<SymbolIndex> {
        match file {
            Some(rel) => {
                let mut index = SymbolIndex::default();
                index.add_module(rel, fs::read_to_string(from_slash(&self.repo_root, rel))?);
                Ok(index)
            }
            None => Ok(SymbolIndex::build(&self.repo_root, &self.source_root)),
        }
    }

    fn resolve(&self, index: &SymbolIndex, e: &Extraction, file: Option<&str>) -> Result<Resolved> {
        let change_type = e
            .change_type
            .ok_or_else(|| ambiguous("no change type"))?;
        let class = e.class_name.as_deref();
        let attr = e.attribute_name.as_deref();
        match change_type {
            ChangeType::ParameterChange | ChangeType::ConfigUpdate => {
                let attr = attr.ok_or_else(|| ambiguous("no attribute or setting named"))?;
                resolve_value(index, change_type, class, attr)
            }
            ChangeType::MethodAddition => {
                let class = class.ok_or_else(|| ambiguous("method addition needs a class"))?;
                let name = attr.ok_or_else(|| ambiguous("method addition needs a method name"))?;
                let file = class_file(index, class)?;
                let exists = index.symbols().iter().any(|s| {
                    s.kind == SymbolKind::Method
                        && s.file == file
                        && s.class.as_deref() == Some(class)
                        && s.name == name
                });
                if exists {
                    return Err(invalid(format!("{class} already defines method {name}")));
                }
                Ok(Resolved {
                    change_type,
                    file,
                    class_name: Some(class.to_string()),
                    attribute_name: Some(name.to_string()),
                })
            }
            ChangeType::ClassModification => {
                let class = class.ok_or_else(|| ambiguous("base class change needs a class"))?;
                Ok(Resolved {
                    change_type,
                    file: class_file(index, class)?,
                    class_name: Some(class.to_string()),
                    attribute_name: None,
                })
            }
            ChangeType::ImportAddition => {
                let file = file.ok_or_else(|| ambiguous("import addition needs a file path"))?;
                Ok(Resolved {
                    change_type,
                    file: file.to_string(),
                    class_name: None,
                    attribute_name: None,
                })
            }
            ChangeType::DocstringUpdate => resolve_docstring(index, e, file),
        }
    }

    fn build_spec(
        &self,
        proposal_id: String,
        proposal: &Proposal,
        resolved: Resolved,
        e: &Extraction,
        source: &SourceFile,
    ) -> Result<TechnicalSpec> {
        let new_raw = e.new_raw.as_deref().unwrap_or_default();
        let provisional_value = match resolved.change_type {
            ChangeType::MethodAddition => Value::Code(dedent(new_raw.trim_matches('\n'))),
            ChangeType::ImportAddition => Value::Code(new_raw.trim().to_string()),
            ChangeType::ClassModification => Value::Code(bare_bases(new_raw)),
            ChangeType::DocstringUpdate => Value::Str(new_raw.to_string()),
            ChangeType::ParameterChange | ChangeType::ConfigUpdate => Value::infer(new_raw),
        };
        let mut fields = TechnicalSpecFields {
            proposal_id,
            change_type: resolved.change_type,
            file_path: resolved.file,
            class_name: resolved.class_name,
            attribute_name: resolved.attribute_name,
            old_value: None,
            data_type: provisional_value.data_type(),
            new_value: provisional_value,
            original_proposal: proposal.description().to_string(),
        };

        // Locate with the same lookup the modifier uses, then read the
        // current value from there.
        let provisional = TechnicalSpec::new(fields.clone())?;
        let located = locate(source, &provisional).map_err(|v| invalid(v.to_string()))?;
        let src = source.source();
        match located.target {
            Target::Literal { value } => {
                let current = literal_value(src, value).ok_or_else(|| {
                    invalid(format!(
                        "{} is not assigned a literal ({})",
                        provisional.symbol_path(),
                        normalize_ws(node_text(src, value))
                    ))
                })?;
                if let Some(old_raw) = e.old_raw.as_deref() {
                    let agrees = Value::parse_as(old_raw, current.data_type())
                        .map(|old| old == current)
                        .unwrap_or(false);
                    if !agrees {
                        return Err(invalid(format!(
                            "stale proposal: {} is {current} in source, not {}",
                            provisional.symbol_path(),
                            old_raw.trim()
                        )));
                    }
                }
                let new_value = Value::parse_as(new_raw, current.data_type())?;
                fields.data_type = new_value.data_type();
                fields.new_value = new_value;
                fields.old_value = Some(current);
            }
            Target::Bases { class } => {
                fields.old_value = Some(Value::Code(current_bases(src, class)));
            }
            Target::Docstring { string } => {
                let current = literal_value(src, string).ok_or_else(|| {
                    invalid(format!("{} is not a plain string", provisional.symbol_path()))
                })?;
                fields.old_value = Some(current);
            }
            Target::ClassBody { .. } | Target::Module { .. } => {}
        }
        TechnicalSpec::new(fields)
    }
}

#[async_trait]
impl SpecParser for ProposalParser {
    async fn parse(&self, proposal: &Proposal) -> Result<TechnicalSpec> {
        let proposal_id = proposal.resolve_id()?;
        let extraction = self.extract(proposal).await?;

        let file = extraction
            .file_path
            .as_deref()
            .map(|f| self.confine(f))
            .transpose()?;
        let index = self.index_for(file.as_deref())?;
        let resolved = self.resolve(&index, &extraction, file.as_deref())?;
        if file.as_deref() != Some(resolved.file.as_str()) {
            self.confine(&resolved.file)?;
        }

        let source = SourceFile::parse(fs::read_to_string(from_slash(
            &self.repo_root,
            &resolved.file,
        ))?)?;
        let spec = self.build_spec(proposal_id, proposal, resolved, &extraction, &source)?;
        debug!(
            proposal_id = %spec.proposal_id(),
            change_type = %spec.change_type(),
            target = %spec.parameter_key(),
            "proposal parsed"
        );
        Ok(spec)
    }
}

fn resolve_value(
    index: &SymbolIndex,
    change_type: ChangeType,
    class: Option<&str>,
    attr: &str,
) -> Result<Resolved> {
    if let Some(class) = class {
        return class_attribute(index, class, attr);
    }
    if let Some((head, key)) = attr.split_once('.') {
        if !index.files_defining_class(head).is_empty() {
            return class_attribute(index, head, key);
        }
        let files = index.module_values(attr, None).into_iter().map(|s| s.file.as_str());
        return Ok(Resolved {
            change_type: ChangeType::ConfigUpdate,
            file: single_file(files, attr)?,
            class_name: None,
            attribute_name: Some(attr.to_string()),
        });
    }

    let module_files: Vec<&str> = index
        .module_values(attr, None)
        .into_iter()
        .filter(|s| s.kind == SymbolKind::ModuleAssignment)
        .map(|s| s.file.as_str())
        .collect();
    if !module_files.is_empty() {
        return Ok(Resolved {
            change_type,
            file: single_file(module_files.into_iter(), attr)?,
            class_name: None,
            attribute_name: Some(attr.to_string()),
        });
    }

    let mut owners: Vec<(&str, &str)> = index
        .class_attributes(attr, None, None)
        .into_iter()
        .filter_map(|s| s.class.as_deref().map(|c| (s.file.as_str(), c)))
        .collect();
    owners.sort_unstable();
    owners.dedup();
    match owners.as_slice() {
        [] => Err(invalid(format!("no attribute or setting named {attr}"))),
        [(file, class)] => Ok(Resolved {
            change_type: ChangeType::ParameterChange,
            file: file.to_string(),
            class_name: Some(class.to_string()),
            attribute_name: Some(attr.to_string()),
        }),
        many => Err(ambiguous(format!(
            "{attr} is defined in several classes: {}; name the class",
            many.iter()
                .map(|(f, c)| format!("{c} ({f})"))
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

fn class_attribute(index: &SymbolIndex, class: &str, attr: &str) -> Result<Resolved> {
    let file = class_file(index, class)?;
    if index.class_attributes(attr, Some(class), Some(&file)).is_empty() {
        return Err(invalid(format!("{class} has no attribute {attr}")));
    }
    Ok(Resolved {
        change_type: ChangeType::ParameterChange,
        file,
        class_name: Some(class.to_string()),
        attribute_name: Some(attr.to_string()),
    })
}

fn class_file(index: &SymbolIndex, class: &str) -> Result<String> {
    match index.files_defining_class(class).as_slice() {
        [] => Err(invalid(format!("class {class} not found"))),
        [file] => Ok(file.to_string()),
        many => Err(ambiguous(format!(
            "class {class} is defined in several files: {}",
            many.join(", ")
        ))),
    }
}

fn single_file<'a>(files: impl Iterator<Item = &'a str>, what: &str) -> Result<String> {
    let mut files: Vec<&str> = files.collect();
    files.sort_unstable();
    files.dedup();
    match files.as_slice() {
        [] => Err(invalid(format!("no attribute or setting named {what}"))),
        [file] => Ok(file.to_string()),
        many => Err(ambiguous(format!(
            "{what} is defined in several files: {}",
            many.join(", ")
        ))),
    }
}

fn resolve_docstring(index: &SymbolIndex, e: &Extraction, file: Option<&str>) -> Result<Resolved> {
    let target = match (&e.doc_target, &e.class_name, &e.attribute_name) {
        (Some(t), _, _) => t.clone(),
        (None, Some(c), Some(m)) => format!("{c}.{m}"),
        (None, Some(c), None) => c.clone(),
        (None, None, Some(f)) => f.clone(),
        (None, None, None) => "module".to_string(),
    };
    let resolved = |file: String, class: Option<&str>, attr: Option<&str>| Resolved {
        change_type: ChangeType::DocstringUpdate,
        file,
        class_name: class.map(str::to_string),
        attribute_name: attr.map(str::to_string),
    };

    if target == "module" {
        let file = file.ok_or_else(|| ambiguous("module docstring update needs a file path"))?;
        return Ok(resolved(file.to_string(), None, None));
    }
    if let Some((class, method)) = target.split_once('.') {
        return Ok(resolved(class_file(index, class)?, Some(class), Some(method)));
    }
    if !index.files_defining_class(&target).is_empty() {
        return Ok(resolved(class_file(index, &target)?, Some(&target), None));
    }
    let file = single_file(index.files_defining_function(&target).into_iter(), &target)?;
    Ok(resolved(file, None, Some(&target)))
}

/// `(A, B)` / `A, B` → `A, B`.
fn bare_bases(raw: &str) -> String {
    let raw = raw.trim();
    let inner = raw
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .unwrap_or(raw);
    normalize_ws(inner)
}

fn current_bases(src: &str, class: Node<'_>) -> String {
    class
        .child_by_field_name("superclasses")
        .map(|b| bare_bases(node_text(src, b)))
        .unwrap_or_default()
}

/// `./src//a.py` → `src/a.py`.
fn normalize_rel(file: &str) -> String {
    Path::new(file.trim())
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn preview(text: &str) -> String {
    let flat = normalize_ws(text);
    match flat.char_indices().nth(80) {
        Some((at, _)) => format!("{}...", &flat[..at]),
        None => flat,
    }
}
