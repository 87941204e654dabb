//! Deterministic extraction rules, one per change kind.
//!
//! Rules run in a fixed order (method, import, base classes, docstring,
//! parameter) and the first match wins. Anything no rule matches is left to
//! the extraction provider.

use regex::{Captures, Regex};

use crate::domain::error::{CodecraftError, Result};
use crate::domain::spec::ChangeType;

/// Fields recovered from proposal text. Values stay raw until they are typed
/// against the current source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub change_type: Option<ChangeType>,
    pub file_path: Option<String>,
    pub class_name: Option<String>,
    /// Attribute, method or module name. May be dotted (`A.b`) when the text
    /// does not say whether `A` is a class or a dict.
    pub attribute_name: Option<String>,
    /// Docstring owner as written (`module`, `Class`, `Class.method`, `func`).
    pub doc_target: Option<String>,
    pub old_raw: Option<String>,
    pub new_raw: Option<String>,
}

impl Extraction {
    /// Enough to build a spec once the target is resolved.
    pub fn is_actionable(&self) -> bool {
        self.change_type.is_some() && self.new_raw.is_some()
    }

    /// Fill fields missing in `self` from `other`.
    pub fn merge_missing(&mut self, other: Extraction) {
        fn fill<T>(slot: &mut Option<T>, v: Option<T>) {
            if slot.is_none() {
                *slot = v;
            }
        }
        fill(&mut self.change_type, other.change_type);
        fill(&mut self.file_path, other.file_path);
        fill(&mut self.class_name, other.class_name);
        fill(&mut self.attribute_name, other.attribute_name);
        fill(&mut self.doc_target, other.doc_target);
        fill(&mut self.old_raw, other.old_raw);
        fill(&mut self.new_raw, other.new_raw);
    }
}

pub struct RuleSet {
    file: Regex,
    method: Regex,
    import: Regex,
    bases: Regex,
    docstring: Regex,
    parameter: Regex,
    constant: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| CodecraftError::Config(format!("extraction rule: {e}")))
}

fn group(caps: &Captures<'_>, name: &str) -> Option<String> {
    caps.name(name)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

impl RuleSet {
    pub fn new() -> Result<Self> {
        Ok(Self {
            file: compile(
                r"(?i)\s+(?:in|of|to)\s+(?:the\s+)?(?:file\s+|module\s+)?`?(?P<file>[\w./-]+\.py)`?",
            )?,
            method: compile(
                r"(?is)^\s*add\s+(?:an?\s+|the\s+)?(?:new\s+)?method\s+`?(?P<name>[A-Za-z_]\w*)`?(?:\(\))?\s+(?:to|in)\s+(?:the\s+)?(?:class\s+)?`?(?P<class>[A-Za-z_]\w*)`?(?:\s+class)?(?:\s+(?:in|of)\s+(?:file\s+)?`?(?P<file>[\w./-]+\.py)`?)?\s*:\s*(?P<src>.+)$",
            )?,
            import: compile(
                r"(?i)^\s*add\s+(?:an?\s+)?import(?:\s+statement)?\s*:?\s+`?(?P<stmt>.+?)`?\s*\.?\s*$",
            )?,
            bases: compile(
                r"(?i)^\s*(?:change|set|update|replace)\s+(?:the\s+)?base\s+class(?:es)?\s+(?:of|for)\s+(?:the\s+)?(?:class\s+)?`?(?P<class>[A-Za-z_]\w*)`?\s+to\s+`?(?P<bases>.+?)`?\s*\.?\s*$",
            )?,
            docstring: compile(
                r#"(?is)^\s*(?:update|change|set|replace|rewrite)\s+(?:the\s+)?(?:(?P<module>module)\s+docstring|docstring\s+(?:of|for)\s+(?:the\s+)?(?:(?:class|method|function)\s+)?`?(?P<target>[A-Za-z_][\w.]*)`?)\s+to\s*:?\s*(?:"""(?P<tq>.*)"""|"(?P<dq>.*)"|'(?P<sq>.*)')\s*\.?\s*$"#,
            )?,
            parameter: compile(
                r#"(?i)^\s*(?:please\s+)?(?:update|change|set|increase|decrease|raise|lower|adjust|modify|tune)\s+(?:the\s+)?(?:value\s+of\s+)?(?:(?:parameter|attribute|setting|config|constant|field)\s+)?`?(?P<target>[A-Za-z_][\w.]*(?:\[\s*['"]?[\w-]+['"]?\s*\])?)`?\s+(?:from\s+`?(?P<old>.+?)`?\s+)?to\s+`?(?P<new>.+?)`?(?:\s+(?:in|on|for|of)\s+(?:the\s+)?(?:class\s+)?`?(?P<class>[A-Za-z_]\w*)`?(?:\s+class)?)?\s*\.?\s*$"#,
            )?,
            constant: compile(r"^[A-Z][A-Z0-9_]*$")?,
        })
    }

    /// Run the rules over `text`; `None` when no rule decides it.
    pub fn extract(&self, text: &str) -> Option<Extraction> {
        if let Some(caps) = self.method.captures(text) {
            return Some(Extraction {
                change_type: Some(ChangeType::MethodAddition),
                file_path: group(&caps, "file"),
                class_name: group(&caps, "class"),
                attribute_name: group(&caps, "name"),
                new_raw: caps
                    .name("src")
                    .map(|m| strip_fence(m.as_str()))
                    .filter(|s| !s.trim().is_empty()),
                ..Extraction::default()
            });
        }

        let (text, file_path) = self.split_file(text);
        let text = text.trim();

        if let Some(caps) = self.import.captures(text) {
            let stmt = group(&caps, "stmt")?;
            let stmt = if stmt.starts_with("import ") || stmt.starts_with("from ") {
                stmt
            } else {
                format!("import {stmt}")
            };
            return Some(Extraction {
                change_type: Some(ChangeType::ImportAddition),
                file_path,
                new_raw: Some(stmt),
                ..Extraction::default()
            });
        }

        if let Some(caps) = self.bases.captures(text) {
            return Some(Extraction {
                change_type: Some(ChangeType::ClassModification),
                file_path,
                class_name: group(&caps, "class"),
                new_raw: group(&caps, "bases"),
                ..Extraction::default()
            });
        }

        if let Some(caps) = self.docstring.captures(text) {
            let doc = ["tq", "dq", "sq"]
                .into_iter()
                .find_map(|g| caps.name(g).map(|m| m.as_str().to_string()))?;
            let target = if caps.name("module").is_some() {
                "module".to_string()
            } else {
                group(&caps, "target")?
            };
            return Some(Extraction {
                change_type: Some(ChangeType::DocstringUpdate),
                file_path,
                doc_target: Some(target),
                new_raw: Some(doc),
                ..Extraction::default()
            });
        }

        if let Some(caps) = self.parameter.captures(text) {
            let raw_target = group(&caps, "target")?;
            let class_name = group(&caps, "class");
            let (target, subscripted) = normalize_target(&raw_target);
            let change_type = self.classify(&target, class_name.is_some(), subscripted);
            return Some(Extraction {
                change_type: Some(change_type),
                file_path,
                class_name,
                attribute_name: Some(target),
                old_raw: group(&caps, "old"),
                new_raw: group(&caps, "new"),
                ..Extraction::default()
            });
        }
        None
    }

    /// Change kind of a value update: class members are parameters; dict
    /// entries and upper-case module names are configuration.
    pub fn classify(&self, target: &str, has_class: bool, subscripted: bool) -> ChangeType {
        if has_class {
            ChangeType::ParameterChange
        } else if subscripted || self.constant.is_match(target) {
            ChangeType::ConfigUpdate
        } else {
            ChangeType::ParameterChange
        }
    }

    /// Cut the first `in <file.py>` mention out of `text`.
    fn split_file(&self, text: &str) -> (String, Option<String>) {
        match self.file.captures(text) {
            Some(caps) => {
                let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
                let file = group(&caps, "file");
                let mut rest = String::with_capacity(text.len());
                rest.push_str(&text[..whole.start]);
                rest.push_str(&text[whole.end..]);
                (rest, file)
            }
            None => (text.to_string(), None),
        }
    }
}

/// `CONFIG['key']` → (`CONFIG.key`, true); `A.b` → (`A.b`, false).
pub(crate) fn normalize_target(raw: &str) -> (String, bool) {
    match raw.split_once('[') {
        Some((name, rest)) => {
            let key = rest
                .trim_end_matches(']')
                .trim()
                .trim_matches(|c| c == '\'' || c == '"');
            (format!("{}.{key}", name.trim()), true)
        }
        None => (raw.to_string(), false),
    }
}

/// Drop a surrounding Markdown code fence.
fn strip_fence(src: &str) -> String {
    let trimmed = src.trim_matches('\n');
    let Some(rest) = trimmed.trim_start().strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or_default();
    body.trim_end().trim_end_matches("```").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> RuleSet {
        RuleSet::new().unwrap()
    }

    #[test]
    fn test_parameter_change_with_class() {
        let e = rules()
            .extract("update threshold from 0.3 to 0.65 in OracleEngine")
            .unwrap();
        assert_eq!(e.change_type, Some(ChangeType::ParameterChange));
        assert_eq!(e.class_name.as_deref(), Some("OracleEngine"));
        assert_eq!(e.attribute_name.as_deref(), Some("threshold"));
        assert_eq!(e.old_raw.as_deref(), Some("0.3"));
        assert_eq!(e.new_raw.as_deref(), Some("0.65"));
    }

    #[test]
    fn test_file_mention_is_extracted() {
        let e = rules()
            .extract("Increase threshold to 0.65 in OracleEngine in src/oracle.py.")
            .unwrap();
        assert_eq!(e.file_path.as_deref(), Some("src/oracle.py"));
        assert_eq!(e.class_name.as_deref(), Some("OracleEngine"));
        assert_eq!(e.new_raw.as_deref(), Some("0.65"));
    }

    #[test]
    fn test_constants_and_dict_keys_are_config() {
        let e = rules().extract("set MAX_RETRIES to 5").unwrap();
        assert_eq!(e.change_type, Some(ChangeType::ConfigUpdate));

        let e = rules().extract("change CONFIG['max_retries'] from 3 to 5").unwrap();
        assert_eq!(e.change_type, Some(ChangeType::ConfigUpdate));
        assert_eq!(e.attribute_name.as_deref(), Some("CONFIG.max_retries"));
    }

    #[test]
    fn test_import_rule() {
        let e = rules().extract("add import json to src/oracle.py").unwrap();
        assert_eq!(e.change_type, Some(ChangeType::ImportAddition));
        assert_eq!(e.new_raw.as_deref(), Some("import json"));
        assert_eq!(e.file_path.as_deref(), Some("src/oracle.py"));

        let e = rules().extract("add import from typing import List").unwrap();
        assert_eq!(e.new_raw.as_deref(), Some("from typing import List"));
    }

    #[test]
    fn test_method_rule_keeps_source() {
        let e = rules()
            .extract("add method reset to OracleEngine:\n```python\ndef reset(self):\n    self.threshold = 0.3\n```")
            .unwrap();
        assert_eq!(e.change_type, Some(ChangeType::MethodAddition));
        assert_eq!(e.attribute_name.as_deref(), Some("reset"));
        assert_eq!(
            e.new_raw.as_deref(),
            Some("def reset(self):\n    self.threshold = 0.3")
        );
    }

    #[test]
    fn test_bases_and_docstring_rules() {
        let e = rules()
            .extract("change base class of OracleEngine to BaseEngine, Mixin")
            .unwrap();
        assert_eq!(e.change_type, Some(ChangeType::ClassModification));
        assert_eq!(e.new_raw.as_deref(), Some("BaseEngine, Mixin"));

        let e = rules()
            .extract(r#"update docstring of OracleEngine.score to "Score a signal.""#)
            .unwrap();
        assert_eq!(e.change_type, Some(ChangeType::DocstringUpdate));
        assert_eq!(e.doc_target.as_deref(), Some("OracleEngine.score"));
        assert_eq!(e.new_raw.as_deref(), Some("Score a signal."));
    }

    #[test]
    fn test_vague_text_is_not_matched() {
        assert!(rules().extract("make the oracle less noisy").is_none());
        assert!(rules().extract("increase threshold by 10%").is_none());
    }
}
