//! Minimal structural edits. Each edit replaces or inserts exactly one byte
//! range; every other byte of the file is preserved.

use tree_sitter::Node;

use super::fallback;
use crate::domain::error::{CodecraftError, Result};
use crate::domain::result::Confidence;
use crate::domain::spec::{TechnicalSpec, Value};
use crate::python::literal::{render_replacing, render_string_like, split_string};
use crate::python::locate::{definition_name, definition_of, is_import, statements, Located, Target};
use crate::python::{dedent, literal_value, node_text, normalize_ws, splice, SourceFile};

/// The edited source and what it is allowed to have changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Edit {
    pub source: String,
    /// Outline keys the edit touches.
    pub touched: Vec<String>,
    pub confidence: Confidence,
}

impl Edit {
    fn full(source: String, key: &str) -> Self {
        Self {
            source,
            touched: vec![key.to_string()],
            confidence: Confidence::Full,
        }
    }
}

/// Compute the edit for `spec` at `located`. Nothing is written here.
pub fn compute_edit(
    file: &SourceFile,
    spec: &TechnicalSpec,
    located: &Located<'_>,
) -> Result<Edit> {
    let src = file.source();
    match located.target {
        Target::Literal { value } => replace_literal(src, spec, value, &located.key),
        Target::ClassBody { class, body } => add_method(src, spec, class, body, &located.key),
        Target::Bases { class } => replace_bases(src, spec, class, &located.key),
        Target::Module { slot } => {
            let stmt = import_statement(spec)?;
            let out = if slot.after_node {
                splice(src, slot.offset, slot.offset, &format!("\n{stmt}"))
            } else {
                splice(src, 0, 0, &format!("{stmt}\n"))
            };
            Ok(Edit::full(out, &located.key))
        }
        Target::Docstring { string } => replace_docstring(src, spec, string, &located.key),
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => (*i as f64) == *f,
        _ => a == b,
    }
}

fn check_not_stale(spec: &TechnicalSpec, current: &Value) -> Result<()> {
    match spec.old_value() {
        Some(old) if !same_value(old, current) => Err(CodecraftError::InvalidTarget(format!(
            "stale proposal: {} is {current} in source, expected {old}",
            spec.symbol_path()
        ))),
        _ => Ok(()),
    }
}

fn replace_literal(src: &str, spec: &TechnicalSpec, node: Node<'_>, key: &str) -> Result<Edit> {
    let current = literal_value(src, node).ok_or_else(|| {
        CodecraftError::InvalidTarget(format!(
            "{} is not assigned a literal ({})",
            spec.symbol_path(),
            normalize_ws(node_text(src, node))
        ))
    })?;
    check_not_stale(spec, &current)?;
    if !current.accepts(spec.new_value()) {
        return Err(CodecraftError::TypeMismatch {
            expected: current.data_type().to_string(),
            found: spec.new_value().data_type().to_string(),
        });
    }
    // An int proposed for a float slot keeps the float type in source.
    let new_value = match (&current, spec.new_value()) {
        (Value::Float(_), Value::Int(i)) => Value::Float(*i as f64),
        (_, v) => v.clone(),
    };
    let rendered = render_replacing(node_text(src, node), &new_value);
    Ok(Edit::full(
        splice(src, node.start_byte(), node.end_byte(), &rendered),
        key,
    ))
}

fn code_of(spec: &TechnicalSpec) -> Result<&str> {
    match spec.new_value() {
        Value::Code(code) | Value::Str(code) => Ok(code.as_str()),
        other => Err(CodecraftError::InvalidSpec(format!(
            "{} needs source code, got {other}",
            spec.change_type()
        ))),
    }
}

/// Leading whitespace of the line `node` starts on, if the node is the first
/// thing on that line.
fn line_indent<'s>(src: &'s str, node: Node<'_>) -> Option<&'s str> {
    let start = node.start_byte();
    let line_start = src[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let indent = &src[line_start..start];
    indent.chars().all(|c| c == ' ' || c == '\t').then_some(indent)
}

fn add_method(
    src: &str,
    spec: &TechnicalSpec,
    class: Node<'_>,
    body: Node<'_>,
    key: &str,
) -> Result<Edit> {
    let name = spec.attribute_name().unwrap_or_default();
    let method = dedent(code_of(spec)?.trim_matches('\n'));

    let snippet = SourceFile::parse(method.as_str())?;
    if snippet.syntax_error().is_some() {
        return Err(CodecraftError::InvalidSpec(format!(
            "method source for {name} does not parse"
        )));
    }
    let defined = match statements(snippet.root()).as_slice() {
        [one] => {
            let def = definition_of(*one);
            (def.kind() == "function_definition")
                .then(|| definition_name(snippet.source(), def))
                .flatten()
        }
        _ => None,
    };
    if defined != Some(name) {
        return Err(CodecraftError::InvalidSpec(format!(
            "method source must define exactly one function named {name}"
        )));
    }

    let indent = statements(body)
        .first()
        .and_then(|first| line_indent(src, *first))
        .filter(|i| !i.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}    ", line_indent(src, class).unwrap_or_default()));
    let indented = method
        .lines()
        .map(|l| {
            if l.trim().is_empty() {
                String::new()
            } else {
                format!("{indent}{l}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let at = body.end_byte();
    Ok(Edit::full(splice(src, at, at, &format!("\n\n{indented}")), key))
}

fn replace_bases(src: &str, spec: &TechnicalSpec, class: Node<'_>, key: &str) -> Result<Edit> {
    let raw = code_of(spec)?.trim();
    let inner = raw
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .unwrap_or(raw)
        .trim();
    let replacement = if inner.is_empty() {
        String::new()
    } else {
        format!("({inner})")
    };
    let out = match class.child_by_field_name("superclasses") {
        Some(bases) => splice(src, bases.start_byte(), bases.end_byte(), &replacement),
        None => {
            let name = class.child_by_field_name("name").ok_or_else(|| {
                CodecraftError::InvalidTarget("class definition without a name".to_string())
            })?;
            splice(src, name.end_byte(), name.end_byte(), &replacement)
        }
    };
    Ok(Edit::full(out, key))
}

fn import_statement(spec: &TechnicalSpec) -> Result<String> {
    let stmt = dedent(code_of(spec)?.trim_matches('\n')).trim_end().to_string();
    let snippet = SourceFile::parse(stmt.as_str())?;
    let ok = snippet.syntax_error().is_none()
        && matches!(statements(snippet.root()).as_slice(), [one] if is_import(*one));
    if !ok {
        return Err(CodecraftError::InvalidSpec(format!(
            "not a single import statement: {stmt}"
        )));
    }
    Ok(stmt)
}

fn replace_docstring(src: &str, spec: &TechnicalSpec, string: Node<'_>, key: &str) -> Result<Edit> {
    let Value::Str(new_text) = spec.new_value() else {
        return Err(CodecraftError::InvalidSpec(
            "docstring updates need a string value".to_string(),
        ));
    };
    let existing = node_text(src, string);
    let parts = split_string(existing).ok_or_else(|| {
        CodecraftError::InvalidTarget(format!("{} is not a simple string literal", spec.symbol_path()))
    })?;
    let current = literal_value(src, string).ok_or_else(|| {
        CodecraftError::InvalidTarget(format!("{} cannot be decoded", spec.symbol_path()))
    })?;
    check_not_stale(spec, &current)?;

    if parts.has_semantic_prefix() {
        let Value::Str(current_text) = &current else {
            return Err(CodecraftError::InvalidTarget(spec.symbol_path()));
        };
        let replacement = fallback::whitespace_only_rewrite(&parts, current_text, new_text)
            .ok_or_else(|| {
                CodecraftError::InvalidTarget(format!(
                    "{} uses a {:?}-prefixed literal; only whitespace changes can be applied",
                    spec.symbol_path(),
                    parts.prefix
                ))
            })?;
        return Ok(Edit {
            source: splice(src, string.start_byte(), string.end_byte(), &replacement),
            touched: vec![key.to_string()],
            confidence: Confidence::Reduced,
        });
    }

    let rendered = render_string_like(&parts, new_text);
    Ok(Edit::full(
        splice(src, string.start_byte(), string.end_byte(), &rendered),
        key,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::spec::{ChangeType, DataType, TechnicalSpecFields};
    use crate::python::locate::locate;

    const SRC: &str = "\"\"\"Engine.\"\"\"\nimport os\n\n\nclass OracleEngine(Base):\n    threshold: float = 0.3\n    mode = 'fast'\n\n    def score(self, x):\n        return x * self.threshold\n";

    fn spec(
        change_type: ChangeType,
        class: Option<&str>,
        attr: Option<&str>,
        old: Option<Value>,
        new: Value,
    ) -> TechnicalSpec {
        TechnicalSpec::new(TechnicalSpecFields {
            proposal_id: "p1".into(),
            change_type,
            file_path: "oracle.py".into(),
            class_name: class.map(str::to_string),
            attribute_name: attr.map(str::to_string),
            old_value: old,
            data_type: new.data_type(),
            new_value: new,
            original_proposal: String::new(),
        })
        .unwrap()
    }

    fn edit(src: &str, spec: &TechnicalSpec) -> Result<Edit> {
        let file = SourceFile::parse(src).unwrap();
        let located = locate(&file, spec).unwrap();
        compute_edit(&file, spec, &located)
    }

    #[test]
    fn test_parameter_change_touches_only_the_literal() {
        let s = spec(
            ChangeType::ParameterChange,
            Some("OracleEngine"),
            Some("threshold"),
            Some(Value::Float(0.3)),
            Value::Float(0.65),
        );
        let e = edit(SRC, &s).unwrap();
        assert_eq!(e.source, SRC.replace("= 0.3", "= 0.65"));
        assert_eq!(e.touched, vec!["OracleEngine.threshold"]);
    }

    #[test]
    fn test_stale_old_value_is_refused() {
        let s = spec(
            ChangeType::ParameterChange,
            Some("OracleEngine"),
            Some("threshold"),
            Some(Value::Float(0.4)),
            Value::Float(0.65),
        );
        assert!(matches!(edit(SRC, &s), Err(CodecraftError::InvalidTarget(_))));
    }

    #[test]
    fn test_string_keeps_quote_style() {
        let s = spec(
            ChangeType::ParameterChange,
            Some("OracleEngine"),
            Some("mode"),
            Some(Value::Str("fast".into())),
            Value::Str("slow".into()),
        );
        assert!(edit(SRC, &s).unwrap().source.contains("mode = 'slow'"));
    }

    #[test]
    fn test_method_addition_is_indented_into_class() {
        let s = spec(
            ChangeType::MethodAddition,
            Some("OracleEngine"),
            Some("reset"),
            None,
            Value::Code("def reset(self):\n    self.threshold = 0.3".into()),
        );
        let e = edit(SRC, &s).unwrap();
        assert!(e
            .source
            .ends_with("return x * self.threshold\n\n    def reset(self):\n        self.threshold = 0.3\n"));
    }

    #[test]
    fn test_method_source_must_match_name() {
        let s = spec(
            ChangeType::MethodAddition,
            Some("OracleEngine"),
            Some("reset"),
            None,
            Value::Code("def other(self):\n    pass".into()),
        );
        assert!(matches!(edit(SRC, &s), Err(CodecraftError::InvalidSpec(_))));
    }

    #[test]
    fn test_import_goes_after_last_import() {
        let s = spec(
            ChangeType::ImportAddition,
            None,
            None,
            None,
            Value::Code("import json".into()),
        );
        let e = edit(SRC, &s).unwrap();
        assert!(e.source.contains("import os\nimport json\n"));
        assert_eq!(e.touched, vec!["import:import json"]);
    }

    #[test]
    fn test_bases_replaced() {
        let s = spec(
            ChangeType::ClassModification,
            Some("OracleEngine"),
            None,
            None,
            Value::Code("Base, Mixin".into()),
        );
        assert!(edit(SRC, &s)
            .unwrap()
            .source
            .contains("class OracleEngine(Base, Mixin):"));
    }

    #[test]
    fn test_docstring_rendering() {
        let s = spec(
            ChangeType::DocstringUpdate,
            None,
            None,
            Some(Value::Str("Engine.".into())),
            Value::Str("Oracle engine.".into()),
        );
        let e = edit(SRC, &s).unwrap();
        assert!(e.source.starts_with("\"\"\"Oracle engine.\"\"\"\n"));
        assert_eq!(e.confidence, Confidence::Full);
    }

    #[test]
    fn test_raw_docstring_uses_reduced_fallback_for_whitespace() {
        let src = "r\"\"\"Match \\d+ digits.\"\"\"\nX = 1\n";
        let ws = spec(
            ChangeType::DocstringUpdate,
            None,
            None,
            Some(Value::Str("Match \\d+ digits.".into())),
            Value::Str("Match \\d+  digits.\n".into()),
        );
        let e = edit(src, &ws).unwrap();
        assert_eq!(e.confidence, Confidence::Reduced);
        assert!(e.source.starts_with("r\"\"\"Match \\d+  digits.\n\"\"\""));

        let wording = spec(
            ChangeType::DocstringUpdate,
            None,
            None,
            Some(Value::Str("Match \\d+ digits.".into())),
            Value::Str("Match numbers.".into()),
        );
        assert!(matches!(edit(src, &wording), Err(CodecraftError::InvalidTarget(_))));
    }
}
