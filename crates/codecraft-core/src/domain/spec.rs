//! The immutable, validated description of one atomic change.

use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use super::digest;
use super::error::{CodecraftError, Result};

/// Kind of change a [`TechnicalSpec`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    ParameterChange,
    MethodAddition,
    ClassModification,
    ConfigUpdate,
    ImportAddition,
    DocstringUpdate,
}

impl ChangeType {
    pub const ALL: [ChangeType; 6] = [
        ChangeType::ParameterChange,
        ChangeType::MethodAddition,
        ChangeType::ClassModification,
        ChangeType::ConfigUpdate,
        ChangeType::ImportAddition,
        ChangeType::DocstringUpdate,
    ];

    /// Conventional-Commits type used in the commit header.
    pub fn commit_type(&self) -> &'static str {
        match self {
            ChangeType::ParameterChange | ChangeType::MethodAddition => "feat",
            ChangeType::ClassModification => "refactor",
            ChangeType::ConfigUpdate | ChangeType::ImportAddition => "chore",
            ChangeType::DocstringUpdate => "docs",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::ParameterChange => "ParameterChange",
            ChangeType::MethodAddition => "MethodAddition",
            ChangeType::ClassModification => "ClassModification",
            ChangeType::ConfigUpdate => "ConfigUpdate",
            ChangeType::ImportAddition => "ImportAddition",
            ChangeType::DocstringUpdate => "DocstringUpdate",
        }
    }

    /// Lenient lookup used for `change_type_hint` values and LLM output.
    pub fn from_hint(hint: &str) -> Option<Self> {
        let norm: String = hint
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|ct| ct.as_str().to_ascii_lowercase() == norm)
    }

    /// Whether this change adds a construct instead of replacing one.
    pub fn is_additive(&self) -> bool {
        matches!(self, ChangeType::MethodAddition | ChangeType::ImportAddition)
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type tag for [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    None,
    Bool,
    Int,
    Float,
    Str,
    Code,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::None => "none",
            DataType::Bool => "bool",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Str => "str",
            DataType::Code => "code",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed scalar (or code snippet) carried by a spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Code(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::None => DataType::None,
            Value::Bool(_) => DataType::Bool,
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
            Value::Str(_) => DataType::Str,
            Value::Code(_) => DataType::Code,
        }
    }

    /// Render as Python source. Floats always carry a decimal point so the
    /// literal keeps its type (`1.0`, not `1`).
    pub fn python_literal(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => quote_python_str(s, '"'),
            Value::Code(code) => code.clone(),
        }
    }

    /// Full text of `Code`/`Str` payloads; the Python literal otherwise.
    pub fn source_text(&self) -> String {
        match self {
            Value::Code(s) | Value::Str(s) => s.clone(),
            other => other.python_literal(),
        }
    }

    /// Parse `raw` as a value of type `target`.
    ///
    /// Integers widen to floats; every other mismatch is a
    /// [`CodecraftError::TypeMismatch`].
    pub fn parse_as(raw: &str, target: DataType) -> Result<Value> {
        let trimmed = raw.trim();
        let mismatch = || CodecraftError::TypeMismatch {
            expected: target.to_string(),
            found: trimmed.to_string(),
        };
        match target {
            DataType::Code => Ok(Value::Code(raw.trim_end().to_string())),
            DataType::Str => Ok(Value::Str(unquote(trimmed).to_string())),
            DataType::None => {
                // An unset (None) default accepts whatever the proposal carries.
                Ok(Value::infer(trimmed))
            }
            DataType::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            DataType::Int => parse_int(trimmed).map(Value::Int).ok_or_else(mismatch),
            DataType::Float => parse_int(trimmed)
                .map(|i| Value::Float(i as f64))
                .or_else(|| parse_float(trimmed).map(Value::Float))
                .ok_or_else(mismatch),
        }
    }

    /// Best-effort typing of a raw token when no target type is known.
    pub fn infer(raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed == "None" {
            return Value::None;
        }
        match trimmed {
            "True" | "true" => return Value::Bool(true),
            "False" | "false" => return Value::Bool(false),
            _ => {}
        }
        if let Some(i) = parse_int(trimmed) {
            return Value::Int(i);
        }
        if let Some(f) = parse_float(trimmed) {
            return Value::Float(f);
        }
        Value::Str(unquote(trimmed).to_string())
    }

    /// Convert a JSON scalar (structured proposals, LLM output) to the raw
    /// token form consumed by [`Value::parse_as`].
    pub fn raw_from_json(value: &serde_json::Value) -> Option<String> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(b.to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Whether `other` may replace `self` in source without changing the
    /// declared kind of the literal.
    pub fn accepts(&self, other: &Value) -> bool {
        match (self.data_type(), other.data_type()) {
            (DataType::None, _) | (_, DataType::None) => true,
            (DataType::Float, DataType::Int) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Code(code) => {
                let first = code.lines().next().unwrap_or_default().trim();
                if code.lines().count() > 1 {
                    write!(f, "{first} …")
                } else {
                    f.write_str(first)
                }
            }
            other => f.write_str(&other.python_literal()),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// Quote a string as a Python literal using `quote` as the delimiter.
pub fn quote_python_str(s: &str, quote: char) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn unquote(s: &str) -> &str {
    for q in ["\"\"\"", "'''", "\"", "'", "`"] {
        if s.len() >= 2 * q.len() && s.starts_with(q) && s.ends_with(q) {
            return &s[q.len()..s.len() - q.len()];
        }
    }
    s
}

pub(crate) fn parse_int(s: &str) -> Option<i64> {
    let cleaned: String = s.chars().filter(|c| *c != '_').collect();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.strip_prefix('+').unwrap_or(&cleaned)),
    };
    if digits.is_empty() {
        return None;
    }
    let lower = digits.to_ascii_lowercase();
    let magnitude = if let Some(hex) = lower.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(oct) = lower.strip_prefix("0o") {
        i64::from_str_radix(oct, 8).ok()?
    } else if let Some(bin) = lower.strip_prefix("0b") {
        i64::from_str_radix(bin, 2).ok()?
    } else if digits.chars().all(|c| c.is_ascii_digit()) {
        digits.parse::<i64>().ok()?
    } else {
        return None;
    };
    Some(if negative { -magnitude } else { magnitude })
}

pub(crate) fn parse_float(s: &str) -> Option<f64> {
    let cleaned: String = s.chars().filter(|c| *c != '_').collect();
    let body = cleaned.trim_start_matches(['-', '+']);
    if body.is_empty() || !body.chars().next().is_some_and(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    if !body
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+'))
    {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Raw field set a [`TechnicalSpec`] is built from (and serialized as).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalSpecFields {
    pub proposal_id: String,
    pub change_type: ChangeType,
    pub file_path: String,
    pub class_name: Option<String>,
    pub attribute_name: Option<String>,
    pub old_value: Option<Value>,
    pub new_value: Value,
    pub data_type: DataType,
    pub original_proposal: String,
}

/// Validated, immutable description of one atomic change.
///
/// The only way to obtain one is [`TechnicalSpec::new`] (deserialization goes
/// through the same validation). There are no setters: re-applying a change
/// requires a new instance with a new `proposal_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TechnicalSpecFields", into = "TechnicalSpecFields")]
pub struct TechnicalSpec {
    fields: TechnicalSpecFields,
    spec_digest: String,
}

impl TryFrom<TechnicalSpecFields> for TechnicalSpec {
    type Error = CodecraftError;

    fn try_from(fields: TechnicalSpecFields) -> Result<Self> {
        TechnicalSpec::new(fields)
    }
}

impl From<TechnicalSpec> for TechnicalSpecFields {
    fn from(spec: TechnicalSpec) -> Self {
        spec.fields
    }
}

impl TechnicalSpec {
    /// Validate `fields` and build the spec.
    pub fn new(fields: TechnicalSpecFields) -> Result<Self> {
        validate_proposal_id(&fields.proposal_id)?;
        validate_relative_path(&fields.file_path)?;
        validate_shape(&fields)?;

        if fields.new_value.data_type() != fields.data_type {
            return Err(CodecraftError::TypeMismatch {
                expected: fields.data_type.to_string(),
                found: fields.new_value.data_type().to_string(),
            });
        }
        if let Some(old) = &fields.old_value {
            if !old.accepts(&fields.new_value) {
                return Err(CodecraftError::TypeMismatch {
                    expected: old.data_type().to_string(),
                    found: fields.new_value.data_type().to_string(),
                });
            }
            if *old == fields.new_value {
                return Err(CodecraftError::InvalidSpec(format!(
                    "old and new value are identical ({old})"
                )));
            }
        }

        let spec_digest = digest::compute_digest(&serde_json::to_value(&fields)?)?;
        Ok(Self {
            fields,
            spec_digest,
        })
    }

    pub fn proposal_id(&self) -> &str {
        &self.fields.proposal_id
    }

    pub fn change_type(&self) -> ChangeType {
        self.fields.change_type
    }

    /// Repository-relative path of the target file.
    pub fn file_path(&self) -> &Path {
        Path::new(&self.fields.file_path)
    }

    pub fn class_name(&self) -> Option<&str> {
        self.fields.class_name.as_deref()
    }

    pub fn attribute_name(&self) -> Option<&str> {
        self.fields.attribute_name.as_deref()
    }

    pub fn old_value(&self) -> Option<&Value> {
        self.fields.old_value.as_ref()
    }

    pub fn new_value(&self) -> &Value {
        &self.fields.new_value
    }

    pub fn data_type(&self) -> DataType {
        self.fields.data_type
    }

    pub fn original_proposal(&self) -> &str {
        &self.fields.original_proposal
    }

    /// SHA-256 over the canonical JSON of all fields.
    pub fn spec_digest(&self) -> &str {
        &self.spec_digest
    }

    /// Dotted symbol path of the target (`OracleEngine.threshold`,
    /// `CONFIG[threshold]`, `__doc__`, ...).
    pub fn symbol_path(&self) -> String {
        let class = self.class_name();
        let attr = self.attribute_name();
        match self.change_type() {
            ChangeType::ImportAddition => format!("import:{}", self.new_value()),
            ChangeType::ClassModification => {
                format!("{}.__bases__", class.unwrap_or_default())
            }
            ChangeType::DocstringUpdate => match (class, attr) {
                (Some(c), Some(a)) => format!("{c}.{a}.__doc__"),
                (Some(c), None) => format!("{c}.__doc__"),
                (None, Some(a)) => format!("{a}.__doc__"),
                (None, None) => "__doc__".to_string(),
            },
            ChangeType::ConfigUpdate => match attr.and_then(|a| a.split_once('.')) {
                Some((dict, key)) => format!("{dict}[{key}]"),
                None => attr.unwrap_or_default().to_string(),
            },
            ChangeType::ParameterChange | ChangeType::MethodAddition => match (class, attr) {
                (Some(c), Some(a)) => format!("{c}.{a}"),
                (None, Some(a)) => a.to_string(),
                (Some(c), None) => c.to_string(),
                (None, None) => String::new(),
            },
        }
    }

    /// Composite key used by the quarantine store (`file::symbol`).
    pub fn parameter_key(&self) -> String {
        format!("{}::{}", self.fields.file_path, self.symbol_path())
    }

    /// Short human description used in commit headers and logs.
    pub fn short_description(&self) -> String {
        let target = self.symbol_path();
        match self.change_type() {
            ChangeType::ParameterChange | ChangeType::ConfigUpdate => {
                format!("update {target}")
            }
            ChangeType::MethodAddition => format!("add method {target}"),
            ChangeType::ClassModification => format!(
                "change base classes of {}",
                self.class_name().unwrap_or_default()
            ),
            ChangeType::ImportAddition => format!("add {}", self.new_value()),
            ChangeType::DocstringUpdate => format!("update docstring of {target}"),
        }
    }

    /// A copy of the raw fields (e.g. to derive a spec with a new id).
    pub fn to_fields(&self) -> TechnicalSpecFields {
        self.fields.clone()
    }
}

fn validate_proposal_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CodecraftError::InvalidSpec(
            "proposal_id cannot be empty".to_string(),
        ));
    }
    if id.len() > 64
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CodecraftError::InvalidSpec(format!(
            "proposal_id must be 1-64 chars of [A-Za-z0-9_-]: {id:?}"
        )));
    }
    Ok(())
}

/// Lexical confinement: relative, no `..`, no root or prefix components.
pub(crate) fn validate_relative_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(CodecraftError::InvalidTarget(
            "file_path cannot be empty".to_string(),
        ));
    }
    let escapes = Path::new(path).components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(CodecraftError::InvalidTarget(format!(
            "file_path escapes the repository root: {path}"
        )));
    }
    Ok(())
}

fn validate_shape(fields: &TechnicalSpecFields) -> Result<()> {
    let missing = |what: &str| {
        Err(CodecraftError::InvalidSpec(format!(
            "{} requires {what}",
            fields.change_type
        )))
    };
    let code_or_str = matches!(fields.new_value, Value::Code(_));
    match fields.change_type {
        ChangeType::ParameterChange if fields.attribute_name.is_none() => {
            missing("attribute_name")
        }
        ChangeType::ConfigUpdate if fields.attribute_name.is_none() => missing("attribute_name"),
        ChangeType::ConfigUpdate if fields.class_name.is_some() => Err(CodecraftError::InvalidSpec(
            "ConfigUpdate targets module-level names; use ParameterChange for class attributes"
                .to_string(),
        )),
        ChangeType::MethodAddition if fields.class_name.is_none() => missing("class_name"),
        ChangeType::MethodAddition if fields.attribute_name.is_none() => {
            missing("attribute_name (method name)")
        }
        ChangeType::ClassModification if fields.class_name.is_none() => missing("class_name"),
        ChangeType::MethodAddition | ChangeType::ClassModification | ChangeType::ImportAddition
            if !code_or_str =>
        {
            missing("a code new_value")
        }
        ChangeType::DocstringUpdate if !matches!(fields.new_value, Value::Str(_)) => {
            missing("a string new_value")
        }
        ChangeType::ParameterChange | ChangeType::ConfigUpdate
            if matches!(fields.new_value, Value::Code(_)) =>
        {
            missing("a scalar new_value")
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn threshold_fields() -> TechnicalSpecFields {
        TechnicalSpecFields {
            proposal_id: "prop-001".to_string(),
            change_type: ChangeType::ParameterChange,
            file_path: "src/oracle.py".to_string(),
            class_name: Some("OracleEngine".to_string()),
            attribute_name: Some("threshold".to_string()),
            old_value: Some(Value::Float(0.3)),
            new_value: Value::Float(0.65),
            data_type: DataType::Float,
            original_proposal: "update threshold from 0.3 to 0.65 in OracleEngine".to_string(),
        }
    }

    #[test]
    fn test_valid_spec_builds_with_digest() {
        let spec = TechnicalSpec::new(threshold_fields()).unwrap();
        assert_eq!(spec.spec_digest().len(), 64);
        assert_eq!(spec.symbol_path(), "OracleEngine.threshold");
        assert_eq!(
            spec.parameter_key(),
            "src/oracle.py::OracleEngine.threshold"
        );
    }

    #[test]
    fn test_identical_values_rejected() {
        let mut fields = threshold_fields();
        fields.new_value = Value::Float(0.3);
        assert!(matches!(
            TechnicalSpec::new(fields),
            Err(CodecraftError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut fields = threshold_fields();
        fields.new_value = Value::Bool(true);
        fields.data_type = DataType::Bool;
        assert!(matches!(
            TechnicalSpec::new(fields),
            Err(CodecraftError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_traversal_path_rejected() {
        let mut fields = threshold_fields();
        fields.file_path = "../../etc/passwd".to_string();
        assert!(matches!(
            TechnicalSpec::new(fields),
            Err(CodecraftError::InvalidTarget(_))
        ));

        let mut fields = threshold_fields();
        fields.file_path = "/etc/passwd".to_string();
        assert!(TechnicalSpec::new(fields).is_err());
    }

    #[test]
    fn test_deserialization_revalidates() {
        let mut fields = threshold_fields();
        fields.proposal_id = "bad id with spaces".to_string();
        let json = serde_json::to_string(&fields).unwrap();
        assert!(serde_json::from_str::<TechnicalSpec>(&json).is_err());

        let good = serde_json::to_string(&TechnicalSpec::new(threshold_fields()).unwrap()).unwrap();
        let back: TechnicalSpec = serde_json::from_str(&good).unwrap();
        assert_eq!(back.new_value(), &Value::Float(0.65));
    }

    #[test]
    fn test_float_literal_keeps_decimal_point() {
        assert_eq!(Value::Float(1.0).python_literal(), "1.0");
        assert_eq!(Value::Float(0.65).python_literal(), "0.65");
        assert_eq!(Value::Bool(false).python_literal(), "False");
        assert_eq!(Value::Str("a\"b".into()).python_literal(), r#""a\"b""#);
    }

    #[test]
    fn test_parse_as_widens_int_to_float_only() {
        assert_eq!(Value::parse_as("2", DataType::Float).unwrap(), Value::Float(2.0));
        assert!(Value::parse_as("0.5", DataType::Int).is_err());
        assert!(Value::parse_as("yes", DataType::Bool).is_err());
        assert_eq!(Value::parse_as("1_000", DataType::Int).unwrap(), Value::Int(1000));
        assert_eq!(
            Value::parse_as("'fast'", DataType::Str).unwrap(),
            Value::Str("fast".into())
        );
    }

    #[test]
    fn test_commit_type_mapping() {
        assert_eq!(ChangeType::ParameterChange.commit_type(), "feat");
        assert_eq!(ChangeType::MethodAddition.commit_type(), "feat");
        assert_eq!(ChangeType::ClassModification.commit_type(), "refactor");
        assert_eq!(ChangeType::ConfigUpdate.commit_type(), "chore");
        assert_eq!(ChangeType::ImportAddition.commit_type(), "chore");
        assert_eq!(ChangeType::DocstringUpdate.commit_type(), "docs");
    }

    #[test]
    fn test_change_type_hint_is_lenient() {
        assert_eq!(
            ChangeType::from_hint("parameter_change"),
            Some(ChangeType::ParameterChange)
        );
        assert_eq!(
            ChangeType::from_hint("Import Addition"),
            Some(ChangeType::ImportAddition)
        );
        assert_eq!(ChangeType::from_hint("rewrite"), None);
    }

    #[test]
    fn test_config_dict_key_symbol_path() {
        let fields = TechnicalSpecFields {
            proposal_id: "cfg-1".into(),
            change_type: ChangeType::ConfigUpdate,
            file_path: "settings.py".into(),
            class_name: None,
            attribute_name: Some("CONFIG.max_retries".into()),
            old_value: Some(Value::Int(3)),
            new_value: Value::Int(5),
            data_type: DataType::Int,
            original_proposal: String::new(),
        };
        let spec = TechnicalSpec::new(fields).unwrap();
        assert_eq!(spec.symbol_path(), "CONFIG[max_retries]");
    }
}
