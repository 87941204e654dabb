//! Inbound proposals: free text or a structured JSON object.

use serde::{Deserialize, Serialize};

use crate::domain::digest::{canonical_json, sha256_hex};
use crate::domain::error::Result;

/// Structured proposal. Explicit fields win over text extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredProposal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_type_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<serde_json::Value>,
}

/// A change proposal as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Proposal {
    Text(String),
    Structured(StructuredProposal),
}

impl Proposal {
    /// Interpret `input` as a structured JSON proposal when it is a JSON
    /// object with the expected fields, otherwise as free text.
    pub fn from_input(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.starts_with('{') {
            if let Ok(structured) = serde_json::from_str::<StructuredProposal>(trimmed) {
                return Proposal::Structured(structured);
            }
        }
        Proposal::Text(trimmed.to_string())
    }

    /// Human description carried into `original_proposal`.
    pub fn description(&self) -> &str {
        match self {
            Proposal::Text(t) => t,
            Proposal::Structured(s) => &s.description,
        }
    }

    pub fn explicit_id(&self) -> Option<&str> {
        match self {
            Proposal::Text(_) => None,
            Proposal::Structured(s) => s.proposal_id.as_deref(),
        }
    }

    /// Whitespace-collapsed text, or canonical JSON of the structured form
    /// (without its id).
    pub fn normalized(&self) -> Result<String> {
        match self {
            Proposal::Text(t) => Ok(t.split_whitespace().collect::<Vec<_>>().join(" ")),
            Proposal::Structured(s) => {
                let mut without_id = s.clone();
                without_id.proposal_id = None;
                without_id.description = without_id
                    .description
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ");
                canonical_json(&serde_json::to_value(&without_id)?)
            }
        }
    }

    /// SHA-256 of the normalized input; keys the parse cache.
    pub fn input_hash(&self) -> Result<String> {
        Ok(sha256_hex(self.normalized()?.as_bytes()))
    }

    /// Explicit id, or the first 12 hex chars of the input hash so that
    /// resubmitting identical input yields the same id.
    pub fn resolve_id(&self) -> Result<String> {
        match self.explicit_id() {
            Some(id) => Ok(id.to_string()),
            None => Ok(self.input_hash()?[..12].to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_object_is_structured() {
        let p = Proposal::from_input(
            r#"{"description": "tune", "attribute_name": "threshold", "new_value": 0.65}"#,
        );
        match p {
            Proposal::Structured(s) => {
                assert_eq!(s.attribute_name.as_deref(), Some("threshold"));
                assert_eq!(s.new_value, Some(serde_json::json!(0.65)));
            }
            other => panic!("expected structured, got {other:?}"),
        }
        assert!(matches!(Proposal::from_input("set x to 1"), Proposal::Text(_)));
    }

    #[test]
    fn test_default_id_is_stable_under_whitespace() {
        let a = Proposal::from_input("update threshold   from 0.3 to 0.65 in OracleEngine");
        let b = Proposal::from_input("  update threshold from 0.3\nto 0.65 in OracleEngine ");
        let id = a.resolve_id().unwrap();
        assert_eq!(id.len(), 12);
        assert_eq!(id, b.resolve_id().unwrap());
    }

    #[test]
    fn test_explicit_id_wins() {
        let p = Proposal::from_input(r#"{"proposal_id": "prop-7", "description": "x"}"#);
        assert_eq!(p.resolve_id().unwrap(), "prop-7");
    }
}
