//! Extraction providers for proposals the deterministic rules cannot decide.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use super::proposal::StructuredProposal;
use crate::config::LlmConfig;
use crate::domain::error::{CodecraftError, Result};
use crate::domain::spec::ChangeType;

/// A model that turns proposal text into structured fields.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Return a JSON object with the [`StructuredProposal`] fields.
    async fn extract(&self, prompt: &str) -> Result<JsonValue>;
}

/// How ambiguous proposals are handled; chosen at construction.
#[derive(Clone)]
pub enum ExtractionProvider {
    /// Ask an LLM backend (results are cached by input hash).
    Llm(Arc<dyn LlmBackend>),
    /// Deterministic rules only; ambiguous input fails without any I/O.
    Heuristic,
}

impl std::fmt::Debug for ExtractionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionProvider::Llm(b) => write!(f, "Llm({})", b.name()),
            ExtractionProvider::Heuristic => f.write_str("Heuristic"),
        }
    }
}

impl ExtractionProvider {
    pub fn from_config(llm: Option<&LlmConfig>) -> Result<Self> {
        match llm {
            Some(cfg) => Ok(ExtractionProvider::Llm(Arc::new(HttpLlmBackend::new(
                cfg.clone(),
            )?))),
            None => Ok(ExtractionProvider::Heuristic),
        }
    }
}

/// Prompt asking for the structured fields of `text`.
pub fn build_prompt(text: &str) -> String {
    let kinds = ChangeType::ALL
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Extract the code change described below as a single JSON object with the keys \
         change_type_hint (one of: {kinds}), file_path, class_name, attribute_name, \
         old_value, new_value. Use null for anything the text does not state. \
         Respond with JSON only.\n\nChange proposal:\n{}",
        text.trim()
    )
}

/// Turn backend output into a [`StructuredProposal`], or `AmbiguousProposal`
/// when the output is not the expected object.
pub fn parse_backend_output(value: JsonValue, description: &str) -> Result<StructuredProposal> {
    let malformed = |why: String| {
        CodecraftError::AmbiguousProposal(format!("extraction backend returned malformed output: {why}"))
    };
    if !value.is_object() {
        return Err(malformed(format!("expected an object, got {value}")));
    }
    let mut structured: StructuredProposal =
        serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
    if structured.new_value.is_none() {
        return Err(malformed("no new_value".to_string()));
    }
    structured.proposal_id = None;
    structured.description = description.to_string();
    Ok(structured)
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// HTTP backend speaking the `/api/generate` JSON protocol
/// (`{"model", "prompt", "format": "json"}` in, `{"response": "<json>"}` out).
/// A bare JSON object response is accepted as well.
pub struct HttpLlmBackend {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpLlmBackend {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("codecraft/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CodecraftError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn extract(&self, prompt: &str) -> Result<JsonValue> {
        let body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "format": "json",
            "stream": false,
        });
        let mut request = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        debug!(endpoint = %self.config.endpoint, model = %self.config.model, "llm extraction request");

        let response = request
            .send()
            .await
            .map_err(|e| CodecraftError::Llm(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CodecraftError::Llm(format!("{status}: {text}")));
        }
        let payload: JsonValue = response
            .json()
            .await
            .map_err(|e| CodecraftError::Llm(format!("invalid response body: {e}")))?;

        match serde_json::from_value::<GenerateResponse>(payload.clone()) {
            Ok(generated) => serde_json::from_str(generated.response.trim()).map_err(|e| {
                CodecraftError::AmbiguousProposal(format!(
                    "extraction backend returned malformed output: {e}"
                ))
            }),
            Err(_) => Ok(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_lists_change_types() {
        let prompt = build_prompt("  tune the oracle ");
        assert!(prompt.contains("ParameterChange"));
        assert!(prompt.ends_with("tune the oracle"));
    }

    #[test]
    fn test_backend_output_validation() {
        let ok = parse_backend_output(
            json!({"change_type_hint": "ParameterChange", "attribute_name": "threshold", "new_value": 0.65}),
            "tune",
        )
        .unwrap();
        assert_eq!(ok.description, "tune");

        assert!(matches!(
            parse_backend_output(json!(["not", "an", "object"]), "x"),
            Err(CodecraftError::AmbiguousProposal(_))
        ));
        assert!(matches!(
            parse_backend_output(json!({"attribute_name": "threshold"}), "x"),
            Err(CodecraftError::AmbiguousProposal(_))
        ));
    }

    #[test]
    fn test_provider_from_config() {
        assert!(matches!(
            ExtractionProvider::from_config(None).unwrap(),
            ExtractionProvider::Heuristic
        ));
        let llm = ExtractionProvider::from_config(Some(&LlmConfig::default())).unwrap();
        assert!(matches!(llm, ExtractionProvider::Llm(_)));
    }
}
