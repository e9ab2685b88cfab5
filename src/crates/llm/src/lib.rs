//! LLM provider adapters for manta.
//!
//! One small trait, [`LanguageModel`], with three implementations: an
//! OpenAI-compatible client (which also serves self-hosted gateways through
//! a base URL override), Google Gemini, and a local Ollama server. The
//! engine treats the reasoning and standard endpoints as two instances of
//! this trait; they may be the same client.

pub mod config;
pub mod error;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod testing;

pub use config::{LlmConfig, ProviderKind};
pub use error::{LlmError, Result};
pub use gemini::GeminiClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use testing::MockModel;

use std::sync::Arc;

/// One text completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Optional context sent ahead of the prompt.
    pub context: Option<String>,
    /// Ask the provider for a JSON object reply where supported.
    pub json_mode: bool,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A chat/completion endpoint.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider and model label for logging.
    fn name(&self) -> String;

    /// Run one completion and return the reply text.
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

/// Build a client for a configuration.
pub fn build_client(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    Ok(match config.provider {
        ProviderKind::OpenAi => Arc::new(OpenAiClient::new(config.clone())?),
        ProviderKind::Gemini => Arc::new(GeminiClient::new(config.clone())?),
        ProviderKind::Ollama => Arc::new(OllamaClient::new(config.clone())?),
    })
}

/// Pull a JSON value out of a possibly noisy model reply.
///
/// Handles code fences and prose around the payload by scanning for the
/// outermost JSON object or array. A reply that is already valid JSON is
/// parsed directly.
pub fn extract_json(reply: &str) -> Result<serde_json::Value> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    // Strip a markdown fence if the whole reply is wrapped in one.
    if let Some(inner) = strip_fence(trimmed) {
        if let Ok(value) = serde_json::from_str(inner.trim()) {
            return Ok(value);
        }
    }

    // Fall back to the outermost braced/bracketed region.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }

    Err(LlmError::InvalidResponse(format!(
        "no JSON value found in reply: {}",
        truncate(trimmed, 200)
    )))
}

fn strip_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    let rest = match rest.find('\n') {
        Some(index) => &rest[index + 1..],
        None => rest,
    };
    rest.strip_suffix("```").or(Some(rest))
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_plain_json() {
        assert_eq!(
            extract_json(r#"{"result": true}"#).unwrap(),
            json!({"result": true})
        );
    }

    #[test]
    fn extracts_fenced_json() {
        let reply = "```json\n{\"result\": false, \"explanation\": \"odd\"}\n```";
        assert_eq!(
            extract_json(reply).unwrap(),
            json!({"result": false, "explanation": "odd"})
        );
    }

    #[test]
    fn extracts_json_embedded_in_prose() {
        let reply = "Sure! Here is the answer: {\"result\": true} hope that helps";
        assert_eq!(extract_json(reply).unwrap(), json!({"result": true}));
    }

    #[test]
    fn bare_words_are_rejected() {
        assert!(extract_json("true story").is_err());
        assert!(extract_json("").is_err());
    }

    #[test]
    fn bare_true_is_valid_json() {
        // A bare JSON literal still parses; callers decide whether the
        // shape is acceptable.
        assert_eq!(extract_json("true").unwrap(), json!(true));
    }
}
