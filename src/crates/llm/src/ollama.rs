//! Local Ollama client.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::{CompletionRequest, LanguageModel};
use serde_json::{json, Value};
use tracing::debug;

pub struct OllamaClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;
        Ok(Self { config, http })
    }
}

#[async_trait::async_trait]
impl LanguageModel for OllamaClient {
    fn name(&self) -> String {
        format!("ollama:{}", self.config.model)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let url = format!("{}/api/generate", self.config.base_url());

        let prompt = match &request.context {
            Some(context) => format!("{}\n\n{}", context, request.prompt),
            None => request.prompt.clone(),
        };
        let mut body = json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
        });
        if request.json_mode {
            body["format"] = json!("json");
        }
        if let Some(temperature) = request.temperature {
            body["options"] = json!({"temperature": temperature});
        }

        debug!(model = %self.config.model, json_mode = request.json_mode, "ollama completion");
        let payload: Value = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        payload["response"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse("reply has no response field".into()))
    }
}
