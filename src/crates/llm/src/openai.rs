//! OpenAI-compatible chat completion client.
//!
//! Also serves any gateway speaking the same wire protocol through the
//! `base_url` override.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::{CompletionRequest, LanguageModel};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

pub struct OpenAiClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;
        Ok(Self { config, http })
    }
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiClient {
    fn name(&self) -> String {
        format!("openai:{}", self.config.model)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let api_key = self.config.require_api_key()?;
        let url = format!("{}/chat/completions", self.config.base_url());

        let mut messages = Vec::new();
        if let Some(context) = &request.context {
            messages.push(json!({"role": "system", "content": context}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
        });
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        debug!(model = %self.config.model, json_mode = request.json_mode, "openai completion");
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(LlmError::Authentication(response.text().await?));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(LlmError::RateLimited(response.text().await?));
            }
            _ => {}
        }
        let payload: Value = response.error_for_status()?.json().await?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                LlmError::InvalidResponse("reply has no choices[0].message.content".into())
            })
    }
}
