//! Google Gemini client.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::{CompletionRequest, LanguageModel};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

pub struct GeminiClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;
        Ok(Self { config, http })
    }
}

#[async_trait::async_trait]
impl LanguageModel for GeminiClient {
    fn name(&self) -> String {
        format!("gemini:{}", self.config.model)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let api_key = self.config.require_api_key()?;
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url(),
            self.config.model
        );

        let text = match &request.context {
            Some(context) => format!("{}\n\n{}", context, request.prompt),
            None => request.prompt.clone(),
        };
        let mut body = json!({
            "contents": [{"parts": [{"text": text}]}],
        });
        let mut generation_config = serde_json::Map::new();
        if request.json_mode {
            generation_config.insert("responseMimeType".into(), json!("application/json"));
        }
        if let Some(temperature) = request.temperature {
            generation_config.insert("temperature".into(), json!(temperature));
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }

        debug!(model = %self.config.model, json_mode = request.json_mode, "gemini completion");
        let response = self
            .http
            .post(&url)
            .query(&[("key", api_key)])
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

        payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                LlmError::InvalidResponse("reply has no candidates[0].content.parts[0].text".into())
            })
    }
}
