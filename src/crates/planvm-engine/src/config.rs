//! Engine configuration from environment variables
//!
//! Recognized keys:
//! `LLM_PROVIDER`, `LLM_MODEL`, `REASON_LLM_PROVIDER`, `REASON_LLM_MODEL`,
//! `EVALUATION_LLM_PROVIDER`, `EVALUATION_LLM_MODEL`, `OPENAI_API_KEY`,
//! `OPENAI_BASE_URL`, `GEMINI_API_KEY`, `OLLAMA_BASE_URL`,
//! `AUTOFLOW_API_KEY`, `AUTOFLOW_BASE_URL`, `KB_ID`, `DATABASE_URI`,
//! `BACKEND_CORS_ORIGINS`, `MODEL_CONFIGS`, `MAX_RECOVERY_ATTEMPTS`,
//! `MAX_VALIDATION_RETRIES`, `TOOL_CALL_TIMEOUT_SECONDS`.
//!
//! The reasoning and evaluation endpoints fall back to the standard
//! provider/model when their keys are unset.

use crate::error::{EngineError, Result};
use llm::{LlmConfig, ProviderKind};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Load an environment variable as a string.
pub fn get_env(key: &str) -> Result<Option<String>> {
    match env::var(key) {
        Ok(val) => Ok(Some(val)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(EngineError::Config(format!(
            "environment variable {} contains invalid UTF-8",
            key
        ))),
    }
}

/// Load and parse an environment variable.
pub fn get_env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_env(key)? {
        Some(val) => {
            let parsed = val.parse::<T>().map_err(|e| {
                EngineError::Config(format!("failed to parse environment variable {}: {}", key, e))
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Load an environment variable with a default value.
pub fn get_env_or(key: &str, default: impl Into<String>) -> Result<String> {
    Ok(get_env(key)?.unwrap_or_else(|| default.into()))
}

/// Per-model overrides supplied via `MODEL_CONFIGS` (JSON object keyed by
/// model name).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelOverride {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Everything the engine reads from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Standard generation endpoint, used by `llm_generate`.
    pub standard: LlmConfig,
    /// Reasoning endpoint, used for conditional jumps and planning.
    pub reasoning: LlmConfig,
    /// Evaluation endpoint, parsed for the plan-search layer.
    pub evaluation: LlmConfig,

    pub autoflow_base_url: Option<String>,
    pub autoflow_api_key: Option<String>,
    pub kb_id: Option<String>,

    pub database_uri: Option<String>,
    pub cors_origins: Vec<String>,

    pub max_recovery_attempts: u32,
    pub max_validation_retries: u32,
    pub tool_call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            standard: LlmConfig::new(ProviderKind::OpenAi, "gpt-4o-mini"),
            reasoning: LlmConfig::new(ProviderKind::OpenAi, "gpt-4o-mini"),
            evaluation: LlmConfig::new(ProviderKind::OpenAi, "gpt-4o-mini"),
            autoflow_base_url: None,
            autoflow_api_key: None,
            kb_id: None,
            database_uri: None,
            cors_origins: Vec::new(),
            max_recovery_attempts: 3,
            max_validation_retries: 2,
            tool_call_timeout: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let overrides: HashMap<String, ModelOverride> = match get_env("MODEL_CONFIGS")? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| EngineError::Config(format!("MODEL_CONFIGS is not valid JSON: {}", e)))?,
            None => HashMap::new(),
        };

        let standard_provider = get_env_or("LLM_PROVIDER", "openai")?;
        let standard_model = get_env_or("LLM_MODEL", "gpt-4o-mini")?;
        let standard = endpoint(&standard_provider, &standard_model, &overrides)?;

        let reasoning = endpoint(
            &get_env_or("REASON_LLM_PROVIDER", &standard_provider)?,
            &get_env_or("REASON_LLM_MODEL", &standard_model)?,
            &overrides,
        )?;
        let evaluation = endpoint(
            &get_env_or("EVALUATION_LLM_PROVIDER", &standard_provider)?,
            &get_env_or("EVALUATION_LLM_MODEL", &standard_model)?,
            &overrides,
        )?;

        let cors_origins = get_env("BACKEND_CORS_ORIGINS")?
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            standard,
            reasoning,
            evaluation,
            autoflow_base_url: get_env("AUTOFLOW_BASE_URL")?,
            autoflow_api_key: get_env("AUTOFLOW_API_KEY")?,
            kb_id: get_env("KB_ID")?,
            database_uri: get_env("DATABASE_URI")?,
            cors_origins,
            max_recovery_attempts: get_env_parse("MAX_RECOVERY_ATTEMPTS")?.unwrap_or(3),
            max_validation_retries: get_env_parse("MAX_VALIDATION_RETRIES")?.unwrap_or(2),
            tool_call_timeout: Duration::from_secs(
                get_env_parse("TOOL_CALL_TIMEOUT_SECONDS")?.unwrap_or(300),
            ),
        })
    }
}

fn endpoint(
    provider: &str,
    model: &str,
    overrides: &HashMap<String, ModelOverride>,
) -> Result<LlmConfig> {
    let provider: ProviderKind = provider.parse().map_err(EngineError::Llm)?;
    let mut config = LlmConfig::new(provider, model);

    match provider {
        ProviderKind::OpenAi => {
            if let Some(key) = get_env("OPENAI_API_KEY")? {
                config = config.with_api_key(key);
            }
            if let Some(url) = get_env("OPENAI_BASE_URL")? {
                config = config.with_base_url(url);
            }
        }
        ProviderKind::Gemini => {
            if let Some(key) = get_env("GEMINI_API_KEY")? {
                config = config.with_api_key(key);
            }
        }
        ProviderKind::Ollama => {
            if let Some(url) = get_env("OLLAMA_BASE_URL")? {
                config = config.with_base_url(url);
            }
        }
    }

    if let Some(over) = overrides.get(model) {
        if let Some(url) = &over.base_url {
            config = config.with_base_url(url.clone());
        }
        if let Some(key) = &over.api_key {
            config = config.with_api_key(key.clone());
        }
        if let Some(seconds) = over.timeout_seconds {
            config = config.with_timeout(Duration::from_secs(seconds));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_recovery_attempts, 3);
        assert_eq!(config.max_validation_retries, 2);
        assert_eq!(config.tool_call_timeout, Duration::from_secs(300));
    }

    #[test]
    fn model_overrides_deserialize() {
        let raw = r#"{"gpt-4o-mini": {"base_url": "http://proxy", "timeout_seconds": 30}}"#;
        let parsed: HashMap<String, ModelOverride> = serde_json::from_str(raw).unwrap();
        let over = &parsed["gpt-4o-mini"];
        assert_eq!(over.base_url.as_deref(), Some("http://proxy"));
        assert_eq!(over.timeout_seconds, Some(30));
    }
}
