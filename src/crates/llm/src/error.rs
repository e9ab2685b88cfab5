//! Error types for LLM provider adapters.

use thiserror::Error;

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur when talking to an LLM provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API key not configured for a provider that needs one.
    #[error("API key not configured: {0}")]
    ApiKeyMissing(String),

    /// Authentication rejected by the provider.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// Request timed out.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// The provider replied with something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// Whether a retry is likely to help.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http(e) => e.is_timeout() || e.is_connect(),
            LlmError::RateLimited(_) | LlmError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::InvalidResponse(err.to_string())
    }
}
