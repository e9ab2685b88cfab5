//! Builtin tools and the call policy wrapper
//!
//! Three base tools ship with the engine: `llm_generate`,
//! `retrieve_knowledge_graph` and `vector_search`. The latter two call the
//! external knowledge service over HTTP. Every registered handler is
//! wrapped in a [`PolicyHandler`] that enforces the per-call deadline and
//! retries once, with backoff, on transient failures.

use crate::config::EngineConfig;
use llm::{extract_json, CompletionRequest, LanguageModel};
use planvm_core::{ToolFailure, ToolHandler, ToolOutput, ToolRegistry, ToolSpec};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Deadline plus single-retry policy around an inner handler.
pub struct PolicyHandler<H> {
    inner: H,
    timeout: Duration,
}

impl<H> PolicyHandler<H> {
    pub fn new(inner: H, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait::async_trait]
impl<H: ToolHandler> ToolHandler for PolicyHandler<H> {
    async fn invoke(&self, params: Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
        let first = match tokio::time::timeout(self.timeout, self.inner.invoke(params.clone())).await
        {
            Ok(result) => result,
            Err(_) => Err(ToolFailure::timed_out(self.timeout.as_secs())),
        };

        let failure = match first {
            Ok(output) => return Ok(output),
            Err(failure) if failure.transient => failure,
            Err(failure) => return Err(failure),
        };

        warn!(error = %failure.message, "transient tool failure, retrying once");
        tokio::time::sleep(Duration::from_millis(500)).await;
        match tokio::time::timeout(self.timeout, self.inner.invoke(params)).await {
            Ok(result) => result,
            Err(_) => Err(ToolFailure::timed_out(self.timeout.as_secs())),
        }
    }
}

fn require_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolFailure> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolFailure::fatal(format!("parameter '{}' must be a string", key)))
}

/// `llm_generate(prompt, context) -> string | mapping`
///
/// A reply that is a JSON object is returned keyed so a sequence of
/// `output_vars` can bind per key; anything else is the raw text.
pub struct LlmGenerateTool {
    model: Arc<dyn LanguageModel>,
}

impl LlmGenerateTool {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait::async_trait]
impl ToolHandler for LlmGenerateTool {
    async fn invoke(&self, params: Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
        let prompt = require_str(&params, "prompt")?;
        let mut request = CompletionRequest::new(prompt);
        if let Some(context) = params.get("context").and_then(Value::as_str) {
            request = request.with_context(context);
        }

        let reply = self.model.complete(request).await.map_err(|e| ToolFailure {
            message: e.to_string(),
            transient: e.is_retryable(),
            timeout_seconds: None,
        })?;

        match extract_json(&reply) {
            Ok(Value::Object(map)) => Ok(ToolOutput::Keyed(map)),
            _ => Ok(ToolOutput::Single(Value::String(reply))),
        }
    }
}

/// Shared plumbing for the knowledge service tools.
struct KnowledgeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    kb_id: Option<String>,
}

impl KnowledgeClient {
    fn new(base_url: String, config: &EngineConfig) -> Result<Self, crate::error::EngineError> {
        let http = reqwest::Client::builder()
            .timeout(config.tool_call_timeout)
            .build()
            .map_err(|e| crate::error::EngineError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            api_key: config.autoflow_api_key.clone(),
            kb_id: config.kb_id.clone(),
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ToolFailure> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "knowledge service call");
        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| ToolFailure {
            message: e.to_string(),
            transient: e.is_timeout() || e.is_connect(),
            timeout_seconds: None,
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ToolFailure::transient(format!(
                "knowledge service returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(ToolFailure::fatal(format!(
                "knowledge service returned {}",
                status
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ToolFailure::fatal(format!("invalid service reply: {}", e)))
    }
}

/// `retrieve_knowledge_graph(query) -> value`
pub struct KnowledgeGraphTool {
    client: KnowledgeClient,
}

#[async_trait::async_trait]
impl ToolHandler for KnowledgeGraphTool {
    async fn invoke(&self, params: Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
        let query = require_str(&params, "query")?;
        let body = json!({
            "kb_id": self.client.kb_id,
            "query": query,
        });
        let value = self.client.post("/knowledge_graph/retrieve", body).await?;
        Ok(ToolOutput::Single(value))
    }
}

/// `vector_search(query, top_k) -> value`
///
/// `top_k` is forwarded verbatim; the service decides what zero means.
pub struct VectorSearchTool {
    client: KnowledgeClient,
}

#[async_trait::async_trait]
impl ToolHandler for VectorSearchTool {
    async fn invoke(&self, params: Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
        let query = require_str(&params, "query")?;
        let top_k = params.get("top_k").cloned().unwrap_or(Value::Null);
        let body = json!({
            "kb_id": self.client.kb_id,
            "query": query,
            "top_k": top_k,
        });
        let value = self.client.post("/vector_search", body).await?;
        Ok(ToolOutput::Single(value))
    }
}

/// Build the registry with the base tools, each behind the call policy.
///
/// The knowledge service tools are only registered when
/// `AUTOFLOW_BASE_URL` is configured; plans that call them in an
/// unconfigured deployment fail validation with an unknown tool.
pub fn builtin_registry(
    config: &EngineConfig,
    model: Arc<dyn LanguageModel>,
) -> Result<ToolRegistry, crate::error::EngineError> {
    let mut registry = ToolRegistry::new();
    let timeout = config.tool_call_timeout;

    registry.register(
        ToolSpec {
            name: "llm_generate".into(),
            description: "Generate text or JSON with the standard language model".into(),
            required_params: vec!["prompt".into()],
        },
        Arc::new(PolicyHandler::new(LlmGenerateTool::new(model), timeout)),
    );

    let Some(base_url) = config.autoflow_base_url.clone() else {
        warn!("AUTOFLOW_BASE_URL not configured, knowledge service tools disabled");
        return Ok(registry);
    };

    registry.register(
        ToolSpec {
            name: "retrieve_knowledge_graph".into(),
            description: "Query the knowledge graph service".into(),
            required_params: vec!["query".into()],
        },
        Arc::new(PolicyHandler::new(
            KnowledgeGraphTool { client: KnowledgeClient::new(base_url.clone(), config)? },
            timeout,
        )),
    );
    registry.register(
        ToolSpec {
            name: "vector_search".into(),
            description: "Similarity search over the knowledge base".into(),
            required_params: vec!["query".into()],
        },
        Arc::new(PolicyHandler::new(
            VectorSearchTool { client: KnowledgeClient::new(base_url, config)? },
            timeout,
        )),
    );

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm::MockModel;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn llm_generate_returns_keyed_output_for_json_replies() {
        let model = Arc::new(MockModel::with_replies([
            r#"{"summary": "s", "insights": "i"}"#,
        ]));
        let tool = LlmGenerateTool::new(model);
        let mut params = Map::new();
        params.insert("prompt".into(), json!("summarize"));
        let out = tool.invoke(params).await.unwrap();
        assert!(matches!(out, ToolOutput::Keyed(_)));
    }

    #[tokio::test]
    async fn llm_generate_returns_text_otherwise() {
        let model = Arc::new(MockModel::with_replies(["plain text answer"]));
        let tool = LlmGenerateTool::new(model);
        let mut params = Map::new();
        params.insert("prompt".into(), json!("say something"));
        let out = tool.invoke(params).await.unwrap();
        assert_eq!(out.into_value(), json!("plain text answer"));
    }

    struct FlakyTool {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ToolHandler for FlakyTool {
        async fn invoke(&self, _: Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ToolFailure::transient("connection reset"))
            } else {
                Ok(ToolOutput::Single(json!("ok")))
            }
        }
    }

    #[tokio::test]
    async fn policy_retries_transient_failures_once() {
        let handler = PolicyHandler::new(
            FlakyTool { calls: AtomicU32::new(0) },
            Duration::from_secs(5),
        );
        let out = handler.invoke(Map::new()).await.unwrap();
        assert_eq!(out.into_value(), json!("ok"));
    }

    struct SlowTool;

    #[async_trait::async_trait]
    impl ToolHandler for SlowTool {
        async fn invoke(&self, _: Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ToolOutput::Single(Value::Null))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn policy_maps_deadline_to_timeout_failure() {
        let handler = PolicyHandler::new(SlowTool, Duration::from_secs(1));
        let err = handler.invoke(Map::new()).await.unwrap_err();
        assert_eq!(err.timeout_seconds, Some(1));
    }
}
