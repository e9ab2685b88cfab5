//! Conditional jump judging over the reasoning endpoint
//!
//! The reply must parse as `{"result": bool, "explanation": string}`. A
//! reply that does not (including a bare `true`) is retried once with a
//! stricter prompt appendix, then fails the instruction with a parse error.

use llm::{extract_json, CompletionRequest, LanguageModel};
use planvm_core::{ConditionJudge, ConditionVerdict, VmError};
use std::sync::Arc;
use tracing::{debug, warn};

const PROMPT_TEMPLATE: &str = "Decide whether the following condition holds.\n\
    Reply with a JSON object of the form {\"result\": true|false, \"explanation\": \"...\"}.\n\
    Condition: ";

const STRICT_APPENDIX: &str = "\n\nReply with ONLY the JSON object \
    {\"result\": true|false, \"explanation\": \"...\"}. No prose, no code fences.";

pub struct LlmJudge {
    model: Arc<dyn LanguageModel>,
}

impl LlmJudge {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    async fn ask(&self, prompt: &str, context: Option<&str>) -> Result<String, VmError> {
        let mut request = CompletionRequest::new(prompt).json();
        if let Some(context) = context {
            request = request.with_context(context);
        }
        self.model.complete(request).await.map_err(map_llm_error)
    }
}

/// Transport failures from the model map onto the tool failure taxonomy.
pub fn map_llm_error(error: llm::LlmError) -> VmError {
    match error {
        llm::LlmError::Timeout(message) => {
            warn!(%message, "LLM call timed out");
            VmError::Timeout { seconds: 0 }
        }
        other => VmError::ToolFailed {
            name: "llm".to_string(),
            message: other.to_string(),
            transient: other.is_retryable(),
        },
    }
}

fn parse_verdict(reply: &str) -> Result<ConditionVerdict, VmError> {
    let value = extract_json(reply).map_err(|e| VmError::LlmParse { message: e.to_string() })?;
    if !value.is_object() {
        return Err(VmError::LlmParse {
            message: format!("expected a JSON object, got: {}", value),
        });
    }
    serde_json::from_value(value).map_err(|e| VmError::LlmParse {
        message: format!("reply does not match {{result, explanation}}: {}", e),
    })
}

#[async_trait::async_trait]
impl ConditionJudge for LlmJudge {
    async fn judge(
        &self,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<ConditionVerdict, VmError> {
        let question = format!("{}{}", PROMPT_TEMPLATE, prompt);
        let reply = self.ask(&question, context).await?;

        match parse_verdict(&reply) {
            Ok(verdict) => Ok(verdict),
            Err(first_error) => {
                debug!(error = %first_error, "condition reply unparseable, retrying strictly");
                let strict = format!("{}{}", question, STRICT_APPENDIX);
                let reply = self.ask(&strict, context).await?;
                parse_verdict(&reply)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm::MockModel;

    #[tokio::test]
    async fn parses_a_clean_json_reply() {
        let model = Arc::new(MockModel::with_replies([
            r#"{"result": true, "explanation": "4 is even"}"#,
        ]));
        let judge = LlmJudge::new(model);
        let verdict = judge.judge("is 4 even", None).await.unwrap();
        assert!(verdict.result);
        assert_eq!(verdict.explanation, "4 is even");
    }

    #[tokio::test]
    async fn bare_true_triggers_strict_retry() {
        let model = Arc::new(MockModel::with_replies([
            "true",
            r#"{"result": true, "explanation": "retried"}"#,
        ]));
        let judge = LlmJudge::new(model.clone());
        let verdict = judge.judge("is 4 even", None).await.unwrap();
        assert!(verdict.result);
        let prompts = model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("ONLY the JSON object"));
    }

    #[tokio::test]
    async fn two_bad_replies_fail_with_parse_error() {
        let model = Arc::new(MockModel::with_replies(["true", "yes, certainly"]));
        let judge = LlmJudge::new(model);
        let err = judge.judge("is 4 even", None).await.unwrap_err();
        assert!(matches!(err, VmError::LlmParse { .. }));
    }
}
