//! Scripted model for tests.

use crate::error::{LlmError, Result};
use crate::{CompletionRequest, LanguageModel};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A [`LanguageModel`] that replays scripted replies in order.
///
/// Prompts are recorded so tests can assert on what the engine sent.
#[derive(Default)]
pub struct MockModel {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::new();
        for reply in replies {
            model.push(reply);
        }
        model
    }

    pub fn push(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(reply.into());
    }

    /// Prompts seen so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LanguageModel for MockModel {
    fn name(&self) -> String {
        "mock".to_string()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::InvalidResponse("mock model ran out of replies".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_errors() {
        let model = MockModel::with_replies(["one", "two"]);
        let first = model.complete(CompletionRequest::new("a")).await.unwrap();
        let second = model.complete(CompletionRequest::new("b")).await.unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("one", "two"));
        assert!(model.complete(CompletionRequest::new("c")).await.is_err());
        assert_eq!(model.prompts(), vec!["a", "b", "c"]);
    }
}
