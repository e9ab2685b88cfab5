//! Plan generation and repair over the reasoning endpoint
//!
//! The [`PlanGenerator`] trait fixes the adapter contract; [`LlmPlanner`]
//! implements it with JSON-mode prompts. The engine validates after every
//! call and feeds validation issues back through the hint/summary
//! arguments, so implementations stay stateless.

use crate::condition::map_llm_error;
use crate::error::Result;
use llm::{extract_json, CompletionRequest, LanguageModel};
use planvm_core::{Plan, ResponseFormat, ToolSpec, VariableStore, VmError};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Adapter contract for the reasoning LLM that writes and repairs plans.
#[async_trait::async_trait]
pub trait PlanGenerator: Send + Sync {
    /// Produce an initial plan for a goal.
    async fn generate(
        &self,
        goal: &str,
        namespace: &str,
        response_format: &ResponseFormat,
        tool_catalog: &[ToolSpec],
        best_practices_hint: Option<&str>,
    ) -> Result<Plan>;

    /// Repair a plan that failed at `failing_seq_no`, replacing or
    /// appending instructions from there onward.
    async fn update(
        &self,
        plan: &Plan,
        failing_seq_no: u64,
        error_summary: &str,
        variables: &VariableStore,
    ) -> Result<Plan>;

    /// Rewrite a single step and its local parameters.
    async fn optimize_step(
        &self,
        plan: &Plan,
        seq_no: u64,
        suggestion: &str,
        variables: &VariableStore,
    ) -> Result<Plan>;
}

const FORMAT_GUIDE: &str = r#"A plan is a JSON array of instructions. Each instruction is
{"seq_no": <unique integer>, "type": <kind>, "parameters": {...}} with kinds:
- "reasoning": parameters carry "chain_of_thoughts" and "dependency_analysis"; no effect.
- "assign": parameters map variable names to values. A string value may reference
  variables as ${name} and may be an arithmetic expression over + - * / % **.
- "calling": parameters are {"tool_name": ..., "tool_params": {...}, "output_vars": name or [names]}.
- "jmp": parameters are {"target_seq": n} for an unconditional jump, or
  {"condition_prompt": ..., "jump_if_true": n, "jump_if_false": n} for a conditional one.
Jumps refer to seq_no values. Do not nest sub-plans inside a jmp.
The last instruction of every path must assign the variable "final_answer".
Reply with ONLY the JSON array."#;

const STRICT_APPENDIX: &str =
    "\n\nYour previous reply could not be parsed. Reply with ONLY the JSON array of instructions, no prose, no code fences.";

/// [`PlanGenerator`] backed by a [`LanguageModel`].
pub struct LlmPlanner {
    model: Arc<dyn LanguageModel>,
}

impl LlmPlanner {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    async fn complete_plan(&self, prompt: String) -> Result<Plan> {
        let reply = self
            .model
            .complete(CompletionRequest::new(&prompt).json())
            .await
            .map_err(map_llm_error)?;

        match parse_plan(&reply) {
            Ok(plan) => Ok(plan),
            Err(first_error) => {
                debug!(error = %first_error, "plan reply unparseable, retrying strictly");
                let reply = self
                    .model
                    .complete(CompletionRequest::new(format!("{}{}", prompt, STRICT_APPENDIX)).json())
                    .await
                    .map_err(map_llm_error)?;
                Ok(parse_plan(&reply)?)
            }
        }
    }
}

fn parse_plan(reply: &str) -> std::result::Result<Plan, VmError> {
    let value = extract_json(reply).map_err(|e| VmError::LlmParse { message: e.to_string() })?;
    // Some models wrap the array in {"plan": [...]}.
    let value = match value {
        Value::Object(mut map) => map
            .remove("plan")
            .or_else(|| map.remove("instructions"))
            .ok_or_else(|| VmError::LlmParse {
                message: "reply object has no plan array".into(),
            })?,
        other => other,
    };
    Plan::from_value(value).map_err(|e| VmError::LlmParse { message: e.to_string() })
}

fn catalog_json(tool_catalog: &[ToolSpec]) -> String {
    serde_json::to_string_pretty(&json!(tool_catalog)).unwrap_or_else(|_| "[]".into())
}

fn variables_json(variables: &VariableStore) -> String {
    serde_json::to_string_pretty(&json!(variables)).unwrap_or_else(|_| "{}".into())
}

#[async_trait::async_trait]
impl PlanGenerator for LlmPlanner {
    async fn generate(
        &self,
        goal: &str,
        namespace: &str,
        response_format: &ResponseFormat,
        tool_catalog: &[ToolSpec],
        best_practices_hint: Option<&str>,
    ) -> Result<Plan> {
        let mut prompt = format!(
            "Write a plan that accomplishes this goal.\n\nGoal: {}\nNamespace: {}\n\nAvailable tools:\n{}\n\n{}",
            goal,
            namespace,
            catalog_json(tool_catalog),
            FORMAT_GUIDE,
        );
        if let Some(lang) = &response_format.lang {
            prompt.push_str(&format!("\n\nThe final answer must be written in: {}", lang));
        }
        if let Some(hint) = best_practices_hint {
            prompt.push_str(&format!("\n\nGuidance:\n{}", hint));
        }
        self.complete_plan(prompt).await
    }

    async fn update(
        &self,
        plan: &Plan,
        failing_seq_no: u64,
        error_summary: &str,
        variables: &VariableStore,
    ) -> Result<Plan> {
        let prompt = format!(
            "This plan failed at seq_no {}.\n\nError:\n{}\n\nCurrent variables:\n{}\n\nCurrent plan:\n{}\n\nProduce a corrected complete plan. Keep the instructions before seq_no {} unchanged; replace or append instructions from there onward.\n\n{}",
            failing_seq_no,
            error_summary,
            variables_json(variables),
            serde_json::to_string_pretty(plan).unwrap_or_default(),
            failing_seq_no,
            FORMAT_GUIDE,
        );
        self.complete_plan(prompt).await
    }

    async fn optimize_step(
        &self,
        plan: &Plan,
        seq_no: u64,
        suggestion: &str,
        variables: &VariableStore,
    ) -> Result<Plan> {
        let prompt = format!(
            "Rewrite instruction seq_no {} of this plan following the suggestion. Change only that instruction and its parameters; every other instruction must stay byte-identical.\n\nSuggestion:\n{}\n\nCurrent variables:\n{}\n\nCurrent plan:\n{}\n\n{}",
            seq_no,
            suggestion,
            variables_json(variables),
            serde_json::to_string_pretty(plan).unwrap_or_default(),
            FORMAT_GUIDE,
        );
        self.complete_plan(prompt).await
    }
}
