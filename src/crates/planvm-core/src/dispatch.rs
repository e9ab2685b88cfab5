//! Instruction dispatcher
//!
//! Executes exactly one instruction against a read-only view of the VM
//! state and returns the writes to apply, the interpolated inputs for the
//! step commit, and the next program counter. Failures never escape as
//! `Err`: they are captured on the outcome so the engine can hand them to
//! recovery. Conditional jumps are judged through the [`ConditionJudge`]
//! trait, keeping all LLM I/O outside this crate.

use crate::error::VmError;
use crate::interp::{eval_assign_rhs, interpolate_param, substitute};
use crate::plan::{CallingParams, Instruction, InstructionBody, JmpKind, JmpParams, Plan};
use crate::registry::{Namespace, ToolOutput, ToolRegistry};
use crate::vars::VariableStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Parsed yes/no reply from the reasoning model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionVerdict {
    pub result: bool,
    #[serde(default)]
    pub explanation: String,
}

/// Decides conditional jumps. Implemented by the engine over the reasoning
/// LLM endpoint and by scripted fakes in tests.
#[async_trait::async_trait]
pub trait ConditionJudge: Send + Sync {
    async fn judge(
        &self,
        prompt: &str,
        context: Option<&str>,
    ) -> crate::error::Result<ConditionVerdict>;
}

/// Result of dispatching one instruction
#[derive(Debug)]
pub struct StepOutcome {
    /// Variable writes to apply atomically (empty on error)
    pub writes: BTreeMap<String, Value>,
    /// Interpolated inputs, recorded on the step commit
    pub input_parameters: Value,
    /// Program counter after this instruction (unchanged on error)
    pub next_pc: u64,
    /// Interpolation warnings gathered on the way
    pub warnings: Vec<String>,
    pub error: Option<VmError>,
}

impl StepOutcome {
    fn failed(error: VmError, current_pc: u64, input_parameters: Value) -> Self {
        Self {
            writes: BTreeMap::new(),
            input_parameters,
            next_pc: current_pc,
            warnings: Vec::new(),
            error: Some(error),
        }
    }
}

/// Execute one instruction. The variable store is the pre-instruction
/// state; every right-hand side and parameter is interpolated against it.
pub async fn dispatch(
    plan: &Plan,
    vars: &VariableStore,
    instruction: &Instruction,
    registry: &ToolRegistry,
    namespace: &Namespace,
    judge: &dyn ConditionJudge,
) -> StepOutcome {
    let seq_no = instruction.seq_no;
    let fallthrough = plan.seq_after(seq_no).unwrap_or_else(|| plan.terminal_pc());

    match &instruction.body {
        InstructionBody::Reasoning(params) => StepOutcome {
            writes: BTreeMap::new(),
            input_parameters: serde_json::to_value(params).unwrap_or(Value::Null),
            next_pc: fallthrough,
            warnings: Vec::new(),
            error: None,
        },
        InstructionBody::Assign(params) => dispatch_assign(params, vars, seq_no, fallthrough),
        InstructionBody::Calling(call) => {
            dispatch_calling(call, vars, registry, namespace, seq_no, fallthrough).await
        }
        InstructionBody::Jmp(jmp) => dispatch_jmp(jmp, vars, judge, seq_no).await,
    }
}

fn dispatch_assign(
    params: &BTreeMap<String, Value>,
    vars: &VariableStore,
    seq_no: u64,
    next_pc: u64,
) -> StepOutcome {
    let mut writes = BTreeMap::new();
    let mut warnings = Vec::new();

    // Every right-hand side is evaluated against the pre-instruction store;
    // writes land only after all of them succeed.
    for (name, rhs) in params {
        match eval_assign_rhs(rhs, vars) {
            Ok((value, mut warns)) => {
                writes.insert(name.clone(), value);
                warnings.append(&mut warns);
            }
            Err(e) => {
                return StepOutcome::failed(e, seq_no, json!(params));
            }
        }
    }

    StepOutcome {
        input_parameters: json!(writes),
        writes,
        next_pc,
        warnings,
        error: None,
    }
}

async fn dispatch_calling(
    call: &CallingParams,
    vars: &VariableStore,
    registry: &ToolRegistry,
    namespace: &Namespace,
    seq_no: u64,
    next_pc: u64,
) -> StepOutcome {
    let mut warnings = Vec::new();
    let mut params = Map::new();
    for (key, value) in &call.tool_params {
        params.insert(key.clone(), interpolate_param(value, vars, &mut warnings));
    }
    let input_parameters = json!({
        "tool_name": call.tool_name,
        "tool_params": Value::Object(params.clone()),
    });

    let tool = match registry.resolve(&call.tool_name, namespace) {
        Ok(tool) => tool,
        Err(e) => return StepOutcome::failed(e, seq_no, input_parameters),
    };

    for required in &tool.spec.required_params {
        if !params.contains_key(required) {
            return StepOutcome::failed(
                VmError::Malformed(format!(
                    "tool '{}' requires parameter '{}'",
                    call.tool_name, required
                )),
                seq_no,
                input_parameters,
            );
        }
    }

    let output = match tool.handler.invoke(params).await {
        Ok(output) => output,
        Err(failure) => {
            let error = match failure.timeout_seconds {
                Some(seconds) => VmError::Timeout { seconds },
                None => VmError::ToolFailed {
                    name: call.tool_name.clone(),
                    message: failure.message,
                    transient: failure.transient,
                },
            };
            return StepOutcome::failed(error, seq_no, input_parameters);
        }
    };

    let writes = match bind_outputs(&call.tool_name, &call.output_vars, output) {
        Ok(writes) => writes,
        Err(e) => return StepOutcome::failed(e, seq_no, input_parameters),
    };

    StepOutcome {
        writes,
        input_parameters,
        next_pc,
        warnings,
        error: None,
    }
}

/// Bind a tool result to output variables per the registry contract: one
/// name takes the whole response, a sequence requires a keyed result with
/// every listed key present.
fn bind_outputs(
    tool_name: &str,
    output_vars: &crate::plan::OutputVars,
    output: ToolOutput,
) -> crate::error::Result<BTreeMap<String, Value>> {
    use crate::plan::OutputVars;

    let mut writes = BTreeMap::new();
    match output_vars {
        OutputVars::One(name) => {
            writes.insert(name.clone(), output.into_value());
        }
        OutputVars::Many(names) => {
            let mut map = match output {
                ToolOutput::Keyed(map) => map,
                ToolOutput::Single(Value::Object(map)) => map,
                ToolOutput::Single(_) => {
                    return Err(VmError::ToolFailed {
                        name: tool_name.to_string(),
                        message: format!(
                            "{} output variables requested but the tool returned a single value",
                            names.len()
                        ),
                        transient: false,
                    });
                }
            };
            for name in names {
                let value = map.remove(name).ok_or_else(|| VmError::ToolFailed {
                    name: tool_name.to_string(),
                    message: format!("tool result has no key '{}'", name),
                    transient: false,
                })?;
                writes.insert(name.clone(), value);
            }
        }
    }
    Ok(writes)
}

async fn dispatch_jmp(
    jmp: &JmpParams,
    vars: &VariableStore,
    judge: &dyn ConditionJudge,
    seq_no: u64,
) -> StepOutcome {
    let kind = match jmp.kind() {
        Ok(kind) => kind,
        Err(e) => return StepOutcome::failed(e, seq_no, Value::Null),
    };

    match kind {
        JmpKind::Unconditional(target) => StepOutcome {
            writes: BTreeMap::new(),
            input_parameters: json!({ "target_seq": target }),
            next_pc: target,
            warnings: Vec::new(),
            error: None,
        },
        JmpKind::Conditional { prompt, context, if_true, if_false } => {
            let mut warnings = Vec::new();
            let sub = substitute(prompt, vars);
            for name in &sub.missing {
                warnings.push(format!(
                    "variable '{}' is not bound, substituted empty string",
                    name
                ));
            }
            let context_sub = context.map(|c| substitute(c, vars).text);

            let verdict = match judge.judge(&sub.text, context_sub.as_deref()).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    return StepOutcome::failed(
                        e,
                        seq_no,
                        json!({ "condition_prompt": sub.text, "context": context_sub }),
                    );
                }
            };

            let next_pc = if verdict.result { if_true } else { if_false };
            StepOutcome {
                writes: BTreeMap::new(),
                input_parameters: json!({
                    "condition_prompt": sub.text,
                    "context": context_sub,
                    "result": verdict.result,
                    "explanation": verdict.explanation,
                }),
                next_pc,
                warnings,
                error: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ToolFailure, ToolHandler, ToolOutput, ToolSpec};
    use std::sync::Arc;

    struct FixedJudge(bool);

    #[async_trait::async_trait]
    impl ConditionJudge for FixedJudge {
        async fn judge(
            &self,
            _prompt: &str,
            _context: Option<&str>,
        ) -> crate::error::Result<ConditionVerdict> {
            Ok(ConditionVerdict { result: self.0, explanation: "fixed".into() })
        }
    }

    struct KeyedTool;

    #[async_trait::async_trait]
    impl ToolHandler for KeyedTool {
        async fn invoke(&self, _: Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
            let mut map = Map::new();
            map.insert("summary".into(), json!("s"));
            map.insert("insights".into(), json!("i"));
            Ok(ToolOutput::Keyed(map))
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(
            ToolSpec {
                name: "mock".into(),
                description: String::new(),
                required_params: vec![],
            },
            Arc::new(KeyedTool),
        );
        reg
    }

    fn vars(pairs: &[(&str, Value)]) -> VariableStore {
        let mut store = VariableStore::new();
        for (name, value) in pairs {
            store.set(*name, value.clone()).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn assign_evaluates_against_pre_state() {
        // y reads the pre-state x; x reads a never-bound y, which is fatal.
        let plan = Plan::parse(
            r#"[{"seq_no":1,"type":"assign","parameters":{"y":"${x}","x":"${y}"}}]"#,
        )
        .unwrap();
        let store = vars(&[("x", json!(10))]);
        let reg = registry();
        let ns = Namespace::open(&reg);
        let outcome = dispatch(
            &plan,
            &store,
            plan.get(1).unwrap(),
            &reg,
            &ns,
            &FixedJudge(true),
        )
        .await;
        assert!(matches!(
            outcome.error,
            Some(VmError::UnresolvedVariable { ref name }) if name == "y"
        ));
        assert!(outcome.writes.is_empty());
        assert_eq!(outcome.next_pc, 1);
    }

    #[tokio::test]
    async fn calling_binds_keyed_outputs() {
        let plan = Plan::parse(
            r#"[{"seq_no":0,"type":"calling","parameters":{"tool_name":"mock","tool_params":{},"output_vars":["summary","insights"]}}]"#,
        )
        .unwrap();
        let store = VariableStore::new();
        let reg = registry();
        let ns = Namespace::open(&reg);
        let outcome = dispatch(
            &plan,
            &store,
            plan.get(0).unwrap(),
            &reg,
            &ns,
            &FixedJudge(true),
        )
        .await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.writes["summary"], json!("s"));
        assert_eq!(outcome.writes["insights"], json!("i"));
        assert_eq!(outcome.next_pc, 1);
    }

    #[tokio::test]
    async fn calling_fails_on_missing_output_key() {
        let plan = Plan::parse(
            r#"[{"seq_no":0,"type":"calling","parameters":{"tool_name":"mock","tool_params":{},"output_vars":["summary","absent"]}}]"#,
        )
        .unwrap();
        let store = VariableStore::new();
        let reg = registry();
        let ns = Namespace::open(&reg);
        let outcome = dispatch(
            &plan,
            &store,
            plan.get(0).unwrap(),
            &reg,
            &ns,
            &FixedJudge(true),
        )
        .await;
        assert!(matches!(outcome.error, Some(VmError::ToolFailed { .. })));
    }

    #[tokio::test]
    async fn conditional_jmp_takes_the_judged_branch() {
        let plan = Plan::parse(
            r#"[
                {"seq_no":0,"type":"jmp","parameters":{"condition_prompt":"is ${n} even","jump_if_true":10,"jump_if_false":20}},
                {"seq_no":10,"type":"assign","parameters":{"final_answer":"even"}},
                {"seq_no":20,"type":"assign","parameters":{"final_answer":"odd"}}
            ]"#,
        )
        .unwrap();
        let store = vars(&[("n", json!(4))]);
        let reg = registry();
        let ns = Namespace::open(&reg);

        let outcome = dispatch(
            &plan,
            &store,
            plan.get(0).unwrap(),
            &reg,
            &ns,
            &FixedJudge(true),
        )
        .await;
        assert_eq!(outcome.next_pc, 10);
        assert_eq!(outcome.input_parameters["condition_prompt"], json!("is 4 even"));

        let outcome = dispatch(
            &plan,
            &store,
            plan.get(0).unwrap(),
            &reg,
            &ns,
            &FixedJudge(false),
        )
        .await;
        assert_eq!(outcome.next_pc, 20);
    }

    #[tokio::test]
    async fn tool_not_in_namespace_is_rejected_before_invoke() {
        let plan = Plan::parse(
            r#"[{"seq_no":0,"type":"calling","parameters":{"tool_name":"mock","tool_params":{},"output_vars":"out"}}]"#,
        )
        .unwrap();
        let store = VariableStore::new();
        let reg = registry();
        let ns = Namespace::new("closed", vec![]);
        let outcome = dispatch(
            &plan,
            &store,
            plan.get(0).unwrap(),
            &reg,
            &ns,
            &FixedJudge(true),
        )
        .await;
        assert!(matches!(outcome.error, Some(VmError::ToolNotAllowed { .. })));
    }
}
