//! Static plan validation
//!
//! Best-effort checks run after every planner call, before a plan is loaded
//! into a VM. All issues are collected in one pass so the planner gets the
//! complete picture as feedback. The variable-flow check is path-insensitive
//! by design: a reference is accepted if any earlier instruction in sequence
//! order binds the name.

use crate::error::VmError;
use crate::interp::referenced_names;
use crate::plan::{InstructionBody, JmpKind, Plan};
use crate::registry::{Namespace, ToolRegistry};
use crate::vars::is_valid_name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The distinguished variable that carries the task result
pub const FINAL_ANSWER: &str = "final_answer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    EmptyPlan,
    DuplicateSeqNo,
    UnknownTool,
    ToolNotVisible,
    MalformedJmp,
    UnresolvedJumpTarget,
    UndefinedVariable,
    InvalidVariableName,
    MissingFinalAnswer,
}

/// One validation finding, with a machine code the planner can act on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_no: Option<u64>,
    pub message: String,
}

impl ValidationIssue {
    fn new(code: IssueCode, seq_no: Option<u64>, message: impl Into<String>) -> Self {
        Self { code, seq_no, message: message.into() }
    }
}

/// Validate a plan against the registry and the task's namespace.
pub fn validate_plan(
    plan: &Plan,
    registry: &ToolRegistry,
    namespace: &Namespace,
) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    if plan.is_empty() {
        issues.push(ValidationIssue::new(
            IssueCode::EmptyPlan,
            None,
            "plan contains no instructions",
        ));
        return Err(issues);
    }

    check_seq_nos(plan, &mut issues);
    check_tools(plan, registry, namespace, &mut issues);
    check_jumps(plan, &mut issues);
    check_variable_flow(plan, &mut issues);
    check_final_answer(plan, &mut issues);

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// Convenience wrapper producing the engine-facing error type.
pub fn ensure_valid(
    plan: &Plan,
    registry: &ToolRegistry,
    namespace: &Namespace,
) -> crate::error::Result<()> {
    validate_plan(plan, registry, namespace).map_err(|issues| {
        let summary = issues
            .iter()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        VmError::Validation { summary, issues }
    })
}

fn check_seq_nos(plan: &Plan, issues: &mut Vec<ValidationIssue>) {
    let mut seen = BTreeSet::new();
    for inst in &plan.instructions {
        if !seen.insert(inst.seq_no) {
            issues.push(ValidationIssue::new(
                IssueCode::DuplicateSeqNo,
                Some(inst.seq_no),
                format!("seq_no {} appears more than once", inst.seq_no),
            ));
        }
    }
}

fn check_tools(
    plan: &Plan,
    registry: &ToolRegistry,
    namespace: &Namespace,
    issues: &mut Vec<ValidationIssue>,
) {
    for inst in &plan.instructions {
        if let InstructionBody::Calling(call) = &inst.body {
            if !registry.has_tool(&call.tool_name) {
                issues.push(ValidationIssue::new(
                    IssueCode::UnknownTool,
                    Some(inst.seq_no),
                    format!("tool '{}' is not registered", call.tool_name),
                ));
            } else if !namespace.allows(&call.tool_name) {
                issues.push(ValidationIssue::new(
                    IssueCode::ToolNotVisible,
                    Some(inst.seq_no),
                    format!(
                        "tool '{}' is not visible in namespace '{}'",
                        call.tool_name, namespace.name
                    ),
                ));
            }
        }
    }
}

fn check_jumps(plan: &Plan, issues: &mut Vec<ValidationIssue>) {
    for inst in &plan.instructions {
        if let InstructionBody::Jmp(jmp) = &inst.body {
            match jmp.kind() {
                Err(e) => issues.push(ValidationIssue::new(
                    IssueCode::MalformedJmp,
                    Some(inst.seq_no),
                    e.to_string(),
                )),
                Ok(kind) => {
                    let targets = match kind {
                        JmpKind::Unconditional(t) => vec![t],
                        JmpKind::Conditional { if_true, if_false, .. } => {
                            vec![if_true, if_false]
                        }
                    };
                    for target in targets {
                        if !plan.contains(target) {
                            issues.push(ValidationIssue::new(
                                IssueCode::UnresolvedJumpTarget,
                                Some(inst.seq_no),
                                format!("jump target {} is not a seq_no in the plan", target),
                            ));
                        }
                    }
                }
            }
        }
    }
}

fn check_variable_flow(plan: &Plan, issues: &mut Vec<ValidationIssue>) {
    let mut order: Vec<&crate::plan::Instruction> = plan.instructions.iter().collect();
    order.sort_by_key(|i| i.seq_no);

    let mut bound: BTreeSet<&str> = BTreeSet::new();
    for inst in order {
        let mut referenced = Vec::new();
        match &inst.body {
            // Reasoning instructions are inert for variable flow.
            InstructionBody::Reasoning(_) => {}
            InstructionBody::Assign(writes) => {
                for (name, rhs) in writes {
                    if !is_valid_name(name) {
                        issues.push(ValidationIssue::new(
                            IssueCode::InvalidVariableName,
                            Some(inst.seq_no),
                            format!("'{}' is not a valid variable name", name),
                        ));
                    }
                    referenced_names(rhs, &mut referenced);
                }
            }
            InstructionBody::Calling(call) => {
                for value in call.tool_params.values() {
                    referenced_names(value, &mut referenced);
                }
                for name in call.output_vars.names() {
                    if !is_valid_name(name) {
                        issues.push(ValidationIssue::new(
                            IssueCode::InvalidVariableName,
                            Some(inst.seq_no),
                            format!("'{}' is not a valid output variable name", name),
                        ));
                    }
                }
            }
            InstructionBody::Jmp(jmp) => {
                if let Some(prompt) = &jmp.condition_prompt {
                    referenced_names(&serde_json::Value::String(prompt.clone()), &mut referenced);
                }
            }
        }

        // An instruction's own bindings count as in scope. This is the
        // permissive side of best-effort: an assign that reads a sibling
        // write still fails at runtime, because right-hand sides evaluate
        // against the pre-instruction store.
        for name in inst.bindings() {
            bound.insert(name);
        }

        for name in referenced {
            if !bound.contains(name.as_str()) {
                issues.push(ValidationIssue::new(
                    IssueCode::UndefinedVariable,
                    Some(inst.seq_no),
                    format!("'{}' is referenced before any instruction binds it", name),
                ));
            }
        }
    }
}

/// Walk every forward path and require the last instruction on each to bind
/// `final_answer`. Cycles are cut at the first revisit.
fn check_final_answer(plan: &Plan, issues: &mut Vec<ValidationIssue>) {
    let Some(first) = plan.first_seq() else {
        return;
    };

    let mut visited = BTreeSet::new();
    let mut stack = vec![first];
    let mut exits = Vec::new();
    let mut reaches_end = false;

    while let Some(seq) = stack.pop() {
        if !visited.insert(seq) {
            continue;
        }
        let Some(inst) = plan.get(seq) else {
            continue;
        };
        let successors: Vec<Option<u64>> = match &inst.body {
            InstructionBody::Jmp(jmp) => match jmp.kind() {
                Ok(JmpKind::Unconditional(t)) => vec![Some(t)],
                Ok(JmpKind::Conditional { if_true, if_false, .. }) => {
                    vec![Some(if_true), Some(if_false)]
                }
                // Already reported as MalformedJmp.
                Err(_) => vec![],
            },
            _ => vec![plan.seq_after(seq)],
        };
        for succ in successors {
            match succ {
                Some(next) if plan.contains(next) => stack.push(next),
                _ => {
                    reaches_end = true;
                    exits.push(inst);
                }
            }
        }
    }

    if !reaches_end {
        issues.push(ValidationIssue::new(
            IssueCode::MissingFinalAnswer,
            None,
            "no forward path reaches the end of the plan",
        ));
        return;
    }

    for inst in exits {
        if !inst.bindings().contains(&FINAL_ANSWER) {
            issues.push(ValidationIssue::new(
                IssueCode::MissingFinalAnswer,
                Some(inst.seq_no),
                format!(
                    "the last instruction of a forward path does not bind '{}'",
                    FINAL_ANSWER
                ),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ToolFailure, ToolHandler, ToolOutput, ToolSpec};
    use serde_json::{Map, Value};
    use std::sync::Arc;

    struct Nop;

    #[async_trait::async_trait]
    impl ToolHandler for Nop {
        async fn invoke(&self, _: Map<String, Value>) -> Result<ToolOutput, ToolFailure> {
            Ok(ToolOutput::Single(Value::Null))
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        for name in ["llm_generate", "retrieve_knowledge_graph", "vector_search"] {
            reg.register(
                ToolSpec {
                    name: name.into(),
                    description: String::new(),
                    required_params: vec![],
                },
                Arc::new(Nop),
            );
        }
        reg
    }

    fn codes(result: Result<(), Vec<ValidationIssue>>) -> Vec<IssueCode> {
        result.unwrap_err().into_iter().map(|i| i.code).collect()
    }

    #[test]
    fn accepts_a_well_formed_plan() {
        let plan = Plan::parse(
            r#"[
                {"seq_no":0,"type":"calling","parameters":{"tool_name":"vector_search","tool_params":{"query":"q","top_k":3},"output_vars":["hits"]}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"${hits}"}}
            ]"#,
        )
        .unwrap();
        let reg = registry();
        let ns = Namespace::open(&reg);
        assert!(validate_plan(&plan, &reg, &ns).is_ok());
    }

    #[test]
    fn flags_duplicate_seq_nos() {
        let plan = Plan::parse(
            r#"[
                {"seq_no":0,"type":"assign","parameters":{"final_answer":"a"}},
                {"seq_no":0,"type":"assign","parameters":{"final_answer":"b"}}
            ]"#,
        )
        .unwrap();
        let reg = registry();
        let ns = Namespace::open(&reg);
        assert!(codes(validate_plan(&plan, &reg, &ns)).contains(&IssueCode::DuplicateSeqNo));
    }

    #[test]
    fn flags_unknown_and_invisible_tools() {
        let plan = Plan::parse(
            r#"[
                {"seq_no":0,"type":"calling","parameters":{"tool_name":"no_such_tool","tool_params":{},"output_vars":"x"}},
                {"seq_no":1,"type":"calling","parameters":{"tool_name":"vector_search","tool_params":{},"output_vars":"y"}},
                {"seq_no":2,"type":"assign","parameters":{"final_answer":"done"}}
            ]"#,
        )
        .unwrap();
        let reg = registry();
        let ns = Namespace::new("kg_only", vec!["retrieve_knowledge_graph".into()]);
        let found = codes(validate_plan(&plan, &reg, &ns));
        assert!(found.contains(&IssueCode::UnknownTool));
        assert!(found.contains(&IssueCode::ToolNotVisible));
    }

    #[test]
    fn flags_unresolved_jump_targets() {
        let plan = Plan::parse(
            r#"[
                {"seq_no":0,"type":"jmp","parameters":{"target_seq":99}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"done"}}
            ]"#,
        )
        .unwrap();
        let reg = registry();
        let ns = Namespace::open(&reg);
        assert!(codes(validate_plan(&plan, &reg, &ns)).contains(&IssueCode::UnresolvedJumpTarget));
    }

    #[test]
    fn flags_references_before_binding() {
        let plan = Plan::parse(
            r#"[
                {"seq_no":0,"type":"assign","parameters":{"a":"${not_yet}"}},
                {"seq_no":1,"type":"assign","parameters":{"not_yet":1,"final_answer":"x"}}
            ]"#,
        )
        .unwrap();
        let reg = registry();
        let ns = Namespace::open(&reg);
        assert!(codes(validate_plan(&plan, &reg, &ns)).contains(&IssueCode::UndefinedVariable));
    }

    #[test]
    fn accepts_output_vars_bound_by_prior_instruction() {
        let plan = Plan::parse(
            r#"[
                {"seq_no":0,"type":"calling","parameters":{"tool_name":"llm_generate","tool_params":{"prompt":"p"},"output_vars":["summary","insights"]}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"${summary}|${insights}"}}
            ]"#,
        )
        .unwrap();
        let reg = registry();
        let ns = Namespace::open(&reg);
        assert!(validate_plan(&plan, &reg, &ns).is_ok());
    }

    #[test]
    fn requires_final_answer_on_every_exit() {
        let plan = Plan::parse(
            r#"[
                {"seq_no":0,"type":"assign","parameters":{"n":4}},
                {"seq_no":1,"type":"jmp","parameters":{"condition_prompt":"is ${n} even","jump_if_true":2,"jump_if_false":3}},
                {"seq_no":2,"type":"assign","parameters":{"final_answer":"even"}},
                {"seq_no":3,"type":"assign","parameters":{"other":"odd"}}
            ]"#,
        )
        .unwrap();
        let reg = registry();
        let ns = Namespace::open(&reg);
        let found = codes(validate_plan(&plan, &reg, &ns));
        assert!(found.contains(&IssueCode::MissingFinalAnswer));
    }

    #[test]
    fn reasoning_is_inert_for_variable_flow() {
        let plan = Plan::parse(
            r#"[
                {"seq_no":0,"type":"reasoning","parameters":{"chain_of_thoughts":"uses ${nothing}"}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"ok"}}
            ]"#,
        )
        .unwrap();
        let reg = registry();
        let ns = Namespace::open(&reg);
        assert!(validate_plan(&plan, &reg, &ns).is_ok());
    }
}
