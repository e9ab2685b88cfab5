//! Plan and instruction model
//!
//! A plan is an ordered sequence of instructions forming a program for the
//! VM. Every instruction carries a unique integer `seq_no`; jumps refer to
//! `seq_no`, never to array index, and the sequence numbers need not be
//! contiguous. The wire format is a JSON array of
//! `{"seq_no": n, "type": ..., "parameters": {...}}` records.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One record of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub seq_no: u64,
    #[serde(flatten)]
    pub body: InstructionBody,
}

/// Instruction payload, tagged by `type` with `parameters` as content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "lowercase")]
pub enum InstructionBody {
    /// Metadata only; no side effect, advances the program counter by one
    Reasoning(ReasoningParams),
    /// Mapping from variable name to expression, applied atomically
    Assign(BTreeMap<String, Value>),
    /// Invoke a registered tool and bind its outputs
    Calling(CallingParams),
    /// Unconditional or LLM-judged conditional branch
    Jmp(JmpParams),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningParams {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chain_of_thoughts: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dependency_analysis: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallingParams {
    pub tool_name: String,
    #[serde(default)]
    pub tool_params: serde_json::Map<String, Value>,
    pub output_vars: OutputVars,
}

/// Output binding: one variable for the whole result, or one per result key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputVars {
    One(String),
    Many(Vec<String>),
}

impl OutputVars {
    pub fn names(&self) -> Vec<&str> {
        match self {
            OutputVars::One(name) => vec![name.as_str()],
            OutputVars::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// Jump parameters. Exactly one of the two forms must be present:
/// `target_seq` alone, or the conditional triple. Unknown fields are
/// rejected so nested sub-plans cannot sneak in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JmpParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_if_true: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_if_false: Option<u64>,
}

/// Resolved form of a jump instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JmpKind<'a> {
    Unconditional(u64),
    Conditional {
        prompt: &'a str,
        context: Option<&'a str>,
        if_true: u64,
        if_false: u64,
    },
}

impl JmpParams {
    pub fn kind(&self) -> Result<JmpKind<'_>> {
        match (
            self.target_seq,
            &self.condition_prompt,
            self.jump_if_true,
            self.jump_if_false,
        ) {
            (Some(target), None, None, None) => Ok(JmpKind::Unconditional(target)),
            (None, Some(prompt), Some(if_true), Some(if_false)) => Ok(JmpKind::Conditional {
                prompt,
                context: self.context.as_deref(),
                if_true,
                if_false,
            }),
            _ => Err(VmError::Malformed(
                "jmp needs either target_seq or condition_prompt with jump_if_true and jump_if_false"
                    .into(),
            )),
        }
    }
}

impl Instruction {
    /// Variable names this instruction binds when it succeeds
    pub fn bindings(&self) -> Vec<&str> {
        match &self.body {
            InstructionBody::Assign(writes) => writes.keys().map(String::as_str).collect(),
            InstructionBody::Calling(call) => call.output_vars.names(),
            _ => Vec::new(),
        }
    }
}

/// Ordered sequence of instructions, indexed by `seq_no`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    pub instructions: Vec<Instruction>,
}

impl Plan {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    /// Parse a plan from its JSON wire form.
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VmError::Malformed(format!("invalid plan: {}", e)))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| VmError::Malformed(format!("invalid plan: {}", e)))
    }

    pub fn get(&self, seq_no: u64) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.seq_no == seq_no)
    }

    pub fn contains(&self, seq_no: u64) -> bool {
        self.get(seq_no).is_some()
    }

    /// Smallest `seq_no` strictly greater than `current`, if any.
    pub fn seq_after(&self, current: u64) -> Option<u64> {
        self.instructions
            .iter()
            .map(|i| i.seq_no)
            .filter(|s| *s > current)
            .min()
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.instructions.iter().map(|i| i.seq_no).min()
    }

    pub fn max_seq(&self) -> Option<u64> {
        self.instructions.iter().map(|i| i.seq_no).max()
    }

    /// The terminal sentinel: one greater than the largest `seq_no`.
    pub fn terminal_pc(&self) -> u64 {
        self.max_seq().map(|s| s + 1).unwrap_or(0)
    }

    /// Whether `pc` is a valid position: an existing `seq_no` or terminal.
    pub fn is_valid_pc(&self, pc: u64) -> bool {
        self.contains(pc) || pc == self.terminal_pc()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}
