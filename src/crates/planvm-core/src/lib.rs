//! Core plan execution machinery for manta.
//!
//! This crate holds everything the VM needs that is free of I/O: the plan
//! and instruction model, the per-task variable store and `${name}`
//! interpolator, arithmetic expression evaluation, static plan validation,
//! the tool registry with namespace visibility, the instruction dispatcher
//! and the VM state machine itself. Tool handlers and the condition judge
//! are injected as traits; the engine crate wires them to real services.

pub mod dispatch;
pub mod error;
pub mod expr;
pub mod interp;
pub mod plan;
pub mod registry;
pub mod validate;
pub mod vars;
pub mod vm;

pub use dispatch::{ConditionJudge, ConditionVerdict, StepOutcome};
pub use error::{ErrorKind, ErrorRecord, Result, VmError};
pub use plan::{CallingParams, Instruction, InstructionBody, JmpParams, OutputVars, Plan};
pub use registry::{Namespace, Tool, ToolFailure, ToolHandler, ToolOutput, ToolRegistry, ToolSpec};
pub use validate::{validate_plan, IssueCode, ValidationIssue, FINAL_ANSWER};
pub use vars::VariableStore;
pub use vm::{ResponseFormat, RunState, StepReport, Vm, VmState};
