//! The virtual machine
//!
//! Owns the VM state tuple and drives single-stepping. The VM is a pure
//! state machine: two VMs with identical state and identical tool outputs
//! produce identical next states. All non-determinism lives in tool calls
//! and the condition judge, both injected per step.

use crate::dispatch::{dispatch, ConditionJudge, StepOutcome};
use crate::error::{ErrorRecord, Result, VmError};
use crate::plan::{Instruction, InstructionBody, Plan};
use crate::registry::{Namespace, ToolRegistry};
use crate::validate::FINAL_ANSWER;
use crate::vars::VariableStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Recognized response options, currently the output language
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The complete, serializable VM state. This is what commits snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmState {
    pub goal: String,
    #[serde(default)]
    pub response_format: ResponseFormat,
    pub namespace: String,
    #[serde(default)]
    pub plan: Plan,
    pub program_counter: u64,
    #[serde(default)]
    pub variables: VariableStore,
    #[serde(default)]
    pub goal_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorRecord>,
}

impl VmState {
    pub fn new(goal: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            response_format: ResponseFormat::default(),
            namespace: namespace.into(),
            plan: Plan::default(),
            program_counter: 0,
            variables: VariableStore::new(),
            goal_completed: false,
            last_error: None,
        }
    }

    pub fn with_response_format(mut self, response_format: ResponseFormat) -> Self {
        self.response_format = response_format;
        self
    }

    /// Whether the program counter sits past the last instruction.
    pub fn at_terminal(&self) -> bool {
        self.program_counter == self.plan.terminal_pc()
    }
}

/// Execution phase of the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Running,
    AwaitingTool,
    AwaitingLlm,
    Errored,
    Completed,
}

/// Report of one `step()` call, consumed by the engine to build a commit
#[derive(Debug)]
pub struct StepReport {
    pub seq_no: u64,
    pub outcome: StepOutcome,
    pub completed: bool,
}

/// Plan-executing state machine
#[derive(Debug)]
pub struct Vm {
    state: VmState,
    run_state: RunState,
}

impl Vm {
    /// Fresh VM with no plan loaded.
    pub fn new(state: VmState) -> Self {
        let run_state = if state.plan.is_empty() {
            RunState::Idle
        } else {
            RunState::Running
        };
        Self { state, run_state }
    }

    /// Reconstruct a VM from a commit snapshot.
    pub fn from_snapshot(state: VmState) -> Self {
        let run_state = if state.goal_completed {
            RunState::Completed
        } else if state.last_error.is_some() {
            RunState::Errored
        } else if state.plan.is_empty() {
            RunState::Idle
        } else {
            RunState::Running
        };
        Self { state, run_state }
    }

    pub fn state(&self) -> &VmState {
        &self.state
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn is_completed(&self) -> bool {
        self.run_state == RunState::Completed
    }

    pub fn is_errored(&self) -> bool {
        self.run_state == RunState::Errored
    }

    /// Load a plan and position the counter at its first instruction.
    ///
    /// Variables survive a reload so a patched plan can keep working with
    /// what earlier steps produced.
    pub fn load(&mut self, plan: Plan) -> Result<()> {
        if plan.is_empty() {
            return Err(VmError::Malformed("cannot load an empty plan".into()));
        }
        self.state.program_counter = plan.first_seq().expect("non-empty plan");
        self.state.plan = plan;
        self.state.last_error = None;
        self.state.goal_completed = false;
        self.run_state = RunState::Running;
        Ok(())
    }

    /// The instruction the program counter points at, `None` at terminal.
    pub fn current_instruction(&self) -> Option<&Instruction> {
        self.state.plan.get(self.state.program_counter)
    }

    /// Move the counter to `pc` and clear any captured error.
    pub fn reset(&mut self, pc: u64) -> Result<()> {
        if !self.state.plan.is_valid_pc(pc) {
            return Err(VmError::Internal(format!(
                "{} is neither a seq_no in the plan nor the terminal sentinel",
                pc
            )));
        }
        self.state.program_counter = pc;
        self.state.last_error = None;
        if self.state.at_terminal() {
            self.state.goal_completed = self.state.variables.contains(FINAL_ANSWER);
            self.run_state = RunState::Completed;
        } else {
            self.state.goal_completed = false;
            self.run_state = RunState::Running;
        }
        Ok(())
    }

    /// Execute the current instruction and advance.
    ///
    /// Per-instruction failures are captured into `last_error` and reported
    /// on the outcome; they never propagate as `Err`. `Err` is reserved for
    /// stepping a VM that has nothing to execute.
    pub async fn step(
        &mut self,
        registry: &ToolRegistry,
        namespace: &Namespace,
        judge: &dyn ConditionJudge,
    ) -> Result<StepReport> {
        if self.run_state == RunState::Idle {
            return Err(VmError::Internal("no plan loaded".into()));
        }
        if self.run_state == RunState::Completed || self.run_state == RunState::Errored {
            return Err(VmError::Internal(format!(
                "cannot step a VM in state {:?}",
                self.run_state
            )));
        }

        let instruction = self
            .current_instruction()
            .ok_or_else(|| {
                VmError::Internal(format!(
                    "program counter {} has no instruction",
                    self.state.program_counter
                ))
            })?
            .clone();
        let seq_no = instruction.seq_no;

        // Cooperative suspension points: the awaiting states are observable
        // while the external call is in flight.
        self.run_state = match instruction.body {
            InstructionBody::Calling(_) => RunState::AwaitingTool,
            InstructionBody::Jmp(ref jmp) if jmp.condition_prompt.is_some() => {
                RunState::AwaitingLlm
            }
            _ => RunState::Running,
        };

        let outcome = dispatch(
            &self.state.plan,
            &self.state.variables,
            &instruction,
            registry,
            namespace,
            judge,
        )
        .await;

        if let Some(error) = &outcome.error {
            debug!(seq_no, error = %error, "instruction failed");
            self.state.last_error = Some(error.to_record(Some(seq_no)));
            self.run_state = RunState::Errored;
            return Ok(StepReport { seq_no, outcome, completed: false });
        }

        self.state.variables.apply(outcome.writes.clone())?;
        self.state.program_counter = outcome.next_pc;
        self.state.last_error = None;

        let completed = self.state.at_terminal();
        if completed {
            self.state.goal_completed = self.state.variables.contains(FINAL_ANSWER);
            self.run_state = RunState::Completed;
        } else {
            self.run_state = RunState::Running;
        }

        Ok(StepReport { seq_no, outcome, completed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ConditionVerdict;
    use serde_json::json;

    struct NeverJudge;

    #[async_trait::async_trait]
    impl ConditionJudge for NeverJudge {
        async fn judge(
            &self,
            _prompt: &str,
            _context: Option<&str>,
        ) -> Result<ConditionVerdict> {
            Err(VmError::Internal("no judge in this test".into()))
        }
    }

    fn fixture() -> (ToolRegistry, Namespace) {
        let registry = ToolRegistry::new();
        let namespace = Namespace::new("default", vec![]);
        (registry, namespace)
    }

    #[tokio::test]
    async fn trivial_plan_runs_to_completion() {
        let (registry, namespace) = fixture();
        let mut vm = Vm::new(VmState::new("say hello", "default"));
        assert_eq!(vm.run_state(), RunState::Idle);

        vm.load(
            Plan::parse(r#"[{"seq_no":0,"type":"assign","parameters":{"final_answer":"hello"}}]"#)
                .unwrap(),
        )
        .unwrap();

        let report = vm.step(&registry, &namespace, &NeverJudge).await.unwrap();
        assert!(report.completed);
        assert!(vm.is_completed());
        assert!(vm.state().goal_completed);
        assert_eq!(vm.state().variables.get("final_answer").unwrap(), &json!("hello"));
    }

    #[tokio::test]
    async fn arithmetic_chain_preserves_number_types() {
        let (registry, namespace) = fixture();
        let mut vm = Vm::new(VmState::new("compute", "default"));
        vm.load(
            Plan::parse(
                r#"[
                    {"seq_no":0,"type":"assign","parameters":{"a":3}},
                    {"seq_no":1,"type":"assign","parameters":{"b":"${a} * 2 + 1"}},
                    {"seq_no":2,"type":"assign","parameters":{"final_answer":"${b}"}}
                ]"#,
            )
            .unwrap(),
        )
        .unwrap();

        while !vm.is_completed() {
            vm.step(&registry, &namespace, &NeverJudge).await.unwrap();
        }
        assert_eq!(vm.state().variables.get("a").unwrap(), &json!(3));
        assert_eq!(vm.state().variables.get("b").unwrap(), &json!(7));
        assert_eq!(vm.state().variables.get("final_answer").unwrap(), &json!(7));
    }

    #[tokio::test]
    async fn failed_instruction_leaves_pc_and_captures_error() {
        let (registry, namespace) = fixture();
        let mut vm = Vm::new(VmState::new("swap", "default"));
        vm.load(
            Plan::parse(
                r#"[
                    {"seq_no":0,"type":"assign","parameters":{"x":10}},
                    {"seq_no":1,"type":"assign","parameters":{"y":"${x}","x":"${y}"}}
                ]"#,
            )
            .unwrap(),
        )
        .unwrap();

        vm.step(&registry, &namespace, &NeverJudge).await.unwrap();
        let report = vm.step(&registry, &namespace, &NeverJudge).await.unwrap();
        assert!(vm.is_errored());
        assert!(report.outcome.error.is_some());
        assert_eq!(vm.state().program_counter, 1);
        let record = vm.state().last_error.as_ref().unwrap();
        assert_eq!(record.kind, crate::error::ErrorKind::UnresolvedVariable);
        assert_eq!(record.seq_no, Some(1));
        // The pre-state is untouched.
        assert_eq!(vm.state().variables.get("x").unwrap(), &json!(10));
        assert!(!vm.state().variables.contains("y"));
    }

    #[tokio::test]
    async fn reset_clears_error_and_resumes() {
        let (registry, namespace) = fixture();
        let mut vm = Vm::new(VmState::new("resume", "default"));
        vm.load(
            Plan::parse(
                r#"[
                    {"seq_no":0,"type":"assign","parameters":{"bad":"${nope} + 1"}},
                    {"seq_no":1,"type":"assign","parameters":{"final_answer":"ok"}}
                ]"#,
            )
            .unwrap(),
        )
        .unwrap();

        vm.step(&registry, &namespace, &NeverJudge).await.unwrap();
        assert!(vm.is_errored());

        vm.reset(1).unwrap();
        assert_eq!(vm.run_state(), RunState::Running);
        let report = vm.step(&registry, &namespace, &NeverJudge).await.unwrap();
        assert!(report.completed);
    }

    #[test]
    fn snapshot_round_trip_restores_run_state() {
        let mut state = VmState::new("goal", "default");
        state.plan = Plan::parse(
            r#"[{"seq_no":0,"type":"assign","parameters":{"final_answer":"x"}}]"#,
        )
        .unwrap();
        state.program_counter = 1;
        state.goal_completed = true;
        state
            .variables
            .set("final_answer", json!("x"))
            .unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let restored: VmState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
        let vm = Vm::from_snapshot(restored);
        assert!(vm.is_completed());
    }

    #[test]
    fn reset_rejects_invalid_pc() {
        let mut vm = Vm::new(VmState::new("goal", "default"));
        vm.load(
            Plan::parse(r#"[{"seq_no":0,"type":"assign","parameters":{"final_answer":"x"}}]"#)
                .unwrap(),
        )
        .unwrap();
        assert!(vm.reset(5).is_err());
        assert!(vm.reset(1).is_ok());
        assert!(vm.reset(0).is_ok());
    }
}
