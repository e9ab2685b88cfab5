//! The execution engine
//!
//! Drives the full task lifecycle: create the task and its `main` branch,
//! generate and validate an initial plan, step the VM to completion with a
//! commit per instruction, and recover from failures by forking a branch at
//! the faulty commit with a repaired plan. Dynamic updates and single-step
//! optimization reuse the same fork-and-resume machinery.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::planner::PlanGenerator;
use crate::worker::CancellationToken;
use planvm_core::{
    validate::ensure_valid, ConditionJudge, ErrorRecord, InstructionBody, Namespace, Plan,
    ResponseFormat, ToolRegistry, VariableStore, Vm, VmError, VmState, FINAL_ANSWER,
};
use planvm_store::{
    diff_lines, to_canonical_json, BranchStore, Commit, CommitDetails, CommitType, StoreError,
    TaskRecord,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Final state of one engine run over a task
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub branch: String,
    pub goal_completed: bool,
    pub final_answer: Option<Value>,
    pub error: Option<ErrorRecord>,
}

pub struct ExecutionEngine {
    store: Arc<dyn BranchStore>,
    registry: Arc<ToolRegistry>,
    planner: Arc<dyn PlanGenerator>,
    judge: Arc<dyn ConditionJudge>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn BranchStore>,
        registry: Arc<ToolRegistry>,
        planner: Arc<dyn PlanGenerator>,
        judge: Arc<dyn ConditionJudge>,
        config: EngineConfig,
    ) -> Self {
        Self { store, registry, planner, judge, config }
    }

    pub fn store(&self) -> &Arc<dyn BranchStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Resolve a namespace name against the store, falling back to an
    /// all-tools namespace for the default name.
    pub async fn namespace_for(&self, name: &str) -> Result<Namespace> {
        match self.store.get_namespace(name).await? {
            Some(namespace) => Ok(namespace),
            None if name == "default" => Ok(Namespace::open(&self.registry)),
            None => Err(EngineError::Config(format!(
                "namespace '{}' is not defined",
                name
            ))),
        }
    }

    /// Create a task with its `main` branch and the `Initial` commit
    /// containing an empty VM and the chosen namespace.
    pub async fn start_task(
        &self,
        goal: &str,
        namespace: &str,
        response_format: ResponseFormat,
    ) -> Result<TaskRecord> {
        self.namespace_for(namespace).await?;
        let task = self.store.create_task(goal, namespace).await?;
        let state = VmState::new(goal, namespace).with_response_format(response_format);
        let commit = self.build_commit(
            task.task_id,
            "main",
            CommitType::Initial,
            None,
            None,
            "task created",
            "initial",
            CommitDetails::default(),
            &state,
        )?;
        self.store.append(&commit).await?;
        info!(task_id = %task.task_id, goal, "task started");
        Ok(task)
    }

    /// Convenience wrapper: start a task and run it to a terminal state.
    pub async fn execute_goal(
        &self,
        goal: &str,
        namespace: &str,
        response_format: ResponseFormat,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome> {
        let task = self.start_task(goal, namespace, response_format).await?;
        self.run_task(task.task_id, cancel).await
    }

    /// Run a task on its active branch until completion, a terminal error
    /// or cancellation. Holds the per-task advisory lock for the duration;
    /// a concurrent run of the same task fails fast with a lock error.
    pub async fn run_task(
        &self,
        task_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome> {
        let owner = format!("worker-{}", Uuid::new_v4());
        self.store.try_lock_task(task_id, &owner).await?;
        let result = self.run_locked(task_id, cancel).await;
        if let Err(e) = self.store.unlock_task(task_id, &owner).await {
            warn!(task_id = %task_id, error = %e, "failed to release task lock");
        }
        result
    }

    async fn run_locked(
        &self,
        task_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome> {
        let task = self.store.get_task(task_id).await?;
        let namespace = self.namespace_for(&task.namespace).await?;
        let mut branch = task.active_branch.clone();
        let mut head = self
            .store
            .head(task_id, &branch)
            .await?
            .ok_or_else(|| {
                EngineError::Vm(VmError::Internal(format!(
                    "branch '{}' has no initial commit",
                    branch
                )))
            })?;
        let mut vm = Vm::from_snapshot(head.vm_state_snapshot.clone());

        // Generate the initial plan if this task has none yet.
        if vm.state().plan.is_empty() {
            let response_format = vm.state().response_format.clone();
            let plan = match self
                .validated_generate(&task, &response_format, &namespace)
                .await
            {
                Ok(plan) => plan,
                Err(e) => {
                    self.write_failure_commit(&mut head, &branch, &vm, &e).await?;
                    return Err(e);
                }
            };
            vm.load(plan)?;
            let commit = self.build_commit(
                task_id,
                &branch,
                CommitType::PlanUpdate,
                Some(&head),
                None,
                "initial plan generated",
                "plan update",
                CommitDetails {
                    input_parameters: json!({ "goal": task.goal }),
                    ..Default::default()
                },
                vm.state(),
            )?;
            self.store.append(&commit).await?;
            head = commit;
        }

        let mut recovery_attempts = 0u32;
        loop {
            // The cancellation signal is polled before every dispatch.
            if cancel.is_cancelled() {
                let mut state = vm.state().clone();
                state.last_error = Some(VmError::Cancelled.to_record(None));
                let commit = self.build_commit(
                    task_id,
                    &branch,
                    CommitType::Manual,
                    Some(&head),
                    None,
                    "execution cancelled",
                    "cancelled",
                    CommitDetails {
                        error: state.last_error.clone(),
                        ..Default::default()
                    },
                    &state,
                )?;
                self.store.append(&commit).await?;
                return Err(EngineError::Cancelled(task_id));
            }

            if vm.is_completed() {
                break;
            }

            if vm.is_errored() {
                match self
                    .recover(task_id, &mut branch, &mut head, &mut vm, recovery_attempts, &namespace)
                    .await?
                {
                    true => {
                        recovery_attempts += 1;
                        continue;
                    }
                    false => break,
                }
            }

            let pre_vars = vm.state().variables.clone();
            let report = vm
                .step(&self.registry, &namespace, self.judge.as_ref())
                .await?;
            let title = self.instruction_title(vm.state(), report.seq_no);
            let details = CommitDetails {
                input_parameters: report.outcome.input_parameters.clone(),
                output_variables: vm.state().variables.changed_since(&pre_vars),
                warnings: report.outcome.warnings.clone(),
                error: report
                    .outcome
                    .error
                    .as_ref()
                    .map(|e| e.to_record(Some(report.seq_no))),
                ..Default::default()
            };
            let commit = self.build_commit(
                task_id,
                &branch,
                CommitType::StepExecution,
                Some(&head),
                Some(report.seq_no),
                format!("executed instruction {}", report.seq_no),
                title,
                details,
                vm.state(),
            )?;
            self.store.append(&commit).await?;
            head = commit;
        }

        Ok(self.outcome(task_id, branch, vm.state()))
    }

    /// Attempt one recovery: ask the updater for a patch, fork a branch at
    /// the faulty commit, resume there. Returns false when giving up.
    async fn recover(
        &self,
        task_id: Uuid,
        branch: &mut String,
        head: &mut Commit,
        vm: &mut Vm,
        attempts_so_far: u32,
        namespace: &Namespace,
    ) -> Result<bool> {
        let record = vm
            .state()
            .last_error
            .clone()
            .ok_or_else(|| EngineError::Vm(VmError::Internal("errored VM without error".into())))?;

        if record.kind == planvm_core::ErrorKind::Cancelled
            || record.kind == planvm_core::ErrorKind::InternalError
        {
            return Ok(false);
        }
        if attempts_so_far >= self.config.max_recovery_attempts {
            warn!(task_id = %task_id, attempts = attempts_so_far, "recovery budget exhausted");
            return Ok(false);
        }

        let failing = record.seq_no.unwrap_or(vm.state().program_counter);
        let summary = format!(
            "instruction {} failed with {:?}: {}",
            failing, record.kind, record.message
        );
        info!(task_id = %task_id, failing, attempt = attempts_so_far + 1, "attempting recovery");

        let patched = match self
            .validated_update(&vm.state().plan, failing, &summary, &vm.state().variables, namespace)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "plan updater gave up");
                return Ok(false);
            }
        };

        let new_branch = self.unique_branch_name(task_id, "recover").await?;
        self.store
            .fork(task_id, branch, &head.commit_hash, &new_branch)
            .await?;
        self.store.set_active_branch(task_id, &new_branch).await?;

        *vm = Vm::from_snapshot(head.vm_state_snapshot.clone());
        vm.load(patched)?;
        vm.reset(resume_pc(&vm.state().plan, failing))?;

        let commit = self.build_commit(
            task_id,
            &new_branch,
            CommitType::Fork,
            Some(head),
            Some(failing),
            format!("plan repaired after failure at instruction {}", failing),
            "recovery fork",
            CommitDetails {
                input_parameters: json!({
                    "error_summary": summary,
                    "attempt": attempts_so_far + 1,
                }),
                ..Default::default()
            },
            vm.state(),
        )?;
        self.store.append(&commit).await?;
        *head = commit;
        *branch = new_branch;
        Ok(true)
    }

    /// Apply a natural-language plan patch at a commit: fork an `update-N`
    /// branch there, load the patched plan, and leave the branch active so
    /// the next `run_task` resumes it.
    pub async fn dynamic_update(
        &self,
        task_id: Uuid,
        at_hash: &str,
        suggestion: &str,
    ) -> Result<String> {
        self.fork_with_patch(task_id, at_hash, suggestion, "update", None).await
    }

    /// Rewrite a single step at a commit; changes are restricted to the
    /// given `seq_no` and its local parameters.
    pub async fn optimize_step(
        &self,
        task_id: Uuid,
        at_hash: &str,
        seq_no: u64,
        suggestion: &str,
    ) -> Result<String> {
        self.fork_with_patch(task_id, at_hash, suggestion, "optimize", Some(seq_no))
            .await
    }

    async fn fork_with_patch(
        &self,
        task_id: Uuid,
        at_hash: &str,
        suggestion: &str,
        prefix: &str,
        only_seq_no: Option<u64>,
    ) -> Result<String> {
        let task = self.store.get_task(task_id).await?;
        let namespace = self.namespace_for(&task.namespace).await?;
        let commit = self.store.get_commit(task_id, at_hash).await?;
        let state = &commit.vm_state_snapshot;
        let at_seq = commit.seq_no.unwrap_or(state.program_counter);

        let patched = match only_seq_no {
            Some(seq_no) => {
                self.validated_optimize(&state.plan, seq_no, suggestion, &state.variables, &namespace)
                    .await?
            }
            None => {
                self.validated_update(&state.plan, at_seq, suggestion, &state.variables, &namespace)
                    .await?
            }
        };

        let new_branch = self.unique_branch_name(task_id, prefix).await?;
        self.store
            .fork(task_id, &commit.branch, at_hash, &new_branch)
            .await?;
        self.store.set_active_branch(task_id, &new_branch).await?;

        let mut vm = Vm::from_snapshot(state.clone());
        vm.load(patched)?;
        vm.reset(resume_pc(&vm.state().plan, state.program_counter))?;

        let fork_commit = self.build_commit(
            task_id,
            &new_branch,
            CommitType::Fork,
            Some(&commit),
            commit.seq_no,
            format!("plan updated from suggestion at {}", &at_hash[..12.min(at_hash.len())]),
            "dynamic update",
            CommitDetails {
                input_parameters: json!({ "suggestion": suggestion }),
                ..Default::default()
            },
            vm.state(),
        )?;
        self.store.append(&fork_commit).await?;
        info!(task_id = %task_id, branch = %new_branch, "plan patched on fork");
        Ok(new_branch)
    }

    async fn validated_generate(
        &self,
        task: &TaskRecord,
        response_format: &ResponseFormat,
        namespace: &Namespace,
    ) -> Result<Plan> {
        let catalog = self.registry.catalog(namespace);
        let mut hint: Option<String> = None;
        let mut last_summary = String::new();

        for _ in 0..=self.config.max_validation_retries {
            let plan = self
                .planner
                .generate(&task.goal, &namespace.name, response_format, &catalog, hint.as_deref())
                .await?;
            match ensure_valid(&plan, &self.registry, namespace) {
                Ok(()) => return Ok(plan),
                Err(VmError::Validation { summary, .. }) => {
                    warn!(task_id = %task.task_id, %summary, "generated plan failed validation");
                    hint = Some(format!(
                        "The previous plan failed validation: {}. Fix every issue.",
                        summary
                    ));
                    last_summary = summary;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::ValidationExhausted {
            attempts: self.config.max_validation_retries + 1,
            summary: last_summary,
        })
    }

    async fn validated_update(
        &self,
        plan: &Plan,
        failing_seq_no: u64,
        summary: &str,
        variables: &VariableStore,
        namespace: &Namespace,
    ) -> Result<Plan> {
        let mut feedback = summary.to_string();
        let mut last_summary = String::new();

        for _ in 0..=self.config.max_validation_retries {
            let plan = self
                .planner
                .update(plan, failing_seq_no, &feedback, variables)
                .await?;
            match ensure_valid(&plan, &self.registry, namespace) {
                Ok(()) => return Ok(plan),
                Err(VmError::Validation { summary: issues, .. }) => {
                    feedback = format!(
                        "{}\nThe previous patch failed validation: {}. Fix every issue.",
                        summary, issues
                    );
                    last_summary = issues;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::ValidationExhausted {
            attempts: self.config.max_validation_retries + 1,
            summary: last_summary,
        })
    }

    async fn validated_optimize(
        &self,
        plan: &Plan,
        seq_no: u64,
        suggestion: &str,
        variables: &VariableStore,
        namespace: &Namespace,
    ) -> Result<Plan> {
        let mut feedback = suggestion.to_string();
        let mut last_summary = String::new();

        for _ in 0..=self.config.max_validation_retries {
            let patched = self
                .planner
                .optimize_step(plan, seq_no, &feedback, variables)
                .await?;
            if !only_step_changed(plan, &patched, seq_no) {
                feedback = format!(
                    "{}\nOnly instruction seq_no {} may change; every other instruction must stay identical.",
                    suggestion, seq_no
                );
                last_summary = format!("instructions other than seq_no {} were modified", seq_no);
                continue;
            }
            match ensure_valid(&patched, &self.registry, namespace) {
                Ok(()) => return Ok(patched),
                Err(VmError::Validation { summary: issues, .. }) => {
                    feedback = format!(
                        "{}\nThe previous rewrite failed validation: {}. Fix every issue.",
                        suggestion, issues
                    );
                    last_summary = issues;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::ValidationExhausted {
            attempts: self.config.max_validation_retries + 1,
            summary: last_summary,
        })
    }

    async fn unique_branch_name(&self, task_id: Uuid, prefix: &str) -> Result<String> {
        let branches = self.store.list_branches(task_id).await?;
        let mut n = 1;
        loop {
            let name = format!("{}-{}", prefix, n);
            if !branches.iter().any(|b| b.name == name) {
                return Ok(name);
            }
            n += 1;
        }
    }

    /// Terminal commit for failures that happen outside a step, such as an
    /// exhausted plan-generation budget.
    async fn write_failure_commit(
        &self,
        head: &mut Commit,
        branch: &str,
        vm: &Vm,
        error: &EngineError,
    ) -> Result<()> {
        let record = ErrorRecord {
            kind: match error {
                EngineError::ValidationExhausted { .. } => planvm_core::ErrorKind::ValidationError,
                _ => planvm_core::ErrorKind::InternalError,
            },
            message: error.to_string(),
            seq_no: None,
            details: Value::Null,
        };
        let mut state = vm.state().clone();
        state.last_error = Some(record.clone());
        let commit = self.build_commit(
            head.task_id,
            branch,
            CommitType::StepExecution,
            Some(head),
            None,
            "plan generation failed",
            "failure",
            CommitDetails { error: Some(record), ..Default::default() },
            &state,
        )?;
        self.store.append(&commit).await?;
        *head = commit;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_commit(
        &self,
        task_id: Uuid,
        branch: &str,
        commit_type: CommitType,
        parent: Option<&Commit>,
        seq_no: Option<u64>,
        message: impl Into<String>,
        title: impl Into<String>,
        mut details: CommitDetails,
        state: &VmState,
    ) -> Result<Commit> {
        if let Some(parent) = parent {
            let old = parent.canonical_snapshot();
            let new = to_canonical_json(&serde_json::to_value(state).map_err(StoreError::from)?);
            details.diff = diff_lines(&old, &new);
        }

        let mut builder = Commit::builder(task_id, branch, commit_type)
            .message(message)
            .title(title)
            .details(details)
            .snapshot(state.clone());
        if let Some(parent) = parent {
            builder = builder.parent(parent.commit_hash.clone());
        }
        if let Some(seq_no) = seq_no {
            builder = builder.seq_no(seq_no);
        }
        Ok(builder.build())
    }

    fn instruction_title(&self, state: &VmState, seq_no: u64) -> String {
        match state.plan.get(seq_no).map(|i| &i.body) {
            Some(InstructionBody::Reasoning(_)) => "reasoning".to_string(),
            Some(InstructionBody::Assign(writes)) => {
                let names: Vec<&str> = writes.keys().map(String::as_str).collect();
                format!("assign {}", names.join(", "))
            }
            Some(InstructionBody::Calling(call)) => format!("calling {}", call.tool_name),
            Some(InstructionBody::Jmp(_)) => "jmp".to_string(),
            None => format!("instruction {}", seq_no),
        }
    }

    fn outcome(&self, task_id: Uuid, branch: String, state: &VmState) -> TaskOutcome {
        TaskOutcome {
            task_id,
            branch,
            goal_completed: state.goal_completed,
            final_answer: state.variables.lookup(FINAL_ANSWER).cloned(),
            error: state.last_error.clone(),
        }
    }
}

/// Where to resume after loading a patched plan: the failing instruction if
/// the patch kept its seq_no, otherwise the next one after it.
fn resume_pc(plan: &Plan, failing: u64) -> u64 {
    if plan.contains(failing) {
        failing
    } else {
        plan.seq_after(failing).unwrap_or_else(|| plan.terminal_pc())
    }
}

/// Every instruction except `seq_no` must be unchanged between the two
/// plans.
fn only_step_changed(original: &Plan, patched: &Plan, seq_no: u64) -> bool {
    if original.len() != patched.len() {
        return false;
    }
    original.instructions.iter().all(|inst| {
        if inst.seq_no == seq_no {
            patched.contains(seq_no)
        } else {
            patched.get(inst.seq_no) == Some(inst)
        }
    })
}
