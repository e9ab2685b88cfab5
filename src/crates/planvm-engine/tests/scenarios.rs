//! End-to-end engine scenarios over scripted planners, tools and judges.

mod common;

use common::{fixture, fixture_with, register, BrokenTool, StaticJudge, StaticTool};
use planvm_core::{ErrorKind, Namespace, Plan, ResponseFormat, ToolRegistry, Vm};
use planvm_engine::{CancellationToken, EngineError};
use planvm_store::{to_canonical_json, BranchStore, CommitType, StoreError};
use serde_json::json;
use std::sync::Arc;

fn canonical(state: &planvm_core::VmState) -> String {
    to_canonical_json(&serde_json::to_value(state).unwrap())
}

#[tokio::test]
async fn trivial_completion() {
    let fx = fixture();
    fx.planner
        .push_generation(r#"[{"seq_no":0,"type":"assign","parameters":{"final_answer":"hello"}}]"#);

    let outcome = fx
        .engine
        .execute_goal("say hello", "default", ResponseFormat::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.goal_completed);
    assert_eq!(outcome.final_answer, Some(json!("hello")));

    let commits = fx
        .store
        .list_commits(outcome.task_id, "main")
        .await
        .unwrap();
    let steps: Vec<_> = commits
        .iter()
        .filter(|c| c.commit_type == CommitType::StepExecution)
        .collect();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].seq_no, Some(0));
    assert!(steps[0].vm_state_snapshot.goal_completed);
}

#[tokio::test]
async fn arithmetic_assign_preserves_numbers() {
    let fx = fixture();
    fx.planner.push_generation(
        r#"[
            {"seq_no":0,"type":"assign","parameters":{"a":3}},
            {"seq_no":1,"type":"assign","parameters":{"b":"${a} * 2 + 1"}},
            {"seq_no":2,"type":"assign","parameters":{"final_answer":"${b}"}}
        ]"#,
    );

    let outcome = fx
        .engine
        .execute_goal("compute", "default", ResponseFormat::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.goal_completed);
    assert_eq!(outcome.final_answer, Some(json!(7)));

    let head = fx
        .store
        .head(outcome.task_id, "main")
        .await
        .unwrap()
        .unwrap();
    let vars = &head.vm_state_snapshot.variables;
    assert_eq!(vars.get("a").unwrap(), &json!(3));
    assert_eq!(vars.get("b").unwrap(), &json!(7));
}

#[tokio::test]
async fn tool_call_binds_keyed_outputs() {
    let mut registry = ToolRegistry::new();
    register(
        &mut registry,
        "mock_summarize",
        Arc::new(StaticTool(json!({"summary": "s", "insights": "i"}))),
    );
    let fx = fixture_with(registry, Arc::new(StaticJudge(true)));
    fx.planner.push_generation(
        r#"[
            {"seq_no":0,"type":"calling","parameters":{"tool_name":"mock_summarize","tool_params":{"query":"x"},"output_vars":["summary","insights"]}},
            {"seq_no":1,"type":"assign","parameters":{"final_answer":"${summary}|${insights}"}}
        ]"#,
    );

    let outcome = fx
        .engine
        .execute_goal("summarize", "default", ResponseFormat::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.final_answer, Some(json!("s|i")));

    // The step commit records interpolated inputs and changed variables.
    let commits = fx
        .store
        .list_commits(outcome.task_id, "main")
        .await
        .unwrap();
    let call_step = commits
        .iter()
        .find(|c| c.seq_no == Some(0) && c.commit_type == CommitType::StepExecution)
        .unwrap();
    assert_eq!(call_step.details.input_parameters["tool_name"], json!("mock_summarize"));
    assert_eq!(call_step.details.output_variables["summary"], json!("s"));
}

#[tokio::test]
async fn conditional_jump_moves_pc_to_the_true_branch() {
    let plan = Plan::parse(
        r#"[
            {"seq_no":0,"type":"assign","parameters":{"n":4}},
            {"seq_no":1,"type":"jmp","parameters":{"condition_prompt":"is ${n} even","jump_if_true":10,"jump_if_false":20}},
            {"seq_no":10,"type":"assign","parameters":{"final_answer":"even"}},
            {"seq_no":20,"type":"assign","parameters":{"final_answer":"odd"}}
        ]"#,
    )
    .unwrap();

    let registry = ToolRegistry::new();
    let namespace = Namespace::open(&registry);
    let mut vm = Vm::new(planvm_core::VmState::new("parity", "default"));
    vm.load(plan).unwrap();

    vm.step(&registry, &namespace, &StaticJudge(true)).await.unwrap();
    let report = vm.step(&registry, &namespace, &StaticJudge(true)).await.unwrap();

    assert_eq!(report.seq_no, 1);
    assert_eq!(vm.state().program_counter, 10);
    assert_eq!(report.outcome.input_parameters["condition_prompt"], json!("is 4 even"));
}

#[tokio::test]
async fn recovery_forks_a_branch_and_completes_there() {
    let mut registry = ToolRegistry::new();
    register(&mut registry, "broken_tool", Arc::new(BrokenTool));
    let fx = fixture_with(registry, Arc::new(StaticJudge(true)));
    fx.planner.push_generation(
        r#"[
            {"seq_no":0,"type":"assign","parameters":{"q":"start"}},
            {"seq_no":5,"type":"calling","parameters":{"tool_name":"broken_tool","tool_params":{"query":"${q}"},"output_vars":"data"}},
            {"seq_no":6,"type":"assign","parameters":{"final_answer":"${data}"}}
        ]"#,
    );
    fx.planner.push_patch(
        r#"[
            {"seq_no":0,"type":"assign","parameters":{"q":"start"}},
            {"seq_no":5,"type":"assign","parameters":{"data":"recovered"}},
            {"seq_no":6,"type":"assign","parameters":{"final_answer":"${data}"}}
        ]"#,
    );

    let outcome = fx
        .engine
        .execute_goal("survive a tool failure", "default", ResponseFormat::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.goal_completed);
    assert_eq!(outcome.branch, "recover-1");
    assert_eq!(outcome.final_answer, Some(json!("recovered")));

    // main still ends at the faulty commit; it is never rewritten.
    let main = fx
        .store
        .list_commits(outcome.task_id, "main")
        .await
        .unwrap();
    let main_head = main.last().unwrap();
    assert_eq!(main_head.seq_no, Some(5));
    let error = main_head.details.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::ToolFailed);

    // recover-1 shares history up to the faulty commit, then diverges with
    // a Fork commit carrying the patched plan.
    let recovered = fx
        .store
        .list_commits(outcome.task_id, "recover-1")
        .await
        .unwrap();
    let fork_index = main.len();
    assert_eq!(&recovered[..fork_index], &main[..]);
    assert_eq!(recovered[fork_index].commit_type, CommitType::Fork);
    assert_eq!(
        recovered[fork_index].parent_hash.as_deref(),
        Some(main_head.commit_hash.as_str())
    );
    let head = recovered.last().unwrap();
    assert!(head.vm_state_snapshot.goal_completed);
}

#[tokio::test]
async fn atomic_assign_fails_with_unresolved_variable() {
    let fx = fixture();
    fx.planner.push_generation(
        r#"[
            {"seq_no":0,"type":"assign","parameters":{"x":10}},
            {"seq_no":1,"type":"assign","parameters":{"y":"${x}","x":"${y}","final_answer":"${x}"}}
        ]"#,
    );

    let outcome = fx
        .engine
        .execute_goal("swap", "default", ResponseFormat::default(), &CancellationToken::new())
        .await
        .unwrap();

    // No swap semantics: the right-hand sides read the pre-state, so the
    // read of y fails the instruction.
    assert!(!outcome.goal_completed);
    let error = outcome.error.unwrap();
    assert_eq!(error.kind, ErrorKind::UnresolvedVariable);
    assert_eq!(error.seq_no, Some(1));

    let head = fx
        .store
        .head(outcome.task_id, fx.store.get_task(outcome.task_id).await.unwrap().active_branch.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.vm_state_snapshot.variables.get("x").unwrap(), &json!(10));
}

#[tokio::test]
async fn cancellation_writes_a_manual_commit() {
    let fx = fixture();
    fx.planner
        .push_generation(r#"[{"seq_no":0,"type":"assign","parameters":{"final_answer":"never"}}]"#);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let task = fx
        .engine
        .start_task("cancelled before it begins", "default", ResponseFormat::default())
        .await
        .unwrap();
    let err = fx.engine.run_task(task.task_id, &cancel).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled(_)));

    let commits = fx.store.list_commits(task.task_id, "main").await.unwrap();
    let head = commits.last().unwrap();
    assert_eq!(head.commit_type, CommitType::Manual);
    assert_eq!(
        head.vm_state_snapshot.last_error.as_ref().unwrap().kind,
        ErrorKind::Cancelled
    );
}

#[tokio::test]
async fn concurrent_runs_of_one_task_fail_fast() {
    let fx = fixture();
    fx.planner
        .push_generation(r#"[{"seq_no":0,"type":"assign","parameters":{"final_answer":"x"}}]"#);

    let task = fx
        .engine
        .start_task("locked", "default", ResponseFormat::default())
        .await
        .unwrap();
    fx.store.try_lock_task(task.task_id, "other-worker").await.unwrap();

    let err = fx
        .engine
        .run_task(task.task_id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::Locked { .. })));

    fx.store.unlock_task(task.task_id, "other-worker").await.unwrap();
    let outcome = fx
        .engine
        .run_task(task.task_id, &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.goal_completed);
}

#[tokio::test]
async fn dynamic_update_forks_and_resumes() {
    let fx = fixture();
    fx.planner
        .push_generation(r#"[{"seq_no":0,"type":"assign","parameters":{"final_answer":"first"}}]"#);

    let outcome = fx
        .engine
        .execute_goal("revise me", "default", ResponseFormat::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.final_answer, Some(json!("first")));

    // Patch at the plan commit, then resume on the fork.
    let commits = fx
        .store
        .list_commits(outcome.task_id, "main")
        .await
        .unwrap();
    let plan_commit = commits
        .iter()
        .find(|c| c.commit_type == CommitType::PlanUpdate)
        .unwrap();
    fx.planner
        .push_patch(r#"[{"seq_no":0,"type":"assign","parameters":{"final_answer":"second"}}]"#);

    let branch = fx
        .engine
        .dynamic_update(outcome.task_id, &plan_commit.commit_hash, "answer differently")
        .await
        .unwrap();
    assert_eq!(branch, "update-1");
    assert_eq!(
        fx.store.get_task(outcome.task_id).await.unwrap().active_branch,
        "update-1"
    );

    let resumed = fx
        .engine
        .run_task(outcome.task_id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.branch, "update-1");
    assert_eq!(resumed.final_answer, Some(json!("second")));
}

#[tokio::test]
async fn optimize_step_rejects_out_of_scope_rewrites() {
    let fx = fixture();
    fx.planner.push_generation(
        r#"[
            {"seq_no":0,"type":"assign","parameters":{"greeting":"hello"}},
            {"seq_no":1,"type":"assign","parameters":{"final_answer":"${greeting}"}}
        ]"#,
    );
    let outcome = fx
        .engine
        .execute_goal("greet", "default", ResponseFormat::default(), &CancellationToken::new())
        .await
        .unwrap();

    let head = fx
        .store
        .head(outcome.task_id, "main")
        .await
        .unwrap()
        .unwrap();

    // Every scripted patch rewrites more than the requested step, so the
    // optimizer exhausts its validation budget.
    for _ in 0..3 {
        fx.planner.push_patch(
            r#"[
                {"seq_no":0,"type":"assign","parameters":{"greeting":"hi"}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"changed"}}
            ]"#,
        );
    }
    let err = fx
        .engine
        .optimize_step(outcome.task_id, &head.commit_hash, 0, "say hi instead")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValidationExhausted { .. }));

    // A patch confined to the step goes through.
    fx.planner.push_patch(
        r#"[
            {"seq_no":0,"type":"assign","parameters":{"greeting":"hi"}},
            {"seq_no":1,"type":"assign","parameters":{"final_answer":"${greeting}"}}
        ]"#,
    );
    let branch = fx
        .engine
        .optimize_step(outcome.task_id, &head.commit_hash, 0, "say hi instead")
        .await
        .unwrap();
    assert_eq!(branch, "optimize-1");
}

#[tokio::test]
async fn validation_feedback_retries_then_surfaces() {
    let fx = fixture();
    // First two plans jump nowhere; the third never arrives because the
    // default budget is two retries after the first attempt.
    for _ in 0..3 {
        fx.planner.push_generation(
            r#"[
                {"seq_no":0,"type":"jmp","parameters":{"target_seq":99}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"x"}}
            ]"#,
        );
    }
    let err = fx
        .engine
        .execute_goal("unplannable", "default", ResponseFormat::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValidationExhausted { attempts: 3, .. }));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn snapshot_replay_reproduces_each_commit() {
    let fx = fixture();
    fx.planner.push_generation(
        r#"[
            {"seq_no":0,"type":"assign","parameters":{"a":3}},
            {"seq_no":1,"type":"assign","parameters":{"b":"${a} * 2 + 1"}},
            {"seq_no":2,"type":"assign","parameters":{"final_answer":"${b}"}}
        ]"#,
    );
    let outcome = fx
        .engine
        .execute_goal("replay", "default", ResponseFormat::default(), &CancellationToken::new())
        .await
        .unwrap();

    let commits = fx
        .store
        .list_commits(outcome.task_id, "main")
        .await
        .unwrap();
    let namespace = Namespace::open(fx.engine.registry());

    for pair in commits.windows(2) {
        if pair[1].commit_type != CommitType::StepExecution {
            continue;
        }
        let mut vm = Vm::from_snapshot(pair[0].vm_state_snapshot.clone());
        vm.step(fx.engine.registry(), &namespace, &StaticJudge(true))
            .await
            .unwrap();
        assert_eq!(canonical(vm.state()), pair[1].canonical_snapshot());
    }
}
