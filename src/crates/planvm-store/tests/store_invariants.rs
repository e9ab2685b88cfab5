//! Invariant suite run against both branch store backends.

use planvm_core::{Namespace, VmState};
use planvm_store::{
    BranchStore, Commit, CommitDetails, CommitType, FsBranchStore, SqliteBranchStore, StoreError,
};
use serde_json::json;

fn snapshot(goal: &str, step: u64) -> VmState {
    let mut state = VmState::new(goal, "default");
    state.program_counter = step;
    state
        .variables
        .set("step", json!(step))
        .expect("valid name");
    state
}

fn step_commit(task: &planvm_store::TaskRecord, parent: Option<&str>, seq_no: u64) -> Commit {
    let mut builder = Commit::builder(task.task_id, "main", CommitType::StepExecution)
        .seq_no(seq_no)
        .message(format!("step {}", seq_no))
        .title(format!("instruction {}", seq_no))
        .details(CommitDetails::default())
        .snapshot(snapshot(&task.goal, seq_no));
    if let Some(parent) = parent {
        builder = builder.parent(parent);
    }
    builder.build()
}

async fn exercise(store: &dyn BranchStore) {
    // Task creation gives an empty main branch.
    let task = store.create_task("test goal", "default").await.unwrap();
    assert_eq!(task.branches, vec!["main"]);
    assert!(store.head(task.task_id, "main").await.unwrap().is_none());

    // Appends chain by parent hash.
    let c0 = step_commit(&task, None, 0);
    store.append(&c0).await.unwrap();
    let c1 = step_commit(&task, Some(&c0.commit_hash), 1);
    store.append(&c1).await.unwrap();
    let c2 = step_commit(&task, Some(&c1.commit_hash), 2);
    store.append(&c2).await.unwrap();

    // head after append returns exactly that commit.
    let head = store.head(task.task_id, "main").await.unwrap().unwrap();
    assert_eq!(head, c2);

    // A wrong parent is a conflict: history is append-only.
    let stale = step_commit(&task, Some(&c0.commit_hash), 3);
    assert!(matches!(
        store.append(&stale).await,
        Err(StoreError::Conflict { .. })
    ));

    // Commit chain integrity: every parent is the previous commit.
    let commits = store.list_commits(task.task_id, "main").await.unwrap();
    assert_eq!(commits.len(), 3);
    assert_eq!(commits[0].parent_hash, None);
    for pair in commits.windows(2) {
        assert_eq!(pair[1].parent_hash.as_deref(), Some(pair[0].commit_hash.as_str()));
        assert!(pair[1].verify());
    }

    // Non-rewrite: re-reading a commit yields identical content.
    let reread = store
        .get_commit(task.task_id, &c1.commit_hash)
        .await
        .unwrap();
    assert_eq!(reread, c1);

    // Fork at c1: the new branch's head equals the fork point.
    store
        .fork(task.task_id, "main", &c1.commit_hash, "recover-1")
        .await
        .unwrap();
    let fork_head = store.head(task.task_id, "recover-1").await.unwrap().unwrap();
    assert_eq!(fork_head.commit_hash, c1.commit_hash);
    let forked = store.list_commits(task.task_id, "recover-1").await.unwrap();
    assert_eq!(forked.len(), 2);

    // Divergence: appending to the fork leaves main untouched.
    let mut diverged = Commit::builder(task.task_id, "recover-1", CommitType::Fork)
        .parent(&c1.commit_hash)
        .message("patched plan after failure")
        .snapshot(snapshot(&task.goal, 1))
        .build();
    store.append(&diverged).await.unwrap();
    assert_eq!(
        store.head(task.task_id, "main").await.unwrap().unwrap(),
        c2
    );
    let recover_head = store.head(task.task_id, "recover-1").await.unwrap().unwrap();
    assert_eq!(recover_head.commit_hash, diverged.commit_hash);

    // Tampered commits are rejected.
    diverged.message = "rewritten".into();
    assert!(matches!(
        store.append(&diverged).await,
        Err(StoreError::Invalid(_))
    ));

    // Branch management.
    let branches = store.list_branches(task.task_id).await.unwrap();
    assert_eq!(branches.len(), 2);
    store
        .set_active_branch(task.task_id, "recover-1")
        .await
        .unwrap();
    assert_eq!(
        store.get_task(task.task_id).await.unwrap().active_branch,
        "recover-1"
    );
    assert!(matches!(
        store.delete_branch(task.task_id, "main").await,
        Err(StoreError::ProtectedBranch)
    ));
    store.delete_branch(task.task_id, "recover-1").await.unwrap();
    assert_eq!(
        store.get_task(task.task_id).await.unwrap().active_branch,
        "main"
    );

    // Advisory lock is exclusive and owner-checked.
    store.try_lock_task(task.task_id, "worker-a").await.unwrap();
    assert!(matches!(
        store.try_lock_task(task.task_id, "worker-b").await,
        Err(StoreError::Locked { .. })
    ));
    assert!(store.unlock_task(task.task_id, "worker-b").await.is_err());
    store.unlock_task(task.task_id, "worker-a").await.unwrap();
    store.try_lock_task(task.task_id, "worker-b").await.unwrap();
    store.unlock_task(task.task_id, "worker-b").await.unwrap();

    // Namespaces round-trip.
    let ns = Namespace {
        name: "kg_only".into(),
        description: "knowledge graph tools".into(),
        allowed_tools: vec!["retrieve_knowledge_graph".into()],
    };
    store.save_namespace(&ns).await.unwrap();
    assert_eq!(store.get_namespace("kg_only").await.unwrap(), Some(ns.clone()));
    assert_eq!(store.list_namespaces().await.unwrap().len(), 1);
    store.delete_namespace("kg_only").await.unwrap();
    assert_eq!(store.get_namespace("kg_only").await.unwrap(), None);

    // Labels attach to tasks.
    store.add_task_label(task.task_id, "evaluation").await.unwrap();
    store.add_task_label(task.task_id, "evaluation").await.unwrap();
    assert_eq!(
        store.task_labels(task.task_id).await.unwrap(),
        vec!["evaluation"]
    );

    // Task listing with pagination.
    let other = store.create_task("second goal", "default").await.unwrap();
    let page = store.list_tasks(10, 0).await.unwrap();
    assert_eq!(page.len(), 2);
    let page = store.list_tasks(1, 1).await.unwrap();
    assert_eq!(page.len(), 1);
    let _ = other;
}

#[tokio::test]
async fn filesystem_backend_honours_invariants() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBranchStore::new(dir.path()).unwrap();
    exercise(&store).await;
}

#[tokio::test]
async fn sqlite_backend_honours_invariants() {
    let store = SqliteBranchStore::connect("sqlite::memory:").await.unwrap();
    exercise(&store).await;
}

#[tokio::test]
async fn fork_of_unknown_commit_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBranchStore::new(dir.path()).unwrap();
    let task = store.create_task("goal", "default").await.unwrap();
    assert!(matches!(
        store.fork(task.task_id, "main", "no-such-hash", "other").await,
        Err(StoreError::CommitNotFound(_))
    ));
}

#[tokio::test]
async fn snapshots_serialize_canonically_across_backends() {
    let dir = tempfile::tempdir().unwrap();
    let fs_store = FsBranchStore::new(dir.path()).unwrap();
    let sql_store = SqliteBranchStore::connect("sqlite::memory:").await.unwrap();

    let fs_task = fs_store.create_task("canonical", "default").await.unwrap();
    let sql_task = sql_store.create_task("canonical", "default").await.unwrap();

    let time = "2024-06-01T12:00:00Z".parse().unwrap();
    let build = |task: &planvm_store::TaskRecord| {
        Commit::builder(task.task_id, "main", CommitType::Initial)
            .message("initial")
            .snapshot(snapshot("canonical", 0))
            .time(time)
            .build()
    };
    let fs_commit = build(&fs_task);
    let sql_commit = build(&sql_task);
    fs_store.append(&fs_commit).await.unwrap();
    sql_store.append(&sql_commit).await.unwrap();

    let a = fs_store
        .get_commit(fs_task.task_id, &fs_commit.commit_hash)
        .await
        .unwrap();
    let b = sql_store
        .get_commit(sql_task.task_id, &sql_commit.commit_hash)
        .await
        .unwrap();
    assert_eq!(a.canonical_snapshot(), b.canonical_snapshot());
}
