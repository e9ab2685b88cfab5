//! Storage abstraction for commits and branches
//!
//! Two interchangeable backends implement this trait: a filesystem store
//! (per-task directories with line-delimited JSON logs) and a SQLite store.
//! Both are strongly consistent within a single task: `head` after a
//! successful `append` returns exactly that commit, and history is
//! append-only. Commits are never rewritten; divergence always goes through
//! `fork`.

use crate::commit::{BranchSummary, Commit, TaskRecord};
use crate::error::Result;
use async_trait::async_trait;
use planvm_core::Namespace;
use uuid::Uuid;

/// Append-only, content-addressed storage of VM states arranged as named
/// branches per task.
#[async_trait]
pub trait BranchStore: Send + Sync {
    /// Create a task with an empty `main` branch.
    async fn create_task(&self, goal: &str, namespace: &str) -> Result<TaskRecord>;

    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord>;

    /// Tasks in reverse creation order.
    async fn list_tasks(&self, limit: u32, offset: u32) -> Result<Vec<TaskRecord>>;

    /// Head commit of a branch, `None` for a branch with no commits yet.
    async fn head(&self, task_id: Uuid, branch: &str) -> Result<Option<Commit>>;

    /// Append a commit to its branch.
    ///
    /// The commit's `parent_hash` must equal the current head (or be `None`
    /// on an empty branch), and the stored hash must match the content.
    async fn append(&self, commit: &Commit) -> Result<()>;

    /// Create `new_branch` sharing history with `source` up to and
    /// including `at_hash`. The new branch's head equals the fork point
    /// until something is appended.
    async fn fork(&self, task_id: Uuid, source: &str, at_hash: &str, new_branch: &str)
        -> Result<()>;

    async fn list_branches(&self, task_id: Uuid) -> Result<Vec<BranchSummary>>;

    /// Commits of a branch in append order.
    async fn list_commits(&self, task_id: Uuid, branch: &str) -> Result<Vec<Commit>>;

    async fn get_commit(&self, task_id: Uuid, hash: &str) -> Result<Commit>;

    /// Delete a branch. Rejected for `main`.
    async fn delete_branch(&self, task_id: Uuid, branch: &str) -> Result<()>;

    async fn set_active_branch(&self, task_id: Uuid, branch: &str) -> Result<()>;

    /// Acquire the per-task advisory lock. Fails fast when another owner
    /// holds it; callers may re-queue the task.
    async fn try_lock_task(&self, task_id: Uuid, owner: &str) -> Result<()>;

    /// Release the advisory lock. Only the owner may release.
    async fn unlock_task(&self, task_id: Uuid, owner: &str) -> Result<()>;

    async fn save_namespace(&self, namespace: &Namespace) -> Result<()>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;

    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Attach a free-form label to a task. Creating the label on first use.
    async fn add_task_label(&self, task_id: Uuid, label: &str) -> Result<()>;

    async fn task_labels(&self, task_id: Uuid) -> Result<Vec<String>>;
}
