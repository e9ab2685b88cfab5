//! Error types for branch storage

use thiserror::Error;
use uuid::Uuid;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in a branch store backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// Task not found
    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    /// Branch not found within a task
    #[error("branch '{0}' not found")]
    BranchNotFound(String),

    /// Commit not found within a task
    #[error("commit {0} not found")]
    CommitNotFound(String),

    /// Branch name already taken within the task
    #[error("branch '{0}' already exists")]
    BranchExists(String),

    /// The main branch cannot be deleted
    #[error("branch 'main' cannot be deleted")]
    ProtectedBranch,

    /// Append-only violation or parent mismatch
    #[error("append conflict on branch '{branch}': {message}")]
    Conflict { branch: String, message: String },

    /// Advisory lock held by another worker
    #[error("task {task_id} is locked by '{owner}'")]
    Locked { task_id: Uuid, owner: String },

    /// Invalid input (branch name, hash format)
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
