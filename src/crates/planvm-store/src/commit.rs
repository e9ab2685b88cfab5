//! Commit and task records
//!
//! A commit is an immutable snapshot of VM state plus metadata. Its hash is
//! a SHA-256 over the canonical JSON of the record minus the hash field, so
//! two reads of the same commit can never disagree about its content.

use crate::canon::to_canonical_json;
use chrono::{DateTime, Utc};
use planvm_core::{ErrorRecord, VmState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// How a commit came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitType {
    /// Root commit of a task, empty VM plus the chosen namespace
    Initial,
    /// One executed instruction
    StepExecution,
    /// A plan was generated or regenerated in place
    PlanUpdate,
    /// First commit on a forked branch; its parent lives on the
    /// originating branch
    Fork,
    /// Externally triggered commit (cancellation, manual intervention)
    Manual,
}

/// Inputs, outputs and diff recorded alongside a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitDetails {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input_parameters: Value,
    /// Subset of the variable store that changed in this step
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_variables: BTreeMap<String, Value>,
    /// Textual line diff against the previous snapshot, advisory only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub diff: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

/// Immutable record on a branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub commit_hash: String,
    pub parent_hash: Option<String>,
    pub task_id: Uuid,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_no: Option<u64>,
    pub time: DateTime<Utc>,
    pub message: String,
    pub commit_type: CommitType,
    pub title: String,
    pub details: CommitDetails,
    pub vm_state_snapshot: VmState,
}

impl Commit {
    pub fn builder(task_id: Uuid, branch: impl Into<String>, commit_type: CommitType) -> CommitBuilder {
        CommitBuilder {
            parent_hash: None,
            task_id,
            branch: branch.into(),
            seq_no: None,
            time: None,
            message: String::new(),
            commit_type,
            title: String::new(),
            details: CommitDetails::default(),
            vm_state_snapshot: None,
        }
    }

    /// Content hash over every field except `commit_hash` and `title`.
    pub fn compute_hash(&self) -> String {
        let content = json!({
            "parent_hash": self.parent_hash,
            "task_id": self.task_id,
            "branch": self.branch,
            "seq_no": self.seq_no,
            "time": self.time,
            "message": self.message,
            "commit_type": self.commit_type,
            "details": self.details,
            "vm_state_snapshot": self.vm_state_snapshot,
        });
        let canonical = to_canonical_json(&content);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex(&hasher.finalize())
    }

    /// Check the stored hash against the content.
    pub fn verify(&self) -> bool {
        self.commit_hash == self.compute_hash()
    }

    /// Canonical serialization of the snapshot, used for diffs and the
    /// snapshot-replay equivalence tests.
    pub fn canonical_snapshot(&self) -> String {
        let value = serde_json::to_value(&self.vm_state_snapshot).expect("snapshot serialization");
        to_canonical_json(&value)
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Builder for commits; `build()` stamps the time and computes the hash.
pub struct CommitBuilder {
    parent_hash: Option<String>,
    task_id: Uuid,
    branch: String,
    seq_no: Option<u64>,
    time: Option<DateTime<Utc>>,
    message: String,
    commit_type: CommitType,
    title: String,
    details: CommitDetails,
    vm_state_snapshot: Option<VmState>,
}

impl CommitBuilder {
    pub fn parent(mut self, parent_hash: impl Into<String>) -> Self {
        self.parent_hash = Some(parent_hash.into());
        self
    }

    pub fn seq_no(mut self, seq_no: u64) -> Self {
        self.seq_no = Some(seq_no);
        self
    }

    /// Override the commit time; defaults to now.
    pub fn time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn details(mut self, details: CommitDetails) -> Self {
        self.details = details;
        self
    }

    pub fn snapshot(mut self, snapshot: VmState) -> Self {
        self.vm_state_snapshot = Some(snapshot);
        self
    }

    pub fn build(self) -> Commit {
        let mut commit = Commit {
            commit_hash: String::new(),
            parent_hash: self.parent_hash,
            task_id: self.task_id,
            branch: self.branch,
            seq_no: self.seq_no,
            time: self.time.unwrap_or_else(Utc::now),
            message: self.message,
            commit_type: self.commit_type,
            title: self.title,
            details: self.details,
            vm_state_snapshot: self
                .vm_state_snapshot
                .unwrap_or_else(|| VmState::new("", "")),
        };
        commit.commit_hash = commit.compute_hash();
        commit
    }
}

/// Task metadata row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub goal: String,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub branches: Vec<String>,
    pub active_branch: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl TaskRecord {
    pub fn new(goal: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            goal: goal.into(),
            namespace: namespace.into(),
            created_at: Utc::now(),
            branches: vec!["main".to_string()],
            active_branch: "main".to_string(),
            labels: Vec::new(),
        }
    }
}

/// Branch listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSummary {
    pub name: String,
    pub head_hash: Option<String>,
    pub commit_count: u64,
}

/// Branch names are path- and table-safe identifiers.
pub fn validate_branch_name(name: &str) -> crate::error::Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(crate::error::StoreError::Invalid(format!(
            "invalid branch name '{}'",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_commit() -> Commit {
        let mut snapshot = VmState::new("answer the question", "default");
        snapshot.variables.set("x", json!(1)).unwrap();
        Commit::builder(Uuid::nil(), "main", CommitType::StepExecution)
            .seq_no(0)
            .message("step 0")
            .title("assign x")
            .snapshot(snapshot)
            .time("2024-05-01T00:00:00Z".parse().unwrap())
            .build()
    }

    #[test]
    fn hash_is_stable_and_verifiable() {
        let a = sample_commit();
        let b = sample_commit();
        assert_eq!(a.commit_hash, b.commit_hash);
        assert!(a.verify());
    }

    #[test]
    fn hash_changes_with_content() {
        let a = sample_commit();
        let mut b = sample_commit();
        b.message = "different".into();
        assert_ne!(a.commit_hash, b.compute_hash());
        assert!(!b.verify());
    }

    #[test]
    fn commit_round_trips_through_json() {
        let commit = sample_commit();
        let json = serde_json::to_string(&commit).unwrap();
        let back: Commit = serde_json::from_str(&json).unwrap();
        assert_eq!(back, commit);
        assert!(back.verify());
    }

    #[test]
    fn branch_names_are_restricted() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("recover-1").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("../escape").is_err());
        assert!(validate_branch_name("with space").is_err());
    }
}
