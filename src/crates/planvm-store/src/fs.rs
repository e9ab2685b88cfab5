//! Filesystem-backed branch store
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/namespaces.json
//! <root>/<task_id>/meta.json
//! <root>/<task_id>/<branch>.log    one JSON commit per line
//! <root>/<task_id>/.lock           advisory lock, content is the owner
//! ```
//!
//! Every write goes through a temp file renamed into place, so a reader
//! never observes a partially written log or metadata file.

use crate::commit::{validate_branch_name, BranchSummary, Commit, TaskRecord};
use crate::error::{Result, StoreError};
use crate::traits::BranchStore;
use async_trait::async_trait;
use planvm_core::Namespace;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Branch store over a directory tree
#[derive(Debug, Clone)]
pub struct FsBranchStore {
    root: PathBuf,
}

impl FsBranchStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn task_dir(&self, task_id: Uuid) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    fn meta_path(&self, task_id: Uuid) -> PathBuf {
        self.task_dir(task_id).join("meta.json")
    }

    fn log_path(&self, task_id: Uuid, branch: &str) -> PathBuf {
        self.task_dir(task_id).join(format!("{}.log", branch))
    }

    fn lock_path(&self, task_id: Uuid) -> PathBuf {
        self.task_dir(task_id).join(".lock")
    }

    fn namespaces_path(&self) -> PathBuf {
        self.root.join("namespaces.json")
    }

    fn read_meta(&self, task_id: Uuid) -> Result<TaskRecord> {
        let path = self.meta_path(task_id);
        if !path.exists() {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    fn write_meta(&self, record: &TaskRecord) -> Result<()> {
        write_atomic(
            &self.meta_path(record.task_id),
            serde_json::to_string_pretty(record)?.as_bytes(),
        )
    }

    fn read_log(&self, task_id: Uuid, branch: &str) -> Result<Vec<Commit>> {
        let path = self.log_path(task_id, branch);
        if !path.exists() {
            return Err(StoreError::BranchNotFound(branch.to_string()));
        }
        let mut commits = Vec::new();
        for line in fs::read_to_string(path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            commits.push(serde_json::from_str(line)?);
        }
        Ok(commits)
    }

    fn write_log(&self, task_id: Uuid, branch: &str, commits: &[Commit]) -> Result<()> {
        let mut content = String::new();
        for commit in commits {
            content.push_str(&serde_json::to_string(commit)?);
            content.push('\n');
        }
        write_atomic(&self.log_path(task_id, branch), content.as_bytes())
    }

    fn read_namespaces(&self) -> Result<BTreeMap<String, Namespace>> {
        let path = self.namespaces_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    fn write_namespaces(&self, namespaces: &BTreeMap<String, Namespace>) -> Result<()> {
        write_atomic(
            &self.namespaces_path(),
            serde_json::to_string_pretty(namespaces)?.as_bytes(),
        )
    }
}

/// Write via a sibling temp file renamed into place.
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl BranchStore for FsBranchStore {
    async fn create_task(&self, goal: &str, namespace: &str) -> Result<TaskRecord> {
        let record = TaskRecord::new(goal, namespace);
        fs::create_dir_all(self.task_dir(record.task_id))?;
        self.write_meta(&record)?;
        self.write_log(record.task_id, "main", &[])?;
        debug!(task_id = %record.task_id, "created task directory");
        Ok(record)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord> {
        self.read_meta(task_id)
    }

    async fn list_tasks(&self, limit: u32, offset: u32) -> Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(task_id) = entry.file_name().to_string_lossy().parse::<Uuid>() else {
                continue;
            };
            if let Ok(record) = self.read_meta(task_id) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn head(&self, task_id: Uuid, branch: &str) -> Result<Option<Commit>> {
        self.read_meta(task_id)?;
        Ok(self.read_log(task_id, branch)?.pop())
    }

    async fn append(&self, commit: &Commit) -> Result<()> {
        if !commit.verify() {
            return Err(StoreError::Invalid(format!(
                "commit {} does not match its content hash",
                commit.commit_hash
            )));
        }
        let meta = self.read_meta(commit.task_id)?;
        if !meta.branches.iter().any(|b| b == &commit.branch) {
            return Err(StoreError::BranchNotFound(commit.branch.clone()));
        }

        let mut commits = self.read_log(commit.task_id, &commit.branch)?;
        let head_hash = commits.last().map(|c| c.commit_hash.clone());
        if commit.parent_hash != head_hash {
            return Err(StoreError::Conflict {
                branch: commit.branch.clone(),
                message: format!(
                    "parent {:?} does not match head {:?}",
                    commit.parent_hash, head_hash
                ),
            });
        }

        commits.push(commit.clone());
        self.write_log(commit.task_id, &commit.branch, &commits)
    }

    async fn fork(
        &self,
        task_id: Uuid,
        source: &str,
        at_hash: &str,
        new_branch: &str,
    ) -> Result<()> {
        validate_branch_name(new_branch)?;
        let mut meta = self.read_meta(task_id)?;
        if meta.branches.iter().any(|b| b == new_branch) {
            return Err(StoreError::BranchExists(new_branch.to_string()));
        }

        let commits = self.read_log(task_id, source)?;
        let cut = commits
            .iter()
            .position(|c| c.commit_hash == at_hash)
            .ok_or_else(|| StoreError::CommitNotFound(at_hash.to_string()))?;

        self.write_log(task_id, new_branch, &commits[..=cut])?;
        meta.branches.push(new_branch.to_string());
        self.write_meta(&meta)
    }

    async fn list_branches(&self, task_id: Uuid) -> Result<Vec<BranchSummary>> {
        let meta = self.read_meta(task_id)?;
        let mut branches = Vec::new();
        for name in &meta.branches {
            let commits = self.read_log(task_id, name)?;
            branches.push(BranchSummary {
                name: name.clone(),
                head_hash: commits.last().map(|c| c.commit_hash.clone()),
                commit_count: commits.len() as u64,
            });
        }
        Ok(branches)
    }

    async fn list_commits(&self, task_id: Uuid, branch: &str) -> Result<Vec<Commit>> {
        self.read_meta(task_id)?;
        self.read_log(task_id, branch)
    }

    async fn get_commit(&self, task_id: Uuid, hash: &str) -> Result<Commit> {
        let meta = self.read_meta(task_id)?;
        for branch in &meta.branches {
            if let Some(commit) = self
                .read_log(task_id, branch)?
                .into_iter()
                .find(|c| c.commit_hash == hash)
            {
                return Ok(commit);
            }
        }
        Err(StoreError::CommitNotFound(hash.to_string()))
    }

    async fn delete_branch(&self, task_id: Uuid, branch: &str) -> Result<()> {
        if branch == "main" {
            return Err(StoreError::ProtectedBranch);
        }
        let mut meta = self.read_meta(task_id)?;
        let Some(index) = meta.branches.iter().position(|b| b == branch) else {
            return Err(StoreError::BranchNotFound(branch.to_string()));
        };
        meta.branches.remove(index);
        if meta.active_branch == branch {
            meta.active_branch = "main".to_string();
        }
        fs::remove_file(self.log_path(task_id, branch))?;
        self.write_meta(&meta)
    }

    async fn set_active_branch(&self, task_id: Uuid, branch: &str) -> Result<()> {
        let mut meta = self.read_meta(task_id)?;
        if !meta.branches.iter().any(|b| b == branch) {
            return Err(StoreError::BranchNotFound(branch.to_string()));
        }
        meta.active_branch = branch.to_string();
        self.write_meta(&meta)
    }

    async fn try_lock_task(&self, task_id: Uuid, owner: &str) -> Result<()> {
        self.read_meta(task_id)?;
        let path = self.lock_path(task_id);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                file.write_all(owner.as_bytes())?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                Err(StoreError::Locked { task_id, owner: holder })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock_task(&self, task_id: Uuid, owner: &str) -> Result<()> {
        let path = self.lock_path(task_id);
        if !path.exists() {
            return Ok(());
        }
        let holder = fs::read_to_string(&path)?;
        if holder != owner {
            return Err(StoreError::Locked { task_id, owner: holder });
        }
        fs::remove_file(path)?;
        Ok(())
    }

    async fn save_namespace(&self, namespace: &Namespace) -> Result<()> {
        let mut namespaces = self.read_namespaces()?;
        namespaces.insert(namespace.name.clone(), namespace.clone());
        self.write_namespaces(&namespaces)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self.read_namespaces()?.get(name).cloned())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        Ok(self.read_namespaces()?.into_values().collect())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut namespaces = self.read_namespaces()?;
        namespaces.remove(name);
        self.write_namespaces(&namespaces)
    }

    async fn add_task_label(&self, task_id: Uuid, label: &str) -> Result<()> {
        let mut meta = self.read_meta(task_id)?;
        if !meta.labels.iter().any(|l| l == label) {
            meta.labels.push(label.to_string());
            self.write_meta(&meta)?;
        }
        Ok(())
    }

    async fn task_labels(&self, task_id: Uuid) -> Result<Vec<String>> {
        Ok(self.read_meta(task_id)?.labels)
    }
}
