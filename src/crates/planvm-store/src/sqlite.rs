//! SQLite-backed branch store
//!
//! Commits are rows keyed by `(task_id, commit_hash)`; branch membership
//! lives in a separate `branch_commits` table so forked branches share
//! their ancestor rows instead of copying them. The schema is created by
//! sequential, idempotent migration statements run at connect time.

use crate::commit::{validate_branch_name, BranchSummary, Commit, TaskRecord};
use crate::error::{Result, StoreError};
use crate::traits::BranchStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use planvm_core::Namespace;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        task_id TEXT PRIMARY KEY,
        goal TEXT NOT NULL,
        namespace TEXT NOT NULL,
        created_at TEXT NOT NULL,
        active_branch TEXT NOT NULL DEFAULT 'main'
    )",
    "CREATE TABLE IF NOT EXISTS branches (
        task_id TEXT NOT NULL,
        name TEXT NOT NULL,
        head_hash TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (task_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS commits (
        task_id TEXT NOT NULL,
        commit_hash TEXT NOT NULL,
        parent_hash TEXT,
        branch TEXT NOT NULL,
        seq_no INTEGER,
        time TEXT NOT NULL,
        commit_type TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (task_id, commit_hash)
    )",
    "CREATE TABLE IF NOT EXISTS branch_commits (
        task_id TEXT NOT NULL,
        branch TEXT NOT NULL,
        position INTEGER NOT NULL,
        commit_hash TEXT NOT NULL,
        PRIMARY KEY (task_id, branch, position)
    )",
    "CREATE INDEX IF NOT EXISTS idx_branch_commits_hash
        ON branch_commits (task_id, commit_hash)",
    "CREATE TABLE IF NOT EXISTS labels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS task_labels (
        task_id TEXT NOT NULL,
        label_id INTEGER NOT NULL,
        PRIMARY KEY (task_id, label_id)
    )",
    "CREATE TABLE IF NOT EXISTS namespaces (
        name TEXT PRIMARY KEY,
        description TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS namespace_tools (
        namespace TEXT NOT NULL,
        tool TEXT NOT NULL,
        PRIMARY KEY (namespace, tool)
    )",
    "CREATE TABLE IF NOT EXISTS task_locks (
        task_id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        locked_at TEXT NOT NULL
    )",
];

/// Branch store over a SQLite database
#[derive(Debug, Clone)]
pub struct SqliteBranchStore {
    pool: SqlitePool,
}

impl SqliteBranchStore {
    /// Connect and migrate. Accepts any sqlx sqlite URI, including
    /// `sqlite::memory:` for tests.
    ///
    /// A single connection serializes writers, which is what the per-task
    /// single-writer model wants anyway.
    pub async fn connect(uri: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(uri)
            .await?;
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&pool).await?;
        }
        info!(uri, "sqlite branch store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn require_task(&self, task_id: Uuid) -> Result<()> {
        let exists = sqlx::query("SELECT 1 FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn branch_head_hash(&self, task_id: Uuid, branch: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT head_hash FROM branches WHERE task_id = ? AND name = ?")
            .bind(task_id.to_string())
            .bind(branch)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::BranchNotFound(branch.to_string()))?;
        Ok(row.get("head_hash"))
    }

    async fn load_task(&self, task_id: Uuid) -> Result<TaskRecord> {
        let row = sqlx::query(
            "SELECT task_id, goal, namespace, created_at, active_branch
             FROM tasks WHERE task_id = ?",
        )
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        let branches: Vec<String> = sqlx::query(
            "SELECT name FROM branches WHERE task_id = ? ORDER BY created_at, name",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| r.get("name"))
        .collect();

        let labels = self.task_labels_inner(task_id).await?;

        Ok(TaskRecord {
            task_id,
            goal: row.get("goal"),
            namespace: row.get("namespace"),
            created_at: parse_time(&row.get::<String, _>("created_at"))?,
            branches,
            active_branch: row.get("active_branch"),
            labels,
        })
    }

    async fn task_labels_inner(&self, task_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT l.name FROM labels l
             JOIN task_labels tl ON tl.label_id = l.id
             WHERE tl.task_id = ? ORDER BY l.name",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("name")).collect())
    }
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    text.parse()
        .map_err(|e| StoreError::Invalid(format!("bad timestamp '{}': {}", text, e)))
}

fn decode_commit(data: &str) -> Result<Commit> {
    Ok(serde_json::from_str(data)?)
}

#[async_trait]
impl BranchStore for SqliteBranchStore {
    async fn create_task(&self, goal: &str, namespace: &str) -> Result<TaskRecord> {
        let record = TaskRecord::new(goal, namespace);
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO tasks (task_id, goal, namespace, created_at, active_branch)
             VALUES (?, ?, ?, ?, 'main')",
        )
        .bind(record.task_id.to_string())
        .bind(&record.goal)
        .bind(&record.namespace)
        .bind(record.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO branches (task_id, name, head_hash, created_at) VALUES (?, 'main', NULL, ?)")
            .bind(record.task_id.to_string())
            .bind(record.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord> {
        self.load_task(task_id).await
    }

    async fn list_tasks(&self, limit: u32, offset: u32) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            "SELECT task_id FROM tasks ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id: String = row.get("task_id");
            let task_id = task_id
                .parse()
                .map_err(|_| StoreError::Invalid(format!("bad task id '{}'", task_id)))?;
            records.push(self.load_task(task_id).await?);
        }
        Ok(records)
    }

    async fn head(&self, task_id: Uuid, branch: &str) -> Result<Option<Commit>> {
        self.require_task(task_id).await?;
        match self.branch_head_hash(task_id, branch).await? {
            Some(hash) => Ok(Some(self.get_commit(task_id, &hash).await?)),
            None => Ok(None),
        }
    }

    async fn append(&self, commit: &Commit) -> Result<()> {
        if !commit.verify() {
            return Err(StoreError::Invalid(format!(
                "commit {} does not match its content hash",
                commit.commit_hash
            )));
        }
        self.require_task(commit.task_id).await?;
        let head = self.branch_head_hash(commit.task_id, &commit.branch).await?;
        if commit.parent_hash != head {
            return Err(StoreError::Conflict {
                branch: commit.branch.clone(),
                message: format!(
                    "parent {:?} does not match head {:?}",
                    commit.parent_hash, head
                ),
            });
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR IGNORE INTO commits
                (task_id, commit_hash, parent_hash, branch, seq_no, time, commit_type, data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(commit.task_id.to_string())
        .bind(&commit.commit_hash)
        .bind(&commit.parent_hash)
        .bind(&commit.branch)
        .bind(commit.seq_no.map(|s| s as i64))
        .bind(commit.time.to_rfc3339())
        .bind(serde_json::to_string(&commit.commit_type)?)
        .bind(serde_json::to_string(commit)?)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO branch_commits (task_id, branch, position, commit_hash)
             VALUES (?, ?, (SELECT COUNT(*) FROM branch_commits WHERE task_id = ? AND branch = ?), ?)",
        )
        .bind(commit.task_id.to_string())
        .bind(&commit.branch)
        .bind(commit.task_id.to_string())
        .bind(&commit.branch)
        .bind(&commit.commit_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE branches SET head_hash = ? WHERE task_id = ? AND name = ?")
            .bind(&commit.commit_hash)
            .bind(commit.task_id.to_string())
            .bind(&commit.branch)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fork(
        &self,
        task_id: Uuid,
        source: &str,
        at_hash: &str,
        new_branch: &str,
    ) -> Result<()> {
        validate_branch_name(new_branch)?;
        self.require_task(task_id).await?;
        // Source must exist; this also surfaces BranchNotFound early.
        self.branch_head_hash(task_id, source).await?;

        let exists = sqlx::query("SELECT 1 FROM branches WHERE task_id = ? AND name = ?")
            .bind(task_id.to_string())
            .bind(new_branch)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_some() {
            return Err(StoreError::BranchExists(new_branch.to_string()));
        }

        let cut = sqlx::query(
            "SELECT position FROM branch_commits
             WHERE task_id = ? AND branch = ? AND commit_hash = ?",
        )
        .bind(task_id.to_string())
        .bind(source)
        .bind(at_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::CommitNotFound(at_hash.to_string()))?
        .get::<i64, _>("position");

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO branches (task_id, name, head_hash, created_at) VALUES (?, ?, ?, ?)")
            .bind(task_id.to_string())
            .bind(new_branch)
            .bind(at_hash)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        // Forked branches share ancestor commit rows; only membership is
        // copied.
        sqlx::query(
            "INSERT INTO branch_commits (task_id, branch, position, commit_hash)
             SELECT task_id, ?, position, commit_hash FROM branch_commits
             WHERE task_id = ? AND branch = ? AND position <= ?",
        )
        .bind(new_branch)
        .bind(task_id.to_string())
        .bind(source)
        .bind(cut)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_branches(&self, task_id: Uuid) -> Result<Vec<BranchSummary>> {
        self.require_task(task_id).await?;
        let rows = sqlx::query(
            "SELECT b.name, b.head_hash,
                    (SELECT COUNT(*) FROM branch_commits bc
                      WHERE bc.task_id = b.task_id AND bc.branch = b.name) AS commit_count
             FROM branches b WHERE b.task_id = ?
             ORDER BY b.created_at, b.name",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| BranchSummary {
                name: r.get("name"),
                head_hash: r.get("head_hash"),
                commit_count: r.get::<i64, _>("commit_count") as u64,
            })
            .collect())
    }

    async fn list_commits(&self, task_id: Uuid, branch: &str) -> Result<Vec<Commit>> {
        self.require_task(task_id).await?;
        self.branch_head_hash(task_id, branch).await?;
        let rows = sqlx::query(
            "SELECT c.data FROM branch_commits bc
             JOIN commits c ON c.task_id = bc.task_id AND c.commit_hash = bc.commit_hash
             WHERE bc.task_id = ? AND bc.branch = ?
             ORDER BY bc.position",
        )
        .bind(task_id.to_string())
        .bind(branch)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| decode_commit(&r.get::<String, _>("data")))
            .collect()
    }

    async fn get_commit(&self, task_id: Uuid, hash: &str) -> Result<Commit> {
        let row = sqlx::query("SELECT data FROM commits WHERE task_id = ? AND commit_hash = ?")
            .bind(task_id.to_string())
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::CommitNotFound(hash.to_string()))?;
        decode_commit(&row.get::<String, _>("data"))
    }

    async fn delete_branch(&self, task_id: Uuid, branch: &str) -> Result<()> {
        if branch == "main" {
            return Err(StoreError::ProtectedBranch);
        }
        self.require_task(task_id).await?;
        self.branch_head_hash(task_id, branch).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM branch_commits WHERE task_id = ? AND branch = ?")
            .bind(task_id.to_string())
            .bind(branch)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM branches WHERE task_id = ? AND name = ?")
            .bind(task_id.to_string())
            .bind(branch)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE tasks SET active_branch = 'main' WHERE task_id = ? AND active_branch = ?")
            .bind(task_id.to_string())
            .bind(branch)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_active_branch(&self, task_id: Uuid, branch: &str) -> Result<()> {
        self.require_task(task_id).await?;
        self.branch_head_hash(task_id, branch).await?;
        sqlx::query("UPDATE tasks SET active_branch = ? WHERE task_id = ?")
            .bind(branch)
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_lock_task(&self, task_id: Uuid, owner: &str) -> Result<()> {
        self.require_task(task_id).await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO task_locks (task_id, owner, locked_at) VALUES (?, ?, ?)",
        )
        .bind(task_id.to_string())
        .bind(owner)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 0 {
            let holder: String = sqlx::query("SELECT owner FROM task_locks WHERE task_id = ?")
                .bind(task_id.to_string())
                .fetch_one(&self.pool)
                .await?
                .get("owner");
            return Err(StoreError::Locked { task_id, owner: holder });
        }
        Ok(())
    }

    async fn unlock_task(&self, task_id: Uuid, owner: &str) -> Result<()> {
        let removed = sqlx::query("DELETE FROM task_locks WHERE task_id = ? AND owner = ?")
            .bind(task_id.to_string())
            .bind(owner)
            .execute(&self.pool)
            .await?;
        if removed.rows_affected() == 0 {
            if let Some(row) = sqlx::query("SELECT owner FROM task_locks WHERE task_id = ?")
                .bind(task_id.to_string())
                .fetch_optional(&self.pool)
                .await?
            {
                return Err(StoreError::Locked {
                    task_id,
                    owner: row.get("owner"),
                });
            }
        }
        Ok(())
    }

    async fn save_namespace(&self, namespace: &Namespace) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO namespaces (name, description) VALUES (?, ?)
             ON CONFLICT (name) DO UPDATE SET description = excluded.description",
        )
        .bind(&namespace.name)
        .bind(&namespace.description)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM namespace_tools WHERE namespace = ?")
            .bind(&namespace.name)
            .execute(&mut *tx)
            .await?;
        for tool in &namespace.allowed_tools {
            sqlx::query("INSERT INTO namespace_tools (namespace, tool) VALUES (?, ?)")
                .bind(&namespace.name)
                .bind(tool)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let Some(row) = sqlx::query("SELECT name, description FROM namespaces WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let tools: Vec<String> =
            sqlx::query("SELECT tool FROM namespace_tools WHERE namespace = ? ORDER BY tool")
                .bind(name)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|r| r.get("tool"))
                .collect();
        Ok(Some(Namespace {
            name: row.get("name"),
            description: row.get("description"),
            allowed_tools: tools,
        }))
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let names: Vec<String> = sqlx::query("SELECT name FROM namespaces ORDER BY name")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.get("name"))
            .collect();
        let mut namespaces = Vec::with_capacity(names.len());
        for name in names {
            if let Some(ns) = self.get_namespace(&name).await? {
                namespaces.push(ns);
            }
        }
        Ok(namespaces)
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM namespace_tools WHERE namespace = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM namespaces WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn add_task_label(&self, task_id: Uuid, label: &str) -> Result<()> {
        self.require_task(task_id).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO labels (name) VALUES (?)")
            .bind(label)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT OR IGNORE INTO task_labels (task_id, label_id)
             SELECT ?, id FROM labels WHERE name = ?",
        )
        .bind(task_id.to_string())
        .bind(label)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn task_labels(&self, task_id: Uuid) -> Result<Vec<String>> {
        self.require_task(task_id).await?;
        self.task_labels_inner(task_id).await
    }
}
