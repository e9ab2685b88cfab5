//! Error types for plan execution
//!
//! Every failure the VM can produce maps onto one of the structured kinds
//! below. Per-instruction failures are captured into an [`ErrorRecord`] and
//! stored on the VM state; they are never propagated as panics.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result type for VM operations
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors raised while parsing, validating or executing a plan
#[derive(Debug, Error)]
pub enum VmError {
    /// Plan failed static validation
    #[error("plan validation failed: {summary}")]
    Validation {
        summary: String,
        issues: Vec<crate::validate::ValidationIssue>,
    },

    /// Reference to a variable that is not bound
    #[error("unresolved variable '{name}'")]
    UnresolvedVariable { name: String },

    /// Tool missing from the registry
    #[error("tool '{name}' not found")]
    ToolNotFound { name: String },

    /// Tool exists but is not visible in the task namespace
    #[error("tool '{name}' is not allowed in namespace '{namespace}'")]
    ToolNotAllowed { name: String, namespace: String },

    /// Tool handler raised
    #[error("tool '{name}' failed: {message}")]
    ToolFailed {
        name: String,
        message: String,
        /// Transient failures (network, service unavailable) are retried once
        transient: bool,
    },

    /// Arithmetic evaluation failed (division by zero, overflow)
    #[error("evaluation error: {0}")]
    Eval(String),

    /// LLM reply could not be parsed to the expected shape
    #[error("could not parse model reply: {message}")]
    LlmParse { message: String },

    /// Per-call deadline exceeded
    #[error("call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// External cancellation
    #[error("execution cancelled")]
    Cancelled,

    /// Instruction is structurally invalid
    #[error("malformed instruction: {0}")]
    Malformed(String),

    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),
}

/// Machine-readable error classification, stable across serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    UnresolvedVariable,
    ToolNotFound,
    ToolNotAllowed,
    ToolFailed,
    LlmParseError,
    Timeout,
    Cancelled,
    InternalError,
}

impl VmError {
    /// Classify into the stable error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Validation { .. } | VmError::Malformed(_) => ErrorKind::ValidationError,
            VmError::UnresolvedVariable { .. } => ErrorKind::UnresolvedVariable,
            VmError::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            VmError::ToolNotAllowed { .. } => ErrorKind::ToolNotAllowed,
            // Evaluation errors fail the instruction the same way a tool
            // failure does.
            VmError::ToolFailed { .. } | VmError::Eval(_) => ErrorKind::ToolFailed,
            VmError::LlmParse { .. } => ErrorKind::LlmParseError,
            VmError::Timeout { .. } => ErrorKind::Timeout,
            VmError::Cancelled => ErrorKind::Cancelled,
            VmError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Whether a single retry is worth attempting before recovery
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VmError::ToolFailed { transient: true, .. } | VmError::Timeout { .. }
        )
    }

    /// Freeze into the serializable record stored on snapshots and commits
    pub fn to_record(&self, seq_no: Option<u64>) -> ErrorRecord {
        let details = match self {
            VmError::Validation { issues, .. } => {
                serde_json::to_value(issues).unwrap_or(Value::Null)
            }
            VmError::ToolFailed { name, transient, .. } => serde_json::json!({
                "tool": name,
                "transient": transient,
            }),
            VmError::ToolNotFound { name } | VmError::ToolNotAllowed { name, .. } => {
                serde_json::json!({ "tool": name })
            }
            VmError::UnresolvedVariable { name } => serde_json::json!({ "variable": name }),
            _ => Value::Null,
        };
        ErrorRecord {
            kind: self.kind(),
            message: self.to_string(),
            seq_no,
            details,
        }
    }
}

/// Serializable error record carried in snapshots and commit details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_no: Option<u64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}
