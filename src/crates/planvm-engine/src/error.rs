//! Engine-level error type
//!
//! Wraps the component errors and adds the lifecycle failures only the
//! engine can produce: exhausted validation retries, exhausted recovery
//! attempts, cancellation.

use planvm_core::VmError;
use planvm_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Vm(#[from] VmError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] llm::LlmError),

    /// Plan generation kept failing validation.
    #[error("plan failed validation after {attempts} attempts: {summary}")]
    ValidationExhausted { attempts: u32, summary: String },

    /// Recovery forked and retried up to the configured bound.
    #[error("recovery gave up after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },

    /// The task's cancellation signal fired.
    #[error("task {0} was cancelled")]
    Cancelled(Uuid),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Map onto the process exit codes of the CLI contract: 2 validation
    /// failure, 3 user cancelled, 4 irrecoverable engine error.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::ValidationExhausted { .. }
            | EngineError::Vm(VmError::Validation { .. })
            | EngineError::Vm(VmError::Malformed(_)) => 2,
            EngineError::Cancelled(_) | EngineError::Vm(VmError::Cancelled) => 3,
            _ => 4,
        }
    }
}
