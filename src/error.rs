//! Error types for quadlog.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! the failure class: an invalid program shape, a failure while executing,
//! or a failure reported by the storage layer.

use thiserror::Error;

use crate::model::Action;
use crate::storage::{IndexManagerId, StorageError};

/// Validation errors raised before any work is scheduled.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Closure is only allowed for mutation (program '{program}', action {action:?})")]
    ClosureRequiresMutation {
        program: String,
        action: Action,
    },

    #[error("Action {action:?} is not a mutation")]
    MutationRequired {
        action: Action,
    },

    #[error("Parallel program '{program}' can not embed closure operations")]
    ParallelEmbedsClosure {
        program: String,
    },

    #[error("Closure program '{program}' may only contain rules")]
    ClosureContainsProgram {
        program: String,
    },

    #[error("Program '{program}' has an invalid shape: {reason}")]
    InvalidProgramShape {
        program: String,
        reason: String,
    },

    #[error("Rule '{rule}' has an empty tail")]
    EmptyTail {
        rule: String,
    },

    #[error("Rule '{rule}' head variable '{var}' does not appear in the tail")]
    UnboundHeadVariable {
        rule: String,
        var: String,
    },

    #[error("Rule '{rule}' head must name exactly one relation")]
    FusedHead {
        rule: String,
    },

    #[error("Invalid relation name '{name}'")]
    InvalidRelationName {
        name: String,
    },

    #[error("Predicate arity mismatch on '{relation}': expected {expected}, got {actual}")]
    ArityMismatch {
        relation: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid value '{value}' for property '{name}': {reason}")]
    InvalidProperty {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid nexus descriptor: {reason}")]
    InvalidDescriptor {
        reason: String,
    },
}

/// Errors that occur while a step is executing.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Task queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Execution channel disconnected on {path}")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Task '{task}' was cancelled")]
    Cancelled {
        task: String,
    },

    #[error("Task '{task}' failed: {reason}")]
    TaskFailed {
        task: String,
        reason: String,
    },

    #[error("Could not establish read-consistent view: {reason}")]
    Transaction {
        reason: String,
    },

    #[error("Closure of '{program}' did not reach a fixed point within {rounds} rounds")]
    ClosureDiverged {
        program: String,
        rounds: u32,
    },

    #[error("Buffer is closed")]
    BufferClosed,

    #[error("Nexus factory was released before the step could run")]
    FactoryReleased,

    #[error("Index manager {id} was dropped")]
    IndexManagerReleased {
        id: IndexManagerId,
    },
}

/// Top-level error type for quadlog.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum QuadlogError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl QuadlogError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the computation was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Cancelled { .. }))
    }

    /// Returns true if resubmitting the same request could succeed.
    ///
    /// Nothing in quadlog retries on its own; this is a hint for callers.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } | Self::Storage(_) => false,
            Self::Execution(e) => matches!(e, ExecutionError::QueueFull { .. }),
        }
    }
}

/// Result type alias for quadlog operations.
pub type QuadlogResult<T> = Result<T, QuadlogError>;
