//! Error types for the Lifeline engine.

use crate::{OperationId, OperationStatus};
use thiserror::Error;

/// All possible errors from the Lifeline engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Lookup errors
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("conflict record not found: {0}")]
    ConflictNotFound(String),

    #[error("operation already exists: {0}")]
    DuplicateOperation(OperationId),

    // State machine errors
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("attempts may only grow by one per attempt: current {current}, requested {requested}")]
    AttemptsRegression { current: u32, requested: u32 },

    #[error("operation {id} cannot be cancelled while {status}")]
    NotCancellable {
        id: OperationId,
        status: OperationStatus,
    },

    #[error("conflict record {0} is already resolved")]
    AlreadyResolved(String),

    // Capacity errors
    #[error("queue is full: {0}")]
    QueueFull(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Whether this error was caused by a malformed request rather than engine state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::MissingRequiredField(_) | Error::TypeMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
