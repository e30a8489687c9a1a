//! Error taxonomy for workflow and ledger operations
use crate::types::{Action, RequestStatus};

#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("actor may not {action:?} while the request is {status:?}")]
    PermissionDenied {
        action: Action,
        status: RequestStatus,
    },
    #[error("{action:?} is not a legal transition from {status:?}")]
    InvalidTransition {
        action: Action,
        status: RequestStatus,
    },
    #[error("insufficient quantity of {item}: requested {requested}, available {available}")]
    InsufficientQuantity {
        item: String,
        requested: u64,
        available: u64,
    },
    /// Idempotent no-op. Reported distinctly from success so callers can
    /// tell a replayed action link from a fresh one.
    #[error("already processed: {0}")]
    AlreadyProcessed(String),
    #[error("validation failed: {0}")]
    Validation(String),
    /// Concurrent mutation lost the race. Safe to retry with the same
    /// parameters.
    #[error("concurrent mutation conflict, retry the operation")]
    Conflict,
    #[error("rate limit exceeded for actor {0}")]
    RateLimited(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Fieldless error classification for the uniform action envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PermissionDenied,
    InvalidTransition,
    InsufficientQuantity,
    AlreadyProcessed,
    Validation,
    Conflict,
    RateLimited,
    NotFound,
    Storage,
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            WorkflowError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            WorkflowError::InsufficientQuantity { .. } => ErrorKind::InsufficientQuantity,
            WorkflowError::AlreadyProcessed(_) => ErrorKind::AlreadyProcessed,
            WorkflowError::Validation(_) => ErrorKind::Validation,
            WorkflowError::Conflict => ErrorKind::Conflict,
            WorkflowError::RateLimited(_) => ErrorKind::RateLimited,
            WorkflowError::NotFound(_) => ErrorKind::NotFound,
            WorkflowError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether the caller may retry with the same parameters.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::Conflict | WorkflowError::RateLimited(_)
        )
    }
}

impl From<sled::Error> for WorkflowError {
    fn from(e: sled::Error) -> Self {
        WorkflowError::Storage(e.to_string())
    }
}

impl From<minicbor::decode::Error> for WorkflowError {
    fn from(e: minicbor::decode::Error) -> Self {
        WorkflowError::Storage(e.to_string())
    }
}
