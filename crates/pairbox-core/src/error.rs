use crate::protocol::FrameError;
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),
    #[error("malformed agent payload: {0}")]
    MalformedAgentPayload(String),
    #[error("path already exists: {path}")]
    TreeConflict { path: String },
    #[error("file not found: {path}")]
    FileNotFound { path: String },
    #[error("invalid path: {path}")]
    InvalidPath { path: String },
    #[error("invalid project id: {0:?}")]
    InvalidProject(String),
    #[error("sandbox {operation} failed: {reason}")]
    SandboxOperationFailed {
        operation: &'static str,
        reason: String,
    },
    #[error("cannot {action} while sandbox is {state}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },
    #[error("persistence write to {target} failed: {reason}")]
    PersistenceWriteFailed {
        target: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl SyncError {
    pub fn sandbox(operation: &'static str, reason: impl Display) -> Self {
        Self::SandboxOperationFailed {
            operation,
            reason: reason.to_string(),
        }
    }

    pub fn persistence(target: &'static str, reason: impl Display) -> Self {
        Self::PersistenceWriteFailed {
            target,
            reason: reason.to_string(),
        }
    }

    /// Local precondition failures the caller is expected to handle, as
    /// opposed to I/O failures that are only logged.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SyncError::TreeConflict { .. }
                | SyncError::FileNotFound { .. }
                | SyncError::InvalidPath { .. }
                | SyncError::InvalidProject(_)
                | SyncError::InvalidTransition { .. }
        )
    }
}
