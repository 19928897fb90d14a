//! Error taxonomy shared by the sync services.
//!
//! `AccessDenied` is surfaced to the client as a prompt and never retried.
//! `NotFound` is usually a benign race (a room or object vanished between a
//! read and a write) and callers may treat it as a no-op. `Transport` wraps
//! backend failures and is the only retryable kind.

use crate::services::access::DenyReason;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("access denied: {0}")]
    AccessDenied(DenyReason),
    #[error("{0} not found")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(#[from] StoreError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("malformed record at {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SyncError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl crate::frame::ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AccessDenied(_) => "E_ACCESS_DENIED",
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::Transport(_) => "E_TRANSPORT",
            Self::Validation(_) => "E_VALIDATION",
            Self::Malformed { .. } => "E_MALFORMED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
