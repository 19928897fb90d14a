//! Path-addressed store — the realtime substrate every service talks to.
//!
//! DESIGN
//! ======
//! The store is a JSON tree addressed by `/`-separated paths. Services only
//! ever use the primitives on [`Store`]: `read`, partial `write`, ordered
//! `append`, `delete`, `subscribe`, and the per-connection disconnect hooks.
//! Any backend that honors these semantics can sit under the sync layer;
//! [`memory::MemoryStore`] is the embedded one, made durable by the
//! persistence task.
//!
//! SEMANTICS
//! =========
//! - Writes to one path are atomic and last-writer-wins.
//! - `null` deletes. Empty objects are pruned, so a deleted subtree reads
//!   back as `None`.
//! - `append` keys sort lexicographically in insertion order.
//! - Subscriptions deliver whole snapshots of the subscribed path and only
//!   when the snapshot actually changed.

pub mod memory;
pub mod paths;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

/// Identifies one transport-level client link. Disconnect hooks are scoped to it.
pub type ConnectionId = Uuid;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("patch for {0} must be a JSON object")]
    NotAnObject(String),
}

impl crate::frame::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidPath(_) => "E_INVALID_PATH",
            Self::NotAnObject(_) => "E_NOT_AN_OBJECT",
        }
    }
}

// =============================================================================
// STORE
// =============================================================================

#[async_trait]
pub trait Store: Send + Sync {
    /// Snapshot of the value at `path`, or `None` if nothing is stored there.
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Apply a partial update. `patch` must be an object whose keys are
    /// relative paths below `path`; `null` values delete.
    async fn write(&self, path: &str, patch: Value) -> Result<(), StoreError>;

    /// Store `value` under a freshly allocated, insertion-ordered child key.
    async fn append(&self, path: &str, value: Value) -> Result<String, StoreError>;

    /// Remove the subtree at `path`. Deleting a missing path is not an error.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Subscribe to snapshots of `path`. The current value is available
    /// immediately through [`Subscription::current`].
    async fn subscribe(&self, path: &str) -> Result<Subscription, StoreError>;

    /// Register a value to be set at `path` when `conn` drops without
    /// cancelling the hook.
    async fn on_disconnect(&self, conn: ConnectionId, path: &str, value: Value) -> Result<(), StoreError>;

    /// Cancel a hook registered with [`Store::on_disconnect`].
    async fn cancel_on_disconnect(&self, conn: ConnectionId, path: &str) -> Result<(), StoreError>;

    /// Called by the transport when `conn` is lost. Fires every hook still
    /// registered for it and returns how many ran.
    async fn disconnect(&self, conn: ConnectionId) -> Result<usize, StoreError>;
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// A live view of one store path. Only the latest snapshot is retained, so a
/// slow reader skips intermediate states but never misses the final one.
pub struct Subscription {
    path: String,
    rx: watch::Receiver<Option<Value>>,
}

impl Subscription {
    #[must_use]
    pub fn new(path: impl Into<String>, rx: watch::Receiver<Option<Value>>) -> Self {
        Self { path: path.into(), rx }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current snapshot. Marks it as seen.
    pub fn current(&mut self) -> Option<Value> {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the next snapshot. Returns `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<Option<Value>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

// =============================================================================
// PATH HELPERS
// =============================================================================

/// Split a path into segments, rejecting empty ones.
pub(crate) fn segments(path: &str) -> Result<Vec<&str>, StoreError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    let segs: Vec<&str> = trimmed.split('/').collect();
    if segs.iter().any(|s| s.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    Ok(segs)
}

/// Whether a change at `changed` can alter the snapshot at `watched`.
pub(crate) fn paths_overlap(watched: &str, changed: &str) -> bool {
    fn is_under(child: &str, parent: &str) -> bool {
        child.len() > parent.len() && child.starts_with(parent) && child.as_bytes()[parent.len()] == b'/'
    }
    watched == changed || is_under(watched, changed) || is_under(changed, watched)
}
