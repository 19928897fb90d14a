//! Sync services — access gate, presence, objects, rooms, chat, sessions.
//!
//! ARCHITECTURE
//! ============
//! Every service is a set of free functions over a [`SyncContext`]. The
//! context is built once at startup and handed down explicitly; services
//! never reach for global handles. Pure decisions (access, geometry,
//! visibility) live in functions without I/O so they test without a store.

pub mod access;
pub mod chat;
pub mod export;
pub mod geo;
pub mod object;
pub mod persistence;
pub mod presence;
pub mod room;
pub mod session;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::SyncError;
use crate::store::Store;
use presence::Palette;

// =============================================================================
// CONTEXT
// =============================================================================

/// Dependencies of the sync layer: the store and the presence palette.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn Store>,
    pub palette: Palette,
}

impl SyncContext {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, palette: Palette) -> Self {
        Self { store, palette }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
pub(crate) fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

/// Reject ids that would escape their path segment.
pub(crate) fn validate_id(what: &str, id: &str) -> Result<(), SyncError> {
    if id.is_empty() || id.contains('/') || id.chars().any(char::is_control) {
        return Err(SyncError::validation(format!("invalid {what} id: {id:?}")));
    }
    Ok(())
}

/// Decode a single record.
pub(crate) fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, SyncError> {
    serde_json::from_value(value).map_err(|source| SyncError::Malformed { path: path.to_owned(), source })
}

/// Decode every child of a collection snapshot, keyed by child key. A
/// malformed child is logged and skipped so one bad record cannot blank a
/// whole snapshot.
pub(crate) fn decode_children<T: DeserializeOwned>(path: &str, snapshot: Option<Value>) -> Vec<(String, T)> {
    let Some(Value::Object(children)) = snapshot else {
        return Vec::new();
    };
    children
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_value(value) {
            Ok(record) => Some((key, record)),
            Err(e) => {
                warn!(path, %key, error = %e, "skipping malformed record");
                None
            }
        })
        .collect()
}
