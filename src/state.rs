//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the sync context (store + palette), the concrete in-memory store
//! for the persistence task, and the optional Postgres pool. Nothing here is
//! lazily initialised: `main` builds it once and every handler receives a
//! clone.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::AppConfig;
use crate::services::SyncContext;
use crate::services::presence::Palette;
use crate::store::memory::MemoryStore;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub sync: SyncContext,
    pub memory: Arc<MemoryStore>,
    /// `None` when `DATABASE_URL` is unset: state lives in memory only.
    pub pool: Option<PgPool>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(memory: Arc<MemoryStore>, pool: Option<PgPool>, config: AppConfig) -> Self {
        let sync = SyncContext::new(memory.clone(), Palette::new(config.palette_seed));
        Self { sync, memory, pool, config: Arc::new(config) }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
