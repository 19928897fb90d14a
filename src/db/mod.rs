//! Database initialization, migrations, and store hydration.
//!
//! SYSTEM CONTEXT
//! ==============
//! Startup uses this module to create the shared SQLx pool, enforce schema
//! migrations, and load persisted room documents into the embedded store
//! before accepting websocket/API traffic.

use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::store::memory::MemoryStore;

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

/// Load every persisted document into `memory`. Returns how many loaded.
///
/// # Errors
///
/// Returns an error if the query fails. Rows with unusable paths are
/// skipped with a warning.
pub async fn hydrate_store(pool: &PgPool, memory: &MemoryStore) -> Result<usize, sqlx::Error> {
    let rows: Vec<(String, sqlx::types::Json<Value>)> =
        sqlx::query_as("SELECT path, doc FROM store_documents ORDER BY path")
            .fetch_all(pool)
            .await?;

    let mut loaded = 0;
    for (path, sqlx::types::Json(doc)) in rows {
        match memory.load_document(&path, doc).await {
            Ok(()) => loaded += 1,
            Err(e) => warn!(%path, error = %e, "skipping unusable persisted document"),
        }
    }
    info!(loaded, "store hydrated from postgres");
    Ok(loaded)
}
