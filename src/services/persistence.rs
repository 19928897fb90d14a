//! Persistence service — background flush of dirty room documents.
//!
//! DESIGN
//! ======
//! The embedded store is authoritative while the process runs. A background
//! task wakes every `FLUSH_INTERVAL_MS`, drains the store's dirty set, and
//! upserts each room document (`rooms/{id}`) as one JSONB row; documents
//! that no longer exist are deleted. Startup hydrates the store from the
//! same table before any traffic is accepted.
//!
//! ERROR HANDLING
//! ==============
//! A document whose write fails is put back in the dirty set so the next
//! cycle retries it. Repeated upserts are acceptable, silent data loss is
//! not.

use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::state::AppState;
use crate::store::memory::MemoryStore;

/// Spawn the flush loop. `None` when running without a database.
#[must_use]
pub fn spawn_persistence_task(state: AppState) -> Option<JoinHandle<()>> {
    let pool = state.pool.clone()?;
    let flush_interval_ms = state.config.flush_interval_ms;
    info!(flush_interval_ms, "document persistence flush configured");
    Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(flush_interval_ms)).await;
            flush_dirty(&pool, &state.memory).await;
        }
    }))
}

/// Write every dirty document once. Returns how many were persisted.
pub async fn flush_dirty(pool: &PgPool, memory: &MemoryStore) -> usize {
    let dirty = memory.take_dirty().await;
    if dirty.is_empty() {
        return 0;
    }

    let mut failed = Vec::new();
    let mut flushed = 0;
    for (path, doc) in dirty {
        let result = match &doc {
            Some(doc) => upsert_document(pool, &path, doc).await,
            None => delete_document(pool, &path).await,
        };
        match result {
            Ok(()) => flushed += 1,
            Err(e) => {
                error!(error = %e, %path, "persistence flush failed");
                failed.push(path);
            }
        }
    }
    if !failed.is_empty() {
        memory.restore_dirty(failed).await;
    }
    flushed
}

async fn upsert_document(pool: &PgPool, path: &str, doc: &Value) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO store_documents (path, doc, updated_at) VALUES ($1, $2, now()) \
         ON CONFLICT (path) DO UPDATE SET doc = EXCLUDED.doc, updated_at = now()",
    )
    .bind(path)
    .bind(sqlx::types::Json(doc))
    .execute(pool)
    .await?;
    Ok(())
}

async fn delete_document(pool: &PgPool, path: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM store_documents WHERE path = $1")
        .bind(path)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
