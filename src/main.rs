mod config;
mod db;
mod error;
mod frame;
mod model;
mod routes;
mod services;
mod state;
mod store;

use std::sync::Arc;

use config::AppConfig;
use store::memory::MemoryStore;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = AppConfig::from_env();
    let memory = Arc::new(MemoryStore::new());

    // Without DATABASE_URL everything lives in memory and dies with the process.
    let pool = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url, config.db_max_connections)
                .await
                .expect("database init failed");
            db::hydrate_store(&pool, &memory)
                .await
                .expect("store hydration failed");
            Some(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; running memory-only, nothing is persisted");
            None
        }
    };

    let port = config.port;
    let state = state::AppState::new(memory, pool, config);

    // Spawn background persistence task.
    let _persistence = services::persistence::spawn_persistence_task(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "mapsync listening");
    axum::serve(listener, app).await.expect("server failed");
}
