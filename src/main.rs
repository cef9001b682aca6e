// src/main.rs
// ChatDF backend server entrypoint

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use chatdf_backend::api::http;
use chatdf_backend::cache::PersistentQueryCache;
use chatdf_backend::config::CONFIG;
use chatdf_backend::llm::{ChatModel, GeminiModel};
use chatdf_backend::state::AppState;
use chatdf_backend::workers::{DataPool, WorkerPool};
use chatdf_backend::db;

#[derive(Parser)]
#[command(name = "chatdf-backend", about = "Conversational analytics backend")]
struct Args {
    /// Override the bind address (defaults to CHATDF_HOST:CHATDF_PORT)
    #[arg(long)]
    bind: Option<String>,

    /// Override DATABASE_URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    CONFIG.validate()?;

    let database_url = args
        .database_url
        .unwrap_or_else(|| CONFIG.database.url.clone());
    let pool = db::connect(&database_url).await?;
    info!("Database ready");

    let llm: Arc<dyn ChatModel> = Arc::new(GeminiModel::new(CONFIG.gemini.api_key.clone()));

    let persistent_cache = PersistentQueryCache::new(
        pool.clone(),
        CONFIG.cache.persistent_ttl_secs,
        CONFIG.cache.max_persistent_cache_size,
    );
    let worker_pool = Arc::new(WorkerPool::new(
        &CONFIG.worker,
        &CONFIG.cache,
        Some(persistent_cache),
    ));
    info!("Worker pool ready ({} workers)", CONFIG.worker.pool_size);

    let state = Arc::new(AppState::new(
        pool,
        llm,
        worker_pool.clone() as Arc<dyn DataPool>,
    ));

    spawn_maintenance(worker_pool);

    let bind_address = args.bind.unwrap_or_else(|| CONFIG.bind_address());
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Listening on {}", bind_address);

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Hourly housekeeping: expire persistent query-cache rows, sweep stale
/// partial downloads, enforce the file cache size cap.
fn spawn_maintenance(worker_pool: Arc<WorkerPool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            if let Some(cache) = worker_pool.persistent_cache() {
                let deleted = cache.cleanup().await;
                if deleted > 0 {
                    info!("Query cache cleanup removed {} rows", deleted);
                }
            }
            let file_cache = worker_pool.file_cache().clone();
            let result = tokio::task::spawn_blocking(move || {
                let stale = file_cache.cleanup_stale_temps();
                let evicted = file_cache.evict_lru();
                (stale, evicted)
            })
            .await;
            match result {
                Ok((stale, evicted)) if stale > 0 || evicted > 0 => {
                    info!(
                        "File cache maintenance: {} stale temps, {} evicted",
                        stale, evicted
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("File cache maintenance task failed: {}", e),
            }
        }
    });
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, draining in-flight turns");
}
