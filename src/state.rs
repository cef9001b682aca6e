// src/state.rs
// Application state shared across handlers

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::api::ws::connection::ConnectionManager;
use crate::auth::AuthService;
use crate::chat::ChatService;
use crate::config::CONFIG;
use crate::datasets::DatasetCatalog;
use crate::llm::ChatModel;
use crate::rate_limit::RateLimiter;
use crate::workers::DataPool;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub auth_service: Arc<AuthService>,
    pub connection_manager: Arc<ConnectionManager>,
    pub worker_pool: Arc<dyn DataPool>,
    pub dataset_catalog: Arc<DatasetCatalog>,
    pub rate_limiter: Arc<RateLimiter>,
    pub chat_service: Arc<ChatService>,
    pub llm: Arc<dyn ChatModel>,
}

impl AppState {
    /// Assemble the state from its collaborators. The binary passes the real
    /// Gemini model and worker pool; tests inject scripted ones.
    pub fn new(pool: SqlitePool, llm: Arc<dyn ChatModel>, worker_pool: Arc<dyn DataPool>) -> Self {
        let auth_service = Arc::new(AuthService::new(
            pool.clone(),
            CONFIG.session.duration_days,
        ));
        let connection_manager = Arc::new(ConnectionManager::new());
        let dataset_catalog = Arc::new(DatasetCatalog::new(
            pool.clone(),
            CONFIG.limits.max_datasets_per_conversation,
            &CONFIG.uploads.upload_dir,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            pool.clone(),
            CONFIG.limits.token_limit,
            CONFIG.limits.rate_limit_cache_ttl_secs,
        ));
        let chat_service = Arc::new(ChatService::new(
            pool.clone(),
            llm.clone(),
            worker_pool.clone(),
            dataset_catalog.clone(),
            rate_limiter.clone(),
            CONFIG.limits.clone(),
            CONFIG.gemini.clone(),
        ));

        Self {
            db: pool,
            auth_service,
            connection_manager,
            worker_pool,
            dataset_catalog,
            rate_limiter,
            chat_service,
            llm,
        }
    }
}
