// src/api/http/mod.rs
// Router assembly for the REST surface

pub mod auth;
pub mod conversations;
pub mod datasets;
pub mod export;
pub mod query;
pub mod shared;

use std::sync::Arc;

use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/conversations",
            post(conversations::create_conversation)
                .get(conversations::list_conversations)
                .delete(conversations::clear_all_conversations),
        )
        .route("/conversations/import", post(conversations::import_conversation))
        .route("/conversations/search", get(conversations::search_conversations))
        .route("/conversations/bulk-delete", post(conversations::bulk_delete))
        .route("/conversations/bulk-pin", post(conversations::bulk_pin))
        .route(
            "/conversations/{id}",
            get(conversations::conversation_detail)
                .patch(conversations::rename_conversation)
                .delete(conversations::delete_conversation),
        )
        .route("/conversations/{id}/pin", patch(conversations::pin_conversation))
        .route("/conversations/{id}/export", get(export::export_json))
        .route("/conversations/{id}/export/html", get(export::export_html))
        .route("/conversations/{id}/messages", post(conversations::send_message))
        .route(
            "/conversations/{id}/messages/{mid}",
            delete(conversations::delete_message),
        )
        .route(
            "/conversations/{id}/messages/{mid}/redo",
            post(conversations::redo_message),
        )
        .route("/conversations/{id}/stop", post(conversations::stop_generation))
        .route("/conversations/{id}/fork", post(conversations::fork_conversation))
        .route("/conversations/{id}/token-usage", get(conversations::token_usage))
        .route(
            "/conversations/{id}/share",
            post(conversations::share_conversation).delete(conversations::unshare_conversation),
        )
        .route("/conversations/{id}/query", post(query::run_query))
        .route("/conversations/{id}/explain-sql", post(query::explain_sql))
        .route("/conversations/{id}/generate-sql", post(query::generate_sql))
        .route(
            "/conversations/{id}/prompt-preview",
            post(conversations::prompt_preview),
        )
        .route(
            "/conversations/{id}/datasets",
            post(datasets::add_dataset),
        )
        .route(
            "/conversations/{id}/datasets/upload",
            post(datasets::upload_dataset),
        )
        .route(
            "/conversations/{id}/datasets/{did}",
            patch(datasets::rename_dataset).delete(datasets::remove_dataset),
        )
        .route(
            "/conversations/{id}/datasets/{did}/refresh",
            post(datasets::refresh_dataset),
        )
        .route(
            "/conversations/{id}/datasets/{did}/profile",
            post(datasets::profile_dataset),
        )
        .route(
            "/conversations/{id}/datasets/{did}/profile-column",
            post(datasets::profile_single_column),
        )
        .route(
            "/conversations/{id}/datasets/{did}/preview",
            post(datasets::preview_dataset),
        )
        .route(
            "/conversations/{id}/datasets/{did}/column-descriptions",
            get(datasets::get_column_descriptions).patch(datasets::update_column_descriptions),
        )
        .route("/shared/{share_token}", get(shared::get_public_conversation))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
