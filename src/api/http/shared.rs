// src/api/http/shared.rs
// Public read-only view of shared conversations (no auth)

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Value, json};

use crate::api::error::{ApiError, ApiResult};
use crate::db::models::{Conversation, Dataset, Message};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET /shared/{share_token}
// ---------------------------------------------------------------------------

pub async fn get_public_conversation(
    State(state): State<Arc<AppState>>,
    Path(share_token): Path<String>,
) -> ApiResult<Json<Value>> {
    let conversation =
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE share_token = ?")
            .bind(&share_token)
            .fetch_optional(&state.db)
            .await?
            .ok_or_else(|| ApiError::not_found("Shared conversation not found"))?;

    let messages = sqlx::query_as::<_, Message>(
        "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at",
    )
    .bind(&conversation.id)
    .fetch_all(&state.db)
    .await?;

    let datasets = sqlx::query_as::<_, Dataset>(
        "SELECT * FROM datasets WHERE conversation_id = ? ORDER BY loaded_at",
    )
    .bind(&conversation.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(json!({
        "title": conversation.title,
        "messages": messages,
        "datasets": datasets,
        "shared_at": conversation.shared_at,
    })))
}
