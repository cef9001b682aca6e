// src/api/http/conversations.rs
// Conversation CRUD plus the chat endpoints

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, warn};
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::chat::{ContextMessage, UserEvents, build_system_prompt, prune_context};
use crate::config::CONFIG;
use crate::db::models::{Dataset, Message};
use crate::db::now_iso;
use crate::state::AppState;

use super::auth::{CurrentUser, owned_conversation};

// ---------------------------------------------------------------------------
// Request/response shapes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub dataset_count: i64,
    pub message_count: i64,
    pub last_message_preview: Option<String>,
    pub is_pinned: bool,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Deserialize)]
pub struct RenameConversationRequest {
    pub title: String,
}

#[derive(Deserialize)]
pub struct PinConversationRequest {
    pub is_pinned: bool,
}

#[derive(Deserialize)]
pub struct BulkDeleteRequest {
    pub ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct BulkPinRequest {
    pub ids: Vec<String>,
    #[serde(default = "default_true")]
    pub is_pinned: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct ForkConversationRequest {
    pub message_id: String,
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct PromptPreviewRequest {
    pub content: String,
}

// ---------------------------------------------------------------------------
// POST /conversations
// ---------------------------------------------------------------------------

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let conv_id = Uuid::new_v4().to_string();
    let now = now_iso();

    sqlx::query(
        "INSERT INTO conversations (id, user_id, title, created_at, updated_at) \
         VALUES (?, ?, '', ?, ?)",
    )
    .bind(&conv_id)
    .bind(&user.id)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": conv_id, "title": "", "created_at": now })),
    ))
}

// ---------------------------------------------------------------------------
// POST /conversations/import
// ---------------------------------------------------------------------------

pub async fn import_conversation(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let title = match body.get("title") {
        None => String::new(),
        Some(Value::String(t)) => t.chars().take(100).collect(),
        Some(_) => return Err(ApiError::bad_request("title must be a string")),
    };

    let messages = match body.get("messages") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err(ApiError::bad_request("messages must be an array")),
    };
    if messages.len() > 1000 {
        return Err(ApiError::bad_request(
            "messages array exceeds maximum of 1000 items",
        ));
    }

    let datasets = match body.get("datasets") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err(ApiError::bad_request("datasets must be an array")),
    };
    if datasets.len() > 50 {
        return Err(ApiError::bad_request(
            "datasets array exceeds maximum of 50 items",
        ));
    }

    for (i, msg) in messages.iter().enumerate() {
        let role = msg.get("role").and_then(|r| r.as_str());
        if role != Some("user") && role != Some("assistant") {
            return Err(ApiError::bad_request(format!(
                "messages[{i}].role must be 'user' or 'assistant'"
            )));
        }
        if !msg.get("content").map(|c| c.is_string()).unwrap_or(false) {
            return Err(ApiError::bad_request(format!(
                "messages[{i}].content must be a string"
            )));
        }
    }
    for (i, ds) in datasets.iter().enumerate() {
        let has_url = ds
            .get("url")
            .and_then(|u| u.as_str())
            .map(|u| !u.is_empty())
            .unwrap_or(false);
        if !has_url {
            return Err(ApiError::bad_request(format!(
                "datasets[{i}].url is required and must be a string"
            )));
        }
    }

    let conv_id = Uuid::new_v4().to_string();
    let now = now_iso();
    sqlx::query(
        "INSERT INTO conversations (id, user_id, title, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&conv_id)
    .bind(&user.id)
    .bind(&title)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    for msg in &messages {
        let created_at = msg
            .get("timestamp")
            .or_else(|| msg.get("created_at"))
            .and_then(|t| t.as_str())
            .unwrap_or(&now);
        sqlx::query(
            "INSERT INTO messages \
             (id, conversation_id, role, content, sql_query, reasoning, token_count, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&conv_id)
        .bind(msg["role"].as_str().unwrap_or("user"))
        .bind(msg["content"].as_str().unwrap_or_default())
        .bind(msg.get("sql_query").and_then(|s| s.as_str()))
        .bind(msg.get("reasoning").and_then(|s| s.as_str()))
        .bind(created_at)
        .execute(&state.db)
        .await?;
    }

    for ds in &datasets {
        sqlx::query(
            "INSERT INTO datasets \
             (id, conversation_id, url, name, row_count, column_count, schema_json, status, \
              loaded_at, file_size_bytes, column_descriptions) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'ready', ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&conv_id)
        .bind(ds["url"].as_str().unwrap_or_default())
        .bind(ds.get("name").and_then(|n| n.as_str()).unwrap_or(""))
        .bind(ds.get("row_count").and_then(|n| n.as_i64()).unwrap_or(0))
        .bind(ds.get("column_count").and_then(|n| n.as_i64()).unwrap_or(0))
        .bind(ds.get("schema_json").and_then(|s| s.as_str()).unwrap_or("[]"))
        .bind(&now)
        .bind(ds.get("file_size_bytes").and_then(|n| n.as_i64()))
        .bind(
            ds.get("column_descriptions")
                .and_then(|s| s.as_str())
                .unwrap_or("{}"),
        )
        .execute(&state.db)
        .await?;
    }

    Ok((StatusCode::CREATED, Json(json!({ "id": conv_id, "title": title }))))
}

// ---------------------------------------------------------------------------
// GET /conversations
// ---------------------------------------------------------------------------

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Value>> {
    let rows: Vec<(String, String, String, String, i64, i64, i64, Option<String>)> =
        sqlx::query_as(
            "SELECT c.id, c.title, c.created_at, c.updated_at, c.is_pinned, \
               COALESCE(d_cnt.cnt, 0) AS dataset_count, \
               COALESCE(m_cnt.cnt, 0) AS message_count, \
               ( \
                 SELECT SUBSTR(m2.content, 1, 100) FROM messages m2 \
                 WHERE m2.conversation_id = c.id ORDER BY m2.created_at DESC LIMIT 1 \
               ) AS last_message_preview \
             FROM conversations c \
             LEFT JOIN ( \
               SELECT conversation_id, COUNT(*) AS cnt FROM datasets GROUP BY conversation_id \
             ) d_cnt ON d_cnt.conversation_id = c.id \
             LEFT JOIN ( \
               SELECT conversation_id, COUNT(*) AS cnt FROM messages GROUP BY conversation_id \
             ) m_cnt ON m_cnt.conversation_id = c.id \
             WHERE c.user_id = ? \
             ORDER BY c.is_pinned DESC, c.updated_at DESC",
        )
        .bind(&user.id)
        .fetch_all(&state.db)
        .await?;

    let conversations: Vec<ConversationSummary> = rows
        .into_iter()
        .map(
            |(id, title, created_at, updated_at, is_pinned, dataset_count, message_count, preview)| {
                ConversationSummary {
                    id,
                    title,
                    created_at,
                    updated_at,
                    dataset_count,
                    message_count,
                    last_message_preview: preview,
                    is_pinned: is_pinned != 0,
                }
            },
        )
        .collect();

    Ok(Json(json!({ "conversations": conversations })))
}

// ---------------------------------------------------------------------------
// GET /conversations/search
// ---------------------------------------------------------------------------

pub async fn search_conversations(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Value>> {
    let q = params.q.trim().to_string();
    if q.is_empty() {
        return Err(ApiError::bad_request("Query parameter 'q' is required"));
    }
    let limit = params.limit.unwrap_or(20).clamp(1, 50);

    let pattern = format!("%{q}%");
    let rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(
        "SELECT m.id, m.role, m.content, m.created_at, c.id, c.title \
         FROM messages m \
         JOIN conversations c ON m.conversation_id = c.id \
         WHERE c.user_id = ? AND m.content LIKE ? \
         ORDER BY m.created_at DESC LIMIT ?",
    )
    .bind(&user.id)
    .bind(&pattern)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;

    let results: Vec<Value> = rows
        .into_iter()
        .map(|(message_id, role, content, created_at, conversation_id, title)| {
            let snippet = snippet_around_match(&content, &q);
            json!({
                "conversation_id": conversation_id,
                "conversation_title": title,
                "message_id": message_id,
                "message_role": role,
                "snippet": snippet,
                "created_at": created_at,
            })
        })
        .collect();

    Ok(Json(json!({ "total": results.len(), "results": results })))
}

/// ±50 characters of context around the first case-insensitive match, with
/// ellipses when truncated.
fn snippet_around_match(content: &str, query: &str) -> String {
    let lower_content = content.to_lowercase();
    let lower_query = query.to_lowercase();
    let mut match_pos = lower_content.find(&lower_query).unwrap_or(0);
    // Lowercasing can shift byte offsets for non-ASCII text.
    if !content.is_char_boundary(match_pos) {
        match_pos = 0;
    }

    let chars: Vec<char> = content.chars().collect();
    // Byte offset to char offset for the slice bounds.
    let char_pos = content[..match_pos].chars().count();
    let query_chars = query.chars().count();
    let start = char_pos.saturating_sub(50);
    let end = (char_pos + query_chars + 50).min(chars.len());

    let mut snippet: String = chars[start..end].iter().collect();
    if start > 0 {
        snippet = format!("...{snippet}");
    }
    if end < chars.len() {
        snippet = format!("{snippet}...");
    }
    snippet
}

// ---------------------------------------------------------------------------
// POST /conversations/bulk-delete, POST /conversations/bulk-pin
// ---------------------------------------------------------------------------

pub async fn bulk_delete(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<BulkDeleteRequest>,
) -> ApiResult<Json<Value>> {
    if body.ids.is_empty() || body.ids.len() > 50 {
        return Err(ApiError::bad_request("Provide 1-50 conversation IDs"));
    }
    let mut deleted = 0;
    for id in &body.ids {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(&user.id)
            .execute(&state.db)
            .await?;
        deleted += result.rows_affected();
    }
    Ok(Json(json!({ "deleted": deleted })))
}

pub async fn bulk_pin(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<BulkPinRequest>,
) -> ApiResult<Json<Value>> {
    if body.ids.is_empty() || body.ids.len() > 50 {
        return Err(ApiError::bad_request("Provide 1-50 conversation IDs"));
    }
    let mut updated = 0;
    for id in &body.ids {
        let result =
            sqlx::query("UPDATE conversations SET is_pinned = ? WHERE id = ? AND user_id = ?")
                .bind(body.is_pinned as i64)
                .bind(id)
                .bind(&user.id)
                .execute(&state.db)
                .await?;
        updated += result.rows_affected();
    }
    Ok(Json(json!({ "updated": updated })))
}

// ---------------------------------------------------------------------------
// GET /conversations/{id}
// ---------------------------------------------------------------------------

pub async fn conversation_detail(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

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
        "id": conversation.id,
        "title": conversation.title,
        "is_pinned": conversation.is_pinned != 0,
        "created_at": conversation.created_at,
        "updated_at": conversation.updated_at,
        "messages": messages,
        "datasets": datasets,
    })))
}

// ---------------------------------------------------------------------------
// PATCH /conversations/{id}, PATCH /conversations/{id}/pin
// ---------------------------------------------------------------------------

pub async fn rename_conversation(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<RenameConversationRequest>,
) -> ApiResult<Json<Value>> {
    let title = body.title.trim();
    if title.is_empty() || title.chars().count() > 100 {
        return Err(ApiError::bad_request("title must be 1-100 characters"));
    }
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let now = now_iso();
    sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
        .bind(title)
        .bind(&now)
        .bind(&conversation.id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "id": conversation.id, "title": title, "updated_at": now })))
}

pub async fn pin_conversation(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<PinConversationRequest>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let now = now_iso();
    sqlx::query("UPDATE conversations SET is_pinned = ?, updated_at = ? WHERE id = ?")
        .bind(body.is_pinned as i64)
        .bind(&now)
        .bind(&conversation.id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({
        "id": conversation.id,
        "is_pinned": body.is_pinned,
        "updated_at": now,
    })))
}

// ---------------------------------------------------------------------------
// DELETE /conversations/{id}, DELETE /conversations
// ---------------------------------------------------------------------------

pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    sqlx::query("DELETE FROM conversations WHERE id = ?")
        .bind(&conversation.id)
        .execute(&state.db)
        .await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn clear_all_conversations(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Value>> {
    let result = sqlx::query("DELETE FROM conversations WHERE user_id = ?")
        .bind(&user.id)
        .execute(&state.db)
        .await?;
    Ok(Json(json!({ "success": true, "deleted_count": result.rows_affected() })))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/messages
// ---------------------------------------------------------------------------

/// Acknowledge immediately; the orchestration runs as a background task and
/// streams results over the user's WebSockets.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.content.trim().is_empty() {
        return Err(ApiError::bad_request("Message content must not be empty"));
    }
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    if state.chat_service.is_active(&conversation.id) {
        return Err(ApiError::conflict(
            "A response is already being generated for this conversation",
        ));
    }

    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(now_iso())
        .bind(&conversation.id)
        .execute(&state.db)
        .await?;

    let ack_id = Uuid::new_v4().to_string();
    spawn_turn(&state, conversation.id, user.id, body.content, body.model);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message_id": ack_id, "status": "processing" })),
    ))
}

fn spawn_turn(
    state: &Arc<AppState>,
    conversation_id: String,
    user_id: String,
    content: String,
    model: Option<String>,
) {
    let chat_service = state.chat_service.clone();
    let events = Arc::new(UserEvents::new(state.connection_manager.clone(), user_id.clone()));
    tokio::spawn(async move {
        if let Err(e) = chat_service
            .process_message(&conversation_id, &user_id, &content, events, model)
            .await
        {
            error!(
                "Background turn failed for conversation {}: {}",
                conversation_id, e
            );
        }
    });
}

// ---------------------------------------------------------------------------
// DELETE /conversations/{id}/messages/{mid}
// ---------------------------------------------------------------------------

pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((conversation_id, message_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let result = sqlx::query("DELETE FROM messages WHERE id = ? AND conversation_id = ?")
        .bind(&message_id)
        .bind(&conversation.id)
        .execute(&state.db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Message not found in this conversation"));
    }
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/messages/{mid}/redo
// ---------------------------------------------------------------------------

/// Delete an assistant message and its preceding user message, then re-run
/// the orchestration with the original user content.
pub async fn redo_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((conversation_id, message_id)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let target: Option<(String, String)> = sqlx::query_as(
        "SELECT role, created_at FROM messages WHERE id = ? AND conversation_id = ?",
    )
    .bind(&message_id)
    .bind(&conversation.id)
    .fetch_optional(&state.db)
    .await?;
    let (role, created_at) =
        target.ok_or_else(|| ApiError::not_found("Message not found in this conversation"))?;
    if role != "assistant" {
        return Err(ApiError::bad_request("Can only redo assistant messages"));
    }

    let preceding: Option<(String, String)> = sqlx::query_as(
        "SELECT id, content FROM messages \
         WHERE conversation_id = ? AND role = 'user' AND created_at < ? \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(&conversation.id)
    .bind(&created_at)
    .fetch_optional(&state.db)
    .await?;
    let (user_message_id, user_content) =
        preceding.ok_or_else(|| ApiError::bad_request("No preceding user message found"))?;

    // Both deletes in one transaction; process_message re-creates the user row.
    let mut tx = state.db.begin().await?;
    sqlx::query("DELETE FROM messages WHERE id = ?")
        .bind(&message_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM messages WHERE id = ?")
        .bind(&user_message_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    spawn_turn(&state, conversation.id, user.id, user_content, None);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message_id": message_id, "status": "processing" })),
    ))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/stop
// ---------------------------------------------------------------------------

pub async fn stop_generation(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    state.chat_service.stop_generation(&conversation.id);
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// GET /conversations/{id}/token-usage
// ---------------------------------------------------------------------------

pub async fn token_usage(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let (total_input, total_output, total_cost, request_count): (i64, i64, f64, i64) =
        sqlx::query_as(
            "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0), \
                    COALESCE(SUM(cost), 0), COUNT(*) \
             FROM token_usage WHERE conversation_id = ?",
        )
        .bind(&conversation.id)
        .fetch_one(&state.db)
        .await?;

    Ok(Json(json!({
        "total_input_tokens": total_input,
        "total_output_tokens": total_output,
        "total_tokens": total_input + total_output,
        "total_cost": (total_cost * 1e6).round() / 1e6,
        "request_count": request_count,
    })))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/fork
// ---------------------------------------------------------------------------

/// Branch a conversation at a message: copy every message up to and
/// including it, plus all datasets.
pub async fn fork_conversation(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<ForkConversationRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let fork_until: Option<(String,)> = sqlx::query_as(
        "SELECT created_at FROM messages WHERE id = ? AND conversation_id = ?",
    )
    .bind(&body.message_id)
    .bind(&conversation.id)
    .fetch_optional(&state.db)
    .await?;
    let (fork_until,) =
        fork_until.ok_or_else(|| ApiError::not_found("Message not found in this conversation"))?;

    let fork_id = Uuid::new_v4().to_string();
    let now = now_iso();
    let fork_title = if conversation.title.is_empty() {
        "Forked conversation".to_string()
    } else {
        format!("Fork of {}", conversation.title)
    };

    sqlx::query(
        "INSERT INTO conversations (id, user_id, title, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&fork_id)
    .bind(&user.id)
    .bind(&fork_title)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let messages = sqlx::query_as::<_, Message>(
        "SELECT * FROM messages WHERE conversation_id = ? AND created_at <= ? \
         ORDER BY created_at",
    )
    .bind(&conversation.id)
    .bind(&fork_until)
    .fetch_all(&state.db)
    .await?;
    for msg in &messages {
        sqlx::query(
            "INSERT INTO messages \
             (id, conversation_id, role, content, sql_query, sql_executions, reasoning, \
              tool_call_trace, input_tokens, output_tokens, token_count, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&fork_id)
        .bind(&msg.role)
        .bind(&msg.content)
        .bind(&msg.sql_query)
        .bind(&msg.sql_executions)
        .bind(&msg.reasoning)
        .bind(&msg.tool_call_trace)
        .bind(msg.input_tokens)
        .bind(msg.output_tokens)
        .bind(msg.token_count)
        .bind(&msg.created_at)
        .execute(&state.db)
        .await?;
    }

    let datasets = sqlx::query_as::<_, Dataset>(
        "SELECT * FROM datasets WHERE conversation_id = ?",
    )
    .bind(&conversation.id)
    .fetch_all(&state.db)
    .await?;
    for ds in &datasets {
        sqlx::query(
            "INSERT INTO datasets \
             (id, conversation_id, url, name, row_count, column_count, schema_json, status, \
              error_message, loaded_at, file_size_bytes, column_descriptions) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&fork_id)
        .bind(&ds.url)
        .bind(&ds.name)
        .bind(ds.row_count)
        .bind(ds.column_count)
        .bind(&ds.schema_json)
        .bind(&ds.status)
        .bind(&ds.error_message)
        .bind(&ds.loaded_at)
        .bind(ds.file_size_bytes)
        .bind(&ds.column_descriptions)
        .execute(&state.db)
        .await?;
    }

    Ok((StatusCode::CREATED, Json(json!({ "id": fork_id, "title": fork_title }))))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/share, DELETE /conversations/{id}/share
// ---------------------------------------------------------------------------

pub async fn share_conversation(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    if let Some(token) = conversation.share_token {
        return Ok((
            StatusCode::CREATED,
            Json(json!({ "share_token": token, "share_url": format!("/shared/{token}") })),
        ));
    }

    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    let token = URL_SAFE_NO_PAD.encode(bytes);

    sqlx::query("UPDATE conversations SET share_token = ?, shared_at = ? WHERE id = ?")
        .bind(&token)
        .bind(now_iso())
        .bind(&conversation.id)
        .execute(&state.db)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "share_token": token, "share_url": format!("/shared/{token}") })),
    ))
}

pub async fn unshare_conversation(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    sqlx::query("UPDATE conversations SET share_token = NULL, shared_at = NULL WHERE id = ?")
        .bind(&conversation.id)
        .execute(&state.db)
        .await?;
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/prompt-preview
// ---------------------------------------------------------------------------

/// Build and return the full prompt that would be sent to the LLM, without
/// sending it.
pub async fn prompt_preview(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<PromptPreviewRequest>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
        "SELECT role, content, sql_query FROM messages \
         WHERE conversation_id = ? ORDER BY created_at",
    )
    .bind(&conversation.id)
    .fetch_all(&state.db)
    .await?;
    let messages: Vec<ContextMessage> = rows
        .into_iter()
        .map(|(role, content, sql_query)| ContextMessage {
            role,
            content,
            sql_query,
        })
        .collect();
    let pruned = prune_context(
        messages,
        CONFIG.limits.max_context_messages,
        CONFIG.limits.max_context_tokens,
    );

    let datasets = state
        .dataset_catalog
        .get_datasets(&conversation.id)
        .await
        .map_err(|e| {
            warn!("Failed to load datasets for prompt preview: {}", e);
            ApiError::internal("Failed to load datasets")
        })?;
    let system_prompt = build_system_prompt(&datasets);

    let formatted: Vec<Value> = pruned
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();

    let tool_names: Vec<String> = crate::llm::tool_declarations()[0]["functionDeclarations"]
        .as_array()
        .map(|decls| {
            decls
                .iter()
                .filter_map(|d| d["name"].as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let total_chars = system_prompt.len()
        + pruned.iter().map(|m| m.content.len()).sum::<usize>()
        + body.content.len();

    Ok(Json(json!({
        "system_prompt": system_prompt,
        "messages": formatted,
        "tools": tool_names,
        "new_message": body.content,
        "estimated_tokens": total_chars / 4,
    })))
}
