// src/db/models.rs
// Typed row structs for the relational store

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub google_id: String,
    pub email: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub created_at: String,
    pub last_login_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub is_pinned: i64,
    pub share_token: Option<String>,
    pub shared_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub sql_query: Option<String>,
    pub sql_executions: Option<String>,
    pub reasoning: Option<String>,
    pub tool_call_trace: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub token_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Dataset {
    pub id: String,
    pub conversation_id: String,
    pub url: String,
    pub name: String,
    pub row_count: i64,
    pub column_count: i64,
    pub schema_json: String,
    pub status: String,
    pub error_message: Option<String>,
    pub loaded_at: String,
    pub file_size_bytes: Option<i64>,
    pub column_descriptions: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct TokenUsageRow {
    pub id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub model_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub timestamp: String,
}
