// src/chat/mod.rs

//! Chat orchestration: the life of one user turn.
//!
//! `process_message` runs the full turn state machine: admit, persist the
//! user message, auto-title, rate-limit pre-gate, context assembly, LLM
//! streaming with tool dispatch, persistence, usage recording, post-gate,
//! completion event. Exactly one orchestration may be active per
//! conversation; a second concurrent call fails with a conflict.

pub mod context;
pub mod prompt;
pub mod stream;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::api::ws::connection::ConnectionManager;
use crate::api::ws::events as ws_events;
use crate::config::{GeminiConfig, LimitsConfig};
use crate::datasets::DatasetCatalog;
use crate::db::now_iso;
use crate::llm::{ChatModel, LlmError};
use crate::rate_limit::RateLimiter;
use crate::workers::DataPool;

pub use context::{ContextMessage, prune_context};
pub use prompt::build_system_prompt;
pub use stream::{SqlExecution, StreamResult, StreamSettings};

const WS_ROW_CAP: usize = 100;
const TITLE_MAX_CHARS: usize = 50;

/// Best-effort event delivery for one turn. Production sends through the
/// connection manager to all of a user's sockets; tests collect into a vec.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: Value);
}

/// Fan-out sink bound to one user.
pub struct UserEvents {
    manager: Arc<ConnectionManager>,
    user_id: String,
}

impl UserEvents {
    pub fn new(manager: Arc<ConnectionManager>, user_id: impl Into<String>) -> Self {
        Self {
            manager,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl EventSink for UserEvents {
    async fn send(&self, event: Value) {
        self.manager.send_to_user(&self.user_id, &event).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("A response is already being generated for this conversation")]
    Conflict,
    #[error("Token limit exceeded. Please try again later.")]
    RateLimited { resets_in_seconds: Option<i64> },
    #[error("The AI service is temporarily busy. Please try again in a moment.")]
    LlmBusy,
    #[error(transparent)]
    Llm(LlmError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ChatError {
    /// Short class name carried in the chat_error event's `d` field.
    pub fn class_name(&self) -> &'static str {
        match self {
            ChatError::Conflict => "ConflictError",
            ChatError::RateLimited { .. } => "RateLimitError",
            ChatError::LlmBusy => "GeminiRateLimitError",
            ChatError::Llm(_) => "LlmError",
            ChatError::Db(_) => "DatabaseError",
            ChatError::Internal(_) => "InternalError",
        }
    }
}

pub struct ChatService {
    db: SqlitePool,
    model: Arc<dyn ChatModel>,
    pool: Arc<dyn DataPool>,
    catalog: Arc<DatasetCatalog>,
    rate_limiter: Arc<RateLimiter>,
    limits: LimitsConfig,
    gemini: GeminiConfig,
    active_conversations: Mutex<HashMap<String, CancellationToken>>,
}

impl ChatService {
    pub fn new(
        db: SqlitePool,
        model: Arc<dyn ChatModel>,
        pool: Arc<dyn DataPool>,
        catalog: Arc<DatasetCatalog>,
        rate_limiter: Arc<RateLimiter>,
        limits: LimitsConfig,
        gemini: GeminiConfig,
    ) -> Self {
        Self {
            db,
            model,
            pool,
            catalog,
            rate_limiter,
            limits,
            gemini,
            active_conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a turn is currently in flight for the conversation.
    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active_conversations.lock().contains_key(conversation_id)
    }

    /// Signal the active turn (if any) to stop streaming. The partial text
    /// persists as the assistant message. No-op for unknown conversations.
    pub fn stop_generation(&self, conversation_id: &str) {
        if let Some(token) = self.active_conversations.lock().get(conversation_id) {
            info!("Cancelling generation for conversation {}", conversation_id);
            token.cancel();
        }
    }

    /// Run one user turn. Returns the persisted assistant message id.
    pub async fn process_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        content: &str,
        events: Arc<dyn EventSink>,
        model_override: Option<String>,
    ) -> Result<String, ChatError> {
        // Admit: one active orchestration per conversation.
        let cancel = {
            let mut active = self.active_conversations.lock();
            if active.contains_key(conversation_id) {
                return Err(ChatError::Conflict);
            }
            let token = CancellationToken::new();
            active.insert(conversation_id.to_string(), token.clone());
            token
        };

        let result = self
            .run_turn(conversation_id, user_id, content, &events, model_override, cancel)
            .await;

        // The token is cleared on every exit path.
        self.active_conversations.lock().remove(conversation_id);

        if let Err(e) = &result {
            error!(
                "Turn failed for conversation {}: {} ({})",
                conversation_id,
                e,
                e.class_name()
            );
            // Best effort: a dead socket must not mask the original error.
            events
                .send(ws_events::chat_error(&e.to_string(), Some(e.class_name())))
                .await;
        }
        result
    }

    async fn run_turn(
        &self,
        conversation_id: &str,
        user_id: &str,
        content: &str,
        events: &Arc<dyn EventSink>,
        model_override: Option<String>,
        cancel: CancellationToken,
    ) -> Result<String, ChatError> {
        // Persist the user message before anything can fail, so the user
        // always sees their own message in history.
        self.insert_user_message(conversation_id, content).await?;

        self.auto_title(conversation_id, content, events).await?;

        // Pre-gate.
        let status = self
            .rate_limiter
            .check_limit(user_id)
            .await
            .map_err(ChatError::Internal)?;
        if !status.allowed {
            events
                .send(ws_events::rate_limit_exceeded(status.resets_in_seconds))
                .await;
            return Err(ChatError::RateLimited {
                resets_in_seconds: status.resets_in_seconds,
            });
        }
        if status.warning {
            events
                .send(ws_events::rate_limit_warning(
                    status.usage_percent,
                    status.remaining_tokens,
                ))
                .await;
        }

        // Context assembly.
        let messages = self.load_context(conversation_id).await?;
        let datasets = self
            .catalog
            .get_datasets(conversation_id)
            .await
            .map_err(|e| ChatError::Internal(anyhow::anyhow!(e)))?;

        events.send(ws_events::query_status("generating")).await;

        let model_id = model_override.unwrap_or_else(|| self.gemini.model.clone());
        let settings = StreamSettings {
            max_tool_calls: self.limits.max_tool_calls_per_turn,
            max_sql_retries: self.limits.max_sql_retries,
            max_llm_retries: self.gemini.max_retries,
            llm_retry_base_delay: Duration::from_secs(self.gemini.retry_base_delay_secs),
            ws_row_cap: WS_ROW_CAP,
        };
        let stream_result = stream::stream_chat(
            stream::StreamContext {
                model: &self.model,
                model_id: &model_id,
                pool: &self.pool,
                catalog: &self.catalog,
                conversation_id,
                datasets: &datasets,
                events,
                cancel: &cancel,
                settings,
            },
            &messages,
        )
        .await?;

        // Persist the assistant message (partial text included on cancel).
        let message_id = self
            .insert_assistant_message(conversation_id, &stream_result)
            .await?;

        // Ledger row; invalidates the rate-limit memo.
        self.rate_limiter
            .record_usage(
                user_id,
                Some(conversation_id),
                &model_id,
                stream_result.input_tokens,
                stream_result.output_tokens,
            )
            .await
            .map_err(ChatError::Internal)?;

        // Post-gate: surface a warning the moment this turn crossed it.
        let status = self
            .rate_limiter
            .check_limit(user_id)
            .await
            .map_err(ChatError::Internal)?;
        if status.warning {
            events
                .send(ws_events::rate_limit_warning(
                    status.usage_percent,
                    status.remaining_tokens,
                ))
                .await;
        }
        events
            .send(ws_events::usage_update(
                status.usage_tokens,
                status.remaining_tokens,
            ))
            .await;

        let wire_executions: Vec<Value> = stream_result
            .sql_executions
            .iter()
            .map(|e| e.to_wire_json())
            .collect();
        let trace = (!stream_result.tool_call_trace.is_empty())
            .then(|| Value::Array(stream_result.tool_call_trace.clone()));
        events
            .send(ws_events::chat_complete(
                &message_id,
                stream_result.sql_queries.last().map(|s| s.as_str()),
                stream_result.input_tokens + stream_result.output_tokens,
                Some(&Value::Array(wire_executions)),
                Some(&stream_result.reasoning),
                stream_result.input_tokens,
                stream_result.output_tokens,
                trace.as_ref(),
            ))
            .await;

        Ok(message_id)
    }

    async fn insert_user_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<String, ChatError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, token_count, created_at) \
             VALUES (?, ?, 'user', ?, 0, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(content)
        .bind(now_iso())
        .execute(&self.db)
        .await?;
        Ok(id)
    }

    /// When the conversation still has no title, take the first 50
    /// characters of the message (with an ellipsis when truncated).
    async fn auto_title(
        &self,
        conversation_id: &str,
        content: &str,
        events: &Arc<dyn EventSink>,
    ) -> Result<(), ChatError> {
        let title: Option<String> =
            sqlx::query_scalar("SELECT title FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .fetch_optional(&self.db)
                .await?;
        let Some(title) = title else {
            return Ok(());
        };
        if !title.is_empty() {
            return Ok(());
        }

        let mut new_title: String = content.chars().take(TITLE_MAX_CHARS).collect();
        if content.chars().count() > TITLE_MAX_CHARS {
            new_title.push('\u{2026}');
        }
        sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
            .bind(&new_title)
            .bind(now_iso())
            .bind(conversation_id)
            .execute(&self.db)
            .await?;

        events
            .send(ws_events::conversation_title_updated(
                conversation_id,
                &new_title,
            ))
            .await;
        Ok(())
    }

    async fn load_context(&self, conversation_id: &str) -> Result<Vec<ContextMessage>, ChatError> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT role, content, sql_query FROM messages \
             WHERE conversation_id = ? ORDER BY created_at",
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;

        let messages = rows
            .into_iter()
            .map(|(role, content, sql_query)| ContextMessage {
                role,
                content,
                sql_query,
            })
            .collect();
        Ok(prune_context(
            messages,
            self.limits.max_context_messages,
            self.limits.max_context_tokens,
        ))
    }

    async fn insert_assistant_message(
        &self,
        conversation_id: &str,
        result: &StreamResult,
    ) -> Result<String, ChatError> {
        let id = Uuid::new_v4().to_string();

        let sql_executions = if result.sql_executions.is_empty() {
            None
        } else {
            let db_form: Vec<Value> = result.sql_executions.iter().map(|e| e.to_db_json()).collect();
            Some(serde_json::to_string(&db_form).unwrap_or_else(|_| "[]".to_string()))
        };
        let reasoning = (!result.reasoning.is_empty()).then(|| result.reasoning.clone());
        let trace = if result.tool_call_trace.is_empty() {
            None
        } else {
            serde_json::to_string(&result.tool_call_trace).ok()
        };

        sqlx::query(
            "INSERT INTO messages \
             (id, conversation_id, role, content, sql_query, sql_executions, reasoning, \
              tool_call_trace, input_tokens, output_tokens, token_count, created_at) \
             VALUES (?, ?, 'assistant', ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(&result.assistant_message)
        .bind(result.sql_queries.last())
        .bind(sql_executions)
        .bind(reasoning)
        .bind(trace)
        .bind(result.input_tokens)
        .bind(result.output_tokens)
        .bind(result.input_tokens + result.output_tokens)
        .bind(now_iso())
        .execute(&self.db)
        .await?;
        Ok(id)
    }
}
