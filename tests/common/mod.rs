// tests/common/mod.rs
// Shared fixtures: in-memory database, scripted LLM, scripted worker pool,
// event collector.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::SqlitePool;

use chatdf_backend::chat::EventSink;
use chatdf_backend::config::{GeminiConfig, LimitsConfig};
use chatdf_backend::db;
use chatdf_backend::llm::{
    ChatModel, ChunkStream, LlmError, Part, StreamChunk, TurnRequest, UsageMetadata,
};
use chatdf_backend::workers::{
    ColumnInfo, ColumnProfile, ColumnStats, DataPool, QueryDataset, QueryOutput, SchemaInfo,
    UrlInfo, WorkerError,
};

pub async fn fresh_db() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    db::init_schema(&pool).await.unwrap();
    pool
}

pub async fn seed_user(pool: &SqlitePool, user_id: &str) {
    let now = db::now_iso();
    sqlx::query(
        "INSERT INTO users (id, google_id, email, name, created_at, last_login_at) \
         VALUES (?, ?, ?, 'Test User', ?, ?)",
    )
    .bind(user_id)
    .bind(format!("google-{user_id}"))
    .bind(format!("{user_id}@example.com"))
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn seed_conversation(pool: &SqlitePool, conversation_id: &str, user_id: &str) {
    let now = db::now_iso();
    sqlx::query(
        "INSERT INTO conversations (id, user_id, title, created_at, updated_at) \
         VALUES (?, ?, '', ?, ?)",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn seed_usage(pool: &SqlitePool, user_id: &str, tokens: i64, secs_ago: i64) {
    sqlx::query(
        "INSERT INTO token_usage \
         (id, user_id, model_name, input_tokens, output_tokens, timestamp) \
         VALUES (?, ?, 'gemini-2.5-flash', ?, ?, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(tokens / 2)
    .bind(tokens - tokens / 2)
    .bind(db::iso_secs_ago(secs_ago))
    .execute(pool)
    .await
    .unwrap();
}

pub async fn seed_dataset(pool: &SqlitePool, dataset_id: &str, conversation_id: &str, url: &str) {
    sqlx::query(
        "INSERT INTO datasets \
         (id, conversation_id, url, name, row_count, column_count, schema_json, status, loaded_at) \
         VALUES (?, ?, ?, ?, 10, 1, \
                 '[{\"name\": \"a\", \"type\": \"Int64\", \"sample_values\": [], \"column_stats\": {}}]', \
                 'ready', ?)",
    )
    .bind(dataset_id)
    .bind(conversation_id)
    .bind(url)
    .bind(format!("table_{dataset_id}"))
    .bind(db::now_iso())
    .execute(pool)
    .await
    .unwrap();
}

pub fn test_limits() -> LimitsConfig {
    LimitsConfig {
        token_limit: 5_000_000,
        rate_limit_cache_ttl_secs: 60,
        max_datasets_per_conversation: 50,
        max_result_rows: 1000,
        max_query_rows: 10_000,
        max_tool_calls_per_turn: 5,
        max_sql_retries: 3,
        max_context_messages: 50,
        max_context_tokens: 200_000,
    }
}

pub fn test_gemini_config() -> GeminiConfig {
    GeminiConfig {
        api_key: String::new(),
        model: "gemini-2.5-flash".to_string(),
        max_retries: 3,
        retry_base_delay_secs: 0,
    }
}

// ---------------------------------------------------------------------------
// Event collector
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CollectorSink {
    pub events: Mutex<Vec<Value>>,
}

impl CollectorSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| e.get("type").and_then(|t| t.as_str()).map(String::from))
            .collect()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.get("type").and_then(|t| t.as_str()) == Some(event_type))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectorSink {
    async fn send(&self, event: Value) {
        self.events.lock().push(event);
    }
}

// ---------------------------------------------------------------------------
// Scripted LLM
// ---------------------------------------------------------------------------

pub fn text_chunk(text: &str) -> StreamChunk {
    StreamChunk {
        parts: vec![Part::Text {
            text: text.to_string(),
            thought: false,
        }],
        usage: None,
    }
}

pub fn thought_chunk(text: &str) -> StreamChunk {
    StreamChunk {
        parts: vec![Part::Text {
            text: text.to_string(),
            thought: true,
        }],
        usage: None,
    }
}

pub fn tool_chunk(name: &str, args: Value) -> StreamChunk {
    StreamChunk {
        parts: vec![Part::FunctionCall {
            name: name.to_string(),
            args,
        }],
        usage: None,
    }
}

pub fn usage_chunk(prompt: i64, candidates: i64) -> StreamChunk {
    StreamChunk {
        parts: Vec::new(),
        usage: Some(UsageMetadata {
            prompt_tokens: prompt,
            candidates_tokens: candidates,
        }),
    }
}

/// One scripted provider call: the chunks it streams, with an optional
/// pause between them (for cancellation tests).
pub struct ScriptedTurn {
    pub chunks: Vec<StreamChunk>,
    pub delay_between: Option<Duration>,
}

impl ScriptedTurn {
    pub fn new(chunks: Vec<StreamChunk>) -> Self {
        Self {
            chunks,
            delay_between: None,
        }
    }

    pub fn with_delay(chunks: Vec<StreamChunk>, delay: Duration) -> Self {
        Self {
            chunks,
            delay_between: Some(delay),
        }
    }
}

/// A ChatModel that replays scripted turns. Returns RateLimited for the
/// first `rate_limited_calls` stream openings.
pub struct ScriptedModel {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    rate_limited_calls: Mutex<u32>,
    pub requests_seen: Mutex<Vec<TurnRequest>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<ScriptedTurn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            rate_limited_calls: Mutex::new(0),
            requests_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn rate_limited_for(self: Arc<Self>, calls: u32) -> Arc<Self> {
        *self.rate_limited_calls.lock() = calls;
        self
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream_turn(&self, request: TurnRequest) -> Result<ChunkStream, LlmError> {
        self.requests_seen.lock().push(request);

        {
            let mut remaining = self.rate_limited_calls.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LlmError::RateLimited);
            }
        }

        let turn = self
            .turns
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::new(vec![text_chunk("")]));

        let stream = async_stream::stream! {
            for (i, chunk) in turn.chunks.into_iter().enumerate() {
                if i > 0 {
                    if let Some(delay) = turn.delay_between {
                        tokio::time::sleep(delay).await;
                    }
                }
                yield Ok(chunk);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn generate(&self, _model: &str, _prompt: &str) -> Result<String, LlmError> {
        Ok("SQL: SELECT 1\nEXPLANATION: Selects one.".to_string())
    }
}

// ---------------------------------------------------------------------------
// Scripted worker pool
// ---------------------------------------------------------------------------

pub fn ok_query_output(rows: Vec<Vec<Value>>) -> QueryOutput {
    QueryOutput {
        columns: vec!["a".to_string()],
        total_rows: rows.len(),
        rows,
        execution_time_ms: 1.5,
        limit_applied: false,
        cached: false,
    }
}

pub fn simple_schema() -> SchemaInfo {
    SchemaInfo {
        columns: vec![ColumnInfo {
            name: "a".to_string(),
            dtype: "Int64".to_string(),
            sample_values: vec!["1".to_string()],
            column_stats: ColumnStats::default(),
        }],
        row_count: 10,
        file_size_bytes: Some(1234),
    }
}

/// A DataPool that replays scripted query results and returns a fixed
/// schema for every URL.
pub struct ScriptedPool {
    pub query_results: Mutex<VecDeque<Result<QueryOutput, WorkerError>>>,
    pub queries_seen: Mutex<Vec<String>>,
    pub validate_result: Mutex<Option<WorkerError>>,
}

impl ScriptedPool {
    pub fn new(query_results: Vec<Result<QueryOutput, WorkerError>>) -> Arc<Self> {
        Arc::new(Self {
            query_results: Mutex::new(query_results.into()),
            queries_seen: Mutex::new(Vec::new()),
            validate_result: Mutex::new(None),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn failing_validation(self: Arc<Self>, error: WorkerError) -> Arc<Self> {
        *self.validate_result.lock() = Some(error);
        self
    }
}

#[async_trait]
impl DataPool for ScriptedPool {
    async fn validate_url(&self, _url: &str) -> Result<UrlInfo, WorkerError> {
        match self.validate_result.lock().clone() {
            Some(error) => Err(error),
            None => Ok(UrlInfo {
                file_size_bytes: Some(1234),
            }),
        }
    }

    async fn get_schema(&self, _url: &str) -> Result<SchemaInfo, WorkerError> {
        Ok(simple_schema())
    }

    async fn profile_columns(&self, _url: &str) -> Result<Vec<ColumnProfile>, WorkerError> {
        Ok(Vec::new())
    }

    async fn profile_column(
        &self,
        _url: &str,
        _table_name: &str,
        _column_name: &str,
        _column_type: &str,
    ) -> Result<Value, WorkerError> {
        Ok(serde_json::json!({ "stats": {} }))
    }

    async fn run_query(
        &self,
        sql: &str,
        _datasets: &[QueryDataset],
    ) -> Result<QueryOutput, WorkerError> {
        self.queries_seen.lock().push(sql.to_string());
        self.query_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ok_query_output(vec![vec![Value::from(1)]])))
    }
}
