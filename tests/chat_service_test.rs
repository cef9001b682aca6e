// tests/chat_service_test.rs
// Turn state machine tests: persistence, events, rate gating, tool
// dispatch, retry, cancellation, concurrency guard.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use chatdf_backend::chat::{ChatError, ChatService};
use chatdf_backend::datasets::DatasetCatalog;
use chatdf_backend::llm::ChatModel;
use chatdf_backend::rate_limit::RateLimiter;
use chatdf_backend::workers::{DataPool, WorkerError};

use common::*;

struct Harness {
    pool: sqlx::SqlitePool,
    service: Arc<ChatService>,
    events: Arc<CollectorSink>,
}

async fn harness(model: Arc<ScriptedModel>, data_pool: Arc<ScriptedPool>) -> Harness {
    let pool = fresh_db().await;
    seed_user(&pool, "u1").await;
    seed_conversation(&pool, "c1", "u1").await;

    let catalog = Arc::new(DatasetCatalog::new(pool.clone(), 50, "/tmp/chatdf-test-uploads"));
    let limiter = Arc::new(RateLimiter::new(pool.clone(), 5_000_000, 60));
    let service = Arc::new(ChatService::new(
        pool.clone(),
        model as Arc<dyn ChatModel>,
        data_pool as Arc<dyn DataPool>,
        catalog,
        limiter,
        test_limits(),
        test_gemini_config(),
    ));

    Harness {
        pool,
        service,
        events: CollectorSink::new(),
    }
}

async fn messages_by_role(pool: &sqlx::SqlitePool, role: &str) -> Vec<(String, String)> {
    sqlx::query_as("SELECT id, content FROM messages WHERE role = ? ORDER BY created_at")
        .bind(role)
        .fetch_all(pool)
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_full_flow_persists_both_messages_and_usage() {
    let model = ScriptedModel::new(vec![ScriptedTurn::new(vec![
        thought_chunk("Let me check."),
        text_chunk("Here is "),
        text_chunk("the data."),
        usage_chunk(100, 50),
    ])]);
    let h = harness(model, ScriptedPool::empty()).await;
    seed_usage(&h.pool, "u1", 1_000_000, 3600).await;

    let message_id = h
        .service
        .process_message("c1", "u1", "Show me the data", h.events.clone(), None)
        .await
        .unwrap();

    let users = messages_by_role(&h.pool, "user").await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].1, "Show me the data");

    let assistants = messages_by_role(&h.pool, "assistant").await;
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].0, message_id);
    assert_eq!(assistants[0].1, "Here is the data.");

    let (input, output): (i64, i64) = sqlx::query_as(
        "SELECT input_tokens, output_tokens FROM messages WHERE role = 'assistant'",
    )
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(input, 100);
    assert_eq!(output, 50);

    // Ledger grew by this turn's input + output.
    let total: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(input_tokens + output_tokens), 0) FROM token_usage",
    )
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(total, 1_000_000 + 150);

    let types = h.events.event_types();
    assert!(types.contains(&"qs".to_string()));
    assert!(types.contains(&"rt".to_string()));
    assert!(types.contains(&"rc".to_string()));
    assert!(types.contains(&"ct".to_string()));
    assert!(types.contains(&"cc".to_string()));

    let cc = &h.events.events_of_type("cc")[0];
    assert_eq!(cc["mid"], json!(message_id));
    assert_eq!(cc["it"], json!(100));
    assert_eq!(cc["ot"], json!(50));
    assert_eq!(cc["tc"], json!(150));
    assert_eq!(cc["r"], json!("Let me check."));
}

#[tokio::test]
async fn test_conversation_inactive_after_completion() {
    let model = ScriptedModel::new(vec![ScriptedTurn::new(vec![text_chunk("ok")])]);
    let h = harness(model, ScriptedPool::empty()).await;

    h.service
        .process_message("c1", "u1", "hello", h.events.clone(), None)
        .await
        .unwrap();
    assert!(!h.service.is_active("c1"));
}

// ---------------------------------------------------------------------------
// Concurrency guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_generation_conflicts() {
    let model = ScriptedModel::new(vec![ScriptedTurn::with_delay(
        vec![text_chunk("slow"), text_chunk(" reply")],
        Duration::from_millis(300),
    )]);
    let h = harness(model, ScriptedPool::empty()).await;

    let service = h.service.clone();
    let events = h.events.clone();
    let first = tokio::spawn(async move {
        service
            .process_message("c1", "u1", "first", events, None)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = h
        .service
        .process_message("c1", "u1", "second", CollectorSink::new(), None)
        .await;
    assert!(matches!(second, Err(ChatError::Conflict)));

    first.await.unwrap().unwrap();
    assert!(!h.service.is_active("c1"));
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_exceeded_limit_blocks_but_keeps_user_row() {
    let model = ScriptedModel::new(vec![ScriptedTurn::new(vec![text_chunk("never sent")])]);
    let h = harness(model, ScriptedPool::empty()).await;
    seed_usage(&h.pool, "u1", 5_100_000, 3600).await;

    let result = h
        .service
        .process_message("c1", "u1", "any message", h.events.clone(), None)
        .await;
    assert!(matches!(result, Err(ChatError::RateLimited { .. })));

    // The user's own message still lands in history; no assistant row.
    assert_eq!(messages_by_role(&h.pool, "user").await.len(), 1);
    assert_eq!(messages_by_role(&h.pool, "assistant").await.len(), 0);

    let types = h.events.event_types();
    assert!(types.contains(&"rle".to_string()));
    assert!(!types.contains(&"cc".to_string()));

    let ce = h.events.events_of_type("ce");
    assert_eq!(ce[0]["d"], json!("RateLimitError"));
    assert!(!h.service.is_active("c1"));
}

#[tokio::test]
async fn test_warning_emitted_near_limit() {
    let model = ScriptedModel::new(vec![ScriptedTurn::new(vec![text_chunk("ok")])]);
    let h = harness(model, ScriptedPool::empty()).await;
    seed_usage(&h.pool, "u1", 4_500_000, 3600).await;

    h.service
        .process_message("c1", "u1", "hello", h.events.clone(), None)
        .await
        .unwrap();

    assert!(h.events.event_types().contains(&"rlw".to_string()));
}

// ---------------------------------------------------------------------------
// Auto-title
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_auto_title_truncates_at_50_chars() {
    let model = ScriptedModel::new(vec![ScriptedTurn::new(vec![text_chunk("ok")])]);
    let h = harness(model, ScriptedPool::empty()).await;

    let content = "x".repeat(51);
    h.service
        .process_message("c1", "u1", &content, h.events.clone(), None)
        .await
        .unwrap();

    let title: String = sqlx::query_scalar("SELECT title FROM conversations WHERE id = 'c1'")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(title.chars().count(), 51);
    assert!(title.ends_with('\u{2026}'));
    assert_eq!(&title[..50], &"x".repeat(50));

    let ctu = h.events.events_of_type("ctu");
    assert_eq!(ctu[0]["t"], json!(title));
}

#[tokio::test]
async fn test_short_content_titled_without_ellipsis() {
    let model = ScriptedModel::new(vec![ScriptedTurn::new(vec![text_chunk("ok")])]);
    let h = harness(model, ScriptedPool::empty()).await;

    h.service
        .process_message("c1", "u1", "Sales question", h.events.clone(), None)
        .await
        .unwrap();

    let title: String = sqlx::query_scalar("SELECT title FROM conversations WHERE id = 'c1'")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(title, "Sales question");
}

// ---------------------------------------------------------------------------
// SQL tool: error then success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sql_error_fed_back_then_success() {
    let model = ScriptedModel::new(vec![
        ScriptedTurn::new(vec![tool_chunk(
            "execute_sql",
            json!({ "query": "SELECT * FORM table1" }),
        )]),
        ScriptedTurn::new(vec![tool_chunk(
            "execute_sql",
            json!({ "query": "SELECT * FROM table1 LIMIT 10" }),
        )]),
        ScriptedTurn::new(vec![text_chunk("Fixed it."), usage_chunk(20, 10)]),
    ]);
    let data_pool = ScriptedPool::new(vec![
        Err(WorkerError::sql(
            "SQL execution error: sql parser error: unexpected FORM",
            2.0,
        )),
        Ok(ok_query_output(vec![vec![json!(1)], vec![json!(2)]])),
    ]);
    let h = harness(model, data_pool.clone()).await;
    seed_dataset(&h.pool, "d1", "c1", "https://e.com/data.parquet").await;

    h.service
        .process_message("c1", "u1", "query the data", h.events.clone(), None)
        .await
        .unwrap();

    assert_eq!(data_pool.queries_seen.lock().len(), 2);

    // Two executions persisted, the first carrying the translated error.
    let executions_json: String =
        sqlx::query_scalar("SELECT sql_executions FROM messages WHERE role = 'assistant'")
            .fetch_one(&h.pool)
            .await
            .unwrap();
    let executions: Vec<Value> = serde_json::from_str(&executions_json).unwrap();
    assert_eq!(executions.len(), 2);
    assert!(executions[0]["error"].is_string());
    assert!(
        executions[0]["error"]
            .as_str()
            .unwrap()
            .contains("Technical details:")
    );
    assert!(executions[1]["error"].is_null());
    assert_eq!(executions[1]["total_rows"], json!(2));

    let types = h.events.event_types();
    assert_eq!(types.iter().filter(|t| *t == "tcs").count(), 2);
    assert_eq!(types.iter().filter(|t| *t == "qp").count(), 2);
    assert!(types.contains(&"cc".to_string()));
}

#[tokio::test]
async fn test_sql_retries_exhausted_instructs_model_to_stop() {
    let failing = || {
        Err::<chatdf_backend::workers::QueryOutput, _>(WorkerError::sql(
            "SQL execution error: boom",
            1.0,
        ))
    };
    let tool = || ScriptedTurn::new(vec![tool_chunk("execute_sql", json!({ "query": "SELECT 1" }))]);
    let model = ScriptedModel::new(vec![
        tool(),
        tool(),
        tool(),
        tool(),
        ScriptedTurn::new(vec![text_chunk("The query keeps failing.")]),
    ]);
    let data_pool = ScriptedPool::new(vec![failing(), failing(), failing()]);
    let h = harness(model, data_pool.clone()).await;
    seed_dataset(&h.pool, "d1", "c1", "https://e.com/data.parquet").await;

    h.service
        .process_message("c1", "u1", "try it", h.events.clone(), None)
        .await
        .unwrap();

    // Three attempts hit the engine; the fourth call is refused up front.
    assert_eq!(data_pool.queries_seen.lock().len(), 3);

    let content: String =
        sqlx::query_scalar("SELECT content FROM messages WHERE role = 'assistant'")
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(content, "The query keeps failing.");
}

// ---------------------------------------------------------------------------
// Tool budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_max_tool_calls_forces_final_text() {
    let tool = || ScriptedTurn::new(vec![tool_chunk("execute_sql", json!({ "query": "SELECT 1" }))]);
    let model = ScriptedModel::new(vec![
        tool(),
        tool(),
        tool(),
        tool(),
        tool(),
        tool(),
        ScriptedTurn::new(vec![text_chunk("Summary of findings.")]),
    ]);
    let data_pool = ScriptedPool::new(Vec::new());
    let h = harness(model.clone(), data_pool.clone()).await;
    seed_dataset(&h.pool, "d1", "c1", "https://e.com/data.parquet").await;

    h.service
        .process_message("c1", "u1", "dig deep", h.events.clone(), None)
        .await
        .unwrap();

    // Calls 1-5 dispatch; the sixth trips the cap and the final request
    // goes out without tools.
    assert_eq!(data_pool.queries_seen.lock().len(), 5);
    let last_request_tools = model.requests_seen.lock().last().unwrap().tools.clone();
    assert!(last_request_tools.is_none());

    let content: String =
        sqlx::query_scalar("SELECT content FROM messages WHERE role = 'assistant'")
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(content, "Summary of findings.");
}

// ---------------------------------------------------------------------------
// Follow-ups and charts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_followups_capped_to_three_and_80_chars() {
    let long = "y".repeat(120);
    let model = ScriptedModel::new(vec![
        ScriptedTurn::new(vec![tool_chunk(
            "suggest_followups",
            json!({ "suggestions": ["one", long, "three", "four"] }),
        )]),
        ScriptedTurn::new(vec![text_chunk("Done.")]),
    ]);
    let h = harness(model, ScriptedPool::empty()).await;

    h.service
        .process_message("c1", "u1", "analyze", h.events.clone(), None)
        .await
        .unwrap();

    let fs = h.events.events_of_type("fs");
    let suggestions = fs[0]["sg"].as_array().unwrap();
    assert_eq!(suggestions.len(), 3);
    for s in suggestions {
        assert!(s.as_str().unwrap().chars().count() <= 80);
    }
}

#[tokio::test]
async fn test_chart_spec_links_last_successful_execution() {
    let model = ScriptedModel::new(vec![
        ScriptedTurn::new(vec![tool_chunk("execute_sql", json!({ "query": "SELECT 1" }))]),
        ScriptedTurn::new(vec![tool_chunk(
            "create_chart",
            json!({ "chart_type": "bar", "title": "Counts" }),
        )]),
        ScriptedTurn::new(vec![text_chunk("Charted.")]),
    ]);
    let h = harness(model, ScriptedPool::new(Vec::new())).await;
    seed_dataset(&h.pool, "d1", "c1", "https://e.com/data.parquet").await;

    h.service
        .process_message("c1", "u1", "chart it", h.events.clone(), None)
        .await
        .unwrap();

    let cs = h.events.events_of_type("cs");
    assert_eq!(cs[0]["ei"], json!(0));
    assert_eq!(cs[0]["sp"]["chart_type"], json!("bar"));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stop_mid_stream_persists_partial_text() {
    let model = ScriptedModel::new(vec![ScriptedTurn::with_delay(
        vec![text_chunk("Hello"), text_chunk(" world")],
        Duration::from_millis(300),
    )]);
    let h = harness(model, ScriptedPool::empty()).await;

    let service = h.service.clone();
    let events = h.events.clone();
    let handle = tokio::spawn(async move {
        service
            .process_message("c1", "u1", "long answer", events, None)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.service.stop_generation("c1");

    handle.await.unwrap().unwrap();

    let assistants = messages_by_role(&h.pool, "assistant").await;
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].1, "Hello");
    assert!(h.events.event_types().contains(&"cc".to_string()));
    assert!(!h.service.is_active("c1"));
}

#[tokio::test]
async fn test_stop_unknown_conversation_is_noop() {
    let model = ScriptedModel::new(Vec::new());
    let h = harness(model, ScriptedPool::empty()).await;
    h.service.stop_generation("ghost");
}

// ---------------------------------------------------------------------------
// Provider rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_llm_429_retried_then_succeeds() {
    let model = ScriptedModel::new(vec![ScriptedTurn::new(vec![text_chunk("eventually")])])
        .rate_limited_for(2);
    let h = harness(model, ScriptedPool::empty()).await;

    h.service
        .process_message("c1", "u1", "hello", h.events.clone(), None)
        .await
        .unwrap();

    let assistants = messages_by_role(&h.pool, "assistant").await;
    assert_eq!(assistants[0].1, "eventually");
}

#[tokio::test]
async fn test_llm_429_exhausted_raises_busy() {
    let model = ScriptedModel::new(Vec::new()).rate_limited_for(10);
    let h = harness(model, ScriptedPool::empty()).await;

    let result = h
        .service
        .process_message("c1", "u1", "hello", h.events.clone(), None)
        .await;
    assert!(matches!(result, Err(ChatError::LlmBusy)));

    let ce = h.events.events_of_type("ce");
    assert_eq!(ce[0]["d"], json!("GeminiRateLimitError"));
    assert!(
        ce[0]["e"]
            .as_str()
            .unwrap()
            .contains("temporarily busy")
    );
    assert!(!h.service.is_active("c1"));
}
