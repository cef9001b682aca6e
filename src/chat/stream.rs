// src/chat/stream.rs
// Streaming loop: token fan-out, tool-call dispatch, SQL retry budget,
// provider 429 backoff, cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::ws::events;
use crate::datasets::DatasetCatalog;
use crate::db::models::Dataset;
use crate::llm::{ChatModel, Content, LlmError, Part, TurnRequest, tool_declarations};
use crate::workers::{DataPool, QueryDataset, translate_engine_error};

use super::context::ContextMessage;
use super::prompt::build_system_prompt;
use super::{ChatError, EventSink};

/// Result of a single SQL query execution within a turn.
///
/// `rows` is capped at 100 for WebSocket transmission; `full_rows` holds up
/// to 1000 rows for persistence. `total_rows` is the true result size.
#[derive(Debug, Clone, Default)]
pub struct SqlExecution {
    pub query: String,
    pub columns: Option<Vec<String>>,
    pub rows: Option<Vec<Vec<Value>>>,
    pub full_rows: Option<Vec<Vec<Value>>>,
    pub total_rows: Option<usize>,
    pub error: Option<String>,
    pub execution_time_ms: Option<f64>,
}

impl SqlExecution {
    /// Persistence shape: full rows under the `rows` key.
    pub fn to_db_json(&self) -> Value {
        json!({
            "query": self.query,
            "columns": self.columns,
            "rows": self.full_rows,
            "total_rows": self.total_rows,
            "error": self.error,
            "execution_time_ms": self.execution_time_ms,
        })
    }

    /// Wire shape: capped rows, suitable for the chat_complete event.
    pub fn to_wire_json(&self) -> Value {
        json!({
            "query": self.query,
            "columns": self.columns,
            "rows": self.rows,
            "total_rows": self.total_rows,
            "error": self.error,
            "execution_time_ms": self.execution_time_ms,
        })
    }
}

/// Everything a streaming turn produced.
#[derive(Debug, Default)]
pub struct StreamResult {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub assistant_message: String,
    pub reasoning: String,
    pub tool_calls_made: u32,
    pub sql_queries: Vec<String>,
    pub sql_executions: Vec<SqlExecution>,
    pub followup_suggestions: Vec<String>,
    pub tool_call_trace: Vec<Value>,
}

/// Tunables for one turn, lifted from CONFIG by the chat service.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub max_tool_calls: u32,
    pub max_sql_retries: u32,
    pub max_llm_retries: u32,
    pub llm_retry_base_delay: Duration,
    pub ws_row_cap: usize,
}

pub struct StreamContext<'a> {
    pub model: &'a Arc<dyn ChatModel>,
    pub model_id: &'a str,
    pub pool: &'a Arc<dyn DataPool>,
    pub catalog: &'a DatasetCatalog,
    pub conversation_id: &'a str,
    pub datasets: &'a [Dataset],
    pub events: &'a Arc<dyn EventSink>,
    pub cancel: &'a CancellationToken,
    pub settings: StreamSettings,
}

fn messages_to_contents(messages: &[ContextMessage]) -> Vec<Content> {
    messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| {
            if m.role == "assistant" {
                Content::model_text(m.content.clone())
            } else {
                Content::user(m.content.clone())
            }
        })
        .collect()
}

fn available_columns(datasets: &[Dataset]) -> Vec<String> {
    let mut columns = Vec::new();
    for ds in datasets {
        let Ok(schema) = serde_json::from_str::<Vec<Value>>(&ds.schema_json) else {
            continue;
        };
        for col in schema {
            if let Some(name) = col.get("name").and_then(|n| n.as_str()) {
                columns.push(name.to_string());
            }
        }
    }
    columns
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Stream one turn from the model, dispatching tool calls until the model
/// produces final text, the cancel token fires, or the budgets run out.
pub async fn stream_chat(
    ctx: StreamContext<'_>,
    messages: &[ContextMessage],
) -> Result<StreamResult, ChatError> {
    let mut result = StreamResult::default();
    let system_prompt = build_system_prompt(ctx.datasets);
    let mut contents = messages_to_contents(messages);
    let mut tools_enabled = true;

    let mut tool_call_count: u32 = 0;
    let mut sql_query_count: u32 = 0;
    let mut sql_retry_count: u32 = 0;
    let mut collected_text = String::new();
    let mut collected_reasoning = String::new();
    let mut reasoning_emitted = false;

    loop {
        // Open the stream, retrying the provider's 429-equivalent with
        // exponential backoff. The retry budget resets on every loop pass.
        let mut stream = None;
        for attempt in 0..=ctx.settings.max_llm_retries {
            let request = TurnRequest {
                model: ctx.model_id.to_string(),
                system_prompt: system_prompt.clone(),
                contents: contents.clone(),
                tools: tools_enabled.then(tool_declarations),
            };
            match ctx.model.stream_turn(request).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(LlmError::RateLimited) if attempt < ctx.settings.max_llm_retries => {
                    let delay = ctx.settings.llm_retry_base_delay * 2u32.pow(attempt);
                    warn!(
                        "LLM rate limited (attempt {}/{}), retrying in {:?}",
                        attempt + 1,
                        ctx.settings.max_llm_retries,
                        delay
                    );
                    // Keep-alive so the client knows the turn is still live.
                    ctx.events.send(events::chat_token("", "streaming")).await;
                    tokio::time::sleep(delay).await;
                }
                Err(LlmError::RateLimited) => {
                    return Err(ChatError::LlmBusy);
                }
                Err(other) => return Err(ChatError::Llm(other)),
            }
        }
        let Some(mut stream) = stream else {
            return Err(ChatError::LlmBusy);
        };

        let mut found_tool_call: Option<(String, Value)> = None;
        let mut last_usage = None;

        'chunks: while let Some(next) = stream.next().await {
            if ctx.cancel.is_cancelled() {
                result.assistant_message = collected_text;
                result.reasoning = collected_reasoning;
                return Ok(result);
            }

            let chunk = match next {
                Ok(chunk) => chunk,
                Err(e) => return Err(ChatError::Llm(e)),
            };
            if chunk.usage.is_some() {
                last_usage = chunk.usage;
            }

            for part in chunk.parts {
                match part {
                    Part::Text { text, thought: true } => {
                        collected_reasoning.push_str(&text);
                        result
                            .tool_call_trace
                            .push(json!({ "type": "reasoning", "content": text }));
                        ctx.events.send(events::reasoning_token(&text)).await;
                    }
                    Part::Text { text, thought: false } => {
                        if !collected_reasoning.is_empty() && !reasoning_emitted {
                            ctx.events.send(events::reasoning_complete()).await;
                            reasoning_emitted = true;
                        }
                        collected_text.push_str(&text);
                        result
                            .tool_call_trace
                            .push(json!({ "type": "text", "content": text }));
                        ctx.events.send(events::chat_token(&text, "streaming")).await;
                    }
                    Part::FunctionCall { name, args } => {
                        found_tool_call = Some((name, args));
                        break 'chunks;
                    }
                    Part::FunctionResponse { .. } => {}
                }
            }
        }

        if let Some(usage) = last_usage {
            result.input_tokens += usage.prompt_tokens;
            result.output_tokens += usage.candidates_tokens;
        }

        let Some((tool_name, tool_args)) = found_tool_call else {
            break;
        };

        if ctx.cancel.is_cancelled() {
            break;
        }

        tool_call_count += 1;
        result.tool_calls_made = tool_call_count;

        if tool_call_count > ctx.settings.max_tool_calls {
            // Budget exhausted: feed the pending call back with a user nudge
            // and force a final text-only response.
            contents.push(Content::model_function_call(&tool_name, tool_args));
            contents.push(Content::user(
                "Maximum tool calls reached. Please respond with the information you have \
                 gathered so far without making any more tool calls.",
            ));
            tools_enabled = false;
            continue;
        }

        ctx.events
            .send(events::tool_call_start(&tool_name, &tool_args))
            .await;

        let tool_result = match tool_name.as_str() {
            "execute_sql" => {
                dispatch_execute_sql(
                    &ctx,
                    &tool_args,
                    &mut result,
                    &mut sql_query_count,
                    &mut sql_retry_count,
                )
                .await
            }
            "load_dataset" => dispatch_load_dataset(&ctx, &tool_args).await,
            "create_chart" => dispatch_create_chart(&ctx, &tool_args, &result).await,
            "suggest_followups" => dispatch_suggest_followups(&ctx, &tool_args, &mut result).await,
            other => format!("Unknown tool: {other}"),
        };

        result.tool_call_trace.push(json!({
            "type": "tool_call",
            "tool": tool_name,
            "args": tool_args,
            "result": tool_result,
        }));

        contents.push(Content::model_function_call(&tool_name, tool_args.clone()));
        contents.push(Content::function_response(&tool_name, tool_result));
    }

    result.assistant_message = collected_text;
    result.reasoning = collected_reasoning;
    Ok(result)
}

async fn dispatch_execute_sql(
    ctx: &StreamContext<'_>,
    args: &Value,
    result: &mut StreamResult,
    sql_query_count: &mut u32,
    sql_retry_count: &mut u32,
) -> String {
    if *sql_retry_count >= ctx.settings.max_sql_retries {
        return "Maximum SQL retry attempts reached. Please explain the error to the user \
                instead of retrying."
            .to_string();
    }

    let query = args
        .get("query")
        .and_then(|q| q.as_str())
        .unwrap_or_default()
        .to_string();
    result.sql_queries.push(query.clone());
    *sql_query_count += 1;
    ctx.events
        .send(events::query_progress(*sql_query_count))
        .await;

    let worker_datasets: Vec<QueryDataset> = ctx
        .datasets
        .iter()
        .map(|ds| QueryDataset {
            url: ds.url.clone(),
            table_name: ds.name.clone(),
        })
        .collect();

    match ctx.pool.run_query(&query, &worker_datasets).await {
        Err(err) => {
            *sql_retry_count += 1;
            let columns = available_columns(ctx.datasets);
            let friendly = translate_engine_error(&err.message, &columns);
            result.sql_executions.push(SqlExecution {
                query,
                error: Some(friendly.clone()),
                execution_time_ms: err.execution_time_ms,
                ..Default::default()
            });

            let mut response = format!("Error executing SQL: {friendly}");
            if *sql_retry_count >= ctx.settings.max_sql_retries {
                response.push_str(
                    "\n\nMaximum SQL retry attempts reached. Please explain the error to the \
                     user instead of retrying.",
                );
            }
            response
        }
        Ok(output) => {
            let capped: Vec<Vec<Value>> = output
                .rows
                .iter()
                .take(ctx.settings.ws_row_cap)
                .cloned()
                .collect();
            let preview: Vec<&Vec<Value>> = output.rows.iter().take(20).collect();
            let response = format!(
                "Query executed successfully.\nColumns: {:?}\nTotal rows: {}\nResults (first {} rows): {}",
                output.columns,
                output.total_rows,
                output.rows.len(),
                serde_json::to_string(&preview).unwrap_or_default(),
            );

            result.sql_executions.push(SqlExecution {
                query,
                columns: Some(output.columns),
                rows: Some(capped),
                full_rows: Some(output.rows),
                total_rows: Some(output.total_rows),
                error: None,
                execution_time_ms: Some(output.execution_time_ms),
            });
            response
        }
    }
}

async fn dispatch_load_dataset(ctx: &StreamContext<'_>, args: &Value) -> String {
    let url = args
        .get("url")
        .and_then(|u| u.as_str())
        .unwrap_or_default();
    match ctx
        .catalog
        .add_dataset(ctx.conversation_id, url, ctx.pool, None)
        .await
    {
        Ok(dataset) => {
            info!(
                "Tool call loaded dataset '{}' into conversation {}",
                dataset.name, ctx.conversation_id
            );
            format!(
                "Dataset loaded successfully.\nTable name: {}\nRows: {}\nColumns: {}",
                dataset.name, dataset.row_count, dataset.column_count
            )
        }
        Err(e) => format!("Error loading dataset: {e}"),
    }
}

async fn dispatch_create_chart(
    ctx: &StreamContext<'_>,
    args: &Value,
    result: &StreamResult,
) -> String {
    // Charts attach to the most recent successful execution; when none
    // succeeded, the last execution is used.
    let execution_index = result
        .sql_executions
        .iter()
        .rposition(|e| e.error.is_none())
        .map(|i| i as i64)
        .unwrap_or(result.sql_executions.len() as i64 - 1);

    ctx.events
        .send(events::chart_spec(execution_index, args))
        .await;

    format!(
        "Chart created successfully. Type: {}, Title: {}",
        args.get("chart_type").and_then(|c| c.as_str()).unwrap_or("unknown"),
        args.get("title").and_then(|t| t.as_str()).unwrap_or("Untitled"),
    )
}

async fn dispatch_suggest_followups(
    ctx: &StreamContext<'_>,
    args: &Value,
    result: &mut StreamResult,
) -> String {
    let suggestions: Vec<String> = args
        .get("suggestions")
        .and_then(|s| s.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str())
                .take(3)
                .map(|s| truncate_chars(s, 80))
                .collect()
        })
        .unwrap_or_default();

    ctx.events
        .send(events::followup_suggestions(&suggestions))
        .await;
    result.followup_suggestions = suggestions;
    "Follow-up suggestions displayed to user.".to_string()
}
