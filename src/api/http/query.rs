// src/api/http/query.rs
// Direct SQL against conversation datasets, plus LLM-backed SQL helpers

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::config::CONFIG;
use crate::db::now_iso;
use crate::state::AppState;
use crate::workers::{DataPool, QueryDataset};

use super::auth::{CurrentUser, owned_conversation};

#[derive(Deserialize)]
pub struct RunQueryRequest {
    pub sql: String,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    50
}

#[derive(Deserialize)]
pub struct ExplainSqlRequest {
    pub query: String,
    #[serde(default)]
    pub schema_json: Option<String>,
}

#[derive(Deserialize)]
pub struct GenerateSqlRequest {
    pub question: String,
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/query
// ---------------------------------------------------------------------------

/// Execute raw SQL against the conversation's ready datasets with
/// server-side pagination. Every run lands in `query_history`; history
/// failures never fail the request.
pub async fn run_query(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<RunQueryRequest>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT url, name FROM datasets WHERE conversation_id = ? AND status = 'ready'",
    )
    .bind(&conversation.id)
    .fetch_all(&state.db)
    .await?;
    if rows.is_empty() {
        return Err(ApiError::bad_request(
            "No datasets loaded in this conversation",
        ));
    }
    let datasets: Vec<QueryDataset> = rows
        .into_iter()
        .map(|(url, name)| QueryDataset {
            url,
            table_name: name,
        })
        .collect();

    let start = Instant::now();
    let result = state.worker_pool.run_query(&body.sql, &datasets).await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            record_history(
                &state,
                &user.id,
                &conversation.id,
                &body.sql,
                elapsed_ms,
                0,
                "error",
                Some(&e.message),
            )
            .await;
            return Err(ApiError::bad_request(e.message));
        }
    };

    record_history(
        &state,
        &user.id,
        &conversation.id,
        &body.sql,
        elapsed_ms,
        output.total_rows as i64,
        "success",
        None,
    )
    .await;

    let page = body.page.max(1);
    let page_size = body.page_size.clamp(1, 1000);
    let start_idx = (page - 1) * page_size;
    let paginated: Vec<&Vec<Value>> = output
        .rows
        .iter()
        .skip(start_idx)
        .take(page_size)
        .collect();
    let total_pages = if output.rows.is_empty() {
        1
    } else {
        output.rows.len().div_ceil(page_size)
    };

    Ok(Json(json!({
        "columns": output.columns,
        "rows": paginated,
        "total_rows": output.total_rows,
        "execution_time_ms": (elapsed_ms * 100.0).round() / 100.0,
        "page": page,
        "page_size": page_size,
        "total_pages": total_pages,
        "cached": output.cached,
        "limit_applied": output.limit_applied,
    })))
}

#[allow(clippy::too_many_arguments)]
async fn record_history(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
    sql: &str,
    elapsed_ms: f64,
    row_count: i64,
    status: &str,
    error_message: Option<&str>,
) {
    let result = sqlx::query(
        "INSERT INTO query_history \
         (id, user_id, conversation_id, query, execution_time_ms, row_count, status, \
          error_message, source, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'sql_panel', ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(conversation_id)
    .bind(sql)
    .bind((elapsed_ms * 100.0).round() / 100.0)
    .bind(row_count)
    .bind(status)
    .bind(error_message)
    .bind(now_iso())
    .execute(&state.db)
    .await;
    if let Err(e) = result {
        warn!("Failed to record query history: {}", e);
    }
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/explain-sql
// ---------------------------------------------------------------------------

pub async fn explain_sql(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<ExplainSqlRequest>,
) -> ApiResult<Json<Value>> {
    owned_conversation(&state, &user.id, &conversation_id).await?;

    let prompt = format!(
        "Explain this SQL query in plain English. Be concise (2-4 sentences). \
         Schema: {}\nQuery: {}",
        body.schema_json.as_deref().unwrap_or("[]"),
        body.query
    );

    let explanation = state
        .llm
        .generate(&CONFIG.gemini.model, &prompt)
        .await
        .map_err(|e| ApiError::bad_gateway(format!("LLM error: {e}")))?;
    let explanation = if explanation.is_empty() {
        "Unable to generate explanation.".to_string()
    } else {
        explanation
    };

    Ok(Json(json!({ "explanation": explanation })))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/generate-sql
// ---------------------------------------------------------------------------

pub async fn generate_sql(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<GenerateSqlRequest>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT name, schema_json, column_descriptions \
         FROM datasets WHERE conversation_id = ? AND status = 'ready'",
    )
    .bind(&conversation.id)
    .fetch_all(&state.db)
    .await?;
    if rows.is_empty() {
        return Err(ApiError::bad_request(
            "No datasets loaded in this conversation",
        ));
    }

    let mut schema_parts: Vec<String> = Vec::new();
    for (table_name, schema_json, column_descriptions) in &rows {
        let schema: Vec<Value> = serde_json::from_str(schema_json).unwrap_or_default();
        let descriptions: Value =
            serde_json::from_str(column_descriptions).unwrap_or_else(|_| json!({}));

        let mut cols_info: Vec<String> = Vec::new();
        for col in &schema {
            let name = col.get("name").and_then(|n| n.as_str()).unwrap_or("unknown");
            let dtype = col.get("type").and_then(|t| t.as_str()).unwrap_or("unknown");
            match descriptions.get(name).and_then(|d| d.as_str()) {
                Some(desc) if !desc.is_empty() => {
                    cols_info.push(format!("  - {name} ({dtype}): {desc}"));
                }
                _ => cols_info.push(format!("  - {name} ({dtype})")),
            }
        }
        schema_parts.push(format!(
            "Table: {table_name}\nColumns:\n{}",
            cols_info.join("\n")
        ));
    }

    let prompt = format!(
        "You are a SQL query generator. Given the following table schemas and a user's \
         question in natural language, generate a SQL query that answers it.\n\n\
         Use Polars SQL dialect. Always include LIMIT 1000 unless the user asks for a \
         specific count or aggregate.\n\n\
         Tables:\n{}\n\nQuestion: {}\n\n\
         Respond in this exact format:\n\
         SQL: <the sql query>\n\
         EXPLANATION: <1-2 sentence explanation of what the query does>",
        schema_parts.join("\n\n"),
        body.question
    );

    let raw = state
        .llm
        .generate(&CONFIG.gemini.model, &prompt)
        .await
        .map_err(|e| ApiError::bad_gateway(format!("LLM error: {e}")))?;

    let (sql, explanation) = parse_generated_sql(&raw);
    Ok(Json(json!({ "sql": sql, "explanation": explanation })))
}

/// Pull the SQL and explanation out of the model's `SQL:`/`EXPLANATION:`
/// response, stripping markdown fences.
fn parse_generated_sql(raw: &str) -> (String, String) {
    let mut sql = raw.to_string();
    let mut explanation = String::new();

    if let Some(sql_start) = raw.find("SQL:") {
        let after_sql = &raw[sql_start + 4..];
        if let Some(expl_offset) = after_sql.find("EXPLANATION:") {
            sql = after_sql[..expl_offset].trim().to_string();
            explanation = after_sql[expl_offset + "EXPLANATION:".len()..]
                .trim()
                .to_string();
        } else {
            sql = after_sql.trim().to_string();
        }
    }

    let mut sql = sql.trim().to_string();
    if let Some(stripped) = sql.strip_prefix("```sql") {
        sql = stripped.to_string();
    } else if let Some(stripped) = sql.strip_prefix("```") {
        sql = stripped.to_string();
    }
    if let Some(stripped) = sql.strip_suffix("```") {
        sql = stripped.to_string();
    }
    (sql.trim().to_string(), explanation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generated_sql_structured() {
        let raw = "SQL: SELECT * FROM t LIMIT 10\nEXPLANATION: Selects ten rows.";
        let (sql, explanation) = parse_generated_sql(raw);
        assert_eq!(sql, "SELECT * FROM t LIMIT 10");
        assert_eq!(explanation, "Selects ten rows.");
    }

    #[test]
    fn test_parse_generated_sql_fenced() {
        let raw = "SQL: ```sql\nSELECT 1\n```\nEXPLANATION: One.";
        let (sql, explanation) = parse_generated_sql(raw);
        assert_eq!(sql, "SELECT 1");
        assert_eq!(explanation, "One.");
    }

    #[test]
    fn test_parse_generated_sql_unstructured_falls_back_to_raw() {
        let raw = "SELECT 2";
        let (sql, explanation) = parse_generated_sql(raw);
        assert_eq!(sql, "SELECT 2");
        assert!(explanation.is_empty());
    }
}
