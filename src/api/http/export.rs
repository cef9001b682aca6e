// src/api/http/export.rs
// Conversation export: JSON download and self-contained HTML

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use html_escape::encode_text;
use serde_json::json;
use sqlx::SqlitePool;

use crate::api::error::ApiResult;
use crate::state::AppState;

use super::auth::{CurrentUser, owned_conversation};

// ---------------------------------------------------------------------------
// GET /conversations/{id}/export
// ---------------------------------------------------------------------------

pub async fn export_json(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
) -> ApiResult<Response> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let messages: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
        "SELECT role, content, created_at, sql_query \
         FROM messages WHERE conversation_id = ? ORDER BY created_at",
    )
    .bind(&conversation.id)
    .fetch_all(&state.db)
    .await?;

    let datasets: Vec<(String, String, i64, i64, String)> = sqlx::query_as(
        "SELECT name, url, row_count, column_count, schema_json \
         FROM datasets WHERE conversation_id = ?",
    )
    .bind(&conversation.id)
    .fetch_all(&state.db)
    .await?;

    let export_data = json!({
        "conversation": {
            "id": conversation.id,
            "title": conversation.title,
            "created_at": conversation.created_at,
        },
        "messages": messages.iter().map(|(role, content, created_at, sql_query)| json!({
            "role": role,
            "content": content,
            "created_at": created_at,
            "sql_query": sql_query,
        })).collect::<Vec<_>>(),
        "datasets": datasets.iter().map(|(name, url, row_count, column_count, schema_json)| json!({
            "name": name,
            "url": url,
            "row_count": row_count,
            "column_count": column_count,
            "schema_json": schema_json,
        })).collect::<Vec<_>>(),
    });

    let body = serde_json::to_string_pretty(&export_data).unwrap_or_default();
    let disposition = format!(
        "attachment; filename=\"conversation-{}.json\"",
        conversation.id
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// GET /conversations/{id}/export/html
// ---------------------------------------------------------------------------

pub async fn export_html(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
) -> ApiResult<Response> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    let title = if conversation.title.is_empty() {
        "Untitled Conversation".to_string()
    } else {
        conversation.title.clone()
    };

    let html = generate_conversation_html(&state.db, &conversation.id, &title).await?;
    let disposition = format!(
        "attachment; filename=\"conversation-{}.html\"",
        conversation.id
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        html,
    )
        .into_response())
}

/// Render a conversation as a standalone printable HTML document: embedded
/// CSS, role-tagged bubbles, SQL in code blocks, dark/light support.
pub async fn generate_conversation_html(
    db: &SqlitePool,
    conversation_id: &str,
    title: &str,
) -> Result<String, sqlx::Error> {
    let escaped_title = encode_text(title).into_owned();

    let messages: Vec<(String, String, Option<String>, String)> = sqlx::query_as(
        "SELECT role, content, sql_query, created_at \
         FROM messages WHERE conversation_id = ? ORDER BY created_at",
    )
    .bind(conversation_id)
    .fetch_all(db)
    .await?;

    let datasets: Vec<(String, String, i64, i64)> = sqlx::query_as(
        "SELECT name, url, row_count, column_count \
         FROM datasets WHERE conversation_id = ?",
    )
    .bind(conversation_id)
    .fetch_all(db)
    .await?;

    let mut messages_html = String::new();
    for (role, content, sql_query, created_at) in &messages {
        let content_html = encode_text(content).replace('\n', "<br>");
        let (role_class, role_label) = if role == "user" {
            ("user", "You")
        } else {
            ("assistant", "Assistant")
        };

        messages_html.push_str(&format!("<div class=\"message {role_class}\">"));
        messages_html.push_str(&format!(
            "<div class=\"message-header\"><span class=\"role\">{role_label}</span>"
        ));
        if !created_at.is_empty() {
            messages_html.push_str(&format!(
                "<span class=\"timestamp\">{}</span>",
                encode_text(created_at)
            ));
        }
        messages_html.push_str("</div>");
        messages_html.push_str(&format!(
            "<div class=\"message-content\">{content_html}</div>"
        ));

        if let Some(sql) = sql_query {
            if !sql.is_empty() {
                messages_html.push_str(&format!(
                    "<div class=\"sql-block\"><div class=\"sql-label\">SQL Query</div>\
                     <pre><code>{}</code></pre></div>",
                    encode_text(sql)
                ));
            }
        }
        messages_html.push_str("</div>\n");
    }

    let mut datasets_html = String::new();
    if !datasets.is_empty() {
        datasets_html.push_str("<div class=\"datasets-section\"><h2>Datasets</h2>");
        for (name, url, row_count, column_count) in &datasets {
            let name = if name.is_empty() {
                "Unnamed".to_string()
            } else {
                encode_text(name).into_owned()
            };
            datasets_html.push_str(&format!(
                "<div class=\"dataset-item\"><strong>{name}</strong>\
                 <span class=\"dataset-meta\">{row_count} rows, {column_count} columns</span>"
            ));
            if !url.is_empty() {
                datasets_html.push_str(&format!(
                    "<br><span class=\"dataset-url\">{}</span>",
                    encode_text(url)
                ));
            }
            datasets_html.push_str("</div>");
        }
        datasets_html.push_str("</div>");
    }

    Ok(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{escaped_title} - ChatDF Export</title>
<style>
  :root {{
    --bg: #ffffff;
    --surface: #f8f9fa;
    --text: #1a1a1a;
    --text-secondary: #6b7280;
    --border: #e5e7eb;
    --user-bg: #3b82f6;
    --user-text: #ffffff;
    --assistant-bg: #f3f4f6;
    --assistant-text: #1a1a1a;
    --sql-bg: #f8f5f0;
    --sql-border: #e8e0d4;
    --sql-label: #8b7355;
  }}
  @media (prefers-color-scheme: dark) {{
    :root {{
      --bg: #111827;
      --surface: #1f2937;
      --text: #f3f4f6;
      --text-secondary: #9ca3af;
      --border: #374151;
      --user-bg: #2563eb;
      --assistant-bg: #1f2937;
      --assistant-text: #f3f4f6;
      --sql-bg: #1e2330;
      --sql-border: #2d3748;
      --sql-label: #a0aec0;
    }}
  }}
  * {{ box-sizing: border-box; margin: 0; padding: 0; }}
  body {{
    font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, "Helvetica Neue", Arial, sans-serif;
    background-color: var(--bg);
    color: var(--text);
    line-height: 1.6;
    max-width: 800px;
    margin: 0 auto;
    padding: 2rem 1rem;
  }}
  h1 {{ font-size: 1.5rem; font-weight: 600; margin-bottom: 0.25rem; }}
  .export-meta {{
    font-size: 0.8rem;
    color: var(--text-secondary);
    margin-bottom: 2rem;
    padding-bottom: 1rem;
    border-bottom: 1px solid var(--border);
  }}
  .datasets-section {{
    margin-bottom: 2rem;
    padding: 1rem;
    background: var(--surface);
    border-radius: 8px;
    border: 1px solid var(--border);
  }}
  .datasets-section h2 {{
    font-size: 0.9rem;
    font-weight: 600;
    margin-bottom: 0.75rem;
    color: var(--text-secondary);
    text-transform: uppercase;
    letter-spacing: 0.05em;
  }}
  .dataset-item {{ padding: 0.5rem 0; font-size: 0.85rem; }}
  .dataset-item + .dataset-item {{ border-top: 1px solid var(--border); }}
  .dataset-meta {{ color: var(--text-secondary); margin-left: 0.5rem; font-size: 0.8rem; }}
  .dataset-url {{ color: var(--text-secondary); font-size: 0.75rem; word-break: break-all; }}
  .messages {{ display: flex; flex-direction: column; gap: 1rem; }}
  .message {{ display: flex; flex-direction: column; max-width: 85%; }}
  .message.user {{ align-self: flex-end; }}
  .message.assistant {{ align-self: flex-start; }}
  .message-header {{
    display: flex;
    align-items: center;
    gap: 0.5rem;
    margin-bottom: 0.25rem;
    font-size: 0.75rem;
  }}
  .message.user .message-header {{ justify-content: flex-end; }}
  .role {{ font-weight: 600; color: var(--text-secondary); }}
  .timestamp {{ color: var(--text-secondary); font-size: 0.7rem; }}
  .message-content {{
    padding: 0.75rem 1rem;
    border-radius: 12px;
    font-size: 0.9rem;
    word-wrap: break-word;
  }}
  .message.user .message-content {{
    background-color: var(--user-bg);
    color: var(--user-text);
    border-bottom-right-radius: 4px;
  }}
  .message.assistant .message-content {{
    background-color: var(--assistant-bg);
    color: var(--assistant-text);
    border-bottom-left-radius: 4px;
    border: 1px solid var(--border);
  }}
  .sql-block {{
    margin-top: 0.5rem;
    border: 1px solid var(--sql-border);
    border-radius: 8px;
    overflow: hidden;
  }}
  .sql-label {{
    font-size: 0.7rem;
    font-weight: 600;
    text-transform: uppercase;
    letter-spacing: 0.05em;
    padding: 0.25rem 0.75rem;
    background: var(--sql-border);
    color: var(--sql-label);
  }}
  .sql-block pre {{
    margin: 0;
    padding: 0.75rem;
    background: var(--sql-bg);
    overflow-x: auto;
    font-size: 0.8rem;
    line-height: 1.5;
  }}
  .sql-block code {{
    font-family: "SF Mono", "Fira Code", Menlo, Consolas, monospace;
    white-space: pre-wrap;
    word-break: break-word;
  }}
  .footer {{
    margin-top: 2rem;
    padding-top: 1rem;
    border-top: 1px solid var(--border);
    font-size: 0.75rem;
    color: var(--text-secondary);
    text-align: center;
  }}
  @media print {{
    body {{ max-width: 100%; padding: 1rem; }}
    .message {{ max-width: 100%; page-break-inside: avoid; }}
  }}
</style>
</head>
<body>
  <h1>{escaped_title}</h1>
  <div class="export-meta">Exported from ChatDF</div>

  {datasets_html}

  <div class="messages">
    {messages_html}
  </div>

  <div class="footer">
    Exported from ChatDF
  </div>
</body>
</html>"#
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_iso;

    #[tokio::test]
    async fn test_html_export_escapes_content() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::db::init_schema(&pool).await.unwrap();
        let now = now_iso();
        sqlx::query(
            "INSERT INTO users (id, google_id, email, name, created_at, last_login_at) \
             VALUES ('u1', 'g1', 'a@b.c', 'A', ?, ?)",
        )
        .bind(&now)
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at) \
             VALUES ('c1', 'u1', '<b>title</b>', ?, ?)",
        )
        .bind(&now)
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, sql_query, created_at) \
             VALUES ('m1', 'c1', 'user', '<script>x</script>', 'SELECT 1', ?)",
        )
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();

        let html = generate_conversation_html(&pool, "c1", "<b>title</b>")
            .await
            .unwrap();
        assert!(!html.contains("<script>x</script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("SQL Query"));
        assert!(html.contains("SELECT 1"));
    }

    #[tokio::test]
    async fn test_html_export_lists_datasets() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::db::init_schema(&pool).await.unwrap();
        let now = now_iso();
        sqlx::query(
            "INSERT INTO users (id, google_id, email, name, created_at, last_login_at) \
             VALUES ('u1', 'g1', 'a@b.c', 'A', ?, ?)",
        )
        .bind(&now)
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at) \
             VALUES ('c1', 'u1', 't', ?, ?)",
        )
        .bind(&now)
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO datasets \
             (id, conversation_id, url, name, row_count, column_count, loaded_at) \
             VALUES ('d1', 'c1', 'https://e.com/x.parquet', 'table1', 42, 3, ?)",
        )
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();

        let html = generate_conversation_html(&pool, "c1", "t").await.unwrap();
        assert!(html.contains("table1"));
        assert!(html.contains("42 rows, 3 columns"));
    }
}
