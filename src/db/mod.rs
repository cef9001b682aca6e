// src/db/mod.rs
// SQLite pool setup and schema creation

pub mod models;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

/// Full relational schema. One table per entity, cascades rooted at
/// `users.id` and `conversations.id`, `SET NULL` on the support tables.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id              TEXT PRIMARY KEY,
    google_id       TEXT NOT NULL UNIQUE,
    email           TEXT NOT NULL,
    name            TEXT NOT NULL,
    avatar_url      TEXT,
    created_at      TEXT NOT NULL,
    last_login_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS referral_keys (
    key             TEXT PRIMARY KEY,
    created_by      TEXT REFERENCES users(id) ON DELETE SET NULL,
    used_by         TEXT REFERENCES users(id) ON DELETE SET NULL,
    created_at      TEXT NOT NULL,
    used_at         TEXT
);

CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    title           TEXT NOT NULL DEFAULT '',
    is_pinned       INTEGER NOT NULL DEFAULT 0,
    share_token     TEXT UNIQUE,
    shared_at       TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id                TEXT PRIMARY KEY,
    conversation_id   TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role              TEXT NOT NULL CHECK(role IN ('user', 'assistant')),
    content           TEXT NOT NULL,
    sql_query         TEXT,
    sql_executions    TEXT,
    reasoning         TEXT,
    tool_call_trace   TEXT,
    input_tokens      INTEGER NOT NULL DEFAULT 0,
    output_tokens     INTEGER NOT NULL DEFAULT 0,
    token_count       INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS datasets (
    id                  TEXT PRIMARY KEY,
    conversation_id     TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    url                 TEXT NOT NULL,
    name                TEXT NOT NULL,
    row_count           INTEGER NOT NULL DEFAULT 0,
    column_count        INTEGER NOT NULL DEFAULT 0,
    schema_json         TEXT NOT NULL DEFAULT '[]',
    status              TEXT NOT NULL DEFAULT 'loading' CHECK(status IN ('loading', 'ready', 'error')),
    error_message       TEXT,
    loaded_at           TEXT NOT NULL,
    file_size_bytes     INTEGER,
    column_descriptions TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS token_usage (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    conversation_id TEXT REFERENCES conversations(id) ON DELETE SET NULL,
    model_name      TEXT NOT NULL DEFAULT 'gemini-2.5-flash',
    input_tokens    INTEGER NOT NULL,
    output_tokens   INTEGER NOT NULL,
    cost            REAL NOT NULL DEFAULT 0.0,
    timestamp       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS saved_queries (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name            TEXT NOT NULL,
    query           TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS query_history (
    id                TEXT PRIMARY KEY,
    user_id           TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    conversation_id   TEXT REFERENCES conversations(id) ON DELETE SET NULL,
    query             TEXT NOT NULL,
    execution_time_ms REAL NOT NULL DEFAULT 0,
    row_count         INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL,
    error_message     TEXT,
    source            TEXT NOT NULL DEFAULT 'sql_panel',
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS query_results_cache (
    cache_key       TEXT PRIMARY KEY,
    sql_query       TEXT NOT NULL,
    dataset_urls    TEXT NOT NULL,
    result_json     TEXT NOT NULL,
    row_count       INTEGER,
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_google_id ON users(google_id);
CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_referral_keys_used_by ON referral_keys(used_by);
CREATE INDEX IF NOT EXISTS idx_conversations_user_id ON conversations(user_id);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_datasets_conversation_id ON datasets(conversation_id);
CREATE INDEX IF NOT EXISTS idx_token_usage_user_timestamp ON token_usage(user_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_saved_queries_user_id ON saved_queries(user_id);
CREATE INDEX IF NOT EXISTS idx_query_history_user_id ON query_history(user_id);
CREATE INDEX IF NOT EXISTS idx_query_cache_created ON query_results_cache(created_at);
"#;

/// Connect to the database and create the schema if needed.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    info!("Connecting to database: {}", database_url);
    let pool = SqlitePool::connect(database_url).await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(pool)
        .await?;
    for statement in SCHEMA_SQL.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Current time as a naive-UTC ISO-8601 string.
///
/// All persisted timestamps go through this helper so lexicographic
/// comparison on the TEXT columns equals chronological comparison.
pub fn now_iso() -> String {
    chrono::Utc::now()
        .naive_utc()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// A timestamp `seconds` before now, same format as [`now_iso`].
pub fn iso_secs_ago(seconds: i64) -> String {
    (chrono::Utc::now() - chrono::Duration::seconds(seconds))
        .naive_utc()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_creates_all_tables() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        for expected in [
            "users",
            "sessions",
            "referral_keys",
            "conversations",
            "messages",
            "datasets",
            "token_usage",
            "saved_queries",
            "query_history",
            "query_results_cache",
        ] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }

    #[tokio::test]
    async fn test_cascade_delete_conversation() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();

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
             VALUES ('c1', 'u1', '', ?, ?)",
        )
        .bind(&now)
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, created_at) \
             VALUES ('m1', 'c1', 'user', 'hi', ?)",
        )
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO datasets (id, conversation_id, url, name, loaded_at) \
             VALUES ('d1', 'c1', 'https://e.com/x.parquet', 'table1', ?)",
        )
        .bind(&now)
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query("DELETE FROM conversations WHERE id = 'c1'")
            .execute(&pool)
            .await
            .unwrap();

        let msgs: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        let ds: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM datasets")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(msgs.0, 0);
        assert_eq!(ds.0, 0);
    }

    #[test]
    fn test_now_iso_orders_lexicographically() {
        let earlier = iso_secs_ago(60);
        let now = now_iso();
        assert!(earlier < now);
    }
}
