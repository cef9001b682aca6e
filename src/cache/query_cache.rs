// src/cache/query_cache.rs
// Two-tier query result cache: bounded in-memory map + persistent table

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::db::{iso_secs_ago, now_iso};

/// Cache key for a query: SHA-256 of the trimmed SQL and the sorted dataset
/// URLs, joined by pipes. Query text and dataset identities together address
/// the result.
pub fn query_cache_key(sql: &str, dataset_urls: &[String]) -> String {
    let mut urls: Vec<&str> = dataset_urls.iter().map(|u| u.as_str()).collect();
    urls.sort_unstable();
    let material = format!("{}|{}", sql.trim(), urls.join("|"));
    hex::encode(Sha256::digest(material.as_bytes()))
}

fn is_error_result(result: &Value) -> bool {
    result.get("error").is_some() || result.get("error_type").is_some()
}

/// Bounded in-memory tier. Entries expire after a TTL (monotonic clock) and
/// the oldest-inserted entry is evicted when the size cap is exceeded.
pub struct MemoryQueryCache {
    inner: Mutex<MemoryCacheInner>,
    max_entries: usize,
    ttl: Duration,
}

struct MemoryCacheInner {
    entries: HashMap<String, (Value, Instant)>,
    insertion_order: VecDeque<String>,
}

impl MemoryQueryCache {
    pub fn new(max_entries: usize, ttl_secs: u64) -> Self {
        Self {
            inner: Mutex::new(MemoryCacheInner {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
            max_entries,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some((value, expiry)) if *expiry > Instant::now() => Some(value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                inner.insertion_order.retain(|k| k != key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, result: &Value) {
        if is_error_result(result) {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(key) {
            inner.insertion_order.push_back(key.to_string());
        }
        inner
            .entries
            .insert(key.to_string(), (result.clone(), Instant::now() + self.ttl));

        while inner.entries.len() > self.max_entries {
            if let Some(oldest) = inner.insertion_order.pop_front() {
                inner.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.insertion_order.clear();
    }
}

/// Persistent tier over the `query_results_cache` table.
///
/// Best effort throughout: database errors and corrupt JSON read back as
/// cache misses, never as failures in the query path.
pub struct PersistentQueryCache {
    db: SqlitePool,
    ttl_secs: i64,
    max_entries: i64,
}

impl PersistentQueryCache {
    pub fn new(db: SqlitePool, ttl_secs: i64, max_entries: i64) -> Self {
        Self {
            db,
            ttl_secs,
            max_entries,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let row = sqlx::query(
            "SELECT result_json, expires_at FROM query_results_cache WHERE cache_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await
        .ok()??;

        let expires_at: String = row.get("expires_at");
        if expires_at <= now_iso() {
            debug!("Persistent cache entry expired: key={}", &key[..8.min(key.len())]);
            let _ = sqlx::query("DELETE FROM query_results_cache WHERE cache_key = ?")
                .bind(key)
                .execute(&self.db)
                .await;
            return None;
        }

        let result_json: String = row.get("result_json");
        serde_json::from_str(&result_json).ok()
    }

    pub async fn put(&self, key: &str, sql: &str, dataset_urls: &[String], result: &Value) {
        if is_error_result(result) {
            return;
        }
        let result_json = match serde_json::to_string(result) {
            Ok(json) => json,
            Err(_) => return,
        };
        let row_count = result
            .get("total_rows")
            .or_else(|| result.get("row_count"))
            .and_then(|v| v.as_i64());
        let now = now_iso();
        let expires_at = iso_secs_ago(-self.ttl_secs);

        let insert = sqlx::query(
            "INSERT OR REPLACE INTO query_results_cache \
             (cache_key, sql_query, dataset_urls, result_json, row_count, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(sql)
        .bind(dataset_urls.join("|"))
        .bind(&result_json)
        .bind(row_count)
        .bind(&now)
        .bind(&expires_at)
        .execute(&self.db)
        .await;
        if insert.is_err() {
            return;
        }

        self.evict_oldest().await;
    }

    async fn evict_oldest(&self) {
        let count: i64 = match sqlx::query_scalar("SELECT COUNT(*) FROM query_results_cache")
            .fetch_one(&self.db)
            .await
        {
            Ok(c) => c,
            Err(_) => return,
        };
        if count <= self.max_entries {
            return;
        }
        let to_delete = count - self.max_entries;
        let result = sqlx::query(
            "DELETE FROM query_results_cache WHERE cache_key IN ( \
               SELECT cache_key FROM query_results_cache ORDER BY created_at ASC LIMIT ? \
             )",
        )
        .bind(to_delete)
        .execute(&self.db)
        .await;
        if let Ok(r) = result {
            debug!("Evicted {} oldest persistent cache entries", r.rows_affected());
        }
    }

    /// Delete all expired rows; returns the deletion count.
    pub async fn cleanup(&self) -> i64 {
        let deleted = sqlx::query("DELETE FROM query_results_cache WHERE expires_at <= ?")
            .bind(now_iso())
            .execute(&self.db)
            .await
            .map(|r| r.rows_affected() as i64)
            .unwrap_or(0);
        if deleted > 0 {
            info!("Cleaned up {} expired query cache entries", deleted);
        }
        deleted
    }

    pub async fn entry_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM query_results_cache")
            .fetch_one(&self.db)
            .await
            .unwrap_or(0)
    }
}
