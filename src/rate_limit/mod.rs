// src/rate_limit/mod.rs

//! Rolling-window token budget accounting.
//!
//! The `token_usage` ledger table is the source of truth; a short-TTL
//! per-user memo keeps the read path cheap. The window is the last 24 hours
//! ending now, exclusive at the left boundary: a record at exactly 24h ago
//! has fallen out.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::db::{iso_secs_ago, now_iso};

const WINDOW_SECONDS: i64 = 24 * 3600;
const WARNING_PERCENT: f64 = 80.0;

/// Snapshot of a user's standing against the token budget.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub usage_tokens: i64,
    pub limit_tokens: i64,
    pub remaining_tokens: i64,
    pub usage_percent: f64,
    pub warning: bool,
    pub allowed: bool,
    pub resets_in_seconds: Option<i64>,
}

pub struct RateLimiter {
    db: SqlitePool,
    token_limit: i64,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, (RateLimitStatus, Instant)>>,
}

impl RateLimiter {
    pub fn new(db: SqlitePool, token_limit: i64, cache_ttl_secs: u64) -> Self {
        Self {
            db,
            token_limit,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Current status for a user. Served from the memo when fresh; expired
    /// entries are bypassed and replaced on the next read.
    pub async fn check_limit(&self, user_id: &str) -> Result<RateLimitStatus> {
        if let Some(status) = self.cached_status(user_id) {
            return Ok(status);
        }

        let status = self.compute_status(user_id).await?;
        self.cache
            .lock()
            .insert(user_id.to_string(), (status.clone(), Instant::now()));
        Ok(status)
    }

    fn cached_status(&self, user_id: &str) -> Option<RateLimitStatus> {
        let cache = self.cache.lock();
        let (status, at) = cache.get(user_id)?;
        if at.elapsed() < self.cache_ttl {
            Some(status.clone())
        } else {
            None
        }
    }

    async fn compute_status(&self, user_id: &str) -> Result<RateLimitStatus> {
        let cutoff = iso_secs_ago(WINDOW_SECONDS);

        // Strictly greater than: records at exactly 24h ago are excluded.
        let usage_tokens: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(input_tokens + output_tokens), 0) \
             FROM token_usage WHERE user_id = ? AND timestamp > ?",
        )
        .bind(user_id)
        .bind(&cutoff)
        .fetch_one(&self.db)
        .await?;

        let allowed = usage_tokens < self.token_limit;
        let usage_percent = usage_tokens as f64 / self.token_limit as f64 * 100.0;

        let resets_in_seconds = if allowed {
            None
        } else {
            let oldest: Option<String> = sqlx::query_scalar(
                "SELECT MIN(timestamp) FROM token_usage WHERE user_id = ? AND timestamp > ?",
            )
            .bind(user_id)
            .bind(&cutoff)
            .fetch_one(&self.db)
            .await?;
            oldest.and_then(|ts| seconds_until_expiry(&ts))
        };

        Ok(RateLimitStatus {
            usage_tokens,
            limit_tokens: self.token_limit,
            remaining_tokens: (self.token_limit - usage_tokens).max(0),
            usage_percent,
            warning: usage_percent >= WARNING_PERCENT,
            allowed,
            resets_in_seconds,
        })
    }

    /// Append a ledger row and invalidate the user's memoized status.
    pub async fn record_usage(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        model_name: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO token_usage \
             (id, user_id, conversation_id, model_name, input_tokens, output_tokens, cost, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, 0.0, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(conversation_id)
        .bind(model_name)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(now_iso())
        .execute(&self.db)
        .await?;

        self.cache.lock().remove(user_id);
        debug!(
            "Recorded usage for user {}: {} in / {} out",
            user_id, input_tokens, output_tokens
        );
        Ok(())
    }

    /// Drop all memoized statuses (test hook and admin escape hatch).
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

/// Seconds until an in-window ledger row falls out of the window.
fn seconds_until_expiry(timestamp: &str) -> Option<i64> {
    let parsed = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    let expires_at = parsed + chrono::Duration::seconds(WINDOW_SECONDS);
    let now = chrono::Utc::now().naive_utc();
    Some((expires_at - now).num_seconds().max(0))
}
