// src/auth/mod.rs

//! Session validation for the authenticated scope.
//!
//! Login/identity minting belongs to the auth collaborator; this service
//! only validates session tokens, refreshes their expiry on use, and
//! resolves the owning user.

use anyhow::{Result, anyhow};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::User;
use crate::db::now_iso;

pub struct AuthService {
    db: SqlitePool,
    session_duration_days: i64,
}

impl AuthService {
    pub fn new(db: SqlitePool, session_duration_days: i64) -> Self {
        Self {
            db,
            session_duration_days,
        }
    }

    fn expiry_from_now(&self) -> String {
        (chrono::Utc::now() + chrono::Duration::days(self.session_duration_days))
            .naive_utc()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string()
    }

    /// Mint a session for a user (login boundary and tests).
    pub async fn create_session(&self, user_id: &str) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sessions (id, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session_id)
        .bind(user_id)
        .bind(now_iso())
        .bind(self.expiry_from_now())
        .execute(&self.db)
        .await?;
        Ok(session_id)
    }

    /// Resolve a session token to its user. Expired sessions are deleted;
    /// valid ones get a sliding expiry refresh.
    pub async fn validate_session(&self, token: &str) -> Result<User> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT user_id, expires_at FROM sessions WHERE id = ?")
                .bind(token)
                .fetch_optional(&self.db)
                .await?;

        let (user_id, expires_at) = row.ok_or_else(|| anyhow!("Invalid session"))?;
        if expires_at <= now_iso() {
            sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(token)
                .execute(&self.db)
                .await?;
            return Err(anyhow!("Session expired"));
        }

        sqlx::query("UPDATE sessions SET expires_at = ? WHERE id = ?")
            .bind(self.expiry_from_now())
            .bind(token)
            .execute(&self.db)
            .await?;

        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(&user_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| anyhow!("User not found"))
    }

    /// Delete a session (logout). Unknown tokens are a no-op.
    pub async fn delete_session(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service_with_user() -> (AuthService, SqlitePool) {
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
        (AuthService::new(pool.clone(), 7), pool)
    }

    #[tokio::test]
    async fn test_session_roundtrip() {
        let (auth, _pool) = service_with_user().await;
        let token = auth.create_session("u1").await.unwrap();
        let user = auth.validate_session(&token).await.unwrap();
        assert_eq!(user.id, "u1");
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let (auth, _pool) = service_with_user().await;
        assert!(auth.validate_session("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_expired_session_deleted() {
        let (auth, pool) = service_with_user().await;
        sqlx::query(
            "INSERT INTO sessions (id, user_id, created_at, expires_at) \
             VALUES ('old', 'u1', '2020-01-01T00:00:00', '2020-01-08T00:00:00')",
        )
        .execute(&pool)
        .await
        .unwrap();

        assert!(auth.validate_session("old").await.is_err());
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE id = 'old'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_logout_deletes_session() {
        let (auth, pool) = service_with_user().await;
        let token = auth.create_session("u1").await.unwrap();
        auth.delete_session(&token).await.unwrap();
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        assert!(auth.validate_session(&token).await.is_err());
    }
}
