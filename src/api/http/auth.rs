// src/api/http/auth.rs
// Session extraction and ownership checks for the authenticated scope

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::error::ApiError;
use crate::db::models::{Conversation, User};
use crate::state::AppState;

/// The authenticated user, resolved from the session token on every request.
///
/// Tokens are accepted from `Authorization: Bearer <token>` or the `session`
/// cookie.
pub struct CurrentUser(pub User);

fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(auth) = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    let cookies = parts
        .headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())?;
    for cookie in cookies.split(';') {
        let cookie = cookie.trim();
        if let Some(value) = cookie.strip_prefix("session=") {
            return Some(value.to_string());
        }
    }
    None
}

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts)
            .ok_or_else(|| ApiError::unauthorized("Missing session token"))?;
        let user = state
            .auth_service
            .validate_session(&token)
            .await
            .map_err(|_| ApiError::unauthorized("Invalid or expired session"))?;
        Ok(CurrentUser(user))
    }
}

/// Fetch a conversation and enforce ownership: 404 when missing, 403 when
/// owned by someone else.
pub async fn owned_conversation(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
) -> Result<Conversation, ApiError> {
    let conversation =
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&state.db)
            .await?;
    let conversation = conversation.ok_or_else(|| ApiError::not_found("Conversation not found"))?;
    if conversation.user_id != user_id {
        return Err(ApiError::forbidden("Not authorized"));
    }
    Ok(conversation)
}
