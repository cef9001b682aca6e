// src/api/error.rs
// Centralized error handling for HTTP API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

use crate::chat::ChatError;
use crate::datasets::CatalogError;
use crate::workers::{ErrorKind, WorkerError};

/// Standard API error response format
#[derive(Debug)]
pub struct ApiError {
    pub message: String,
    pub status_code: StatusCode,
    pub error_code: Option<String>,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            error_code: Some("INTERNAL_ERROR".to_string()),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_REQUEST,
            error_code: Some("BAD_REQUEST".to_string()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::NOT_FOUND,
            error_code: Some("NOT_FOUND".to_string()),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::UNAUTHORIZED,
            error_code: Some("UNAUTHORIZED".to_string()),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::FORBIDDEN,
            error_code: Some("FORBIDDEN".to_string()),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::CONFLICT,
            error_code: Some("CONFLICT".to_string()),
        }
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::TOO_MANY_REQUESTS,
            error_code: Some("RATE_LIMITED".to_string()),
        }
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_GATEWAY,
            error_code: Some("UPSTREAM_ERROR".to_string()),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response_json = json!({
            "error": true,
            "message": self.message,
            "status": self.status_code.as_u16()
        });
        if let Some(error_code) = self.error_code {
            response_json["error_code"] = json!(error_code);
        }
        (self.status_code, Json(response_json)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        error!("Database error: {:?}", e);
        ApiError::internal("Database error")
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::Invalid(msg) => ApiError::bad_request(msg),
            CatalogError::NotFound => ApiError::not_found("Dataset not found"),
            CatalogError::Db(e) => e.into(),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::Conflict => ApiError::conflict(e.to_string()),
            ChatError::RateLimited { .. } | ChatError::LlmBusy => {
                ApiError::too_many_requests(e.to_string())
            }
            ChatError::Llm(inner) => ApiError::bad_gateway(inner.to_string()),
            ChatError::Db(inner) => inner.into(),
            ChatError::Internal(inner) => {
                error!("Chat error: {:?}", inner);
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

impl From<WorkerError> for ApiError {
    fn from(e: WorkerError) -> Self {
        match e.error_type {
            ErrorKind::Validation => ApiError::bad_request(e.message),
            ErrorKind::Network => ApiError::bad_request(e.message),
            ErrorKind::Sql => ApiError::bad_request(e.message),
            ErrorKind::Timeout => ApiError {
                message: e.message,
                status_code: StatusCode::GATEWAY_TIMEOUT,
                error_code: Some("TIMEOUT".to_string()),
            },
            ErrorKind::Internal => ApiError::internal(e.message),
        }
    }
}

/// Extension trait for Option<T> to produce not-found errors
pub trait IntoApiErrorOption<T> {
    fn ok_or_not_found(self, message: &str) -> Result<T, ApiError>;
}

impl<T> IntoApiErrorOption<T> for Option<T> {
    fn ok_or_not_found(self, message: &str) -> Result<T, ApiError> {
        self.ok_or_else(|| ApiError::not_found(message))
    }
}
