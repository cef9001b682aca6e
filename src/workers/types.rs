// src/workers/types.rs
// Plain records crossing the worker boundary

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error taxonomy for worker results. Carried inline in the result record,
/// never raised across the pool boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    Network,
    Sql,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Sql => "sql",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct WorkerError {
    pub error_type: ErrorKind,
    pub message: String,
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
}

impl WorkerError {
    pub fn new(error_type: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error_type,
            details: Some(message.clone()),
            message,
            execution_time_ms: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn sql(message: impl Into<String>, execution_time_ms: f64) -> Self {
        let mut err = Self::new(ErrorKind::Sql, message);
        err.execution_time_ms = Some(execution_time_ms);
        err
    }

    pub fn timeout(message: impl Into<String>, details: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Timeout, message);
        err.details = Some(details.into());
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// Successful URL validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlInfo {
    pub file_size_bytes: Option<u64>,
}

/// Lightweight per-column statistics used in the system prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub null_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_count: Option<i64>,
}

impl ColumnStats {
    pub fn is_empty(&self) -> bool {
        self.null_count.is_none()
            && self.min.is_none()
            && self.max.is_none()
            && self.unique_count.is_none()
    }
}

/// One column of an extracted schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: String,
    #[serde(default)]
    pub sample_values: Vec<String>,
    #[serde(default)]
    pub column_stats: ColumnStats,
}

/// Extracted schema for a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub columns: Vec<ColumnInfo>,
    pub row_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
}

/// One dataset registration passed to the query engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDataset {
    pub url: String,
    pub table_name: String,
}

/// Materialized query result. Rows are JSON arrays in column order, capped
/// at `MAX_RESULT_ROWS`; `total_rows` always reflects the true result size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub total_rows: usize,
    pub execution_time_ms: f64,
    #[serde(default)]
    pub limit_applied: bool,
    #[serde(default)]
    pub cached: bool,
}

/// Full-dataset column profile (null %, cardinality, type-specific stats).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub null_count: i64,
    pub null_percent: f64,
    pub unique_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i64>,
}
