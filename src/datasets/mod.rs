// src/datasets/mod.rs

//! Dataset catalog: the add/refresh/remove lifecycle that produces the
//! table registry the query engine reads from.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::Dataset;
use crate::db::now_iso;
use crate::workers::DataPool;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Policy or input-shape violation; maps to HTTP 400.
    #[error("{0}")]
    Invalid(String),
    #[error("Dataset not found")]
    NotFound,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Reject URLs the catalog will not accept: empty, non-http(s) schemes,
/// embedded whitespace, and missing hosts. `file://` URIs are rejected here;
/// only the upload endpoint produces them internally.
pub fn validate_url(url: &str) -> Result<(), CatalogError> {
    if url.trim().is_empty() {
        return Err(CatalogError::Invalid("URL must not be empty".into()));
    }
    if url.chars().any(|c| c.is_whitespace()) {
        return Err(CatalogError::Invalid(
            "URL must not contain whitespace".into(),
        ));
    }
    let parsed = url::Url::parse(url)
        .map_err(|_| CatalogError::Invalid(format!("Invalid URL: {url}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CatalogError::Invalid(format!(
                "Unsupported URL scheme '{other}'. Only HTTP and HTTPS URLs are supported."
            )));
        }
    }
    if parsed.host_str().is_none() {
        return Err(CatalogError::Invalid("URL has no host".into()));
    }
    Ok(())
}

pub struct DatasetCatalog {
    db: SqlitePool,
    max_datasets: i64,
    upload_dir: PathBuf,
}

impl DatasetCatalog {
    pub fn new(db: SqlitePool, max_datasets: i64, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            max_datasets,
            upload_dir: upload_dir.into(),
        }
    }

    pub fn max_datasets(&self) -> i64 {
        self.max_datasets
    }

    async fn count_datasets(&self, conversation_id: &str) -> Result<i64, CatalogError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM datasets WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_one(&self.db)
                .await?,
        )
    }

    /// Default table name for the next dataset: `table{count + 1}`.
    pub async fn next_table_name(&self, conversation_id: &str) -> Result<String, CatalogError> {
        let count = self.count_datasets(conversation_id).await?;
        Ok(format!("table{}", count + 1))
    }

    /// The full add pipeline: cap check, duplicate guard, naming, worker
    /// validation, schema extraction, insert with status `ready`.
    pub async fn add_dataset(
        &self,
        conversation_id: &str,
        url: &str,
        pool: &Arc<dyn DataPool>,
        name: Option<String>,
    ) -> Result<Dataset, CatalogError> {
        validate_url(url)?;

        let count = self.count_datasets(conversation_id).await?;
        if count >= self.max_datasets {
            return Err(CatalogError::Invalid(format!(
                "Maximum {} datasets reached",
                self.max_datasets
            )));
        }

        // Exact string match; duplicates across different conversations are
        // independent contexts and stay allowed.
        let duplicate: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM datasets WHERE conversation_id = ? AND url = ?",
        )
        .bind(conversation_id)
        .bind(url)
        .fetch_one(&self.db)
        .await?;
        if duplicate > 0 {
            return Err(CatalogError::Invalid(
                "This dataset URL is already loaded in this conversation".into(),
            ));
        }

        let table_name = match name {
            Some(name) if !name.trim().is_empty() => name,
            _ => self.next_table_name(conversation_id).await?,
        };

        let info = pool
            .validate_url(url)
            .await
            .map_err(|e| CatalogError::Invalid(e.message))?;
        let schema = pool
            .get_schema(url)
            .await
            .map_err(|e| CatalogError::Invalid(e.message))?;

        let dataset_id = Uuid::new_v4().to_string();
        let schema_json = serde_json::to_string(&schema.columns)
            .map_err(|e| CatalogError::Invalid(format!("Failed to serialize schema: {e}")))?;
        let column_count = schema.columns.len() as i64;
        let file_size_bytes = schema
            .file_size_bytes
            .or(info.file_size_bytes)
            .map(|b| b as i64);
        let now = now_iso();

        sqlx::query(
            "INSERT INTO datasets \
             (id, conversation_id, url, name, row_count, column_count, schema_json, status, \
              error_message, loaded_at, file_size_bytes) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'ready', NULL, ?, ?)",
        )
        .bind(&dataset_id)
        .bind(conversation_id)
        .bind(url)
        .bind(&table_name)
        .bind(schema.row_count)
        .bind(column_count)
        .bind(&schema_json)
        .bind(&now)
        .bind(file_size_bytes)
        .execute(&self.db)
        .await?;

        info!(
            "Added dataset {} as '{}' ({} rows, {} cols) to conversation {}",
            dataset_id, table_name, schema.row_count, column_count, conversation_id
        );
        self.get_dataset(&dataset_id).await
    }

    pub async fn get_dataset(&self, dataset_id: &str) -> Result<Dataset, CatalogError> {
        sqlx::query_as::<_, Dataset>("SELECT * FROM datasets WHERE id = ?")
            .bind(dataset_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(CatalogError::NotFound)
    }

    /// All datasets of a conversation, ordered by load time ascending.
    pub async fn get_datasets(&self, conversation_id: &str) -> Result<Vec<Dataset>, CatalogError> {
        Ok(sqlx::query_as::<_, Dataset>(
            "SELECT * FROM datasets WHERE conversation_id = ? ORDER BY loaded_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?)
    }

    /// Re-run validation and schema extraction against the stored URL.
    pub async fn refresh_schema(
        &self,
        dataset_id: &str,
        pool: &Arc<dyn DataPool>,
    ) -> Result<Dataset, CatalogError> {
        let dataset = self.get_dataset(dataset_id).await?;

        pool.validate_url(&dataset.url)
            .await
            .map_err(|e| CatalogError::Invalid(e.message))?;
        let schema = pool
            .get_schema(&dataset.url)
            .await
            .map_err(|e| CatalogError::Invalid(e.message))?;

        let schema_json = serde_json::to_string(&schema.columns)
            .map_err(|e| CatalogError::Invalid(format!("Failed to serialize schema: {e}")))?;
        sqlx::query(
            "UPDATE datasets SET row_count = ?, column_count = ?, schema_json = ?, \
             status = 'ready', error_message = NULL, loaded_at = ? WHERE id = ?",
        )
        .bind(schema.row_count)
        .bind(schema.columns.len() as i64)
        .bind(&schema_json)
        .bind(now_iso())
        .bind(dataset_id)
        .execute(&self.db)
        .await?;

        self.get_dataset(dataset_id).await
    }

    /// Delete the row; uploaded `file://` files are unlinked only when they
    /// live inside the uploads directory (path-traversal guard). Missing
    /// files and permission errors are not fatal.
    pub async fn remove_dataset(&self, dataset_id: &str) -> Result<(), CatalogError> {
        let dataset = self.get_dataset(dataset_id).await?;

        sqlx::query("DELETE FROM datasets WHERE id = ?")
            .bind(dataset_id)
            .execute(&self.db)
            .await?;

        if let Some(path) = dataset.url.strip_prefix("file://") {
            if self.is_inside_upload_dir(Path::new(path)) {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Could not remove uploaded file {}: {}", path, e);
                }
            } else {
                warn!(
                    "Refusing to unlink {} - outside the uploads directory",
                    path
                );
            }
        }
        Ok(())
    }

    fn is_inside_upload_dir(&self, path: &Path) -> bool {
        let canonical_upload = match self.upload_dir.canonicalize() {
            Ok(dir) => dir,
            Err(_) => return false,
        };
        match path.canonicalize() {
            Ok(canonical) => canonical.starts_with(&canonical_upload),
            Err(_) => false,
        }
    }
}
