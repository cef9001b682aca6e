// src/workers/mod.rs

//! Worker pool fronting the columnar query engine.
//!
//! CPU-bound data operations run on blocking threads, bounded by a
//! semaphore, with a hard deadline per operation. Requests and responses
//! are plain records; errors travel inline as [`WorkerError`], never as
//! panics across the boundary.

pub mod engine;
pub mod error_translator;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache::{FileCache, MemoryQueryCache, PersistentQueryCache, query_cache_key};
use crate::config::{CacheConfig, WorkerConfig};

pub use engine::{Engine, has_limit, is_select};
pub use error_translator::translate_engine_error;
pub use types::{
    ColumnInfo, ColumnProfile, ColumnStats, ErrorKind, QueryDataset, QueryOutput, SchemaInfo,
    UrlInfo, WorkerError,
};

/// Async facade over the data workers. The chat engine, dataset catalog and
/// REST layer all talk to this trait so tests can substitute a scripted pool.
#[async_trait]
pub trait DataPool: Send + Sync {
    async fn validate_url(&self, url: &str) -> Result<UrlInfo, WorkerError>;
    async fn get_schema(&self, url: &str) -> Result<SchemaInfo, WorkerError>;
    async fn profile_columns(&self, url: &str) -> Result<Vec<ColumnProfile>, WorkerError>;
    async fn profile_column(
        &self,
        url: &str,
        table_name: &str,
        column_name: &str,
        column_type: &str,
    ) -> Result<Value, WorkerError>;
    async fn run_query(
        &self,
        sql: &str,
        datasets: &[QueryDataset],
    ) -> Result<QueryOutput, WorkerError>;
}

pub struct WorkerPool {
    engine: Arc<Engine>,
    semaphore: Arc<Semaphore>,
    validate_timeout: Duration,
    schema_timeout: Duration,
    query_timeout: Duration,
    memory_cache: MemoryQueryCache,
    persistent_cache: Option<PersistentQueryCache>,
    file_cache: Arc<FileCache>,
}

impl WorkerPool {
    pub fn new(
        worker_config: &WorkerConfig,
        cache_config: &CacheConfig,
        persistent_cache: Option<PersistentQueryCache>,
    ) -> Self {
        let file_cache = Arc::new(FileCache::new(
            &cache_config.cache_dir,
            cache_config.max_cache_bytes,
            cache_config.max_file_bytes,
            cache_config.stale_temp_max_age_secs,
        ));
        let engine = Arc::new(Engine::new(
            file_cache.clone(),
            worker_config.allow_private_urls,
            crate::config::CONFIG.limits.max_query_rows,
            crate::config::CONFIG.limits.max_result_rows,
        ));
        Self {
            engine,
            semaphore: Arc::new(Semaphore::new(worker_config.pool_size.max(1))),
            validate_timeout: Duration::from_secs(worker_config.validate_timeout_secs),
            schema_timeout: Duration::from_secs(worker_config.schema_timeout_secs),
            query_timeout: Duration::from_secs(worker_config.query_timeout_secs),
            memory_cache: MemoryQueryCache::new(
                cache_config.memory_cache_size,
                cache_config.memory_cache_ttl_secs,
            ),
            persistent_cache,
            file_cache,
        }
    }

    pub fn file_cache(&self) -> &Arc<FileCache> {
        &self.file_cache
    }

    pub fn persistent_cache(&self) -> Option<&PersistentQueryCache> {
        self.persistent_cache.as_ref()
    }

    /// Run a blocking engine call under the pool's concurrency bound and
    /// deadline. On deadline the result is discarded and a timeout record is
    /// returned; the worker itself is not forcibly killed.
    async fn run_blocking<T, F>(
        &self,
        deadline: Duration,
        timeout_message: &str,
        task: F,
    ) -> Result<T, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, WorkerError> + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::internal("Worker pool is shut down"))?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        });

        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(WorkerError::internal(format!(
                "Worker task failed: {join_err}"
            ))),
            Err(_) => Err(WorkerError::timeout(
                timeout_message,
                format!("Operation exceeded {} seconds", deadline.as_secs()),
            )),
        }
    }
}

#[async_trait]
impl DataPool for WorkerPool {
    async fn validate_url(&self, url: &str) -> Result<UrlInfo, WorkerError> {
        let engine = self.engine.clone();
        let url = url.to_string();
        self.run_blocking(self.validate_timeout, "URL validation timed out", move || {
            engine.fetch_and_validate(&url)
        })
        .await
    }

    async fn get_schema(&self, url: &str) -> Result<SchemaInfo, WorkerError> {
        let engine = self.engine.clone();
        let url = url.to_string();
        self.run_blocking(self.schema_timeout, "Schema extraction timed out", move || {
            engine.extract_schema(&url)
        })
        .await
    }

    async fn profile_columns(&self, url: &str) -> Result<Vec<ColumnProfile>, WorkerError> {
        let engine = self.engine.clone();
        let url = url.to_string();
        self.run_blocking(self.query_timeout, "Column profiling timed out", move || {
            engine.profile_columns(&url)
        })
        .await
    }

    async fn profile_column(
        &self,
        url: &str,
        _table_name: &str,
        column_name: &str,
        column_type: &str,
    ) -> Result<Value, WorkerError> {
        let engine = self.engine.clone();
        let url = url.to_string();
        let column_name = column_name.to_string();
        let column_type = column_type.to_string();
        self.run_blocking(self.query_timeout, "Column profiling timed out", move || {
            engine.profile_column(&url, &column_name, &column_type)
        })
        .await
    }

    async fn run_query(
        &self,
        sql: &str,
        datasets: &[QueryDataset],
    ) -> Result<QueryOutput, WorkerError> {
        let urls: Vec<String> = datasets.iter().map(|d| d.url.clone()).collect();
        let key = query_cache_key(sql, &urls);

        if let Some(value) = self.memory_cache.get(&key) {
            if let Ok(mut output) = serde_json::from_value::<QueryOutput>(value) {
                debug!("Query cache hit (memory): key={}", &key[..8]);
                output.cached = true;
                return Ok(output);
            }
        }

        if let Some(persistent) = &self.persistent_cache {
            if let Some(value) = persistent.get(&key).await {
                if let Ok(mut output) = serde_json::from_value::<QueryOutput>(value.clone()) {
                    debug!("Query cache hit (persistent): key={}", &key[..8]);
                    self.memory_cache.put(&key, &value);
                    output.cached = true;
                    return Ok(output);
                }
            }
        }

        let engine = self.engine.clone();
        let sql_owned = sql.to_string();
        let datasets_owned = datasets.to_vec();
        let result = self
            .run_blocking(self.query_timeout, "Query execution timed out", move || {
                engine.execute_query(&sql_owned, &datasets_owned)
            })
            .await;

        match result {
            Ok(output) => {
                match serde_json::to_value(&output) {
                    Ok(value) => {
                        self.memory_cache.put(&key, &value);
                        if let Some(persistent) = &self.persistent_cache {
                            persistent.put(&key, sql, &urls, &value).await;
                        }
                    }
                    Err(e) => warn!("Failed to serialize query result for caching: {}", e),
                }
                Ok(output)
            }
            Err(err) => Err(err),
        }
    }
}
