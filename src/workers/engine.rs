// src/workers/engine.rs
// Blocking Polars operations: URL validation, schema extraction, profiling,
// SQL execution. Everything here runs on worker threads; inputs and outputs
// are the plain records in workers/types.rs.

use std::io::Read;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use polars::prelude::*;
use polars::sql::SQLContext;
use regex::Regex;
use serde_json::Value;

use crate::cache::FileCache;

use super::types::{
    ColumnInfo, ColumnProfile, ColumnStats, QueryDataset, QueryOutput, SchemaInfo, UrlInfo,
    WorkerError,
};

const HEAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SAMPLE_ROWS: u32 = 100;
const MAX_SAMPLE_VALUES: usize = 5;
const SAMPLE_VALUE_MAX_CHARS: usize = 80;
const PROFILE_SAMPLE_THRESHOLD: u32 = 100_000;

lazy_static! {
    static ref SINGLE_QUOTED: Regex = Regex::new(r"'[^']*'").unwrap();
    static ref DOUBLE_QUOTED: Regex = Regex::new(r#""[^"]*""#).unwrap();
    static ref LINE_COMMENT: Regex = Regex::new(r"(?m)--.*$").unwrap();
    static ref BLOCK_COMMENT: Regex = Regex::new(r"(?s)/\*.*?\*/").unwrap();
    static ref LIMIT_KEYWORD: Regex = Regex::new(r"(?i)\bLIMIT\b").unwrap();
}

/// Check whether the SQL already contains a top-level LIMIT clause.
///
/// String literals, quoted identifiers and comments are stripped first so a
/// LIMIT inside them is not treated as a real clause.
pub fn has_limit(sql: &str) -> bool {
    let cleaned = SINGLE_QUOTED.replace_all(sql, "");
    let cleaned = DOUBLE_QUOTED.replace_all(&cleaned, "");
    let cleaned = LINE_COMMENT.replace_all(&cleaned, "");
    let cleaned = BLOCK_COMMENT.replace_all(&cleaned, "");
    LIMIT_KEYWORD.is_match(&cleaned)
}

/// SELECT-like statements (SELECT or WITH, ignoring leading parens) are the
/// only ones eligible for LIMIT injection.
pub fn is_select(sql: &str) -> bool {
    let stripped = sql.trim().trim_start_matches('(').trim_start();
    let upper = stripped.to_uppercase();
    upper.starts_with("SELECT") || upper.starts_with("WITH")
}

fn is_csv_path(path_or_url: &str) -> bool {
    let lower = path_or_url.to_lowercase();
    lower.ends_with(".csv") || lower.ends_with(".csv.gz") || lower.ends_with(".tsv")
}

fn is_tsv_path(path_or_url: &str) -> bool {
    path_or_url.to_lowercase().ends_with(".tsv")
}

/// Strip a `file://` prefix. Returns the resolved path and whether it is a
/// local file.
fn resolve_url(url: &str) -> (String, bool) {
    match url.strip_prefix("file://") {
        Some(path) => (path.to_string(), true),
        None => (url.to_string(), false),
    }
}

fn classify_numeric(dtype: &str) -> bool {
    dtype.starts_with("Int") || dtype.starts_with("UInt") || dtype.starts_with("Float")
}

fn classify_string(dtype: &str) -> bool {
    dtype == "String" || dtype == "Utf8"
}

fn classify_datetime(dtype: &str) -> bool {
    dtype == "Date" || dtype == "Time" || dtype.starts_with("Datetime")
}

/// Convert a Polars value into JSON for the wire/persistence formats.
fn any_value_to_json(value: AnyValue) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::Int8(v) => Value::from(v),
        AnyValue::Int16(v) => Value::from(v),
        AnyValue::Int32(v) => Value::from(v),
        AnyValue::Int64(v) => Value::from(v),
        AnyValue::UInt8(v) => Value::from(v),
        AnyValue::UInt16(v) => Value::from(v),
        AnyValue::UInt32(v) => Value::from(v),
        AnyValue::UInt64(v) => Value::from(v),
        AnyValue::Float32(v) => serde_json::Number::from_f64(v as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AnyValue::Float64(v) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::StringOwned(s) => Value::String(s.to_string()),
        other => Value::String(other.to_string()),
    }
}

/// Blocking engine facade. One instance per process, shared by all workers.
pub struct Engine {
    file_cache: Arc<FileCache>,
    allow_private_urls: bool,
    max_query_rows: usize,
    max_result_rows: usize,
    client: reqwest::blocking::Client,
}

impl Engine {
    pub fn new(
        file_cache: Arc<FileCache>,
        allow_private_urls: bool,
        max_query_rows: usize,
        max_result_rows: usize,
    ) -> Self {
        Self {
            file_cache,
            allow_private_urls,
            max_query_rows,
            max_result_rows,
            client: reqwest::blocking::Client::builder()
                .timeout(HEAD_REQUEST_TIMEOUT)
                .build()
                .expect("reqwest blocking client"),
        }
    }

    /// Resolve a URL to a path Polars can scan. Remote URLs are materialized
    /// through the file cache.
    fn local_path_for(&self, url: &str) -> Result<PathBuf, WorkerError> {
        let (resolved, is_local) = resolve_url(url);
        if is_local {
            return Ok(PathBuf::from(resolved));
        }
        if let Some(path) = self.file_cache.get_cached(url) {
            return Ok(path);
        }
        self.file_cache
            .download_and_cache(url)
            .map_err(|e| WorkerError::network(format!("Failed to download data file: {e}")))
    }

    fn scan_data_file(&self, path: &PathBuf) -> PolarsResult<LazyFrame> {
        let path_str = path.to_string_lossy();
        if is_csv_path(&path_str) {
            let separator = if is_tsv_path(&path_str) { b'\t' } else { b',' };
            LazyCsvReader::new(path)
                .with_separator(separator)
                .with_try_parse_dates(true)
                .with_infer_schema_length(Some(10_000))
                .finish()
        } else {
            LazyFrame::scan_parquet(path, ScanArgsParquet::default())
        }
    }

    /// SSRF guard: reject non-http schemes, URLs without a host, and hosts
    /// resolving to private/loopback/link-local addresses.
    fn validate_url_safety(&self, url: &str) -> Result<(), WorkerError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| WorkerError::validation(format!("Invalid URL: {e}")))?;

        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(WorkerError::validation(format!(
                "Unsupported URL scheme '{scheme}'. Only HTTP and HTTPS URLs are supported."
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| WorkerError::validation("Invalid URL: no hostname specified."))?;

        if self.allow_private_urls {
            return Ok(());
        }

        // DNS failures are left to the download to report.
        if let Ok(addrs) = (host, parsed.port_or_known_default().unwrap_or(80)).to_socket_addrs() {
            for addr in addrs {
                if is_restricted_ip(&addr.ip()) {
                    return Err(WorkerError::validation(
                        "URLs pointing to internal/private networks are not allowed.",
                    ));
                }
            }
        }
        Ok(())
    }

    /// HEAD + magic-byte validation of a data URL; existence and content
    /// checks for uploaded `file://` paths.
    pub fn fetch_and_validate(&self, url: &str) -> Result<UrlInfo, WorkerError> {
        let (resolved, is_local) = resolve_url(url);
        let is_csv = is_csv_path(if is_local { &resolved } else { url });

        if !is_local {
            self.validate_url_safety(url)?;
        }

        if is_local {
            let meta = std::fs::metadata(&resolved).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    WorkerError::network("Uploaded file not found")
                } else {
                    WorkerError::network(format!("Failed to validate file: {e}"))
                }
            })?;
            let file_size_bytes = meta.len();
            if is_csv {
                if file_size_bytes == 0 {
                    return Err(WorkerError::validation("CSV file is empty"));
                }
                return Ok(UrlInfo {
                    file_size_bytes: Some(file_size_bytes),
                });
            }
            let mut magic = [0u8; 4];
            let read = std::fs::File::open(&resolved)
                .and_then(|mut f| f.read(&mut magic))
                .map_err(|e| WorkerError::network(format!("Failed to validate file: {e}")))?;
            if read < 4 || &magic != b"PAR1" {
                return Err(WorkerError::validation("Not a valid parquet file"));
            }
            return Ok(UrlInfo {
                file_size_bytes: Some(file_size_bytes),
            });
        }

        // Remote: HEAD request first to check accessibility.
        let head = self
            .client
            .head(url)
            .send()
            .map_err(|e| WorkerError::network(format!("Could not access URL: {e}")))?;
        if !head.status().is_success() {
            return Err(WorkerError::network(format!(
                "Could not access URL (HTTP {})",
                head.status().as_u16()
            )));
        }
        let file_size_bytes = head
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        if is_csv {
            return Ok(UrlInfo { file_size_bytes });
        }

        // Parquet: fetch the first four bytes and check the magic number.
        let mut response = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-3")
            .send()
            .map_err(|e| WorkerError::network(format!("Failed to validate file: {e}")))?;
        let mut magic = [0u8; 4];
        let mut read_total = 0;
        while read_total < 4 {
            match response.read(&mut magic[read_total..]) {
                Ok(0) => break,
                Ok(n) => read_total += n,
                Err(e) => {
                    return Err(WorkerError::network(format!("Failed to validate file: {e}")));
                }
            }
        }
        if read_total < 4 {
            return Err(WorkerError::validation(
                "Not a valid parquet file (too few bytes)",
            ));
        }
        if &magic != b"PAR1" {
            return Err(WorkerError::validation("Not a valid parquet file"));
        }

        Ok(UrlInfo { file_size_bytes })
    }

    /// Read the schema, row count, sample values, and lightweight column
    /// stats without materializing the full dataset.
    pub fn extract_schema(&self, url: &str) -> Result<SchemaInfo, WorkerError> {
        let path = self.local_path_for(url)?;
        let file_size_bytes = std::fs::metadata(&path).map(|m| m.len()).ok();

        let lf = self
            .scan_data_file(&path)
            .map_err(|e| schema_error(&e.to_string()))?;

        let mut lf = lf;
        let schema = lf
            .collect_schema()
            .map_err(|e| schema_error(&e.to_string()))?;

        let mut columns: Vec<ColumnInfo> = schema
            .iter()
            .map(|(name, dtype)| ColumnInfo {
                name: name.to_string(),
                dtype: format!("{dtype:?}"),
                sample_values: Vec::new(),
                column_stats: ColumnStats::default(),
            })
            .collect();

        let row_count = self.count_rows(&lf)?;
        self.collect_sample_values(&lf, &mut columns);
        self.collect_column_stats(&lf, &mut columns);

        Ok(SchemaInfo {
            columns,
            row_count,
            file_size_bytes,
        })
    }

    fn count_rows(&self, lf: &LazyFrame) -> Result<i64, WorkerError> {
        let df = lf
            .clone()
            .select([len().alias("len")])
            .collect()
            .map_err(|e| schema_error(&e.to_string()))?;
        let count = df
            .column("len")
            .ok()
            .and_then(|c| c.get(0).ok())
            .map(|av| match av {
                AnyValue::UInt32(v) => v as i64,
                AnyValue::UInt64(v) => v as i64,
                AnyValue::Int64(v) => v,
                _ => 0,
            })
            .unwrap_or(0);
        Ok(count)
    }

    /// Distinct non-null sample values per column, from the first rows.
    /// Failures here degrade to empty samples, never to an error.
    fn collect_sample_values(&self, lf: &LazyFrame, columns: &mut [ColumnInfo]) {
        let sample = match lf.clone().limit(SAMPLE_ROWS).collect() {
            Ok(df) => df,
            Err(_) => return,
        };
        for col_info in columns.iter_mut() {
            let Ok(column) = sample.column(&col_info.name) else {
                continue;
            };
            let series = column.as_materialized_series().drop_nulls();
            let Ok(unique) = series.unique() else {
                continue;
            };
            col_info.sample_values = unique
                .iter()
                .take(MAX_SAMPLE_VALUES)
                .map(|av| {
                    let mut s = av.to_string().trim_matches('"').to_string();
                    if s.chars().count() > SAMPLE_VALUE_MAX_CHARS {
                        s = s.chars().take(SAMPLE_VALUE_MAX_CHARS - 3).collect::<String>() + "...";
                    }
                    s
                })
                .collect();
        }
    }

    /// Column stats in a single aggregation pass: null count for every
    /// column, min/max for numerics, n_unique for strings. Best effort.
    fn collect_column_stats(&self, lf: &LazyFrame, columns: &mut [ColumnInfo]) {
        let mut exprs: Vec<Expr> = Vec::new();
        for col_info in columns.iter() {
            let name = col_info.name.as_str();
            exprs.push(col(name).null_count().alias(format!("__null__{name}")));
            if classify_numeric(&col_info.dtype) {
                exprs.push(col(name).min().alias(format!("__min__{name}")));
                exprs.push(col(name).max().alias(format!("__max__{name}")));
            } else if classify_string(&col_info.dtype) {
                exprs.push(col(name).n_unique().alias(format!("__nunique__{name}")));
            }
        }
        if exprs.is_empty() {
            return;
        }
        let stats = match lf.clone().select(exprs).collect() {
            Ok(df) => df,
            Err(_) => return,
        };

        let read = |name: &str| -> Option<Value> {
            stats
                .column(name)
                .ok()
                .and_then(|c| c.get(0).ok())
                .map(any_value_to_json)
        };

        for col_info in columns.iter_mut() {
            let name = col_info.name.clone();
            let mut col_stats = ColumnStats::default();

            if let Some(nulls) = read(&format!("__null__{name}")).and_then(|v| v.as_i64()) {
                if nulls > 0 {
                    col_stats.null_count = Some(nulls);
                }
            }
            if classify_numeric(&col_info.dtype) {
                col_stats.min = read(&format!("__min__{name}")).filter(|v| !v.is_null());
                col_stats.max = read(&format!("__max__{name}")).filter(|v| !v.is_null());
            } else if classify_string(&col_info.dtype) {
                col_stats.unique_count =
                    read(&format!("__nunique__{name}")).and_then(|v| v.as_i64());
            }
            col_info.column_stats = col_stats;
        }
    }

    /// Per-column profiling for the whole dataset. Datasets larger than 100k
    /// rows are profiled on their first 100k rows.
    pub fn profile_columns(&self, url: &str) -> Result<Vec<ColumnProfile>, WorkerError> {
        let path = self.local_path_for(url)?;
        let lf = self
            .scan_data_file(&path)
            .map_err(|e| schema_error(&e.to_string()))?;
        let df = lf
            .collect()
            .map_err(|e| WorkerError::internal(format!("Failed to profile dataset: {e}")))?;
        let df = if df.height() > PROFILE_SAMPLE_THRESHOLD as usize {
            df.head(Some(PROFILE_SAMPLE_THRESHOLD as usize))
        } else {
            df
        };

        let total = df.height() as i64;
        let mut profiles = Vec::new();
        for column in df.get_columns() {
            let series = column.as_materialized_series();
            let name = series.name().to_string();
            let dtype = format!("{:?}", series.dtype());

            let null_count = series.null_count() as i64;
            let null_percent = if total > 0 {
                (null_count as f64 / total as f64 * 1000.0).round() / 10.0
            } else {
                0.0
            };
            let unique_count = series.n_unique().map(|n| n as i64).unwrap_or(0);

            let mut profile = ColumnProfile {
                name,
                null_count,
                null_percent,
                unique_count,
                min: None,
                max: None,
                mean: None,
                min_length: None,
                max_length: None,
            };

            if classify_numeric(&dtype) {
                profile.min = series
                    .min::<f64>()
                    .ok()
                    .flatten()
                    .and_then(|v| serde_json::Number::from_f64(v).map(Value::Number));
                profile.max = series
                    .max::<f64>()
                    .ok()
                    .flatten()
                    .and_then(|v| serde_json::Number::from_f64(v).map(Value::Number));
                profile.mean = series.mean().map(|m| (m * 100.0).round() / 100.0);
            } else if classify_string(&dtype) {
                let non_null = series.drop_nulls();
                if !non_null.is_empty() {
                    if let Ok(ca) = non_null.str() {
                        let lengths: Vec<i64> = ca
                            .into_iter()
                            .flatten()
                            .map(|s| s.chars().count() as i64)
                            .collect();
                        profile.min_length = lengths.iter().min().copied();
                        profile.max_length = lengths.iter().max().copied();
                    }
                }
            }
            profiles.push(profile);
        }
        Ok(profiles)
    }

    /// Detailed single-column profile. The stats depend on the recorded
    /// column type: numeric (min/max/mean/median), string (length bounds +
    /// top 5 values), datetime (min/max), otherwise counts only.
    pub fn profile_column(
        &self,
        url: &str,
        column_name: &str,
        column_type: &str,
    ) -> Result<Value, WorkerError> {
        let path = self.local_path_for(url)?;
        let lf = self
            .scan_data_file(&path)
            .map_err(|e| schema_error(&e.to_string()))?;

        let c = col(column_name);
        let profile_err =
            |e: PolarsError| WorkerError::internal(format!("Failed to profile column: {e}"));

        let stats: Value = if classify_numeric(column_type) {
            let df = lf
                .select([
                    c.clone().min().alias("min"),
                    c.clone().max().alias("max"),
                    c.clone().mean().alias("mean"),
                    c.clone().median().alias("median"),
                    c.clone().null_count().alias("null_count"),
                    c.clone().n_unique().alias("distinct_count"),
                ])
                .collect()
                .map_err(profile_err)?;
            let get = |n: &str| first_json(&df, n);
            serde_json::json!({
                "min": get("min"),
                "max": get("max"),
                "mean": get("mean").as_f64().map(|m| (m * 10_000.0).round() / 10_000.0),
                "median": get("median"),
                "null_count": get("null_count"),
                "distinct_count": get("distinct_count"),
            })
        } else if classify_string(column_type) {
            let counts = lf
                .clone()
                .select([
                    c.clone().null_count().alias("null_count"),
                    c.clone().n_unique().alias("distinct_count"),
                ])
                .collect()
                .map_err(profile_err)?;
            let lengths = lf
                .clone()
                .filter(c.clone().is_not_null())
                .select([
                    c.clone().str().len_chars().min().alias("min_length"),
                    c.clone().str().len_chars().max().alias("max_length"),
                ])
                .collect()
                .map_err(profile_err)?;
            let top5 = lf
                .filter(c.clone().is_not_null())
                .group_by([c.clone()])
                .agg([len().alias("count")])
                .sort(
                    ["count"],
                    SortMultipleOptions::default().with_order_descending(true),
                )
                .limit(5)
                .collect()
                .map_err(profile_err)?;

            let mut top_values = Vec::new();
            for i in 0..top5.height() {
                let value = top5
                    .column(column_name)
                    .ok()
                    .and_then(|col| col.get(i).ok())
                    .map(|av| av.to_string().trim_matches('"').to_string())
                    .unwrap_or_default();
                let count = top5
                    .column("count")
                    .ok()
                    .and_then(|col| col.get(i).ok())
                    .map(any_value_to_json)
                    .unwrap_or(Value::Null);
                top_values.push(serde_json::json!({ "value": value, "count": count }));
            }

            serde_json::json!({
                "min_length": first_json(&lengths, "min_length"),
                "max_length": first_json(&lengths, "max_length"),
                "null_count": first_json(&counts, "null_count"),
                "distinct_count": first_json(&counts, "distinct_count"),
                "top_5_values": top_values,
            })
        } else if classify_datetime(column_type) {
            let df = lf
                .select([
                    c.clone().min().alias("min"),
                    c.clone().max().alias("max"),
                    c.clone().null_count().alias("null_count"),
                    c.clone().n_unique().alias("distinct_count"),
                ])
                .collect()
                .map_err(profile_err)?;
            let get = |n: &str| first_json(&df, n);
            serde_json::json!({
                "min": get("min"),
                "max": get("max"),
                "null_count": get("null_count"),
                "distinct_count": get("distinct_count"),
            })
        } else {
            let df = lf
                .select([
                    c.clone().null_count().alias("null_count"),
                    c.n_unique().alias("distinct_count"),
                ])
                .collect()
                .map_err(profile_err)?;
            serde_json::json!({
                "null_count": first_json(&df, "null_count"),
                "distinct_count": first_json(&df, "distinct_count"),
            })
        };

        Ok(serde_json::json!({ "stats": stats }))
    }

    /// Register each dataset under its table name, inject a LIMIT into
    /// SELECT-like queries that lack one, execute, and return up to
    /// `max_result_rows` rows plus the true total.
    pub fn execute_query(
        &self,
        sql: &str,
        datasets: &[QueryDataset],
    ) -> Result<QueryOutput, WorkerError> {
        let start = Instant::now();
        let elapsed_ms = |start: Instant| start.elapsed().as_secs_f64() * 1000.0;

        let mut ctx = SQLContext::new();
        for dataset in datasets {
            let path = self.local_path_for(&dataset.url).map_err(|mut e| {
                e.execution_time_ms = Some(elapsed_ms(start));
                e
            })?;
            let lf = self
                .scan_data_file(&path)
                .map_err(|e| WorkerError::sql(format!("SQL execution error: {e}"), elapsed_ms(start)))?;
            ctx.register(&dataset.table_name, lf);
        }

        let mut limit_applied = false;
        let effective_sql = if is_select(sql) && !has_limit(sql) {
            limit_applied = true;
            format!(
                "{} LIMIT {}",
                sql.trim_end().trim_end_matches(';'),
                self.max_query_rows
            )
        } else {
            sql.to_string()
        };

        let df = ctx
            .execute(&effective_sql)
            .and_then(|lf| lf.collect())
            .map_err(|e| WorkerError::sql(format!("SQL execution error: {e}"), elapsed_ms(start)))?;

        let total_rows = df.height();
        let columns: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|n| n.to_string())
            .collect();

        let truncated = df.head(Some(self.max_result_rows));
        let mut rows = Vec::with_capacity(truncated.height());
        for i in 0..truncated.height() {
            let mut row = Vec::with_capacity(columns.len());
            for column in truncated.get_columns() {
                let value = column
                    .get(i)
                    .map(any_value_to_json)
                    .unwrap_or(Value::Null);
                row.push(value);
            }
            rows.push(row);
        }

        Ok(QueryOutput {
            columns,
            rows,
            total_rows,
            execution_time_ms: elapsed_ms(start),
            limit_applied,
            cached: false,
        })
    }
}

fn first_json(df: &DataFrame, column: &str) -> Value {
    df.column(column)
        .ok()
        .and_then(|c| c.get(0).ok())
        .map(any_value_to_json)
        .unwrap_or(Value::Null)
}

fn schema_error(message: &str) -> WorkerError {
    let lower = message.to_lowercase();
    if lower.contains("network") || lower.contains("404") || lower.contains("connect") {
        WorkerError::network(format!("Failed to extract schema: {message}"))
    } else {
        WorkerError::validation(format!("Failed to extract schema: {message}"))
    }
}

fn is_restricted_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local, fe80::/10 link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_limit_plain() {
        assert!(has_limit("SELECT * FROM t LIMIT 10"));
        assert!(has_limit("select * from t limit 10"));
        assert!(!has_limit("SELECT * FROM t"));
    }

    #[test]
    fn test_has_limit_ignores_string_literals() {
        assert!(!has_limit("SELECT * FROM t WHERE note = 'no LIMIT here'"));
        assert!(!has_limit("SELECT \"LIMIT\" FROM t"));
    }

    #[test]
    fn test_has_limit_ignores_comments() {
        assert!(!has_limit("SELECT * FROM t -- LIMIT 5"));
        assert!(!has_limit("SELECT * FROM t /* LIMIT 5 */"));
        assert!(has_limit("SELECT * FROM t /* c */ LIMIT 5"));
    }

    #[test]
    fn test_has_limit_invariant_under_decoys() {
        let base = "SELECT * FROM t";
        assert_eq!(has_limit(base), has_limit(&format!("{base} -- LIMIT")));
        assert_eq!(
            has_limit(base),
            has_limit(&format!("{base} WHERE x = 'LIMIT'"))
        );
        let with = "SELECT * FROM t LIMIT 3";
        assert_eq!(has_limit(with), has_limit(&format!("{with} -- LIMIT")));
    }

    #[test]
    fn test_is_select_variants() {
        assert!(is_select("SELECT 1"));
        assert!(is_select("  select 1"));
        assert!(is_select("(SELECT 1)"));
        assert!(is_select("WITH t AS (SELECT 1) SELECT * FROM t"));
        assert!(!is_select("INSERT INTO t VALUES (1)"));
        assert!(!is_select("CREATE TABLE t (a INT)"));
    }

    #[test]
    fn test_resolve_url() {
        assert_eq!(
            resolve_url("file:///tmp/a.parquet"),
            ("/tmp/a.parquet".to_string(), true)
        );
        assert_eq!(
            resolve_url("https://e.com/a.parquet"),
            ("https://e.com/a.parquet".to_string(), false)
        );
    }

    #[test]
    fn test_classifiers() {
        assert!(classify_numeric("Int64"));
        assert!(classify_numeric("UInt8"));
        assert!(classify_numeric("Float32"));
        assert!(!classify_numeric("String"));
        assert!(classify_string("String"));
        assert!(classify_string("Utf8"));
        assert!(classify_datetime("Date"));
        assert!(classify_datetime("Datetime(Microseconds, None)"));
    }

    #[test]
    fn test_restricted_ips() {
        assert!(is_restricted_ip(&"127.0.0.1".parse().unwrap()));
        assert!(is_restricted_ip(&"10.0.0.1".parse().unwrap()));
        assert!(is_restricted_ip(&"192.168.1.1".parse().unwrap()));
        assert!(is_restricted_ip(&"169.254.0.1".parse().unwrap()));
        assert!(is_restricted_ip(&"::1".parse().unwrap()));
        assert!(!is_restricted_ip(&"93.184.216.34".parse().unwrap()));
    }

    fn test_engine(dir: &std::path::Path) -> Engine {
        let cache = Arc::new(FileCache::new(dir, 1 << 30, 1 << 28, 3600));
        Engine::new(cache, true, 10_000, 1000)
    }

    fn write_csv(dir: &std::path::Path, name: &str, contents: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        format!("file://{}", path.display())
    }

    #[test]
    fn test_validate_local_csv() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path());
        let url = write_csv(tmp.path(), "d.csv", "a,b\n1,2\n");
        let info = engine.fetch_and_validate(&url).unwrap();
        assert!(info.file_size_bytes.unwrap() > 0);
    }

    #[test]
    fn test_validate_local_empty_csv_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path());
        let url = write_csv(tmp.path(), "d.csv", "");
        let err = engine.fetch_and_validate(&url).unwrap_err();
        assert_eq!(err.error_type, super::super::types::ErrorKind::Validation);
    }

    #[test]
    fn test_validate_local_bad_parquet_magic() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path());
        let url = write_csv(tmp.path(), "d.parquet", "not parquet data");
        let err = engine.fetch_and_validate(&url).unwrap_err();
        assert_eq!(err.message, "Not a valid parquet file");
    }

    #[test]
    fn test_validate_rejects_ftp_scheme() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path());
        let err = engine.fetch_and_validate("ftp://e.com/d.parquet").unwrap_err();
        assert!(err.message.contains("Unsupported URL scheme"));
    }

    #[test]
    fn test_extract_schema_from_csv() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path());
        let url = write_csv(tmp.path(), "d.csv", "name,age\nalice,30\nbob,25\n");
        let schema = engine.extract_schema(&url).unwrap();
        assert_eq!(schema.row_count, 2);
        assert_eq!(schema.columns.len(), 2);
        assert_eq!(schema.columns[0].name, "name");
        assert!(!schema.columns[0].sample_values.is_empty());
    }

    #[test]
    fn test_execute_query_with_auto_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path());
        let url = write_csv(tmp.path(), "d.csv", "a\n1\n2\n3\n");
        let datasets = vec![QueryDataset {
            url,
            table_name: "table1".into(),
        }];
        let out = engine.execute_query("SELECT * FROM table1", &datasets).unwrap();
        assert!(out.limit_applied);
        assert_eq!(out.total_rows, 3);
        assert_eq!(out.columns, vec!["a".to_string()]);
        assert!(out.execution_time_ms >= 0.0);
    }

    #[test]
    fn test_execute_query_explicit_limit_not_reapplied() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path());
        let url = write_csv(tmp.path(), "d.csv", "a\n1\n2\n3\n");
        let datasets = vec![QueryDataset {
            url,
            table_name: "table1".into(),
        }];
        let out = engine
            .execute_query("SELECT * FROM table1 LIMIT 2", &datasets)
            .unwrap();
        assert!(!out.limit_applied);
        assert_eq!(out.total_rows, 2);
    }

    #[test]
    fn test_execute_query_bad_sql_is_sql_error() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = test_engine(tmp.path());
        let url = write_csv(tmp.path(), "d.csv", "a\n1\n");
        let datasets = vec![QueryDataset {
            url,
            table_name: "table1".into(),
        }];
        let err = engine
            .execute_query("SELECT nope FROM table1", &datasets)
            .unwrap_err();
        assert_eq!(err.error_type, super::super::types::ErrorKind::Sql);
        assert!(err.execution_time_ms.is_some());
    }
}
