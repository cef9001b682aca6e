// src/api/http/datasets.rs
// Dataset CRUD within a conversation: URL add, file upload, rename,
// refresh, profiling, preview, removal, column descriptions

use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::api::ws::events;
use crate::config::CONFIG;
use crate::db::models::Dataset;
use crate::db::now_iso;
use crate::state::AppState;
use crate::workers::DataPool;

use super::auth::{CurrentUser, owned_conversation};

#[derive(Deserialize)]
pub struct AddDatasetRequest {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Deserialize)]
pub struct RenameDatasetRequest {
    #[serde(rename = "tableName")]
    pub table_name: String,
}

#[derive(Deserialize)]
pub struct ProfileColumnRequest {
    pub column_name: String,
    pub column_type: String,
}

#[derive(Deserialize)]
pub struct PreviewParams {
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default)]
    pub random_sample: bool,
    #[serde(default = "default_sample_method")]
    pub sample_method: String,
    #[serde(default)]
    pub sample_column: Option<String>,
    #[serde(default = "default_sample_percentage")]
    pub sample_percentage: f64,
}

fn default_sample_size() -> usize {
    10
}

fn default_sample_method() -> String {
    "head".to_string()
}

fn default_sample_percentage() -> f64 {
    1.0
}

async fn dataset_or_404(
    state: &AppState,
    dataset_id: &str,
    conversation_id: &str,
) -> Result<Dataset, ApiError> {
    sqlx::query_as::<_, Dataset>("SELECT * FROM datasets WHERE id = ? AND conversation_id = ?")
        .bind(dataset_id)
        .bind(conversation_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Dataset not found"))
}

fn dataset_event_payload(ds: &Dataset) -> Value {
    json!({
        "id": ds.id,
        "conversation_id": ds.conversation_id,
        "url": ds.url,
        "name": ds.name,
        "row_count": ds.row_count,
        "column_count": ds.column_count,
        "schema_json": ds.schema_json,
        "status": ds.status,
        "error_message": ds.error_message,
        "file_size_bytes": ds.file_size_bytes,
    })
}

/// Fire-and-forget: profile columns after a dataset lands and push the
/// results to the user's sockets. Failures are logged and swallowed.
fn spawn_auto_profile(state: &Arc<AppState>, user_id: String, dataset_id: String, url: String) {
    let pool = state.worker_pool.clone();
    let manager = state.connection_manager.clone();
    tokio::spawn(async move {
        match pool.profile_columns(&url).await {
            Ok(profiles) if !profiles.is_empty() => {
                let payload = serde_json::to_value(&profiles).unwrap_or_else(|_| json!([]));
                manager
                    .send_to_user(&user_id, &events::dataset_profiled(&dataset_id, &payload))
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Auto-profile failed for dataset {}: {}", dataset_id, e.message);
            }
        }
    });
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/datasets
// ---------------------------------------------------------------------------

pub async fn add_dataset(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<AddDatasetRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let dataset = match state
        .dataset_catalog
        .add_dataset(&conversation.id, &body.url, &state.worker_pool, body.name)
        .await
    {
        Ok(dataset) => dataset,
        Err(e) => {
            state
                .connection_manager
                .send_to_user(&user.id, &events::dataset_error("", &e.to_string()))
                .await;
            return Err(e.into());
        }
    };

    state
        .connection_manager
        .send_to_user(&user.id, &events::dataset_loaded(&dataset_event_payload(&dataset)))
        .await;
    spawn_auto_profile(&state, user.id, dataset.id.clone(), dataset.url.clone());

    Ok((
        StatusCode::CREATED,
        Json(json!({ "dataset_id": dataset.id, "status": "loading" })),
    ))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/datasets/upload
// ---------------------------------------------------------------------------

pub async fn upload_dataset(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(conversation_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;

    let mut filename = String::new();
    let mut content: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or_default().to_string();
            content = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {e}")))?
                    .to_vec(),
            );
        }
    }
    let content = content.ok_or_else(|| ApiError::bad_request("Missing 'file' field"))?;

    let lower = filename.to_lowercase();
    let extension = if lower.ends_with(".csv.gz") {
        ".csv.gz"
    } else if lower.ends_with(".parquet") {
        ".parquet"
    } else if lower.ends_with(".csv") {
        ".csv"
    } else if lower.ends_with(".tsv") {
        ".tsv"
    } else {
        return Err(ApiError::bad_request(
            "Only .parquet, .csv, .tsv, and .csv.gz files are supported",
        ));
    };

    let max_bytes = CONFIG.uploads.max_upload_size_mb * 1024 * 1024;
    if content.len() as u64 > max_bytes {
        return Err(ApiError::bad_request(format!(
            "File too large (max {}MB)",
            CONFIG.uploads.max_upload_size_mb
        )));
    }

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM datasets WHERE conversation_id = ?")
        .bind(&conversation.id)
        .fetch_one(&state.db)
        .await?;
    if count >= state.dataset_catalog.max_datasets() {
        return Err(ApiError::bad_request(format!(
            "Maximum {} datasets reached",
            state.dataset_catalog.max_datasets()
        )));
    }

    if extension == ".parquet" && (content.len() < 4 || &content[..4] != b"PAR1") {
        return Err(ApiError::bad_request("Not a valid parquet file"));
    }

    let upload_dir = PathBuf::from(&CONFIG.uploads.upload_dir);
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to create upload dir: {e}")))?;
    let saved_path = upload_dir.join(format!("{}{}", Uuid::new_v4(), extension));
    tokio::fs::write(&saved_path, &content)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to save upload: {e}")))?;

    let absolute = saved_path
        .canonicalize()
        .unwrap_or_else(|_| saved_path.clone());
    let stored_url = format!("file://{}", absolute.display());

    let schema = match state.worker_pool.get_schema(&stored_url).await {
        Ok(schema) => schema,
        Err(e) => {
            // Keep the uploads directory clean on extraction failure.
            let _ = tokio::fs::remove_file(&saved_path).await;
            return Err(ApiError::bad_request(e.message));
        }
    };

    let dataset_id = Uuid::new_v4().to_string();
    let table_name = format!("table{}", count + 1);
    let schema_json = serde_json::to_string(&schema.columns).unwrap_or_else(|_| "[]".into());
    sqlx::query(
        "INSERT INTO datasets \
         (id, conversation_id, url, name, row_count, column_count, schema_json, status, \
          error_message, loaded_at, file_size_bytes) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'ready', NULL, ?, ?)",
    )
    .bind(&dataset_id)
    .bind(&conversation.id)
    .bind(&stored_url)
    .bind(&table_name)
    .bind(schema.row_count)
    .bind(schema.columns.len() as i64)
    .bind(&schema_json)
    .bind(now_iso())
    .bind(content.len() as i64)
    .execute(&state.db)
    .await?;

    let dataset = dataset_or_404(&state, &dataset_id, &conversation.id).await?;
    state
        .connection_manager
        .send_to_user(&user.id, &events::dataset_loaded(&dataset_event_payload(&dataset)))
        .await;
    spawn_auto_profile(&state, user.id, dataset_id.clone(), stored_url);

    Ok((
        StatusCode::CREATED,
        Json(json!({ "dataset_id": dataset_id, "status": "loading" })),
    ))
}

// ---------------------------------------------------------------------------
// PATCH /conversations/{id}/datasets/{did}
// ---------------------------------------------------------------------------

pub async fn rename_dataset(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((conversation_id, dataset_id)): Path<(String, String)>,
    Json(body): Json<RenameDatasetRequest>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    let dataset = dataset_or_404(&state, &dataset_id, &conversation.id).await?;

    let new_name = body.table_name.trim();
    if new_name.is_empty() {
        return Err(ApiError::bad_request("tableName must not be empty"));
    }
    // Table names stay unique per conversation.
    let clash: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM datasets WHERE conversation_id = ? AND name = ? AND id != ?",
    )
    .bind(&conversation.id)
    .bind(new_name)
    .bind(&dataset.id)
    .fetch_one(&state.db)
    .await?;
    if clash > 0 {
        return Err(ApiError::bad_request(
            "A dataset with this table name already exists in the conversation",
        ));
    }

    sqlx::query("UPDATE datasets SET name = ? WHERE id = ?")
        .bind(new_name)
        .bind(&dataset.id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({
        "id": dataset.id,
        "name": new_name,
        "tableName": new_name,
        "url": dataset.url,
        "row_count": dataset.row_count,
        "column_count": dataset.column_count,
    })))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/datasets/{did}/refresh
// ---------------------------------------------------------------------------

pub async fn refresh_dataset(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((conversation_id, dataset_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    dataset_or_404(&state, &dataset_id, &conversation.id).await?;

    let dataset = state
        .dataset_catalog
        .refresh_schema(&dataset_id, &state.worker_pool)
        .await?;

    Ok(Json(json!({
        "id": dataset.id,
        "name": dataset.name,
        "tableName": dataset.name,
        "url": dataset.url,
        "row_count": dataset.row_count,
        "column_count": dataset.column_count,
        "schema_json": dataset.schema_json,
    })))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/datasets/{did}/profile
// ---------------------------------------------------------------------------

pub async fn profile_dataset(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((conversation_id, dataset_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    let dataset = dataset_or_404(&state, &dataset_id, &conversation.id).await?;

    let profiles = state
        .worker_pool
        .profile_columns(&dataset.url)
        .await
        .map_err(|e| ApiError::internal(e.message))?;
    Ok(Json(json!({ "profiles": profiles })))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/datasets/{did}/profile-column
// ---------------------------------------------------------------------------

pub async fn profile_single_column(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((conversation_id, dataset_id)): Path<(String, String)>,
    Json(body): Json<ProfileColumnRequest>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    let dataset = dataset_or_404(&state, &dataset_id, &conversation.id).await?;

    let result = state
        .worker_pool
        .profile_column(&dataset.url, &dataset.name, &body.column_name, &body.column_type)
        .await
        .map_err(|e| ApiError::internal(e.message))?;
    Ok(Json(result))
}

// ---------------------------------------------------------------------------
// POST /conversations/{id}/datasets/{did}/preview
// ---------------------------------------------------------------------------

pub async fn preview_dataset(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((conversation_id, dataset_id)): Path<(String, String)>,
    Query(params): Query<PreviewParams>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    let dataset = dataset_or_404(&state, &dataset_id, &conversation.id).await?;

    let sample_size = params.sample_size.clamp(1, 100);
    if !(0.01..=100.0).contains(&params.sample_percentage) {
        return Err(ApiError::bad_request(
            "sample_percentage must be between 0.01 and 100",
        ));
    }

    // Backward compatibility: random_sample=true overrides the default method.
    let mut sample_method = params.sample_method.clone();
    if params.random_sample && sample_method == "head" {
        sample_method = "random".to_string();
    }

    let table = &dataset.name;
    let sql = match sample_method.as_str() {
        "head" => format!("SELECT * FROM \"{table}\" LIMIT {sample_size}"),
        "tail" => format!(
            "SELECT * FROM (SELECT *, ROW_NUMBER() OVER () as _rn FROM \"{table}\") sub \
             ORDER BY _rn DESC LIMIT {sample_size}"
        ),
        "random" => format!("SELECT * FROM \"{table}\" ORDER BY RANDOM() LIMIT {sample_size}"),
        "stratified" => {
            let Some(sample_column) = params.sample_column.as_deref() else {
                return Err(ApiError::bad_request(
                    "sample_column is required for stratified sampling",
                ));
            };
            let schema: Vec<Value> = serde_json::from_str(&dataset.schema_json).unwrap_or_default();
            let known = schema
                .iter()
                .any(|c| c.get("name").and_then(|n| n.as_str()) == Some(sample_column));
            if !known {
                return Err(ApiError::bad_request(format!(
                    "Column '{sample_column}' not found in dataset schema"
                )));
            }

            let worker_datasets = vec![crate::workers::QueryDataset {
                url: dataset.url.clone(),
                table_name: table.clone(),
            }];
            let count_sql =
                format!("SELECT COUNT(DISTINCT \"{sample_column}\") as cnt FROM \"{table}\"");
            let count_result = state
                .worker_pool
                .run_query(&count_sql, &worker_datasets)
                .await
                .map_err(|e| ApiError::internal(e.message))?;
            let num_distinct = count_result
                .rows
                .first()
                .and_then(|row| row.first())
                .and_then(|v| v.as_i64())
                .unwrap_or(1)
                .max(1);
            let per_group = sample_size.div_ceil(num_distinct as usize);

            format!(
                "SELECT * FROM (SELECT *, ROW_NUMBER() OVER (PARTITION BY \"{sample_column}\" \
                 ORDER BY RANDOM()) as _rn FROM \"{table}\") sub \
                 WHERE _rn <= {per_group} LIMIT {sample_size}"
            )
        }
        "percentage" => {
            let total_rows = dataset.row_count.max(0) as f64;
            let computed = ((total_rows * params.sample_percentage / 100.0).round() as i64)
                .clamp(1, 100);
            format!("SELECT * FROM \"{table}\" ORDER BY RANDOM() LIMIT {computed}")
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "Unknown sample_method '{other}'"
            )));
        }
    };

    let worker_datasets = vec![crate::workers::QueryDataset {
        url: dataset.url.clone(),
        table_name: table.clone(),
    }];
    let result = state
        .worker_pool
        .run_query(&sql, &worker_datasets)
        .await
        .map_err(|e| ApiError::internal(e.message))?;

    // Drop the window-function helper column from the response.
    let keep: Vec<usize> = result
        .columns
        .iter()
        .enumerate()
        .filter(|(_, name)| name.as_str() != "_rn")
        .map(|(i, _)| i)
        .collect();
    let display_columns: Vec<&String> = keep.iter().map(|&i| &result.columns[i]).collect();
    let rows: Vec<Vec<&Value>> = result
        .rows
        .iter()
        .map(|row| keep.iter().filter_map(|&i| row.get(i)).collect())
        .collect();

    Ok(Json(json!({
        "columns": display_columns,
        "rows": rows,
        "total_rows": dataset.row_count,
        "sample_method": sample_method,
    })))
}

// ---------------------------------------------------------------------------
// DELETE /conversations/{id}/datasets/{did}
// ---------------------------------------------------------------------------

pub async fn remove_dataset(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((conversation_id, dataset_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    dataset_or_404(&state, &dataset_id, &conversation.id).await?;

    state.dataset_catalog.remove_dataset(&dataset_id).await?;
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// GET/PATCH /conversations/{id}/datasets/{did}/column-descriptions
// ---------------------------------------------------------------------------

pub async fn get_column_descriptions(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((conversation_id, dataset_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    let dataset = dataset_or_404(&state, &dataset_id, &conversation.id).await?;

    let descriptions: Value =
        serde_json::from_str(&dataset.column_descriptions).unwrap_or_else(|_| json!({}));
    Ok(Json(json!({ "descriptions": descriptions })))
}

pub async fn update_column_descriptions(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((conversation_id, dataset_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &user.id, &conversation_id).await?;
    dataset_or_404(&state, &dataset_id, &conversation.id).await?;

    let descriptions = body
        .get("descriptions")
        .and_then(|d| d.as_object())
        .ok_or_else(|| ApiError::bad_request("descriptions must be a dict"))?;
    for (key, value) in descriptions {
        let Some(text) = value.as_str() else {
            return Err(ApiError::bad_request("All keys and values must be strings"));
        };
        if text.chars().count() > 500 {
            return Err(ApiError::bad_request(format!(
                "Description for '{key}' exceeds 500 chars"
            )));
        }
    }

    sqlx::query("UPDATE datasets SET column_descriptions = ? WHERE id = ?")
        .bind(serde_json::to_string(descriptions).unwrap_or_else(|_| "{}".into()))
        .bind(&dataset_id)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "success": true, "descriptions": descriptions })))
}
