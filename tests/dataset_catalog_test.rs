// tests/dataset_catalog_test.rs
// Catalog rules: add pipeline, duplicate guard, cap, auto naming,
// refresh, removal.

mod common;

use std::sync::Arc;

use chatdf_backend::datasets::{CatalogError, DatasetCatalog};
use chatdf_backend::workers::{DataPool, WorkerError};

use common::*;

async fn catalog_with_conv() -> (sqlx::SqlitePool, DatasetCatalog) {
    let pool = fresh_db().await;
    seed_user(&pool, "u1").await;
    seed_conversation(&pool, "c1", "u1").await;
    let catalog = DatasetCatalog::new(pool.clone(), 50, "/tmp/chatdf-test-uploads");
    (pool, catalog)
}

#[tokio::test]
async fn test_add_dataset_full_pipeline() {
    let (_pool, catalog) = catalog_with_conv().await;
    let data_pool = ScriptedPool::empty() as Arc<dyn DataPool>;

    let dataset = catalog
        .add_dataset("c1", "https://e.com/data.parquet", &data_pool, None)
        .await
        .unwrap();

    assert_eq!(dataset.name, "table1");
    assert_eq!(dataset.status, "ready");
    assert_eq!(dataset.row_count, 10);
    assert_eq!(dataset.column_count, 1);
    assert_eq!(dataset.file_size_bytes, Some(1234));
    assert!(dataset.schema_json.contains("\"name\":\"a\""));
}

#[tokio::test]
async fn test_auto_table_names_increment() {
    let (_pool, catalog) = catalog_with_conv().await;
    let data_pool = ScriptedPool::empty() as Arc<dyn DataPool>;

    let first = catalog
        .add_dataset("c1", "https://e.com/a.parquet", &data_pool, None)
        .await
        .unwrap();
    let second = catalog
        .add_dataset("c1", "https://e.com/b.parquet", &data_pool, None)
        .await
        .unwrap();

    assert_eq!(first.name, "table1");
    assert_eq!(second.name, "table2");
}

#[tokio::test]
async fn test_explicit_name_respected() {
    let (_pool, catalog) = catalog_with_conv().await;
    let data_pool = ScriptedPool::empty() as Arc<dyn DataPool>;

    let dataset = catalog
        .add_dataset(
            "c1",
            "https://e.com/a.parquet",
            &data_pool,
            Some("sales".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(dataset.name, "sales");
}

#[tokio::test]
async fn test_duplicate_url_same_conversation_rejected() {
    let (_pool, catalog) = catalog_with_conv().await;
    let data_pool = ScriptedPool::empty() as Arc<dyn DataPool>;

    catalog
        .add_dataset("c1", "https://e.com/d.parquet", &data_pool, None)
        .await
        .unwrap();
    let err = catalog
        .add_dataset("c1", "https://e.com/d.parquet", &data_pool, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already loaded"));
}

#[tokio::test]
async fn test_duplicate_url_across_conversations_allowed() {
    let (pool, catalog) = catalog_with_conv().await;
    seed_conversation(&pool, "c2", "u1").await;
    let data_pool = ScriptedPool::empty() as Arc<dyn DataPool>;

    catalog
        .add_dataset("c1", "https://e.com/d.parquet", &data_pool, None)
        .await
        .unwrap();
    catalog
        .add_dataset("c2", "https://e.com/d.parquet", &data_pool, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cap_enforced_at_exactly_50() {
    let (pool, catalog) = catalog_with_conv().await;
    let data_pool = ScriptedPool::empty() as Arc<dyn DataPool>;

    for i in 0..50 {
        seed_dataset(
            &pool,
            &format!("d{i}"),
            "c1",
            &format!("https://e.com/{i}.parquet"),
        )
        .await;
    }

    let err = catalog
        .add_dataset("c1", "https://e.com/one-more.parquet", &data_pool, None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Maximum 50 datasets reached");
}

#[tokio::test]
async fn test_worker_validation_failure_surfaces() {
    let (_pool, catalog) = catalog_with_conv().await;
    let data_pool = ScriptedPool::empty()
        .failing_validation(WorkerError::validation("Not a valid parquet file"))
        as Arc<dyn DataPool>;

    let err = catalog
        .add_dataset("c1", "https://e.com/d.parquet", &data_pool, None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Not a valid parquet file");
}

#[tokio::test]
async fn test_file_url_rejected_at_catalog_layer() {
    let (_pool, catalog) = catalog_with_conv().await;
    let data_pool = ScriptedPool::empty() as Arc<dyn DataPool>;

    let err = catalog
        .add_dataset("c1", "file:///etc/passwd", &data_pool, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Invalid(_)));
}

#[tokio::test]
async fn test_refresh_missing_dataset_is_not_found() {
    let (_pool, catalog) = catalog_with_conv().await;
    let data_pool = ScriptedPool::empty() as Arc<dyn DataPool>;

    let err = catalog.refresh_schema("ghost", &data_pool).await.unwrap_err();
    assert!(matches!(err, CatalogError::NotFound));
}

#[tokio::test]
async fn test_refresh_updates_schema_fields() {
    let (pool, catalog) = catalog_with_conv().await;
    seed_dataset(&pool, "d1", "c1", "https://e.com/d.parquet").await;
    // Stale values that the refresh should overwrite.
    sqlx::query("UPDATE datasets SET row_count = 0, column_count = 0 WHERE id = 'd1'")
        .execute(&pool)
        .await
        .unwrap();
    let data_pool = ScriptedPool::empty() as Arc<dyn DataPool>;

    let refreshed = catalog.refresh_schema("d1", &data_pool).await.unwrap();
    assert_eq!(refreshed.row_count, 10);
    assert_eq!(refreshed.column_count, 1);
    assert_eq!(refreshed.status, "ready");
}

#[tokio::test]
async fn test_remove_dataset_deletes_row() {
    let (pool, catalog) = catalog_with_conv().await;
    seed_dataset(&pool, "d1", "c1", "https://e.com/d.parquet").await;

    catalog.remove_dataset("d1").await.unwrap();
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM datasets")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_remove_refuses_unlink_outside_upload_dir() {
    let upload_dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let victim = outside.path().join("victim.parquet");
    std::fs::write(&victim, b"PAR1data").unwrap();

    let pool = fresh_db().await;
    seed_user(&pool, "u1").await;
    seed_conversation(&pool, "c1", "u1").await;
    let catalog = DatasetCatalog::new(pool.clone(), 50, upload_dir.path());
    seed_dataset(&pool, "d1", "c1", &format!("file://{}", victim.display())).await;

    catalog.remove_dataset("d1").await.unwrap();

    // The row is gone but the file outside the uploads directory survives.
    assert!(victim.exists());
}

#[tokio::test]
async fn test_remove_unlinks_uploaded_file() {
    let upload_dir = tempfile::tempdir().unwrap();
    let uploaded = upload_dir.path().join("abc.parquet");
    std::fs::write(&uploaded, b"PAR1data").unwrap();

    let pool = fresh_db().await;
    seed_user(&pool, "u1").await;
    seed_conversation(&pool, "c1", "u1").await;
    let catalog = DatasetCatalog::new(pool.clone(), 50, upload_dir.path());
    seed_dataset(&pool, "d1", "c1", &format!("file://{}", uploaded.display())).await;

    catalog.remove_dataset("d1").await.unwrap();
    assert!(!uploaded.exists());
}

#[tokio::test]
async fn test_get_datasets_ordered_by_loaded_at() {
    let (pool, catalog) = catalog_with_conv().await;
    sqlx::query(
        "INSERT INTO datasets (id, conversation_id, url, name, loaded_at) \
         VALUES ('d2', 'c1', 'https://e.com/b.parquet', 'table2', '2026-01-02T00:00:00')",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO datasets (id, conversation_id, url, name, loaded_at) \
         VALUES ('d1', 'c1', 'https://e.com/a.parquet', 'table1', '2026-01-01T00:00:00')",
    )
    .execute(&pool)
    .await
    .unwrap();

    let datasets = catalog.get_datasets("c1").await.unwrap();
    assert_eq!(datasets.len(), 2);
    assert_eq!(datasets[0].id, "d1");
    assert_eq!(datasets[1].id, "d2");
}
