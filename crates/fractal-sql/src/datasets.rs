//! Dataset tables: the collection header, entries, specifications, and the
//! (entry x specification) -> record binding.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

use models::{ComputePriority, RecordType};

#[derive(Debug, sqlx::FromRow)]
pub struct DatasetDbRow {
    pub id: i64,
    pub dataset_type: RecordType,
    pub name: String,
    pub description: String,
    pub default_compute_tag: String,
    pub default_compute_priority: ComputePriority,
    pub created_on: DateTime<Utc>,
}

pub async fn insert_dataset(
    conn: &mut PgConnection,
    dataset_type: RecordType,
    name: &str,
    description: &str,
    default_compute_tag: &str,
    default_compute_priority: ComputePriority,
) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar(
        r#"
        INSERT INTO dataset
            (dataset_type, name, description, default_compute_tag, default_compute_priority)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (dataset_type, name) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(dataset_type)
    .bind(name)
    .bind(description)
    .bind(default_compute_tag)
    .bind(default_compute_priority)
    .fetch_optional(conn)
    .await
}

pub async fn fetch_dataset(
    conn: &mut PgConnection,
    id: i64,
) -> sqlx::Result<Option<DatasetDbRow>> {
    sqlx::query_as::<_, DatasetDbRow>(
        r#"
        SELECT id, dataset_type, name, description, default_compute_tag,
               default_compute_priority, created_on
        FROM dataset WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await
}

#[derive(Debug, sqlx::FromRow)]
pub struct DatasetEntryDbRow {
    pub dataset_id: i64,
    pub name: String,
    pub comment: Option<String>,
    pub input: Json<Value>,
    pub attributes: Json<Value>,
}

/// Insert one entry; returns false when the name already exists.
pub async fn insert_entry(
    conn: &mut PgConnection,
    dataset_id: i64,
    name: &str,
    comment: Option<&str>,
    input: &Value,
    attributes: &Value,
) -> sqlx::Result<bool> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO dataset_entry (dataset_id, name, comment, input, attributes)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (dataset_id, name) DO NOTHING
        "#,
    )
    .bind(dataset_id)
    .bind(name)
    .bind(comment)
    .bind(Json(input))
    .bind(Json(attributes))
    .execute(conn)
    .await?;
    Ok(inserted.rows_affected() > 0)
}

pub async fn fetch_entries(
    conn: &mut PgConnection,
    dataset_id: i64,
) -> sqlx::Result<Vec<DatasetEntryDbRow>> {
    sqlx::query_as::<_, DatasetEntryDbRow>(
        r#"
        SELECT dataset_id, name, comment, input, attributes
        FROM dataset_entry WHERE dataset_id = $1 ORDER BY name
        "#,
    )
    .bind(dataset_id)
    .fetch_all(conn)
    .await
}

#[derive(Debug, sqlx::FromRow)]
pub struct DatasetSpecificationDbRow {
    pub dataset_id: i64,
    pub name: String,
    pub specification: Json<Value>,
}

pub async fn insert_specification(
    conn: &mut PgConnection,
    dataset_id: i64,
    name: &str,
    specification: &Value,
) -> sqlx::Result<bool> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO dataset_specification (dataset_id, name, specification)
        VALUES ($1, $2, $3)
        ON CONFLICT (dataset_id, name) DO NOTHING
        "#,
    )
    .bind(dataset_id)
    .bind(name)
    .bind(Json(specification))
    .execute(conn)
    .await?;
    Ok(inserted.rows_affected() > 0)
}

pub async fn fetch_specifications(
    conn: &mut PgConnection,
    dataset_id: i64,
) -> sqlx::Result<Vec<DatasetSpecificationDbRow>> {
    sqlx::query_as::<_, DatasetSpecificationDbRow>(
        r#"
        SELECT dataset_id, name, specification
        FROM dataset_specification WHERE dataset_id = $1 ORDER BY name
        "#,
    )
    .bind(dataset_id)
    .fetch_all(conn)
    .await
}

#[derive(Debug, sqlx::FromRow)]
pub struct DatasetRecordDbRow {
    pub dataset_id: i64,
    pub entry_name: String,
    pub specification_name: String,
    pub record_id: i64,
}

pub async fn attach_record(
    conn: &mut PgConnection,
    dataset_id: i64,
    entry_name: &str,
    specification_name: &str,
    record_id: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO dataset_record (dataset_id, entry_name, specification_name, record_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (dataset_id, entry_name, specification_name) DO NOTHING
        "#,
    )
    .bind(dataset_id)
    .bind(entry_name)
    .bind(specification_name)
    .bind(record_id)
    .execute(conn)
    .await
    .map(|_| ())
}

pub async fn fetch_records(
    conn: &mut PgConnection,
    dataset_id: i64,
) -> sqlx::Result<Vec<DatasetRecordDbRow>> {
    sqlx::query_as::<_, DatasetRecordDbRow>(
        r#"
        SELECT dataset_id, entry_name, specification_name, record_id
        FROM dataset_record WHERE dataset_id = $1
        ORDER BY specification_name, entry_name
        "#,
    )
    .bind(dataset_id)
    .fetch_all(conn)
    .await
}
