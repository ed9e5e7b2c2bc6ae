//! The polymorphic record table and its satellites: compute history,
//! outputs, info backups, comments, and the task/service queue rows.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

use models::{
    CompressionKind, ComputePriority, OutputType, RecordDetail, RecordStatus, RecordType,
};

#[derive(Debug, sqlx::FromRow)]
pub struct BaseRecordDbRow {
    pub id: i64,
    pub record_type: RecordType,
    pub status: RecordStatus,
    pub manager_name: Option<String>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub creator_user: Option<String>,
    pub detail: Json<RecordDetail>,
}

const BASE_COLUMNS: &str =
    "id, record_type, status, manager_name, created_on, modified_on, creator_user, detail";

pub async fn insert_base_record(
    conn: &mut PgConnection,
    record_type: RecordType,
    creator_user: Option<&str>,
    dedup_key: &str,
    detail: &RecordDetail,
) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        r#"
        INSERT INTO base_record (record_type, creator_user, dedup_key, detail)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(record_type)
    .bind(creator_user)
    .bind(dedup_key)
    .bind(Json(detail))
    .fetch_one(conn)
    .await
}

pub async fn find_by_dedup_key(
    conn: &mut PgConnection,
    dedup_key: &str,
) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar("SELECT id FROM base_record WHERE dedup_key = $1")
        .bind(dedup_key)
        .fetch_optional(conn)
        .await
}

pub async fn fetch_base_records(
    conn: &mut PgConnection,
    ids: &[i64],
) -> sqlx::Result<Vec<BaseRecordDbRow>> {
    let sql = format!("SELECT {BASE_COLUMNS} FROM base_record WHERE id = ANY($1) ORDER BY id");
    sqlx::query_as::<_, BaseRecordDbRow>(&sql)
        .bind(ids)
        .fetch_all(conn)
        .await
}

/// Lock one record row for the remainder of the transaction. Callers
/// locking several rows must do so in ascending id order.
pub async fn lock_base_record(
    conn: &mut PgConnection,
    id: i64,
) -> sqlx::Result<Option<BaseRecordDbRow>> {
    let sql = format!("SELECT {BASE_COLUMNS} FROM base_record WHERE id = $1 FOR UPDATE");
    sqlx::query_as::<_, BaseRecordDbRow>(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await
}

pub async fn update_record_status(
    conn: &mut PgConnection,
    id: i64,
    status: RecordStatus,
    manager_name: Option<&str>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE base_record
        SET status = $2, manager_name = $3, modified_on = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(manager_name)
    .execute(conn)
    .await
    .map(|_| ())
}

pub async fn update_record_detail(
    conn: &mut PgConnection,
    id: i64,
    detail: &RecordDetail,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE base_record SET detail = $2, modified_on = NOW() WHERE id = $1")
        .bind(id)
        .bind(Json(detail))
        .execute(conn)
        .await
        .map(|_| ())
}

pub async fn delete_base_record(conn: &mut PgConnection, id: i64) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM base_record WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await
        .map(|_| ())
}

// -- compute history ------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
pub struct HistoryDbRow {
    pub id: i64,
    pub record_id: i64,
    pub status: RecordStatus,
    pub manager_name: Option<String>,
    pub modified_on: DateTime<Utc>,
    pub provenance: Option<Json<Value>>,
}

pub async fn insert_history(
    conn: &mut PgConnection,
    record_id: i64,
    status: RecordStatus,
    manager_name: Option<&str>,
) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        r#"
        INSERT INTO record_compute_history (record_id, status, manager_name)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(record_id)
    .bind(status)
    .bind(manager_name)
    .fetch_one(conn)
    .await
}

pub async fn fetch_history(
    conn: &mut PgConnection,
    record_id: i64,
) -> sqlx::Result<Vec<HistoryDbRow>> {
    sqlx::query_as::<_, HistoryDbRow>(
        r#"
        SELECT id, record_id, status, manager_name, modified_on, provenance
        FROM record_compute_history
        WHERE record_id = $1
        ORDER BY id
        "#,
    )
    .bind(record_id)
    .fetch_all(conn)
    .await
}

pub async fn latest_history_id(
    conn: &mut PgConnection,
    record_id: i64,
) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar(
        "SELECT id FROM record_compute_history WHERE record_id = $1 ORDER BY id DESC LIMIT 1",
    )
    .bind(record_id)
    .fetch_optional(conn)
    .await
}

pub async fn update_history(
    conn: &mut PgConnection,
    history_id: i64,
    status: RecordStatus,
    provenance: Option<&Value>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE record_compute_history
        SET status = $2, provenance = COALESCE($3, provenance), modified_on = NOW()
        WHERE id = $1
        "#,
    )
    .bind(history_id)
    .bind(status)
    .bind(provenance.map(Json))
    .execute(conn)
    .await
    .map(|_| ())
}

// -- outputs --------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
pub struct OutputDbRow {
    pub history_id: i64,
    pub output_type: OutputType,
    pub compression: CompressionKind,
    pub data: Vec<u8>,
}

pub async fn upsert_output(
    conn: &mut PgConnection,
    history_id: i64,
    output_type: OutputType,
    compression: CompressionKind,
    data: &[u8],
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO output_store (history_id, output_type, compression, data)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (history_id, output_type)
        DO UPDATE SET compression = EXCLUDED.compression, data = EXCLUDED.data
        "#,
    )
    .bind(history_id)
    .bind(output_type)
    .bind(compression)
    .bind(data)
    .execute(conn)
    .await
    .map(|_| ())
}

pub async fn fetch_outputs(
    conn: &mut PgConnection,
    history_ids: &[i64],
) -> sqlx::Result<Vec<OutputDbRow>> {
    sqlx::query_as::<_, OutputDbRow>(
        r#"
        SELECT history_id, output_type, compression, data
        FROM output_store
        WHERE history_id = ANY($1)
        ORDER BY history_id, output_type
        "#,
    )
    .bind(history_ids)
    .fetch_all(conn)
    .await
}

pub async fn upsert_native_file(
    conn: &mut PgConnection,
    record_id: i64,
    name: &str,
    compression: CompressionKind,
    data: &[u8],
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO native_file (record_id, name, compression, data)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (record_id, name)
        DO UPDATE SET compression = EXCLUDED.compression, data = EXCLUDED.data
        "#,
    )
    .bind(record_id)
    .bind(name)
    .bind(compression)
    .bind(data)
    .execute(conn)
    .await
    .map(|_| ())
}

pub async fn upsert_wavefunction(
    conn: &mut PgConnection,
    record_id: i64,
    compression: CompressionKind,
    data: &[u8],
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO wavefunction_store (record_id, compression, data)
        VALUES ($1, $2, $3)
        ON CONFLICT (record_id)
        DO UPDATE SET compression = EXCLUDED.compression, data = EXCLUDED.data
        "#,
    )
    .bind(record_id)
    .bind(compression)
    .bind(data)
    .execute(conn)
    .await
    .map(|_| ())
}

// -- info backups ---------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
pub struct InfoBackupDbRow {
    pub id: i64,
    pub record_id: i64,
    pub old_status: RecordStatus,
    pub compute_tag: Option<String>,
    pub compute_priority: Option<ComputePriority>,
    pub created_on: DateTime<Utc>,
}

pub async fn push_info_backup(
    conn: &mut PgConnection,
    record_id: i64,
    old_status: RecordStatus,
    compute_tag: Option<&str>,
    compute_priority: Option<ComputePriority>,
) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        r#"
        INSERT INTO record_info_backup (record_id, old_status, compute_tag, compute_priority)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(record_id)
    .bind(old_status)
    .bind(compute_tag)
    .bind(compute_priority)
    .fetch_one(conn)
    .await
}

pub async fn peek_info_backup(
    conn: &mut PgConnection,
    record_id: i64,
) -> sqlx::Result<Option<InfoBackupDbRow>> {
    sqlx::query_as::<_, InfoBackupDbRow>(
        r#"
        SELECT id, record_id, old_status, compute_tag, compute_priority, created_on
        FROM record_info_backup
        WHERE record_id = $1
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(record_id)
    .fetch_optional(conn)
    .await
}

pub async fn pop_info_backup(conn: &mut PgConnection, backup_id: i64) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM record_info_backup WHERE id = $1")
        .bind(backup_id)
        .execute(conn)
        .await
        .map(|_| ())
}

pub async fn info_backup_depth(conn: &mut PgConnection, record_id: i64) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM record_info_backup WHERE record_id = $1")
        .bind(record_id)
        .fetch_one(conn)
        .await
}

// -- comments -------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
pub struct CommentDbRow {
    pub id: i64,
    pub record_id: i64,
    pub username: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub comment: String,
}

pub async fn insert_comment(
    conn: &mut PgConnection,
    record_id: i64,
    username: Option<&str>,
    comment: &str,
) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        "INSERT INTO record_comment (record_id, username, comment) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(record_id)
    .bind(username)
    .bind(comment)
    .fetch_one(conn)
    .await
}

pub async fn fetch_comments(
    conn: &mut PgConnection,
    record_id: i64,
) -> sqlx::Result<Vec<CommentDbRow>> {
    sqlx::query_as::<_, CommentDbRow>(
        r#"
        SELECT id, record_id, username, timestamp, comment
        FROM record_comment WHERE record_id = $1 ORDER BY id
        "#,
    )
    .bind(record_id)
    .fetch_all(conn)
    .await
}

// -- service queue --------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
pub struct ServiceDbRow {
    pub id: i64,
    pub record_id: i64,
    pub service_state: Json<Value>,
    pub compute_tag: String,
    pub compute_priority: ComputePriority,
    pub find_existing: bool,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct ServiceDependencyDbRow {
    pub id: i64,
    pub service_id: i64,
    pub record_id: i64,
    pub extras: Json<Value>,
}

pub async fn insert_service(
    conn: &mut PgConnection,
    record_id: i64,
    compute_tag: &str,
    compute_priority: ComputePriority,
    find_existing: bool,
) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        r#"
        INSERT INTO service_queue (record_id, compute_tag, compute_priority, find_existing)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(record_id)
    .bind(compute_tag)
    .bind(compute_priority)
    .bind(find_existing)
    .fetch_one(conn)
    .await
}

pub async fn fetch_service(
    conn: &mut PgConnection,
    record_id: i64,
) -> sqlx::Result<Option<ServiceDbRow>> {
    sqlx::query_as::<_, ServiceDbRow>(
        r#"
        SELECT id, record_id, service_state, compute_tag, compute_priority, find_existing, created_on
        FROM service_queue WHERE record_id = $1
        "#,
    )
    .bind(record_id)
    .fetch_optional(conn)
    .await
}

pub async fn update_service_state(
    conn: &mut PgConnection,
    service_id: i64,
    state: &Value,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE service_queue SET service_state = $2 WHERE id = $1")
        .bind(service_id)
        .bind(Json(state))
        .execute(conn)
        .await
        .map(|_| ())
}

pub async fn delete_service(conn: &mut PgConnection, record_id: i64) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM service_queue WHERE record_id = $1")
        .bind(record_id)
        .execute(conn)
        .await
        .map(|_| ())
}

pub async fn replace_service_dependencies(
    conn: &mut PgConnection,
    service_id: i64,
    dependencies: &[(i64, Value)],
) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM service_dependency WHERE service_id = $1")
        .bind(service_id)
        .execute(&mut *conn)
        .await?;

    for (record_id, extras) in dependencies {
        sqlx::query(
            "INSERT INTO service_dependency (service_id, record_id, extras) VALUES ($1, $2, $3)",
        )
        .bind(service_id)
        .bind(record_id)
        .bind(Json(extras))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn fetch_service_dependencies(
    conn: &mut PgConnection,
    service_id: i64,
) -> sqlx::Result<Vec<ServiceDependencyDbRow>> {
    sqlx::query_as::<_, ServiceDependencyDbRow>(
        r#"
        SELECT id, service_id, record_id, extras
        FROM service_dependency WHERE service_id = $1 ORDER BY id
        "#,
    )
    .bind(service_id)
    .fetch_all(conn)
    .await
}

/// Record ids of waiting/running services, priority descending then least
/// recently modified, capped.
pub async fn service_queue_batch(conn: &mut PgConnection, limit: i64) -> sqlx::Result<Vec<i64>> {
    sqlx::query_scalar(
        r#"
        SELECT br.id
        FROM service_queue sq
        JOIN base_record br ON br.id = sq.record_id
        WHERE br.status IN ('waiting', 'running')
        ORDER BY sq.compute_priority DESC, br.modified_on ASC, br.id ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(conn)
    .await
}
