//! Task-queue SQL: the claim path and its supporting updates.
//!
//! Claim candidates are selected and locked with `FOR UPDATE SKIP LOCKED`
//! so two managers never observe the same task; program/version eligibility
//! and manager-tag ordering are applied by the caller on the locked set,
//! and rows that end up unchosen release their locks at commit.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

use models::ComputePriority;

#[derive(Debug, sqlx::FromRow)]
pub struct TaskDbRow {
    pub id: i64,
    pub record_id: i64,
    pub spec: Json<Value>,
    pub required_programs: Json<Value>,
    pub compute_tag: String,
    pub compute_priority: ComputePriority,
    pub available: bool,
    pub created_on: DateTime<Utc>,
}

const TASK_COLUMNS: &str =
    "id, record_id, spec, required_programs, compute_tag, compute_priority, available, created_on";

pub async fn insert_task(
    conn: &mut PgConnection,
    record_id: i64,
    spec: &Value,
    required_programs: &Value,
    compute_tag: &str,
    compute_priority: ComputePriority,
    available: bool,
) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        r#"
        INSERT INTO task_queue
            (record_id, spec, required_programs, compute_tag, compute_priority, available)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(record_id)
    .bind(Json(spec))
    .bind(Json(required_programs))
    .bind(compute_tag)
    .bind(compute_priority)
    .bind(available)
    .fetch_one(conn)
    .await
}

pub async fn fetch_task_by_record(
    conn: &mut PgConnection,
    record_id: i64,
) -> sqlx::Result<Option<TaskDbRow>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE record_id = $1");
    sqlx::query_as::<_, TaskDbRow>(&sql)
        .bind(record_id)
        .fetch_optional(conn)
        .await
}

pub async fn fetch_task(conn: &mut PgConnection, task_id: i64) -> sqlx::Result<Option<TaskDbRow>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = $1");
    sqlx::query_as::<_, TaskDbRow>(&sql)
        .bind(task_id)
        .fetch_optional(conn)
        .await
}

pub async fn delete_task_by_record(conn: &mut PgConnection, record_id: i64) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM task_queue WHERE record_id = $1")
        .bind(record_id)
        .execute(conn)
        .await
        .map(|_| ())
}

pub async fn set_task_available(
    conn: &mut PgConnection,
    record_id: i64,
    available: bool,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE task_queue SET available = $2 WHERE record_id = $1")
        .bind(record_id)
        .bind(available)
        .execute(conn)
        .await
        .map(|_| ())
}

/// Select-and-lock available tasks for one manager tag (`%` any tag when
/// `tag` is None), in claim order, skipping rows locked by concurrent
/// claims.
pub async fn lock_claim_candidates(
    conn: &mut PgConnection,
    tag: Option<&str>,
    limit: i64,
) -> sqlx::Result<Vec<TaskDbRow>> {
    let sql = format!(
        r#"
        SELECT {TASK_COLUMNS}
        FROM task_queue
        WHERE available AND ($1::TEXT IS NULL OR compute_tag = $1)
        ORDER BY compute_priority DESC, created_on ASC, id ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#
    );
    sqlx::query_as::<_, TaskDbRow>(&sql)
        .bind(tag)
        .bind(limit)
        .fetch_all(conn)
        .await
}

/// Mark a locked task claimed.
pub async fn mark_claimed(conn: &mut PgConnection, task_id: i64) -> sqlx::Result<()> {
    sqlx::query("UPDATE task_queue SET available = FALSE WHERE id = $1")
        .bind(task_id)
        .execute(conn)
        .await
        .map(|_| ())
}

/// Return every running record assigned to the named managers to waiting:
/// clears the assignment, reopens the task, and leaves compute history
/// untouched. Returns the affected record ids.
pub async fn reset_assigned(
    conn: &mut PgConnection,
    manager_names: &[String],
) -> sqlx::Result<Vec<i64>> {
    let record_ids: Vec<i64> = sqlx::query_scalar(
        r#"
        UPDATE base_record
        SET status = 'waiting', manager_name = NULL, modified_on = NOW()
        WHERE status = 'running' AND manager_name = ANY($1)
        RETURNING id
        "#,
    )
    .bind(manager_names)
    .fetch_all(&mut *conn)
    .await?;

    if !record_ids.is_empty() {
        sqlx::query("UPDATE task_queue SET available = TRUE WHERE record_id = ANY($1)")
            .bind(&record_ids)
            .execute(conn)
            .await?;
    }

    Ok(record_ids)
}

/// Reset running leaf records whose manager is missing or inactive.
pub async fn reset_stale_running(conn: &mut PgConnection) -> sqlx::Result<Vec<i64>> {
    let record_ids: Vec<i64> = sqlx::query_scalar(
        r#"
        UPDATE base_record br
        SET status = 'waiting', manager_name = NULL, modified_on = NOW()
        WHERE br.status = 'running'
          AND br.record_type IN ('singlepoint', 'optimization')
          AND NOT EXISTS (
              SELECT 1 FROM compute_manager cm
              WHERE cm.name = br.manager_name AND cm.status = 'active'
          )
        RETURNING br.id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    if !record_ids.is_empty() {
        sqlx::query("UPDATE task_queue SET available = TRUE WHERE record_id = ANY($1)")
            .bind(&record_ids)
            .execute(conn)
            .await?;
    }

    Ok(record_ids)
}
