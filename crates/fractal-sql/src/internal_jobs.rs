//! Internal-job table SQL. The claim uses the same `FOR UPDATE SKIP LOCKED`
//! shape as the task queue, with serial-group exclusion folded into the
//! selection.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

#[derive(Debug, sqlx::FromRow)]
pub struct InternalJobDbRow {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub added_on: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub ended_on: Option<DateTime<Utc>>,
    pub runner_uuid: Option<String>,
    pub progress: i32,
    pub unique_name: Option<String>,
    pub serial_group: Option<String>,
    pub repeat_delay_seconds: Option<i64>,
    pub kwargs: Json<Value>,
    pub result: Option<Json<Value>>,
}

const JOB_COLUMNS: &str = "id, name, status, added_on, scheduled_for, started_on, last_updated, \
     ended_on, runner_uuid, progress, unique_name, serial_group, repeat_delay_seconds, \
     kwargs, result";

pub async fn insert_job(
    conn: &mut PgConnection,
    name: &str,
    scheduled_for: DateTime<Utc>,
    unique_name: Option<&str>,
    serial_group: Option<&str>,
    repeat_delay_seconds: Option<i64>,
    kwargs: &Value,
) -> sqlx::Result<i64> {
    if let Some(unique) = unique_name {
        // A live job with this unique name wins.
        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM internal_job
            WHERE unique_name = $1 AND status IN ('waiting', 'running')
            "#,
        )
        .bind(unique)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(id) = existing {
            return Ok(id);
        }
    }

    sqlx::query_scalar(
        r#"
        INSERT INTO internal_job
            (name, scheduled_for, unique_name, serial_group, repeat_delay_seconds, kwargs)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(scheduled_for)
    .bind(unique_name)
    .bind(serial_group)
    .bind(repeat_delay_seconds)
    .bind(Json(kwargs))
    .fetch_one(conn)
    .await
}

/// Claim up to `limit` due jobs for a runner, excluding serial groups that
/// already have a running job.
pub async fn claim_jobs(
    conn: &mut PgConnection,
    runner_uuid: &str,
    limit: i64,
) -> sqlx::Result<Vec<InternalJobDbRow>> {
    let sql = format!(
        r#"
        WITH picked AS (
            SELECT id
            FROM internal_job ij
            WHERE status = 'waiting'
              AND scheduled_for <= NOW()
              AND (
                  serial_group IS NULL
                  OR NOT EXISTS (
                      SELECT 1 FROM internal_job running
                      WHERE running.serial_group = ij.serial_group
                        AND running.status = 'running'
                  )
              )
            ORDER BY scheduled_for ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE internal_job
        SET status = 'running', started_on = NOW(), last_updated = NOW(), runner_uuid = $1
        WHERE id IN (SELECT id FROM picked)
        RETURNING {JOB_COLUMNS}
        "#
    );
    sqlx::query_as::<_, InternalJobDbRow>(&sql)
        .bind(runner_uuid)
        .bind(limit)
        .fetch_all(conn)
        .await
}

/// Record progress; returns the current status so the runner can observe a
/// cancellation.
pub async fn update_progress(
    conn: &mut PgConnection,
    id: i64,
    progress: i32,
) -> sqlx::Result<Option<String>> {
    sqlx::query_scalar(
        r#"
        UPDATE internal_job
        SET progress = LEAST(GREATEST($2, 0), 100),
            last_updated = CASE WHEN status = 'cancelled' THEN last_updated ELSE NOW() END
        WHERE id = $1
        RETURNING status
        "#,
    )
    .bind(id)
    .bind(progress)
    .fetch_optional(conn)
    .await
}

/// Finish a job. Repeating jobs go back to waiting at `now + repeat_delay`;
/// one-shot jobs take the terminal status.
pub async fn finish_job(
    conn: &mut PgConnection,
    id: i64,
    status: &str,
    result: Option<&Value>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE internal_job
        SET status = CASE
                WHEN status = 'cancelled' THEN 'cancelled'
                WHEN repeat_delay_seconds IS NOT NULL AND $2 != 'cancelled' THEN 'waiting'
                ELSE $2
            END,
            scheduled_for = CASE
                WHEN repeat_delay_seconds IS NOT NULL AND $2 != 'cancelled'
                THEN NOW() + make_interval(secs => repeat_delay_seconds)
                ELSE scheduled_for
            END,
            progress = CASE
                WHEN repeat_delay_seconds IS NOT NULL AND $2 != 'cancelled' THEN 0
                ELSE progress
            END,
            runner_uuid = CASE
                WHEN repeat_delay_seconds IS NOT NULL AND $2 != 'cancelled' THEN NULL
                ELSE runner_uuid
            END,
            ended_on = CASE
                WHEN repeat_delay_seconds IS NOT NULL AND $2 != 'cancelled' THEN ended_on
                ELSE NOW()
            END,
            last_updated = NOW(),
            result = COALESCE($3, result)
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(result.map(Json))
    .execute(conn)
    .await
    .map(|_| ())
}

pub async fn cancel_job(conn: &mut PgConnection, id: i64) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE internal_job
        SET status = 'cancelled', last_updated = NOW()
        WHERE id = $1 AND status IN ('waiting', 'running')
        "#,
    )
    .bind(id)
    .execute(conn)
    .await
    .map(|_| ())
}

pub async fn fetch_job(
    conn: &mut PgConnection,
    id: i64,
) -> sqlx::Result<Option<InternalJobDbRow>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM internal_job WHERE id = $1");
    sqlx::query_as::<_, InternalJobDbRow>(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await
}
