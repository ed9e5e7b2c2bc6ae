//! Compute-manager registry SQL.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

use models::ManagerStatus;

#[derive(Debug, sqlx::FromRow)]
pub struct ManagerDbRow {
    pub id: i64,
    pub name: String,
    pub cluster: String,
    pub hostname: String,
    pub uuid: String,
    pub manager_version: String,
    pub username: Option<String>,
    pub programs: Json<Value>,
    pub tags: Vec<String>,
    pub status: ManagerStatus,
    pub claimed: i64,
    pub successes: i64,
    pub failures: i64,
    pub rejected: i64,
    pub resources: Json<Value>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
}

const MANAGER_COLUMNS: &str = "id, name, cluster, hostname, uuid, manager_version, username, \
     programs, tags, status, claimed, successes, failures, rejected, resources, \
     created_on, modified_on";

#[allow(clippy::too_many_arguments)]
pub async fn insert_manager(
    conn: &mut PgConnection,
    name: &str,
    cluster: &str,
    hostname: &str,
    uuid: &str,
    manager_version: &str,
    username: Option<&str>,
    programs: &Value,
    tags: &[String],
) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar(
        r#"
        INSERT INTO compute_manager
            (name, cluster, hostname, uuid, manager_version, username, programs, tags)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (cluster, hostname, uuid) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(cluster)
    .bind(hostname)
    .bind(uuid)
    .bind(manager_version)
    .bind(username)
    .bind(Json(programs))
    .bind(tags)
    .fetch_optional(conn)
    .await
}

pub async fn fetch_manager(
    conn: &mut PgConnection,
    name: &str,
) -> sqlx::Result<Option<ManagerDbRow>> {
    let sql = format!("SELECT {MANAGER_COLUMNS} FROM compute_manager WHERE name = $1");
    sqlx::query_as::<_, ManagerDbRow>(&sql)
        .bind(name)
        .fetch_optional(conn)
        .await
}

/// Lock the manager row for counter updates within the claim/return
/// transaction.
pub async fn lock_manager(
    conn: &mut PgConnection,
    name: &str,
) -> sqlx::Result<Option<ManagerDbRow>> {
    let sql = format!("SELECT {MANAGER_COLUMNS} FROM compute_manager WHERE name = $1 FOR UPDATE");
    sqlx::query_as::<_, ManagerDbRow>(&sql)
        .bind(name)
        .fetch_optional(conn)
        .await
}

pub async fn update_heartbeat(
    conn: &mut PgConnection,
    name: &str,
    resources: &Value,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE compute_manager SET resources = $2, modified_on = NOW() WHERE name = $1",
    )
    .bind(name)
    .bind(Json(resources))
    .execute(conn)
    .await
    .map(|_| ())
}

pub async fn add_counters(
    conn: &mut PgConnection,
    name: &str,
    claimed: i64,
    successes: i64,
    failures: i64,
    rejected: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE compute_manager
        SET claimed = claimed + $2,
            successes = successes + $3,
            failures = failures + $4,
            rejected = rejected + $5
        WHERE name = $1
        "#,
    )
    .bind(name)
    .bind(claimed)
    .bind(successes)
    .bind(failures)
    .bind(rejected)
    .execute(conn)
    .await
    .map(|_| ())
}

/// Transition the named managers to inactive, returning those actually
/// transitioned.
pub async fn deactivate(
    conn: &mut PgConnection,
    names: &[String],
) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar(
        r#"
        UPDATE compute_manager
        SET status = 'inactive', modified_on = NOW()
        WHERE name = ANY($1) AND status = 'active'
        RETURNING name
        "#,
    )
    .bind(names)
    .fetch_all(conn)
    .await
}

/// Names of active managers whose heartbeat predates the cutoff.
pub async fn stale_manager_names(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar(
        "SELECT name FROM compute_manager WHERE status = 'active' AND modified_on < $1",
    )
    .bind(cutoff)
    .fetch_all(conn)
    .await
}

pub struct ManagerQuery<'a> {
    pub name: Option<&'a [String]>,
    pub cluster: Option<&'a [String]>,
    pub hostname: Option<&'a [String]>,
    pub status: Option<&'a [String]>,
    pub modified_before: Option<DateTime<Utc>>,
    pub modified_after: Option<DateTime<Utc>>,
    pub limit: i64,
    pub skip: i64,
}

pub async fn query_managers(
    conn: &mut PgConnection,
    query: &ManagerQuery<'_>,
) -> sqlx::Result<(i64, Vec<ManagerDbRow>)> {
    const FILTER: &str = r#"
        WHERE ($1::TEXT[] IS NULL OR name = ANY($1))
          AND ($2::TEXT[] IS NULL OR cluster = ANY($2))
          AND ($3::TEXT[] IS NULL OR hostname = ANY($3))
          AND ($4::TEXT[] IS NULL OR status::TEXT = ANY($4))
          AND ($5::TIMESTAMPTZ IS NULL OR modified_on < $5)
          AND ($6::TIMESTAMPTZ IS NULL OR modified_on > $6)
    "#;

    let count_sql = format!("SELECT COUNT(*) FROM compute_manager {FILTER}");
    let n_found: i64 = sqlx::query_scalar(&count_sql)
        .bind(query.name)
        .bind(query.cluster)
        .bind(query.hostname)
        .bind(query.status)
        .bind(query.modified_before)
        .bind(query.modified_after)
        .fetch_one(&mut *conn)
        .await?;

    let page_sql = format!(
        "SELECT {MANAGER_COLUMNS} FROM compute_manager {FILTER} ORDER BY id OFFSET $7 LIMIT $8"
    );
    let rows = sqlx::query_as::<_, ManagerDbRow>(&page_sql)
        .bind(query.name)
        .bind(query.cluster)
        .bind(query.hostname)
        .bind(query.status)
        .bind(query.modified_before)
        .bind(query.modified_after)
        .bind(query.skip)
        .bind(query.limit)
        .fetch_all(conn)
        .await?;

    Ok((n_found, rows))
}
