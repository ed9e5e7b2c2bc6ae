//! Postgres persistence layer: one module per table area, plain-SQL queries
//! over `sqlx` executors. Transaction boundaries belong to the caller; every
//! function here runs the statements it is given on the connection it is
//! given.

pub mod content;
pub mod datasets;
pub mod internal_jobs;
pub mod managers;
pub mod records;
pub mod tasks;

pub use models::Id;

/// Apply the schema. Statements are idempotence-guarded by the caller
/// (typically a fresh database); failures on existing objects are reported
/// as-is.
pub async fn migrate(pool: &sqlx::PgPool) -> sqlx::Result<()> {
    const SCHEMA: &str = include_str!("../migrations/schema.sql");

    let mut txn = pool.begin().await?;
    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement).execute(&mut txn).await?;
    }
    txn.commit().await
}
