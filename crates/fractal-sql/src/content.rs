//! Content-addressed tables: molecules, keyword sets, and specifications.
//!
//! Every insert is an `ON CONFLICT (hash) DO NOTHING` upsert followed by a
//! lookup when the row already existed, so writers serialize on the unique
//! hash index and identical content maps to one id.

use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;

use models::{KeywordSet, Molecule, MoleculeIdentifiers};

#[derive(Debug, sqlx::FromRow)]
pub struct MoleculeDbRow {
    pub id: i64,
    pub hash: String,
    pub molecule: Json<Molecule>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct KeywordSetDbRow {
    pub id: i64,
    pub hash: String,
    pub keywords: Json<KeywordSet>,
}

/// Insert-or-lookup by hash. Returns (inserted, id).
pub async fn upsert_molecule(
    conn: &mut PgConnection,
    hash: &str,
    molecule: &Molecule,
) -> sqlx::Result<(bool, i64)> {
    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO molecule (hash, molecule)
        VALUES ($1, $2)
        ON CONFLICT (hash) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(hash)
    .bind(Json(molecule))
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(id) => Ok((true, id)),
        None => {
            let id: i64 = sqlx::query_scalar("SELECT id FROM molecule WHERE hash = $1")
                .bind(hash)
                .fetch_one(conn)
                .await?;
            Ok((false, id))
        }
    }
}

pub async fn fetch_molecules(
    conn: &mut PgConnection,
    ids: &[i64],
) -> sqlx::Result<Vec<MoleculeDbRow>> {
    sqlx::query_as::<_, MoleculeDbRow>(
        "SELECT id, hash, molecule FROM molecule WHERE id = ANY($1) ORDER BY id",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
}

pub async fn molecule_exists(conn: &mut PgConnection, id: i64) -> sqlx::Result<bool> {
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM molecule WHERE id = $1)")
        .bind(id)
        .fetch_one(conn)
        .await
}

/// Replace the mutable identifiers sub-record; the hash never changes.
pub async fn update_molecule_identifiers(
    conn: &mut PgConnection,
    id: i64,
    identifiers: &MoleculeIdentifiers,
) -> sqlx::Result<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE molecule
        SET molecule = jsonb_set(molecule, '{identifiers}', $2)
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(Json(identifiers))
    .execute(conn)
    .await?;
    Ok(updated.rows_affected() > 0)
}

pub async fn upsert_keyword_set(
    conn: &mut PgConnection,
    hash: &str,
    keywords: &KeywordSet,
) -> sqlx::Result<(bool, i64)> {
    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO keyword_set (hash, keywords)
        VALUES ($1, $2)
        ON CONFLICT (hash) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(hash)
    .bind(Json(keywords))
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(id) => Ok((true, id)),
        None => {
            let id: i64 = sqlx::query_scalar("SELECT id FROM keyword_set WHERE hash = $1")
                .bind(hash)
                .fetch_one(conn)
                .await?;
            Ok((false, id))
        }
    }
}

pub async fn fetch_keyword_sets(
    conn: &mut PgConnection,
    ids: &[i64],
) -> sqlx::Result<Vec<KeywordSetDbRow>> {
    sqlx::query_as::<_, KeywordSetDbRow>(
        "SELECT id, hash, keywords FROM keyword_set WHERE id = ANY($1) ORDER BY id",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
}

pub async fn keyword_set_exists(conn: &mut PgConnection, id: i64) -> sqlx::Result<bool> {
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM keyword_set WHERE id = $1)")
        .bind(id)
        .fetch_one(conn)
        .await
}

#[derive(Debug, sqlx::FromRow)]
pub struct QcSpecificationDbRow {
    pub id: i64,
    pub program: String,
    pub driver: models::Driver,
    pub method: String,
    pub basis: Option<String>,
    pub keywords_id: i64,
    pub protocols: Json<Value>,
}

pub async fn upsert_qc_specification(
    conn: &mut PgConnection,
    hash: &str,
    program: &str,
    driver: models::Driver,
    method: &str,
    basis: Option<&str>,
    keywords_id: i64,
    protocols: &Value,
) -> sqlx::Result<(bool, i64)> {
    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO qc_specification (hash, program, driver, method, basis, keywords_id, protocols)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (hash) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(hash)
    .bind(program)
    .bind(driver)
    .bind(method)
    .bind(basis)
    .bind(keywords_id)
    .bind(Json(protocols))
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(id) => Ok((true, id)),
        None => {
            let id: i64 = sqlx::query_scalar("SELECT id FROM qc_specification WHERE hash = $1")
                .bind(hash)
                .fetch_one(conn)
                .await?;
            Ok((false, id))
        }
    }
}

pub async fn fetch_qc_specification(
    conn: &mut PgConnection,
    id: i64,
) -> sqlx::Result<Option<QcSpecificationDbRow>> {
    sqlx::query_as::<_, QcSpecificationDbRow>(
        r#"
        SELECT id, program, driver, method, basis, keywords_id, protocols
        FROM qc_specification WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await
}

#[derive(Debug, sqlx::FromRow)]
pub struct OptimizationSpecificationDbRow {
    pub id: i64,
    pub program: String,
    pub qc_specification_id: i64,
    pub keywords: Json<Value>,
    pub protocols: Json<Value>,
}

pub async fn upsert_optimization_specification(
    conn: &mut PgConnection,
    hash: &str,
    program: &str,
    qc_specification_id: i64,
    keywords: &Value,
    protocols: &Value,
) -> sqlx::Result<(bool, i64)> {
    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO optimization_specification (hash, program, qc_specification_id, keywords, protocols)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (hash) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(hash)
    .bind(program)
    .bind(qc_specification_id)
    .bind(Json(keywords))
    .bind(Json(protocols))
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(id) => Ok((true, id)),
        None => {
            let id: i64 =
                sqlx::query_scalar("SELECT id FROM optimization_specification WHERE hash = $1")
                    .bind(hash)
                    .fetch_one(conn)
                    .await?;
            Ok((false, id))
        }
    }
}

pub async fn fetch_optimization_specification(
    conn: &mut PgConnection,
    id: i64,
) -> sqlx::Result<Option<OptimizationSpecificationDbRow>> {
    sqlx::query_as::<_, OptimizationSpecificationDbRow>(
        r#"
        SELECT id, program, qc_specification_id, keywords, protocols
        FROM optimization_specification WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await
}

/// Generic service-specification row: every service spec table shares the
/// (hash, inner ids, keywords) shape.
#[derive(Debug, sqlx::FromRow)]
pub struct ServiceSpecificationDbRow {
    pub id: i64,
    pub qc_specification_id: Option<i64>,
    pub optimization_specification_id: Option<i64>,
    pub keywords: Option<Json<Value>>,
}

/// Upsert into one of the service-specification tables. The table name is a
/// compile-time constant chosen by the caller, never user input.
pub async fn upsert_service_specification(
    conn: &mut PgConnection,
    table: &'static str,
    hash: &str,
    qc_specification_id: Option<i64>,
    optimization_specification_id: Option<i64>,
    keywords: Option<&Value>,
) -> sqlx::Result<(bool, i64)> {
    let (columns, placeholders): (&str, &str) = match table {
        "torsiondrive_specification" | "gridoptimization_specification" => {
            ("optimization_specification_id, keywords", "$2, $3")
        }
        "manybody_specification" => ("qc_specification_id, keywords", "$2, $3"),
        "reaction_specification" => {
            ("qc_specification_id, optimization_specification_id", "$2, $3")
        }
        "neb_specification" => (
            "qc_specification_id, optimization_specification_id, keywords",
            "$2, $3, $4",
        ),
        other => panic!("unknown service specification table {other}"),
    };

    let sql = format!(
        "INSERT INTO {table} (hash, {columns}) VALUES ($1, {placeholders})
         ON CONFLICT (hash) DO NOTHING RETURNING id"
    );

    let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(hash);
    query = match table {
        "torsiondrive_specification" | "gridoptimization_specification" => query
            .bind(optimization_specification_id)
            .bind(keywords.map(Json)),
        "manybody_specification" => query.bind(qc_specification_id).bind(keywords.map(Json)),
        "reaction_specification" => query
            .bind(qc_specification_id)
            .bind(optimization_specification_id),
        "neb_specification" => query
            .bind(qc_specification_id)
            .bind(optimization_specification_id)
            .bind(keywords.map(Json)),
        other => panic!("unknown service specification table {other}"),
    };

    match query.fetch_optional(&mut *conn).await? {
        Some(id) => Ok((true, id)),
        None => {
            let sql = format!("SELECT id FROM {table} WHERE hash = $1");
            let id: i64 = sqlx::query_scalar(&sql).bind(hash).fetch_one(conn).await?;
            Ok((false, id))
        }
    }
}

pub async fn fetch_service_specification(
    conn: &mut PgConnection,
    table: &'static str,
    id: i64,
) -> sqlx::Result<Option<ServiceSpecificationDbRow>> {
    let columns = match table {
        "torsiondrive_specification" | "gridoptimization_specification" => {
            "NULL::BIGINT AS qc_specification_id, optimization_specification_id, keywords"
        }
        "manybody_specification" => {
            "qc_specification_id, NULL::BIGINT AS optimization_specification_id, keywords"
        }
        "reaction_specification" => {
            "qc_specification_id, optimization_specification_id, NULL::JSONB AS keywords"
        }
        "neb_specification" => {
            "qc_specification_id, optimization_specification_id, keywords"
        }
        other => panic!("unknown service specification table {other}"),
    };

    let sql = format!("SELECT id, {columns} FROM {table} WHERE id = $1");
    sqlx::query_as::<_, ServiceSpecificationDbRow>(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await
}
