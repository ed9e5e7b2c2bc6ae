//! Postgres backend smoke tests.
//!
//! These run only when TEST_DATABASE_URL points at a throwaway database;
//! without it each test returns early, so the suite stays hermetic.

mod common;

use common::*;
use fractal::store::Store;
use fractal::PgStore;
use models::{ComputePriority, MoleculeUpload, RecordStatus};

macro_rules! maybe_skip_integration {
    () => {
        match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("TEST_DATABASE_URL not set, skipping postgres integration test");
                return;
            }
        }
    };
}

async fn connect(url: &str) -> PgStore {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(url)
        .await
        .expect("connecting to TEST_DATABASE_URL");
    let _ = fractal_sql::migrate(&pool).await;
    PgStore::new(pool)
}

#[tokio::test]
async fn molecules_deduplicate() {
    let url = maybe_skip_integration!();
    let store = connect(&url).await;

    let (meta1, ids1) = store
        .add_molecules(&[MoleculeUpload::New(Box::new(water()))])
        .await
        .unwrap();
    let (meta2, ids2) = store
        .add_molecules(&[MoleculeUpload::New(Box::new(water()))])
        .await
        .unwrap();

    assert_eq!(meta1.n_inserted() + meta1.n_existing(), 1);
    assert_eq!(meta2.n_existing(), 1);
    assert_eq!(ids1[0], ids2[0]);
}

#[tokio::test]
async fn claim_and_return_complete_a_record() {
    let url = maybe_skip_integration!();
    let store = connect(&url).await;

    let (spec, inputs) = singlepoint_submission("psi4", hydrogen_peroxide());
    let (_, ids) = store
        .add_records(&spec, &inputs, "pgtag", ComputePriority::Normal, None, true)
        .await
        .unwrap();
    let record_id = ids[0].unwrap();

    let record = store.get_record_row(record_id).await.unwrap();
    if record.status != RecordStatus::Waiting {
        // A previous run already completed this deduplicated record.
        return;
    }

    let manager =
        SyntheticManager::activate(&store, &format!("pg-{}", uuid::Uuid::new_v4()), &["psi4"], &[
            "pgtag",
        ])
        .await;
    let processed = manager.run_all(&store).await;
    assert!(processed >= 1);

    let record = store.get_record_row(record_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Complete);
    assert!(store.get_task_row(record_id).await.unwrap().is_none());
}
