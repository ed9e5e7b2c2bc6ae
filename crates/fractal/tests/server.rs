//! Server facade behavior: api limits and error mapping.

mod common;

use common::*;
use fractal::config::{ApiLimits, FractalConfig};
use fractal::Server;
use models::{ComputePriority, Id, MoleculeUpload, ProjectionSpec, RecordQueryFilters, ServerError};

fn small_limits() -> FractalConfig {
    FractalConfig {
        api_limits: ApiLimits {
            get_records: 3,
            add_records: 2,
            get_dataset_entries: 10,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn add_batches_over_the_limit_are_refused_whole() {
    let server = Server::new(mem_store(), small_limits());

    let uploads: Vec<MoleculeUpload> = (0..3)
        .map(|i| {
            let mut m = water();
            m.geometry[0] += i as f64;
            MoleculeUpload::New(Box::new(m))
        })
        .collect();

    let err = server.add_molecules(&uploads).await.unwrap_err();
    match err {
        ServerError::LimitExceeded {
            resource,
            requested,
            limit,
        } => {
            assert_eq!(resource, "add_records");
            assert_eq!(requested, 3);
            assert_eq!(limit, 2);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Within the limit, the same batch succeeds.
    let (meta, _) = server.add_molecules(&uploads[..2]).await.unwrap();
    assert!(meta.success());
}

#[tokio::test]
async fn get_requests_respect_the_read_limit() {
    let server = Server::new(mem_store(), small_limits());
    let ids: Vec<Id> = (1..=4).map(Id).collect();

    let err = server
        .get_records(&ids, &ProjectionSpec::default(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::LimitExceeded { .. }));
}

#[tokio::test]
async fn query_limit_is_capped_server_side() {
    let server = Server::new(mem_store(), small_limits());

    for i in 0..5 {
        let mut m = water();
        m.geometry[0] += i as f64;
        let (spec, inputs) = singlepoint_submission("psi4", m);
        server
            .add_records(&spec, &inputs, "t", ComputePriority::Normal, true)
            .await
            .unwrap();
    }

    let (meta, ids) = server
        .query_records(&RecordQueryFilters {
            limit: Some(100),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(meta.n_found, 5);
    // The requested limit of 100 is capped at the configured 3.
    assert_eq!(meta.n_returned, 3);
    assert_eq!(ids.len(), 3);

    // Skip pages through the remainder.
    let (meta, ids) = server
        .query_records(&RecordQueryFilters {
            skip: 3,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(meta.n_found, 5);
    assert_eq!(ids.len(), 2);
}
