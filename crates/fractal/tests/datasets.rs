//! Dataset submission, status rollup, and cross-dataset seeding.

mod common;

use common::*;
use fractal::datasets;
use fractal::store::{DatasetEntry, DatasetSpecificationEntry, NewDataset, Store};
use models::{
    ComputePriority, Driver, MoleculeUpload, RecordInput, RecordSpecification, RecordStatus,
    RecordType,
};

async fn singlepoint_dataset(store: &dyn Store, name: &str) -> models::Id {
    store
        .add_dataset(NewDataset {
            dataset_type: RecordType::Singlepoint,
            name: name.to_string(),
            description: "test dataset".to_string(),
            default_compute_tag: "tagds".to_string(),
            default_compute_priority: ComputePriority::Normal,
        })
        .await
        .unwrap()
}

fn sp_entry(name: &str, molecule: models::Molecule) -> DatasetEntry {
    DatasetEntry {
        name: name.to_string(),
        comment: Some(format!("entry {name}")),
        input: RecordInput::Singlepoint {
            molecule: MoleculeUpload::New(Box::new(molecule)),
        },
        attributes: serde_json::json!({ "source": "test" }),
    }
}

#[tokio::test]
async fn submit_computes_the_cross_product() {
    let store = mem_store();
    let dataset_id = singlepoint_dataset(store.as_ref(), "waters").await;

    store
        .add_dataset_entries(
            dataset_id,
            &[
                sp_entry("water", water()),
                sp_entry("peroxide", hydrogen_peroxide()),
            ],
        )
        .await
        .unwrap();
    store
        .add_dataset_specifications(
            dataset_id,
            &[
                DatasetSpecificationEntry {
                    name: "psi4/energy".to_string(),
                    specification: RecordSpecification::Singlepoint(qc_spec(
                        "psi4",
                        Driver::Energy,
                    )),
                },
                DatasetSpecificationEntry {
                    name: "rdkit/energy".to_string(),
                    specification: RecordSpecification::Singlepoint(qc_spec(
                        "rdkit",
                        Driver::Energy,
                    )),
                },
            ],
        )
        .await
        .unwrap();

    let meta = datasets::submit_dataset(store.as_ref(), dataset_id, None, None)
        .await
        .unwrap();
    assert_eq!(meta.n_inserted(), 4);

    let items = store.get_dataset_records(dataset_id).await.unwrap();
    assert_eq!(items.len(), 4);

    // Resubmission is a no-op.
    let meta = datasets::submit_dataset(store.as_ref(), dataset_id, None, None)
        .await
        .unwrap();
    assert_eq!(meta.n_inserted(), 0);
    assert_eq!(meta.n_existing(), 4);
}

#[tokio::test]
async fn submission_reuses_existing_identical_records() {
    let store = mem_store();

    // The same calculation submitted directly beforehand.
    let (spec, inputs) = singlepoint_submission("psi4", water());
    let (_, direct_ids) = store
        .add_records(&spec, &inputs, "tagds", ComputePriority::Normal, None, true)
        .await
        .unwrap();

    let dataset_id = singlepoint_dataset(store.as_ref(), "reuse").await;
    store
        .add_dataset_entries(dataset_id, &[sp_entry("water", water())])
        .await
        .unwrap();
    store
        .add_dataset_specifications(
            dataset_id,
            &[DatasetSpecificationEntry {
                name: "psi4/energy".to_string(),
                specification: RecordSpecification::Singlepoint(qc_spec("psi4", Driver::Energy)),
            }],
        )
        .await
        .unwrap();

    let meta = datasets::submit_dataset(store.as_ref(), dataset_id, None, None)
        .await
        .unwrap();
    assert_eq!(meta.n_existing(), 1);
    assert_eq!(meta.n_inserted(), 0);

    let items = store.get_dataset_records(dataset_id).await.unwrap();
    assert_eq!(items[0].record_id, direct_ids[0].unwrap());
}

#[tokio::test]
async fn status_rolls_up_by_specification() {
    let store = mem_store();
    let dataset_id = singlepoint_dataset(store.as_ref(), "status").await;

    store
        .add_dataset_entries(
            dataset_id,
            &[
                sp_entry("water", water()),
                sp_entry("peroxide", hydrogen_peroxide()),
            ],
        )
        .await
        .unwrap();
    store
        .add_dataset_specifications(
            dataset_id,
            &[DatasetSpecificationEntry {
                name: "psi4/energy".to_string(),
                specification: RecordSpecification::Singlepoint(qc_spec("psi4", Driver::Energy)),
            }],
        )
        .await
        .unwrap();
    datasets::submit_dataset(store.as_ref(), dataset_id, None, None)
        .await
        .unwrap();

    let status = datasets::dataset_status(store.as_ref(), dataset_id)
        .await
        .unwrap();
    assert_eq!(status["psi4/energy"][&RecordStatus::Waiting], 2);

    let manager =
        SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tagds"]).await;
    manager.run_all(store.as_ref()).await;

    let status = datasets::dataset_status(store.as_ref(), dataset_id)
        .await
        .unwrap();
    assert_eq!(status["psi4/energy"][&RecordStatus::Complete], 2);
}

#[tokio::test]
async fn entries_flow_from_optimization_to_singlepoint_datasets() {
    let store = mem_store();

    // An optimization dataset, fully computed.
    let opt_ds = store
        .add_dataset(NewDataset {
            dataset_type: RecordType::Optimization,
            name: "opts".to_string(),
            description: String::new(),
            default_compute_tag: "tagds".to_string(),
            default_compute_priority: ComputePriority::Normal,
        })
        .await
        .unwrap();
    store
        .add_dataset_entries(
            opt_ds,
            &[DatasetEntry {
                name: "water".to_string(),
                comment: Some("seeded".to_string()),
                input: RecordInput::Optimization {
                    initial_molecule: MoleculeUpload::New(Box::new(water())),
                },
                attributes: serde_json::json!({ "origin": "opt-ds" }),
            }],
        )
        .await
        .unwrap();
    store
        .add_dataset_specifications(
            opt_ds,
            &[DatasetSpecificationEntry {
                name: "geometric".to_string(),
                specification: RecordSpecification::Optimization(opt_spec()),
            }],
        )
        .await
        .unwrap();
    datasets::submit_dataset(store.as_ref(), opt_ds, None, None)
        .await
        .unwrap();

    let manager = SyntheticManager::activate(
        store.as_ref(),
        "host1",
        &["psi4", "geometric"],
        &["tagds"],
    )
    .await;
    manager.run_all(store.as_ref()).await;

    // Seed a singlepoint dataset from the optimized geometries.
    let sp_ds = singlepoint_dataset(store.as_ref(), "from-opts").await;
    let meta = datasets::add_entries_from_optimization(store.as_ref(), sp_ds, opt_ds, "geometric")
        .await
        .unwrap();
    assert!(meta.success());
    assert_eq!(meta.n_inserted(), 1);

    let entries = store.get_dataset_entries(sp_ds).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].comment.as_deref(), Some("seeded"));
    assert_eq!(entries[0].attributes["origin"], "opt-ds");

    // The seeded entry points at the optimization's final molecule.
    let opt_record_id = store.get_dataset_records(opt_ds).await.unwrap()[0].record_id;
    let opt_detail = store.get_record_detail(opt_record_id).await.unwrap();
    let models::RecordDetail::Optimization {
        final_molecule_id, ..
    } = opt_detail
    else {
        panic!("expected optimization detail");
    };
    match &entries[0].input {
        RecordInput::Singlepoint {
            molecule: MoleculeUpload::Id(id),
        } => assert_eq!(Some(*id), final_molecule_id),
        other => panic!("unexpected entry input: {other:?}"),
    }
}

#[tokio::test]
async fn mismatched_entry_types_are_refused() {
    let store = mem_store();
    let dataset_id = singlepoint_dataset(store.as_ref(), "mismatch").await;

    let meta = store
        .add_dataset_entries(
            dataset_id,
            &[DatasetEntry {
                name: "bad".to_string(),
                comment: None,
                input: RecordInput::Optimization {
                    initial_molecule: MoleculeUpload::New(Box::new(water())),
                },
                attributes: serde_json::json!({}),
            }],
        )
        .await
        .unwrap();
    assert_eq!(meta.error_idx(), vec![0]);

    // Duplicate dataset names collide per type.
    let err = store
        .add_dataset(NewDataset {
            dataset_type: RecordType::Singlepoint,
            name: "mismatch".to_string(),
            description: String::new(),
            default_compute_tag: "t".to_string(),
            default_compute_priority: ComputePriority::Normal,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));
}
