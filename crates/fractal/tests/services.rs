//! End-to-end service execution against the in-memory store, with a
//! synthetic manager consuming the dependent tasks.

mod common;

use common::*;
use fractal::store::Store;
use models::services::*;
use models::{
    ComputePriority, Driver, Molecule, MoleculeUpload, RecordDetail, RecordInput,
    RecordSpecification, RecordStatus, ResultEnvelope,
};

fn torsiondrive_spec() -> RecordSpecification {
    RecordSpecification::Torsiondrive(TorsiondriveSpecificationInput {
        optimization_specification: opt_spec(),
        keywords: TorsiondriveKeywords {
            dihedrals: vec![[0, 1, 2, 3]],
            grid_spacing: vec![90],
            dihedral_ranges: None,
            energy_decrease_thresh: None,
            energy_upper_limit: None,
        },
    })
}

#[tokio::test]
async fn torsiondrive_converges_over_the_grid() {
    let store = mem_store();

    let (meta, ids) = store
        .add_records(
            &torsiondrive_spec(),
            &[RecordInput::Torsiondrive {
                initial_molecules: vec![MoleculeUpload::New(Box::new(hydrogen_peroxide()))],
            }],
            "tagT",
            ComputePriority::Low,
            None,
            true,
        )
        .await
        .unwrap();
    assert!(meta.success());
    let record_id = ids[0].unwrap();

    // Service records carry a service row, not a task.
    assert!(store.get_task_row(record_id).await.unwrap().is_none());
    assert!(store.get_service_row(record_id).await.unwrap().is_some());

    let manager =
        SyntheticManager::activate(store.as_ref(), "host1", &["psi4", "geometric"], &["*"]).await;

    let status = drive_service(store.as_ref(), &manager, record_id, 12).await;
    assert_eq!(status, RecordStatus::Complete);

    let detail = store.get_record_detail(record_id).await.unwrap();
    let RecordDetail::Torsiondrive {
        minimum_optimizations,
        final_energies,
        optimization_history,
        ..
    } = detail
    else {
        panic!("expected torsiondrive detail");
    };

    // One minimum per grid point: -90, 0, 90, 180.
    assert_eq!(minimum_optimizations.len(), 4);
    for key in ["[-90]", "[0]", "[90]", "[180]"] {
        assert!(minimum_optimizations.contains_key(key), "missing {key}");
    }
    assert_eq!(final_energies.len(), 4);
    assert!(optimization_history.values().flatten().count() >= 4);

    // The synthetic optimizer is happiest at 30 degrees, so grid point 0
    // holds the global minimum.
    let min_key = final_energies
        .iter()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(k, _)| k.clone())
        .unwrap();
    assert_eq!(min_key, "[0]");

    // Completion removed the service row; every minimum points at a
    // complete optimization.
    assert!(store.get_service_row(record_id).await.unwrap().is_none());
    for opt_id in minimum_optimizations.values() {
        let row = store.get_record_row(*opt_id).await.unwrap();
        assert_eq!(row.status, RecordStatus::Complete);
    }
}

#[tokio::test]
async fn identical_torsiondrive_submissions_deduplicate() {
    let store = mem_store();
    let input = RecordInput::Torsiondrive {
        initial_molecules: vec![MoleculeUpload::New(Box::new(hydrogen_peroxide()))],
    };

    let (_, first) = store
        .add_records(
            &torsiondrive_spec(),
            std::slice::from_ref(&input),
            "tagt",
            ComputePriority::Normal,
            None,
            true,
        )
        .await
        .unwrap();
    let (meta, second) = store
        .add_records(
            &torsiondrive_spec(),
            &[input],
            "tagt",
            ComputePriority::Normal,
            None,
            true,
        )
        .await
        .unwrap();

    assert_eq!(meta.n_existing(), 1);
    assert_eq!(first[0], second[0]);
}

#[tokio::test]
async fn gridoptimization_walks_the_scan_serially() {
    let store = mem_store();

    let spec = RecordSpecification::Gridoptimization(GridoptimizationSpecificationInput {
        optimization_specification: opt_spec(),
        keywords: GridoptimizationKeywords {
            scans: vec![ScanDimension {
                scan_type: ScanType::Distance,
                indices: vec![0, 1],
                steps: vec![-0.1, 0.1],
                step_type: StepType::Relative,
            }],
            preoptimization: true,
        },
    });

    let (meta, ids) = store
        .add_records(
            &spec,
            &[RecordInput::Gridoptimization {
                initial_molecule: MoleculeUpload::New(Box::new(water())),
            }],
            "taggo",
            ComputePriority::Normal,
            None,
            true,
        )
        .await
        .unwrap();
    assert!(meta.success());
    let record_id = ids[0].unwrap();

    let manager =
        SyntheticManager::activate(store.as_ref(), "host1", &["psi4", "geometric"], &["*"]).await;
    let status = drive_service(store.as_ref(), &manager, record_id, 16).await;
    assert_eq!(status, RecordStatus::Complete);

    let detail = store.get_record_detail(record_id).await.unwrap();
    let RecordDetail::Gridoptimization {
        starting_molecule_id,
        grid_optimizations,
        ..
    } = detail
    else {
        panic!("expected gridoptimization detail");
    };

    // Preoptimization plus both scan points, evaluated one at a time.
    assert!(starting_molecule_id.is_some());
    assert_eq!(grid_optimizations.len(), 3);
    assert!(grid_optimizations.contains_key("preoptimization"));
    assert!(grid_optimizations.contains_key("[0]"));
    assert!(grid_optimizations.contains_key("[1]"));
}

#[tokio::test]
async fn manybody_expands_over_fragment_subsets() {
    let store = mem_store();

    let spec = RecordSpecification::Manybody(ManybodySpecificationInput {
        qc_specification: qc_spec("psi4", Driver::Energy),
        keywords: ManybodyKeywords {
            max_nbody: None,
            bsse_correction: BsseCorrection::Cp,
        },
    });

    let (meta, ids) = store
        .add_records(
            &spec,
            &[RecordInput::Manybody {
                initial_molecule: MoleculeUpload::New(Box::new(helium_dimer())),
            }],
            "tagmb",
            ComputePriority::Normal,
            None,
            true,
        )
        .await
        .unwrap();
    assert!(meta.success());
    let record_id = ids[0].unwrap();

    let manager =
        SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["*"]).await;
    let status = drive_service(store.as_ref(), &manager, record_id, 8).await;
    assert_eq!(status, RecordStatus::Complete);

    let detail = store.get_record_detail(record_id).await.unwrap();
    let RecordDetail::Manybody {
        clusters,
        total_energy,
        interaction_energy,
        ..
    } = detail
    else {
        panic!("expected manybody detail");
    };

    // Two monomers plus the dimer.
    assert_eq!(clusters.len(), 3);
    assert!(clusters.iter().all(|c| c.energy.is_some()));
    assert!(clusters.iter().all(|c| c.basis == vec![0, 1]));

    // At full order the expansion telescopes to the supermolecular energy.
    let dimer =
        Molecule::from_symbols_geometry(&["He", "He"], &[0.0, 0.0, 0.0, 0.0, 0.0, 5.6]);
    let mono_0 = Molecule::from_symbols_geometry(&["He"], &[0.0, 0.0, 0.0]);
    let mono_1 = Molecule::from_symbols_geometry(&["He"], &[0.0, 0.0, 5.6]);

    let expected_total = synthetic_sp_energy(&dimer);
    let expected_interaction =
        expected_total - synthetic_sp_energy(&mono_0) - synthetic_sp_energy(&mono_1);
    assert!((total_energy.unwrap() - expected_total).abs() < 1e-10);
    assert!((interaction_energy.unwrap() - expected_interaction).abs() < 1e-10);
}

#[tokio::test]
async fn reaction_sums_component_energies() {
    let store = mem_store();

    let spec = RecordSpecification::Reaction(ReactionSpecificationInput {
        qc_specification: Some(qc_spec("psi4", Driver::Energy)),
        optimization_specification: None,
    });

    let (meta, ids) = store
        .add_records(
            &spec,
            &[RecordInput::Reaction {
                stoichiometry: vec![
                    ReactionComponentInput {
                        coefficient: -1.0,
                        molecule: MoleculeUpload::New(Box::new(water())),
                    },
                    ReactionComponentInput {
                        coefficient: 1.0,
                        molecule: MoleculeUpload::New(Box::new(hydrogen_peroxide())),
                    },
                ],
            }],
            "tagrxn",
            ComputePriority::Normal,
            None,
            true,
        )
        .await
        .unwrap();
    assert!(meta.success());
    let record_id = ids[0].unwrap();

    let manager =
        SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["*"]).await;
    let status = drive_service(store.as_ref(), &manager, record_id, 8).await;
    assert_eq!(status, RecordStatus::Complete);

    let detail = store.get_record_detail(record_id).await.unwrap();
    let RecordDetail::Reaction {
        components,
        total_energy,
        ..
    } = detail
    else {
        panic!("expected reaction detail");
    };

    let expected =
        -synthetic_sp_energy(&water()) + synthetic_sp_energy(&hydrogen_peroxide());
    assert!((total_energy.unwrap() - expected).abs() < 1e-10);
    assert!(components.iter().all(|c| c.singlepoint_id.is_some()));
    assert!(components.iter().all(|c| c.optimization_id.is_none()));
}

#[tokio::test]
async fn neb_finds_and_optimizes_the_transition_state() {
    let store = mem_store();

    // Three images with monotone geometry scaling: the middle one gets the
    // highest synthetic energy.
    let image = |shift: f64| {
        let mut m = water();
        for g in &mut m.geometry {
            *g += shift;
        }
        m
    };
    let chain = vec![image(0.0), image(5.0), image(1.0)];
    assert!(synthetic_sp_energy(&chain[1]) > synthetic_sp_energy(&chain[0]));
    assert!(synthetic_sp_energy(&chain[1]) > synthetic_sp_energy(&chain[2]));

    let spec = RecordSpecification::Neb(NebSpecificationInput {
        qc_specification: qc_spec("psi4", Driver::Gradient),
        optimization_specification: Some(opt_spec()),
        keywords: NebKeywords {
            spring_constant: 1.0,
            optimize_endpoints: true,
            optimize_ts: true,
        },
    });

    let (meta, ids) = store
        .add_records(
            &spec,
            &[RecordInput::Neb {
                chain: chain
                    .into_iter()
                    .map(|m| MoleculeUpload::New(Box::new(m)))
                    .collect(),
            }],
            "tagneb",
            ComputePriority::High,
            None,
            true,
        )
        .await
        .unwrap();
    assert!(meta.success());
    let record_id = ids[0].unwrap();

    let manager =
        SyntheticManager::activate(store.as_ref(), "host1", &["psi4", "geometric"], &["*"]).await;
    let status = drive_service(store.as_ref(), &manager, record_id, 12).await;
    assert_eq!(status, RecordStatus::Complete);

    let detail = store.get_record_detail(record_id).await.unwrap();
    let RecordDetail::Neb {
        image_singlepoint_ids,
        image_energies,
        ts_optimization_id,
        endpoint_optimization_ids,
        ..
    } = detail
    else {
        panic!("expected neb detail");
    };

    assert_eq!(image_singlepoint_ids.len(), 3);
    assert_eq!(image_energies.len(), 3);
    assert!(image_energies[1] > image_energies[0]);
    assert!(image_energies[1] > image_energies[2]);
    assert!(ts_optimization_id.is_some());
    assert_eq!(endpoint_optimization_ids.len(), 2);
}

#[tokio::test]
async fn failed_dependency_errors_the_service() {
    let store = mem_store();

    let (_, ids) = store
        .add_records(
            &torsiondrive_spec(),
            &[RecordInput::Torsiondrive {
                initial_molecules: vec![MoleculeUpload::New(Box::new(hydrogen_peroxide()))],
            }],
            "tagt",
            ComputePriority::Normal,
            None,
            true,
        )
        .await
        .unwrap();
    let record_id = ids[0].unwrap();

    let manager =
        SyntheticManager::activate(store.as_ref(), "host1", &["psi4", "geometric"], &["*"]).await;

    // Start the service, then fail its first dependency.
    tick_services(store.as_ref()).await;
    let tasks = manager.claim(store.as_ref(), 10).await;
    assert!(!tasks.is_empty());
    let results = tasks
        .iter()
        .map(|t| {
            (
                t.task_id,
                ResultEnvelope::failure("random_error", "engine crashed"),
            )
        })
        .collect();
    store
        .return_results(&manager.name, results, &Default::default())
        .await
        .unwrap();

    tick_services(store.as_ref()).await;
    let record = store.get_record_row(record_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Error);

    // The service row survives for a later revert.
    assert!(store.get_service_row(record_id).await.unwrap().is_some());
}

#[tokio::test]
async fn service_invariant_next_iteration_progresses() {
    let store = mem_store();

    let (_, ids) = store
        .add_records(
            &torsiondrive_spec(),
            &[RecordInput::Torsiondrive {
                initial_molecules: vec![MoleculeUpload::New(Box::new(hydrogen_peroxide()))],
            }],
            "tagt",
            ComputePriority::Normal,
            None,
            true,
        )
        .await
        .unwrap();
    let record_id = ids[0].unwrap();
    let manager =
        SyntheticManager::activate(store.as_ref(), "host1", &["psi4", "geometric"], &["*"]).await;

    // With all dependencies complete, every iteration either adds new
    // dependencies or finishes the service.
    tick_services(store.as_ref()).await;
    for _ in 0..12 {
        manager.run_all(store.as_ref()).await;
        let before: Vec<_> = store
            .get_service_dependencies(record_id)
            .await
            .unwrap()
            .iter()
            .map(|d| d.record_id)
            .collect();

        let outcome =
            fractal::services::iterate_service(store.as_ref(), record_id).await;
        let status = store.get_record_row(record_id).await.unwrap().status;
        if status == RecordStatus::Complete {
            return;
        }
        assert_eq!(status, RecordStatus::Running);
        let after: Vec<_> = store
            .get_service_dependencies(record_id)
            .await
            .unwrap()
            .iter()
            .map(|d| d.record_id)
            .collect();
        assert!(outcome.is_ok());
        assert_ne!(before, after, "iteration made no progress");
    }
    panic!("torsion drive did not converge");
}
