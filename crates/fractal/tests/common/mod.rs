//! Shared helpers for the integration suites: canned molecules and
//! specifications, plus a synthetic manager that claims tasks and fabricates
//! deterministic engine results so full workflows run without real QC
//! engines.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use fractal::config::AutoResetPolicy;
use fractal::services::iterate_service;
use fractal::store::Store;
use models::{
    ClaimedTask, ComputePriority, Driver, Id, KeywordsUpload, ManagerActivation, ManagerName,
    Molecule, MoleculeUpload, OptimizationSpecificationInput, Provenance, QcSpecificationInput,
    RecordInput, RecordSpecification, RecordStatus, ResultEnvelope, SuccessPayload, TaskResult,
    TrajectoryStep,
};

pub fn water() -> Molecule {
    Molecule::from_symbols_geometry(
        &["O", "H", "H"],
        &[
            0.0, 0.0, -0.129, //
            0.0, -1.494, 1.027, //
            0.0, 1.494, 1.027,
        ],
    )
}

pub fn hydrogen_peroxide() -> Molecule {
    // H-O-O-H with a twisted H(0)-O(1)-O(2)-H(3) dihedral.
    Molecule::from_symbols_geometry(
        &["H", "O", "O", "H"],
        &[
            1.7, 0.3, 1.5, //
            0.0, 0.0, 1.37, //
            0.0, 0.0, -1.37, //
            -1.2, 1.3, -1.5,
        ],
    )
}

/// Two separated helium atoms as two fragments.
pub fn helium_dimer() -> Molecule {
    let mut molecule = Molecule::from_symbols_geometry(
        &["He", "He"],
        &[0.0, 0.0, 0.0, 0.0, 0.0, 5.6],
    );
    molecule.fragments = vec![vec![0], vec![1]];
    molecule
}

pub fn qc_spec(program: &str, driver: Driver) -> QcSpecificationInput {
    QcSpecificationInput {
        program: program.to_string(),
        driver,
        method: "b3lyp".to_string(),
        basis: Some("6-31g".to_string()),
        keywords: KeywordsUpload::default(),
        protocols: serde_json::json!({}),
    }
}

pub fn opt_spec() -> OptimizationSpecificationInput {
    OptimizationSpecificationInput {
        program: "geometric".to_string(),
        qc_specification: qc_spec("psi4", Driver::Deferred),
        keywords: serde_json::json!({ "maxiter": 200 }),
        protocols: serde_json::json!({}),
    }
}

pub fn singlepoint_submission(
    program: &str,
    molecule: Molecule,
) -> (RecordSpecification, Vec<RecordInput>) {
    (
        RecordSpecification::Singlepoint(qc_spec(program, Driver::Energy)),
        vec![RecordInput::Singlepoint {
            molecule: MoleculeUpload::New(Box::new(molecule)),
        }],
    )
}

/// Deterministic single-point energy from the geometry.
pub fn synthetic_sp_energy(molecule: &Molecule) -> f64 {
    let weighted: f64 = molecule
        .geometry
        .iter()
        .enumerate()
        .map(|(i, g)| g * 0.001 * (i as f64 + 1.0))
        .sum();
    -(molecule.n_atoms() as f64) + weighted
}

/// Deterministic optimization energy: minimized at a dihedral of 30 degrees
/// when constraints are present, slightly below the single-point energy
/// otherwise.
pub fn synthetic_opt_energy(input: &Value) -> f64 {
    let constraints = input
        .get("keywords")
        .and_then(|k| k.get("constraints"))
        .and_then(|c| c.get("set"))
        .and_then(|s| s.as_array());

    match constraints {
        Some(set) if !set.is_empty() => {
            let penalty: f64 = set
                .iter()
                .filter_map(|c| c.get("value").and_then(|v| v.as_f64()))
                .map(|v| {
                    let mut d = (v - 30.0) % 360.0;
                    if d > 180.0 {
                        d -= 360.0;
                    } else if d < -180.0 {
                        d += 360.0;
                    }
                    d.abs() / 100.0
                })
                .sum();
            -150.0 + penalty
        }
        _ => {
            let molecule: Molecule = serde_json::from_value(
                input
                    .get("initial_molecule")
                    .cloned()
                    .expect("optimization input has a molecule"),
            )
            .expect("molecule deserializes");
            synthetic_sp_energy(&molecule) - 0.05
        }
    }
}

pub struct SyntheticManager {
    pub name: String,
    pub programs: BTreeMap<String, Option<String>>,
    pub tags: Vec<String>,
}

impl SyntheticManager {
    pub async fn activate(
        store: &dyn Store,
        host: &str,
        programs: &[&str],
        tags: &[&str],
    ) -> Self {
        let activation = ManagerActivation {
            name: ManagerName {
                cluster: "test_cluster".to_string(),
                hostname: host.to_string(),
                uuid: format!("{host}-0000-1111"),
            },
            manager_version: "v2.0".to_string(),
            username: Some("bill".to_string()),
            programs: programs
                .iter()
                .map(|p| (p.to_string(), None))
                .collect(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        store.activate_manager(&activation).await.unwrap();
        Self {
            name: activation.name.fullname(),
            programs: activation.programs.clone(),
            tags: activation.tags.clone(),
        }
    }

    pub async fn claim(&self, store: &dyn Store, limit: usize) -> Vec<ClaimedTask> {
        store
            .claim_tasks(&self.name, &self.programs, &self.tags, limit)
            .await
            .unwrap()
    }

    /// Fabricate a success envelope for one claimed task.
    pub fn execute(&self, task: &ClaimedTask) -> ResultEnvelope {
        let input = task.spec.args[0].clone();
        let result = match task.spec.function.as_str() {
            "qcengine.compute" => {
                let molecule: Molecule = serde_json::from_value(
                    input.get("molecule").cloned().expect("singlepoint input"),
                )
                .expect("molecule deserializes");
                TaskResult::Singlepoint {
                    return_result: serde_json::json!(synthetic_sp_energy(&molecule)),
                    properties: serde_json::json!({ "calcinfo_natom": molecule.n_atoms() }),
                }
            }
            "qcengine.compute_procedure" => {
                let energy = synthetic_opt_energy(&input);
                let molecule: Molecule = serde_json::from_value(
                    input
                        .get("initial_molecule")
                        .cloned()
                        .expect("optimization input"),
                )
                .expect("molecule deserializes");
                TaskResult::Optimization {
                    final_molecule: molecule.clone(),
                    energies: vec![energy + 0.02, energy],
                    trajectory: vec![
                        TrajectoryStep {
                            molecule: molecule.clone(),
                            energy: energy + 0.02,
                            properties: None,
                        },
                        TrajectoryStep {
                            molecule,
                            energy,
                            properties: None,
                        },
                    ],
                }
            }
            other => panic!("unknown task function {other}"),
        };

        ResultEnvelope::Success(Box::new(SuccessPayload {
            provenance: Provenance {
                creator: "synthetic".to_string(),
                version: Some("v1".to_string()),
                routine: None,
            },
            result,
            stdout: Some(models::CompressedBlob::plain("synthetic engine output")),
            stderr: None,
            wavefunction: None,
            native_files: BTreeMap::new(),
        }))
    }

    /// Claim and successfully complete everything this manager can see.
    /// Returns the number of tasks processed.
    pub async fn run_all(&self, store: &dyn Store) -> usize {
        let mut processed = 0;
        loop {
            let tasks = self.claim(store, 10).await;
            if tasks.is_empty() {
                return processed;
            }
            let results: Vec<(Id, ResultEnvelope)> = tasks
                .iter()
                .map(|t| (t.task_id, self.execute(t)))
                .collect();
            processed += results.len();
            store
                .return_results(&self.name, results, &AutoResetPolicy::default())
                .await
                .unwrap();
        }
    }
}

/// One orchestrator tick: iterate every due service.
pub async fn tick_services(store: &dyn Store) {
    for record_id in store.service_queue(100).await.unwrap() {
        let _ = iterate_service(store, record_id).await.unwrap();
    }
}

/// Alternate service ticks and manager work until the record settles.
pub async fn drive_service(
    store: &dyn Store,
    manager: &SyntheticManager,
    record_id: Id,
    max_rounds: usize,
) -> RecordStatus {
    for _ in 0..max_rounds {
        tick_services(store).await;
        manager.run_all(store).await;

        let status = store.get_record_row(record_id).await.unwrap().status;
        if !matches!(status, RecordStatus::Waiting | RecordStatus::Running) {
            return status;
        }
    }
    store.get_record_row(record_id).await.unwrap().status
}

pub fn mem_store() -> Arc<fractal::MemStore> {
    Arc::new(fractal::MemStore::new())
}
