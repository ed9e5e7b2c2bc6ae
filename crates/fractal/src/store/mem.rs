//! In-memory [`Store`] implementation.
//!
//! The whole state lives behind one async mutex, which trivially satisfies
//! the transactional-isolation contract: every operation observes and
//! mutates a consistent snapshot. This backend drives the test suites and
//! embedded deployments; the Postgres backend realizes the same semantics
//! with row-level locking.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;

use models::services::*;
use models::{
    ClaimedTask, CompressedBlob, ComputeHistoryEntry, ComputePriority, Id, InsertMetadata,
    KeywordSet, KeywordsUpload, ManagerActivation, ManagerResources, ManagerStatus, Molecule,
    MoleculeIdentifiers, MoleculeUpload, OptimizationSpecification,
    OptimizationSpecificationInput, OutputType, ProjectionSpec, QcSpecification,
    QcSpecificationInput, QueryMetadata, RecordComment, RecordData, RecordDetail, RecordInput,
    RecordQueryFilters, RecordSpecification, RecordStatus, RecordType, Result, ResultEnvelope,
    ReturnOutcome, ServerError, ServiceData, ServiceDependencyData, TaskData, TaskResult,
    TaskSpec, UpdateMetadata,
};

use crate::config::AutoResetPolicy;
use crate::status::{plan_status_change, StatusOperation, StatusPlan, TaskEffect};
use crate::tasks::{programs_satisfied, select_for_claim};

use super::*;

#[derive(Default)]
struct State {
    next_id: i64,

    molecules: BTreeMap<Id, MoleculeRow>,
    molecule_hash: BTreeMap<String, Id>,
    keywords: BTreeMap<Id, KeywordSetRow>,
    keywords_hash: BTreeMap<String, Id>,

    qc_specs: BTreeMap<Id, QcSpecification>,
    qc_spec_hash: BTreeMap<String, Id>,
    opt_specs: BTreeMap<Id, OptimizationSpecification>,
    opt_spec_hash: BTreeMap<String, Id>,
    td_specs: BTreeMap<Id, TorsiondriveSpecification>,
    td_spec_hash: BTreeMap<String, Id>,
    go_specs: BTreeMap<Id, GridoptimizationSpecification>,
    go_spec_hash: BTreeMap<String, Id>,
    mb_specs: BTreeMap<Id, ManybodySpecification>,
    mb_spec_hash: BTreeMap<String, Id>,
    rxn_specs: BTreeMap<Id, ReactionSpecification>,
    rxn_spec_hash: BTreeMap<String, Id>,
    neb_specs: BTreeMap<Id, NebSpecification>,
    neb_spec_hash: BTreeMap<String, Id>,

    records: BTreeMap<Id, RecordRow>,
    details: BTreeMap<Id, RecordDetail>,
    /// Dedup index: (record_type, spec id, input key) -> record id.
    record_keys: BTreeMap<String, Id>,
    tasks: BTreeMap<Id, TaskRow>,
    task_by_record: BTreeMap<Id, Id>,
    services: BTreeMap<Id, ServiceRow>,
    service_by_record: BTreeMap<Id, Id>,
    service_deps: BTreeMap<Id, Vec<ServiceDependencyRow>>,
    history: BTreeMap<Id, Vec<ComputeHistoryEntry>>,
    backups: BTreeMap<Id, Vec<InfoBackupRow>>,
    comments: BTreeMap<Id, Vec<RecordComment>>,
    native_files: BTreeMap<Id, BTreeMap<String, CompressedBlob>>,
    wavefunctions: BTreeMap<Id, CompressedBlob>,

    managers: BTreeMap<Id, ManagerRow>,
    manager_by_name: BTreeMap<String, Id>,

    internal_jobs: BTreeMap<Id, InternalJobRow>,

    datasets: BTreeMap<Id, DatasetRow>,
    dataset_entries: BTreeMap<Id, Vec<DatasetEntry>>,
    dataset_specs: BTreeMap<Id, Vec<DatasetSpecificationEntry>>,
    dataset_records: BTreeMap<Id, Vec<DatasetRecordRow>>,
}

pub struct MemStore {
    state: Mutex<State>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn reject(reason: &str) -> ReturnOutcome {
    ReturnOutcome::Rejected {
        reason: reason.to_string(),
    }
}

impl State {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        Id(self.next_id)
    }

    // -- content helpers --------------------------------------------------

    fn add_molecule(&mut self, molecule: &Molecule) -> Result<(bool, Id)> {
        molecule.validate()?;
        let hash = molecule.structural_hash();
        if let Some(&id) = self.molecule_hash.get(&hash) {
            return Ok((false, id));
        }
        let id = self.next_id();
        self.molecule_hash.insert(hash.clone(), id);
        self.molecules.insert(
            id,
            MoleculeRow {
                id,
                hash,
                molecule: molecule.clone(),
            },
        );
        Ok((true, id))
    }

    fn resolve_molecule_upload(&mut self, upload: &MoleculeUpload) -> Result<(bool, Id)> {
        match upload {
            MoleculeUpload::Id(id) => {
                if self.molecules.contains_key(id) {
                    Ok((false, *id))
                } else {
                    Err(ServerError::missing(format!("molecule {id} does not exist")))
                }
            }
            MoleculeUpload::New(molecule) => self.add_molecule(molecule),
        }
    }

    fn add_keyword_set(&mut self, keywords: &KeywordSet) -> (bool, Id) {
        let normalized = keywords.normalized();
        let hash = normalized.canonical_hash();
        if let Some(&id) = self.keywords_hash.get(&hash) {
            return (false, id);
        }
        let id = self.next_id();
        self.keywords_hash.insert(hash.clone(), id);
        self.keywords.insert(
            id,
            KeywordSetRow {
                id,
                hash,
                keywords: normalized,
            },
        );
        (true, id)
    }

    fn resolve_keywords_upload(&mut self, upload: &KeywordsUpload) -> Result<Id> {
        match upload {
            KeywordsUpload::Id(id) => {
                if self.keywords.contains_key(id) {
                    Ok(*id)
                } else {
                    Err(ServerError::missing(format!(
                        "keyword set {id} does not exist"
                    )))
                }
            }
            KeywordsUpload::New(kws) => Ok(self.add_keyword_set(kws).1),
        }
    }

    fn add_qc_spec(&mut self, input: &QcSpecificationInput) -> Result<(bool, Id)> {
        input.validate()?;
        let keywords_id = self.resolve_keywords_upload(&input.keywords)?;

        let program = models::normalize_name(&input.program);
        let method = models::normalize_name(&input.method);
        let basis = models::normalize_basis(input.basis.as_deref());

        let hash = QcSpecification::tuple_hash(
            &program,
            input.driver,
            &method,
            basis.as_deref(),
            keywords_id,
            &input.protocols,
        );
        if let Some(&id) = self.qc_spec_hash.get(&hash) {
            return Ok((false, id));
        }
        let id = self.next_id();
        self.qc_spec_hash.insert(hash, id);
        self.qc_specs.insert(
            id,
            QcSpecification {
                id,
                program,
                driver: input.driver,
                method,
                basis,
                keywords_id,
                protocols: input.protocols.clone(),
            },
        );
        Ok((true, id))
    }

    fn add_opt_spec(&mut self, input: &OptimizationSpecificationInput) -> Result<(bool, Id)> {
        input.validate()?;
        let (_, qc_id) = self.add_qc_spec(&input.qc_specification)?;
        let program = models::normalize_name(&input.program);

        let hash =
            OptimizationSpecification::tuple_hash(&program, qc_id, &input.keywords, &input.protocols);
        if let Some(&id) = self.opt_spec_hash.get(&hash) {
            return Ok((false, id));
        }
        let id = self.next_id();
        self.opt_spec_hash.insert(hash, id);
        self.opt_specs.insert(
            id,
            OptimizationSpecification {
                id,
                program,
                qc_specification_id: qc_id,
                keywords: input.keywords.clone(),
                protocols: input.protocols.clone(),
            },
        );
        Ok((true, id))
    }

    fn add_record_spec(&mut self, spec: &RecordSpecification) -> Result<Id> {
        match spec {
            RecordSpecification::Singlepoint(s) => Ok(self.add_qc_spec(s)?.1),
            RecordSpecification::Optimization(s) => Ok(self.add_opt_spec(s)?.1),
            RecordSpecification::Torsiondrive(s) => {
                s.keywords.validate()?;
                let (_, opt_id) = self.add_opt_spec(&s.optimization_specification)?;
                let hash = TorsiondriveSpecification::tuple_hash(opt_id, &s.keywords);
                if let Some(&id) = self.td_spec_hash.get(&hash) {
                    return Ok(id);
                }
                let id = self.next_id();
                self.td_spec_hash.insert(hash, id);
                self.td_specs.insert(
                    id,
                    TorsiondriveSpecification {
                        id,
                        optimization_specification_id: opt_id,
                        keywords: s.keywords.clone(),
                    },
                );
                Ok(id)
            }
            RecordSpecification::Gridoptimization(s) => {
                s.keywords.validate()?;
                let (_, opt_id) = self.add_opt_spec(&s.optimization_specification)?;
                let hash = GridoptimizationSpecification::tuple_hash(opt_id, &s.keywords);
                if let Some(&id) = self.go_spec_hash.get(&hash) {
                    return Ok(id);
                }
                let id = self.next_id();
                self.go_spec_hash.insert(hash, id);
                self.go_specs.insert(
                    id,
                    GridoptimizationSpecification {
                        id,
                        optimization_specification_id: opt_id,
                        keywords: s.keywords.clone(),
                    },
                );
                Ok(id)
            }
            RecordSpecification::Manybody(s) => {
                let (_, qc_id) = self.add_qc_spec(&s.qc_specification)?;
                let hash = ManybodySpecification::tuple_hash(qc_id, &s.keywords);
                if let Some(&id) = self.mb_spec_hash.get(&hash) {
                    return Ok(id);
                }
                let id = self.next_id();
                self.mb_spec_hash.insert(hash, id);
                self.mb_specs.insert(
                    id,
                    ManybodySpecification {
                        id,
                        qc_specification_id: qc_id,
                        keywords: s.keywords.clone(),
                    },
                );
                Ok(id)
            }
            RecordSpecification::Reaction(s) => {
                s.validate()?;
                let qc_id = match &s.qc_specification {
                    Some(qc) => Some(self.add_qc_spec(qc)?.1),
                    None => None,
                };
                let opt_id = match &s.optimization_specification {
                    Some(opt) => Some(self.add_opt_spec(opt)?.1),
                    None => None,
                };
                let hash = ReactionSpecification::tuple_hash(qc_id, opt_id);
                if let Some(&id) = self.rxn_spec_hash.get(&hash) {
                    return Ok(id);
                }
                let id = self.next_id();
                self.rxn_spec_hash.insert(hash, id);
                self.rxn_specs.insert(
                    id,
                    ReactionSpecification {
                        id,
                        qc_specification_id: qc_id,
                        optimization_specification_id: opt_id,
                    },
                );
                Ok(id)
            }
            RecordSpecification::Neb(s) => {
                s.validate()?;
                let (_, qc_id) = self.add_qc_spec(&s.qc_specification)?;
                let opt_id = match &s.optimization_specification {
                    Some(opt) => Some(self.add_opt_spec(opt)?.1),
                    None => None,
                };
                let hash = NebSpecification::tuple_hash(qc_id, opt_id, &s.keywords);
                if let Some(&id) = self.neb_spec_hash.get(&hash) {
                    return Ok(id);
                }
                let id = self.next_id();
                self.neb_spec_hash.insert(hash, id);
                self.neb_specs.insert(
                    id,
                    NebSpecification {
                        id,
                        qc_specification_id: qc_id,
                        optimization_specification_id: opt_id,
                        keywords: s.keywords.clone(),
                    },
                );
                Ok(id)
            }
        }
    }

    // -- record creation --------------------------------------------------

    /// Build the engine payload and required programs for a leaf record.
    fn build_task_spec(
        &self,
        detail: &RecordDetail,
    ) -> Result<(TaskSpec, BTreeMap<String, Option<String>>)> {
        match detail {
            RecordDetail::Singlepoint {
                specification_id,
                molecule_id,
                ..
            } => {
                let spec = self
                    .qc_specs
                    .get(specification_id)
                    .ok_or_else(|| ServerError::missing("qc specification"))?;
                let keywords = self
                    .keywords
                    .get(&spec.keywords_id)
                    .map(|k| k.keywords.values.clone())
                    .unwrap_or_default();
                let molecule = self
                    .molecules
                    .get(molecule_id)
                    .ok_or_else(|| ServerError::missing("molecule"))?;
                Ok(singlepoint_task_spec(spec, &keywords, &molecule.molecule))
            }
            RecordDetail::Optimization {
                specification_id,
                initial_molecule_id,
                ..
            } => {
                let spec = self
                    .opt_specs
                    .get(specification_id)
                    .ok_or_else(|| ServerError::missing("optimization specification"))?;
                let qc_spec = self
                    .qc_specs
                    .get(&spec.qc_specification_id)
                    .ok_or_else(|| ServerError::missing("qc specification"))?;
                let keywords = self
                    .keywords
                    .get(&qc_spec.keywords_id)
                    .map(|k| k.keywords.values.clone())
                    .unwrap_or_default();
                let molecule = self
                    .molecules
                    .get(initial_molecule_id)
                    .ok_or_else(|| ServerError::missing("molecule"))?;
                Ok(optimization_task_spec(
                    spec,
                    qc_spec,
                    &keywords,
                    &molecule.molecule,
                ))
            }
            other => Err(ServerError::Internal(format!(
                "{} records do not have tasks",
                other.record_type()
            ))),
        }
    }

    fn create_task_row(
        &mut self,
        record_id: Id,
        compute_tag: &str,
        compute_priority: ComputePriority,
        available: bool,
    ) -> Result<()> {
        let detail = self
            .details
            .get(&record_id)
            .ok_or_else(|| ServerError::missing("record detail"))?
            .clone();
        let (spec, required_programs) = self.build_task_spec(&detail)?;
        let id = self.next_id();
        self.tasks.insert(
            id,
            TaskRow {
                id,
                record_id,
                spec,
                required_programs,
                compute_tag: compute_tag.to_string(),
                compute_priority,
                available,
                created_on: Utc::now(),
            },
        );
        self.task_by_record.insert(record_id, id);
        Ok(())
    }

    fn delete_task_row(&mut self, record_id: Id) {
        if let Some(task_id) = self.task_by_record.remove(&record_id) {
            self.tasks.remove(&task_id);
        }
    }

    /// Create one record with its detail and task/service row.
    fn create_record(
        &mut self,
        detail: RecordDetail,
        dedup_key: String,
        compute_tag: &str,
        compute_priority: ComputePriority,
        creator_user: Option<&str>,
        find_existing: bool,
    ) -> Result<Id> {
        let record_type = detail.record_type();
        let now = Utc::now();
        let id = self.next_id();

        self.records.insert(
            id,
            RecordRow {
                id,
                record_type,
                status: RecordStatus::Waiting,
                manager_name: None,
                created_on: now,
                modified_on: now,
                creator_user: creator_user.map(String::from),
            },
        );
        self.details.insert(id, detail);
        self.record_keys.insert(dedup_key, id);

        if record_type.is_service() {
            let service_id = self.next_id();
            self.services.insert(
                service_id,
                ServiceRow {
                    id: service_id,
                    record_id: id,
                    service_state: json!({}),
                    compute_tag: compute_tag.to_string(),
                    compute_priority,
                    find_existing,
                    created_on: now,
                },
            );
            self.service_by_record.insert(id, service_id);
        } else {
            self.create_task_row(id, compute_tag, compute_priority, true)?;
        }

        Ok(id)
    }

    /// Insert a finished leaf record (used for optimization trajectories):
    /// complete, with one complete history entry, never via the task queue.
    fn insert_complete_singlepoint(
        &mut self,
        specification_id: Id,
        molecule_id: Id,
        return_result: Value,
        properties: Option<Value>,
        manager_name: &str,
    ) -> Id {
        let now = Utc::now();
        let id = self.next_id();
        self.records.insert(
            id,
            RecordRow {
                id,
                record_type: RecordType::Singlepoint,
                status: RecordStatus::Complete,
                manager_name: Some(manager_name.to_string()),
                created_on: now,
                modified_on: now,
                creator_user: None,
            },
        );
        self.details.insert(
            id,
            RecordDetail::Singlepoint {
                specification_id,
                molecule_id,
                return_result: Some(return_result),
                properties,
            },
        );
        let hist_id = self.next_id();
        self.history.entry(id).or_default().push(ComputeHistoryEntry {
            id: hist_id,
            record_id: id,
            status: RecordStatus::Complete,
            manager_name: Some(manager_name.to_string()),
            modified_on: now,
            provenance: None,
            outputs: BTreeMap::new(),
        });
        id
    }

    fn dedup_key(record_type: RecordType, spec_id: Id, input_key: &str) -> String {
        record_dedup_key(record_type, spec_id, input_key)
    }

    /// Resolve one submission input into (dedup key, detail).
    fn resolve_record_input(
        &mut self,
        spec_id: Id,
        input: &RecordInput,
    ) -> Result<(String, RecordDetail)> {
        match input {
            RecordInput::Singlepoint { molecule } => {
                let (_, mol_id) = self.resolve_molecule_upload(molecule)?;
                Ok((
                    Self::dedup_key(RecordType::Singlepoint, spec_id, &mol_id.to_string()),
                    RecordDetail::Singlepoint {
                        specification_id: spec_id,
                        molecule_id: mol_id,
                        return_result: None,
                        properties: None,
                    },
                ))
            }
            RecordInput::Optimization { initial_molecule } => {
                let (_, mol_id) = self.resolve_molecule_upload(initial_molecule)?;
                Ok((
                    Self::dedup_key(RecordType::Optimization, spec_id, &mol_id.to_string()),
                    RecordDetail::Optimization {
                        specification_id: spec_id,
                        initial_molecule_id: mol_id,
                        final_molecule_id: None,
                        energies: Vec::new(),
                        trajectory_ids: Vec::new(),
                    },
                ))
            }
            RecordInput::Torsiondrive { initial_molecules } => {
                if initial_molecules.is_empty() {
                    return Err(ServerError::InvalidPayload(
                        "torsiondrive requires at least one initial molecule".to_string(),
                    ));
                }
                let mut ids = Vec::new();
                for upload in initial_molecules {
                    ids.push(self.resolve_molecule_upload(upload)?.1);
                }
                // Identity is the set of initial molecules.
                let mut key_ids: Vec<Id> = ids.clone();
                key_ids.sort();
                key_ids.dedup();
                let key = key_ids
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                Ok((
                    Self::dedup_key(RecordType::Torsiondrive, spec_id, &key),
                    RecordDetail::Torsiondrive {
                        specification_id: spec_id,
                        initial_molecule_ids: key_ids,
                        optimization_history: BTreeMap::new(),
                        minimum_optimizations: BTreeMap::new(),
                        final_energies: BTreeMap::new(),
                    },
                ))
            }
            RecordInput::Gridoptimization { initial_molecule } => {
                let (_, mol_id) = self.resolve_molecule_upload(initial_molecule)?;
                Ok((
                    Self::dedup_key(RecordType::Gridoptimization, spec_id, &mol_id.to_string()),
                    RecordDetail::Gridoptimization {
                        specification_id: spec_id,
                        initial_molecule_id: mol_id,
                        starting_molecule_id: None,
                        grid_optimizations: BTreeMap::new(),
                    },
                ))
            }
            RecordInput::Manybody { initial_molecule } => {
                let (_, mol_id) = self.resolve_molecule_upload(initial_molecule)?;
                let row = self.molecules.get(&mol_id).expect("just resolved");
                if row.molecule.fragments.len() < 2 {
                    return Err(ServerError::InvalidPayload(
                        "manybody requires a molecule with at least two fragments".to_string(),
                    ));
                }
                Ok((
                    Self::dedup_key(RecordType::Manybody, spec_id, &mol_id.to_string()),
                    RecordDetail::Manybody {
                        specification_id: spec_id,
                        initial_molecule_id: mol_id,
                        clusters: Vec::new(),
                        total_energy: None,
                        interaction_energy: None,
                    },
                ))
            }
            RecordInput::Reaction { stoichiometry } => {
                if stoichiometry.is_empty() {
                    return Err(ServerError::InvalidPayload(
                        "reaction requires at least one stoichiometry component".to_string(),
                    ));
                }
                let mut components = Vec::new();
                for component in stoichiometry {
                    let (_, mol_id) = self.resolve_molecule_upload(&component.molecule)?;
                    components.push(models::ReactionComponentData {
                        coefficient: component.coefficient,
                        molecule_id: mol_id,
                        singlepoint_id: None,
                        optimization_id: None,
                        energy: None,
                    });
                }
                let mut key_parts: Vec<String> = components
                    .iter()
                    .map(|c| format!("{:.6}x{}", c.coefficient, c.molecule_id))
                    .collect();
                key_parts.sort();
                Ok((
                    Self::dedup_key(RecordType::Reaction, spec_id, &key_parts.join(",")),
                    RecordDetail::Reaction {
                        specification_id: spec_id,
                        components,
                        total_energy: None,
                    },
                ))
            }
            RecordInput::Neb { chain } => {
                if chain.len() < 3 {
                    return Err(ServerError::InvalidPayload(
                        "neb requires a chain of at least three molecules".to_string(),
                    ));
                }
                let mut ids = Vec::new();
                for upload in chain {
                    ids.push(self.resolve_molecule_upload(upload)?.1);
                }
                let key = ids
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                Ok((
                    Self::dedup_key(RecordType::Neb, spec_id, &key),
                    RecordDetail::Neb {
                        specification_id: spec_id,
                        chain_molecule_ids: ids,
                        image_singlepoint_ids: Vec::new(),
                        image_energies: Vec::new(),
                        ts_optimization_id: None,
                        endpoint_optimization_ids: Vec::new(),
                    },
                ))
            }
        }
    }

    // -- status helpers ---------------------------------------------------

    fn backup_top(&self, record_id: Id) -> Option<RecordStatus> {
        self.backups
            .get(&record_id)
            .and_then(|stack| stack.last())
            .map(|b| b.old_status)
    }

    fn apply_status_plan(&mut self, record_id: Id, plan: &StatusPlan) -> Result<()> {
        // Snapshot task info before any row mutation, for the backup frame.
        let task_snapshot = self
            .task_by_record
            .get(&record_id)
            .and_then(|tid| self.tasks.get(tid))
            .map(|t| (t.compute_tag.clone(), t.compute_priority));
        let service_snapshot = self
            .service_by_record
            .get(&record_id)
            .and_then(|sid| self.services.get(sid))
            .map(|s| (s.compute_tag.clone(), s.compute_priority));

        if let Some(old_status) = plan.push_backup {
            let snapshot = task_snapshot.clone().or(service_snapshot);
            let id = self.next_id();
            self.backups.entry(record_id).or_default().push(InfoBackupRow {
                id,
                record_id,
                old_status,
                compute_tag: snapshot.as_ref().map(|(t, _)| t.clone()),
                compute_priority: snapshot.as_ref().map(|(_, p)| *p),
                created_on: Utc::now(),
            });
        }

        let popped = if plan.pop_backup {
            self.backups.get_mut(&record_id).and_then(|stack| stack.pop())
        } else {
            None
        };

        match plan.task_effect {
            TaskEffect::None => {}
            TaskEffect::Delete => self.delete_task_row(record_id),
            TaskEffect::MakeAvailable => {
                if let Some(task_id) = self.task_by_record.get(&record_id).copied() {
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        task.available = true;
                    }
                } else {
                    // Row was lost (e.g. revert chain); rebuild it.
                    let (tag, priority) = task_snapshot
                        .clone()
                        .unwrap_or_else(|| ("*".to_string(), ComputePriority::Normal));
                    self.create_task_row(record_id, &tag, priority, true)?;
                }
            }
            TaskEffect::Recreate { available } => {
                if self.task_by_record.get(&record_id).is_none() {
                    let (tag, priority) = popped
                        .as_ref()
                        .and_then(|b| {
                            b.compute_tag
                                .clone()
                                .map(|t| (t, b.compute_priority.unwrap_or_default()))
                        })
                        .unwrap_or_else(|| ("*".to_string(), ComputePriority::Normal));
                    self.create_task_row(record_id, &tag, priority, available)?;
                } else if let Some(task_id) = self.task_by_record.get(&record_id).copied() {
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        task.available = available;
                    }
                }
            }
        }

        let record = self
            .records
            .get_mut(&record_id)
            .ok_or_else(|| ServerError::missing(format!("record {record_id}")))?;
        record.status = plan.new_status;
        if plan.clear_manager {
            record.manager_name = None;
        }
        record.modified_on = Utc::now();

        // A service coming back to waiting/running/error must still have its
        // service row; it is never deleted outside completion, so nothing to
        // rebuild here.
        Ok(())
    }

    fn status_op(&mut self, ids: &[Id], op: StatusOperation) -> UpdateMetadata {
        let mut meta = UpdateMetadata::default();
        for (idx, &id) in ids.iter().enumerate() {
            let Some(record) = self.records.get(&id).cloned() else {
                meta.mark_error(idx, format!("record {id} does not exist"));
                continue;
            };
            match plan_status_change(&record, self.backup_top(id), op) {
                Ok(plan) => match self.apply_status_plan(id, &plan) {
                    Ok(()) => meta.mark_updated(idx),
                    Err(err) => meta.mark_error(idx, err.to_string()),
                },
                Err(err) => meta.mark_error(idx, err.to_string()),
            }
        }
        meta
    }

    fn children_of(&self, record_id: Id) -> Vec<Id> {
        let mut children: BTreeSet<Id> = BTreeSet::new();

        if let Some(detail) = self.details.get(&record_id) {
            match detail {
                RecordDetail::Singlepoint { .. } => {}
                RecordDetail::Optimization { trajectory_ids, .. } => {
                    children.extend(trajectory_ids.iter().copied());
                }
                RecordDetail::Torsiondrive {
                    optimization_history,
                    ..
                } => {
                    children.extend(optimization_history.values().flatten().copied());
                }
                RecordDetail::Gridoptimization {
                    grid_optimizations, ..
                } => {
                    children.extend(grid_optimizations.values().copied());
                }
                RecordDetail::Manybody { clusters, .. } => {
                    children.extend(clusters.iter().map(|c| c.singlepoint_id));
                }
                RecordDetail::Reaction { components, .. } => {
                    for c in components {
                        children.extend(c.singlepoint_id.iter().copied());
                        children.extend(c.optimization_id.iter().copied());
                    }
                }
                RecordDetail::Neb {
                    image_singlepoint_ids,
                    ts_optimization_id,
                    endpoint_optimization_ids,
                    ..
                } => {
                    children.extend(image_singlepoint_ids.iter().copied());
                    children.extend(ts_optimization_id.iter().copied());
                    children.extend(endpoint_optimization_ids.iter().copied());
                }
            }
        }

        if let Some(service_id) = self.service_by_record.get(&record_id) {
            if let Some(deps) = self.service_deps.get(service_id) {
                children.extend(deps.iter().map(|d| d.record_id));
            }
        }

        children.remove(&record_id);
        children.into_iter().collect()
    }

    fn descendants_of(&self, record_id: Id) -> Vec<Id> {
        let mut seen: BTreeSet<Id> = BTreeSet::new();
        let mut queue = self.children_of(record_id);
        while let Some(id) = queue.pop() {
            if seen.insert(id) {
                queue.extend(self.children_of(id));
            }
        }
        seen.into_iter().collect()
    }

    fn hard_delete(&mut self, record_id: Id) {
        self.records.remove(&record_id);
        self.details.remove(&record_id);
        self.history.remove(&record_id);
        self.backups.remove(&record_id);
        self.comments.remove(&record_id);
        self.native_files.remove(&record_id);
        self.wavefunctions.remove(&record_id);
        self.delete_task_row(record_id);
        if let Some(service_id) = self.service_by_record.remove(&record_id) {
            self.services.remove(&service_id);
            self.service_deps.remove(&service_id);
        }
        self.record_keys.retain(|_, id| *id != record_id);
    }

    fn latest_history_mut(&mut self, record_id: Id) -> Option<&mut ComputeHistoryEntry> {
        self.history.get_mut(&record_id).and_then(|h| h.last_mut())
    }

    /// Failures of the given error type recorded before the current attempt.
    fn prior_failures(&self, record_id: Id, error_type: &str) -> u32 {
        let Some(entries) = self.history.get(&record_id) else {
            return 0;
        };
        entries
            .iter()
            .filter(|e| e.status == RecordStatus::Error)
            .filter(|e| stored_error_type(&e.outputs).as_deref() == Some(error_type))
            .count() as u32
    }
}

#[async_trait]
impl Store for MemStore {
    // -- content ----------------------------------------------------------

    async fn add_molecules(
        &self,
        molecules: &[MoleculeUpload],
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)> {
        let mut state = self.state.lock().await;
        let mut meta = InsertMetadata::default();
        let mut ids = Vec::with_capacity(molecules.len());

        for (idx, upload) in molecules.iter().enumerate() {
            match state.resolve_molecule_upload(upload) {
                Ok((true, id)) => {
                    meta.mark_inserted(idx);
                    ids.push(Some(id));
                }
                Ok((false, id)) => {
                    meta.mark_existing(idx);
                    ids.push(Some(id));
                }
                Err(err) => {
                    meta.mark_error(idx, err.to_string());
                    ids.push(None);
                }
            }
        }
        Ok((meta, ids))
    }

    async fn get_molecules(
        &self,
        ids: &[Id],
        missing_ok: bool,
    ) -> Result<Vec<Option<MoleculeRow>>> {
        let state = self.state.lock().await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match state.molecules.get(id) {
                Some(row) => out.push(Some(row.clone())),
                None if missing_ok => out.push(None),
                None => {
                    return Err(ServerError::missing(format!("molecule {id} does not exist")))
                }
            }
        }
        Ok(out)
    }

    async fn update_molecule_identifiers(
        &self,
        id: Id,
        identifiers: &MoleculeIdentifiers,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .molecules
            .get_mut(&id)
            .ok_or_else(|| ServerError::missing(format!("molecule {id} does not exist")))?;
        row.molecule.identifiers = identifiers.clone();
        Ok(())
    }

    async fn add_keywords(
        &self,
        keywords: &[KeywordSet],
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)> {
        let mut state = self.state.lock().await;
        let mut meta = InsertMetadata::default();
        let mut ids = Vec::with_capacity(keywords.len());
        for (idx, kws) in keywords.iter().enumerate() {
            let (inserted, id) = state.add_keyword_set(kws);
            if inserted {
                meta.mark_inserted(idx);
            } else {
                meta.mark_existing(idx);
            }
            ids.push(Some(id));
        }
        Ok((meta, ids))
    }

    async fn get_keywords(
        &self,
        ids: &[Id],
        missing_ok: bool,
    ) -> Result<Vec<Option<KeywordSetRow>>> {
        let state = self.state.lock().await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match state.keywords.get(id) {
                Some(row) => out.push(Some(row.clone())),
                None if missing_ok => out.push(None),
                None => {
                    return Err(ServerError::missing(format!(
                        "keyword set {id} does not exist"
                    )))
                }
            }
        }
        Ok(out)
    }

    async fn add_qc_specifications(
        &self,
        specs: &[QcSpecificationInput],
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)> {
        let mut state = self.state.lock().await;
        let mut meta = InsertMetadata::default();
        let mut ids = Vec::with_capacity(specs.len());
        for (idx, spec) in specs.iter().enumerate() {
            match state.add_qc_spec(spec) {
                Ok((true, id)) => {
                    meta.mark_inserted(idx);
                    ids.push(Some(id));
                }
                Ok((false, id)) => {
                    meta.mark_existing(idx);
                    ids.push(Some(id));
                }
                Err(err) => {
                    meta.mark_error(idx, err.to_string());
                    ids.push(None);
                }
            }
        }
        Ok((meta, ids))
    }

    async fn get_qc_specification(&self, id: Id) -> Result<QcSpecification> {
        let state = self.state.lock().await;
        state
            .qc_specs
            .get(&id)
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("qc specification {id} does not exist")))
    }

    async fn get_optimization_specification(&self, id: Id) -> Result<OptimizationSpecification> {
        let state = self.state.lock().await;
        state.opt_specs.get(&id).cloned().ok_or_else(|| {
            ServerError::missing(format!("optimization specification {id} does not exist"))
        })
    }

    async fn get_torsiondrive_specification(&self, id: Id) -> Result<TorsiondriveSpecification> {
        let state = self.state.lock().await;
        state.td_specs.get(&id).cloned().ok_or_else(|| {
            ServerError::missing(format!("torsiondrive specification {id} does not exist"))
        })
    }

    async fn get_gridoptimization_specification(
        &self,
        id: Id,
    ) -> Result<GridoptimizationSpecification> {
        let state = self.state.lock().await;
        state.go_specs.get(&id).cloned().ok_or_else(|| {
            ServerError::missing(format!(
                "gridoptimization specification {id} does not exist"
            ))
        })
    }

    async fn get_manybody_specification(&self, id: Id) -> Result<ManybodySpecification> {
        let state = self.state.lock().await;
        state.mb_specs.get(&id).cloned().ok_or_else(|| {
            ServerError::missing(format!("manybody specification {id} does not exist"))
        })
    }

    async fn get_reaction_specification(&self, id: Id) -> Result<ReactionSpecification> {
        let state = self.state.lock().await;
        state.rxn_specs.get(&id).cloned().ok_or_else(|| {
            ServerError::missing(format!("reaction specification {id} does not exist"))
        })
    }

    async fn get_neb_specification(&self, id: Id) -> Result<NebSpecification> {
        let state = self.state.lock().await;
        state
            .neb_specs
            .get(&id)
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("neb specification {id} does not exist")))
    }

    // -- records ----------------------------------------------------------

    async fn add_records(
        &self,
        spec: &RecordSpecification,
        inputs: &[RecordInput],
        compute_tag: &str,
        compute_priority: ComputePriority,
        creator_user: Option<&str>,
        find_existing: bool,
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)> {
        models::check_input_types(spec, inputs)?;

        let mut state = self.state.lock().await;
        let spec_id = state.add_record_spec(spec)?;
        let compute_tag = models::normalize_name(compute_tag);

        let mut meta = InsertMetadata::default();
        let mut ids = Vec::with_capacity(inputs.len());

        for (idx, input) in inputs.iter().enumerate() {
            let (key, detail) = match state.resolve_record_input(spec_id, input) {
                Ok(resolved) => resolved,
                Err(err) => {
                    meta.mark_error(idx, err.to_string());
                    ids.push(None);
                    continue;
                }
            };

            if find_existing {
                if let Some(&existing) = state.record_keys.get(&key) {
                    meta.mark_existing(idx);
                    ids.push(Some(existing));
                    continue;
                }
            }

            match state.create_record(
                detail,
                key,
                &compute_tag,
                compute_priority,
                creator_user,
                find_existing,
            ) {
                Ok(id) => {
                    meta.mark_inserted(idx);
                    ids.push(Some(id));
                }
                Err(err) => {
                    meta.mark_error(idx, err.to_string());
                    ids.push(None);
                }
            }
        }

        Ok((meta, ids))
    }

    async fn get_records(
        &self,
        ids: &[Id],
        projection: &ProjectionSpec,
        missing_ok: bool,
    ) -> Result<Vec<Option<RecordData>>> {
        let state = self.state.lock().await;
        let mut out = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(record) = state.records.get(id) else {
                if missing_ok {
                    out.push(None);
                    continue;
                }
                return Err(ServerError::missing(format!("record {id} does not exist")));
            };

            let mut data = RecordData {
                id: record.id,
                record_type: record.record_type,
                status: projection.wants_column("status").then_some(record.status),
                manager_name: if projection.wants_column("manager_name") {
                    record.manager_name.clone()
                } else {
                    None
                },
                created_on: projection
                    .wants_column("created_on")
                    .then_some(record.created_on),
                modified_on: projection
                    .wants_column("modified_on")
                    .then_some(record.modified_on),
                creator_user: if projection.wants_column("creator_user") {
                    record.creator_user.clone()
                } else {
                    None
                },
                detail: if projection.wants_column("detail") {
                    state.details.get(id).cloned()
                } else {
                    None
                },
                compute_history: None,
                task: None,
                service: None,
                comments: None,
            };

            if projection.wants_relationship("compute_history") {
                data.compute_history = Some(state.history.get(id).cloned().unwrap_or_default());
            }
            if projection.wants_relationship("task") {
                data.task = state
                    .task_by_record
                    .get(id)
                    .and_then(|tid| state.tasks.get(tid))
                    .map(|t| TaskData {
                        id: t.id,
                        record_id: t.record_id,
                        spec: t.spec.clone(),
                        required_programs: t.required_programs.clone(),
                        compute_tag: t.compute_tag.clone(),
                        compute_priority: t.compute_priority,
                        available: t.available,
                        created_on: t.created_on,
                    });
            }
            if projection.wants_relationship("service") {
                data.service = state
                    .service_by_record
                    .get(id)
                    .and_then(|sid| state.services.get(sid))
                    .map(|s| ServiceData {
                        id: s.id,
                        record_id: s.record_id,
                        compute_tag: s.compute_tag.clone(),
                        compute_priority: s.compute_priority,
                        find_existing: s.find_existing,
                        created_on: s.created_on,
                        dependencies: state
                            .service_deps
                            .get(&s.id)
                            .map(|deps| {
                                deps.iter()
                                    .map(|d| ServiceDependencyData {
                                        record_id: d.record_id,
                                        extras: d.extras.clone(),
                                    })
                                    .collect()
                            })
                            .unwrap_or_default(),
                    });
            }
            if projection.wants_relationship("comments") {
                data.comments = Some(state.comments.get(id).cloned().unwrap_or_default());
            }

            out.push(Some(data));
        }

        Ok(out)
    }

    async fn query_records(
        &self,
        filters: &RecordQueryFilters,
    ) -> Result<(QueryMetadata, Vec<Id>)> {
        let state = self.state.lock().await;

        // Pre-compute relationship filters.
        let parent_children: Option<BTreeSet<Id>> = filters.parent_id.as_ref().map(|parents| {
            parents
                .iter()
                .flat_map(|p| state.children_of(*p))
                .collect()
        });
        let child_parents: Option<BTreeSet<Id>> = filters.child_id.as_ref().map(|child_ids| {
            state
                .records
                .keys()
                .filter(|candidate| {
                    state
                        .children_of(**candidate)
                        .iter()
                        .any(|c| child_ids.contains(c))
                })
                .copied()
                .collect()
        });
        let dataset_members: Option<BTreeSet<Id>> = filters.dataset_id.as_ref().map(|ds_ids| {
            ds_ids
                .iter()
                .flat_map(|ds| {
                    state
                        .dataset_records
                        .get(ds)
                        .map(|rows| rows.iter().map(|r| r.record_id).collect::<Vec<_>>())
                        .unwrap_or_default()
                })
                .collect()
        });

        let matched: Vec<Id> = state
            .records
            .values()
            .filter(|r| {
                filters
                    .record_type
                    .as_ref()
                    .map_or(true, |ts| ts.contains(&r.record_type))
            })
            .filter(|r| {
                filters
                    .status
                    .as_ref()
                    .map_or(true, |ss| ss.contains(&r.status))
            })
            .filter(|r| {
                filters.manager_name.as_ref().map_or(true, |ms| {
                    r.manager_name.as_ref().map_or(false, |m| ms.contains(m))
                })
            })
            .filter(|r| {
                filters.creator_user.as_ref().map_or(true, |us| {
                    r.creator_user.as_ref().map_or(false, |u| us.contains(u))
                })
            })
            .filter(|r| filters.created_before.map_or(true, |t| r.created_on < t))
            .filter(|r| filters.created_after.map_or(true, |t| r.created_on > t))
            .filter(|r| filters.modified_before.map_or(true, |t| r.modified_on < t))
            .filter(|r| filters.modified_after.map_or(true, |t| r.modified_on > t))
            .filter(|r| parent_children.as_ref().map_or(true, |s| s.contains(&r.id)))
            .filter(|r| child_parents.as_ref().map_or(true, |s| s.contains(&r.id)))
            .filter(|r| dataset_members.as_ref().map_or(true, |s| s.contains(&r.id)))
            .map(|r| r.id)
            .collect();

        let n_found = matched.len();
        let page: Vec<Id> = matched
            .into_iter()
            .skip(filters.skip)
            .take(filters.limit.unwrap_or(usize::MAX))
            .collect();

        Ok((
            QueryMetadata {
                n_found,
                n_returned: page.len(),
            },
            page,
        ))
    }

    async fn get_record_row(&self, id: Id) -> Result<RecordRow> {
        let state = self.state.lock().await;
        state
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("record {id} does not exist")))
    }

    async fn get_record_detail(&self, id: Id) -> Result<RecordDetail> {
        let state = self.state.lock().await;
        state
            .details
            .get(&id)
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("record {id} does not exist")))
    }

    async fn get_compute_history(&self, record_id: Id) -> Result<Vec<ComputeHistoryEntry>> {
        let state = self.state.lock().await;
        if !state.records.contains_key(&record_id) {
            return Err(ServerError::missing(format!(
                "record {record_id} does not exist"
            )));
        }
        Ok(state.history.get(&record_id).cloned().unwrap_or_default())
    }

    async fn get_task_row(&self, record_id: Id) -> Result<Option<TaskRow>> {
        let state = self.state.lock().await;
        Ok(state
            .task_by_record
            .get(&record_id)
            .and_then(|tid| state.tasks.get(tid))
            .cloned())
    }

    async fn get_service_row(&self, record_id: Id) -> Result<Option<ServiceRow>> {
        let state = self.state.lock().await;
        Ok(state
            .service_by_record
            .get(&record_id)
            .and_then(|sid| state.services.get(sid))
            .cloned())
    }

    async fn get_service_dependencies(&self, record_id: Id) -> Result<Vec<ServiceDependencyRow>> {
        let state = self.state.lock().await;
        Ok(state
            .service_by_record
            .get(&record_id)
            .and_then(|sid| state.service_deps.get(sid))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_info_backup_depth(&self, record_id: Id) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.backups.get(&record_id).map_or(0, |s| s.len()))
    }

    async fn add_comment(
        &self,
        record_id: Id,
        username: Option<&str>,
        comment: &str,
    ) -> Result<Id> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(&record_id) {
            return Err(ServerError::missing(format!(
                "record {record_id} does not exist"
            )));
        }
        let id = state.next_id();
        state.comments.entry(record_id).or_default().push(RecordComment {
            id,
            record_id,
            username: username.map(String::from),
            timestamp: Utc::now(),
            comment: comment.to_string(),
        });
        Ok(id)
    }

    async fn get_comments(&self, record_id: Id) -> Result<Vec<RecordComment>> {
        let state = self.state.lock().await;
        if !state.records.contains_key(&record_id) {
            return Err(ServerError::missing(format!(
                "record {record_id} does not exist"
            )));
        }
        Ok(state.comments.get(&record_id).cloned().unwrap_or_default())
    }

    async fn get_children_ids(&self, record_id: Id) -> Result<Vec<Id>> {
        let state = self.state.lock().await;
        Ok(state.children_of(record_id))
    }

    // -- task queue -------------------------------------------------------

    async fn claim_tasks(
        &self,
        manager_name: &str,
        programs: &BTreeMap<String, Option<String>>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<ClaimedTask>> {
        let mut state = self.state.lock().await;

        let manager_id = *state.manager_by_name.get(manager_name).ok_or_else(|| {
            ServerError::compute_manager_shutdown(format!(
                "manager {manager_name} does not exist"
            ))
        })?;
        if state.managers[&manager_id].status != ManagerStatus::Active {
            return Err(ServerError::compute_manager_shutdown(format!(
                "manager {manager_name} is not active"
            )));
        }

        let programs: BTreeMap<String, Option<String>> = programs
            .iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v.clone()))
            .collect();
        let tags: Vec<String> = tags.iter().map(|t| t.trim().to_lowercase()).collect();

        let candidates: Vec<TaskRow> = state
            .tasks
            .values()
            .filter(|t| t.available)
            .filter(|t| programs_satisfied(&t.required_programs, &programs))
            .cloned()
            .collect();

        let chosen = select_for_claim(&candidates, &tags, limit);
        let mut claimed = Vec::with_capacity(chosen.len());
        let now = Utc::now();

        for task_id in chosen {
            let task = state.tasks.get_mut(&task_id).expect("chosen from candidates");
            task.available = false;
            let task = task.clone();

            let record = state
                .records
                .get_mut(&task.record_id)
                .expect("task row has a record");
            record.status = RecordStatus::Running;
            record.manager_name = Some(manager_name.to_string());
            record.modified_on = now;

            let hist_id = state.next_id();
            state
                .history
                .entry(task.record_id)
                .or_default()
                .push(ComputeHistoryEntry {
                    id: hist_id,
                    record_id: task.record_id,
                    status: RecordStatus::Running,
                    manager_name: Some(manager_name.to_string()),
                    modified_on: now,
                    provenance: None,
                    outputs: BTreeMap::new(),
                });

            claimed.push(ClaimedTask {
                task_id: task.id,
                record_id: task.record_id,
                spec: task.spec.clone(),
                required_programs: task.required_programs.clone(),
                compute_tag: task.compute_tag.clone(),
                compute_priority: task.compute_priority,
            });
        }

        let n = claimed.len() as i64;
        if let Some(manager) = state.managers.get_mut(&manager_id) {
            manager.claimed += n;
        }

        Ok(claimed)
    }

    async fn return_results(
        &self,
        manager_name: &str,
        results: Vec<(Id, ResultEnvelope)>,
        auto_reset: &AutoResetPolicy,
    ) -> Result<Vec<(Id, ReturnOutcome)>> {
        let mut state = self.state.lock().await;

        let manager_id = *state.manager_by_name.get(manager_name).ok_or_else(|| {
            ServerError::compute_manager_shutdown(format!(
                "manager {manager_name} does not exist"
            ))
        })?;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut successes = 0i64;
        let mut failures = 0i64;
        let mut rejected = 0i64;

        for (task_id, envelope) in results {
            let Some(task) = state.tasks.get(&task_id).cloned() else {
                outcomes.push((task_id, reject("task does not exist in task queue")));
                rejected += 1;
                continue;
            };
            let record = state.records.get(&task.record_id).cloned().expect("task record");

            if record.manager_name.as_deref() != Some(manager_name) {
                outcomes.push((task_id, reject("task is claimed by another manager")));
                rejected += 1;
                continue;
            }
            if record.status != RecordStatus::Running {
                outcomes.push((task_id, reject("record is not in a running state")));
                rejected += 1;
                continue;
            }

            let now = Utc::now();
            match envelope {
                ResultEnvelope::Success(payload) => {
                    // The result must answer the record's type.
                    let type_matches = matches!(
                        (&payload.result, record.record_type),
                        (TaskResult::Singlepoint { .. }, RecordType::Singlepoint)
                            | (TaskResult::Optimization { .. }, RecordType::Optimization)
                    );
                    if !type_matches {
                        outcomes.push((task_id, reject("result does not match the record type")));
                        rejected += 1;
                        continue;
                    }

                    match payload.result {
                        TaskResult::Singlepoint {
                            return_result,
                            properties,
                        } => {
                            if let Some(RecordDetail::Singlepoint {
                                return_result: rr,
                                properties: props,
                                ..
                            }) = state.details.get_mut(&record.id)
                            {
                                *rr = Some(return_result);
                                *props = Some(properties);
                            }
                            if let Some(wfn) = payload.wavefunction {
                                state.wavefunctions.insert(record.id, wfn);
                            }
                        }
                        TaskResult::Optimization {
                            final_molecule,
                            energies,
                            trajectory,
                        } => {
                            let (_, final_id) = match state.add_molecule(&final_molecule) {
                                Ok(v) => v,
                                Err(err) => {
                                    outcomes.push((
                                        task_id,
                                        reject(&format!("invalid final molecule: {err}")),
                                    ));
                                    rejected += 1;
                                    continue;
                                }
                            };

                            let qc_spec_id = match state.details.get(&record.id) {
                                Some(RecordDetail::Optimization {
                                    specification_id, ..
                                }) => state
                                    .opt_specs
                                    .get(specification_id)
                                    .map(|s| s.qc_specification_id),
                                _ => None,
                            };

                            // Trajectory steps become complete singlepoint
                            // children, deduplicating molecules as they go.
                            let mut traj_ids = Vec::with_capacity(trajectory.len());
                            if let Some(qc_spec_id) = qc_spec_id {
                                let mut step_error = None;
                                for step in &trajectory {
                                    match state.add_molecule(&step.molecule) {
                                        Ok((_, mol_id)) => {
                                            let sp_id = state.insert_complete_singlepoint(
                                                qc_spec_id,
                                                mol_id,
                                                json!(step.energy),
                                                step.properties.clone(),
                                                manager_name,
                                            );
                                            traj_ids.push(sp_id);
                                        }
                                        Err(err) => {
                                            step_error = Some(err);
                                            break;
                                        }
                                    }
                                }
                                if let Some(err) = step_error {
                                    outcomes.push((
                                        task_id,
                                        reject(&format!("invalid trajectory molecule: {err}")),
                                    ));
                                    rejected += 1;
                                    continue;
                                }
                            }

                            if let Some(RecordDetail::Optimization {
                                final_molecule_id,
                                energies: detail_energies,
                                trajectory_ids,
                                ..
                            }) = state.details.get_mut(&record.id)
                            {
                                *final_molecule_id = Some(final_id);
                                *detail_energies = energies;
                                *trajectory_ids = traj_ids;
                            }
                        }
                    }

                    for (name, blob) in payload.native_files {
                        state
                            .native_files
                            .entry(record.id)
                            .or_default()
                            .insert(name, blob);
                    }

                    if let Some(entry) = state.latest_history_mut(record.id) {
                        entry.status = RecordStatus::Complete;
                        entry.modified_on = now;
                        entry.provenance = Some(json!(payload.provenance));
                        if let Some(stdout) = payload.stdout {
                            entry.outputs.insert(OutputType::Stdout, stdout);
                        }
                        if let Some(stderr) = payload.stderr {
                            entry.outputs.insert(OutputType::Stderr, stderr);
                        }
                    }

                    state.delete_task_row(record.id);
                    let rec = state.records.get_mut(&record.id).expect("record exists");
                    rec.status = RecordStatus::Complete;
                    rec.modified_on = now;

                    successes += 1;
                    outcomes.push((task_id, ReturnOutcome::Accepted));
                }

                ResultEnvelope::Failure(payload) => {
                    let prior = state.prior_failures(record.id, &payload.error.error_type);

                    if let Some(entry) = state.latest_history_mut(record.id) {
                        entry.status = RecordStatus::Error;
                        entry.modified_on = now;
                        entry.outputs.insert(
                            OutputType::Error,
                            CompressedBlob::plain(&serde_json::to_string(&payload.error)?),
                        );
                        if let Some(stdout) = payload.stdout {
                            entry.outputs.insert(OutputType::Stdout, stdout);
                        }
                        if let Some(stderr) = payload.stderr {
                            entry.outputs.insert(OutputType::Stderr, stderr);
                        }
                    }

                    let auto = auto_reset.should_reset(&payload.error.error_type, prior);
                    let rec = state.records.get_mut(&record.id).expect("record exists");
                    if auto {
                        rec.status = RecordStatus::Waiting;
                        rec.manager_name = None;
                        rec.modified_on = now;
                        if let Some(task_id) = state.task_by_record.get(&record.id).copied() {
                            if let Some(t) = state.tasks.get_mut(&task_id) {
                                t.available = true;
                            }
                        }
                    } else {
                        rec.status = RecordStatus::Error;
                        rec.modified_on = now;
                    }

                    failures += 1;
                    outcomes.push((task_id, ReturnOutcome::Accepted));
                }
            }
        }

        if let Some(manager) = state.managers.get_mut(&manager_id) {
            manager.successes += successes;
            manager.failures += failures;
            manager.rejected += rejected;
        }

        Ok(outcomes)
    }

    async fn reset_assigned_tasks(&self, manager_names: &[String]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let affected: Vec<Id> = state
            .records
            .values()
            .filter(|r| r.status == RecordStatus::Running)
            .filter(|r| {
                r.manager_name
                    .as_ref()
                    .map_or(false, |m| manager_names.contains(m))
            })
            .map(|r| r.id)
            .collect();

        for id in &affected {
            let record = state.records.get_mut(id).expect("selected above");
            record.status = RecordStatus::Waiting;
            record.manager_name = None;
            record.modified_on = now;
            if let Some(task_id) = state.task_by_record.get(id).copied() {
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.available = true;
                }
            }
        }

        Ok(affected.len())
    }

    // -- managers ---------------------------------------------------------

    async fn activate_manager(&self, activation: &ManagerActivation) -> Result<Id> {
        let (programs, tags) = activation.normalized()?;
        let name = activation.name.fullname();

        let mut state = self.state.lock().await;
        if state.manager_by_name.contains_key(&name) {
            return Err(ServerError::compute_manager(format!(
                "manager {name} already exists"
            )));
        }

        let now = Utc::now();
        let id = state.next_id();
        state.manager_by_name.insert(name.clone(), id);
        state.managers.insert(
            id,
            ManagerRow {
                id,
                name,
                cluster: activation.name.cluster.clone(),
                hostname: activation.name.hostname.clone(),
                uuid: activation.name.uuid.clone(),
                manager_version: activation.manager_version.clone(),
                username: activation.username.clone(),
                programs,
                tags,
                status: ManagerStatus::Active,
                claimed: 0,
                successes: 0,
                failures: 0,
                rejected: 0,
                resources: ManagerResources::default(),
                created_on: now,
                modified_on: now,
            },
        );
        Ok(id)
    }

    async fn manager_heartbeat(&self, name: &str, resources: &ManagerResources) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = *state.manager_by_name.get(name).ok_or_else(|| {
            ServerError::compute_manager_shutdown(format!("manager {name} does not exist"))
        })?;
        let manager = state.managers.get_mut(&id).expect("indexed");
        if manager.status != ManagerStatus::Active {
            return Err(ServerError::compute_manager_shutdown(format!(
                "manager {name} is not active"
            )));
        }
        manager.resources = resources.clone();
        manager.modified_on = Utc::now();
        Ok(())
    }

    async fn deactivate_managers(&self, names: &[String]) -> Result<Vec<String>> {
        let deactivated = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let mut deactivated = Vec::new();
            for name in names {
                if let Some(&id) = state.manager_by_name.get(name) {
                    let manager = state.managers.get_mut(&id).expect("indexed");
                    if manager.status == ManagerStatus::Active {
                        manager.status = ManagerStatus::Inactive;
                        manager.modified_on = now;
                        deactivated.push(name.clone());
                    }
                }
            }
            deactivated
        };

        if !deactivated.is_empty() {
            self.reset_assigned_tasks(&deactivated).await?;
        }
        Ok(deactivated)
    }

    async fn deactivate_managers_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let stale: Vec<String> = {
            let state = self.state.lock().await;
            state
                .managers
                .values()
                .filter(|m| m.status == ManagerStatus::Active && m.modified_on < cutoff)
                .map(|m| m.name.clone())
                .collect()
        };
        self.deactivate_managers(&stale).await
    }

    async fn get_manager(&self, name: &str) -> Result<ManagerRow> {
        let state = self.state.lock().await;
        state
            .manager_by_name
            .get(name)
            .and_then(|id| state.managers.get(id))
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("manager {name} does not exist")))
    }

    async fn query_managers(
        &self,
        filters: &ManagerQueryFilters,
    ) -> Result<(QueryMetadata, Vec<ManagerRow>)> {
        let state = self.state.lock().await;

        let matched: Vec<ManagerRow> = state
            .managers
            .values()
            .filter(|m| filters.name.as_ref().map_or(true, |v| v.contains(&m.name)))
            .filter(|m| {
                filters
                    .cluster
                    .as_ref()
                    .map_or(true, |v| v.contains(&m.cluster))
            })
            .filter(|m| {
                filters
                    .hostname
                    .as_ref()
                    .map_or(true, |v| v.contains(&m.hostname))
            })
            .filter(|m| {
                filters
                    .status
                    .as_ref()
                    .map_or(true, |v| v.contains(&m.status))
            })
            .filter(|m| filters.modified_before.map_or(true, |t| m.modified_on < t))
            .filter(|m| filters.modified_after.map_or(true, |t| m.modified_on > t))
            .cloned()
            .collect();

        let n_found = matched.len();
        let page: Vec<ManagerRow> = matched
            .into_iter()
            .skip(filters.skip)
            .take(filters.limit.unwrap_or(usize::MAX))
            .collect();

        Ok((
            QueryMetadata {
                n_found,
                n_returned: page.len(),
            },
            page,
        ))
    }

    // -- status engine ----------------------------------------------------

    async fn reset_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut state = self.state.lock().await;
        Ok(state.status_op(ids, StatusOperation::Reset))
    }

    async fn cancel_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut state = self.state.lock().await;
        Ok(state.status_op(ids, StatusOperation::Cancel))
    }

    async fn uncancel_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut state = self.state.lock().await;
        Ok(state.status_op(ids, StatusOperation::Uncancel))
    }

    async fn invalidate_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut state = self.state.lock().await;
        Ok(state.status_op(ids, StatusOperation::Invalidate))
    }

    async fn uninvalidate_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut state = self.state.lock().await;
        Ok(state.status_op(ids, StatusOperation::Uninvalidate))
    }

    async fn delete_records(
        &self,
        ids: &[Id],
        soft: bool,
        delete_children: bool,
    ) -> Result<UpdateMetadata> {
        let mut state = self.state.lock().await;
        let mut meta = UpdateMetadata::default();

        for (idx, &id) in ids.iter().enumerate() {
            let Some(record) = state.records.get(&id).cloned() else {
                meta.mark_error(idx, format!("record {id} does not exist"));
                continue;
            };

            let targets: Vec<Id> = if delete_children {
                let mut t = vec![id];
                t.extend(state.descendants_of(id));
                t
            } else {
                vec![id]
            };

            if soft {
                match plan_status_change(&record, state.backup_top(id), StatusOperation::SoftDelete)
                {
                    Ok(plan) => {
                        if let Err(err) = state.apply_status_plan(id, &plan) {
                            meta.mark_error(idx, err.to_string());
                            continue;
                        }
                    }
                    Err(err) => {
                        meta.mark_error(idx, err.to_string());
                        continue;
                    }
                }
                // Cascade: already-deleted children are skipped silently.
                for child in targets.into_iter().skip(1) {
                    let Some(child_record) = state.records.get(&child).cloned() else {
                        continue;
                    };
                    if let Ok(plan) = plan_status_change(
                        &child_record,
                        state.backup_top(child),
                        StatusOperation::SoftDelete,
                    ) {
                        let _ = state.apply_status_plan(child, &plan);
                    }
                }
            } else {
                for target in targets.into_iter().rev() {
                    state.hard_delete(target);
                }
            }
            meta.mark_updated(idx);
        }

        Ok(meta)
    }

    async fn undelete_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut state = self.state.lock().await;
        let mut meta = UpdateMetadata::default();

        for (idx, &id) in ids.iter().enumerate() {
            let Some(record) = state.records.get(&id).cloned() else {
                meta.mark_error(idx, format!("record {id} does not exist"));
                continue;
            };
            match plan_status_change(&record, state.backup_top(id), StatusOperation::Undelete) {
                Ok(plan) => {
                    if let Err(err) = state.apply_status_plan(id, &plan) {
                        meta.mark_error(idx, err.to_string());
                        continue;
                    }
                }
                Err(err) => {
                    meta.mark_error(idx, err.to_string());
                    continue;
                }
            }

            // Cascade symmetrically over deleted descendants.
            for child in state.descendants_of(id) {
                let Some(child_record) = state.records.get(&child).cloned() else {
                    continue;
                };
                if child_record.status != RecordStatus::Deleted {
                    continue;
                }
                if let Ok(plan) = plan_status_change(
                    &child_record,
                    state.backup_top(child),
                    StatusOperation::Undelete,
                ) {
                    let _ = state.apply_status_plan(child, &plan);
                }
            }
            meta.mark_updated(idx);
        }

        Ok(meta)
    }

    // -- service engine support ------------------------------------------

    async fn service_queue(&self, limit: usize) -> Result<Vec<Id>> {
        let state = self.state.lock().await;
        let mut candidates: Vec<(&ServiceRow, &RecordRow)> = state
            .services
            .values()
            .filter_map(|s| state.records.get(&s.record_id).map(|r| (s, r)))
            .filter(|(_, r)| {
                matches!(r.status, RecordStatus::Waiting | RecordStatus::Running)
            })
            .collect();

        candidates.sort_by(|(sa, ra), (sb, rb)| {
            sb.compute_priority
                .cmp(&sa.compute_priority)
                .then(ra.modified_on.cmp(&rb.modified_on))
                .then(ra.id.cmp(&rb.id))
        });

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|(_, r)| r.id)
            .collect())
    }

    async fn load_service_iteration(&self, record_id: Id) -> Result<ServiceIterationData> {
        let state = self.state.lock().await;
        let record = state
            .records
            .get(&record_id)
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("record {record_id} does not exist")))?;
        let service = state
            .service_by_record
            .get(&record_id)
            .and_then(|sid| state.services.get(sid))
            .cloned()
            .ok_or_else(|| {
                ServerError::missing(format!("record {record_id} has no service row"))
            })?;
        let detail = state
            .details
            .get(&record_id)
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("record {record_id} has no detail")))?;

        let dependencies = state
            .service_deps
            .get(&service.id)
            .map(|deps| {
                deps.iter()
                    .map(|d| {
                        let status = state
                            .records
                            .get(&d.record_id)
                            .map(|r| r.status)
                            .unwrap_or(RecordStatus::Deleted);
                        ServiceDependencySnapshot {
                            record_id: d.record_id,
                            extras: d.extras.clone(),
                            status,
                            detail: (status == RecordStatus::Complete)
                                .then(|| state.details.get(&d.record_id).cloned())
                                .flatten(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ServiceIterationData {
            record,
            service,
            detail,
            dependencies,
        })
    }

    async fn apply_service_iteration(
        &self,
        record_id: Id,
        update: ServiceIterationUpdate,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let record = state
            .records
            .get(&record_id)
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("record {record_id} does not exist")))?;
        if !matches!(record.status, RecordStatus::Waiting | RecordStatus::Running) {
            return Err(ServerError::StateConflict(format!(
                "service record {record_id} is {} and cannot be iterated",
                record.status
            )));
        }

        let service_id = *state
            .service_by_record
            .get(&record_id)
            .ok_or_else(|| ServerError::missing(format!("record {record_id} has no service row")))?;

        // Startup: the first transition to running opens a history entry that
        // tracks the service engine's work on this record.
        if update.new_status == Some(RecordStatus::Running)
            && record.status == RecordStatus::Waiting
        {
            let hist_id = state.next_id();
            state
                .history
                .entry(record_id)
                .or_default()
                .push(ComputeHistoryEntry {
                    id: hist_id,
                    record_id,
                    status: RecordStatus::Running,
                    manager_name: None,
                    modified_on: now,
                    provenance: None,
                    outputs: BTreeMap::new(),
                });
        }

        if let Some(new_state) = update.new_state {
            if let Some(service) = state.services.get_mut(&service_id) {
                service.service_state = new_state;
            }
        }

        if let Some(new_deps) = update.replace_dependencies {
            let rows = new_deps
                .into_iter()
                .map(|d| {
                    let id = state.next_id();
                    ServiceDependencyRow {
                        id,
                        service_id,
                        record_id: d.record_id,
                        extras: d.extras,
                    }
                })
                .collect();
            state.service_deps.insert(service_id, rows);
        }

        if let Some(detail) = update.detail {
            state.details.insert(record_id, detail);
        }

        if let Some((output_type, text)) = update.append_output {
            if let Some(entry) = state.latest_history_mut(record_id) {
                let appended = match entry.outputs.get(&output_type) {
                    Some(existing) => {
                        let mut s = existing.decompress().unwrap_or_default();
                        s.push_str(&text);
                        s
                    }
                    None => text,
                };
                entry
                    .outputs
                    .insert(output_type, CompressedBlob::plain(&appended));
            }
        }

        match update.new_status {
            Some(RecordStatus::Running) => {
                let rec = state.records.get_mut(&record_id).expect("checked");
                rec.status = RecordStatus::Running;
                rec.modified_on = now;
            }
            Some(RecordStatus::Complete) => {
                if let Some(entry) = state.latest_history_mut(record_id) {
                    entry.status = RecordStatus::Complete;
                    entry.modified_on = now;
                }
                // Invariant: a live service row exists only for
                // waiting/running/error services.
                if let Some(sid) = state.service_by_record.remove(&record_id) {
                    state.services.remove(&sid);
                    state.service_deps.remove(&sid);
                }
                let rec = state.records.get_mut(&record_id).expect("checked");
                rec.status = RecordStatus::Complete;
                rec.modified_on = now;
            }
            Some(RecordStatus::Error) => {
                let error = update.error.unwrap_or(models::ComputeError {
                    error_type: "service_error".to_string(),
                    error_message: "service iteration failed".to_string(),
                });
                if let Some(entry) = state.latest_history_mut(record_id) {
                    entry.status = RecordStatus::Error;
                    entry.modified_on = now;
                    entry.outputs.insert(
                        OutputType::Error,
                        CompressedBlob::plain(&serde_json::to_string(&error)?),
                    );
                }
                let rec = state.records.get_mut(&record_id).expect("checked");
                rec.status = RecordStatus::Error;
                rec.modified_on = now;
            }
            Some(other) => {
                return Err(ServerError::Internal(format!(
                    "service iteration cannot transition to {other}"
                )));
            }
            None => {
                let rec = state.records.get_mut(&record_id).expect("checked");
                rec.modified_on = now;
            }
        }

        Ok(())
    }

    async fn sweep_stale_running(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let stale: Vec<Id> = state
            .records
            .values()
            .filter(|r| r.status == RecordStatus::Running)
            .filter(|r| !r.record_type.is_service())
            .filter(|r| match &r.manager_name {
                None => true,
                Some(name) => state
                    .manager_by_name
                    .get(name)
                    .and_then(|id| state.managers.get(id))
                    .map_or(true, |m| m.status != ManagerStatus::Active),
            })
            .map(|r| r.id)
            .collect();

        for id in &stale {
            let record = state.records.get_mut(id).expect("selected above");
            record.status = RecordStatus::Waiting;
            record.manager_name = None;
            record.modified_on = now;
            if let Some(task_id) = state.task_by_record.get(id).copied() {
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.available = true;
                }
            }
        }

        Ok(stale.len())
    }

    // -- internal jobs ----------------------------------------------------

    async fn add_internal_job(&self, job: NewInternalJob) -> Result<Id> {
        let mut state = self.state.lock().await;

        if let Some(unique) = &job.unique_name {
            if let Some(existing) = state
                .internal_jobs
                .values()
                .find(|j| {
                    j.unique_name.as_deref() == Some(unique.as_str())
                        && matches!(
                            j.status,
                            InternalJobStatus::Waiting | InternalJobStatus::Running
                        )
                })
                .map(|j| j.id)
            {
                return Ok(existing);
            }
        }

        let id = state.next_id();
        state.internal_jobs.insert(
            id,
            InternalJobRow {
                id,
                name: job.name,
                status: InternalJobStatus::Waiting,
                added_on: Utc::now(),
                scheduled_for: job.scheduled_for,
                started_on: None,
                last_updated: None,
                ended_on: None,
                runner_uuid: None,
                progress: 0,
                unique_name: job.unique_name,
                serial_group: job.serial_group,
                repeat_delay_seconds: job.repeat_delay_seconds,
                kwargs: job.kwargs,
                result: None,
            },
        );
        Ok(id)
    }

    async fn claim_internal_jobs(
        &self,
        runner_uuid: &str,
        limit: usize,
    ) -> Result<Vec<InternalJobRow>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let mut busy_groups: BTreeSet<String> = state
            .internal_jobs
            .values()
            .filter(|j| j.status == InternalJobStatus::Running)
            .filter_map(|j| j.serial_group.clone())
            .collect();

        let mut due: Vec<Id> = state
            .internal_jobs
            .values()
            .filter(|j| j.status == InternalJobStatus::Waiting && j.scheduled_for <= now)
            .map(|j| j.id)
            .collect();
        due.sort_by_key(|id| {
            state
                .internal_jobs
                .get(id)
                .map(|j| (j.scheduled_for, j.id))
                .expect("selected above")
        });

        let mut claimed = Vec::new();
        for id in due {
            if claimed.len() >= limit {
                break;
            }
            let job = state.internal_jobs.get_mut(&id).expect("selected above");
            if let Some(group) = &job.serial_group {
                if busy_groups.contains(group) {
                    continue;
                }
                busy_groups.insert(group.clone());
            }
            job.status = InternalJobStatus::Running;
            job.started_on = Some(now);
            job.last_updated = Some(now);
            job.runner_uuid = Some(runner_uuid.to_string());
            claimed.push(job.clone());
        }

        Ok(claimed)
    }

    async fn update_internal_job_progress(&self, id: Id, progress: i32) -> Result<bool> {
        let mut state = self.state.lock().await;
        let job = state
            .internal_jobs
            .get_mut(&id)
            .ok_or_else(|| ServerError::missing(format!("internal job {id} does not exist")))?;
        if job.status == InternalJobStatus::Cancelled {
            return Ok(true);
        }
        job.progress = progress.clamp(0, 100);
        job.last_updated = Some(Utc::now());
        Ok(false)
    }

    async fn finish_internal_job(
        &self,
        id: Id,
        status: InternalJobStatus,
        result: Option<Value>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let job = state
            .internal_jobs
            .get_mut(&id)
            .ok_or_else(|| ServerError::missing(format!("internal job {id} does not exist")))?;

        if job.status == InternalJobStatus::Cancelled {
            job.ended_on = Some(now);
            return Ok(());
        }

        match job.repeat_delay_seconds {
            Some(delay) if status != InternalJobStatus::Cancelled => {
                job.status = InternalJobStatus::Waiting;
                job.scheduled_for = now + Duration::seconds(delay);
                job.progress = 0;
                job.runner_uuid = None;
                job.started_on = None;
                job.last_updated = Some(now);
                job.result = result;
            }
            _ => {
                job.status = status;
                job.ended_on = Some(now);
                job.last_updated = Some(now);
                job.result = result;
            }
        }
        Ok(())
    }

    async fn cancel_internal_job(&self, id: Id) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state
            .internal_jobs
            .get_mut(&id)
            .ok_or_else(|| ServerError::missing(format!("internal job {id} does not exist")))?;
        if matches!(
            job.status,
            InternalJobStatus::Waiting | InternalJobStatus::Running
        ) {
            job.status = InternalJobStatus::Cancelled;
            job.last_updated = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_internal_job(&self, id: Id) -> Result<InternalJobRow> {
        let state = self.state.lock().await;
        state
            .internal_jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("internal job {id} does not exist")))
    }

    // -- datasets ---------------------------------------------------------

    async fn add_dataset(&self, dataset: NewDataset) -> Result<Id> {
        let mut state = self.state.lock().await;
        if state
            .datasets
            .values()
            .any(|d| d.dataset_type == dataset.dataset_type && d.name == dataset.name)
        {
            return Err(ServerError::StateConflict(format!(
                "{} dataset '{}' already exists",
                dataset.dataset_type, dataset.name
            )));
        }
        let id = state.next_id();
        state.datasets.insert(
            id,
            DatasetRow {
                id,
                dataset_type: dataset.dataset_type,
                name: dataset.name,
                description: dataset.description,
                default_compute_tag: models::normalize_name(&dataset.default_compute_tag),
                default_compute_priority: dataset.default_compute_priority,
                created_on: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get_dataset(&self, id: Id) -> Result<DatasetRow> {
        let state = self.state.lock().await;
        state
            .datasets
            .get(&id)
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("dataset {id} does not exist")))
    }

    async fn add_dataset_entries(
        &self,
        dataset_id: Id,
        entries: &[DatasetEntry],
    ) -> Result<InsertMetadata> {
        let mut state = self.state.lock().await;
        let dataset = state
            .datasets
            .get(&dataset_id)
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("dataset {dataset_id} does not exist")))?;

        let mut meta = InsertMetadata::default();
        for (idx, entry) in entries.iter().enumerate() {
            if entry.input.record_type() != dataset.dataset_type {
                meta.mark_error(
                    idx,
                    format!(
                        "entry '{}' is a {} input but the dataset holds {} records",
                        entry.name,
                        entry.input.record_type(),
                        dataset.dataset_type
                    ),
                );
                continue;
            }
            let existing = state
                .dataset_entries
                .get(&dataset_id)
                .map_or(false, |rows| rows.iter().any(|e| e.name == entry.name));
            if existing {
                meta.mark_existing(idx);
                continue;
            }
            state
                .dataset_entries
                .entry(dataset_id)
                .or_default()
                .push(entry.clone());
            meta.mark_inserted(idx);
        }
        Ok(meta)
    }

    async fn add_dataset_specifications(
        &self,
        dataset_id: Id,
        specs: &[DatasetSpecificationEntry],
    ) -> Result<InsertMetadata> {
        let mut state = self.state.lock().await;
        let dataset = state
            .datasets
            .get(&dataset_id)
            .cloned()
            .ok_or_else(|| ServerError::missing(format!("dataset {dataset_id} does not exist")))?;

        let mut meta = InsertMetadata::default();
        for (idx, spec) in specs.iter().enumerate() {
            if spec.specification.record_type() != dataset.dataset_type {
                meta.mark_error(
                    idx,
                    format!(
                        "specification '{}' is a {} specification but the dataset holds {} records",
                        spec.name,
                        spec.specification.record_type(),
                        dataset.dataset_type
                    ),
                );
                continue;
            }
            let existing = state
                .dataset_specs
                .get(&dataset_id)
                .map_or(false, |rows| rows.iter().any(|s| s.name == spec.name));
            if existing {
                meta.mark_existing(idx);
                continue;
            }
            state
                .dataset_specs
                .entry(dataset_id)
                .or_default()
                .push(spec.clone());
            meta.mark_inserted(idx);
        }
        Ok(meta)
    }

    async fn get_dataset_entries(&self, dataset_id: Id) -> Result<Vec<DatasetEntry>> {
        let state = self.state.lock().await;
        if !state.datasets.contains_key(&dataset_id) {
            return Err(ServerError::missing(format!(
                "dataset {dataset_id} does not exist"
            )));
        }
        Ok(state
            .dataset_entries
            .get(&dataset_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_dataset_specifications(
        &self,
        dataset_id: Id,
    ) -> Result<Vec<DatasetSpecificationEntry>> {
        let state = self.state.lock().await;
        if !state.datasets.contains_key(&dataset_id) {
            return Err(ServerError::missing(format!(
                "dataset {dataset_id} does not exist"
            )));
        }
        Ok(state
            .dataset_specs
            .get(&dataset_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn attach_dataset_records(
        &self,
        dataset_id: Id,
        items: &[(String, String, Id)],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let rows = state.dataset_records.entry(dataset_id).or_default();
        for (entry_name, spec_name, record_id) in items {
            let exists = rows
                .iter()
                .any(|r| &r.entry_name == entry_name && &r.specification_name == spec_name);
            if !exists {
                rows.push(DatasetRecordRow {
                    dataset_id,
                    entry_name: entry_name.clone(),
                    specification_name: spec_name.clone(),
                    record_id: *record_id,
                });
            }
        }
        Ok(())
    }

    async fn get_dataset_records(&self, dataset_id: Id) -> Result<Vec<DatasetRecordRow>> {
        let state = self.state.lock().await;
        Ok(state
            .dataset_records
            .get(&dataset_id)
            .cloned()
            .unwrap_or_default())
    }
}
