//! Postgres [`Store`] implementation.
//!
//! Every operation runs in one transaction. Multi-record mutations lock
//! their rows with `SELECT ... FOR UPDATE` in ascending id order; the claim
//! path locks candidates with `SKIP LOCKED` so concurrent managers never
//! observe the same task. Semantics shared with the in-memory backend (the
//! transition planner, claim ordering, task-spec construction) come from
//! the common kernel modules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};
use std::collections::{BTreeMap, BTreeSet};

use fractal_sql as sql;
use models::services::*;
use models::{
    ClaimedTask, ComputeHistoryEntry, ComputePriority, Id, InsertMetadata, KeywordSet,
    KeywordsUpload, ManagerActivation, ManagerResources, ManagerStatus, MoleculeIdentifiers,
    MoleculeUpload, OptimizationSpecification, OptimizationSpecificationInput, OutputType,
    ProjectionSpec, QcSpecification, QcSpecificationInput, QueryMetadata, RecordComment,
    RecordData, RecordDetail, RecordInput, RecordQueryFilters, RecordSpecification, RecordStatus,
    RecordType, Result, ResultEnvelope, ReturnOutcome, ServerError, ServiceData,
    ServiceDependencyData, TaskData, TaskResult, TaskSpec, UpdateMetadata,
};

use crate::config::AutoResetPolicy;
use crate::status::{plan_status_change, StatusOperation, StatusPlan, TaskEffect};
use crate::tasks::{programs_satisfied, WILDCARD_TAG};

use super::*;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn reject(reason: &str) -> ReturnOutcome {
    ReturnOutcome::Rejected {
        reason: reason.to_string(),
    }
}

fn base_to_row(row: sql::records::BaseRecordDbRow) -> RecordRow {
    RecordRow {
        id: Id(row.id),
        record_type: row.record_type,
        status: row.status,
        manager_name: row.manager_name,
        created_on: row.created_on,
        modified_on: row.modified_on,
        creator_user: row.creator_user,
    }
}

fn task_to_row(row: sql::tasks::TaskDbRow) -> Result<TaskRow> {
    Ok(TaskRow {
        id: Id(row.id),
        record_id: Id(row.record_id),
        spec: serde_json::from_value(row.spec.0)?,
        required_programs: serde_json::from_value(row.required_programs.0)?,
        compute_tag: row.compute_tag,
        compute_priority: row.compute_priority,
        available: row.available,
        created_on: row.created_on,
    })
}

fn service_to_row(row: sql::records::ServiceDbRow) -> ServiceRow {
    ServiceRow {
        id: Id(row.id),
        record_id: Id(row.record_id),
        service_state: row.service_state.0,
        compute_tag: row.compute_tag,
        compute_priority: row.compute_priority,
        find_existing: row.find_existing,
        created_on: row.created_on,
    }
}

fn manager_to_row(row: sql::managers::ManagerDbRow) -> Result<ManagerRow> {
    Ok(ManagerRow {
        id: Id(row.id),
        name: row.name,
        cluster: row.cluster,
        hostname: row.hostname,
        uuid: row.uuid,
        manager_version: row.manager_version,
        username: row.username,
        programs: serde_json::from_value(row.programs.0)?,
        tags: row.tags,
        status: row.status,
        claimed: row.claimed,
        successes: row.successes,
        failures: row.failures,
        rejected: row.rejected,
        resources: serde_json::from_value(row.resources.0)?,
        created_on: row.created_on,
        modified_on: row.modified_on,
    })
}

async fn fetch_history_entries(
    conn: &mut PgConnection,
    record_id: i64,
) -> Result<Vec<ComputeHistoryEntry>> {
    let rows = sql::records::fetch_history(conn, record_id).await?;
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let outputs = sql::records::fetch_outputs(conn, &ids).await?;

    let mut by_history: BTreeMap<i64, BTreeMap<OutputType, models::CompressedBlob>> =
        BTreeMap::new();
    for output in outputs {
        by_history.entry(output.history_id).or_default().insert(
            output.output_type,
            models::CompressedBlob {
                compression: output.compression,
                data: output.data,
            },
        );
    }

    Ok(rows
        .into_iter()
        .map(|r| ComputeHistoryEntry {
            id: Id(r.id),
            record_id: Id(r.record_id),
            status: r.status,
            manager_name: r.manager_name,
            modified_on: r.modified_on,
            provenance: r.provenance.map(|p| p.0),
            outputs: by_history.remove(&r.id).unwrap_or_default(),
        })
        .collect())
}

async fn resolve_molecule_upload(
    conn: &mut PgConnection,
    upload: &MoleculeUpload,
) -> Result<(bool, i64)> {
    match upload {
        MoleculeUpload::Id(id) => {
            if sql::content::molecule_exists(conn, id.0).await? {
                Ok((false, id.0))
            } else {
                Err(ServerError::missing(format!("molecule {id} does not exist")))
            }
        }
        MoleculeUpload::New(molecule) => {
            molecule.validate()?;
            let hash = molecule.structural_hash();
            let (inserted, id) = sql::content::upsert_molecule(conn, &hash, molecule).await?;
            Ok((inserted, id))
        }
    }
}

async fn resolve_keywords_upload(
    conn: &mut PgConnection,
    upload: &KeywordsUpload,
) -> Result<i64> {
    match upload {
        KeywordsUpload::Id(id) => {
            if sql::content::keyword_set_exists(conn, id.0).await? {
                Ok(id.0)
            } else {
                Err(ServerError::missing(format!(
                    "keyword set {id} does not exist"
                )))
            }
        }
        KeywordsUpload::New(kws) => {
            let normalized = kws.normalized();
            let hash = normalized.canonical_hash();
            let (_, id) = sql::content::upsert_keyword_set(conn, &hash, &normalized).await?;
            Ok(id)
        }
    }
}

async fn add_qc_spec(
    conn: &mut PgConnection,
    input: &QcSpecificationInput,
) -> Result<(bool, i64)> {
    input.validate()?;
    let keywords_id = resolve_keywords_upload(conn, &input.keywords).await?;

    let program = models::normalize_name(&input.program);
    let method = models::normalize_name(&input.method);
    let basis = models::normalize_basis(input.basis.as_deref());

    let hash = QcSpecification::tuple_hash(
        &program,
        input.driver,
        &method,
        basis.as_deref(),
        Id(keywords_id),
        &input.protocols,
    );
    let (inserted, id) = sql::content::upsert_qc_specification(
        conn,
        &hash,
        &program,
        input.driver,
        &method,
        basis.as_deref(),
        keywords_id,
        &input.protocols,
    )
    .await?;
    Ok((inserted, id))
}

async fn add_opt_spec(
    conn: &mut PgConnection,
    input: &OptimizationSpecificationInput,
) -> Result<(bool, i64)> {
    input.validate()?;
    let (_, qc_id) = add_qc_spec(conn, &input.qc_specification).await?;
    let program = models::normalize_name(&input.program);

    let hash = OptimizationSpecification::tuple_hash(
        &program,
        Id(qc_id),
        &input.keywords,
        &input.protocols,
    );
    let (inserted, id) = sql::content::upsert_optimization_specification(
        conn,
        &hash,
        &program,
        qc_id,
        &input.keywords,
        &input.protocols,
    )
    .await?;
    Ok((inserted, id))
}

async fn add_record_spec(conn: &mut PgConnection, spec: &RecordSpecification) -> Result<i64> {
    match spec {
        RecordSpecification::Singlepoint(s) => Ok(add_qc_spec(conn, s).await?.1),
        RecordSpecification::Optimization(s) => Ok(add_opt_spec(conn, s).await?.1),
        RecordSpecification::Torsiondrive(s) => {
            s.keywords.validate()?;
            let (_, opt_id) = add_opt_spec(conn, &s.optimization_specification).await?;
            let hash = TorsiondriveSpecification::tuple_hash(Id(opt_id), &s.keywords);
            let keywords = serde_json::to_value(&s.keywords)?;
            let (_, id) = sql::content::upsert_service_specification(
                conn,
                "torsiondrive_specification",
                &hash,
                None,
                Some(opt_id),
                Some(&keywords),
            )
            .await?;
            Ok(id)
        }
        RecordSpecification::Gridoptimization(s) => {
            s.keywords.validate()?;
            let (_, opt_id) = add_opt_spec(conn, &s.optimization_specification).await?;
            let hash = GridoptimizationSpecification::tuple_hash(Id(opt_id), &s.keywords);
            let keywords = serde_json::to_value(&s.keywords)?;
            let (_, id) = sql::content::upsert_service_specification(
                conn,
                "gridoptimization_specification",
                &hash,
                None,
                Some(opt_id),
                Some(&keywords),
            )
            .await?;
            Ok(id)
        }
        RecordSpecification::Manybody(s) => {
            let (_, qc_id) = add_qc_spec(conn, &s.qc_specification).await?;
            let hash = ManybodySpecification::tuple_hash(Id(qc_id), &s.keywords);
            let keywords = serde_json::to_value(&s.keywords)?;
            let (_, id) = sql::content::upsert_service_specification(
                conn,
                "manybody_specification",
                &hash,
                Some(qc_id),
                None,
                Some(&keywords),
            )
            .await?;
            Ok(id)
        }
        RecordSpecification::Reaction(s) => {
            s.validate()?;
            let qc_id = match &s.qc_specification {
                Some(qc) => Some(add_qc_spec(conn, qc).await?.1),
                None => None,
            };
            let opt_id = match &s.optimization_specification {
                Some(opt) => Some(add_opt_spec(conn, opt).await?.1),
                None => None,
            };
            let hash =
                ReactionSpecification::tuple_hash(qc_id.map(Id), opt_id.map(Id));
            let (_, id) = sql::content::upsert_service_specification(
                conn,
                "reaction_specification",
                &hash,
                qc_id,
                opt_id,
                None,
            )
            .await?;
            Ok(id)
        }
        RecordSpecification::Neb(s) => {
            s.validate()?;
            let (_, qc_id) = add_qc_spec(conn, &s.qc_specification).await?;
            let opt_id = match &s.optimization_specification {
                Some(opt) => Some(add_opt_spec(conn, opt).await?.1),
                None => None,
            };
            let hash = NebSpecification::tuple_hash(Id(qc_id), opt_id.map(Id), &s.keywords);
            let keywords = serde_json::to_value(&s.keywords)?;
            let (_, id) = sql::content::upsert_service_specification(
                conn,
                "neb_specification",
                &hash,
                Some(qc_id),
                opt_id,
                Some(&keywords),
            )
            .await?;
            Ok(id)
        }
    }
}

async fn load_qc_specification(conn: &mut PgConnection, id: i64) -> Result<QcSpecification> {
    let row = sql::content::fetch_qc_specification(conn, id)
        .await?
        .ok_or_else(|| ServerError::missing(format!("qc specification {id} does not exist")))?;
    Ok(QcSpecification {
        id: Id(row.id),
        program: row.program,
        driver: row.driver,
        method: row.method,
        basis: row.basis,
        keywords_id: Id(row.keywords_id),
        protocols: row.protocols.0,
    })
}

async fn load_optimization_specification(
    conn: &mut PgConnection,
    id: i64,
) -> Result<OptimizationSpecification> {
    let row = sql::content::fetch_optimization_specification(conn, id)
        .await?
        .ok_or_else(|| {
            ServerError::missing(format!("optimization specification {id} does not exist"))
        })?;
    Ok(OptimizationSpecification {
        id: Id(row.id),
        program: row.program,
        qc_specification_id: Id(row.qc_specification_id),
        keywords: row.keywords.0,
        protocols: row.protocols.0,
    })
}

async fn load_service_spec_row(
    conn: &mut PgConnection,
    table: &'static str,
    id: i64,
) -> Result<sql::content::ServiceSpecificationDbRow> {
    sql::content::fetch_service_specification(conn, table, id)
        .await?
        .ok_or_else(|| ServerError::missing(format!("{table} {id} does not exist")))
}

/// Resolve one submission input into (dedup key, detail). Mirrors the
/// in-memory resolution so both backends agree on record identity.
async fn resolve_record_input(
    conn: &mut PgConnection,
    spec_id: i64,
    input: &RecordInput,
) -> Result<(String, RecordDetail)> {
    let spec_id = Id(spec_id);
    match input {
        RecordInput::Singlepoint { molecule } => {
            let (_, mol_id) = resolve_molecule_upload(conn, molecule).await?;
            Ok((
                record_dedup_key(RecordType::Singlepoint, spec_id, &mol_id.to_string()),
                RecordDetail::Singlepoint {
                    specification_id: spec_id,
                    molecule_id: Id(mol_id),
                    return_result: None,
                    properties: None,
                },
            ))
        }
        RecordInput::Optimization { initial_molecule } => {
            let (_, mol_id) = resolve_molecule_upload(conn, initial_molecule).await?;
            Ok((
                record_dedup_key(RecordType::Optimization, spec_id, &mol_id.to_string()),
                RecordDetail::Optimization {
                    specification_id: spec_id,
                    initial_molecule_id: Id(mol_id),
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
                ids.push(Id(resolve_molecule_upload(conn, upload).await?.1));
            }
            ids.sort();
            ids.dedup();
            let key = ids
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            Ok((
                record_dedup_key(RecordType::Torsiondrive, spec_id, &key),
                RecordDetail::Torsiondrive {
                    specification_id: spec_id,
                    initial_molecule_ids: ids,
                    optimization_history: BTreeMap::new(),
                    minimum_optimizations: BTreeMap::new(),
                    final_energies: BTreeMap::new(),
                },
            ))
        }
        RecordInput::Gridoptimization { initial_molecule } => {
            let (_, mol_id) = resolve_molecule_upload(conn, initial_molecule).await?;
            Ok((
                record_dedup_key(RecordType::Gridoptimization, spec_id, &mol_id.to_string()),
                RecordDetail::Gridoptimization {
                    specification_id: spec_id,
                    initial_molecule_id: Id(mol_id),
                    starting_molecule_id: None,
                    grid_optimizations: BTreeMap::new(),
                },
            ))
        }
        RecordInput::Manybody { initial_molecule } => {
            let (_, mol_id) = resolve_molecule_upload(conn, initial_molecule).await?;
            let rows = sql::content::fetch_molecules(conn, &[mol_id]).await?;
            let molecule = rows
                .first()
                .ok_or_else(|| ServerError::missing("manybody molecule"))?;
            if molecule.molecule.fragments.len() < 2 {
                return Err(ServerError::InvalidPayload(
                    "manybody requires a molecule with at least two fragments".to_string(),
                ));
            }
            Ok((
                record_dedup_key(RecordType::Manybody, spec_id, &mol_id.to_string()),
                RecordDetail::Manybody {
                    specification_id: spec_id,
                    initial_molecule_id: Id(mol_id),
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
                let (_, mol_id) = resolve_molecule_upload(conn, &component.molecule).await?;
                components.push(models::ReactionComponentData {
                    coefficient: component.coefficient,
                    molecule_id: Id(mol_id),
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
                record_dedup_key(RecordType::Reaction, spec_id, &key_parts.join(",")),
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
                ids.push(Id(resolve_molecule_upload(conn, upload).await?.1));
            }
            let key = ids
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            Ok((
                record_dedup_key(RecordType::Neb, spec_id, &key),
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

/// Build a task payload for a leaf record's detail.
async fn build_task_spec(
    conn: &mut PgConnection,
    detail: &RecordDetail,
) -> Result<(TaskSpec, BTreeMap<String, Option<String>>)> {
    match detail {
        RecordDetail::Singlepoint {
            specification_id,
            molecule_id,
            ..
        } => {
            let spec = load_qc_specification(conn, specification_id.0).await?;
            let keywords = load_keyword_values(conn, spec.keywords_id.0).await?;
            let molecule = load_molecule(conn, molecule_id.0).await?;
            Ok(singlepoint_task_spec(&spec, &keywords, &molecule))
        }
        RecordDetail::Optimization {
            specification_id,
            initial_molecule_id,
            ..
        } => {
            let spec = load_optimization_specification(conn, specification_id.0).await?;
            let qc_spec = load_qc_specification(conn, spec.qc_specification_id.0).await?;
            let keywords = load_keyword_values(conn, qc_spec.keywords_id.0).await?;
            let molecule = load_molecule(conn, initial_molecule_id.0).await?;
            Ok(optimization_task_spec(&spec, &qc_spec, &keywords, &molecule))
        }
        other => Err(ServerError::Internal(format!(
            "{} records do not have tasks",
            other.record_type()
        ))),
    }
}

async fn load_keyword_values(
    conn: &mut PgConnection,
    id: i64,
) -> Result<BTreeMap<String, Value>> {
    let rows = sql::content::fetch_keyword_sets(conn, &[id]).await?;
    Ok(rows
        .into_iter()
        .next()
        .map(|r| r.keywords.0.values)
        .unwrap_or_default())
}

async fn load_molecule(conn: &mut PgConnection, id: i64) -> Result<models::Molecule> {
    let rows = sql::content::fetch_molecules(conn, &[id]).await?;
    rows.into_iter()
        .next()
        .map(|r| r.molecule.0)
        .ok_or_else(|| ServerError::missing(format!("molecule {id} does not exist")))
}

async fn create_task_row(
    conn: &mut PgConnection,
    record_id: i64,
    detail: &RecordDetail,
    compute_tag: &str,
    compute_priority: ComputePriority,
    available: bool,
) -> Result<()> {
    let (spec, required) = build_task_spec(conn, detail).await?;
    sql::tasks::insert_task(
        conn,
        record_id,
        &serde_json::to_value(&spec)?,
        &serde_json::to_value(&required)?,
        compute_tag,
        compute_priority,
        available,
    )
    .await?;
    Ok(())
}

/// Children of a record, from its detail plus its live service
/// dependencies.
async fn children_of(conn: &mut PgConnection, record_id: i64) -> Result<Vec<i64>> {
    let mut children: BTreeSet<Id> = BTreeSet::new();

    let rows = sql::records::fetch_base_records(conn, &[record_id]).await?;
    if let Some(row) = rows.into_iter().next() {
        match row.detail.0 {
            RecordDetail::Singlepoint { .. } => {}
            RecordDetail::Optimization { trajectory_ids, .. } => {
                children.extend(trajectory_ids);
            }
            RecordDetail::Torsiondrive {
                optimization_history,
                ..
            } => children.extend(optimization_history.into_values().flatten()),
            RecordDetail::Gridoptimization {
                grid_optimizations, ..
            } => children.extend(grid_optimizations.into_values()),
            RecordDetail::Manybody { clusters, .. } => {
                children.extend(clusters.into_iter().map(|c| c.singlepoint_id))
            }
            RecordDetail::Reaction { components, .. } => {
                for c in components {
                    children.extend(c.singlepoint_id);
                    children.extend(c.optimization_id);
                }
            }
            RecordDetail::Neb {
                image_singlepoint_ids,
                ts_optimization_id,
                endpoint_optimization_ids,
                ..
            } => {
                children.extend(image_singlepoint_ids);
                children.extend(ts_optimization_id);
                children.extend(endpoint_optimization_ids);
            }
        }
    }

    if let Some(service) = sql::records::fetch_service(conn, record_id).await? {
        for dep in sql::records::fetch_service_dependencies(conn, service.id).await? {
            children.insert(Id(dep.record_id));
        }
    }

    children.remove(&Id(record_id));
    Ok(children.into_iter().map(|i| i.0).collect())
}

async fn descendants_of(conn: &mut PgConnection, record_id: i64) -> Result<Vec<i64>> {
    let mut seen: BTreeSet<i64> = BTreeSet::new();
    let mut queue = children_of(conn, record_id).await?;
    while let Some(id) = queue.pop() {
        if seen.insert(id) {
            queue.extend(children_of(conn, id).await?);
        }
    }
    Ok(seen.into_iter().collect())
}

/// Apply a planned status change to a locked record row.
async fn apply_status_plan(
    conn: &mut PgConnection,
    record: &RecordRow,
    plan: &StatusPlan,
) -> Result<()> {
    let task = sql::tasks::fetch_task_by_record(conn, record.id.0).await?;
    let service = sql::records::fetch_service(conn, record.id.0).await?;

    let snapshot = task
        .as_ref()
        .map(|t| (t.compute_tag.clone(), t.compute_priority))
        .or_else(|| {
            service
                .as_ref()
                .map(|s| (s.compute_tag.clone(), s.compute_priority))
        });

    if let Some(old_status) = plan.push_backup {
        sql::records::push_info_backup(
            conn,
            record.id.0,
            old_status,
            snapshot.as_ref().map(|(t, _)| t.as_str()),
            snapshot.as_ref().map(|(_, p)| *p),
        )
        .await?;
    }

    let popped = if plan.pop_backup {
        let top = sql::records::peek_info_backup(conn, record.id.0).await?;
        if let Some(top) = &top {
            sql::records::pop_info_backup(conn, top.id).await?;
        }
        top
    } else {
        None
    };

    match plan.task_effect {
        TaskEffect::None => {}
        TaskEffect::Delete => sql::tasks::delete_task_by_record(conn, record.id.0).await?,
        TaskEffect::MakeAvailable => {
            if task.is_some() {
                sql::tasks::set_task_available(conn, record.id.0, true).await?;
            } else {
                let (tag, priority) = snapshot
                    .clone()
                    .unwrap_or_else(|| (WILDCARD_TAG.to_string(), ComputePriority::Normal));
                let detail = fetch_detail(conn, record.id.0).await?;
                create_task_row(conn, record.id.0, &detail, &tag, priority, true).await?;
            }
        }
        TaskEffect::Recreate { available } => {
            if task.is_some() {
                sql::tasks::set_task_available(conn, record.id.0, available).await?;
            } else {
                let (tag, priority) = popped
                    .as_ref()
                    .and_then(|b| {
                        b.compute_tag
                            .clone()
                            .map(|t| (t, b.compute_priority.unwrap_or_default()))
                    })
                    .unwrap_or_else(|| (WILDCARD_TAG.to_string(), ComputePriority::Normal));
                let detail = fetch_detail(conn, record.id.0).await?;
                create_task_row(conn, record.id.0, &detail, &tag, priority, available).await?;
            }
        }
    }

    let manager = if plan.clear_manager {
        None
    } else {
        record.manager_name.as_deref()
    };
    sql::records::update_record_status(conn, record.id.0, plan.new_status, manager).await?;
    Ok(())
}

async fn fetch_detail(conn: &mut PgConnection, record_id: i64) -> Result<RecordDetail> {
    let rows = sql::records::fetch_base_records(conn, &[record_id]).await?;
    rows.into_iter()
        .next()
        .map(|r| r.detail.0)
        .ok_or_else(|| ServerError::missing(format!("record {record_id} does not exist")))
}

async fn status_op_in_txn(
    conn: &mut PgConnection,
    ids: &[Id],
    op: StatusOperation,
) -> Result<UpdateMetadata> {
    let mut meta = UpdateMetadata::default();

    // Lock in ascending id order to avoid deadlocks; remember each input's
    // position for the metadata.
    let mut order: Vec<(usize, Id)> = ids.iter().copied().enumerate().collect();
    order.sort_by_key(|(_, id)| *id);

    for (idx, id) in order {
        let Some(row) = sql::records::lock_base_record(conn, id.0).await? else {
            meta.mark_error(idx, format!("record {id} does not exist"));
            continue;
        };
        let record = base_to_row(row);
        let backup_top = sql::records::peek_info_backup(conn, id.0)
            .await?
            .map(|b| b.old_status);

        match plan_status_change(&record, backup_top, op) {
            Ok(plan) => match apply_status_plan(conn, &record, &plan).await {
                Ok(()) => meta.mark_updated(idx),
                Err(err) => meta.mark_error(idx, err.to_string()),
            },
            Err(err) => meta.mark_error(idx, err.to_string()),
        }
    }

    Ok(meta)
}

async fn insert_complete_singlepoint(
    conn: &mut PgConnection,
    qc_spec_id: i64,
    molecule_id: i64,
    return_result: Value,
    properties: Option<Value>,
    manager_name: &str,
) -> Result<i64> {
    let detail = RecordDetail::Singlepoint {
        specification_id: Id(qc_spec_id),
        molecule_id: Id(molecule_id),
        return_result: Some(return_result),
        properties,
    };
    // Completed children are never claimable, so their dedup key is unique
    // per insertion rather than content-addressed.
    let dedup_key = format!("trajectory:{}", uuid::Uuid::new_v4());
    let record_id =
        sql::records::insert_base_record(conn, RecordType::Singlepoint, None, &dedup_key, &detail)
            .await?;
    sql::records::update_record_status(
        conn,
        record_id,
        RecordStatus::Complete,
        Some(manager_name),
    )
    .await?;
    sql::records::insert_history(conn, record_id, RecordStatus::Complete, Some(manager_name))
        .await?;
    Ok(record_id)
}

#[async_trait]
impl Store for PgStore {
    // -- content ----------------------------------------------------------

    async fn add_molecules(
        &self,
        molecules: &[MoleculeUpload],
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)> {
        let mut txn = self.pool.begin().await?;
        let mut meta = InsertMetadata::default();
        let mut ids = Vec::with_capacity(molecules.len());

        for (idx, upload) in molecules.iter().enumerate() {
            match resolve_molecule_upload(&mut txn, upload).await {
                Ok((true, id)) => {
                    meta.mark_inserted(idx);
                    ids.push(Some(Id(id)));
                }
                Ok((false, id)) => {
                    meta.mark_existing(idx);
                    ids.push(Some(Id(id)));
                }
                Err(err) => {
                    meta.mark_error(idx, err.to_string());
                    ids.push(None);
                }
            }
        }

        txn.commit().await?;
        Ok((meta, ids))
    }

    async fn get_molecules(
        &self,
        ids: &[Id],
        missing_ok: bool,
    ) -> Result<Vec<Option<MoleculeRow>>> {
        let mut conn = self.pool.acquire().await?;
        let raw: Vec<i64> = ids.iter().map(|i| i.0).collect();
        let rows = sql::content::fetch_molecules(&mut conn, &raw).await?;
        let by_id: BTreeMap<i64, sql::content::MoleculeDbRow> =
            rows.into_iter().map(|r| (r.id, r)).collect();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match by_id.get(&id.0) {
                Some(row) => out.push(Some(MoleculeRow {
                    id: *id,
                    hash: row.hash.clone(),
                    molecule: row.molecule.0.clone(),
                })),
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
        let mut conn = self.pool.acquire().await?;
        if !sql::content::update_molecule_identifiers(&mut conn, id.0, identifiers).await? {
            return Err(ServerError::missing(format!("molecule {id} does not exist")));
        }
        Ok(())
    }

    async fn add_keywords(
        &self,
        keywords: &[KeywordSet],
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)> {
        let mut txn = self.pool.begin().await?;
        let mut meta = InsertMetadata::default();
        let mut ids = Vec::with_capacity(keywords.len());

        for (idx, kws) in keywords.iter().enumerate() {
            let normalized = kws.normalized();
            let hash = normalized.canonical_hash();
            let (inserted, id) =
                sql::content::upsert_keyword_set(&mut txn, &hash, &normalized).await?;
            if inserted {
                meta.mark_inserted(idx);
            } else {
                meta.mark_existing(idx);
            }
            ids.push(Some(Id(id)));
        }

        txn.commit().await?;
        Ok((meta, ids))
    }

    async fn get_keywords(
        &self,
        ids: &[Id],
        missing_ok: bool,
    ) -> Result<Vec<Option<KeywordSetRow>>> {
        let mut conn = self.pool.acquire().await?;
        let raw: Vec<i64> = ids.iter().map(|i| i.0).collect();
        let rows = sql::content::fetch_keyword_sets(&mut conn, &raw).await?;
        let by_id: BTreeMap<i64, sql::content::KeywordSetDbRow> =
            rows.into_iter().map(|r| (r.id, r)).collect();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match by_id.get(&id.0) {
                Some(row) => out.push(Some(KeywordSetRow {
                    id: *id,
                    hash: row.hash.clone(),
                    keywords: row.keywords.0.clone(),
                })),
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
        let mut txn = self.pool.begin().await?;
        let mut meta = InsertMetadata::default();
        let mut ids = Vec::with_capacity(specs.len());

        for (idx, spec) in specs.iter().enumerate() {
            match add_qc_spec(&mut txn, spec).await {
                Ok((true, id)) => {
                    meta.mark_inserted(idx);
                    ids.push(Some(Id(id)));
                }
                Ok((false, id)) => {
                    meta.mark_existing(idx);
                    ids.push(Some(Id(id)));
                }
                Err(err) => {
                    meta.mark_error(idx, err.to_string());
                    ids.push(None);
                }
            }
        }

        txn.commit().await?;
        Ok((meta, ids))
    }

    async fn get_qc_specification(&self, id: Id) -> Result<QcSpecification> {
        let mut conn = self.pool.acquire().await?;
        load_qc_specification(&mut conn, id.0).await
    }

    async fn get_optimization_specification(&self, id: Id) -> Result<OptimizationSpecification> {
        let mut conn = self.pool.acquire().await?;
        load_optimization_specification(&mut conn, id.0).await
    }

    async fn get_torsiondrive_specification(&self, id: Id) -> Result<TorsiondriveSpecification> {
        let mut conn = self.pool.acquire().await?;
        let row = load_service_spec_row(&mut conn, "torsiondrive_specification", id.0).await?;
        Ok(TorsiondriveSpecification {
            id,
            optimization_specification_id: Id(row
                .optimization_specification_id
                .ok_or_else(|| ServerError::Internal("missing inner specification".into()))?),
            keywords: serde_json::from_value(
                row.keywords.map(|k| k.0).unwrap_or(Value::Null),
            )?,
        })
    }

    async fn get_gridoptimization_specification(
        &self,
        id: Id,
    ) -> Result<GridoptimizationSpecification> {
        let mut conn = self.pool.acquire().await?;
        let row = load_service_spec_row(&mut conn, "gridoptimization_specification", id.0).await?;
        Ok(GridoptimizationSpecification {
            id,
            optimization_specification_id: Id(row
                .optimization_specification_id
                .ok_or_else(|| ServerError::Internal("missing inner specification".into()))?),
            keywords: serde_json::from_value(
                row.keywords.map(|k| k.0).unwrap_or(Value::Null),
            )?,
        })
    }

    async fn get_manybody_specification(&self, id: Id) -> Result<ManybodySpecification> {
        let mut conn = self.pool.acquire().await?;
        let row = load_service_spec_row(&mut conn, "manybody_specification", id.0).await?;
        Ok(ManybodySpecification {
            id,
            qc_specification_id: Id(row
                .qc_specification_id
                .ok_or_else(|| ServerError::Internal("missing inner specification".into()))?),
            keywords: serde_json::from_value(
                row.keywords.map(|k| k.0).unwrap_or(Value::Null),
            )?,
        })
    }

    async fn get_reaction_specification(&self, id: Id) -> Result<ReactionSpecification> {
        let mut conn = self.pool.acquire().await?;
        let row = load_service_spec_row(&mut conn, "reaction_specification", id.0).await?;
        Ok(ReactionSpecification {
            id,
            qc_specification_id: row.qc_specification_id.map(Id),
            optimization_specification_id: row.optimization_specification_id.map(Id),
        })
    }

    async fn get_neb_specification(&self, id: Id) -> Result<NebSpecification> {
        let mut conn = self.pool.acquire().await?;
        let row = load_service_spec_row(&mut conn, "neb_specification", id.0).await?;
        Ok(NebSpecification {
            id,
            qc_specification_id: Id(row
                .qc_specification_id
                .ok_or_else(|| ServerError::Internal("missing inner specification".into()))?),
            optimization_specification_id: row.optimization_specification_id.map(Id),
            keywords: serde_json::from_value(
                row.keywords.map(|k| k.0).unwrap_or(Value::Null),
            )?,
        })
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

        let mut txn = self.pool.begin().await?;
        let spec_id = add_record_spec(&mut txn, spec).await?;
        let compute_tag = models::normalize_name(compute_tag);

        let mut meta = InsertMetadata::default();
        let mut ids = Vec::with_capacity(inputs.len());

        for (idx, input) in inputs.iter().enumerate() {
            let (key, detail) = match resolve_record_input(&mut txn, spec_id, input).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    meta.mark_error(idx, err.to_string());
                    ids.push(None);
                    continue;
                }
            };

            if find_existing {
                if let Some(existing) = sql::records::find_by_dedup_key(&mut txn, &key).await? {
                    meta.mark_existing(idx);
                    ids.push(Some(Id(existing)));
                    continue;
                }
            }

            let record_id = sql::records::insert_base_record(
                &mut txn,
                detail.record_type(),
                creator_user,
                &key,
                &detail,
            )
            .await?;

            if detail.record_type().is_service() {
                sql::records::insert_service(
                    &mut txn,
                    record_id,
                    &compute_tag,
                    compute_priority,
                    find_existing,
                )
                .await?;
            } else {
                create_task_row(
                    &mut txn,
                    record_id,
                    &detail,
                    &compute_tag,
                    compute_priority,
                    true,
                )
                .await?;
            }

            meta.mark_inserted(idx);
            ids.push(Some(Id(record_id)));
        }

        txn.commit().await?;
        Ok((meta, ids))
    }

    async fn get_records(
        &self,
        ids: &[Id],
        projection: &ProjectionSpec,
        missing_ok: bool,
    ) -> Result<Vec<Option<RecordData>>> {
        let mut conn = self.pool.acquire().await?;
        let raw: Vec<i64> = ids.iter().map(|i| i.0).collect();
        let rows = sql::records::fetch_base_records(&mut conn, &raw).await?;
        let by_id: BTreeMap<i64, sql::records::BaseRecordDbRow> =
            rows.into_iter().map(|r| (r.id, r)).collect();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(row) = by_id.get(&id.0) else {
                if missing_ok {
                    out.push(None);
                    continue;
                }
                return Err(ServerError::missing(format!("record {id} does not exist")));
            };

            let mut data = RecordData {
                id: *id,
                record_type: row.record_type,
                status: projection.wants_column("status").then_some(row.status),
                manager_name: if projection.wants_column("manager_name") {
                    row.manager_name.clone()
                } else {
                    None
                },
                created_on: projection
                    .wants_column("created_on")
                    .then_some(row.created_on),
                modified_on: projection
                    .wants_column("modified_on")
                    .then_some(row.modified_on),
                creator_user: if projection.wants_column("creator_user") {
                    row.creator_user.clone()
                } else {
                    None
                },
                detail: projection
                    .wants_column("detail")
                    .then(|| row.detail.0.clone()),
                compute_history: None,
                task: None,
                service: None,
                comments: None,
            };

            if projection.wants_relationship("compute_history") {
                data.compute_history = Some(fetch_history_entries(&mut conn, id.0).await?);
            }
            if projection.wants_relationship("task") {
                data.task = match sql::tasks::fetch_task_by_record(&mut conn, id.0).await? {
                    Some(t) => {
                        let t = task_to_row(t)?;
                        Some(TaskData {
                            id: t.id,
                            record_id: t.record_id,
                            spec: t.spec,
                            required_programs: t.required_programs,
                            compute_tag: t.compute_tag,
                            compute_priority: t.compute_priority,
                            available: t.available,
                            created_on: t.created_on,
                        })
                    }
                    None => None,
                };
            }
            if projection.wants_relationship("service") {
                data.service = match sql::records::fetch_service(&mut conn, id.0).await? {
                    Some(s) => {
                        let deps =
                            sql::records::fetch_service_dependencies(&mut conn, s.id).await?;
                        Some(ServiceData {
                            id: Id(s.id),
                            record_id: Id(s.record_id),
                            compute_tag: s.compute_tag,
                            compute_priority: s.compute_priority,
                            find_existing: s.find_existing,
                            created_on: s.created_on,
                            dependencies: deps
                                .into_iter()
                                .map(|d| ServiceDependencyData {
                                    record_id: Id(d.record_id),
                                    extras: d.extras.0,
                                })
                                .collect(),
                        })
                    }
                    None => None,
                };
            }
            if projection.wants_relationship("comments") {
                let comments = sql::records::fetch_comments(&mut conn, id.0).await?;
                data.comments = Some(
                    comments
                        .into_iter()
                        .map(|c| RecordComment {
                            id: Id(c.id),
                            record_id: Id(c.record_id),
                            username: c.username,
                            timestamp: c.timestamp,
                            comment: c.comment,
                        })
                        .collect(),
                );
            }

            out.push(Some(data));
        }
        Ok(out)
    }

    async fn query_records(
        &self,
        filters: &RecordQueryFilters,
    ) -> Result<(QueryMetadata, Vec<Id>)> {
        let mut conn = self.pool.acquire().await?;

        let record_types: Option<Vec<String>> = filters
            .record_type
            .as_ref()
            .map(|v| v.iter().map(|t| t.as_str().to_string()).collect());
        let statuses: Option<Vec<String>> = filters
            .status
            .as_ref()
            .map(|v| v.iter().map(|s| s.to_string()).collect());

        // Relationship filters resolve to id sets first.
        let mut id_filter: Option<BTreeSet<i64>> = None;
        let intersect = |set: BTreeSet<i64>, current: &mut Option<BTreeSet<i64>>| {
            *current = Some(match current.take() {
                None => set,
                Some(existing) => existing.intersection(&set).copied().collect(),
            });
        };

        if let Some(parents) = &filters.parent_id {
            let mut set = BTreeSet::new();
            for parent in parents {
                set.extend(children_of(&mut conn, parent.0).await?);
            }
            intersect(set, &mut id_filter);
        }
        if let Some(child_ids) = &filters.child_id {
            let all: Vec<i64> =
                sqlx::query_scalar("SELECT id FROM base_record ORDER BY id")
                    .fetch_all(&mut conn)
                    .await?;
            let mut set = BTreeSet::new();
            for candidate in all {
                let children = children_of(&mut conn, candidate).await?;
                if children.iter().any(|c| child_ids.contains(&Id(*c))) {
                    set.insert(candidate);
                }
            }
            intersect(set, &mut id_filter);
        }
        if let Some(dataset_ids) = &filters.dataset_id {
            let mut set = BTreeSet::new();
            for ds in dataset_ids {
                for item in sql::datasets::fetch_records(&mut conn, ds.0).await? {
                    set.insert(item.record_id);
                }
            }
            intersect(set, &mut id_filter);
        }
        let id_filter: Option<Vec<i64>> = id_filter.map(|s| s.into_iter().collect());

        const FILTER: &str = r#"
            WHERE ($1::TEXT[] IS NULL OR record_type::TEXT = ANY($1))
              AND ($2::TEXT[] IS NULL OR status::TEXT = ANY($2))
              AND ($3::TEXT[] IS NULL OR manager_name = ANY($3))
              AND ($4::TEXT[] IS NULL OR creator_user = ANY($4))
              AND ($5::TIMESTAMPTZ IS NULL OR created_on < $5)
              AND ($6::TIMESTAMPTZ IS NULL OR created_on > $6)
              AND ($7::TIMESTAMPTZ IS NULL OR modified_on < $7)
              AND ($8::TIMESTAMPTZ IS NULL OR modified_on > $8)
              AND ($9::BIGINT[] IS NULL OR id = ANY($9))
        "#;

        let count_sql = format!("SELECT COUNT(*) FROM base_record {FILTER}");
        let n_found: i64 = sqlx::query_scalar(&count_sql)
            .bind(&record_types)
            .bind(&statuses)
            .bind(&filters.manager_name)
            .bind(&filters.creator_user)
            .bind(filters.created_before)
            .bind(filters.created_after)
            .bind(filters.modified_before)
            .bind(filters.modified_after)
            .bind(&id_filter)
            .fetch_one(&mut conn)
            .await?;

        let page_sql =
            format!("SELECT id FROM base_record {FILTER} ORDER BY id OFFSET $10 LIMIT $11");
        let page: Vec<i64> = sqlx::query_scalar(&page_sql)
            .bind(&record_types)
            .bind(&statuses)
            .bind(&filters.manager_name)
            .bind(&filters.creator_user)
            .bind(filters.created_before)
            .bind(filters.created_after)
            .bind(filters.modified_before)
            .bind(filters.modified_after)
            .bind(&id_filter)
            .bind(filters.skip as i64)
            .bind(filters.limit.map(|l| l as i64).unwrap_or(i64::MAX))
            .fetch_all(&mut conn)
            .await?;

        Ok((
            QueryMetadata {
                n_found: n_found as usize,
                n_returned: page.len(),
            },
            page.into_iter().map(Id).collect(),
        ))
    }

    async fn get_record_row(&self, id: Id) -> Result<RecordRow> {
        let mut conn = self.pool.acquire().await?;
        let rows = sql::records::fetch_base_records(&mut conn, &[id.0]).await?;
        rows.into_iter()
            .next()
            .map(base_to_row)
            .ok_or_else(|| ServerError::missing(format!("record {id} does not exist")))
    }

    async fn get_record_detail(&self, id: Id) -> Result<RecordDetail> {
        let mut conn = self.pool.acquire().await?;
        fetch_detail(&mut conn, id.0).await
    }

    async fn get_compute_history(&self, record_id: Id) -> Result<Vec<ComputeHistoryEntry>> {
        let mut conn = self.pool.acquire().await?;
        fetch_history_entries(&mut conn, record_id.0).await
    }

    async fn get_task_row(&self, record_id: Id) -> Result<Option<TaskRow>> {
        let mut conn = self.pool.acquire().await?;
        match sql::tasks::fetch_task_by_record(&mut conn, record_id.0).await? {
            Some(row) => Ok(Some(task_to_row(row)?)),
            None => Ok(None),
        }
    }

    async fn get_service_row(&self, record_id: Id) -> Result<Option<ServiceRow>> {
        let mut conn = self.pool.acquire().await?;
        Ok(sql::records::fetch_service(&mut conn, record_id.0)
            .await?
            .map(service_to_row))
    }

    async fn get_service_dependencies(&self, record_id: Id) -> Result<Vec<ServiceDependencyRow>> {
        let mut conn = self.pool.acquire().await?;
        let Some(service) = sql::records::fetch_service(&mut conn, record_id.0).await? else {
            return Ok(Vec::new());
        };
        let deps = sql::records::fetch_service_dependencies(&mut conn, service.id).await?;
        Ok(deps
            .into_iter()
            .map(|d| ServiceDependencyRow {
                id: Id(d.id),
                service_id: Id(d.service_id),
                record_id: Id(d.record_id),
                extras: d.extras.0,
            })
            .collect())
    }

    async fn get_info_backup_depth(&self, record_id: Id) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        Ok(sql::records::info_backup_depth(&mut conn, record_id.0).await? as usize)
    }

    async fn add_comment(
        &self,
        record_id: Id,
        username: Option<&str>,
        comment: &str,
    ) -> Result<Id> {
        let mut conn = self.pool.acquire().await?;
        Ok(Id(
            sql::records::insert_comment(&mut conn, record_id.0, username, comment).await?,
        ))
    }

    async fn get_comments(&self, record_id: Id) -> Result<Vec<RecordComment>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sql::records::fetch_comments(&mut conn, record_id.0).await?;
        Ok(rows
            .into_iter()
            .map(|c| RecordComment {
                id: Id(c.id),
                record_id: Id(c.record_id),
                username: c.username,
                timestamp: c.timestamp,
                comment: c.comment,
            })
            .collect())
    }

    async fn get_children_ids(&self, record_id: Id) -> Result<Vec<Id>> {
        let mut conn = self.pool.acquire().await?;
        Ok(children_of(&mut conn, record_id.0)
            .await?
            .into_iter()
            .map(Id)
            .collect())
    }

    // -- task queue -------------------------------------------------------

    async fn claim_tasks(
        &self,
        manager_name: &str,
        programs: &BTreeMap<String, Option<String>>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<ClaimedTask>> {
        let mut txn = self.pool.begin().await?;

        let manager = sql::managers::lock_manager(&mut txn, manager_name)
            .await?
            .ok_or_else(|| {
                ServerError::compute_manager_shutdown(format!(
                    "manager {manager_name} does not exist"
                ))
            })?;
        if manager.status != ManagerStatus::Active {
            return Err(ServerError::compute_manager_shutdown(format!(
                "manager {manager_name} is not active"
            )));
        }

        let programs: BTreeMap<String, Option<String>> = programs
            .iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v.clone()))
            .collect();

        let mut claimed = Vec::new();
        for tag in tags {
            if claimed.len() >= limit {
                break;
            }
            let tag = tag.trim().to_lowercase();
            let tag_filter = if tag == WILDCARD_TAG {
                None
            } else {
                Some(tag.as_str())
            };

            // Lock more candidates than we need: program filtering happens
            // here, and unchosen rows unlock at commit.
            let candidates = sql::tasks::lock_claim_candidates(
                &mut txn,
                tag_filter,
                (limit * 4).max(32) as i64,
            )
            .await?;

            for candidate in candidates {
                if claimed.len() >= limit {
                    break;
                }
                if claimed.iter().any(|c: &ClaimedTask| c.task_id.0 == candidate.id) {
                    continue;
                }
                let task = task_to_row(candidate)?;
                if !programs_satisfied(&task.required_programs, &programs) {
                    continue;
                }

                sql::tasks::mark_claimed(&mut txn, task.id.0).await?;
                sql::records::update_record_status(
                    &mut txn,
                    task.record_id.0,
                    RecordStatus::Running,
                    Some(manager_name),
                )
                .await?;
                sql::records::insert_history(
                    &mut txn,
                    task.record_id.0,
                    RecordStatus::Running,
                    Some(manager_name),
                )
                .await?;

                claimed.push(ClaimedTask {
                    task_id: task.id,
                    record_id: task.record_id,
                    spec: task.spec,
                    required_programs: task.required_programs,
                    compute_tag: task.compute_tag,
                    compute_priority: task.compute_priority,
                });
            }
        }

        sql::managers::add_counters(&mut txn, manager_name, claimed.len() as i64, 0, 0, 0)
            .await?;
        txn.commit().await?;
        Ok(claimed)
    }

    async fn return_results(
        &self,
        manager_name: &str,
        results: Vec<(Id, ResultEnvelope)>,
        auto_reset: &AutoResetPolicy,
    ) -> Result<Vec<(Id, ReturnOutcome)>> {
        let mut txn = self.pool.begin().await?;

        if sql::managers::lock_manager(&mut txn, manager_name)
            .await?
            .is_none()
        {
            return Err(ServerError::compute_manager_shutdown(format!(
                "manager {manager_name} does not exist"
            )));
        }

        let mut outcomes = Vec::with_capacity(results.len());
        let (mut successes, mut failures, mut rejected) = (0i64, 0i64, 0i64);

        for (task_id, envelope) in results {
            let Some(task) = sql::tasks::fetch_task(&mut txn, task_id.0).await? else {
                outcomes.push((task_id, reject("task does not exist in task queue")));
                rejected += 1;
                continue;
            };
            let Some(record_row) =
                sql::records::lock_base_record(&mut txn, task.record_id).await?
            else {
                outcomes.push((task_id, reject("task does not exist in task queue")));
                rejected += 1;
                continue;
            };
            let record = base_to_row(record_row);

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

            let history_id = sql::records::latest_history_id(&mut txn, record.id.0)
                .await?
                .ok_or_else(|| {
                    ServerError::Internal(format!("running record {} has no history", record.id))
                })?;

            match envelope {
                ResultEnvelope::Success(payload) => {
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

                    let mut detail = fetch_detail(&mut txn, record.id.0).await?;
                    match payload.result {
                        TaskResult::Singlepoint {
                            return_result,
                            properties,
                        } => {
                            if let RecordDetail::Singlepoint {
                                return_result: rr,
                                properties: props,
                                ..
                            } = &mut detail
                            {
                                *rr = Some(return_result);
                                *props = Some(properties);
                            }
                            if let Some(wfn) = payload.wavefunction {
                                sql::records::upsert_wavefunction(
                                    &mut txn,
                                    record.id.0,
                                    wfn.compression,
                                    &wfn.data,
                                )
                                .await?;
                            }
                        }
                        TaskResult::Optimization {
                            final_molecule,
                            energies,
                            trajectory,
                        } => {
                            final_molecule.validate()?;
                            let hash = final_molecule.structural_hash();
                            let (_, final_id) =
                                sql::content::upsert_molecule(&mut txn, &hash, &final_molecule)
                                    .await?;

                            let qc_spec_id = match &detail {
                                RecordDetail::Optimization {
                                    specification_id, ..
                                } => {
                                    load_optimization_specification(&mut txn, specification_id.0)
                                        .await?
                                        .qc_specification_id
                                }
                                _ => unreachable!("type checked above"),
                            };

                            let mut traj_ids = Vec::with_capacity(trajectory.len());
                            for step in &trajectory {
                                step.molecule.validate()?;
                                let hash = step.molecule.structural_hash();
                                let (_, mol_id) =
                                    sql::content::upsert_molecule(&mut txn, &hash, &step.molecule)
                                        .await?;
                                let sp_id = insert_complete_singlepoint(
                                    &mut txn,
                                    qc_spec_id.0,
                                    mol_id,
                                    json!(step.energy),
                                    step.properties.clone(),
                                    manager_name,
                                )
                                .await?;
                                traj_ids.push(Id(sp_id));
                            }

                            if let RecordDetail::Optimization {
                                final_molecule_id,
                                energies: detail_energies,
                                trajectory_ids,
                                ..
                            } = &mut detail
                            {
                                *final_molecule_id = Some(Id(final_id));
                                *detail_energies = energies;
                                *trajectory_ids = traj_ids;
                            }
                        }
                    }

                    sql::records::update_record_detail(&mut txn, record.id.0, &detail).await?;
                    for (name, blob) in payload.native_files {
                        sql::records::upsert_native_file(
                            &mut txn,
                            record.id.0,
                            &name,
                            blob.compression,
                            &blob.data,
                        )
                        .await?;
                    }

                    sql::records::update_history(
                        &mut txn,
                        history_id,
                        RecordStatus::Complete,
                        Some(&json!(payload.provenance)),
                    )
                    .await?;
                    if let Some(stdout) = payload.stdout {
                        sql::records::upsert_output(
                            &mut txn,
                            history_id,
                            OutputType::Stdout,
                            stdout.compression,
                            &stdout.data,
                        )
                        .await?;
                    }
                    if let Some(stderr) = payload.stderr {
                        sql::records::upsert_output(
                            &mut txn,
                            history_id,
                            OutputType::Stderr,
                            stderr.compression,
                            &stderr.data,
                        )
                        .await?;
                    }

                    sql::tasks::delete_task_by_record(&mut txn, record.id.0).await?;
                    sql::records::update_record_status(
                        &mut txn,
                        record.id.0,
                        RecordStatus::Complete,
                        Some(manager_name),
                    )
                    .await?;

                    successes += 1;
                    outcomes.push((task_id, ReturnOutcome::Accepted));
                }

                ResultEnvelope::Failure(payload) => {
                    // Count earlier failures of this error type before
                    // recording the new one.
                    let prior = {
                        let entries = fetch_history_entries(&mut txn, record.id.0).await?;
                        entries
                            .iter()
                            .filter(|e| e.status == RecordStatus::Error)
                            .filter(|e| {
                                stored_error_type(&e.outputs).as_deref()
                                    == Some(payload.error.error_type.as_str())
                            })
                            .count() as u32
                    };

                    sql::records::update_history(&mut txn, history_id, RecordStatus::Error, None)
                        .await?;
                    let error_blob =
                        models::CompressedBlob::plain(&serde_json::to_string(&payload.error)?);
                    sql::records::upsert_output(
                        &mut txn,
                        history_id,
                        OutputType::Error,
                        error_blob.compression,
                        &error_blob.data,
                    )
                    .await?;
                    if let Some(stdout) = payload.stdout {
                        sql::records::upsert_output(
                            &mut txn,
                            history_id,
                            OutputType::Stdout,
                            stdout.compression,
                            &stdout.data,
                        )
                        .await?;
                    }
                    if let Some(stderr) = payload.stderr {
                        sql::records::upsert_output(
                            &mut txn,
                            history_id,
                            OutputType::Stderr,
                            stderr.compression,
                            &stderr.data,
                        )
                        .await?;
                    }

                    if auto_reset.should_reset(&payload.error.error_type, prior) {
                        sql::records::update_record_status(
                            &mut txn,
                            record.id.0,
                            RecordStatus::Waiting,
                            None,
                        )
                        .await?;
                        sql::tasks::set_task_available(&mut txn, record.id.0, true).await?;
                    } else {
                        sql::records::update_record_status(
                            &mut txn,
                            record.id.0,
                            RecordStatus::Error,
                            Some(manager_name),
                        )
                        .await?;
                    }

                    failures += 1;
                    outcomes.push((task_id, ReturnOutcome::Accepted));
                }
            }
        }

        sql::managers::add_counters(&mut txn, manager_name, 0, successes, failures, rejected)
            .await?;
        txn.commit().await?;
        Ok(outcomes)
    }

    async fn reset_assigned_tasks(&self, manager_names: &[String]) -> Result<usize> {
        let mut txn = self.pool.begin().await?;
        let reset = sql::tasks::reset_assigned(&mut txn, manager_names).await?;
        txn.commit().await?;
        Ok(reset.len())
    }

    // -- managers ---------------------------------------------------------

    async fn activate_manager(&self, activation: &ManagerActivation) -> Result<Id> {
        let (programs, tags) = activation.normalized()?;
        let name = activation.name.fullname();

        let mut conn = self.pool.acquire().await?;
        let inserted = sql::managers::insert_manager(
            &mut conn,
            &name,
            &activation.name.cluster,
            &activation.name.hostname,
            &activation.name.uuid,
            &activation.manager_version,
            activation.username.as_deref(),
            &serde_json::to_value(&programs)?,
            &tags,
        )
        .await?;

        inserted.map(Id).ok_or_else(|| {
            ServerError::compute_manager(format!("manager {name} already exists"))
        })
    }

    async fn manager_heartbeat(&self, name: &str, resources: &ManagerResources) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let manager = sql::managers::fetch_manager(&mut conn, name)
            .await?
            .ok_or_else(|| {
                ServerError::compute_manager_shutdown(format!("manager {name} does not exist"))
            })?;
        if manager.status != ManagerStatus::Active {
            return Err(ServerError::compute_manager_shutdown(format!(
                "manager {name} is not active"
            )));
        }
        sql::managers::update_heartbeat(&mut conn, name, &serde_json::to_value(resources)?)
            .await?;
        Ok(())
    }

    async fn deactivate_managers(&self, names: &[String]) -> Result<Vec<String>> {
        let mut txn = self.pool.begin().await?;
        let deactivated = sql::managers::deactivate(&mut txn, names).await?;
        if !deactivated.is_empty() {
            sql::tasks::reset_assigned(&mut txn, &deactivated).await?;
        }
        txn.commit().await?;
        Ok(deactivated)
    }

    async fn deactivate_managers_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let stale = {
            let mut conn = self.pool.acquire().await?;
            sql::managers::stale_manager_names(&mut conn, cutoff).await?
        };
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        self.deactivate_managers(&stale).await
    }

    async fn get_manager(&self, name: &str) -> Result<ManagerRow> {
        let mut conn = self.pool.acquire().await?;
        let row = sql::managers::fetch_manager(&mut conn, name)
            .await?
            .ok_or_else(|| ServerError::missing(format!("manager {name} does not exist")))?;
        manager_to_row(row)
    }

    async fn query_managers(
        &self,
        filters: &ManagerQueryFilters,
    ) -> Result<(QueryMetadata, Vec<ManagerRow>)> {
        let mut conn = self.pool.acquire().await?;
        let statuses: Option<Vec<String>> = filters.status.as_ref().map(|v| {
            v.iter()
                .map(|s| match s {
                    ManagerStatus::Active => "active".to_string(),
                    ManagerStatus::Inactive => "inactive".to_string(),
                })
                .collect()
        });

        let (n_found, rows) = sql::managers::query_managers(
            &mut conn,
            &sql::managers::ManagerQuery {
                name: filters.name.as_deref(),
                cluster: filters.cluster.as_deref(),
                hostname: filters.hostname.as_deref(),
                status: statuses.as_deref(),
                modified_before: filters.modified_before,
                modified_after: filters.modified_after,
                limit: filters.limit.map(|l| l as i64).unwrap_or(i64::MAX),
                skip: filters.skip as i64,
            },
        )
        .await?;

        let managers = rows
            .into_iter()
            .map(manager_to_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((
            QueryMetadata {
                n_found: n_found as usize,
                n_returned: managers.len(),
            },
            managers,
        ))
    }

    // -- status engine ----------------------------------------------------

    async fn reset_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut txn = self.pool.begin().await?;
        let meta = status_op_in_txn(&mut txn, ids, StatusOperation::Reset).await?;
        txn.commit().await?;
        Ok(meta)
    }

    async fn cancel_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut txn = self.pool.begin().await?;
        let meta = status_op_in_txn(&mut txn, ids, StatusOperation::Cancel).await?;
        txn.commit().await?;
        Ok(meta)
    }

    async fn uncancel_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut txn = self.pool.begin().await?;
        let meta = status_op_in_txn(&mut txn, ids, StatusOperation::Uncancel).await?;
        txn.commit().await?;
        Ok(meta)
    }

    async fn invalidate_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut txn = self.pool.begin().await?;
        let meta = status_op_in_txn(&mut txn, ids, StatusOperation::Invalidate).await?;
        txn.commit().await?;
        Ok(meta)
    }

    async fn uninvalidate_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut txn = self.pool.begin().await?;
        let meta = status_op_in_txn(&mut txn, ids, StatusOperation::Uninvalidate).await?;
        txn.commit().await?;
        Ok(meta)
    }

    async fn delete_records(
        &self,
        ids: &[Id],
        soft: bool,
        delete_children: bool,
    ) -> Result<UpdateMetadata> {
        let mut txn = self.pool.begin().await?;
        let mut meta = UpdateMetadata::default();

        for (idx, &id) in ids.iter().enumerate() {
            let Some(row) = sql::records::lock_base_record(&mut txn, id.0).await? else {
                meta.mark_error(idx, format!("record {id} does not exist"));
                continue;
            };
            let record = base_to_row(row);

            let targets: Vec<i64> = if delete_children {
                let mut t = vec![id.0];
                t.extend(descendants_of(&mut txn, id.0).await?);
                t
            } else {
                vec![id.0]
            };

            if soft {
                let backup_top = sql::records::peek_info_backup(&mut txn, id.0)
                    .await?
                    .map(|b| b.old_status);
                match plan_status_change(&record, backup_top, StatusOperation::SoftDelete) {
                    Ok(plan) => {
                        if let Err(err) = apply_status_plan(&mut txn, &record, &plan).await {
                            meta.mark_error(idx, err.to_string());
                            continue;
                        }
                    }
                    Err(err) => {
                        meta.mark_error(idx, err.to_string());
                        continue;
                    }
                }

                for child_id in targets.into_iter().skip(1) {
                    let Some(child_row) =
                        sql::records::lock_base_record(&mut txn, child_id).await?
                    else {
                        continue;
                    };
                    let child = base_to_row(child_row);
                    let backup = sql::records::peek_info_backup(&mut txn, child_id)
                        .await?
                        .map(|b| b.old_status);
                    if let Ok(plan) =
                        plan_status_change(&child, backup, StatusOperation::SoftDelete)
                    {
                        let _ = apply_status_plan(&mut txn, &child, &plan).await;
                    }
                }
            } else {
                for target in targets.into_iter().rev() {
                    sql::records::delete_base_record(&mut txn, target).await?;
                }
            }
            meta.mark_updated(idx);
        }

        txn.commit().await?;
        Ok(meta)
    }

    async fn undelete_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        let mut txn = self.pool.begin().await?;
        let mut meta = UpdateMetadata::default();

        for (idx, &id) in ids.iter().enumerate() {
            let Some(row) = sql::records::lock_base_record(&mut txn, id.0).await? else {
                meta.mark_error(idx, format!("record {id} does not exist"));
                continue;
            };
            let record = base_to_row(row);
            let backup_top = sql::records::peek_info_backup(&mut txn, id.0)
                .await?
                .map(|b| b.old_status);

            match plan_status_change(&record, backup_top, StatusOperation::Undelete) {
                Ok(plan) => {
                    if let Err(err) = apply_status_plan(&mut txn, &record, &plan).await {
                        meta.mark_error(idx, err.to_string());
                        continue;
                    }
                }
                Err(err) => {
                    meta.mark_error(idx, err.to_string());
                    continue;
                }
            }

            for child_id in descendants_of(&mut txn, id.0).await? {
                let Some(child_row) = sql::records::lock_base_record(&mut txn, child_id).await?
                else {
                    continue;
                };
                let child = base_to_row(child_row);
                if child.status != RecordStatus::Deleted {
                    continue;
                }
                let backup = sql::records::peek_info_backup(&mut txn, child_id)
                    .await?
                    .map(|b| b.old_status);
                if let Ok(plan) = plan_status_change(&child, backup, StatusOperation::Undelete) {
                    let _ = apply_status_plan(&mut txn, &child, &plan).await;
                }
            }
            meta.mark_updated(idx);
        }

        txn.commit().await?;
        Ok(meta)
    }

    // -- service engine support ------------------------------------------

    async fn service_queue(&self, limit: usize) -> Result<Vec<Id>> {
        let mut conn = self.pool.acquire().await?;
        Ok(sql::records::service_queue_batch(&mut conn, limit as i64)
            .await?
            .into_iter()
            .map(Id)
            .collect())
    }

    async fn load_service_iteration(&self, record_id: Id) -> Result<ServiceIterationData> {
        let mut conn = self.pool.acquire().await?;

        let record = sql::records::fetch_base_records(&mut conn, &[record_id.0])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServerError::missing(format!("record {record_id} does not exist")))?;
        let detail = record.detail.0.clone();
        let record = base_to_row(record);

        let service = sql::records::fetch_service(&mut conn, record_id.0)
            .await?
            .ok_or_else(|| {
                ServerError::missing(format!("record {record_id} has no service row"))
            })?;

        let dep_rows = sql::records::fetch_service_dependencies(&mut conn, service.id).await?;
        let dep_ids: Vec<i64> = dep_rows.iter().map(|d| d.record_id).collect();
        let dep_records = sql::records::fetch_base_records(&mut conn, &dep_ids).await?;
        let by_id: BTreeMap<i64, sql::records::BaseRecordDbRow> =
            dep_records.into_iter().map(|r| (r.id, r)).collect();

        let dependencies = dep_rows
            .into_iter()
            .map(|d| {
                let (status, dep_detail) = by_id
                    .get(&d.record_id)
                    .map(|r| (r.status, Some(r.detail.0.clone())))
                    .unwrap_or((RecordStatus::Deleted, None));
                ServiceDependencySnapshot {
                    record_id: Id(d.record_id),
                    extras: d.extras.0,
                    status,
                    detail: (status == RecordStatus::Complete)
                        .then_some(dep_detail)
                        .flatten(),
                }
            })
            .collect();

        Ok(ServiceIterationData {
            record,
            service: service_to_row(service),
            detail,
            dependencies,
        })
    }

    async fn apply_service_iteration(
        &self,
        record_id: Id,
        update: ServiceIterationUpdate,
    ) -> Result<()> {
        let mut txn = self.pool.begin().await?;

        let record = sql::records::lock_base_record(&mut txn, record_id.0)
            .await?
            .map(base_to_row)
            .ok_or_else(|| ServerError::missing(format!("record {record_id} does not exist")))?;
        if !matches!(
            record.status,
            RecordStatus::Waiting | RecordStatus::Running
        ) {
            return Err(ServerError::StateConflict(format!(
                "service record {record_id} is {} and cannot be iterated",
                record.status
            )));
        }

        let service = sql::records::fetch_service(&mut txn, record_id.0)
            .await?
            .ok_or_else(|| {
                ServerError::missing(format!("record {record_id} has no service row"))
            })?;

        if update.new_status == Some(RecordStatus::Running)
            && record.status == RecordStatus::Waiting
        {
            sql::records::insert_history(&mut txn, record_id.0, RecordStatus::Running, None)
                .await?;
        }

        if let Some(state) = &update.new_state {
            sql::records::update_service_state(&mut txn, service.id, state).await?;
        }

        if let Some(deps) = update.replace_dependencies {
            let rows: Vec<(i64, Value)> = deps
                .into_iter()
                .map(|d| (d.record_id.0, d.extras))
                .collect();
            sql::records::replace_service_dependencies(&mut txn, service.id, &rows).await?;
        }

        if let Some(detail) = &update.detail {
            sql::records::update_record_detail(&mut txn, record_id.0, detail).await?;
        }

        let history_id = sql::records::latest_history_id(&mut txn, record_id.0).await?;

        if let (Some((output_type, text)), Some(history_id)) =
            (&update.append_output, history_id)
        {
            // Append to the existing blob if one is present.
            let existing = sql::records::fetch_outputs(&mut txn, &[history_id]).await?;
            let appended = existing
                .into_iter()
                .find(|o| o.output_type == *output_type)
                .and_then(|o| {
                    models::CompressedBlob {
                        compression: o.compression,
                        data: o.data,
                    }
                    .decompress()
                    .ok()
                })
                .map(|mut s| {
                    s.push_str(text);
                    s
                })
                .unwrap_or_else(|| text.clone());
            let blob = models::CompressedBlob::plain(&appended);
            sql::records::upsert_output(&mut txn, history_id, *output_type, blob.compression, &blob.data)
                .await?;
        }

        match update.new_status {
            Some(RecordStatus::Running) => {
                sql::records::update_record_status(
                    &mut txn,
                    record_id.0,
                    RecordStatus::Running,
                    None,
                )
                .await?;
            }
            Some(RecordStatus::Complete) => {
                if let Some(history_id) = history_id {
                    sql::records::update_history(
                        &mut txn,
                        history_id,
                        RecordStatus::Complete,
                        None,
                    )
                    .await?;
                }
                sql::records::delete_service(&mut txn, record_id.0).await?;
                sql::records::update_record_status(
                    &mut txn,
                    record_id.0,
                    RecordStatus::Complete,
                    None,
                )
                .await?;
            }
            Some(RecordStatus::Error) => {
                let error = update.error.unwrap_or(models::ComputeError {
                    error_type: "service_error".to_string(),
                    error_message: "service iteration failed".to_string(),
                });
                if let Some(history_id) = history_id {
                    sql::records::update_history(&mut txn, history_id, RecordStatus::Error, None)
                        .await?;
                    let blob =
                        models::CompressedBlob::plain(&serde_json::to_string(&error)?);
                    sql::records::upsert_output(
                        &mut txn,
                        history_id,
                        OutputType::Error,
                        blob.compression,
                        &blob.data,
                    )
                    .await?;
                }
                sql::records::update_record_status(
                    &mut txn,
                    record_id.0,
                    RecordStatus::Error,
                    None,
                )
                .await?;
            }
            Some(other) => {
                return Err(ServerError::Internal(format!(
                    "service iteration cannot transition to {other}"
                )));
            }
            None => {
                sql::records::update_record_status(
                    &mut txn,
                    record_id.0,
                    record.status,
                    record.manager_name.as_deref(),
                )
                .await?;
            }
        }

        txn.commit().await?;
        Ok(())
    }

    async fn sweep_stale_running(&self) -> Result<usize> {
        let mut txn = self.pool.begin().await?;
        let reset = sql::tasks::reset_stale_running(&mut txn).await?;
        txn.commit().await?;
        Ok(reset.len())
    }

    // -- internal jobs ----------------------------------------------------

    async fn add_internal_job(&self, job: NewInternalJob) -> Result<Id> {
        let mut txn = self.pool.begin().await?;
        let id = sql::internal_jobs::insert_job(
            &mut txn,
            &job.name,
            job.scheduled_for,
            job.unique_name.as_deref(),
            job.serial_group.as_deref(),
            job.repeat_delay_seconds,
            &job.kwargs,
        )
        .await?;
        txn.commit().await?;
        Ok(Id(id))
    }

    async fn claim_internal_jobs(
        &self,
        runner_uuid: &str,
        limit: usize,
    ) -> Result<Vec<InternalJobRow>> {
        let mut txn = self.pool.begin().await?;
        let rows = sql::internal_jobs::claim_jobs(&mut txn, runner_uuid, limit as i64).await?;
        txn.commit().await?;

        rows.into_iter()
            .map(|r| {
                Ok(InternalJobRow {
                    id: Id(r.id),
                    name: r.name,
                    status: parse_job_status(&r.status)?,
                    added_on: r.added_on,
                    scheduled_for: r.scheduled_for,
                    started_on: r.started_on,
                    last_updated: r.last_updated,
                    ended_on: r.ended_on,
                    runner_uuid: r.runner_uuid,
                    progress: r.progress,
                    unique_name: r.unique_name,
                    serial_group: r.serial_group,
                    repeat_delay_seconds: r.repeat_delay_seconds,
                    kwargs: r.kwargs.0,
                    result: r.result.map(|j| j.0),
                })
            })
            .collect()
    }

    async fn update_internal_job_progress(&self, id: Id, progress: i32) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let status = sql::internal_jobs::update_progress(&mut conn, id.0, progress)
            .await?
            .ok_or_else(|| ServerError::missing(format!("internal job {id} does not exist")))?;
        Ok(status == "cancelled")
    }

    async fn finish_internal_job(
        &self,
        id: Id,
        status: InternalJobStatus,
        result: Option<Value>,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sql::internal_jobs::finish_job(
            &mut conn,
            id.0,
            job_status_str(status),
            result.as_ref(),
        )
        .await?;
        Ok(())
    }

    async fn cancel_internal_job(&self, id: Id) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sql::internal_jobs::cancel_job(&mut conn, id.0).await?;
        Ok(())
    }

    async fn get_internal_job(&self, id: Id) -> Result<InternalJobRow> {
        let mut conn = self.pool.acquire().await?;
        let r = sql::internal_jobs::fetch_job(&mut conn, id.0)
            .await?
            .ok_or_else(|| ServerError::missing(format!("internal job {id} does not exist")))?;
        Ok(InternalJobRow {
            id: Id(r.id),
            name: r.name,
            status: parse_job_status(&r.status)?,
            added_on: r.added_on,
            scheduled_for: r.scheduled_for,
            started_on: r.started_on,
            last_updated: r.last_updated,
            ended_on: r.ended_on,
            runner_uuid: r.runner_uuid,
            progress: r.progress,
            unique_name: r.unique_name,
            serial_group: r.serial_group,
            repeat_delay_seconds: r.repeat_delay_seconds,
            kwargs: r.kwargs.0,
            result: r.result.map(|j| j.0),
        })
    }

    // -- datasets ---------------------------------------------------------

    async fn add_dataset(&self, dataset: NewDataset) -> Result<Id> {
        let mut conn = self.pool.acquire().await?;
        let inserted = sql::datasets::insert_dataset(
            &mut conn,
            dataset.dataset_type,
            &dataset.name,
            &dataset.description,
            &models::normalize_name(&dataset.default_compute_tag),
            dataset.default_compute_priority,
        )
        .await?;
        inserted.map(Id).ok_or_else(|| {
            ServerError::StateConflict(format!(
                "{} dataset '{}' already exists",
                dataset.dataset_type, dataset.name
            ))
        })
    }

    async fn get_dataset(&self, id: Id) -> Result<DatasetRow> {
        let mut conn = self.pool.acquire().await?;
        let row = sql::datasets::fetch_dataset(&mut conn, id.0)
            .await?
            .ok_or_else(|| ServerError::missing(format!("dataset {id} does not exist")))?;
        Ok(DatasetRow {
            id: Id(row.id),
            dataset_type: row.dataset_type,
            name: row.name,
            description: row.description,
            default_compute_tag: row.default_compute_tag,
            default_compute_priority: row.default_compute_priority,
            created_on: row.created_on,
        })
    }

    async fn add_dataset_entries(
        &self,
        dataset_id: Id,
        entries: &[DatasetEntry],
    ) -> Result<InsertMetadata> {
        let mut txn = self.pool.begin().await?;
        let dataset = sql::datasets::fetch_dataset(&mut txn, dataset_id.0)
            .await?
            .ok_or_else(|| {
                ServerError::missing(format!("dataset {dataset_id} does not exist"))
            })?;

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
            let inserted = sql::datasets::insert_entry(
                &mut txn,
                dataset_id.0,
                &entry.name,
                entry.comment.as_deref(),
                &serde_json::to_value(&entry.input)?,
                &entry.attributes,
            )
            .await?;
            if inserted {
                meta.mark_inserted(idx);
            } else {
                meta.mark_existing(idx);
            }
        }

        txn.commit().await?;
        Ok(meta)
    }

    async fn add_dataset_specifications(
        &self,
        dataset_id: Id,
        specs: &[DatasetSpecificationEntry],
    ) -> Result<InsertMetadata> {
        let mut txn = self.pool.begin().await?;
        let dataset = sql::datasets::fetch_dataset(&mut txn, dataset_id.0)
            .await?
            .ok_or_else(|| {
                ServerError::missing(format!("dataset {dataset_id} does not exist"))
            })?;

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
            let inserted = sql::datasets::insert_specification(
                &mut txn,
                dataset_id.0,
                &spec.name,
                &serde_json::to_value(&spec.specification)?,
            )
            .await?;
            if inserted {
                meta.mark_inserted(idx);
            } else {
                meta.mark_existing(idx);
            }
        }

        txn.commit().await?;
        Ok(meta)
    }

    async fn get_dataset_entries(&self, dataset_id: Id) -> Result<Vec<DatasetEntry>> {
        let mut conn = self.pool.acquire().await?;
        if sql::datasets::fetch_dataset(&mut conn, dataset_id.0)
            .await?
            .is_none()
        {
            return Err(ServerError::missing(format!(
                "dataset {dataset_id} does not exist"
            )));
        }
        let rows = sql::datasets::fetch_entries(&mut conn, dataset_id.0).await?;
        rows.into_iter()
            .map(|r| {
                Ok(DatasetEntry {
                    name: r.name,
                    comment: r.comment,
                    input: serde_json::from_value(r.input.0)?,
                    attributes: r.attributes.0,
                })
            })
            .collect()
    }

    async fn get_dataset_specifications(
        &self,
        dataset_id: Id,
    ) -> Result<Vec<DatasetSpecificationEntry>> {
        let mut conn = self.pool.acquire().await?;
        if sql::datasets::fetch_dataset(&mut conn, dataset_id.0)
            .await?
            .is_none()
        {
            return Err(ServerError::missing(format!(
                "dataset {dataset_id} does not exist"
            )));
        }
        let rows = sql::datasets::fetch_specifications(&mut conn, dataset_id.0).await?;
        rows.into_iter()
            .map(|r| {
                Ok(DatasetSpecificationEntry {
                    name: r.name,
                    specification: serde_json::from_value(r.specification.0)?,
                })
            })
            .collect()
    }

    async fn attach_dataset_records(
        &self,
        dataset_id: Id,
        items: &[(String, String, Id)],
    ) -> Result<()> {
        let mut txn = self.pool.begin().await?;
        for (entry_name, spec_name, record_id) in items {
            sql::datasets::attach_record(&mut txn, dataset_id.0, entry_name, spec_name, record_id.0)
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn get_dataset_records(&self, dataset_id: Id) -> Result<Vec<DatasetRecordRow>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sql::datasets::fetch_records(&mut conn, dataset_id.0).await?;
        Ok(rows
            .into_iter()
            .map(|r| DatasetRecordRow {
                dataset_id: Id(r.dataset_id),
                entry_name: r.entry_name,
                specification_name: r.specification_name,
                record_id: Id(r.record_id),
            })
            .collect())
    }
}

fn job_status_str(status: InternalJobStatus) -> &'static str {
    match status {
        InternalJobStatus::Waiting => "waiting",
        InternalJobStatus::Running => "running",
        InternalJobStatus::Complete => "complete",
        InternalJobStatus::Error => "error",
        InternalJobStatus::Cancelled => "cancelled",
    }
}

fn parse_job_status(status: &str) -> Result<InternalJobStatus> {
    Ok(match status {
        "waiting" => InternalJobStatus::Waiting,
        "running" => InternalJobStatus::Running,
        "complete" => InternalJobStatus::Complete,
        "error" => InternalJobStatus::Error,
        "cancelled" => InternalJobStatus::Cancelled,
        other => {
            return Err(ServerError::Internal(format!(
                "unknown internal job status '{other}'"
            )))
        }
    })
}
