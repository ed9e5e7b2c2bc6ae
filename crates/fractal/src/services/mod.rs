//! The service iteration engine.
//!
//! A service record executes in small steps driven by the periodic
//! orchestrator: each call to [`iterate_service`] loads the persisted state,
//! inspects dependencies, and either waits, fails, spawns the next batch of
//! dependent records, or finalizes. State lives exclusively in the service
//! row's JSON column; nothing survives between ticks in memory.

use serde_json::{json, Value};

use models::{
    ComputeError, Id, KeywordsUpload, MoleculeUpload, OptimizationSpecificationInput,
    OutputType, QcSpecificationInput, RecordInput, RecordSpecification, RecordStatus, RecordType,
    Result, ServerError,
};

use crate::store::{
    NewServiceDependency, ServiceIterationData, ServiceIterationUpdate, ServiceRow, Store,
};

pub mod geometry;
mod gridoptimization;
mod manybody;
mod neb;
mod reaction;
mod torsiondrive;

/// What one iteration did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Dependencies are still waiting or running.
    NotReady,
    /// The service progressed and stays running.
    Running,
    Complete,
    Errored,
}

/// The planned effect of a startup or update step, produced by the
/// type-specific routines and applied atomically.
pub(crate) struct ServicePlan {
    pub state: Value,
    pub dependencies: Vec<NewServiceDependency>,
    pub detail: Option<models::RecordDetail>,
    pub stdout: Option<String>,
    pub finished: bool,
}

/// Drive one service iteration.
#[tracing::instrument(skip(store), fields(record_id = %record_id))]
pub async fn iterate_service(store: &dyn Store, record_id: Id) -> Result<IterationOutcome> {
    let data = store.load_service_iteration(record_id).await?;

    match data.record.status {
        RecordStatus::Waiting => {
            let plan = initialize(store, &data).await?;
            apply_plan(store, record_id, plan, Some(RecordStatus::Running)).await?;
            tracing::info!(record_type = %data.record.record_type, "service started");
            Ok(IterationOutcome::Running)
        }
        RecordStatus::Running => {
            if data
                .dependencies
                .iter()
                .any(|d| matches!(d.status, RecordStatus::Waiting | RecordStatus::Running))
            {
                return Ok(IterationOutcome::NotReady);
            }

            let failed: Vec<Id> = data
                .dependencies
                .iter()
                .filter(|d| d.status != RecordStatus::Complete)
                .map(|d| d.record_id)
                .collect();
            if !failed.is_empty() {
                let message = format!(
                    "service dependencies did not complete: {}",
                    failed
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                store
                    .apply_service_iteration(
                        record_id,
                        ServiceIterationUpdate {
                            new_status: Some(RecordStatus::Error),
                            error: Some(ComputeError {
                                error_type: "service_iteration_error".to_string(),
                                error_message: message,
                            }),
                            ..Default::default()
                        },
                    )
                    .await?;
                tracing::warn!(?failed, "service errored on failed dependencies");
                return Ok(IterationOutcome::Errored);
            }

            let plan = update(store, &data).await?;
            let finished = plan.finished;
            apply_plan(
                store,
                record_id,
                plan,
                finished.then_some(RecordStatus::Complete),
            )
            .await?;
            Ok(if finished {
                IterationOutcome::Complete
            } else {
                IterationOutcome::Running
            })
        }
        other => Err(ServerError::StateConflict(format!(
            "service record {record_id} is {other} and cannot be iterated"
        ))),
    }
}

async fn initialize(store: &dyn Store, data: &ServiceIterationData) -> Result<ServicePlan> {
    match data.record.record_type {
        RecordType::Torsiondrive => torsiondrive::initialize(store, data).await,
        RecordType::Gridoptimization => gridoptimization::initialize(store, data).await,
        RecordType::Manybody => manybody::initialize(store, data).await,
        RecordType::Reaction => reaction::initialize(store, data).await,
        RecordType::Neb => neb::initialize(store, data).await,
        leaf => Err(ServerError::Internal(format!(
            "{leaf} records are not services"
        ))),
    }
}

async fn update(store: &dyn Store, data: &ServiceIterationData) -> Result<ServicePlan> {
    match data.record.record_type {
        RecordType::Torsiondrive => torsiondrive::update(store, data).await,
        RecordType::Gridoptimization => gridoptimization::update(store, data).await,
        RecordType::Manybody => manybody::update(store, data).await,
        RecordType::Reaction => reaction::update(store, data).await,
        RecordType::Neb => neb::update(store, data).await,
        leaf => Err(ServerError::Internal(format!(
            "{leaf} records are not services"
        ))),
    }
}

async fn apply_plan(
    store: &dyn Store,
    record_id: Id,
    plan: ServicePlan,
    new_status: Option<RecordStatus>,
) -> Result<()> {
    store
        .apply_service_iteration(
            record_id,
            ServiceIterationUpdate {
                new_status,
                new_state: Some(plan.state),
                replace_dependencies: Some(plan.dependencies),
                detail: plan.detail,
                append_output: plan.stdout.map(|s| (OutputType::Stdout, s)),
                error: None,
            },
        )
        .await
}

// -- shared helpers for the type-specific modules ------------------------

/// Rebuild the input form of a stored QC specification (keywords by id).
pub(crate) async fn qc_spec_input(store: &dyn Store, id: Id) -> Result<QcSpecificationInput> {
    let spec = store.get_qc_specification(id).await?;
    Ok(QcSpecificationInput {
        program: spec.program,
        driver: spec.driver,
        method: spec.method,
        basis: spec.basis,
        keywords: KeywordsUpload::Id(spec.keywords_id),
        protocols: spec.protocols,
    })
}

/// Rebuild the input form of a stored optimization specification.
pub(crate) async fn opt_spec_input(
    store: &dyn Store,
    id: Id,
) -> Result<OptimizationSpecificationInput> {
    let spec = store.get_optimization_specification(id).await?;
    let qc = qc_spec_input(store, spec.qc_specification_id).await?;
    Ok(OptimizationSpecificationInput {
        program: spec.program,
        qc_specification: qc,
        keywords: spec.keywords,
        protocols: spec.protocols,
    })
}

/// Merge constraint entries into an optimizer keyword block, under
/// `constraints.set`.
pub(crate) fn with_constraints(keywords: &Value, constraints: Vec<Value>) -> Value {
    let mut keywords = match keywords {
        Value::Object(_) => keywords.clone(),
        _ => json!({}),
    };
    let map = keywords.as_object_mut().expect("object by construction");
    let constraint_obj = map
        .entry("constraints".to_string())
        .or_insert_with(|| json!({}));
    if !constraint_obj.is_object() {
        *constraint_obj = json!({});
    }
    let set = constraint_obj
        .as_object_mut()
        .expect("object by construction")
        .entry("set".to_string())
        .or_insert_with(|| json!([]));
    if let Value::Array(items) = set {
        items.extend(constraints);
    }
    keywords
}

/// Submit one dependent optimization with the service's tag, priority, and
/// find_existing setting.
pub(crate) async fn submit_optimization(
    store: &dyn Store,
    service: &ServiceRow,
    spec: OptimizationSpecificationInput,
    molecule: MoleculeUpload,
) -> Result<Id> {
    let (meta, ids) = store
        .add_records(
            &RecordSpecification::Optimization(spec),
            &[RecordInput::Optimization {
                initial_molecule: molecule,
            }],
            &service.compute_tag,
            service.compute_priority,
            None,
            service.find_existing,
        )
        .await?;
    if !meta.success() {
        return Err(ServerError::Internal(format!(
            "failed to add dependent optimization: {}",
            meta.error_string()
        )));
    }
    ids[0].ok_or_else(|| ServerError::Internal("dependent optimization has no id".to_string()))
}

/// Submit one dependent single-point.
pub(crate) async fn submit_singlepoint(
    store: &dyn Store,
    service: &ServiceRow,
    spec: QcSpecificationInput,
    molecule: MoleculeUpload,
) -> Result<Id> {
    let (meta, ids) = store
        .add_records(
            &RecordSpecification::Singlepoint(spec),
            &[RecordInput::Singlepoint { molecule }],
            &service.compute_tag,
            service.compute_priority,
            None,
            service.find_existing,
        )
        .await?;
    if !meta.success() {
        return Err(ServerError::Internal(format!(
            "failed to add dependent singlepoint: {}",
            meta.error_string()
        )));
    }
    ids[0].ok_or_else(|| ServerError::Internal("dependent singlepoint has no id".to_string()))
}

/// Pull the final molecule and last energy out of a completed optimization
/// dependency's detail.
pub(crate) fn optimization_outcome(detail: &models::RecordDetail) -> Result<(Id, f64)> {
    match detail {
        models::RecordDetail::Optimization {
            final_molecule_id: Some(final_id),
            energies,
            ..
        } => {
            let energy = energies
                .last()
                .copied()
                .ok_or_else(|| ServerError::Internal("optimization has no energies".to_string()))?;
            Ok((*final_id, energy))
        }
        _ => Err(ServerError::Internal(
            "dependency is not a completed optimization".to_string(),
        )),
    }
}

/// Pull the scalar energy out of a completed single-point dependency.
pub(crate) fn singlepoint_energy(detail: &models::RecordDetail) -> Result<f64> {
    match detail {
        models::RecordDetail::Singlepoint {
            return_result: Some(value),
            ..
        } => value.as_f64().ok_or_else(|| {
            ServerError::Internal("singlepoint return_result is not a scalar energy".to_string())
        }),
        _ => Err(ServerError::Internal(
            "dependency is not a completed singlepoint".to_string(),
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constraints_merge_into_existing_keywords() {
        let base = json!({"maxiter": 50, "constraints": {"set": [{"type": "distance"}]}});
        let merged = with_constraints(
            &base,
            vec![json!({"type": "dihedral", "indices": [0, 1, 2, 3], "value": 90.0})],
        );
        let set = merged["constraints"]["set"].as_array().unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(merged["maxiter"], 50);

        let fresh = with_constraints(&Value::Null, vec![json!({"type": "distance"})]);
        assert_eq!(fresh["constraints"]["set"].as_array().unwrap().len(), 1);
    }
}
