//! Reaction energies: a stoichiometric sum over component energies.
//!
//! Components carrying an optimization specification are relaxed first;
//! when a QC specification is present, a single-point on the (possibly
//! optimized) geometry supplies the component energy, otherwise the last
//! optimization energy does. The total is `sum(coefficient * energy)`.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use models::{
    Id, MoleculeUpload, ReactionComponentData, RecordDetail, Result, ServerError,
};

use super::{
    opt_spec_input, optimization_outcome, qc_spec_input, singlepoint_energy, submit_optimization,
    submit_singlepoint, ServicePlan,
};
use crate::store::{NewServiceDependency, ServiceIterationData, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Phase {
    Optimizations,
    Singlepoints,
}

#[derive(Debug, Serialize, Deserialize)]
struct RxnState {
    phase: Phase,
    qc_specification_id: Option<Id>,
    optimization_specification_id: Option<Id>,
}

fn unpack_detail(detail: &RecordDetail) -> Result<(Id, Vec<ReactionComponentData>)> {
    match detail {
        RecordDetail::Reaction {
            specification_id,
            components,
            ..
        } => Ok((*specification_id, components.clone())),
        _ => Err(ServerError::Internal(
            "record detail is not a reaction".to_string(),
        )),
    }
}

/// Dispatch singlepoints for every component, on the optimized geometry when
/// one exists.
async fn dispatch_singlepoints(
    store: &dyn Store,
    data: &ServiceIterationData,
    qc_specification_id: Id,
    components: &mut [ReactionComponentData],
    optimized: &BTreeMap<usize, Id>,
) -> Result<Vec<NewServiceDependency>> {
    let qc_input = qc_spec_input(store, qc_specification_id).await?;
    let mut dependencies = Vec::new();

    for (idx, component) in components.iter_mut().enumerate() {
        let molecule_id = optimized.get(&idx).copied().unwrap_or(component.molecule_id);
        let sp_id = submit_singlepoint(
            store,
            &data.service,
            qc_input.clone(),
            MoleculeUpload::Id(molecule_id),
        )
        .await?;
        component.singlepoint_id = Some(sp_id);
        dependencies.push(NewServiceDependency {
            record_id: sp_id,
            extras: json!({ "component": idx, "stage": "singlepoint" }),
        });
    }

    Ok(dependencies)
}

pub(crate) async fn initialize(
    store: &dyn Store,
    data: &ServiceIterationData,
) -> Result<ServicePlan> {
    let (spec_id, mut components) = unpack_detail(&data.detail)?;
    let spec = store.get_reaction_specification(spec_id).await?;

    let mut state = RxnState {
        phase: Phase::Optimizations,
        qc_specification_id: spec.qc_specification_id,
        optimization_specification_id: spec.optimization_specification_id,
    };

    let dependencies = if let Some(opt_spec_id) = spec.optimization_specification_id {
        let opt_input = opt_spec_input(store, opt_spec_id).await?;
        let mut dependencies = Vec::new();
        for (idx, component) in components.iter_mut().enumerate() {
            let opt_id = submit_optimization(
                store,
                &data.service,
                opt_input.clone(),
                MoleculeUpload::Id(component.molecule_id),
            )
            .await?;
            component.optimization_id = Some(opt_id);
            dependencies.push(NewServiceDependency {
                record_id: opt_id,
                extras: json!({ "component": idx, "stage": "optimization" }),
            });
        }
        dependencies
    } else {
        state.phase = Phase::Singlepoints;
        let qc_spec_id = spec
            .qc_specification_id
            .ok_or_else(|| ServerError::Internal("reaction has no specifications".to_string()))?;
        dispatch_singlepoints(store, data, qc_spec_id, &mut components, &BTreeMap::new()).await?
    };

    let stdout = format!(
        "Starting reaction over {} component(s)\n",
        components.len()
    );

    Ok(ServicePlan {
        state: serde_json::to_value(&state)?,
        dependencies,
        detail: Some(RecordDetail::Reaction {
            specification_id: spec_id,
            components,
            total_energy: None,
        }),
        stdout: Some(stdout),
        finished: false,
    })
}

pub(crate) async fn update(
    store: &dyn Store,
    data: &ServiceIterationData,
) -> Result<ServicePlan> {
    let mut state: RxnState = serde_json::from_value(data.service.service_state.clone())
        .map_err(|e| ServerError::Internal(format!("corrupt reaction state: {e}")))?;
    let (spec_id, mut components) = unpack_detail(&data.detail)?;

    match state.phase {
        Phase::Optimizations => {
            // Collect optimized geometries and energies per component.
            let mut optimized: BTreeMap<usize, Id> = BTreeMap::new();
            for dep in &data.dependencies {
                let idx = dep
                    .extras
                    .get("component")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| {
                        ServerError::Internal("dependency missing component index".to_string())
                    })? as usize;
                let detail = dep.detail.as_ref().ok_or_else(|| {
                    ServerError::Internal("complete dependency has no detail".to_string())
                })?;
                let (final_molecule_id, energy) = optimization_outcome(detail)?;
                optimized.insert(idx, final_molecule_id);
                if let Some(component) = components.get_mut(idx) {
                    component.energy = Some(energy);
                }
            }

            if let Some(qc_spec_id) = state.qc_specification_id {
                let dependencies =
                    dispatch_singlepoints(store, data, qc_spec_id, &mut components, &optimized)
                        .await?;
                state.phase = Phase::Singlepoints;
                return Ok(ServicePlan {
                    state: serde_json::to_value(&state)?,
                    dependencies,
                    detail: Some(RecordDetail::Reaction {
                        specification_id: spec_id,
                        components,
                        total_energy: None,
                    }),
                    stdout: Some(
                        "Component optimizations finished; dispatching singlepoints\n".to_string(),
                    ),
                    finished: false,
                });
            }

            // Optimization-only reaction: the last energies are the
            // component energies.
            finalize(spec_id, state, components)
        }
        Phase::Singlepoints => {
            for dep in &data.dependencies {
                let idx = dep
                    .extras
                    .get("component")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| {
                        ServerError::Internal("dependency missing component index".to_string())
                    })? as usize;
                let detail = dep.detail.as_ref().ok_or_else(|| {
                    ServerError::Internal("complete dependency has no detail".to_string())
                })?;
                if let Some(component) = components.get_mut(idx) {
                    component.energy = Some(singlepoint_energy(detail)?);
                }
            }
            finalize(spec_id, state, components)
        }
    }
}

fn finalize(
    spec_id: Id,
    state: RxnState,
    components: Vec<ReactionComponentData>,
) -> Result<ServicePlan> {
    let mut total = 0.0;
    for component in &components {
        let energy = component.energy.ok_or_else(|| {
            ServerError::Internal("reaction component has no energy".to_string())
        })?;
        total += component.coefficient * energy;
    }

    Ok(ServicePlan {
        state: serde_json::to_value(&state)?,
        dependencies: Vec::new(),
        detail: Some(RecordDetail::Reaction {
            specification_id: spec_id,
            components,
            total_energy: Some(total),
        }),
        stdout: Some(format!("Reaction finished: total energy {total:.10}\n")),
        finished: true,
    })
}
