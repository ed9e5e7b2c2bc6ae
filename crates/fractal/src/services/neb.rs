//! Nudged elastic band: single-points across an image chain, then optional
//! endpoint and transition-state optimizations.
//!
//! The chain single-points establish per-image energies; the image with the
//! highest energy is the transition-state guess. Endpoint optimizations run
//! before the TS optimization when both are requested.

use serde::{Deserialize, Serialize};
use serde_json::json;

use models::{Id, MoleculeUpload, RecordDetail, Result, ServerError};

use super::{
    opt_spec_input, qc_spec_input, singlepoint_energy, submit_optimization, submit_singlepoint,
    ServicePlan,
};
use crate::store::{NewServiceDependency, ServiceIterationData, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Phase {
    ChainSinglepoints,
    EndpointOptimizations,
    TsOptimization,
}

#[derive(Debug, Serialize, Deserialize)]
struct NebState {
    phase: Phase,
    qc_specification_id: Id,
    optimization_specification_id: Option<Id>,
    optimize_endpoints: bool,
    optimize_ts: bool,
    ts_image: Option<usize>,
}

struct NebDetail {
    specification_id: Id,
    chain_molecule_ids: Vec<Id>,
    image_singlepoint_ids: Vec<Id>,
    image_energies: Vec<f64>,
    ts_optimization_id: Option<Id>,
    endpoint_optimization_ids: Vec<Id>,
}

fn unpack_detail(detail: &RecordDetail) -> Result<NebDetail> {
    match detail {
        RecordDetail::Neb {
            specification_id,
            chain_molecule_ids,
            image_singlepoint_ids,
            image_energies,
            ts_optimization_id,
            endpoint_optimization_ids,
        } => Ok(NebDetail {
            specification_id: *specification_id,
            chain_molecule_ids: chain_molecule_ids.clone(),
            image_singlepoint_ids: image_singlepoint_ids.clone(),
            image_energies: image_energies.clone(),
            ts_optimization_id: *ts_optimization_id,
            endpoint_optimization_ids: endpoint_optimization_ids.clone(),
        }),
        _ => Err(ServerError::Internal(
            "record detail is not a neb".to_string(),
        )),
    }
}

fn pack_detail(d: NebDetail) -> RecordDetail {
    RecordDetail::Neb {
        specification_id: d.specification_id,
        chain_molecule_ids: d.chain_molecule_ids,
        image_singlepoint_ids: d.image_singlepoint_ids,
        image_energies: d.image_energies,
        ts_optimization_id: d.ts_optimization_id,
        endpoint_optimization_ids: d.endpoint_optimization_ids,
    }
}

pub(crate) async fn initialize(
    store: &dyn Store,
    data: &ServiceIterationData,
) -> Result<ServicePlan> {
    let mut detail = unpack_detail(&data.detail)?;
    let spec = store.get_neb_specification(detail.specification_id).await?;

    let state = NebState {
        phase: Phase::ChainSinglepoints,
        qc_specification_id: spec.qc_specification_id,
        optimization_specification_id: spec.optimization_specification_id,
        optimize_endpoints: spec.keywords.optimize_endpoints,
        optimize_ts: spec.keywords.optimize_ts,
        ts_image: None,
    };

    let qc_input = qc_spec_input(store, spec.qc_specification_id).await?;
    let mut dependencies = Vec::new();
    detail.image_singlepoint_ids.clear();

    for (idx, &molecule_id) in detail.chain_molecule_ids.iter().enumerate() {
        let sp_id = submit_singlepoint(
            store,
            &data.service,
            qc_input.clone(),
            MoleculeUpload::Id(molecule_id),
        )
        .await?;
        detail.image_singlepoint_ids.push(sp_id);
        dependencies.push(NewServiceDependency {
            record_id: sp_id,
            extras: json!({ "image": idx, "stage": "chain" }),
        });
    }

    let stdout = format!(
        "Starting NEB over a chain of {} image(s)\n",
        detail.chain_molecule_ids.len()
    );

    Ok(ServicePlan {
        state: serde_json::to_value(&state)?,
        dependencies,
        detail: Some(pack_detail(detail)),
        stdout: Some(stdout),
        finished: false,
    })
}

pub(crate) async fn update(
    store: &dyn Store,
    data: &ServiceIterationData,
) -> Result<ServicePlan> {
    let mut state: NebState = serde_json::from_value(data.service.service_state.clone())
        .map_err(|e| ServerError::Internal(format!("corrupt neb state: {e}")))?;
    let mut detail = unpack_detail(&data.detail)?;

    match state.phase {
        Phase::ChainSinglepoints => {
            let mut energies = vec![f64::NAN; detail.chain_molecule_ids.len()];
            for dep in &data.dependencies {
                let idx = dep
                    .extras
                    .get("image")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| {
                        ServerError::Internal("dependency missing image index".to_string())
                    })? as usize;
                let dep_detail = dep.detail.as_ref().ok_or_else(|| {
                    ServerError::Internal("complete dependency has no detail".to_string())
                })?;
                energies[idx] = singlepoint_energy(dep_detail)?;
            }
            if energies.iter().any(|e| e.is_nan()) {
                return Err(ServerError::Internal(
                    "missing image energies in NEB chain".to_string(),
                ));
            }

            let ts_image = energies
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).expect("finite energies"))
                .map(|(i, _)| i)
                .expect("chain is non-empty");
            detail.image_energies = energies;
            state.ts_image = Some(ts_image);

            if state.optimize_endpoints {
                let opt_spec_id = state.optimization_specification_id.ok_or_else(|| {
                    ServerError::Internal("neb endpoint optimization without spec".to_string())
                })?;
                let opt_input = opt_spec_input(store, opt_spec_id).await?;
                let endpoints = [
                    detail.chain_molecule_ids[0],
                    *detail.chain_molecule_ids.last().expect("non-empty chain"),
                ];
                let mut dependencies = Vec::new();
                detail.endpoint_optimization_ids.clear();
                for (idx, &molecule_id) in endpoints.iter().enumerate() {
                    let opt_id = submit_optimization(
                        store,
                        &data.service,
                        opt_input.clone(),
                        MoleculeUpload::Id(molecule_id),
                    )
                    .await?;
                    detail.endpoint_optimization_ids.push(opt_id);
                    dependencies.push(NewServiceDependency {
                        record_id: opt_id,
                        extras: json!({ "endpoint": idx, "stage": "endpoints" }),
                    });
                }
                state.phase = Phase::EndpointOptimizations;
                return Ok(ServicePlan {
                    state: serde_json::to_value(&state)?,
                    dependencies,
                    detail: Some(pack_detail(detail)),
                    stdout: Some("Chain evaluated; optimizing endpoints\n".to_string()),
                    finished: false,
                });
            }

            if state.optimize_ts {
                return dispatch_ts(store, data, state, detail).await;
            }

            finish(state, detail)
        }
        Phase::EndpointOptimizations => {
            if state.optimize_ts {
                return dispatch_ts(store, data, state, detail).await;
            }
            finish(state, detail)
        }
        Phase::TsOptimization => {
            let dep = data.dependencies.last().ok_or_else(|| {
                ServerError::Internal("ts optimization has no dependency".to_string())
            })?;
            detail.ts_optimization_id = Some(dep.record_id);
            finish(state, detail)
        }
    }
}

async fn dispatch_ts(
    store: &dyn Store,
    data: &ServiceIterationData,
    mut state: NebState,
    mut detail: NebDetail,
) -> Result<ServicePlan> {
    let opt_spec_id = state.optimization_specification_id.ok_or_else(|| {
        ServerError::Internal("neb ts optimization without spec".to_string())
    })?;
    let ts_image = state
        .ts_image
        .ok_or_else(|| ServerError::Internal("neb ts image not identified".to_string()))?;

    let opt_input = opt_spec_input(store, opt_spec_id).await?;
    let opt_id = submit_optimization(
        store,
        &data.service,
        opt_input,
        MoleculeUpload::Id(detail.chain_molecule_ids[ts_image]),
    )
    .await?;
    detail.ts_optimization_id = Some(opt_id);
    state.phase = Phase::TsOptimization;

    Ok(ServicePlan {
        state: serde_json::to_value(&state)?,
        dependencies: vec![NewServiceDependency {
            record_id: opt_id,
            extras: json!({ "image": ts_image, "stage": "ts" }),
        }],
        detail: Some(pack_detail(detail)),
        stdout: Some(format!(
            "Optimizing transition-state guess at image {ts_image}\n"
        )),
        finished: false,
    })
}

fn finish(state: NebState, detail: NebDetail) -> Result<ServicePlan> {
    let ts_image = state.ts_image.unwrap_or_default();
    let stdout = format!(
        "NEB finished: transition-state guess at image {ts_image}\n"
    );
    Ok(ServicePlan {
        state: serde_json::to_value(&state)?,
        dependencies: Vec::new(),
        detail: Some(pack_detail(detail)),
        stdout: Some(stdout),
        finished: true,
    })
}
