//! Grid optimization: a serial sweep of constrained optimizations over the
//! cartesian product of scan steps.
//!
//! An optional preoptimization relaxes the input molecule first; the relaxed
//! (or input) molecule becomes the starting molecule, which anchors
//! `relative` scan steps. Grid points run one at a time, each seeded from
//! the previous point's final geometry.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use models::services::{ScanDimension, ScanType, StepType};
use models::{Id, Molecule, MoleculeUpload, RecordDetail, Result, ServerError};

use super::{
    geometry, opt_spec_input, optimization_outcome, submit_optimization, ServicePlan,
};
use crate::store::{NewServiceDependency, ServiceIterationData, Store};

pub(crate) const PREOPTIMIZATION_KEY: &str = "preoptimization";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Phase {
    Preoptimization,
    Sweep,
}

#[derive(Debug, Serialize, Deserialize)]
struct GoState {
    phase: Phase,
    scans: Vec<ScanDimension>,
    optimization_specification_id: Id,
    /// Lexicographic index tuples of every grid point.
    points: Vec<Vec<usize>>,
    /// Constraint values per grid point, resolved once the starting molecule
    /// is known.
    values: Vec<Vec<f64>>,
    /// Next point to dispatch.
    cursor: usize,
    last_final_molecule_id: Option<Id>,
}

fn point_key(point: &[usize]) -> String {
    serde_json::to_string(point).expect("grid point keys serialize")
}

/// Lexicographic cartesian product of step indices.
fn enumerate_points(scans: &[ScanDimension]) -> Vec<Vec<usize>> {
    scans
        .iter()
        .map(|s| 0..s.steps.len())
        .multi_cartesian_product()
        .collect()
}

fn measure(molecule: &Molecule, scan: &ScanDimension) -> f64 {
    let idx: Vec<usize> = scan.indices.iter().map(|&i| i as usize).collect();
    match scan.scan_type {
        ScanType::Distance => geometry::distance(molecule, idx[0], idx[1]),
        ScanType::Angle => geometry::angle(molecule, idx[0], idx[1], idx[2]),
        ScanType::Dihedral => geometry::dihedral(molecule, idx[0], idx[1], idx[2], idx[3]),
    }
}

/// Resolve every grid point's constraint values against the starting
/// molecule.
fn resolve_values(
    scans: &[ScanDimension],
    points: &[Vec<usize>],
    starting: &Molecule,
) -> Vec<Vec<f64>> {
    let origins: Vec<f64> = scans.iter().map(|s| measure(starting, s)).collect();
    points
        .iter()
        .map(|point| {
            point
                .iter()
                .zip(scans)
                .zip(&origins)
                .map(|((&step_idx, scan), origin)| match scan.step_type {
                    StepType::Absolute => scan.steps[step_idx],
                    StepType::Relative => origin + scan.steps[step_idx],
                })
                .collect()
        })
        .collect()
}

fn scan_type_name(scan_type: ScanType) -> &'static str {
    match scan_type {
        ScanType::Distance => "distance",
        ScanType::Angle => "angle",
        ScanType::Dihedral => "dihedral",
    }
}

fn constraints_for(scans: &[ScanDimension], values: &[f64]) -> Vec<Value> {
    scans
        .iter()
        .zip(values)
        .map(|(scan, value)| {
            json!({
                "type": scan_type_name(scan.scan_type),
                "indices": scan.indices,
                "value": value,
            })
        })
        .collect()
}

fn unpack_detail(detail: &RecordDetail) -> Result<(Id, Id, Option<Id>, BTreeMap<String, Id>)> {
    match detail {
        RecordDetail::Gridoptimization {
            specification_id,
            initial_molecule_id,
            starting_molecule_id,
            grid_optimizations,
        } => Ok((
            *specification_id,
            *initial_molecule_id,
            *starting_molecule_id,
            grid_optimizations.clone(),
        )),
        _ => Err(ServerError::Internal(
            "record detail is not a gridoptimization".to_string(),
        )),
    }
}

fn make_detail(
    specification_id: Id,
    initial_molecule_id: Id,
    starting_molecule_id: Option<Id>,
    grid_optimizations: BTreeMap<String, Id>,
) -> RecordDetail {
    RecordDetail::Gridoptimization {
        specification_id,
        initial_molecule_id,
        starting_molecule_id,
        grid_optimizations,
    }
}

async fn dispatch_point(
    store: &dyn Store,
    data: &ServiceIterationData,
    state: &GoState,
    point_idx: usize,
    seed: MoleculeUpload,
) -> Result<Id> {
    let mut opt_input = opt_spec_input(store, state.optimization_specification_id).await?;
    opt_input.keywords = super::with_constraints(
        &opt_input.keywords,
        constraints_for(&state.scans, &state.values[point_idx]),
    );
    submit_optimization(store, &data.service, opt_input, seed).await
}

pub(crate) async fn initialize(
    store: &dyn Store,
    data: &ServiceIterationData,
) -> Result<ServicePlan> {
    let (spec_id, initial_molecule_id, _, mut grid) = unpack_detail(&data.detail)?;
    let spec = store.get_gridoptimization_specification(spec_id).await?;

    let points = enumerate_points(&spec.keywords.scans);
    let mut state = GoState {
        phase: Phase::Preoptimization,
        scans: spec.keywords.scans.clone(),
        optimization_specification_id: spec.optimization_specification_id,
        points,
        values: Vec::new(),
        cursor: 0,
        last_final_molecule_id: None,
    };

    let mut dependencies = Vec::new();
    let mut starting_molecule_id = None;

    if spec.keywords.preoptimization {
        // Relax the input first; scan values resolve once it finishes.
        let opt_input = opt_spec_input(store, state.optimization_specification_id).await?;
        let opt_id = submit_optimization(
            store,
            &data.service,
            opt_input,
            MoleculeUpload::Id(initial_molecule_id),
        )
        .await?;
        grid.insert(PREOPTIMIZATION_KEY.to_string(), opt_id);
        dependencies.push(NewServiceDependency {
            record_id: opt_id,
            extras: json!({ "key": PREOPTIMIZATION_KEY }),
        });
    } else {
        let starting = store
            .get_molecules(&[initial_molecule_id], false)
            .await?
            .pop()
            .flatten()
            .ok_or_else(|| ServerError::missing("starting molecule"))?;
        state.values = resolve_values(&state.scans, &state.points, &starting.molecule);
        state.phase = Phase::Sweep;
        starting_molecule_id = Some(initial_molecule_id);

        let key = point_key(&state.points[0]);
        let opt_id = dispatch_point(
            store,
            data,
            &state,
            0,
            MoleculeUpload::Id(initial_molecule_id),
        )
        .await?;
        grid.insert(key.clone(), opt_id);
        state.cursor = 1;
        dependencies.push(NewServiceDependency {
            record_id: opt_id,
            extras: json!({ "key": key }),
        });
    }

    let stdout = format!(
        "Starting grid optimization over {} point(s){}\n",
        state.points.len(),
        if spec.keywords.preoptimization {
            " after preoptimization"
        } else {
            ""
        }
    );

    Ok(ServicePlan {
        state: serde_json::to_value(&state)?,
        dependencies,
        detail: Some(make_detail(
            spec_id,
            initial_molecule_id,
            starting_molecule_id,
            grid,
        )),
        stdout: Some(stdout),
        finished: false,
    })
}

pub(crate) async fn update(
    store: &dyn Store,
    data: &ServiceIterationData,
) -> Result<ServicePlan> {
    let mut state: GoState = serde_json::from_value(data.service.service_state.clone())
        .map_err(|e| ServerError::Internal(format!("corrupt gridoptimization state: {e}")))?;
    let (spec_id, initial_molecule_id, mut starting_molecule_id, mut grid) =
        unpack_detail(&data.detail)?;

    let dep = data
        .dependencies
        .last()
        .ok_or_else(|| ServerError::Internal("gridoptimization has no dependencies".to_string()))?;
    let dep_detail = dep
        .detail
        .as_ref()
        .ok_or_else(|| ServerError::Internal("complete dependency has no detail".to_string()))?;
    let (final_molecule_id, _energy) = optimization_outcome(dep_detail)?;

    match state.phase {
        Phase::Preoptimization => {
            // The relaxed molecule anchors relative scan values.
            starting_molecule_id = Some(final_molecule_id);
            let starting = store
                .get_molecules(&[final_molecule_id], false)
                .await?
                .pop()
                .flatten()
                .ok_or_else(|| ServerError::missing("preoptimized molecule"))?;
            state.values = resolve_values(&state.scans, &state.points, &starting.molecule);
            state.phase = Phase::Sweep;

            let key = point_key(&state.points[0]);
            let opt_id = dispatch_point(
                store,
                data,
                &state,
                0,
                MoleculeUpload::Id(final_molecule_id),
            )
            .await?;
            grid.insert(key.clone(), opt_id);
            state.cursor = 1;
            state.last_final_molecule_id = Some(final_molecule_id);

            Ok(ServicePlan {
                state: serde_json::to_value(&state)?,
                dependencies: vec![NewServiceDependency {
                    record_id: opt_id,
                    extras: json!({ "key": key }),
                }],
                detail: Some(make_detail(
                    spec_id,
                    initial_molecule_id,
                    starting_molecule_id,
                    grid,
                )),
                stdout: Some("Preoptimization finished; starting grid sweep\n".to_string()),
                finished: false,
            })
        }
        Phase::Sweep => {
            state.last_final_molecule_id = Some(final_molecule_id);

            if state.cursor >= state.points.len() {
                let stdout = format!(
                    "Grid optimization finished: {} point(s) evaluated\n",
                    state.points.len()
                );
                return Ok(ServicePlan {
                    state: serde_json::to_value(&state)?,
                    dependencies: Vec::new(),
                    detail: Some(make_detail(
                        spec_id,
                        initial_molecule_id,
                        starting_molecule_id,
                        grid,
                    )),
                    stdout: Some(stdout),
                    finished: true,
                });
            }

            let next = state.cursor;
            let key = point_key(&state.points[next]);
            let opt_id = dispatch_point(
                store,
                data,
                &state,
                next,
                MoleculeUpload::Id(final_molecule_id),
            )
            .await?;
            grid.insert(key.clone(), opt_id);
            state.cursor += 1;

            Ok(ServicePlan {
                state: serde_json::to_value(&state)?,
                dependencies: vec![NewServiceDependency {
                    record_id: opt_id,
                    extras: json!({ "key": key }),
                }],
                detail: Some(make_detail(
                    spec_id,
                    initial_molecule_id,
                    starting_molecule_id,
                    grid,
                )),
                stdout: Some(format!("Grid point {key} dispatched\n")),
                finished: false,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scan(steps: &[f64], step_type: StepType) -> ScanDimension {
        ScanDimension {
            scan_type: ScanType::Distance,
            indices: vec![0, 1],
            steps: steps.to_vec(),
            step_type,
        }
    }

    #[test]
    fn points_enumerate_lexicographically() {
        let scans = vec![scan(&[1.0, 2.0], StepType::Absolute), scan(&[5.0], StepType::Absolute)];
        assert_eq!(
            enumerate_points(&scans),
            vec![vec![0, 0], vec![1, 0]]
        );

        let scans = vec![
            scan(&[1.0, 2.0], StepType::Absolute),
            scan(&[5.0, 6.0], StepType::Absolute),
        ];
        assert_eq!(
            enumerate_points(&scans),
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
    }

    #[test]
    fn relative_steps_offset_the_starting_coordinate() {
        let molecule =
            Molecule::from_symbols_geometry(&["H", "H"], &[0.0, 0.0, 0.0, 0.0, 0.0, 2.0]);
        let scans = vec![scan(&[-0.5, 0.5], StepType::Relative)];
        let points = enumerate_points(&scans);
        let values = resolve_values(&scans, &points, &molecule);
        assert_eq!(values, vec![vec![1.5], vec![2.5]]);

        let scans = vec![scan(&[1.0, 3.0], StepType::Absolute)];
        let values = resolve_values(&scans, &enumerate_points(&scans), &molecule);
        assert_eq!(values, vec![vec![1.0], vec![3.0]]);
    }
}
