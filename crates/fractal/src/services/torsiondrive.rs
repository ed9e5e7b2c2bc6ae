//! Torsion drive: constrained optimizations over a dihedral grid.
//!
//! The drive runs as a wavefront. Each initial molecule seeds the grid point
//! nearest its measured dihedrals; every finished grid point propagates its
//! minimum-energy geometry to axis neighbors that have not been dispatched
//! yet. The drive completes when no new grid point can be reached.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

use models::{Id, MoleculeUpload, RecordDetail, Result, ServerError};

use super::{
    geometry, opt_spec_input, optimization_outcome, submit_optimization, ServicePlan,
};
use crate::store::{NewServiceDependency, ServiceIterationData, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GridEntry {
    optimization_id: Id,
    energy: f64,
    final_molecule_id: Id,
}

#[derive(Debug, Serialize, Deserialize)]
struct TdState {
    dihedrals: Vec<[u32; 4]>,
    grid_spacing: Vec<i32>,
    dihedral_ranges: Option<Vec<[i32; 2]>>,
    energy_upper_limit: Option<f64>,
    optimization_specification_id: Id,
    /// Grid keys with an optimization dispatched (finished or not).
    dispatched: BTreeSet<String>,
    /// Finished optimizations per grid key.
    grid_status: BTreeMap<String, Vec<GridEntry>>,
}

fn key_string(key: &[i32]) -> String {
    serde_json::to_string(key).expect("grid keys serialize")
}

fn parse_key(s: &str) -> Result<Vec<i32>> {
    serde_json::from_str(s)
        .map_err(|e| ServerError::Internal(format!("malformed grid key '{s}': {e}")))
}

/// Grid values for one dihedral: `-180+g, ..., 180`.
fn grid_axis(spacing: i32) -> Vec<i32> {
    (1..=(360 / spacing)).map(|k| -180 + k * spacing).collect()
}

/// Snap a measured angle to the nearest grid value.
fn snap_to_grid(angle: f64, spacing: i32) -> i32 {
    grid_axis(spacing)
        .into_iter()
        .min_by(|a, b| {
            geometry::angle_separation(angle, *a as f64)
                .partial_cmp(&geometry::angle_separation(angle, *b as f64))
                .expect("separations are finite")
        })
        .expect("grid axis is never empty")
}

fn within_ranges(key: &[i32], ranges: &Option<Vec<[i32; 2]>>) -> bool {
    match ranges {
        None => true,
        Some(ranges) => key
            .iter()
            .zip(ranges)
            .all(|(v, [lo, hi])| *v >= *lo && *v <= *hi),
    }
}

/// Axis neighbors of a grid key, wrapped into (-180, 180].
fn neighbors(key: &[i32], spacing: &[i32], ranges: &Option<Vec<[i32; 2]>>) -> Vec<Vec<i32>> {
    let mut out = Vec::new();
    for (axis, &g) in spacing.iter().enumerate() {
        for step in [-g, g] {
            let mut neighbor = key.to_vec();
            neighbor[axis] = geometry::wrap_angle((key[axis] + step) as f64) as i32;
            if within_ranges(&neighbor, ranges) {
                out.push(neighbor);
            }
        }
    }
    out
}

fn constraints_for(dihedrals: &[[u32; 4]], key: &[i32]) -> Vec<Value> {
    dihedrals
        .iter()
        .zip(key)
        .map(|(indices, value)| {
            json!({ "type": "dihedral", "indices": indices, "value": value })
        })
        .collect()
}

fn unpack_detail(
    detail: &RecordDetail,
) -> Result<(
    Id,
    Vec<Id>,
    BTreeMap<String, Vec<Id>>,
    BTreeMap<String, Id>,
    BTreeMap<String, f64>,
)> {
    match detail {
        RecordDetail::Torsiondrive {
            specification_id,
            initial_molecule_ids,
            optimization_history,
            minimum_optimizations,
            final_energies,
        } => Ok((
            *specification_id,
            initial_molecule_ids.clone(),
            optimization_history.clone(),
            minimum_optimizations.clone(),
            final_energies.clone(),
        )),
        _ => Err(ServerError::Internal(
            "record detail is not a torsiondrive".to_string(),
        )),
    }
}

async fn dispatch_point(
    store: &dyn Store,
    data: &ServiceIterationData,
    state: &TdState,
    key: &[i32],
    seed: MoleculeUpload,
) -> Result<Id> {
    let mut opt_input = opt_spec_input(store, state.optimization_specification_id).await?;
    opt_input.keywords = super::with_constraints(
        &opt_input.keywords,
        constraints_for(&state.dihedrals, key),
    );
    submit_optimization(store, &data.service, opt_input, seed).await
}

pub(crate) async fn initialize(
    store: &dyn Store,
    data: &ServiceIterationData,
) -> Result<ServicePlan> {
    let (spec_id, initial_molecule_ids, mut history, minimum, energies) =
        unpack_detail(&data.detail)?;

    let spec = store.get_torsiondrive_specification(spec_id).await?;
    let kw = &spec.keywords;

    let mut molecules: Vec<_> = store
        .get_molecules(&initial_molecule_ids, false)
        .await?
        .into_iter()
        .flatten()
        .collect();
    // Hash order makes seeding deterministic regardless of submission order.
    molecules.sort_by(|a, b| a.hash.cmp(&b.hash));

    let mut state = TdState {
        dihedrals: kw.dihedrals.clone(),
        grid_spacing: kw.grid_spacing.clone(),
        dihedral_ranges: kw.dihedral_ranges.clone(),
        energy_upper_limit: kw.energy_upper_limit,
        optimization_specification_id: spec.optimization_specification_id,
        dispatched: BTreeSet::new(),
        grid_status: BTreeMap::new(),
    };

    let mut dependencies = Vec::new();
    let mut seeded: BTreeSet<(String, Id)> = BTreeSet::new();

    for row in &molecules {
        let key: Vec<i32> = state
            .dihedrals
            .iter()
            .zip(&state.grid_spacing)
            .map(|(d, &g)| {
                snap_to_grid(
                    geometry::dihedral(
                        &row.molecule,
                        d[0] as usize,
                        d[1] as usize,
                        d[2] as usize,
                        d[3] as usize,
                    ),
                    g,
                )
            })
            .collect();
        let key_str = key_string(&key);

        if !seeded.insert((key_str.clone(), row.id)) {
            continue;
        }

        let opt_id =
            dispatch_point(store, data, &state, &key, MoleculeUpload::Id(row.id)).await?;
        history.entry(key_str.clone()).or_default().push(opt_id);
        state.dispatched.insert(key_str.clone());
        dependencies.push(NewServiceDependency {
            record_id: opt_id,
            extras: json!({ "key": key_str, "position": dependencies.len() }),
        });
    }

    let stdout = format!(
        "Starting torsion drive over {} dihedral(s): dispatched {} seed optimization(s)\n",
        state.dihedrals.len(),
        dependencies.len()
    );

    Ok(ServicePlan {
        state: serde_json::to_value(&state)?,
        dependencies,
        detail: Some(RecordDetail::Torsiondrive {
            specification_id: spec_id,
            initial_molecule_ids,
            optimization_history: history,
            minimum_optimizations: minimum,
            final_energies: energies,
        }),
        stdout: Some(stdout),
        finished: false,
    })
}

pub(crate) async fn update(
    store: &dyn Store,
    data: &ServiceIterationData,
) -> Result<ServicePlan> {
    let mut state: TdState = serde_json::from_value(data.service.service_state.clone())
        .map_err(|e| ServerError::Internal(format!("corrupt torsiondrive state: {e}")))?;
    let (spec_id, initial_molecule_ids, mut history, _, _) = unpack_detail(&data.detail)?;

    // Fold every finished dependency into its grid point.
    let mut ingested = 0usize;
    for dep in &data.dependencies {
        let key_str = dep
            .extras
            .get("key")
            .and_then(|k| k.as_str())
            .ok_or_else(|| ServerError::Internal("dependency missing grid key".to_string()))?
            .to_string();
        let detail = dep
            .detail
            .as_ref()
            .ok_or_else(|| ServerError::Internal("complete dependency has no detail".to_string()))?;
        let (final_molecule_id, energy) = optimization_outcome(detail)?;
        state.grid_status.entry(key_str).or_default().push(GridEntry {
            optimization_id: dep.record_id,
            energy,
            final_molecule_id,
        });
        ingested += 1;
    }

    let global_min = state
        .grid_status
        .values()
        .flatten()
        .map(|e| e.energy)
        .fold(f64::INFINITY, f64::min);

    // Propagate the wavefront: every finished key offers its best geometry
    // to undispatched neighbors.
    let mut dependencies = Vec::new();
    let finished_keys: Vec<String> = state.grid_status.keys().cloned().collect();
    for key_str in finished_keys {
        let best = state.grid_status[&key_str]
            .iter()
            .min_by(|a, b| a.energy.partial_cmp(&b.energy).expect("finite energies"))
            .cloned()
            .expect("grid entries are never empty");

        if let Some(limit) = state.energy_upper_limit {
            if best.energy > global_min + limit {
                continue;
            }
        }

        let key = parse_key(&key_str)?;
        for neighbor in neighbors(&key, &state.grid_spacing, &state.dihedral_ranges) {
            let neighbor_str = key_string(&neighbor);
            if !state.dispatched.insert(neighbor_str.clone()) {
                continue;
            }
            let opt_id = dispatch_point(
                store,
                data,
                &state,
                &neighbor,
                MoleculeUpload::Id(best.final_molecule_id),
            )
            .await?;
            history.entry(neighbor_str.clone()).or_default().push(opt_id);
            dependencies.push(NewServiceDependency {
                record_id: opt_id,
                extras: json!({ "key": neighbor_str, "position": dependencies.len() }),
            });
        }
    }

    // Keep the per-key minimum in the record detail current.
    let mut minimum = BTreeMap::new();
    let mut energies = BTreeMap::new();
    for (key, entries) in &state.grid_status {
        let best = entries
            .iter()
            .min_by(|a, b| a.energy.partial_cmp(&b.energy).expect("finite energies"))
            .expect("grid entries are never empty");
        minimum.insert(key.clone(), best.optimization_id);
        energies.insert(key.clone(), best.energy);
    }

    let finished = dependencies.is_empty();
    let stdout = format!(
        "Torsion drive iteration: {} optimization(s) finished, {} dispatched, {} grid point(s) done\n",
        ingested,
        dependencies.len(),
        state.grid_status.len()
    );

    Ok(ServicePlan {
        state: serde_json::to_value(&state)?,
        dependencies,
        detail: Some(RecordDetail::Torsiondrive {
            specification_id: spec_id,
            initial_molecule_ids,
            optimization_history: history,
            minimum_optimizations: minimum,
            final_energies: energies,
        }),
        stdout: Some(stdout),
        finished,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn grid_axis_spans_the_circle() {
        assert_eq!(grid_axis(90), vec![-90, 0, 90, 180]);
        assert_eq!(grid_axis(120), vec![-60, 60, 180]);
        assert_eq!(grid_axis(180), vec![0, 180]);
    }

    #[test]
    fn snapping_is_wrap_aware() {
        assert_eq!(snap_to_grid(85.0, 90), 90);
        assert_eq!(snap_to_grid(-170.0, 90), 180);
        assert_eq!(snap_to_grid(175.0, 90), 180);
        assert_eq!(snap_to_grid(1.0, 90), 0);
    }

    #[test]
    fn neighbors_wrap_and_respect_ranges() {
        let n = neighbors(&[180], &[90], &None);
        assert_eq!(n, vec![vec![90], vec![-90]]);

        let constrained = neighbors(&[0], &[90], &Some(vec![[-90, 90]]));
        assert_eq!(constrained, vec![vec![-90], vec![90]]);

        let clipped = neighbors(&[90], &[90], &Some(vec![[-90, 90]]));
        assert_eq!(clipped, vec![vec![0]]);
    }

    #[test]
    fn key_round_trip() {
        let key = vec![90, -30];
        assert_eq!(parse_key(&key_string(&key)).unwrap(), key);
    }
}
