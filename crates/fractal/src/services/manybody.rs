//! Manybody expansion: cluster decomposition over molecule fragments.
//!
//! All cluster singlepoints dispatch in one batch; finalization computes the
//! many-body expansion by recursive inclusion-exclusion over fragment
//! subsets. The BSSE correction mode decides which basis each cluster is
//! evaluated in: `none` uses the cluster's own fragments, `cp` the full
//! cluster basis, and `vmfc` every (subset, basis) pair.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use models::services::BsseCorrection;
use models::{
    Id, ManybodyClusterData, Molecule, MoleculeUpload, RecordDetail, Result, ServerError,
};

use super::{qc_spec_input, singlepoint_energy, submit_singlepoint, ServicePlan};
use crate::store::{NewServiceDependency, ServiceIterationData, Store};

#[derive(Debug, Serialize, Deserialize)]
struct MbState {
    bsse_correction: BsseCorrection,
    max_nbody: usize,
    n_fragments: usize,
}

/// Enumerate (fragments, basis) cluster pairs in fixed combinatorial order.
fn enumerate_clusters(
    n_fragments: usize,
    max_nbody: usize,
    bsse: BsseCorrection,
) -> Vec<(Vec<u32>, Vec<u32>)> {
    let all: Vec<u32> = (0..n_fragments as u32).collect();
    let mut clusters = Vec::new();

    match bsse {
        BsseCorrection::None => {
            for size in 1..=max_nbody {
                for subset in all.iter().copied().combinations(size) {
                    clusters.push((subset.clone(), subset));
                }
            }
        }
        BsseCorrection::Cp => {
            for size in 1..=max_nbody {
                for subset in all.iter().copied().combinations(size) {
                    clusters.push((subset, all.clone()));
                }
            }
        }
        BsseCorrection::Vmfc => {
            for basis_size in 1..=max_nbody {
                for basis in all.iter().copied().combinations(basis_size) {
                    for subset_size in 1..=basis.len() {
                        for subset in basis.iter().copied().combinations(subset_size) {
                            clusters.push((subset, basis.clone()));
                        }
                    }
                }
            }
        }
    }

    clusters
}

/// Build the molecule containing the atoms of the given fragments.
fn cluster_molecule(parent: &Molecule, fragments: &[u32]) -> Molecule {
    let mut atoms: Vec<u32> = fragments
        .iter()
        .flat_map(|&f| parent.fragments[f as usize].iter().copied())
        .collect();
    atoms.sort_unstable();

    let old_to_new: BTreeMap<u32, u32> = atoms
        .iter()
        .enumerate()
        .map(|(new, &old)| (old, new as u32))
        .collect();

    let symbols = atoms
        .iter()
        .map(|&a| parent.symbols[a as usize].clone())
        .collect();
    let geometry = atoms
        .iter()
        .flat_map(|&a| parent.atom(a as usize))
        .collect();
    let connectivity = parent
        .connectivity
        .iter()
        .filter_map(|&(a, b, order)| {
            Some((*old_to_new.get(&a)?, *old_to_new.get(&b)?, order))
        })
        .collect();

    let whole = fragments.len() == parent.fragments.len();
    Molecule {
        symbols,
        geometry,
        connectivity,
        molecular_charge: if whole { parent.molecular_charge } else { 0.0 },
        molecular_multiplicity: if whole {
            parent.molecular_multiplicity
        } else {
            1
        },
        fragments: Vec::new(),
        identifiers: Default::default(),
    }
}

fn unpack_detail(detail: &RecordDetail) -> Result<(Id, Id, Vec<ManybodyClusterData>)> {
    match detail {
        RecordDetail::Manybody {
            specification_id,
            initial_molecule_id,
            clusters,
            ..
        } => Ok((*specification_id, *initial_molecule_id, clusters.clone())),
        _ => Err(ServerError::Internal(
            "record detail is not a manybody".to_string(),
        )),
    }
}

pub(crate) async fn initialize(
    store: &dyn Store,
    data: &ServiceIterationData,
) -> Result<ServicePlan> {
    let (spec_id, molecule_id, _) = unpack_detail(&data.detail)?;
    let spec = store.get_manybody_specification(spec_id).await?;

    let parent = store
        .get_molecules(&[molecule_id], false)
        .await?
        .pop()
        .flatten()
        .ok_or_else(|| ServerError::missing("manybody molecule"))?;

    let n_fragments = parent.molecule.fragments.len();
    let max_nbody = spec
        .keywords
        .max_nbody
        .map(|m| m as usize)
        .unwrap_or(n_fragments)
        .min(n_fragments);

    let pairs = enumerate_clusters(n_fragments, max_nbody, spec.keywords.bsse_correction);

    let qc_input = qc_spec_input(store, spec.qc_specification_id).await?;
    let mut clusters = Vec::with_capacity(pairs.len());
    let mut dependencies = Vec::with_capacity(pairs.len());

    for (idx, (fragments, basis)) in pairs.iter().enumerate() {
        let molecule = cluster_molecule(&parent.molecule, fragments);
        let (mol_meta, mol_ids) = store
            .add_molecules(&[MoleculeUpload::New(Box::new(molecule))])
            .await?;
        if !mol_meta.success() {
            return Err(ServerError::Internal(mol_meta.error_string()));
        }
        let cluster_mol_id = mol_ids[0].expect("successful insert has an id");

        let sp_id = submit_singlepoint(
            store,
            &data.service,
            qc_input.clone(),
            MoleculeUpload::Id(cluster_mol_id),
        )
        .await?;

        clusters.push(ManybodyClusterData {
            fragments: fragments.clone(),
            basis: basis.clone(),
            molecule_id: cluster_mol_id,
            singlepoint_id: sp_id,
            energy: None,
        });
        dependencies.push(NewServiceDependency {
            record_id: sp_id,
            extras: json!({ "cluster": idx }),
        });
    }

    let state = MbState {
        bsse_correction: spec.keywords.bsse_correction,
        max_nbody,
        n_fragments,
    };

    let stdout = format!(
        "Starting manybody expansion: {} fragment(s), max_nbody {}, {} cluster(s)\n",
        n_fragments,
        max_nbody,
        clusters.len()
    );

    Ok(ServicePlan {
        state: serde_json::to_value(&state)?,
        dependencies,
        detail: Some(RecordDetail::Manybody {
            specification_id: spec_id,
            initial_molecule_id: molecule_id,
            clusters,
            total_energy: None,
            interaction_energy: None,
        }),
        stdout: Some(stdout),
        finished: false,
    })
}

/// Recursive many-body increments: delta(S) = E(S) - sum of deltas of all
/// proper non-empty subsets of S.
fn mbe_total(energies: &BTreeMap<Vec<u32>, f64>, max_nbody: usize) -> Option<f64> {
    let mut deltas: BTreeMap<Vec<u32>, f64> = BTreeMap::new();
    let mut subsets: Vec<Vec<u32>> = energies.keys().cloned().collect();
    subsets.sort_by_key(|s| s.len());

    for subset in &subsets {
        let e = *energies.get(subset)?;
        let mut delta = e;
        for size in 1..subset.len() {
            for sub in subset.iter().copied().combinations(size) {
                delta -= deltas.get(&sub).copied()?;
            }
        }
        deltas.insert(subset.clone(), delta);
    }

    Some(
        deltas
            .iter()
            .filter(|(s, _)| s.len() <= max_nbody)
            .map(|(_, d)| d)
            .sum(),
    )
}

/// VMFC total at level k: sum over bases B (|B| <= k) of the alternating
/// sum over subsets of B.
fn vmfc_total(energies: &BTreeMap<(Vec<u32>, Vec<u32>), f64>, max_nbody: usize) -> Option<f64> {
    let bases: Vec<Vec<u32>> = energies
        .keys()
        .map(|(_, b)| b.clone())
        .unique()
        .filter(|b| b.len() <= max_nbody)
        .collect();

    let mut total = 0.0;
    for basis in bases {
        for size in 1..=basis.len() {
            let sign = if (basis.len() - size) % 2 == 0 { 1.0 } else { -1.0 };
            for subset in basis.iter().copied().combinations(size) {
                total += sign * energies.get(&(subset, basis.clone())).copied()?;
            }
        }
    }
    Some(total)
}

pub(crate) async fn update(
    _store: &dyn Store,
    data: &ServiceIterationData,
) -> Result<ServicePlan> {
    let state: MbState = serde_json::from_value(data.service.service_state.clone())
        .map_err(|e| ServerError::Internal(format!("corrupt manybody state: {e}")))?;
    let (spec_id, molecule_id, mut clusters) = unpack_detail(&data.detail)?;

    // Energies come back keyed by singlepoint record id.
    let mut by_record: BTreeMap<Id, f64> = BTreeMap::new();
    for dep in &data.dependencies {
        let detail = dep
            .detail
            .as_ref()
            .ok_or_else(|| ServerError::Internal("complete dependency has no detail".to_string()))?;
        by_record.insert(dep.record_id, singlepoint_energy(detail)?);
    }

    for cluster in &mut clusters {
        if let Some(&e) = by_record.get(&cluster.singlepoint_id) {
            cluster.energy = Some(e);
        }
    }

    let total = match state.bsse_correction {
        BsseCorrection::None | BsseCorrection::Cp => {
            let energies: BTreeMap<Vec<u32>, f64> = clusters
                .iter()
                .filter_map(|c| c.energy.map(|e| (c.fragments.clone(), e)))
                .collect();
            mbe_total(&energies, state.max_nbody)
        }
        BsseCorrection::Vmfc => {
            let energies: BTreeMap<(Vec<u32>, Vec<u32>), f64> = clusters
                .iter()
                .filter_map(|c| c.energy.map(|e| ((c.fragments.clone(), c.basis.clone()), e)))
                .collect();
            vmfc_total(&energies, state.max_nbody)
        }
    }
    .ok_or_else(|| ServerError::Internal("manybody cluster energies are incomplete".to_string()))?;

    let monomer_sum: f64 = clusters
        .iter()
        .filter(|c| c.fragments.len() == 1)
        .filter_map(|c| c.energy)
        .sum();
    let interaction = total - monomer_sum;

    let stdout = format!(
        "Manybody expansion finished: total energy {total:.10}, interaction {interaction:.10}\n"
    );

    Ok(ServicePlan {
        state: serde_json::to_value(&state)?,
        dependencies: Vec::new(),
        detail: Some(RecordDetail::Manybody {
            specification_id: spec_id,
            initial_molecule_id: molecule_id,
            clusters,
            total_energy: Some(total),
            interaction_energy: Some(interaction),
        }),
        stdout: Some(stdout),
        finished: true,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cluster_enumeration_counts() {
        // 3 fragments, full order, no correction: 3 + 3 + 1 subsets.
        assert_eq!(enumerate_clusters(3, 3, BsseCorrection::None).len(), 7);
        // Truncated at 2-body: 3 + 3.
        assert_eq!(enumerate_clusters(3, 2, BsseCorrection::None).len(), 6);
        // CP keeps the same subsets but evaluates them in the full basis.
        let cp = enumerate_clusters(2, 2, BsseCorrection::Cp);
        assert!(cp.iter().all(|(_, basis)| basis == &vec![0, 1]));
    }

    #[test]
    fn mbe_reproduces_pairwise_additivity() {
        // E(ab) = E(a) + E(b) + eps -> 2-body total is exactly E(ab).
        let mut energies = BTreeMap::new();
        energies.insert(vec![0], -1.0);
        energies.insert(vec![1], -2.0);
        energies.insert(vec![0, 1], -3.25);

        let total = mbe_total(&energies, 2).unwrap();
        assert!((total - (-3.25)).abs() < 1e-12);

        // Truncating at 1-body drops the interaction.
        let total1 = mbe_total(&energies, 1).unwrap();
        assert!((total1 - (-3.0)).abs() < 1e-12);
    }

    #[test]
    fn vmfc_alternating_sum() {
        let mut energies = BTreeMap::new();
        energies.insert((vec![0], vec![0]), -1.0);
        energies.insert((vec![1], vec![1]), -2.0);
        energies.insert((vec![0], vec![0, 1]), -1.1);
        energies.insert((vec![1], vec![0, 1]), -2.1);
        energies.insert((vec![0, 1], vec![0, 1]), -3.5);

        // Level 2: E(a,a) + E(b,b) + [E(ab,ab) - E(a,ab) - E(b,ab)].
        let total = vmfc_total(&energies, 2).unwrap();
        assert!((total - (-1.0 - 2.0 - 3.5 + 1.1 + 2.1)).abs() < 1e-12);
    }

    #[test]
    fn cluster_molecule_extracts_fragment_atoms() {
        let mut parent = Molecule::from_symbols_geometry(
            &["O", "H", "O", "H"],
            &[
                0.0, 0.0, 0.0, //
                1.0, 0.0, 0.0, //
                5.0, 0.0, 0.0, //
                6.0, 0.0, 0.0,
            ],
        );
        parent.fragments = vec![vec![0, 1], vec![2, 3]];
        parent.connectivity = vec![(0, 1, 1.0), (2, 3, 1.0)];

        let sub = cluster_molecule(&parent, &[1]);
        assert_eq!(sub.symbols, vec!["O", "H"]);
        assert_eq!(sub.geometry, vec![5.0, 0.0, 0.0, 6.0, 0.0, 0.0]);
        assert_eq!(sub.connectivity, vec![(0, 1, 1.0)]);
        assert!(sub.fragments.is_empty());
    }
}
