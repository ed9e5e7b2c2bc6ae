use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::hash::{round_f64, ContentHasher, CHARGE_DIGITS, GEOMETRY_DIGITS};
use crate::{Id, ServerError};

/// Free-form identifiers attached to a molecule. These are mutable after
/// insertion and never contribute to the structural hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoleculeIdentifiers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, String>,
}

impl MoleculeIdentifiers {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.comment.is_none() && self.extras.is_empty()
    }
}

/// A molecule payload: symbols, a flat 3N geometry in bohr, optional
/// connectivity, charge/multiplicity, and a fragment partitioning.
///
/// Molecules are content-addressed: two payloads with equal structural hash
/// are the same molecule. See [`Molecule::structural_hash`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Molecule {
    pub symbols: Vec<String>,
    pub geometry: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connectivity: Vec<(u32, u32, f64)>,
    #[serde(default)]
    pub molecular_charge: f64,
    #[serde(default = "default_multiplicity")]
    pub molecular_multiplicity: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragments: Vec<Vec<u32>>,
    #[serde(default, skip_serializing_if = "MoleculeIdentifiers::is_empty")]
    pub identifiers: MoleculeIdentifiers,
}

fn default_multiplicity() -> u32 {
    1
}

impl Molecule {
    pub fn from_symbols_geometry(symbols: &[&str], geometry: &[f64]) -> Self {
        Self {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            geometry: geometry.to_vec(),
            connectivity: Vec::new(),
            molecular_charge: 0.0,
            molecular_multiplicity: 1,
            fragments: Vec::new(),
            identifiers: MoleculeIdentifiers::default(),
        }
    }

    pub fn n_atoms(&self) -> usize {
        self.symbols.len()
    }

    /// Position of atom `i` as an xyz triple.
    pub fn atom(&self, i: usize) -> [f64; 3] {
        [
            self.geometry[3 * i],
            self.geometry[3 * i + 1],
            self.geometry[3 * i + 2],
        ]
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        let n = self.symbols.len();
        if n == 0 {
            return Err(ServerError::InvalidPayload(
                "molecule has no atoms".to_string(),
            ));
        }
        if self.geometry.len() != 3 * n {
            return Err(ServerError::InvalidPayload(format!(
                "molecule geometry has {} values, expected {} for {} atoms",
                self.geometry.len(),
                3 * n,
                n
            )));
        }
        if !self.geometry.iter().all(|v| v.is_finite()) {
            return Err(ServerError::InvalidPayload(
                "molecule geometry contains non-finite values".to_string(),
            ));
        }
        for &(a, b, _) in &self.connectivity {
            if a as usize >= n || b as usize >= n {
                return Err(ServerError::InvalidPayload(format!(
                    "connectivity entry ({a}, {b}) out of range for {n} atoms"
                )));
            }
        }
        let mut seen = vec![false; n];
        for fragment in &self.fragments {
            for &idx in fragment {
                if idx as usize >= n {
                    return Err(ServerError::InvalidPayload(format!(
                        "fragment atom index {idx} out of range for {n} atoms"
                    )));
                }
                if std::mem::replace(&mut seen[idx as usize], true) {
                    return Err(ServerError::InvalidPayload(format!(
                        "atom {idx} appears in more than one fragment"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The canonical structural hash: symbols (case-folded), geometry rounded
    /// to 1e-8 bohr, normalized connectivity, charge rounded to 1e-4,
    /// multiplicity, and the fragment layout. Identifiers are excluded.
    pub fn structural_hash(&self) -> String {
        let mut h = ContentHasher::new();

        h.int(self.symbols.len() as i64);
        for s in &self.symbols {
            h.str(&s.trim().to_lowercase());
        }
        for &g in &self.geometry {
            h.float(g, GEOMETRY_DIGITS);
        }

        // Connectivity is order-insensitive: normalize to (lo, hi) and sort.
        let mut bonds: Vec<(u32, u32, f64)> = self
            .connectivity
            .iter()
            .map(|&(a, b, order)| (a.min(b), a.max(b), order))
            .collect();
        bonds.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
        h.int(bonds.len() as i64);
        for (a, b, order) in bonds {
            h.int(a as i64).int(b as i64).float(order, CHARGE_DIGITS);
        }

        h.float(round_f64(self.molecular_charge, CHARGE_DIGITS), CHARGE_DIGITS);
        h.int(self.molecular_multiplicity as i64);

        h.int(self.fragments.len() as i64);
        for fragment in &self.fragments {
            let mut members = fragment.clone();
            members.sort_unstable();
            h.int(members.len() as i64);
            for m in members {
                h.int(m as i64);
            }
        }

        h.finish()
    }
}

/// One element of a molecule batch: either a reference to an existing row,
/// or a new payload to be inserted (or matched by hash).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MoleculeUpload {
    Id(Id),
    New(Box<Molecule>),
}

impl From<Id> for MoleculeUpload {
    fn from(id: Id) -> Self {
        MoleculeUpload::Id(id)
    }
}

impl From<Molecule> for MoleculeUpload {
    fn from(m: Molecule) -> Self {
        MoleculeUpload::New(Box::new(m))
    }
}
