//! Specifications for the multi-step service record types.
//!
//! Each service specification bundles one or two inner specifications plus a
//! typed keyword block. The keyword block is hashed canonically (see
//! [`crate::hash`]) so identical submissions deduplicate.

use serde::{Deserialize, Serialize};

use crate::hash::{ContentHasher, KEYWORD_DIGITS};
use crate::specification::{OptimizationSpecificationInput, QcSpecificationInput};
use crate::{Id, MoleculeUpload, ServerError};

fn hash_keywords<T: Serialize>(tag: &str, keywords: &T, inner_ids: &[Id]) -> String {
    let mut h = ContentHasher::new();
    h.str(tag);
    for id in inner_ids {
        h.int(id.0);
    }
    let value = serde_json::to_value(keywords).expect("keyword blocks serialize infallibly");
    h.json(&value, KEYWORD_DIGITS);
    h.finish()
}

// ---------------------------------------------------------------------------
// Torsion drive

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorsiondriveKeywords {
    /// Dihedrals to scan, as atom index quadruplets.
    pub dihedrals: Vec<[u32; 4]>,
    /// Grid spacing in degrees, one entry per dihedral.
    pub grid_spacing: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dihedral_ranges: Option<Vec<[i32; 2]>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_decrease_thresh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_upper_limit: Option<f64>,
}

impl TorsiondriveKeywords {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.dihedrals.is_empty() {
            return Err(ServerError::InvalidPayload(
                "torsiondrive requires at least one dihedral".to_string(),
            ));
        }
        if self.dihedrals.len() != self.grid_spacing.len() {
            return Err(ServerError::InvalidPayload(format!(
                "torsiondrive has {} dihedrals but {} grid spacings",
                self.dihedrals.len(),
                self.grid_spacing.len()
            )));
        }
        if self.grid_spacing.iter().any(|&g| g <= 0 || 360 % g != 0) {
            return Err(ServerError::InvalidPayload(
                "torsiondrive grid spacing must be a positive divisor of 360".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorsiondriveSpecificationInput {
    pub optimization_specification: OptimizationSpecificationInput,
    pub keywords: TorsiondriveKeywords,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorsiondriveSpecification {
    pub id: Id,
    pub optimization_specification_id: Id,
    pub keywords: TorsiondriveKeywords,
}

impl TorsiondriveSpecification {
    pub fn tuple_hash(optimization_specification_id: Id, keywords: &TorsiondriveKeywords) -> String {
        hash_keywords("torsiondrive", keywords, &[optimization_specification_id])
    }
}

// ---------------------------------------------------------------------------
// Grid optimization

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Distance,
    Angle,
    Dihedral,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Steps are offsets from the starting molecule's measured coordinate.
    Relative,
    /// Steps are literal coordinate values.
    Absolute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanDimension {
    pub scan_type: ScanType,
    pub indices: Vec<u32>,
    pub steps: Vec<f64>,
    pub step_type: StepType,
}

impl ScanDimension {
    fn expected_indices(&self) -> usize {
        match self.scan_type {
            ScanType::Distance => 2,
            ScanType::Angle => 3,
            ScanType::Dihedral => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridoptimizationKeywords {
    pub scans: Vec<ScanDimension>,
    #[serde(default)]
    pub preoptimization: bool,
}

impl GridoptimizationKeywords {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.scans.is_empty() {
            return Err(ServerError::InvalidPayload(
                "grid optimization requires at least one scan dimension".to_string(),
            ));
        }
        for scan in &self.scans {
            if scan.steps.is_empty() {
                return Err(ServerError::InvalidPayload(
                    "scan dimension has no steps".to_string(),
                ));
            }
            if scan.indices.len() != scan.expected_indices() {
                return Err(ServerError::InvalidPayload(format!(
                    "{:?} scan requires {} atom indices, got {}",
                    scan.scan_type,
                    scan.expected_indices(),
                    scan.indices.len()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridoptimizationSpecificationInput {
    pub optimization_specification: OptimizationSpecificationInput,
    pub keywords: GridoptimizationKeywords,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridoptimizationSpecification {
    pub id: Id,
    pub optimization_specification_id: Id,
    pub keywords: GridoptimizationKeywords,
}

impl GridoptimizationSpecification {
    pub fn tuple_hash(
        optimization_specification_id: Id,
        keywords: &GridoptimizationKeywords,
    ) -> String {
        hash_keywords(
            "gridoptimization",
            keywords,
            &[optimization_specification_id],
        )
    }
}

// ---------------------------------------------------------------------------
// Manybody

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BsseCorrection {
    #[default]
    None,
    Cp,
    Vmfc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ManybodyKeywords {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nbody: Option<u32>,
    #[serde(default)]
    pub bsse_correction: BsseCorrection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManybodySpecificationInput {
    pub qc_specification: QcSpecificationInput,
    #[serde(default)]
    pub keywords: ManybodyKeywords,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManybodySpecification {
    pub id: Id,
    pub qc_specification_id: Id,
    pub keywords: ManybodyKeywords,
}

impl ManybodySpecification {
    pub fn tuple_hash(qc_specification_id: Id, keywords: &ManybodyKeywords) -> String {
        hash_keywords("manybody", keywords, &[qc_specification_id])
    }
}

// ---------------------------------------------------------------------------
// Reaction

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionSpecificationInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qc_specification: Option<QcSpecificationInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_specification: Option<OptimizationSpecificationInput>,
}

impl ReactionSpecificationInput {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.qc_specification.is_none() && self.optimization_specification.is_none() {
            return Err(ServerError::InvalidPayload(
                "reaction requires a qc specification, an optimization specification, or both"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionSpecification {
    pub id: Id,
    pub qc_specification_id: Option<Id>,
    pub optimization_specification_id: Option<Id>,
}

impl ReactionSpecification {
    pub fn tuple_hash(
        qc_specification_id: Option<Id>,
        optimization_specification_id: Option<Id>,
    ) -> String {
        let mut h = ContentHasher::new();
        h.str("reaction");
        h.int(qc_specification_id.map(|i| i.0).unwrap_or(-1));
        h.int(optimization_specification_id.map(|i| i.0).unwrap_or(-1));
        h.finish()
    }
}

/// One stoichiometry component of a reaction submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionComponentInput {
    pub coefficient: f64,
    pub molecule: MoleculeUpload,
}

// ---------------------------------------------------------------------------
// NEB

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NebKeywords {
    #[serde(default = "default_spring_constant")]
    pub spring_constant: f64,
    #[serde(default)]
    pub optimize_endpoints: bool,
    #[serde(default)]
    pub optimize_ts: bool,
}

fn default_spring_constant() -> f64 {
    1.0
}

impl Default for NebKeywords {
    fn default() -> Self {
        Self {
            spring_constant: default_spring_constant(),
            optimize_endpoints: false,
            optimize_ts: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NebSpecificationInput {
    pub qc_specification: QcSpecificationInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_specification: Option<OptimizationSpecificationInput>,
    #[serde(default)]
    pub keywords: NebKeywords,
}

impl NebSpecificationInput {
    pub fn validate(&self) -> Result<(), ServerError> {
        if (self.keywords.optimize_endpoints || self.keywords.optimize_ts)
            && self.optimization_specification.is_none()
        {
            return Err(ServerError::InvalidPayload(
                "neb optimize_endpoints/optimize_ts require an optimization specification"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NebSpecification {
    pub id: Id,
    pub qc_specification_id: Id,
    pub optimization_specification_id: Option<Id>,
    pub keywords: NebKeywords,
}

impl NebSpecification {
    pub fn tuple_hash(
        qc_specification_id: Id,
        optimization_specification_id: Option<Id>,
        keywords: &NebKeywords,
    ) -> String {
        let mut h = ContentHasher::new();
        h.str("neb");
        h.int(qc_specification_id.0);
        h.int(optimization_specification_id.map(|i| i.0).unwrap_or(-1));
        let value = serde_json::to_value(keywords).expect("keyword blocks serialize infallibly");
        h.json(&value, KEYWORD_DIGITS);
        h.finish()
    }
}
