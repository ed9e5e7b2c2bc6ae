//! Submission and retrieval shapes for the polymorphic record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::services::{
    GridoptimizationSpecificationInput, ManybodySpecificationInput, NebSpecificationInput,
    ReactionComponentInput, ReactionSpecificationInput, TorsiondriveSpecificationInput,
};
use crate::{
    ComputeHistoryEntry, ComputePriority, Id, MoleculeUpload, OptimizationSpecificationInput,
    QcSpecificationInput, RecordComment, RecordStatus, RecordType, ServerError, TaskSpec,
};

/// What to compute: one specification variant per record type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub enum RecordSpecification {
    Singlepoint(QcSpecificationInput),
    Optimization(OptimizationSpecificationInput),
    Torsiondrive(TorsiondriveSpecificationInput),
    Gridoptimization(GridoptimizationSpecificationInput),
    Manybody(ManybodySpecificationInput),
    Reaction(ReactionSpecificationInput),
    Neb(NebSpecificationInput),
}

impl RecordSpecification {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordSpecification::Singlepoint(_) => RecordType::Singlepoint,
            RecordSpecification::Optimization(_) => RecordType::Optimization,
            RecordSpecification::Torsiondrive(_) => RecordType::Torsiondrive,
            RecordSpecification::Gridoptimization(_) => RecordType::Gridoptimization,
            RecordSpecification::Manybody(_) => RecordType::Manybody,
            RecordSpecification::Reaction(_) => RecordType::Reaction,
            RecordSpecification::Neb(_) => RecordType::Neb,
        }
    }
}

/// The per-record inputs of a submission batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub enum RecordInput {
    Singlepoint {
        molecule: MoleculeUpload,
    },
    Optimization {
        initial_molecule: MoleculeUpload,
    },
    Torsiondrive {
        initial_molecules: Vec<MoleculeUpload>,
    },
    Gridoptimization {
        initial_molecule: MoleculeUpload,
    },
    Manybody {
        initial_molecule: MoleculeUpload,
    },
    Reaction {
        stoichiometry: Vec<ReactionComponentInput>,
    },
    Neb {
        chain: Vec<MoleculeUpload>,
    },
}

impl RecordInput {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordInput::Singlepoint { .. } => RecordType::Singlepoint,
            RecordInput::Optimization { .. } => RecordType::Optimization,
            RecordInput::Torsiondrive { .. } => RecordType::Torsiondrive,
            RecordInput::Gridoptimization { .. } => RecordType::Gridoptimization,
            RecordInput::Manybody { .. } => RecordType::Manybody,
            RecordInput::Reaction { .. } => RecordType::Reaction,
            RecordInput::Neb { .. } => RecordType::Neb,
        }
    }
}

/// Projection control for `get_records`: which columns and relationships to
/// return. `id` and `record_type` are always present. Relationship fields
/// (`task`, `service`, `compute_history`, `comments`) are only returned when
/// named in `include` and not named in `exclude`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl ProjectionSpec {
    pub fn with_include(fields: &[&str]) -> Self {
        Self {
            include: Some(fields.iter().map(|f| f.to_string()).collect()),
            exclude: Vec::new(),
        }
    }

    fn named(&self, field: &str) -> bool {
        match &self.include {
            None => false,
            Some(fields) => fields.iter().any(|f| f == field),
        }
    }

    fn excluded(&self, field: &str) -> bool {
        self.exclude.iter().any(|f| f == field)
    }

    /// Should a default (non-relationship) column be returned?
    /// `include = None` and `include = ["*"]` both mean the default set.
    pub fn wants_column(&self, field: &str) -> bool {
        if self.excluded(field) {
            return false;
        }
        match &self.include {
            None => true,
            Some(fields) => {
                fields.iter().any(|f| f == "*") || self.named(field)
            }
        }
    }

    /// Should a relationship field be returned? Only on explicit request.
    pub fn wants_relationship(&self, field: &str) -> bool {
        self.named(field) && !self.excluded(field)
    }
}

/// Wire view of a task-queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskData {
    pub id: Id,
    pub record_id: Id,
    pub spec: TaskSpec,
    pub required_programs: BTreeMap<String, Option<String>>,
    pub compute_tag: String,
    pub compute_priority: ComputePriority,
    pub available: bool,
    pub created_on: DateTime<Utc>,
}

/// Wire view of a service-queue row, with its current dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceData {
    pub id: Id,
    pub record_id: Id,
    pub compute_tag: String,
    pub compute_priority: ComputePriority,
    pub find_existing: bool,
    pub created_on: DateTime<Utc>,
    pub dependencies: Vec<ServiceDependencyData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDependencyData {
    pub record_id: Id,
    pub extras: Value,
}

/// A cluster evaluated by a manybody record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManybodyClusterData {
    /// Fragment indices whose atoms are present.
    pub fragments: Vec<u32>,
    /// Fragment indices spanning the basis (equal to `fragments` without a
    /// BSSE correction).
    pub basis: Vec<u32>,
    pub molecule_id: Id,
    pub singlepoint_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
}

/// One stoichiometry component of a reaction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionComponentData {
    pub coefficient: f64,
    pub molecule_id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singlepoint_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
}

/// The per-type detail of a record row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub enum RecordDetail {
    Singlepoint {
        specification_id: Id,
        molecule_id: Id,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        return_result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        properties: Option<Value>,
    },
    Optimization {
        specification_id: Id,
        initial_molecule_id: Id,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_molecule_id: Option<Id>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        energies: Vec<f64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        trajectory_ids: Vec<Id>,
    },
    Torsiondrive {
        specification_id: Id,
        initial_molecule_ids: Vec<Id>,
        /// Every optimization ever dispatched, keyed by grid point.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        optimization_history: BTreeMap<String, Vec<Id>>,
        /// Per grid point, the minimum-energy optimization.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        minimum_optimizations: BTreeMap<String, Id>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        final_energies: BTreeMap<String, f64>,
    },
    Gridoptimization {
        specification_id: Id,
        initial_molecule_id: Id,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        starting_molecule_id: Option<Id>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        grid_optimizations: BTreeMap<String, Id>,
    },
    Manybody {
        specification_id: Id,
        initial_molecule_id: Id,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        clusters: Vec<ManybodyClusterData>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_energy: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interaction_energy: Option<f64>,
    },
    Reaction {
        specification_id: Id,
        components: Vec<ReactionComponentData>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_energy: Option<f64>,
    },
    Neb {
        specification_id: Id,
        chain_molecule_ids: Vec<Id>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        image_singlepoint_ids: Vec<Id>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        image_energies: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts_optimization_id: Option<Id>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        endpoint_optimization_ids: Vec<Id>,
    },
}

impl RecordDetail {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordDetail::Singlepoint { .. } => RecordType::Singlepoint,
            RecordDetail::Optimization { .. } => RecordType::Optimization,
            RecordDetail::Torsiondrive { .. } => RecordType::Torsiondrive,
            RecordDetail::Gridoptimization { .. } => RecordType::Gridoptimization,
            RecordDetail::Manybody { .. } => RecordType::Manybody,
            RecordDetail::Reaction { .. } => RecordType::Reaction,
            RecordDetail::Neb { .. } => RecordType::Neb,
        }
    }
}

/// The projected record returned by `get_records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordData {
    pub id: Id,
    pub record_type: RecordType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_on: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<RecordDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_history: Option<Vec<ComputeHistoryEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<Vec<RecordComment>>,
}

/// Filters for `query_records`. All filters are conjunctive; vector-valued
/// filters match any element.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordQueryFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<Vec<RecordType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Vec<RecordStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_name: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_user: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_after: Option<DateTime<Utc>>,
    /// Records that are a child of any of these records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Vec<Id>>,
    /// Records that are a parent of any of these records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_id: Option<Vec<Id>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<Vec<Id>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub skip: usize,
}

/// Validate that every input matches the specification's record type,
/// collecting per-index errors for mismatches.
pub fn check_input_types(
    spec: &RecordSpecification,
    inputs: &[RecordInput],
) -> Result<(), ServerError> {
    for input in inputs {
        if input.record_type() != spec.record_type() {
            return Err(ServerError::InvalidPayload(format!(
                "input of type {} does not match specification of type {}",
                input.record_type(),
                spec.record_type()
            )));
        }
    }
    Ok(())
}
