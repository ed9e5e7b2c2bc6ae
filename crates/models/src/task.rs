use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{CompressedBlob, ComputePriority, Id, Molecule};

/// The concrete job payload a manager executes: a function name plus
/// positional and keyword arguments, mirroring the engine adapter call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub function: String,
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub kwargs: serde_json::Map<String, Value>,
}

impl TaskSpec {
    /// A single-point evaluation through the engine adapter.
    pub fn compute(input: Value, program: &str) -> Self {
        Self {
            function: "qcengine.compute".to_string(),
            args: vec![input, Value::String(program.to_string())],
            kwargs: Default::default(),
        }
    }

    /// A procedure (optimization) evaluation through the engine adapter.
    pub fn compute_procedure(input: Value, program: &str) -> Self {
        Self {
            function: "qcengine.compute_procedure".to_string(),
            args: vec![input, Value::String(program.to_string())],
            kwargs: Default::default(),
        }
    }
}

/// The opaque descriptor handed to a manager by a successful claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub task_id: Id,
    pub record_id: Id,
    #[serde(flatten)]
    pub spec: TaskSpec,
    pub required_programs: BTreeMap<String, Option<String>>,
    pub compute_tag: String,
    pub compute_priority: ComputePriority,
}

/// Provenance of a completed computation, as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub creator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routine: Option<String>,
}

/// An engine-side failure, stored on the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeError {
    pub error_type: String,
    pub error_message: String,
}

/// One geometry step of an optimization trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub molecule: Molecule,
    pub energy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

/// Typed result data, discriminated by the leaf record type it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "snake_case")]
pub enum TaskResult {
    Singlepoint {
        return_result: Value,
        #[serde(default)]
        properties: Value,
    },
    Optimization {
        final_molecule: Molecule,
        energies: Vec<f64>,
        #[serde(default)]
        trajectory: Vec<TrajectoryStep>,
    },
}

/// A successful return payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessPayload {
    pub provenance: Provenance,
    pub result: TaskResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<CompressedBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<CompressedBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wavefunction: Option<CompressedBlob>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub native_files: BTreeMap<String, CompressedBlob>,
}

/// A failed return payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePayload {
    pub error: ComputeError,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<CompressedBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<CompressedBlob>,
}

/// The result envelope a manager returns for one claimed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultEnvelope {
    Success(Box<SuccessPayload>),
    Failure(FailurePayload),
}

impl ResultEnvelope {
    pub fn failure(error_type: &str, error_message: &str) -> Self {
        ResultEnvelope::Failure(FailurePayload {
            error: ComputeError {
                error_type: error_type.to_string(),
                error_message: error_message.to_string(),
            },
            stdout: None,
            stderr: None,
        })
    }
}

/// Per-task outcome of a `return_results` call, reported back to the
/// manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReturnOutcome {
    Accepted,
    Rejected { reason: String },
}
