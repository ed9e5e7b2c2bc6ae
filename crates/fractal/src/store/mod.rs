//! The storage contract of the coordination kernel.
//!
//! All persistent semantics go through [`Store`]. Two implementations exist:
//! [`mem::MemStore`], which keeps the whole state behind one async mutex and
//! backs the test suites, and [`postgres::PgStore`], which maps the same
//! operations onto Postgres transactions with row-level locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use models::services::{
    GridoptimizationSpecification, ManybodySpecification, NebSpecification, ReactionSpecification,
    TorsiondriveSpecification,
};
use models::{
    ClaimedTask, ComputeError, ComputeHistoryEntry, ComputePriority, Id, InsertMetadata,
    KeywordSet, ManagerActivation, ManagerResources, ManagerStatus, Molecule, MoleculeIdentifiers,
    MoleculeUpload, OptimizationSpecification, OutputType, ProjectionSpec, QcSpecification,
    QcSpecificationInput, QueryMetadata, RecordComment, RecordData, RecordDetail, RecordInput,
    RecordQueryFilters, RecordSpecification, RecordStatus, RecordType, Result, ResultEnvelope,
    ReturnOutcome, TaskSpec, UpdateMetadata,
};

use crate::config::AutoResetPolicy;

pub mod mem;
pub mod postgres;

/// A stored molecule with its identity.
#[derive(Debug, Clone)]
pub struct MoleculeRow {
    pub id: Id,
    pub hash: String,
    pub molecule: Molecule,
}

#[derive(Debug, Clone)]
pub struct KeywordSetRow {
    pub id: Id,
    pub hash: String,
    pub keywords: KeywordSet,
}

/// The polymorphic record header.
#[derive(Debug, Clone)]
pub struct RecordRow {
    pub id: Id,
    pub record_type: RecordType,
    pub status: RecordStatus,
    pub manager_name: Option<String>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub creator_user: Option<String>,
}

/// A task-queue row: the claimable unit of leaf work.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: Id,
    pub record_id: Id,
    pub spec: TaskSpec,
    pub required_programs: BTreeMap<String, Option<String>>,
    pub compute_tag: String,
    pub compute_priority: ComputePriority,
    pub available: bool,
    pub created_on: DateTime<Utc>,
}

/// A service-queue row: the iteration anchor of a multi-step record.
#[derive(Debug, Clone)]
pub struct ServiceRow {
    pub id: Id,
    pub record_id: Id,
    pub service_state: Value,
    pub compute_tag: String,
    pub compute_priority: ComputePriority,
    pub find_existing: bool,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ServiceDependencyRow {
    pub id: Id,
    pub service_id: Id,
    pub record_id: Id,
    pub extras: Value,
}

/// One pushed frame of a record's revert stack: the pre-change status plus
/// enough task information to recreate the task row on revert.
#[derive(Debug, Clone)]
pub struct InfoBackupRow {
    pub id: Id,
    pub record_id: Id,
    pub old_status: RecordStatus,
    pub compute_tag: Option<String>,
    pub compute_priority: Option<ComputePriority>,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ManagerRow {
    pub id: Id,
    pub name: String,
    pub cluster: String,
    pub hostname: String,
    pub uuid: String,
    pub manager_version: String,
    pub username: Option<String>,
    pub programs: BTreeMap<String, Option<String>>,
    pub tags: Vec<String>,
    pub status: ManagerStatus,
    pub claimed: i64,
    pub successes: i64,
    pub failures: i64,
    pub rejected: i64,
    pub resources: ManagerResources,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ManagerQueryFilters {
    pub name: Option<Vec<String>>,
    pub cluster: Option<Vec<String>>,
    pub hostname: Option<Vec<String>>,
    pub status: Option<Vec<ManagerStatus>>,
    pub modified_before: Option<DateTime<Utc>>,
    pub modified_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub skip: usize,
}

/// Snapshot of one dependency, as loaded for a service iteration.
#[derive(Debug, Clone)]
pub struct ServiceDependencySnapshot {
    pub record_id: Id,
    pub extras: Value,
    pub status: RecordStatus,
    /// Present when the dependency is complete.
    pub detail: Option<RecordDetail>,
}

/// Everything a service iteration reads, loaded in one atomic step.
#[derive(Debug, Clone)]
pub struct ServiceIterationData {
    pub record: RecordRow,
    pub service: ServiceRow,
    pub detail: RecordDetail,
    pub dependencies: Vec<ServiceDependencySnapshot>,
}

#[derive(Debug, Clone)]
pub struct NewServiceDependency {
    pub record_id: Id,
    pub extras: Value,
}

/// Everything a service iteration writes, applied in one atomic step.
/// The apply refuses if the record left the waiting/running states between
/// load and apply.
#[derive(Debug, Clone, Default)]
pub struct ServiceIterationUpdate {
    pub new_status: Option<RecordStatus>,
    pub new_state: Option<Value>,
    pub replace_dependencies: Option<Vec<NewServiceDependency>>,
    pub detail: Option<RecordDetail>,
    pub append_output: Option<(OutputType, String)>,
    pub error: Option<ComputeError>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalJobStatus {
    Waiting,
    Running,
    Complete,
    Error,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct InternalJobRow {
    pub id: Id,
    pub name: String,
    pub status: InternalJobStatus,
    pub added_on: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub ended_on: Option<DateTime<Utc>>,
    pub runner_uuid: Option<String>,
    pub progress: i32,
    pub unique_name: Option<String>,
    pub serial_group: Option<String>,
    pub repeat_delay_seconds: Option<i64>,
    pub kwargs: Value,
    pub result: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewInternalJob {
    pub name: String,
    pub scheduled_for: DateTime<Utc>,
    pub unique_name: Option<String>,
    pub serial_group: Option<String>,
    pub repeat_delay_seconds: Option<i64>,
    pub kwargs: Value,
}

#[derive(Debug, Clone)]
pub struct NewDataset {
    pub dataset_type: RecordType,
    pub name: String,
    pub description: String,
    pub default_compute_tag: String,
    pub default_compute_priority: ComputePriority,
}

#[derive(Debug, Clone)]
pub struct DatasetRow {
    pub id: Id,
    pub dataset_type: RecordType,
    pub name: String,
    pub description: String,
    pub default_compute_tag: String,
    pub default_compute_priority: ComputePriority,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DatasetEntry {
    pub name: String,
    pub comment: Option<String>,
    pub input: RecordInput,
    pub attributes: Value,
}

#[derive(Debug, Clone)]
pub struct DatasetSpecificationEntry {
    pub name: String,
    pub specification: RecordSpecification,
}

#[derive(Debug, Clone)]
pub struct DatasetRecordRow {
    pub dataset_id: Id,
    pub entry_name: String,
    pub specification_name: String,
    pub record_id: Id,
}

/// Build the engine payload and required programs for a single-point leaf.
pub(crate) fn singlepoint_task_spec(
    spec: &QcSpecification,
    keywords: &BTreeMap<String, Value>,
    molecule: &Molecule,
) -> (TaskSpec, BTreeMap<String, Option<String>>) {
    let input = serde_json::json!({
        "molecule": molecule,
        "driver": spec.driver,
        "model": { "method": spec.method, "basis": spec.basis },
        "keywords": keywords,
        "protocols": spec.protocols,
    });
    let required = [(spec.program.clone(), None)].into_iter().collect();
    (TaskSpec::compute(input, &spec.program), required)
}

/// Build the engine payload and required programs for an optimization leaf.
/// The inner program rides along in the optimizer keywords.
pub(crate) fn optimization_task_spec(
    spec: &OptimizationSpecification,
    qc_spec: &QcSpecification,
    keywords: &BTreeMap<String, Value>,
    molecule: &Molecule,
) -> (TaskSpec, BTreeMap<String, Option<String>>) {
    let mut opt_keywords = spec.keywords.clone();
    if let Value::Object(map) = &mut opt_keywords {
        map.insert(
            "program".to_string(),
            Value::String(qc_spec.program.clone()),
        );
    }

    let input = serde_json::json!({
        "initial_molecule": molecule,
        "input_specification": {
            "model": { "method": qc_spec.method, "basis": qc_spec.basis },
            "keywords": keywords,
            "driver": models::Driver::Deferred,
        },
        "keywords": opt_keywords,
        "protocols": spec.protocols,
    });
    let required = [
        (spec.program.clone(), None),
        (qc_spec.program.clone(), None),
    ]
    .into_iter()
    .collect();
    (TaskSpec::compute_procedure(input, &spec.program), required)
}

/// The dedup identity of one record: record type, specification id, and the
/// canonical input key.
pub(crate) fn record_dedup_key(record_type: RecordType, spec_id: Id, input_key: &str) -> String {
    format!("{record_type}:{spec_id}:{input_key}")
}

/// Extract the error type out of a stored error output blob.
pub(crate) fn stored_error_type(outputs: &BTreeMap<OutputType, models::CompressedBlob>) -> Option<String> {
    outputs
        .get(&OutputType::Error)
        .and_then(|blob| blob.decompress().ok())
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .and_then(|v| {
            v.get("error_type")
                .and_then(|t| t.as_str())
                .map(String::from)
        })
}

/// The storage contract. Every multi-row mutation is atomic with respect to
/// every other call; ordering guarantees are documented per method.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // -- content-addressed store ------------------------------------------

    /// Insert-or-lookup molecules. Mixed batches of ids and payloads are
    /// accepted; ids pass through after an existence check. Duplicates
    /// within the batch collapse to one insertion.
    async fn add_molecules(
        &self,
        molecules: &[MoleculeUpload],
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)>;

    async fn get_molecules(&self, ids: &[Id], missing_ok: bool)
        -> Result<Vec<Option<MoleculeRow>>>;

    async fn update_molecule_identifiers(
        &self,
        id: Id,
        identifiers: &MoleculeIdentifiers,
    ) -> Result<()>;

    async fn add_keywords(
        &self,
        keywords: &[KeywordSet],
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)>;

    async fn get_keywords(&self, ids: &[Id], missing_ok: bool)
        -> Result<Vec<Option<KeywordSetRow>>>;

    async fn add_qc_specifications(
        &self,
        specs: &[QcSpecificationInput],
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)>;

    async fn get_qc_specification(&self, id: Id) -> Result<QcSpecification>;
    async fn get_optimization_specification(&self, id: Id) -> Result<OptimizationSpecification>;
    async fn get_torsiondrive_specification(&self, id: Id) -> Result<TorsiondriveSpecification>;
    async fn get_gridoptimization_specification(
        &self,
        id: Id,
    ) -> Result<GridoptimizationSpecification>;
    async fn get_manybody_specification(&self, id: Id) -> Result<ManybodySpecification>;
    async fn get_reaction_specification(&self, id: Id) -> Result<ReactionSpecification>;
    async fn get_neb_specification(&self, id: Id) -> Result<NebSpecification>;

    // -- record store -----------------------------------------------------

    /// Add records for one specification applied to each input. With
    /// `find_existing`, rows with the same (specification, input) identity
    /// are returned as existing instead of duplicated.
    async fn add_records(
        &self,
        spec: &RecordSpecification,
        inputs: &[RecordInput],
        compute_tag: &str,
        compute_priority: ComputePriority,
        creator_user: Option<&str>,
        find_existing: bool,
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)>;

    async fn get_records(
        &self,
        ids: &[Id],
        projection: &ProjectionSpec,
        missing_ok: bool,
    ) -> Result<Vec<Option<RecordData>>>;

    async fn query_records(
        &self,
        filters: &RecordQueryFilters,
    ) -> Result<(QueryMetadata, Vec<Id>)>;

    async fn get_record_row(&self, id: Id) -> Result<RecordRow>;
    async fn get_record_detail(&self, id: Id) -> Result<RecordDetail>;
    async fn get_compute_history(&self, record_id: Id) -> Result<Vec<ComputeHistoryEntry>>;
    async fn get_task_row(&self, record_id: Id) -> Result<Option<TaskRow>>;
    async fn get_service_row(&self, record_id: Id) -> Result<Option<ServiceRow>>;
    async fn get_service_dependencies(&self, record_id: Id) -> Result<Vec<ServiceDependencyRow>>;
    async fn get_info_backup_depth(&self, record_id: Id) -> Result<usize>;

    async fn add_comment(&self, record_id: Id, username: Option<&str>, comment: &str)
        -> Result<Id>;
    async fn get_comments(&self, record_id: Id) -> Result<Vec<RecordComment>>;

    /// Direct children of a record (optimization trajectory, service
    /// dependencies and per-type history).
    async fn get_children_ids(&self, record_id: Id) -> Result<Vec<Id>>;

    // -- task queue -------------------------------------------------------

    /// Atomically claim up to `limit` eligible tasks for a manager. Tasks
    /// are returned in manager-tag order, then priority descending, then
    /// submission order. Two concurrent claims never see the same task.
    async fn claim_tasks(
        &self,
        manager_name: &str,
        programs: &BTreeMap<String, Option<String>>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<ClaimedTask>>;

    /// Fold returned results into records. Each entry is accepted or
    /// rejected independently; rejection reasons follow the manager
    /// contract.
    async fn return_results(
        &self,
        manager_name: &str,
        results: Vec<(Id, ResultEnvelope)>,
        auto_reset: &AutoResetPolicy,
    ) -> Result<Vec<(Id, ReturnOutcome)>>;

    /// Return every running record claimed by the named managers to
    /// waiting. Used by deactivation and the heartbeat reaper.
    async fn reset_assigned_tasks(&self, manager_names: &[String]) -> Result<usize>;

    // -- manager registry -------------------------------------------------

    async fn activate_manager(&self, activation: &ManagerActivation) -> Result<Id>;
    async fn manager_heartbeat(&self, name: &str, resources: &ManagerResources) -> Result<()>;
    async fn deactivate_managers(&self, names: &[String]) -> Result<Vec<String>>;
    async fn deactivate_managers_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;
    async fn get_manager(&self, name: &str) -> Result<ManagerRow>;
    async fn query_managers(
        &self,
        filters: &ManagerQueryFilters,
    ) -> Result<(QueryMetadata, Vec<ManagerRow>)>;

    // -- status engine ----------------------------------------------------

    async fn reset_records(&self, ids: &[Id]) -> Result<UpdateMetadata>;
    async fn cancel_records(&self, ids: &[Id]) -> Result<UpdateMetadata>;
    async fn uncancel_records(&self, ids: &[Id]) -> Result<UpdateMetadata>;
    async fn invalidate_records(&self, ids: &[Id]) -> Result<UpdateMetadata>;
    async fn uninvalidate_records(&self, ids: &[Id]) -> Result<UpdateMetadata>;
    async fn delete_records(
        &self,
        ids: &[Id],
        soft: bool,
        delete_children: bool,
    ) -> Result<UpdateMetadata>;
    async fn undelete_records(&self, ids: &[Id]) -> Result<UpdateMetadata>;

    // -- service engine support ------------------------------------------

    /// Record ids of services in waiting/running, ordered by priority
    /// descending then modified ascending, capped at `limit`.
    async fn service_queue(&self, limit: usize) -> Result<Vec<Id>>;
    async fn load_service_iteration(&self, record_id: Id) -> Result<ServiceIterationData>;
    async fn apply_service_iteration(
        &self,
        record_id: Id,
        update: ServiceIterationUpdate,
    ) -> Result<()>;

    /// Reset running records whose manager is no longer active.
    async fn sweep_stale_running(&self) -> Result<usize>;

    // -- internal jobs ----------------------------------------------------

    /// Add a job. When `unique_name` is set and a waiting/running job with
    /// that name exists, the existing job's id is returned instead.
    async fn add_internal_job(&self, job: NewInternalJob) -> Result<Id>;
    async fn claim_internal_jobs(
        &self,
        runner_uuid: &str,
        limit: usize,
    ) -> Result<Vec<InternalJobRow>>;
    /// Record progress; returns true if the job was cancelled and the runner
    /// should abort it.
    async fn update_internal_job_progress(&self, id: Id, progress: i32) -> Result<bool>;
    async fn finish_internal_job(
        &self,
        id: Id,
        status: InternalJobStatus,
        result: Option<Value>,
    ) -> Result<()>;
    async fn cancel_internal_job(&self, id: Id) -> Result<()>;
    async fn get_internal_job(&self, id: Id) -> Result<InternalJobRow>;

    // -- datasets ---------------------------------------------------------

    async fn add_dataset(&self, dataset: NewDataset) -> Result<Id>;
    async fn get_dataset(&self, id: Id) -> Result<DatasetRow>;
    async fn add_dataset_entries(
        &self,
        dataset_id: Id,
        entries: &[DatasetEntry],
    ) -> Result<InsertMetadata>;
    async fn add_dataset_specifications(
        &self,
        dataset_id: Id,
        specs: &[DatasetSpecificationEntry],
    ) -> Result<InsertMetadata>;
    async fn get_dataset_entries(&self, dataset_id: Id) -> Result<Vec<DatasetEntry>>;
    async fn get_dataset_specifications(
        &self,
        dataset_id: Id,
    ) -> Result<Vec<DatasetSpecificationEntry>>;
    async fn attach_dataset_records(
        &self,
        dataset_id: Id,
        items: &[(String, String, Id)],
    ) -> Result<()>;
    async fn get_dataset_records(&self, dataset_id: Id) -> Result<Vec<DatasetRecordRow>>;
}
