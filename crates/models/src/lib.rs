//! Domain and wire types for the compute coordination server.
//!
//! Everything content-addressed lives here (molecules, keyword sets,
//! specifications) together with the record/status/manager vocabulary and
//! the batch metadata types shared by the server and its storage backends.

pub mod hash;
mod id;
mod error;
mod keywords;
mod manager;
mod metadata;
mod molecule;
mod record;
pub mod services;
pub mod specification;
mod submission;
mod task;

pub use error::ServerError;
pub use id::Id;
pub use keywords::{KeywordSet, KeywordsUpload};
pub use manager::{ManagerActivation, ManagerName, ManagerResources, ManagerStatus};
pub use metadata::{InsertMetadata, QueryMetadata, UpdateMetadata};
pub use molecule::{Molecule, MoleculeIdentifiers, MoleculeUpload};
pub use record::{
    CompressedBlob, CompressionKind, ComputeHistoryEntry, ComputePriority, Driver, OutputType,
    RecordComment, RecordStatus, RecordType,
};
pub use specification::{
    normalize_basis, normalize_name, OptimizationSpecification, OptimizationSpecificationInput,
    QcSpecification, QcSpecificationInput,
};
pub use submission::{
    check_input_types, ManybodyClusterData, ProjectionSpec, ReactionComponentData, RecordData,
    RecordDetail, RecordInput, RecordQueryFilters, RecordSpecification, ServiceData,
    ServiceDependencyData, TaskData,
};
pub use task::{
    ClaimedTask, ComputeError, FailurePayload, Provenance, ResultEnvelope, ReturnOutcome,
    SuccessPayload, TaskResult, TaskSpec, TrajectoryStep,
};

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
