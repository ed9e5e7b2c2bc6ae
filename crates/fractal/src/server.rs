//! The server facade: the manager and submitter contracts, with api-limit
//! enforcement, over any [`Store`] backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use models::{
    ClaimedTask, ComputePriority, Id, InsertMetadata, KeywordSet, ManagerActivation,
    ManagerResources, MoleculeUpload, ProjectionSpec, QueryMetadata, RecordData, RecordInput,
    RecordQueryFilters, RecordSpecification, RecordStatus, Result, ResultEnvelope, ReturnOutcome,
    ServerError, UpdateMetadata,
};

use crate::config::FractalConfig;
use crate::store::{
    DatasetEntry, DatasetSpecificationEntry, KeywordSetRow, MoleculeRow, NewDataset, Store,
};
use crate::{datasets, store};

pub struct Server {
    store: Arc<dyn Store>,
    config: FractalConfig,
}

fn check_limit(resource: &'static str, requested: usize, limit: usize) -> Result<()> {
    if requested > limit {
        return Err(ServerError::LimitExceeded {
            resource,
            requested,
            limit,
        });
    }
    Ok(())
}

impl Server {
    pub fn new(store: Arc<dyn Store>, config: FractalConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &FractalConfig {
        &self.config
    }

    // -- manager contract -------------------------------------------------

    /// Activate a manager; returns its assigned name.
    pub async fn activate_manager(&self, activation: &ManagerActivation) -> Result<String> {
        self.store.activate_manager(activation).await?;
        let name = activation.name.fullname();
        tracing::info!(%name, "manager activated");
        Ok(name)
    }

    pub async fn manager_heartbeat(
        &self,
        name: &str,
        resources: &ManagerResources,
    ) -> Result<()> {
        self.store.manager_heartbeat(name, resources).await
    }

    pub async fn claim_tasks(
        &self,
        manager_name: &str,
        programs: &BTreeMap<String, Option<String>>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<ClaimedTask>> {
        self.store
            .claim_tasks(manager_name, programs, tags, limit)
            .await
    }

    pub async fn return_results(
        &self,
        manager_name: &str,
        results: Vec<(Id, ResultEnvelope)>,
    ) -> Result<Vec<(Id, ReturnOutcome)>> {
        self.store
            .return_results(manager_name, results, &self.config.auto_reset)
            .await
    }

    pub async fn deactivate_manager(&self, name: &str) -> Result<()> {
        let deactivated = self.store.deactivate_managers(&[name.to_string()]).await?;
        tracing::info!(%name, deactivated = !deactivated.is_empty(), "manager deactivated");
        Ok(())
    }

    // -- content ----------------------------------------------------------

    pub async fn add_molecules(
        &self,
        molecules: &[MoleculeUpload],
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)> {
        check_limit(
            "add_records",
            molecules.len(),
            self.config.api_limits.add_records,
        )?;
        self.store.add_molecules(molecules).await
    }

    pub async fn get_molecules(
        &self,
        ids: &[Id],
        missing_ok: bool,
    ) -> Result<Vec<Option<MoleculeRow>>> {
        check_limit("get_records", ids.len(), self.config.api_limits.get_records)?;
        self.store.get_molecules(ids, missing_ok).await
    }

    pub async fn add_keywords(
        &self,
        keywords: &[KeywordSet],
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)> {
        check_limit(
            "add_records",
            keywords.len(),
            self.config.api_limits.add_records,
        )?;
        self.store.add_keywords(keywords).await
    }

    pub async fn get_keywords(
        &self,
        ids: &[Id],
        missing_ok: bool,
    ) -> Result<Vec<Option<KeywordSetRow>>> {
        check_limit("get_records", ids.len(), self.config.api_limits.get_records)?;
        self.store.get_keywords(ids, missing_ok).await
    }

    // -- submitter contract -----------------------------------------------

    pub async fn add_records(
        &self,
        spec: &RecordSpecification,
        inputs: &[RecordInput],
        compute_tag: &str,
        compute_priority: ComputePriority,
        find_existing: bool,
    ) -> Result<(InsertMetadata, Vec<Option<Id>>)> {
        check_limit(
            "add_records",
            inputs.len(),
            self.config.api_limits.add_records,
        )?;
        self.store
            .add_records(
                spec,
                inputs,
                compute_tag,
                compute_priority,
                None,
                find_existing,
            )
            .await
    }

    pub async fn get_records(
        &self,
        ids: &[Id],
        projection: &ProjectionSpec,
        missing_ok: bool,
    ) -> Result<Vec<Option<RecordData>>> {
        check_limit("get_records", ids.len(), self.config.api_limits.get_records)?;
        self.store.get_records(ids, projection, missing_ok).await
    }

    /// Query with the server-side limit cap applied.
    pub async fn query_records(
        &self,
        filters: &RecordQueryFilters,
    ) -> Result<(QueryMetadata, Vec<Id>)> {
        let cap = self.config.api_limits.get_records;
        let mut filters = filters.clone();
        filters.limit = Some(filters.limit.map_or(cap, |l| l.min(cap)));
        self.store.query_records(&filters).await
    }

    pub async fn reset_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        self.store.reset_records(ids).await
    }
    pub async fn cancel_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        self.store.cancel_records(ids).await
    }
    pub async fn uncancel_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        self.store.uncancel_records(ids).await
    }
    pub async fn invalidate_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        self.store.invalidate_records(ids).await
    }
    pub async fn uninvalidate_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        self.store.uninvalidate_records(ids).await
    }
    pub async fn delete_records(
        &self,
        ids: &[Id],
        soft: bool,
        delete_children: bool,
    ) -> Result<UpdateMetadata> {
        self.store.delete_records(ids, soft, delete_children).await
    }
    pub async fn undelete_records(&self, ids: &[Id]) -> Result<UpdateMetadata> {
        self.store.undelete_records(ids).await
    }

    // -- datasets ---------------------------------------------------------

    pub async fn add_dataset(&self, dataset: NewDataset) -> Result<Id> {
        self.store.add_dataset(dataset).await
    }

    pub async fn add_dataset_entries(
        &self,
        dataset_id: Id,
        entries: &[DatasetEntry],
    ) -> Result<InsertMetadata> {
        check_limit(
            "add_records",
            entries.len(),
            self.config.api_limits.add_records,
        )?;
        self.store.add_dataset_entries(dataset_id, entries).await
    }

    pub async fn add_dataset_specifications(
        &self,
        dataset_id: Id,
        specs: &[DatasetSpecificationEntry],
    ) -> Result<InsertMetadata> {
        self.store.add_dataset_specifications(dataset_id, specs).await
    }

    pub async fn submit_dataset(
        &self,
        dataset_id: Id,
        compute_tag: Option<&str>,
        compute_priority: Option<ComputePriority>,
    ) -> Result<InsertMetadata> {
        datasets::submit_dataset(self.store.as_ref(), dataset_id, compute_tag, compute_priority)
            .await
    }

    pub async fn dataset_status(
        &self,
        dataset_id: Id,
    ) -> Result<std::collections::BTreeMap<String, std::collections::BTreeMap<RecordStatus, usize>>>
    {
        datasets::dataset_status(self.store.as_ref(), dataset_id).await
    }

    pub async fn fetch_dataset_records(
        &self,
        dataset_id: Id,
        projection: &ProjectionSpec,
    ) -> Result<Vec<(String, String, Option<RecordData>)>> {
        let entries = self.store.get_dataset_records(dataset_id).await?;
        check_limit(
            "get_dataset_entries",
            entries.len(),
            self.config.api_limits.get_dataset_entries,
        )?;
        datasets::fetch_dataset_records(self.store.as_ref(), dataset_id, projection).await
    }

    pub async fn get_dataset_entries(&self, dataset_id: Id) -> Result<Vec<store::DatasetEntry>> {
        self.store.get_dataset_entries(dataset_id).await
    }
}
