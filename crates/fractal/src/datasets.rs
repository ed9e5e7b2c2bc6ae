//! The dataset layer: named collections of (entry × specification) pairs,
//! all funneled through the record store so identical work is reused.

use std::collections::BTreeMap;

use models::{
    ComputePriority, Id, InsertMetadata, ProjectionSpec, RecordData, RecordDetail, RecordInput,
    RecordStatus, Result, ServerError,
};

use crate::store::{DatasetEntry, Store};

/// Submit the full (entry × specification) cross product. Pairs that
/// already have a record item are skipped; everything else goes through
/// `add_records` with `find_existing = true`, so previously-computed
/// identical work is linked rather than recomputed.
pub async fn submit_dataset(
    store: &dyn Store,
    dataset_id: Id,
    compute_tag: Option<&str>,
    compute_priority: Option<ComputePriority>,
) -> Result<InsertMetadata> {
    let dataset = store.get_dataset(dataset_id).await?;
    let entries = store.get_dataset_entries(dataset_id).await?;
    let specifications = store.get_dataset_specifications(dataset_id).await?;
    let existing = store.get_dataset_records(dataset_id).await?;

    let already: std::collections::BTreeSet<(String, String)> = existing
        .into_iter()
        .map(|r| (r.entry_name, r.specification_name))
        .collect();

    let tag = compute_tag.unwrap_or(&dataset.default_compute_tag);
    let priority = compute_priority.unwrap_or(dataset.default_compute_priority);

    let mut meta = InsertMetadata::default();
    let mut idx = 0usize;
    let mut items: Vec<(String, String, Id)> = Vec::new();

    for specification in &specifications {
        for entry in &entries {
            if already.contains(&(entry.name.clone(), specification.name.clone())) {
                meta.mark_existing(idx);
                idx += 1;
                continue;
            }

            let (add_meta, ids) = store
                .add_records(
                    &specification.specification,
                    std::slice::from_ref(&entry.input),
                    tag,
                    priority,
                    None,
                    true,
                )
                .await?;

            match ids.first().copied().flatten() {
                Some(record_id) if add_meta.success() => {
                    if add_meta.n_inserted() > 0 {
                        meta.mark_inserted(idx);
                    } else {
                        meta.mark_existing(idx);
                    }
                    items.push((entry.name.clone(), specification.name.clone(), record_id));
                }
                _ => {
                    meta.mark_error(
                        idx,
                        format!(
                            "entry '{}' x specification '{}': {}",
                            entry.name,
                            specification.name,
                            add_meta.error_string()
                        ),
                    );
                }
            }
            idx += 1;
        }
    }

    store.attach_dataset_records(dataset_id, &items).await?;
    Ok(meta)
}

/// Child record statuses, broken down by specification name.
pub async fn dataset_status(
    store: &dyn Store,
    dataset_id: Id,
) -> Result<BTreeMap<String, BTreeMap<RecordStatus, usize>>> {
    let items = store.get_dataset_records(dataset_id).await?;
    let ids: Vec<Id> = items.iter().map(|i| i.record_id).collect();
    let records = store
        .get_records(&ids, &ProjectionSpec::with_include(&["status"]), true)
        .await?;

    let mut status: BTreeMap<String, BTreeMap<RecordStatus, usize>> = BTreeMap::new();
    for (item, record) in items.iter().zip(records) {
        if let Some(record_status) = record.and_then(|r| r.status) {
            *status
                .entry(item.specification_name.clone())
                .or_default()
                .entry(record_status)
                .or_default() += 1;
        }
    }
    Ok(status)
}

/// Fetch the records bound to a dataset, labeled by entry and
/// specification name.
pub async fn fetch_dataset_records(
    store: &dyn Store,
    dataset_id: Id,
    projection: &ProjectionSpec,
) -> Result<Vec<(String, String, Option<RecordData>)>> {
    let items = store.get_dataset_records(dataset_id).await?;
    let ids: Vec<Id> = items.iter().map(|i| i.record_id).collect();
    let records = store.get_records(&ids, projection, true).await?;

    Ok(items
        .into_iter()
        .zip(records)
        .map(|(item, record)| (item.entry_name, item.specification_name, record))
        .collect())
}

/// Seed a singlepoint dataset from an optimization dataset: each completed
/// optimization contributes its final molecule, preserving the entry's
/// comment and attributes.
pub async fn add_entries_from_optimization(
    store: &dyn Store,
    target_dataset_id: Id,
    source_dataset_id: Id,
    source_specification_name: &str,
) -> Result<InsertMetadata> {
    let target = store.get_dataset(target_dataset_id).await?;
    if target.dataset_type != models::RecordType::Singlepoint {
        return Err(ServerError::InvalidPayload(format!(
            "entries can only be seeded into a singlepoint dataset, not {}",
            target.dataset_type
        )));
    }
    let source = store.get_dataset(source_dataset_id).await?;
    if source.dataset_type != models::RecordType::Optimization {
        return Err(ServerError::InvalidPayload(format!(
            "entries can only be seeded from an optimization dataset, not {}",
            source.dataset_type
        )));
    }

    let source_entries = store.get_dataset_entries(source_dataset_id).await?;
    let items = store.get_dataset_records(source_dataset_id).await?;
    let by_entry: BTreeMap<&str, Id> = items
        .iter()
        .filter(|i| i.specification_name == source_specification_name)
        .map(|i| (i.entry_name.as_str(), i.record_id))
        .collect();

    let mut new_entries = Vec::new();
    let mut kept_idx = Vec::new();
    let mut meta = InsertMetadata::default();

    for (idx, entry) in source_entries.iter().enumerate() {
        let Some(&record_id) = by_entry.get(entry.name.as_str()) else {
            meta.mark_error(
                idx,
                format!(
                    "entry '{}' has no record for specification '{}'",
                    entry.name, source_specification_name
                ),
            );
            continue;
        };

        let detail = store.get_record_detail(record_id).await?;
        let final_molecule_id = match detail {
            RecordDetail::Optimization {
                final_molecule_id: Some(id),
                ..
            } => id,
            _ => {
                meta.mark_error(
                    idx,
                    format!("entry '{}' has not completed its optimization", entry.name),
                );
                continue;
            }
        };

        new_entries.push(DatasetEntry {
            name: entry.name.clone(),
            comment: entry.comment.clone(),
            input: RecordInput::Singlepoint {
                molecule: models::MoleculeUpload::Id(final_molecule_id),
            },
            attributes: entry.attributes.clone(),
        });
        kept_idx.push(idx);
    }

    // Map the add results back onto source-entry indices, since failed
    // source entries never reached the add.
    let add_meta = store
        .add_dataset_entries(target_dataset_id, &new_entries)
        .await?;
    for i in add_meta.inserted_idx {
        meta.mark_inserted(kept_idx[i]);
    }
    for i in add_meta.existing_idx {
        meta.mark_existing(kept_idx[i]);
    }
    for (i, msg) in add_meta.errors {
        meta.mark_error(kept_idx[i], msg);
    }
    Ok(meta)
}
