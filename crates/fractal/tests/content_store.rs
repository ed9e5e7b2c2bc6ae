//! Deduplication behavior of the content-addressed store.

mod common;

use std::collections::BTreeMap;

use common::*;
use fractal::store::Store;
use models::{Driver, Id, KeywordSet, KeywordsUpload, MoleculeUpload, ServerError};

#[tokio::test]
async fn molecule_inserted_twice_maps_to_one_row() {
    let store = mem_store();
    let h2 = models::Molecule::from_symbols_geometry(&["H", "H"], &[0.0, 0.0, 0.0, 0.0, 0.0, 2.0]);

    let (meta1, ids1) = store
        .add_molecules(&[MoleculeUpload::New(Box::new(h2.clone()))])
        .await
        .unwrap();
    let (meta2, ids2) = store
        .add_molecules(&[MoleculeUpload::New(Box::new(h2))])
        .await
        .unwrap();

    assert_eq!(meta1.n_inserted(), 1);
    assert_eq!(meta1.n_existing(), 0);
    assert_eq!(meta2.n_inserted(), 0);
    assert_eq!(meta2.n_existing(), 1);
    assert_eq!(ids1[0], ids2[0]);
}

#[tokio::test]
async fn duplicates_within_one_batch_collapse() {
    let store = mem_store();
    let mol = water();

    let (meta, ids) = store
        .add_molecules(&[
            MoleculeUpload::New(Box::new(mol.clone())),
            MoleculeUpload::New(Box::new(mol)),
        ])
        .await
        .unwrap();

    assert_eq!(meta.n_inserted(), 1);
    assert_eq!(meta.n_existing(), 1);
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn mixed_batches_pass_known_ids_through() {
    let store = mem_store();
    let (_, ids) = store
        .add_molecules(&[MoleculeUpload::New(Box::new(water()))])
        .await
        .unwrap();
    let known = ids[0].unwrap();

    let (meta, ids) = store
        .add_molecules(&[
            MoleculeUpload::Id(known),
            MoleculeUpload::New(Box::new(hydrogen_peroxide())),
            MoleculeUpload::Id(Id(999_999)),
        ])
        .await
        .unwrap();

    assert_eq!(ids[0], Some(known));
    assert_eq!(meta.n_existing(), 1);
    assert_eq!(meta.n_inserted(), 1);
    // The unknown id is a per-item error, not a batch failure.
    assert_eq!(meta.error_idx(), vec![2]);
    assert_eq!(ids[2], None);
}

#[tokio::test]
async fn invalid_molecule_is_a_per_item_error() {
    let store = mem_store();
    let mut bad = water();
    bad.geometry.pop();

    let (meta, ids) = store
        .add_molecules(&[
            MoleculeUpload::New(Box::new(bad)),
            MoleculeUpload::New(Box::new(water())),
        ])
        .await
        .unwrap();

    assert_eq!(meta.error_idx(), vec![0]);
    assert_eq!(ids[0], None);
    assert!(ids[1].is_some());
}

#[tokio::test]
async fn keyword_sets_deduplicate_by_canonical_hash() {
    let store = mem_store();
    let a = KeywordSet::new(
        [("SCF_TYPE".to_string(), serde_json::json!("df"))]
            .into_iter()
            .collect(),
    );
    let b = KeywordSet::new(
        [("scf_type".to_string(), serde_json::json!("df"))]
            .into_iter()
            .collect(),
    );

    let (meta, ids) = store.add_keywords(&[a, b]).await.unwrap();
    assert_eq!(meta.n_inserted(), 1);
    assert_eq!(meta.n_existing(), 1);
    assert_eq!(ids[0], ids[1]);

    // Stored form is the normalized one.
    let rows = store.get_keywords(&[ids[0].unwrap()], false).await.unwrap();
    assert!(rows[0]
        .as_ref()
        .unwrap()
        .keywords
        .values
        .contains_key("scf_type"));
}

#[tokio::test]
async fn qc_specifications_normalize_before_dedup() {
    let store = mem_store();

    let mut a = qc_spec("Psi4", Driver::Energy);
    a.method = "B3LYP".to_string();
    let mut b = qc_spec("psi4", Driver::Energy);
    b.method = " b3lyp ".to_string();

    let (meta, ids) = store.add_qc_specifications(&[a, b]).await.unwrap();
    assert_eq!(meta.n_inserted(), 1);
    assert_eq!(meta.n_existing(), 1);
    assert_eq!(ids[0], ids[1]);

    let spec = store.get_qc_specification(ids[0].unwrap()).await.unwrap();
    assert_eq!(spec.program, "psi4");
    assert_eq!(spec.method, "b3lyp");
}

#[tokio::test]
async fn empty_basis_means_no_basis() {
    let store = mem_store();

    let mut a = qc_spec("psi4", Driver::Energy);
    a.basis = Some("".to_string());
    let mut b = qc_spec("psi4", Driver::Energy);
    b.basis = None;

    let (meta, ids) = store.add_qc_specifications(&[a, b]).await.unwrap();
    assert_eq!(meta.n_inserted(), 1);
    assert_eq!(ids[0], ids[1]);

    let spec = store.get_qc_specification(ids[0].unwrap()).await.unwrap();
    assert_eq!(spec.basis, None);
}

#[tokio::test]
async fn inline_and_by_id_keywords_yield_the_same_specification() {
    let store = mem_store();
    let kws = KeywordSet::new(
        [("maxiter".to_string(), serde_json::json!(50))]
            .into_iter()
            .collect(),
    );
    let (_, kw_ids) = store.add_keywords(std::slice::from_ref(&kws)).await.unwrap();

    let mut inline = qc_spec("psi4", Driver::Energy);
    inline.keywords = KeywordsUpload::New(kws);
    let mut by_id = qc_spec("psi4", Driver::Energy);
    by_id.keywords = KeywordsUpload::Id(kw_ids[0].unwrap());

    let (meta, ids) = store.add_qc_specifications(&[inline, by_id]).await.unwrap();
    assert_eq!(meta.n_inserted(), 1);
    assert_eq!(meta.n_existing(), 1);
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn get_molecules_missing_ok_substitutes_null() {
    let store = mem_store();
    let (_, ids) = store
        .add_molecules(&[MoleculeUpload::New(Box::new(water()))])
        .await
        .unwrap();
    let known = ids[0].unwrap();

    let rows = store
        .get_molecules(&[known, Id(424242)], true)
        .await
        .unwrap();
    assert!(rows[0].is_some());
    assert!(rows[1].is_none());

    let err = store
        .get_molecules(&[known, Id(424242)], false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::MissingData(_)));
}

#[tokio::test]
async fn identifier_updates_do_not_change_identity() {
    let store = mem_store();
    let (_, ids) = store
        .add_molecules(&[MoleculeUpload::New(Box::new(water()))])
        .await
        .unwrap();
    let id = ids[0].unwrap();

    let identifiers = models::MoleculeIdentifiers {
        name: Some("water".to_string()),
        comment: Some("test molecule".to_string()),
        extras: BTreeMap::new(),
    };
    store
        .update_molecule_identifiers(id, &identifiers)
        .await
        .unwrap();

    let rows = store.get_molecules(&[id], false).await.unwrap();
    assert_eq!(
        rows[0].as_ref().unwrap().molecule.identifiers.name.as_deref(),
        Some("water")
    );

    // Resubmitting the unnamed payload still maps to the same row.
    let (meta, ids2) = store
        .add_molecules(&[MoleculeUpload::New(Box::new(water()))])
        .await
        .unwrap();
    assert_eq!(meta.n_existing(), 1);
    assert_eq!(ids2[0], Some(id));
}
