//! Status transitions, revert round trips, cascades, and auto-reset.

mod common;

use common::*;
use fractal::config::AutoResetPolicy;
use fractal::store::Store;
use models::{
    ComputePriority, Id, MoleculeUpload, RecordInput, RecordSpecification, RecordStatus,
    ResultEnvelope, ServerError,
};

async fn submit_one(store: &dyn Store, molecule: models::Molecule) -> Id {
    let (spec, inputs) = singlepoint_submission("psi4", molecule);
    let (_, ids) = store
        .add_records(&spec, &inputs, "tag1", ComputePriority::Normal, None, true)
        .await
        .unwrap();
    ids[0].unwrap()
}

async fn status_of(store: &dyn Store, id: Id) -> RecordStatus {
    store.get_record_row(id).await.unwrap().status
}

#[tokio::test]
async fn cancel_uncancel_round_trips_waiting() {
    let store = mem_store();
    let id = submit_one(store.as_ref(), water()).await;

    let meta = store.cancel_records(&[id]).await.unwrap();
    assert!(meta.success());
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Cancelled);
    assert!(store.get_task_row(id).await.unwrap().is_none());
    assert_eq!(store.get_info_backup_depth(id).await.unwrap(), 1);

    store.uncancel_records(&[id]).await.unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Waiting);
    assert_eq!(store.get_info_backup_depth(id).await.unwrap(), 0);

    // The recreated task keeps its tag/priority and is claimable again.
    let task = store.get_task_row(id).await.unwrap().unwrap();
    assert!(task.available);
    assert_eq!(task.compute_tag, "tag1");
    assert_eq!(task.compute_priority, ComputePriority::Normal);
}

#[tokio::test]
async fn cancel_uncancel_round_trips_error() {
    let store = mem_store();
    let id = submit_one(store.as_ref(), water()).await;

    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;
    let tasks = manager.claim(store.as_ref(), 1).await;
    store
        .return_results(
            &manager.name,
            vec![(tasks[0].task_id, ResultEnvelope::failure("e", "boom"))],
            &AutoResetPolicy::default(),
        )
        .await
        .unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Error);

    store.cancel_records(&[id]).await.unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Cancelled);

    store.uncancel_records(&[id]).await.unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Error);
    // Error tasks exist but are not claimable.
    let task = store.get_task_row(id).await.unwrap().unwrap();
    assert!(!task.available);
}

#[tokio::test]
async fn invalidate_round_trips_complete() {
    let store = mem_store();
    let id = submit_one(store.as_ref(), water()).await;
    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;
    manager.run_all(store.as_ref()).await;
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Complete);

    store.invalidate_records(&[id]).await.unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Invalid);

    store.uninvalidate_records(&[id]).await.unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Complete);
}

#[tokio::test]
async fn revert_stack_nests() {
    let store = mem_store();
    let id = submit_one(store.as_ref(), water()).await;
    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;
    manager.run_all(store.as_ref()).await;

    // complete -> invalid -> deleted -> invalid -> complete
    store.invalidate_records(&[id]).await.unwrap();
    store.delete_records(&[id], true, false).await.unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Deleted);
    assert_eq!(store.get_info_backup_depth(id).await.unwrap(), 2);

    store.undelete_records(&[id]).await.unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Invalid);
    assert_eq!(store.get_info_backup_depth(id).await.unwrap(), 1);

    store.uninvalidate_records(&[id]).await.unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Complete);
    assert_eq!(store.get_info_backup_depth(id).await.unwrap(), 0);
}

#[tokio::test]
async fn state_conflicts_are_per_id_refusals() {
    let store = mem_store();
    let complete = submit_one(store.as_ref(), hydrogen_peroxide()).await;
    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;
    manager.run_all(store.as_ref()).await;
    let waiting = submit_one(store.as_ref(), water()).await;

    // Cancelling a waiting and a complete record: one update, one refusal.
    let meta = store.cancel_records(&[waiting, complete]).await.unwrap();
    assert_eq!(meta.updated_idx, vec![0]);
    assert_eq!(meta.error_idx(), vec![1]);

    let meta = store
        .invalidate_records(&[waiting, Id(31337)])
        .await
        .unwrap();
    assert_eq!(meta.n_updated(), 0);
    assert_eq!(meta.error_idx(), vec![0, 1]);
}

#[tokio::test]
async fn reset_after_error_then_success_appends_history() {
    let store = mem_store();
    let id = submit_one(store.as_ref(), water()).await;
    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;

    let tasks = manager.claim(store.as_ref(), 1).await;
    store
        .return_results(
            &manager.name,
            vec![(tasks[0].task_id, ResultEnvelope::failure("e", "boom"))],
            &AutoResetPolicy::default(),
        )
        .await
        .unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Error);

    let meta = store.reset_records(&[id]).await.unwrap();
    assert!(meta.success());
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Waiting);
    assert_eq!(
        store.get_record_row(id).await.unwrap().manager_name,
        None
    );

    manager.run_all(store.as_ref()).await;
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Complete);

    let history = store.get_compute_history(id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, RecordStatus::Error);
    assert_eq!(history[1].status, RecordStatus::Complete);
}

#[tokio::test]
async fn auto_reset_consults_per_error_counters() {
    let store = mem_store();
    let policy: AutoResetPolicy = serde_json::from_str(
        r#"{"enabled": true, "random_error": 2, "unknown_error": 1}"#,
    )
    .unwrap();

    let id = submit_one(store.as_ref(), water()).await;
    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;

    // random_error: reset (0 prior < 2).
    let tasks = manager.claim(store.as_ref(), 1).await;
    store
        .return_results(
            &manager.name,
            vec![(tasks[0].task_id, ResultEnvelope::failure("random_error", "x"))],
            &policy,
        )
        .await
        .unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Waiting);
    assert_eq!(store.get_compute_history(id).await.unwrap().len(), 1);

    // unknown_error: reset (0 prior < 1).
    let tasks = manager.claim(store.as_ref(), 1).await;
    store
        .return_results(
            &manager.name,
            vec![(tasks[0].task_id, ResultEnvelope::failure("unknown_error", "x"))],
            &policy,
        )
        .await
        .unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Waiting);
    assert_eq!(store.get_compute_history(id).await.unwrap().len(), 2);

    // Second unknown_error: the per-type budget is spent; stays in error.
    let tasks = manager.claim(store.as_ref(), 1).await;
    store
        .return_results(
            &manager.name,
            vec![(tasks[0].task_id, ResultEnvelope::failure("unknown_error", "x"))],
            &policy,
        )
        .await
        .unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Error);
    assert_eq!(store.get_compute_history(id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn soft_delete_cascades_over_trajectory() {
    let store = mem_store();
    let (_, ids) = store
        .add_records(
            &RecordSpecification::Optimization(opt_spec()),
            &[RecordInput::Optimization {
                initial_molecule: MoleculeUpload::New(Box::new(water())),
            }],
            "tag1",
            ComputePriority::Normal,
            None,
            true,
        )
        .await
        .unwrap();
    let opt_id = ids[0].unwrap();

    let manager = SyntheticManager::activate(
        store.as_ref(),
        "host1",
        &["psi4", "geometric"],
        &["tag1"],
    )
    .await;
    manager.run_all(store.as_ref()).await;
    assert_eq!(status_of(store.as_ref(), opt_id).await, RecordStatus::Complete);

    let children = store.get_children_ids(opt_id).await.unwrap();
    assert_eq!(children.len(), 2);

    // Delete the optimization and its trajectory.
    let meta = store.delete_records(&[opt_id], true, true).await.unwrap();
    assert!(meta.success());
    assert_eq!(status_of(store.as_ref(), opt_id).await, RecordStatus::Deleted);
    for child in &children {
        assert_eq!(status_of(store.as_ref(), *child).await, RecordStatus::Deleted);
    }

    // Undelete restores every member to complete.
    store.undelete_records(&[opt_id]).await.unwrap();
    assert_eq!(status_of(store.as_ref(), opt_id).await, RecordStatus::Complete);
    for child in &children {
        assert_eq!(
            status_of(store.as_ref(), *child).await,
            RecordStatus::Complete
        );
    }
}

#[tokio::test]
async fn hard_delete_removes_rows() {
    let store = mem_store();
    let id = submit_one(store.as_ref(), water()).await;

    store.delete_records(&[id], false, false).await.unwrap();
    let err = store.get_record_row(id).await.unwrap_err();
    assert!(matches!(err, ServerError::MissingData(_)));

    // Undelete has nothing to restore.
    let meta = store.undelete_records(&[id]).await.unwrap();
    assert_eq!(meta.error_idx(), vec![0]);
}

#[tokio::test]
async fn deleting_a_waiting_record_removes_its_task() {
    let store = mem_store();
    let id = submit_one(store.as_ref(), water()).await;

    store.delete_records(&[id], true, false).await.unwrap();
    assert!(store.get_task_row(id).await.unwrap().is_none());

    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;
    assert!(manager.claim(store.as_ref(), 10).await.is_empty());

    store.undelete_records(&[id]).await.unwrap();
    assert_eq!(status_of(store.as_ref(), id).await, RecordStatus::Waiting);
    let tasks = manager.claim(store.as_ref(), 10).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].record_id, id);
}
