//! Claim, return, and routing behavior of the task queue.

mod common;

use common::*;
use fractal::config::AutoResetPolicy;
use fractal::store::Store;
use models::{
    ComputePriority, Id, MoleculeUpload, ProjectionSpec, RecordInput, RecordSpecification,
    RecordStatus, ResultEnvelope, ReturnOutcome, ServerError,
};

async fn submit_singlepoint(
    store: &dyn Store,
    program: &str,
    molecule: models::Molecule,
    tag: &str,
    priority: ComputePriority,
) -> Id {
    let (spec, inputs) = singlepoint_submission(program, molecule);
    let (meta, ids) = store
        .add_records(&spec, &inputs, tag, priority, None, true)
        .await
        .unwrap();
    assert!(meta.success());
    ids[0].unwrap()
}

#[tokio::test]
async fn leaf_task_lifecycle() {
    let store = mem_store();
    let record_id = submit_singlepoint(
        store.as_ref(),
        "psi4",
        water(),
        "tagX",
        ComputePriority::Normal,
    )
    .await;

    let manager =
        SyntheticManager::activate(store.as_ref(), "host1", &["psi4", "qcengine"], &["tagX"])
            .await;

    let tasks = manager.claim(store.as_ref(), 10).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].record_id, record_id);

    // Claimed: running, attributed, not claimable again.
    let record = store.get_record_row(record_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Running);
    assert_eq!(record.manager_name.as_deref(), Some(manager.name.as_str()));
    assert!(manager.claim(store.as_ref(), 10).await.is_empty());

    let envelope = manager.execute(&tasks[0]);
    let outcomes = store
        .return_results(&manager.name, vec![(tasks[0].task_id, envelope)], &AutoResetPolicy::default())
        .await
        .unwrap();
    assert_eq!(outcomes[0].1, ReturnOutcome::Accepted);

    let record = store.get_record_row(record_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Complete);
    assert_eq!(record.manager_name.as_deref(), Some(manager.name.as_str()));
    assert!(store.get_task_row(record_id).await.unwrap().is_none());

    let history = store.get_compute_history(record_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RecordStatus::Complete);
    assert_eq!(
        history[0].manager_name.as_deref(),
        Some(manager.name.as_str())
    );

    let mgr = store.get_manager(&manager.name).await.unwrap();
    assert_eq!(mgr.claimed, 1);
    assert_eq!(mgr.successes, 1);
    assert_eq!(mgr.failures, 0);
    assert_eq!(mgr.rejected, 0);
}

#[tokio::test]
async fn tag_routing_with_wildcard() {
    let store = mem_store();

    let id1 = submit_singlepoint(
        store.as_ref(),
        "psi4",
        water(),
        "tag1",
        ComputePriority::Normal,
    )
    .await;
    let id2 = submit_singlepoint(
        store.as_ref(),
        "psi4",
        hydrogen_peroxide(),
        "tag2",
        ComputePriority::Normal,
    )
    .await;
    let id3 = submit_singlepoint(
        store.as_ref(),
        "psi4",
        helium_dimer(),
        "tag3",
        ComputePriority::Normal,
    )
    .await;

    let manager =
        SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag3", "*"]).await;

    // The explicit tag wins, then arrival order through the wildcard.
    let tasks = manager.claim(store.as_ref(), 3).await;
    let claimed: Vec<Id> = tasks.iter().map(|t| t.record_id).collect();
    assert_eq!(claimed, vec![id3, id1, id2]);
}

#[tokio::test]
async fn claim_orders_by_priority_then_age() {
    let store = mem_store();

    let low = submit_singlepoint(store.as_ref(), "psi4", water(), "t", ComputePriority::Low).await;
    let normal_1 = submit_singlepoint(
        store.as_ref(),
        "psi4",
        hydrogen_peroxide(),
        "t",
        ComputePriority::Normal,
    )
    .await;
    let high = submit_singlepoint(
        store.as_ref(),
        "psi4",
        helium_dimer(),
        "t",
        ComputePriority::High,
    )
    .await;

    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["t"]).await;
    let tasks = manager.claim(store.as_ref(), 10).await;
    let order: Vec<Id> = tasks.iter().map(|t| t.record_id).collect();
    assert_eq!(order, vec![high, normal_1, low]);
}

#[tokio::test]
async fn programs_gate_eligibility() {
    let store = mem_store();

    let rdkit_id = submit_singlepoint(
        store.as_ref(),
        "rdkit",
        water(),
        "tag1",
        ComputePriority::Normal,
    )
    .await;
    let psi4_id = submit_singlepoint(
        store.as_ref(),
        "psi4",
        hydrogen_peroxide(),
        "tag1",
        ComputePriority::Normal,
    )
    .await;

    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["*"]).await;
    let tasks = manager.claim(store.as_ref(), 10).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].record_id, psi4_id);

    // A manager with both programs picks up the remaining task.
    let manager2 =
        SyntheticManager::activate(store.as_ref(), "host2", &["psi4", "rdkit"], &["*"]).await;
    let tasks = manager2.claim(store.as_ref(), 10).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].record_id, rdkit_id);
}

#[tokio::test]
async fn returns_from_wrong_manager_are_rejected() {
    let store = mem_store();
    submit_singlepoint(
        store.as_ref(),
        "psi4",
        water(),
        "tag1",
        ComputePriority::Normal,
    )
    .await;

    let owner = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;
    let thief = SyntheticManager::activate(store.as_ref(), "host2", &["psi4"], &["tag1"]).await;

    let tasks = owner.claim(store.as_ref(), 1).await;
    let envelope = owner.execute(&tasks[0]);

    let outcomes = store
        .return_results(
            &thief.name,
            vec![(tasks[0].task_id, envelope.clone())],
            &AutoResetPolicy::default(),
        )
        .await
        .unwrap();
    assert!(
        matches!(&outcomes[0].1, ReturnOutcome::Rejected { reason } if reason.contains("another manager"))
    );

    // Unknown task ids are rejected per item.
    let outcomes = store
        .return_results(
            &owner.name,
            vec![(Id(987_654), ResultEnvelope::failure("x", "y"))],
            &AutoResetPolicy::default(),
        )
        .await
        .unwrap();
    assert!(
        matches!(&outcomes[0].1, ReturnOutcome::Rejected { reason } if reason.contains("does not exist"))
    );

    // The real manager can still complete the work.
    let outcomes = store
        .return_results(
            &owner.name,
            vec![(tasks[0].task_id, envelope)],
            &AutoResetPolicy::default(),
        )
        .await
        .unwrap();
    assert_eq!(outcomes[0].1, ReturnOutcome::Accepted);

    let thief_row = store.get_manager(&thief.name).await.unwrap();
    assert_eq!(thief_row.rejected, 1);
}

#[tokio::test]
async fn unknown_manager_is_told_to_shut_down() {
    let store = mem_store();
    let err = store
        .claim_tasks("nobody-nowhere-0000", &Default::default(), &["*".to_string()], 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServerError::ComputeManager { shutdown: true, .. }
    ));
}

#[tokio::test]
async fn failed_return_keeps_the_task_unavailable() {
    let store = mem_store();
    let record_id = submit_singlepoint(
        store.as_ref(),
        "psi4",
        water(),
        "tag1",
        ComputePriority::Normal,
    )
    .await;

    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;
    let tasks = manager.claim(store.as_ref(), 1).await;

    store
        .return_results(
            &manager.name,
            vec![(
                tasks[0].task_id,
                ResultEnvelope::failure("random_error", "the engine exploded"),
            )],
            &AutoResetPolicy::default(),
        )
        .await
        .unwrap();

    let record = store.get_record_row(record_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Error);
    // Errored records keep their manager attribution.
    assert_eq!(record.manager_name.as_deref(), Some(manager.name.as_str()));

    let task = store.get_task_row(record_id).await.unwrap().unwrap();
    assert!(!task.available);
    assert!(manager.claim(store.as_ref(), 10).await.is_empty());

    let mgr = store.get_manager(&manager.name).await.unwrap();
    assert_eq!(mgr.failures, 1);
}

#[tokio::test]
async fn optimization_returns_insert_trajectory_children() {
    let store = mem_store();
    let (meta, ids) = store
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
    assert!(meta.success());
    let record_id = ids[0].unwrap();

    let manager = SyntheticManager::activate(
        store.as_ref(),
        "host1",
        &["psi4", "geometric"],
        &["tag1"],
    )
    .await;
    assert_eq!(manager.run_all(store.as_ref()).await, 1);

    let record = store
        .get_records(&[record_id], &ProjectionSpec::default(), false)
        .await
        .unwrap()
        .remove(0)
        .unwrap();
    assert_eq!(record.status, Some(RecordStatus::Complete));

    let Some(models::RecordDetail::Optimization {
        final_molecule_id,
        energies,
        trajectory_ids,
        ..
    }) = record.detail
    else {
        panic!("expected optimization detail");
    };
    assert!(final_molecule_id.is_some());
    assert_eq!(energies.len(), 2);
    assert_eq!(trajectory_ids.len(), 2);

    // Trajectory members are complete singlepoint records with history.
    for sp_id in &trajectory_ids {
        let row = store.get_record_row(*sp_id).await.unwrap();
        assert_eq!(row.record_type, models::RecordType::Singlepoint);
        assert_eq!(row.status, RecordStatus::Complete);
        assert_eq!(store.get_compute_history(*sp_id).await.unwrap().len(), 1);
    }

    // The trajectory is reachable through the children view.
    let children = store.get_children_ids(record_id).await.unwrap();
    assert_eq!(children, trajectory_ids);
}

#[tokio::test]
async fn reset_assigned_returns_running_work() {
    let store = mem_store();
    let record_id = submit_singlepoint(
        store.as_ref(),
        "psi4",
        water(),
        "tag1",
        ComputePriority::Normal,
    )
    .await;

    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;
    let tasks = manager.claim(store.as_ref(), 1).await;
    assert_eq!(tasks.len(), 1);

    let n = store
        .reset_assigned_tasks(&[manager.name.clone()])
        .await
        .unwrap();
    assert_eq!(n, 1);

    let record = store.get_record_row(record_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Waiting);
    assert_eq!(record.manager_name, None);
    let task = store.get_task_row(record_id).await.unwrap().unwrap();
    assert!(task.available);

    // The already-recorded running entry is the only history mutation.
    let history = store.get_compute_history(record_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RecordStatus::Running);
}
