//! Manager registry behavior: activation, heartbeats, deactivation, and the
//! heartbeat reaper.

mod common;

use std::collections::BTreeMap;

use chrono::Utc;
use common::*;
use fractal::store::{ManagerQueryFilters, Store};
use models::{
    ComputePriority, ManagerActivation, ManagerName, ManagerResources, ManagerStatus,
    RecordStatus, ServerError,
};

fn activation(host: &str, tags: &[&str]) -> ManagerActivation {
    ManagerActivation {
        name: ManagerName {
            cluster: "test_cluster".to_string(),
            hostname: host.to_string(),
            uuid: format!("{host}-1234"),
        },
        manager_version: "v2.0".to_string(),
        username: Some("bill".to_string()),
        programs: [("psi4".to_string(), None)].into_iter().collect(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

#[tokio::test]
async fn activation_normalizes_and_rejects_duplicates() {
    let store = mem_store();

    let mut act = activation("host1", &["tag1", "taG3", "tAg2", "TAG3", "TAG1"]);
    act.programs = [
        ("Psi4".to_string(), None),
        ("GEOmetric".to_string(), Some("v3.0".to_string())),
    ]
    .into_iter()
    .collect();
    store.activate_manager(&act).await.unwrap();

    let row = store.get_manager(&act.name.fullname()).await.unwrap();
    assert_eq!(row.tags, vec!["tag1", "tag3", "tag2"]);
    assert!(row.programs.contains_key("psi4"));
    assert_eq!(
        row.programs.get("geometric"),
        Some(&Some("v3.0".to_string()))
    );
    assert_eq!(row.status, ManagerStatus::Active);

    // Same triplet again fails.
    let err = store.activate_manager(&act).await.unwrap_err();
    assert!(matches!(err, ServerError::ComputeManager { .. }));
}

#[tokio::test]
async fn activation_requires_tags_and_programs() {
    let store = mem_store();

    let err = store
        .activate_manager(&activation("host1", &[]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("tags"));

    let err = store
        .activate_manager(&activation("host2", &[""]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("tags"));

    let mut act = activation("host3", &["tag1"]);
    act.programs = BTreeMap::new();
    let err = store.activate_manager(&act).await.unwrap_err();
    assert!(err.to_string().contains("programs"));

    let mut act = activation("host4", &["tag1"]);
    act.programs = [("".to_string(), None)].into_iter().collect();
    let err = store.activate_manager(&act).await.unwrap_err();
    assert!(err.to_string().contains("programs"));
}

#[tokio::test]
async fn heartbeat_replaces_counters_and_refuses_inactive() {
    let store = mem_store();
    let act = activation("host1", &["tag1"]);
    store.activate_manager(&act).await.unwrap();
    let name = act.name.fullname();

    let resources = ManagerResources {
        total_cpu_hours: 12.5,
        active_tasks: 3,
        active_cores: 8,
        active_memory: 16.0,
    };
    store.manager_heartbeat(&name, &resources).await.unwrap();
    let row = store.get_manager(&name).await.unwrap();
    assert_eq!(row.resources, resources);

    let deactivated = store
        .deactivate_managers(&[name.clone()])
        .await
        .unwrap();
    assert_eq!(deactivated, vec![name.clone()]);

    // Deactivation is idempotent.
    assert!(store
        .deactivate_managers(&[name.clone()])
        .await
        .unwrap()
        .is_empty());

    let err = store
        .manager_heartbeat(&name, &resources)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServerError::ComputeManager { shutdown: true, .. }
    ));
}

#[tokio::test]
async fn heartbeat_reaper_returns_claimed_work() {
    let store = mem_store();

    let (spec, inputs) = singlepoint_submission("psi4", water());
    let (_, ids) = store
        .add_records(&spec, &inputs, "tag1", ComputePriority::Normal, None, true)
        .await
        .unwrap();
    let record_id = ids[0].unwrap();

    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;
    let tasks = manager.claim(store.as_ref(), 1).await;
    assert_eq!(tasks.len(), 1);

    // Every heartbeat is now in the past; a cutoff of "now" reaps it.
    let reaped = store
        .deactivate_managers_before(Utc::now())
        .await
        .unwrap();
    assert_eq!(reaped, vec![manager.name.clone()]);

    let record = store.get_record_row(record_id).await.unwrap();
    assert_eq!(record.status, RecordStatus::Waiting);
    assert_eq!(record.manager_name, None);
    let task = store.get_task_row(record_id).await.unwrap().unwrap();
    assert!(task.available);

    let row = store.get_manager(&manager.name).await.unwrap();
    assert_eq!(row.status, ManagerStatus::Inactive);
}

#[tokio::test]
async fn reaper_spares_fresh_heartbeats() {
    let store = mem_store();
    let manager = SyntheticManager::activate(store.as_ref(), "host1", &["psi4"], &["tag1"]).await;

    let cutoff = Utc::now() - chrono::Duration::hours(1);
    assert!(store
        .deactivate_managers_before(cutoff)
        .await
        .unwrap()
        .is_empty());

    let row = store.get_manager(&manager.name).await.unwrap();
    assert_eq!(row.status, ManagerStatus::Active);
}

#[tokio::test]
async fn query_managers_filters_and_paginates() {
    let store = mem_store();
    for host in ["host1", "host2", "host3"] {
        store.activate_manager(&activation(host, &["t"])).await.unwrap();
    }
    store
        .deactivate_managers(&[activation("host3", &["t"]).name.fullname()])
        .await
        .unwrap();

    let (meta, rows) = store
        .query_managers(&ManagerQueryFilters {
            status: Some(vec![ManagerStatus::Active]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(meta.n_found, 2);
    assert_eq!(rows.len(), 2);

    let (meta, rows) = store
        .query_managers(&ManagerQueryFilters {
            cluster: Some(vec!["test_cluster".to_string()]),
            limit: Some(2),
            skip: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(meta.n_found, 3);
    assert_eq!(meta.n_returned, 1);
    assert_eq!(rows.len(), 1);
}
