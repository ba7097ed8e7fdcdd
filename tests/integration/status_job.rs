//! Status sweep over the in-memory backend.

use std::sync::Arc;

use reconciler::engine::status_job::StatusJob;
use reconciler::engine::RunControl;
use reconciler::types::*;

use crate::mock_store::MemoryStore;

fn residents() -> EntityFilter {
    EntityFilter::with_role(Role::resident())
}

#[tokio::test]
async fn test_corrects_only_mismatched_residents() {
    let store = MemoryStore::new();
    // r1 owes and is marked active, r2 is paid up but marked delinquent,
    // r3 is already correct.
    store.add_entity("r1", Role::resident(), EntityStatus::Active, true);
    store.add_entity("r2", Role::resident(), EntityStatus::Delinquent, false);
    store.add_entity("r3", Role::resident(), EntityStatus::Active, false);
    store.add_entity("a1", Role::admin(), EntityStatus::Active, true);

    let summary = StatusJob::new(Arc::new(store.clone()), residents())
        .run(&RunControl::new())
        .await
        .unwrap();

    assert_eq!(summary.total_processed, 3);
    assert_eq!(summary.updated, 2);
    assert_eq!(summary.errors, 0);
    assert!(!summary.aborted);
    assert_eq!(store.status_of("r1"), Some(EntityStatus::Delinquent));
    assert_eq!(store.status_of("r2"), Some(EntityStatus::Active));
    assert_eq!(store.status_of("a1"), Some(EntityStatus::Active));

    let mut writes = store.status_writes();
    writes.sort();
    assert_eq!(writes, vec!["r1".to_string(), "r2".to_string()]);
}

#[tokio::test]
async fn test_second_sweep_writes_nothing() {
    let store = MemoryStore::new();
    store.add_entity("r1", Role::resident(), EntityStatus::Active, true);
    store.add_entity("r2", Role::resident(), EntityStatus::Active, false);
    let job = StatusJob::new(Arc::new(store.clone()), residents());

    let first = job.run(&RunControl::new()).await.unwrap();
    let second = job.run(&RunControl::new()).await.unwrap();

    assert_eq!(first.updated, 1);
    assert_eq!(second.updated, 0);
    assert_eq!(second.total_processed, 2);
    assert_eq!(store.status_writes().len(), 1);
}

#[tokio::test]
async fn test_one_broken_entity_does_not_stop_the_sweep() {
    let store = MemoryStore::new();
    for i in 0..10 {
        store.add_entity(&format!("r{i}"), Role::resident(), EntityStatus::Active, i % 2 == 0);
    }
    store.break_entity("r3");

    let summary = StatusJob::new(Arc::new(store.clone()), residents())
        .with_workers(3)
        .run(&RunControl::new())
        .await
        .unwrap();

    assert_eq!(summary.total_processed, 10);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.successes(), 9);
    assert_eq!(summary.updated, 5);

    let failed: Vec<_> = summary
        .details
        .iter()
        .filter(|o| matches!(o.result, EntityResult::Failed(_)))
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].entity_id, "r3");
    assert_eq!(failed[0].derived, None);
    assert_eq!(store.status_of("r3"), Some(EntityStatus::Active));
}

#[tokio::test]
async fn test_empty_population() {
    let store = MemoryStore::new();
    let summary = StatusJob::new(Arc::new(store), residents())
        .run(&RunControl::new())
        .await
        .unwrap();
    assert_eq!(summary, RunSummary::default());
}

#[tokio::test]
async fn test_cancelled_before_start_is_aborted() {
    let store = MemoryStore::new();
    store.add_entity("r1", Role::resident(), EntityStatus::Active, true);
    let control = RunControl::new();
    control.cancel();

    let summary = StatusJob::new(Arc::new(store.clone()), residents())
        .run(&control)
        .await
        .unwrap();

    assert!(summary.aborted);
    assert_eq!(summary.total_processed, 0);
    assert!(store.status_writes().is_empty());
}
