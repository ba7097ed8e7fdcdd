//! Rate job against scripted pages and an in-memory backend.

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;

use reconciler::engine::detector::ChangeDetector;
use reconciler::engine::notifier::Notifier;
use reconciler::engine::rate_job::{JobState, RateJob};
use reconciler::engine::RunControl;
use reconciler::extract::{LabelWindowExtractor, SectionLabelExtractor};
use reconciler::sources::{Source, SourceChainResolver};
use reconciler::types::*;

use crate::mock_store::{MemoryStore, ScriptedFetcher};

const SCOPE: &str = "usd_ves";
const PRIMARY: &str = "https://bcv.example/";
const FALLBACK: &str = "https://monitor.example/";

fn primary_page(rate: &str) -> String {
    format!(
        r#"<div id="dolar" class="recuadrotsmc"><span>USD</span>
           <div class="centrado"><strong> {rate} </strong></div></div>"#
    )
}

fn fallback_page(rate: &str) -> String {
    format!(r#"<div class="card"><h3>Dólar BCV</h3><p class="price">Bs = {rate}</p></div>"#)
}

/// Range wide enough for the reference example values.
fn range() -> ValidRange {
    ValidRange::new(dec!(10), dec!(10000))
}

fn job(fetcher: Arc<ScriptedFetcher>, store: &MemoryStore) -> RateJob {
    let sources = vec![
        Source::new("BCV", PRIMARY, Box::new(SectionLabelExtractor::new("BCV", "dolar", "USD"))),
        Source::new("Monitor", FALLBACK, Box::new(LabelWindowExtractor::new("Monitor", "BCV"))),
    ];
    let resolver = SourceChainResolver::new(fetcher, sources, range());
    let store = Arc::new(store.clone());
    RateJob::new(
        SCOPE,
        "Bs/USD",
        resolver,
        store.clone(),
        Notifier::new(store.clone(), store, Role::admin()),
        ChangeDetector::default(),
    )
}

fn backend_with_admins() -> MemoryStore {
    let store = MemoryStore::new();
    store.add_entity("admin-1", Role::admin(), EntityStatus::Active, false);
    store.add_entity("admin-2", Role::admin(), EntityStatus::Active, false);
    store.add_entity("res-1", Role::resident(), EntityStatus::Active, false);
    store
}

fn previous(value: rust_decimal::Decimal) -> Snapshot {
    Snapshot::new(value, "BCV", Utc.with_ymd_and_hms(2026, 3, 13, 16, 0, 0).unwrap())
}

#[tokio::test]
async fn test_change_appends_snapshot_and_notifies_admins() {
    let store = backend_with_admins();
    store.seed_snapshot(SCOPE, previous(dec!(36.50)));
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.serve(PRIMARY, &primary_page("36,80"));

    let report = job(fetcher.clone(), &store).run(&RunControl::new()).await.unwrap();

    assert!(report.changed);
    assert_eq!(report.value, dec!(36.80));
    assert_eq!(report.source_name, "BCV");
    assert_eq!(report.notification, NotifyOutcome::Sent(2));
    assert_eq!(store.snapshots(SCOPE).len(), 2);
    assert_eq!(store.snapshots(SCOPE)[1].value, dec!(36.80));

    let notes = store.notifications();
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().all(|n| n.subscriber_id.starts_with("admin-")));
    assert!(notes[0].body.contains("36.80"));
    assert!(notes[0].body.contains("BCV"));

    assert_eq!(fetcher.calls(FALLBACK), 0);
    assert_eq!(
        report.transitions,
        vec![
            JobState::Idle,
            JobState::Fetching(0),
            JobState::Extracting(0),
            JobState::Comparing,
            JobState::Persisting,
            JobState::Notifying,
            JobState::Done,
        ]
    );
}

#[tokio::test]
async fn test_within_tolerance_is_a_noop() {
    let store = backend_with_admins();
    store.seed_snapshot(SCOPE, previous(dec!(36.50)));
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.serve(PRIMARY, &primary_page("36,505"));

    let report = job(fetcher, &store).run(&RunControl::new()).await.unwrap();

    assert!(!report.changed);
    assert_eq!(report.snapshot_id, None);
    assert_eq!(report.notification, NotifyOutcome::NotAttempted);
    assert_eq!(store.snapshots(SCOPE).len(), 1);
    assert!(store.notifications().is_empty());
    assert_eq!(report.transitions.last(), Some(&JobState::Done));
    assert!(!report.transitions.contains(&JobState::Persisting));
}

#[tokio::test]
async fn test_first_observation_persists_and_notifies() {
    let store = backend_with_admins();
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.serve(PRIMARY, &primary_page("236,45670000"));

    let report = job(fetcher, &store).run(&RunControl::new()).await.unwrap();

    assert!(report.changed);
    assert!(report.previous.is_none());
    assert_eq!(store.snapshots(SCOPE).len(), 1);
    assert_eq!(store.notifications().len(), 2);
}

#[tokio::test]
async fn test_rerun_with_same_input_is_idempotent() {
    let store = backend_with_admins();
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.serve(PRIMARY, &primary_page("236,50"));

    let job = job(fetcher, &store);
    let first = job.run(&RunControl::new()).await.unwrap();
    let second = job.run(&RunControl::new()).await.unwrap();

    assert!(first.changed);
    assert!(!second.changed);
    assert_eq!(store.snapshots(SCOPE).len(), 1);
    assert_eq!(store.notifications().len(), 2);
}

#[tokio::test]
async fn test_primary_fetch_error_uses_fallback_once() {
    let store = backend_with_admins();
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.fail(PRIMARY, "connection reset");
    fetcher.serve(FALLBACK, &fallback_page("241,30"));

    let report = job(fetcher.clone(), &store).run(&RunControl::new()).await.unwrap();

    assert_eq!(report.source_name, "Monitor");
    assert_eq!(report.value, dec!(241.30));
    assert_eq!(fetcher.calls(PRIMARY), 1);
    assert_eq!(fetcher.calls(FALLBACK), 1);
    assert_eq!(store.snapshots(SCOPE)[0].source, "Monitor");
    assert_eq!(
        &report.transitions[..4],
        &[JobState::Idle, JobState::Fetching(0), JobState::Fetching(1), JobState::Extracting(1)]
    );
}

#[tokio::test]
async fn test_primary_miss_uses_fallback_once() {
    let store = backend_with_admins();
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.serve(PRIMARY, "<html><body>Sitio en mantenimiento</body></html>");
    fetcher.serve(FALLBACK, &fallback_page("1.241,30"));

    let report = job(fetcher.clone(), &store).run(&RunControl::new()).await.unwrap();

    assert_eq!(report.value, dec!(1241.30));
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::ExtractionMiss);
    assert_eq!(fetcher.calls(FALLBACK), 1);
}

#[tokio::test]
async fn test_all_sources_fail_is_fatal_and_writes_nothing() {
    let store = backend_with_admins();
    store.seed_snapshot(SCOPE, previous(dec!(36.50)));
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.fail(PRIMARY, "timed out");
    fetcher.serve(FALLBACK, "<p>no rates today</p>");

    let err = job(fetcher.clone(), &store).run(&RunControl::new()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::NoSourceAvailable { ref attempts } if attempts.len() == 2));
    assert_eq!(fetcher.calls(PRIMARY), 1);
    assert_eq!(fetcher.calls(FALLBACK), 1);
    assert_eq!(store.snapshots(SCOPE).len(), 1);
    assert!(store.notifications().is_empty());
}

#[tokio::test]
async fn test_persist_failure_is_fatal_and_skips_notification() {
    let store = backend_with_admins();
    store.fail_snapshot_writes();
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.serve(PRIMARY, &primary_page("236,50"));

    let err = job(fetcher, &store).run(&RunControl::new()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Persist(_)));
    assert!(store.notifications().is_empty());
}

#[tokio::test]
async fn test_directory_failure_still_succeeds() {
    let store = backend_with_admins();
    store.fail_directory();
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.serve(PRIMARY, &primary_page("236,50"));

    let report = job(fetcher, &store).run(&RunControl::new()).await.unwrap();

    assert!(report.changed);
    assert!(matches!(report.notification, NotifyOutcome::Skipped(_)));
    assert_eq!(store.snapshots(SCOPE).len(), 1);
    assert!(store.notifications().is_empty());
}

#[tokio::test]
async fn test_cancelled_run_contacts_no_source() {
    let store = backend_with_admins();
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.serve(PRIMARY, &primary_page("236,50"));
    let control = RunControl::new();
    control.cancel();

    let err = job(fetcher.clone(), &store).run(&control).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Cancelled));
    assert_eq!(fetcher.calls(PRIMARY), 0);
    assert!(store.snapshots(SCOPE).is_empty());
}
