//! Exchange-rate reconciliation job.
//!
//! Resolves the current rate through the source chain, compares it with
//! the latest stored snapshot, appends a snapshot only on change and then
//! notifies admins. The path through the run is recorded as a list of
//! `JobState`s for the report:
//!
//! `Idle → Fetching(i) → Extracting(i) → … → Comparing → Persisting →
//! Notifying → Done`, or `Failed` from any step.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

use super::detector::ChangeDetector;
use super::notifier::Notifier;
use super::RunControl;
use crate::sources::SourceChainResolver;
use crate::storage::SnapshotStore;
use crate::types::{
    AttemptOutcome, ChangeDescription, NotifyOutcome, ReconcileError, Snapshot, SnapshotId,
    SourceAttempt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "source", rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Fetching(usize),
    Extracting(usize),
    Comparing,
    Persisting,
    Notifying,
    Done,
    Failed,
}

/// Everything a caller might want to know about one rate run.
#[derive(Debug, Clone, Serialize)]
pub struct RateRunReport {
    pub scope: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,
    pub source_name: String,
    pub previous: Option<Snapshot>,
    pub changed: bool,
    pub snapshot_id: Option<SnapshotId>,
    pub notification: NotifyOutcome,
    pub attempts: Vec<SourceAttempt>,
    pub transitions: Vec<JobState>,
}

impl fmt::Display for RateRunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.changed {
            let prev = self
                .previous
                .as_ref()
                .map(|p| p.value.to_string())
                .unwrap_or_else(|| "none".to_string());
            write!(
                f,
                "{}: {} from {} (previous {prev}), snapshot #{}, notifications {}",
                self.scope,
                self.value,
                self.source_name,
                self.snapshot_id.unwrap_or_default(),
                self.notification,
            )
        } else {
            write!(
                f,
                "{}: {} from {}, unchanged",
                self.scope, self.value, self.source_name
            )
        }
    }
}

pub struct RateJob {
    scope: String,
    unit: String,
    resolver: SourceChainResolver,
    snapshots: Arc<dyn SnapshotStore>,
    notifier: Notifier,
    detector: ChangeDetector,
}

impl RateJob {
    pub fn new(
        scope: impl Into<String>,
        unit: impl Into<String>,
        resolver: SourceChainResolver,
        snapshots: Arc<dyn SnapshotStore>,
        notifier: Notifier,
        detector: ChangeDetector,
    ) -> Self {
        Self {
            scope: scope.into(),
            unit: unit.into(),
            resolver,
            snapshots,
            notifier,
            detector,
        }
    }

    /// Run once. Errors are fatal for the run: the chain was exhausted,
    /// the run was cancelled, or the snapshot store failed.
    pub async fn run(&self, control: &RunControl) -> Result<RateRunReport, ReconcileError> {
        let mut transitions = vec![JobState::Idle];
        let result = self.run_inner(control, &mut transitions).await;
        if let Err(e) = &result {
            transitions.push(JobState::Failed);
            error!(scope = %self.scope, error = %e, states = ?transitions, "Rate job failed");
        }
        result
    }

    async fn run_inner(
        &self,
        control: &RunControl,
        transitions: &mut Vec<JobState>,
    ) -> Result<RateRunReport, ReconcileError> {
        info!(scope = %self.scope, sources = ?self.resolver.source_names().collect::<Vec<_>>(), "Starting rate job");

        let resolved = self.resolver.resolve(control).await;
        let attempts = match &resolved {
            Ok(r) => r.attempts.as_slice(),
            Err(ReconcileError::NoSourceAvailable { attempts }) => attempts.as_slice(),
            Err(_) => &[],
        };
        transitions.extend(attempt_states(attempts));
        let resolution = resolved?;

        transitions.push(JobState::Comparing);
        let previous = self.snapshots.latest_snapshot(&self.scope).await?;
        let changed = self.detector.check(resolution.value, previous.as_ref().map(|p| p.value));

        let mut report = RateRunReport {
            scope: self.scope.clone(),
            value: resolution.value,
            source_name: resolution.source_name.clone(),
            previous,
            changed,
            snapshot_id: None,
            notification: NotifyOutcome::NotAttempted,
            attempts: resolution.attempts,
            transitions: Vec::new(),
        };

        if !changed {
            info!(
                scope = %self.scope,
                value = %report.value,
                tolerance = %self.detector.tolerance(),
                "Rate unchanged, nothing to persist"
            );
            transitions.push(JobState::Done);
            report.transitions = transitions.clone();
            return Ok(report);
        }

        transitions.push(JobState::Persisting);
        let snapshot = Snapshot::new(resolution.value, &resolution.source_name, Utc::now());
        let id = self.snapshots.append_snapshot(&self.scope, &snapshot).await?;
        report.snapshot_id = Some(id);
        info!(
            scope = %self.scope,
            value = %snapshot.value,
            source = %snapshot.source,
            previous = ?report.previous.as_ref().map(|p| p.value),
            snapshot_id = id,
            "Rate changed, snapshot appended"
        );

        transitions.push(JobState::Notifying);
        let change = ChangeDescription {
            value: snapshot.value,
            previous: report.previous.as_ref().map(|p| p.value),
            source: snapshot.source.clone(),
            unit: self.unit.clone(),
        };
        report.notification = self.notifier.notify_all(&change).await;

        transitions.push(JobState::Done);
        report.transitions = transitions.clone();
        Ok(report)
    }
}

/// Map source attempts onto fetch/extract states. A fetch failure never
/// reaches extraction.
fn attempt_states(attempts: &[SourceAttempt]) -> Vec<JobState> {
    attempts
        .iter()
        .enumerate()
        .flat_map(|(i, a)| match a.outcome {
            AttemptOutcome::FetchFailed(_) => vec![JobState::Fetching(i)],
            _ => vec![JobState::Fetching(i), JobState::Extracting(i)],
        })
        .collect()
}
