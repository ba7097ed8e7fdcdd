//! Shared types for the reconciliation jobs.
//!
//! Snapshots, entities, subscribers, notifications, run summaries and the
//! domain error taxonomy. Every other module depends on these; nothing in
//! here depends on another module of the crate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned, monotonically increasing snapshot identifier.
pub type SnapshotId = i64;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A timestamped, sourced observation of an authoritative value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,
    pub captured_at: DateTime<Utc>,
    pub source: String,
}

impl Snapshot {
    pub fn new(value: Decimal, source: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            value,
            captured_at,
            source: source.into(),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from {} at {}",
            self.value,
            self.source,
            self.captured_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

// ---------------------------------------------------------------------------
// Valid range
// ---------------------------------------------------------------------------

/// Inclusive bounds a value must fall in to be accepted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidRange {
    pub lo: Decimal,
    pub hi: Decimal,
}

impl ValidRange {
    pub fn new(lo: Decimal, hi: Decimal) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, value: Decimal) -> bool {
        value >= self.lo && value <= self.hi
    }

    /// Overlap of two ranges, or `None` if they are disjoint.
    pub fn intersect(&self, other: &ValidRange) -> Option<ValidRange> {
        let lo = self.lo.max(other.lo);
        let hi = self.hi.min(other.hi);
        (lo <= hi).then_some(ValidRange { lo, hi })
    }
}

impl fmt::Display for ValidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

// ---------------------------------------------------------------------------
// Entities and subscribers
// ---------------------------------------------------------------------------

/// Delinquency status of a resident, derived from their payment records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Active,
    Delinquent,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Delinquent => "delinquent",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityStatus {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(EntityStatus::Active),
            "delinquent" => Ok(EntityStatus::Delinquent),
            other => Err(ReconcileError::Persist(format!("unknown entity status: {other}"))),
        }
    }
}

/// A tracked record whose status is derived from related facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub current_status: EntityStatus,
}

/// Role held by an entity. Normalised to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role(String);

impl Role {
    pub fn new(role: impl AsRef<str>) -> Self {
        Role(role.as_ref().trim().to_lowercase())
    }

    pub fn admin() -> Self {
        Role::new("admin")
    }

    pub fn resident() -> Self {
        Role::new("resident")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Filter for `EntityStore::list_entities`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    /// Only entities holding this role. `None` lists everyone.
    pub role: Option<Role>,
}

impl EntityFilter {
    pub fn with_role(role: Role) -> Self {
        Self { role: Some(role) }
    }
}

/// Questions the status job can ask about an entity's related records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactPredicate {
    /// At least one payment record flagged overdue.
    Overdue,
}

/// An audience member eligible for notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub role: Role,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// One notification for one subscriber. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub subscriber_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub requires_action: bool,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// What the notifier tells subscribers about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDescription {
    pub value: Decimal,
    pub previous: Option<Decimal>,
    pub source: String,
    /// Unit label appended to values, e.g. "Bs/USD".
    pub unit: String,
}

/// Result of a best-effort notification fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum NotifyOutcome {
    /// The detector reported no change; nothing was sent.
    NotAttempted,
    Sent(usize),
    NoSubscribers,
    /// The subscriber list could not be fetched.
    Skipped(String),
    /// The sink rejected the batch.
    Failed(String),
}

impl fmt::Display for NotifyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyOutcome::NotAttempted => write!(f, "not attempted"),
            NotifyOutcome::Sent(n) => write!(f, "sent to {n} subscriber(s)"),
            NotifyOutcome::NoSubscribers => write!(f, "no subscribers"),
            NotifyOutcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            NotifyOutcome::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Source attempts
// ---------------------------------------------------------------------------

/// How one source fared during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success(#[serde(with = "rust_decimal::serde::str")] Decimal),
    FetchFailed(String),
    ExtractionMiss,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceAttempt {
    pub source_name: String,
    pub outcome: AttemptOutcome,
}

impl fmt::Display for SourceAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AttemptOutcome::Success(v) => write!(f, "{}: {}", self.source_name, v),
            AttemptOutcome::FetchFailed(msg) => write!(f, "{}: fetch failed ({msg})", self.source_name),
            AttemptOutcome::ExtractionMiss => write!(f, "{}: no valid value found", self.source_name),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch run summary
// ---------------------------------------------------------------------------

/// What happened to one entity during a batch sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "error", rename_all = "snake_case")]
pub enum EntityResult {
    Unchanged,
    Updated,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityOutcome {
    pub entity_id: String,
    pub previous: Option<EntityStatus>,
    pub derived: Option<EntityStatus>,
    pub result: EntityResult,
}

impl fmt::Display for EntityOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.result, self.previous, self.derived) {
            (EntityResult::Updated, Some(prev), Some(new)) => {
                write!(f, "{}: {prev} -> {new}", self.entity_id)
            }
            (EntityResult::Failed(err), _, _) => write!(f, "{}: error ({err})", self.entity_id),
            (_, Some(prev), _) => write!(f, "{}: unchanged ({prev})", self.entity_id),
            _ => write!(f, "{}: unchanged", self.entity_id),
        }
    }
}

/// Transient summary of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_processed: usize,
    pub updated: usize,
    pub errors: usize,
    pub details: Vec<EntityOutcome>,
    /// The run was cancelled before every entity was processed.
    pub aborted: bool,
}

impl RunSummary {
    pub fn record(&mut self, outcome: EntityOutcome) {
        self.total_processed += 1;
        match outcome.result {
            EntityResult::Updated => self.updated += 1,
            EntityResult::Failed(_) => self.errors += 1,
            EntityResult::Unchanged => {}
        }
        self.details.push(outcome);
    }

    /// Entities processed without error (updated or already correct).
    pub fn successes(&self) -> usize {
        self.total_processed - self.errors
    }

    pub fn updated_entities(&self) -> impl Iterator<Item = &EntityOutcome> {
        self.details
            .iter()
            .filter(|o| o.result == EntityResult::Updated)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} updated={} unchanged={} errors={}{}",
            self.total_processed,
            self.updated,
            self.successes() - self.updated,
            self.errors,
            if self.aborted { " (aborted)" } else { "" },
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain error taxonomy for reconciliation runs.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source fetch failed ({source_name}): {message}")]
    SourceFetch { source_name: String, message: String },

    #[error("No valid value found in {source_name}")]
    ExtractionMiss { source_name: String },

    #[error("No source yielded a valid value after {} attempt(s): {}", .attempts.len(), summarize_attempts(.attempts))]
    NoSourceAvailable { attempts: Vec<SourceAttempt> },

    #[error("Store error: {0}")]
    Persist(String),

    #[error("Entity {entity_id} failed: {message}")]
    EntityProcessing { entity_id: String, message: String },

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Whether the source chain may move on to the next source.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReconcileError::SourceFetch { .. }
                | ReconcileError::ExtractionMiss { .. }
                | ReconcileError::EntityProcessing { .. }
                | ReconcileError::Notification(_)
        )
    }
}

fn summarize_attempts(attempts: &[SourceAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<sqlx::Error> for ReconcileError {
    fn from(err: sqlx::Error) -> Self {
        ReconcileError::Persist(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
