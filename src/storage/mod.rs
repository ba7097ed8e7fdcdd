//! Persistence layer.
//!
//! The jobs talk to the backing store only through the traits below.
//! `SqliteStore` implements all of them over one sqlx pool.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    Entity, EntityFilter, EntityStatus, FactPredicate, NotificationRecord, ReconcileError, Role,
    Snapshot, SnapshotId, Subscriber,
};

pub use sqlite::SqliteStore;

/// Append-only snapshot history, one stream per scope.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Most recent snapshot by `captured_at`, ties broken by insertion order.
    async fn latest_snapshot(&self, scope: &str) -> Result<Option<Snapshot>, ReconcileError>;

    /// Durably record a snapshot or fail with no partial write.
    async fn append_snapshot(&self, scope: &str, snapshot: &Snapshot) -> Result<SnapshotId, ReconcileError>;
}

/// Entities whose status the batch job corrects.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>, ReconcileError>;

    async fn has_related_fact(&self, entity_id: &str, predicate: FactPredicate) -> Result<bool, ReconcileError>;

    /// Set the status and its audit timestamp. Unknown ids are an error.
    async fn update_status(
        &self,
        entity_id: &str,
        status: EntityStatus,
        at: DateTime<Utc>,
    ) -> Result<(), ReconcileError>;
}

#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    async fn list_subscribers(&self, role: &Role) -> Result<Vec<Subscriber>, ReconcileError>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Store every record or none of them. Returns the number stored.
    async fn create_notifications(&self, records: &[NotificationRecord]) -> Result<usize, ReconcileError>;
}
