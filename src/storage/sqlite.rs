//! SQLite-backed store.
//!
//! Implements every storage trait over a single sqlx pool. The schema is
//! created on connect. Timestamps are stored as fixed-width RFC 3339 UTC
//! text (microsecond precision) so that text order is time order, and
//! decimals are stored as text to avoid float rounding.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::{EntityStore, NotificationSink, SnapshotStore, SubscriberDirectory};
use crate::types::{
    Entity, EntityFilter, EntityStatus, FactPredicate, NotificationRecord, ReconcileError, Role,
    Snapshot, SnapshotId, Subscriber,
};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS snapshots (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        scope       TEXT NOT NULL,
        value       TEXT NOT NULL,
        source      TEXT NOT NULL,
        captured_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_snapshots_scope_time ON snapshots (scope, captured_at DESC, id DESC)",
    r#"CREATE TABLE IF NOT EXISTS entities (
        id                TEXT PRIMARY KEY,
        role              TEXT NOT NULL,
        status            TEXT NOT NULL DEFAULT 'active',
        status_updated_at TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS payments (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id TEXT NOT NULL REFERENCES entities (id),
        status    TEXT NOT NULL,
        due_date  TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_payments_entity ON payments (entity_id, status)",
    r#"CREATE TABLE IF NOT EXISTS notifications (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        subscriber_id   TEXT NOT NULL,
        kind            TEXT NOT NULL,
        title           TEXT NOT NULL,
        body            TEXT NOT NULL,
        requires_action INTEGER NOT NULL,
        read            INTEGER NOT NULL,
        created_at      TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS run_locks (
        job         TEXT PRIMARY KEY,
        holder      TEXT NOT NULL,
        acquired_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS run_log (
        run_id      TEXT PRIMARY KEY,
        job         TEXT NOT NULL,
        started_at  TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        outcome     TEXT NOT NULL,
        detail      TEXT NOT NULL
    )"#,
];

/// Payment status that marks a resident as delinquent.
const OVERDUE_STATUS: &str = "overdue";

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, ReconcileError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ReconcileError::Persist(format!("bad timestamp {raw:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Run log records
// ---------------------------------------------------------------------------

/// One row of the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// "ok" | "unchanged" | "failed" | ...
    pub outcome: String,
    pub detail: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to a database URL (e.g. `sqlite://reconciler.db`), creating
    /// the file and schema if needed.
    pub async fn connect(url: &SecretString, max_connections: u32) -> Result<Self, ReconcileError> {
        let opts = SqliteConnectOptions::from_str(url.expose_secret())
            .map_err(|e| ReconcileError::Config(format!("invalid database url: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(max_connections, "Connected to SQLite store");
        Ok(store)
    }

    /// Private in-memory database. One connection, kept alive for the pool's life.
    pub async fn in_memory() -> Result<Self, ReconcileError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ReconcileError> {
        for stmt in SCHEMA {
            sqlx::query(*stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    // -- Fixtures / admin --------------------------------------------------

    /// Insert or replace an entity row.
    pub async fn upsert_entity(&self, id: &str, role: &Role, status: EntityStatus) -> Result<(), ReconcileError> {
        sqlx::query(
            "INSERT INTO entities (id, role, status) VALUES (?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET role = excluded.role, status = excluded.status",
        )
        .bind(id)
        .bind(role.as_str())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_payment(&self, entity_id: &str, status: &str, due_date: Option<&str>) -> Result<i64, ReconcileError> {
        let res = sqlx::query("INSERT INTO payments (entity_id, status, due_date) VALUES (?, ?, ?)")
            .bind(entity_id)
            .bind(status)
            .bind(due_date)
            .execute(&self.pool)
            .await?;
        Ok(res.last_insert_rowid())
    }

    /// Status and audit timestamp of one entity.
    pub async fn entity_status(&self, id: &str) -> Result<Option<(EntityStatus, Option<DateTime<Utc>>)>, ReconcileError> {
        let row = sqlx::query("SELECT status, status_updated_at FROM entities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let status: String = row.try_get("status")?;
        let updated: Option<String> = row.try_get("status_updated_at")?;
        let updated = updated.as_deref().map(parse_ts).transpose()?;
        Ok(Some((status.parse()?, updated)))
    }

    // -- History -----------------------------------------------------------

    /// Snapshots for a scope, newest first.
    pub async fn snapshot_history(&self, scope: &str, limit: u32) -> Result<Vec<Snapshot>, ReconcileError> {
        let rows = sqlx::query(
            "SELECT value, source, captured_at FROM snapshots
             WHERE scope = ? ORDER BY captured_at DESC, id DESC LIMIT ?",
        )
        .bind(scope)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    pub async fn notifications_for(&self, subscriber_id: &str) -> Result<Vec<NotificationRecord>, ReconcileError> {
        let rows = sqlx::query(
            "SELECT subscriber_id, kind, title, body, requires_action, read, created_at
             FROM notifications WHERE subscriber_id = ? ORDER BY id",
        )
        .bind(subscriber_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<NotificationRecord, ReconcileError> {
                let created: String = row.try_get("created_at")?;
                Ok(NotificationRecord {
                    subscriber_id: row.try_get("subscriber_id")?,
                    kind: row.try_get("kind")?,
                    title: row.try_get("title")?,
                    body: row.try_get("body")?,
                    requires_action: row.try_get("requires_action")?,
                    read: row.try_get("read")?,
                    created_at: parse_ts(&created)?,
                })
            })
            .collect()
    }

    // -- Run log -----------------------------------------------------------

    pub async fn record_run(&self, record: &RunRecord) -> Result<(), ReconcileError> {
        sqlx::query(
            "INSERT INTO run_log (run_id, job, started_at, finished_at, outcome, detail)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.run_id.to_string())
        .bind(&record.job)
        .bind(fmt_ts(record.started_at))
        .bind(fmt_ts(record.finished_at))
        .bind(&record.outcome)
        .bind(record.detail.to_string())
        .execute(&self.pool)
        .await?;
        debug!(run_id = %record.run_id, job = %record.job, outcome = %record.outcome, "Run recorded");
        Ok(())
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>, ReconcileError> {
        let rows = sqlx::query(
            "SELECT run_id, job, started_at, finished_at, outcome, detail FROM run_log
             ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<RunRecord, ReconcileError> {
                let run_id: String = row.try_get("run_id")?;
                let started: String = row.try_get("started_at")?;
                let finished: String = row.try_get("finished_at")?;
                let detail: String = row.try_get("detail")?;
                Ok(RunRecord {
                    run_id: Uuid::parse_str(&run_id)
                        .map_err(|e| ReconcileError::Persist(format!("bad run id {run_id:?}: {e}")))?,
                    job: row.try_get("job")?,
                    started_at: parse_ts(&started)?,
                    finished_at: parse_ts(&finished)?,
                    outcome: row.try_get("outcome")?,
                    detail: serde_json::from_str(&detail)
                        .map_err(|e| ReconcileError::Persist(format!("bad run detail: {e}")))?,
                })
            })
            .collect()
    }

    // -- Single-flight lock ------------------------------------------------

    /// Take the run lock for `job`. Locks older than `stale_after` are
    /// reclaimed. Returns `false` if another holder has it.
    pub async fn try_acquire_lock(
        &self,
        job: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool, ReconcileError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM run_locks WHERE job = ? AND acquired_at < ?")
            .bind(job)
            .bind(fmt_ts(now - stale_after))
            .execute(&mut *tx)
            .await?;
        let res = sqlx::query("INSERT OR IGNORE INTO run_locks (job, holder, acquired_at) VALUES (?, ?, ?)")
            .bind(job)
            .bind(holder)
            .bind(fmt_ts(now))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn release_lock(&self, job: &str, holder: &str) -> Result<(), ReconcileError> {
        sqlx::query("DELETE FROM run_locks WHERE job = ? AND holder = ?")
            .bind(job)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn snapshot_from_row(row: &SqliteRow) -> Result<Snapshot, ReconcileError> {
    let value: String = row.try_get("value")?;
    let captured: String = row.try_get("captured_at")?;
    Ok(Snapshot {
        value: Decimal::from_str(&value)
            .map_err(|e| ReconcileError::Persist(format!("bad snapshot value {value:?}: {e}")))?,
        source: row.try_get("source")?,
        captured_at: parse_ts(&captured)?,
    })
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn latest_snapshot(&self, scope: &str) -> Result<Option<Snapshot>, ReconcileError> {
        let row = sqlx::query(
            "SELECT value, source, captured_at FROM snapshots
             WHERE scope = ? ORDER BY captured_at DESC, id DESC LIMIT 1",
        )
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn append_snapshot(&self, scope: &str, snapshot: &Snapshot) -> Result<SnapshotId, ReconcileError> {
        let res = sqlx::query("INSERT INTO snapshots (scope, value, source, captured_at) VALUES (?, ?, ?, ?)")
            .bind(scope)
            .bind(snapshot.value.to_string())
            .bind(&snapshot.source)
            .bind(fmt_ts(snapshot.captured_at))
            .execute(&self.pool)
            .await?;
        let id = res.last_insert_rowid();
        debug!(scope, id, value = %snapshot.value, "Snapshot appended");
        Ok(id)
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>, ReconcileError> {
        let rows = match &filter.role {
            Some(role) => {
                sqlx::query("SELECT id, status FROM entities WHERE role = ? ORDER BY id")
                    .bind(role.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT id, status FROM entities ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter()
            .map(|row| -> Result<Entity, ReconcileError> {
                let status: String = row.try_get("status")?;
                Ok(Entity {
                    id: row.try_get("id")?,
                    current_status: status.parse()?,
                })
            })
            .collect()
    }

    async fn has_related_fact(&self, entity_id: &str, predicate: FactPredicate) -> Result<bool, ReconcileError> {
        let exists: i64 = match predicate {
            FactPredicate::Overdue => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT EXISTS (SELECT 1 FROM payments WHERE entity_id = ? AND status = ?)",
                )
                .bind(entity_id)
                .bind(OVERDUE_STATUS)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(exists != 0)
    }

    async fn update_status(
        &self,
        entity_id: &str,
        status: EntityStatus,
        at: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let res = sqlx::query("UPDATE entities SET status = ?, status_updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(fmt_ts(at))
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(ReconcileError::Persist(format!("entity not found: {entity_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriberDirectory for SqliteStore {
    async fn list_subscribers(&self, role: &Role) -> Result<Vec<Subscriber>, ReconcileError> {
        let rows = sqlx::query("SELECT id, role FROM entities WHERE role = ? ORDER BY id")
            .bind(role.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<Subscriber, ReconcileError> {
                let role: String = row.try_get("role")?;
                Ok(Subscriber {
                    id: row.try_get("id")?,
                    role: Role::new(role),
                })
            })
            .collect()
    }
}

#[async_trait]
impl NotificationSink for SqliteStore {
    async fn create_notifications(&self, records: &[NotificationRecord]) -> Result<usize, ReconcileError> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                "INSERT INTO notifications
                 (subscriber_id, kind, title, body, requires_action, read, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&r.subscriber_id)
            .bind(&r.kind)
            .bind(&r.title)
            .bind(&r.body)
            .bind(r.requires_action)
            .bind(r.read)
            .bind(fmt_ts(r.created_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
