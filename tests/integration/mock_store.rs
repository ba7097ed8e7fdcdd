//! In-memory collaborators for integration testing.
//!
//! Deterministic implementations of the fetcher and every storage trait,
//! with call counters and forced-failure switches controllable from tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use reconciler::sources::{FetchResponse, Fetcher};
use reconciler::storage::{EntityStore, NotificationSink, SnapshotStore, SubscriberDirectory};
use reconciler::types::*;

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Scripted page responses keyed by URL, counting every request.
#[derive(Default)]
pub struct ScriptedFetcher {
    pages: Mutex<HashMap<String, Result<FetchResponse, String>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: &str) {
        self.pages.lock().unwrap().insert(
            url.to_string(),
            Ok(FetchResponse {
                status: 200,
                body: body.to_string(),
            }),
        );
    }

    pub fn fail(&self, url: &str, message: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), Err(message.to_string()));
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn get(&self, url: &str) -> Result<FetchResponse, ReconcileError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        match self.pages.lock().unwrap().get(url) {
            Some(Ok(resp)) => Ok(resp.clone()),
            Some(Err(msg)) => Err(ReconcileError::SourceFetch {
                source_name: url.to_string(),
                message: msg.clone(),
            }),
            None => Ok(FetchResponse {
                status: 404,
                body: String::new(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    snapshots: Vec<(String, Snapshot)>,
    entities: Vec<(Entity, Role)>,
    overdue: HashSet<String>,
    notifications: Vec<NotificationRecord>,
    status_writes: Vec<(String, EntityStatus, DateTime<Utc>)>,
}

/// A whole backend in memory. Cloning shares the state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    /// Entity ids whose fact lookup errors.
    broken_entities: Arc<Mutex<HashSet<String>>>,
    fail_snapshot_writes: Arc<Mutex<bool>>,
    fail_directory: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entity(&self, id: &str, role: Role, status: EntityStatus, overdue: bool) {
        let mut state = self.state.lock().unwrap();
        state.entities.push((
            Entity {
                id: id.to_string(),
                current_status: status,
            },
            role,
        ));
        if overdue {
            state.overdue.insert(id.to_string());
        }
    }

    pub fn seed_snapshot(&self, scope: &str, snapshot: Snapshot) {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .push((scope.to_string(), snapshot));
    }

    pub fn break_entity(&self, id: &str) {
        self.broken_entities.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_snapshot_writes(&self) {
        *self.fail_snapshot_writes.lock().unwrap() = true;
    }

    pub fn fail_directory(&self) {
        *self.fail_directory.lock().unwrap() = true;
    }

    pub fn snapshots(&self, scope: &str) -> Vec<Snapshot> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .filter(|(s, _)| s == scope)
            .map(|(_, snap)| snap.clone())
            .collect()
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.state.lock().unwrap().notifications.clone()
    }

    pub fn status_of(&self, id: &str) -> Option<EntityStatus> {
        self.state
            .lock()
            .unwrap()
            .entities
            .iter()
            .find(|(e, _)| e.id == id)
            .map(|(e, _)| e.current_status)
    }

    pub fn status_writes(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .status_writes
            .iter()
            .map(|(id, _, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn latest_snapshot(&self, scope: &str) -> Result<Option<Snapshot>, ReconcileError> {
        let state = self.state.lock().unwrap();
        // Later insertion wins ties, so scan with index as tiebreaker.
        Ok(state
            .snapshots
            .iter()
            .enumerate()
            .filter(|(_, (s, _))| s == scope)
            .max_by_key(|(i, (_, snap))| (snap.captured_at, *i))
            .map(|(_, (_, snap))| snap.clone()))
    }

    async fn append_snapshot(&self, scope: &str, snapshot: &Snapshot) -> Result<SnapshotId, ReconcileError> {
        if *self.fail_snapshot_writes.lock().unwrap() {
            return Err(ReconcileError::Persist("snapshot table locked".into()));
        }
        let mut state = self.state.lock().unwrap();
        state.snapshots.push((scope.to_string(), snapshot.clone()));
        Ok(state.snapshots.len() as SnapshotId)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>, ReconcileError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entities
            .iter()
            .filter(|(_, role)| filter.role.as_ref().map_or(true, |r| r == role))
            .map(|(e, _)| e.clone())
            .collect())
    }

    async fn has_related_fact(&self, entity_id: &str, predicate: FactPredicate) -> Result<bool, ReconcileError> {
        if self.broken_entities.lock().unwrap().contains(entity_id) {
            return Err(ReconcileError::Persist(format!("payments query failed for {entity_id}")));
        }
        match predicate {
            FactPredicate::Overdue => Ok(self.state.lock().unwrap().overdue.contains(entity_id)),
        }
    }

    async fn update_status(
        &self,
        entity_id: &str,
        status: EntityStatus,
        at: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let mut state = self.state.lock().unwrap();
        let entity = state
            .entities
            .iter_mut()
            .find(|(e, _)| e.id == entity_id)
            .ok_or_else(|| ReconcileError::Persist(format!("entity not found: {entity_id}")))?;
        entity.0.current_status = status;
        state.status_writes.push((entity_id.to_string(), status, at));
        Ok(())
    }
}

#[async_trait]
impl SubscriberDirectory for MemoryStore {
    async fn list_subscribers(&self, role: &Role) -> Result<Vec<Subscriber>, ReconcileError> {
        if *self.fail_directory.lock().unwrap() {
            return Err(ReconcileError::Persist("directory unavailable".into()));
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .entities
            .iter()
            .filter(|(_, r)| r == role)
            .map(|(e, r)| Subscriber {
                id: e.id.clone(),
                role: r.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl NotificationSink for MemoryStore {
    async fn create_notifications(&self, records: &[NotificationRecord]) -> Result<usize, ReconcileError> {
        let mut state = self.state.lock().unwrap();
        state.notifications.extend_from_slice(records);
        Ok(records.len())
    }
}
