//! Resident status correction job.
//!
//! Derives each resident's status from their payment records (any overdue
//! payment ⇒ delinquent, otherwise active) and writes it back only where
//! the stored status disagrees. Entities are independent: one failure is
//! recorded in the summary and the sweep carries on.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::detector::status_changed;
use super::RunControl;
use crate::storage::EntityStore;
use crate::types::{
    Entity, EntityFilter, EntityOutcome, EntityResult, EntityStatus, FactPredicate, ReconcileError,
    RunSummary,
};

pub const DEFAULT_WORKERS: usize = 4;

pub struct StatusJob {
    entities: Arc<dyn EntityStore>,
    filter: EntityFilter,
    workers: usize,
}

impl StatusJob {
    pub fn new(entities: Arc<dyn EntityStore>, filter: EntityFilter) -> Self {
        Self {
            entities,
            filter,
            workers: DEFAULT_WORKERS,
        }
    }

    /// Bound on entities processed concurrently. Zero is treated as one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sweep every matching entity.
    ///
    /// Only failing to list the entities is fatal. Per-entity errors end up
    /// in `RunSummary::details`. Cancellation stops new entities from being
    /// picked up and marks the summary as aborted.
    pub async fn run(&self, control: &RunControl) -> Result<RunSummary, ReconcileError> {
        let entities = self.entities.list_entities(&self.filter).await?;
        let total = entities.len();
        info!(count = total, workers = self.workers, "Starting status sweep");

        let outcomes: Vec<EntityOutcome> = stream::iter(entities)
            .take_while(|_| futures::future::ready(!control.is_cancelled()))
            .map(|entity| self.process(entity))
            .buffered(self.workers)
            .collect()
            .await;

        let mut summary = RunSummary::default();
        for outcome in outcomes {
            summary.record(outcome);
        }
        // A cancel that lands after the last entity was picked up does not
        // abort the sweep.
        summary.aborted = summary.total_processed < total;

        if summary.aborted {
            warn!(summary = %summary, "Status sweep aborted");
        } else {
            info!(summary = %summary, "Status sweep complete");
        }
        Ok(summary)
    }

    /// Derive, compare and (if needed) persist one entity. Never fails.
    async fn process(&self, entity: Entity) -> EntityOutcome {
        match self.reconcile_one(&entity).await {
            Ok((derived, updated)) => EntityOutcome {
                entity_id: entity.id,
                previous: Some(entity.current_status),
                derived: Some(derived),
                result: if updated {
                    EntityResult::Updated
                } else {
                    EntityResult::Unchanged
                },
            },
            Err(e) => {
                let err = ReconcileError::EntityProcessing {
                    entity_id: entity.id.clone(),
                    message: e.to_string(),
                };
                warn!(entity_id = %entity.id, error = %err, "Entity failed, continuing sweep");
                EntityOutcome {
                    entity_id: entity.id,
                    previous: Some(entity.current_status),
                    derived: None,
                    result: EntityResult::Failed(e.to_string()),
                }
            }
        }
    }

    async fn reconcile_one(&self, entity: &Entity) -> Result<(EntityStatus, bool), ReconcileError> {
        let derived = self.derive_status(&entity.id).await?;
        if !status_changed(&derived, &entity.current_status) {
            debug!(entity_id = %entity.id, status = %derived, "Status already correct");
            return Ok((derived, false));
        }

        self.entities.update_status(&entity.id, derived, Utc::now()).await?;
        info!(
            entity_id = %entity.id,
            from = %entity.current_status,
            to = %derived,
            "Status corrected"
        );
        Ok((derived, true))
    }

    async fn derive_status(&self, entity_id: &str) -> Result<EntityStatus, ReconcileError> {
        let overdue = self
            .entities
            .has_related_fact(entity_id, FactPredicate::Overdue)
            .await?;
        Ok(if overdue {
            EntityStatus::Delinquent
        } else {
            EntityStatus::Active
        })
    }
}
