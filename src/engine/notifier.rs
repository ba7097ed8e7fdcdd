//! Change notifications.
//!
//! Builds one record per subscriber when a tracked value changes and hands
//! the batch to the notification sink. Delivery is best effort: failures
//! are reported in the outcome, never raised to the job.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::storage::{NotificationSink, SubscriberDirectory};
use crate::types::{ChangeDescription, NotificationRecord, NotifyOutcome, Role, Subscriber};

pub const RATE_UPDATE_KIND: &str = "rate_update";
const RATE_UPDATE_TITLE: &str = "Exchange rate updated";

/// One record per subscriber, all sharing kind and title.
pub fn build_notifications(
    subscribers: &[Subscriber],
    change: &ChangeDescription,
    now: DateTime<Utc>,
) -> Vec<NotificationRecord> {
    let body = notification_body(change);
    subscribers
        .iter()
        .map(|s| NotificationRecord {
            subscriber_id: s.id.clone(),
            kind: RATE_UPDATE_KIND.to_string(),
            title: RATE_UPDATE_TITLE.to_string(),
            body: body.clone(),
            requires_action: true,
            read: false,
            created_at: now,
        })
        .collect()
}

fn notification_body(change: &ChangeDescription) -> String {
    let previous = match change.previous {
        Some(prev) => format!(" (previously {prev} {})", change.unit),
        None => String::new(),
    };
    format!(
        "The exchange rate is now {} {}{previous}, as published by {}. \
         Please review pending receipts and balances that depend on this rate.",
        change.value, change.unit, change.source,
    )
}

pub struct Notifier {
    directory: Arc<dyn SubscriberDirectory>,
    sink: Arc<dyn NotificationSink>,
    role: Role,
}

impl Notifier {
    pub fn new(directory: Arc<dyn SubscriberDirectory>, sink: Arc<dyn NotificationSink>, role: Role) -> Self {
        Self { directory, sink, role }
    }

    /// Notify everyone holding the configured role.
    pub async fn notify_all(&self, change: &ChangeDescription) -> NotifyOutcome {
        let subscribers = match self.directory.list_subscribers(&self.role).await {
            Ok(s) => s,
            Err(e) => {
                warn!(role = %self.role, error = %e, "Could not list subscribers, skipping notification");
                return NotifyOutcome::Skipped(e.to_string());
            }
        };

        if subscribers.is_empty() {
            info!(role = %self.role, "No subscribers to notify");
            return NotifyOutcome::NoSubscribers;
        }

        let records = build_notifications(&subscribers, change, Utc::now());
        match self.sink.create_notifications(&records).await {
            Ok(count) => {
                info!(count, role = %self.role, "Notifications created");
                NotifyOutcome::Sent(count)
            }
            Err(e) => {
                warn!(error = %e, "Failed to create notifications");
                NotifyOutcome::Failed(e.to_string())
            }
        }
    }
}
