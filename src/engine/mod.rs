//! Core engine — change detection, notification fan-out, and the two
//! reconciliation job shapes.

pub mod detector;
pub mod notifier;
pub mod rate_job;
pub mod status_job;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation shared between a job and whoever may abort it.
///
/// Jobs check it only between units of work (source attempts, entities),
/// so a cancelled run never leaves a half-written unit behind.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancelled: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
