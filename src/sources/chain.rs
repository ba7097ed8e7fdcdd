//! Source chain resolution.
//!
//! Sources are tried strictly in order. A later source is contacted only
//! after every earlier one has failed to fetch or failed to yield an
//! in-range value, and nothing is ever fetched speculatively.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Fetcher, Source};
use crate::engine::RunControl;
use crate::types::{AttemptOutcome, ReconcileError, SourceAttempt, ValidRange};

/// The value a chain settled on and how it got there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub value: Decimal,
    pub source_name: String,
    /// One entry per source tried, in order; the last one succeeded.
    pub attempts: Vec<SourceAttempt>,
}

pub struct SourceChainResolver {
    fetcher: Arc<dyn Fetcher>,
    sources: Vec<Source>,
    range: ValidRange,
}

impl SourceChainResolver {
    pub fn new(fetcher: Arc<dyn Fetcher>, sources: Vec<Source>, range: ValidRange) -> Self {
        Self {
            fetcher,
            sources,
            range,
        }
    }

    pub fn range(&self) -> &ValidRange {
        &self.range
    }

    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(|s| s.name.as_str())
    }

    /// Walk the chain and return the first valid value.
    ///
    /// Fetch failures and extraction misses are absorbed and recorded;
    /// only exhausting the chain (or cancellation) is an error.
    pub async fn resolve(&self, control: &RunControl) -> Result<Resolution, ReconcileError> {
        let mut attempts = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            if control.is_cancelled() {
                warn!(source = %source.name, "Run cancelled before source attempt");
                return Err(ReconcileError::Cancelled);
            }

            let outcome = match self.attempt(source).await {
                Ok(value) => {
                    info!(source = %source.name, value = %value, "Source yielded a valid value");
                    attempts.push(SourceAttempt {
                        source_name: source.name.clone(),
                        outcome: AttemptOutcome::Success(value),
                    });
                    return Ok(Resolution {
                        value,
                        source_name: source.name.clone(),
                        attempts,
                    });
                }
                Err(ReconcileError::ExtractionMiss { .. }) => {
                    warn!(source = %source.name, range = %self.range, "No valid value in source, trying next");
                    AttemptOutcome::ExtractionMiss
                }
                Err(e) => {
                    warn!(source = %source.name, error = %e, "Source fetch failed, trying next");
                    AttemptOutcome::FetchFailed(e.to_string())
                }
            };
            attempts.push(SourceAttempt {
                source_name: source.name.clone(),
                outcome,
            });
        }

        Err(ReconcileError::NoSourceAvailable { attempts })
    }

    /// Fetch and extract one source.
    async fn attempt(&self, source: &Source) -> Result<Decimal, ReconcileError> {
        let resp = self.fetcher.get(&source.url).await.map_err(|e| match e {
            ReconcileError::SourceFetch { message, .. } => ReconcileError::SourceFetch {
                source_name: source.name.clone(),
                message,
            },
            other => other,
        })?;

        if !resp.is_success() {
            return Err(ReconcileError::SourceFetch {
                source_name: source.name.clone(),
                message: format!("HTTP {}", resp.status),
            });
        }

        match source.extractor.extract(&resp.body, &self.range) {
            Some(value) if self.range.contains(value) => Ok(value),
            Some(value) => {
                warn!(
                    source = %source.name,
                    extractor = source.extractor.name(),
                    value = %value,
                    "Extractor returned a value outside the valid range, discarding"
                );
                Err(ReconcileError::ExtractionMiss {
                    source_name: source.name.clone(),
                })
            }
            None => Err(ReconcileError::ExtractionMiss {
                source_name: source.name.clone(),
            }),
        }
    }
}
