//! External data sources.
//!
//! Defines the `Fetcher` trait (HTTP GET as seen by the jobs), the
//! reqwest-backed implementation, and the resolver that walks an ordered
//! chain of sources until one yields a valid value.

pub mod chain;
pub mod http;

use async_trait::async_trait;

use crate::config::{ExtractorConfig, SourceConfig};
use crate::extract::{Extractor, LabelWindowExtractor, SectionLabelExtractor};
use crate::types::ReconcileError;

pub use chain::{Resolution, SourceChainResolver};
pub use http::HttpFetcher;

/// Status and body of a completed GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Abstraction over HTTP GET.
///
/// Implementors apply their own headers and timeout. Timeouts and
/// connection failures come back as `ReconcileError::SourceFetch`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchResponse, ReconcileError>;
}

/// One entry of a source chain.
pub struct Source {
    pub name: String,
    pub url: String,
    pub extractor: Box<dyn Extractor>,
}

impl Source {
    pub fn new(name: impl Into<String>, url: impl Into<String>, extractor: Box<dyn Extractor>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            extractor,
        }
    }

    /// Build a source from its declarative config entry.
    pub fn from_config(cfg: &SourceConfig) -> Self {
        let extractor: Box<dyn Extractor> = match &cfg.extractor {
            ExtractorConfig::SectionLabel {
                section,
                label,
                section_window,
                label_window,
                label_range,
            } => {
                let mut e = SectionLabelExtractor::new(&cfg.name, section, label)
                    .with_windows(*section_window, *label_window);
                if let Some(r) = label_range {
                    e = e.with_label_range(r.to_range());
                }
                Box::new(e)
            }
            ExtractorConfig::LabelWindow { label, window } => {
                Box::new(LabelWindowExtractor::new(&cfg.name, label).with_window(*window))
            }
        };
        Source::new(&cfg.name, &cfg.url, extractor)
    }
}
