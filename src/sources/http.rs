//! reqwest-backed `Fetcher`.
//!
//! Rate pages vary their content by client, so requests carry a
//! browser-like User-Agent, an Accept header and an Accept-Language
//! header. Every request is bounded by the configured timeout.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::{FetchResponse, Fetcher};
use crate::config::HttpConfig;
use crate::types::ReconcileError;

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new(cfg: &HttpConfig) -> Result<Self, ReconcileError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&cfg.accept_language)
                .map_err(|e| ReconcileError::Config(format!("invalid accept_language: {e}")))?,
        );

        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(cfg.user_agent.clone())
            .default_headers(headers)
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .build()
            .map_err(|e| ReconcileError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, url: &str) -> Result<FetchResponse, ReconcileError> {
        let fetch_err = |message: String| ReconcileError::SourceFetch {
            source_name: url.to_string(),
            message,
        };

        let resp = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                fetch_err(format!("timed out: {e}"))
            } else {
                fetch_err(format!("request failed: {e}"))
            }
        })?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| fetch_err(format!("failed to read body: {e}")))?;

        debug!(url, status, bytes = body.len(), "Fetched source");
        Ok(FetchResponse { status, body })
    }
}
