//! Open311-style upstream client (§4.B).
//!
//! Mirrors `georeport_client.py`: a shared `reqwest::Client` with a 5s
//! connect timeout and a 45s read timeout, `GET {base}/requests.json`
//! filtered to `status=open` and a date window, retried through
//! [`crate::retry::retry_with_jitter`] the same way the Python side wraps
//! `fetch_page` in `backoff.on_exception(backoff.expo, ..., jitter=full_jitter)`.

use std::time::Duration;

use crate::config::Config;
use crate::error::TriageError;
use crate::model::RawRequest;
use crate::retry::{RetryPolicy, retry_with_jitter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(45);
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_secs(30);
const RETRY_MAX_ATTEMPTS: u32 = 6;

/// One page-fetch of a city's open requests. Implemented by
/// [`UpstreamClient`] for production use and by an in-memory double in
/// tests, the same split used for [`crate::store::StateStore`].
pub trait UpstreamFetcher: Send + Sync {
    async fn fetch_open_page(
        &self,
        config: &Config,
        city: &str,
        start: &str,
        end: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RawRequest>, TriageError>;
}

pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> Result<Self, TriageError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }
}

impl UpstreamFetcher for UpstreamClient {
    /// Fetches one page of open requests for `city`, retrying transient
    /// failures (connection errors, timeouts, 5xx/429) up to
    /// [`RETRY_MAX_ATTEMPTS`] times with full jitter.
    async fn fetch_open_page(
        &self,
        config: &Config,
        city: &str,
        start: &str,
        end: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RawRequest>, TriageError> {
        let base = config.base_url_for(city)?;
        let policy = RetryPolicy::new(RETRY_BASE, RETRY_MAX, RETRY_MAX_ATTEMPTS);

        retry_with_jitter(
            policy,
            TriageError::is_transient,
            || self.fetch_once(base, start, end, page, page_size),
        )
        .await
    }
}

impl UpstreamClient {
    async fn fetch_once(
        &self,
        base: &str,
        start: &str,
        end: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RawRequest>, TriageError> {
        let url = format!("{base}/requests.json");
        let send = self.http.get(&url).query(&[
            ("status", "open"),
            ("start_date", start),
            ("end_date", end),
            ("page", &page.to_string()),
            ("page_size", &page_size.to_string()),
        ]);

        let response = tokio::time::timeout(READ_TIMEOUT, send.send())
            .await
            .map_err(|_| TriageError::TransientUpstream {
                status: None,
                message: "read timed out".to_string(),
            })?
            .map_err(|e| TriageError::TransientUpstream {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(TriageError::TransientUpstream {
                status: Some(status.as_u16()),
                message: status.to_string(),
            });
        }
        if !status.is_success() {
            return Err(TriageError::UpstreamPermanent {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        match serde_json::from_str::<Vec<RawRequest>>(&body) {
            Ok(requests) => Ok(requests),
            Err(e) => {
                tracing::warn!(error = %e, "malformed upstream page body, treating as end of pages");
                Ok(Vec::new())
            }
        }
    }
}

/// In-memory double for [`UpstreamFetcher`], used by poller tests. Not
/// `#[cfg(test)]`-gated for the same reason `MemoryStore` isn't — it needs
/// to stay visible to integration tests under `tests/`.
pub struct FakeUpstream {
    pages: std::sync::Mutex<std::collections::HashMap<u32, Vec<RawRequest>>>,
}

impl FakeUpstream {
    /// `pages[n]` is what page `n` (1-indexed) returns; an absent page
    /// returns empty, ending pagination.
    pub fn new(pages: Vec<Vec<RawRequest>>) -> Self {
        let indexed = pages
            .into_iter()
            .enumerate()
            .map(|(i, page)| (i as u32 + 1, page))
            .collect();
        Self {
            pages: std::sync::Mutex::new(indexed),
        }
    }

    pub fn single_page(requests: Vec<RawRequest>) -> Self {
        Self::new(vec![requests])
    }
}

impl UpstreamFetcher for FakeUpstream {
    async fn fetch_open_page(
        &self,
        config: &Config,
        city: &str,
        _start: &str,
        _end: &str,
        page: u32,
        _page_size: u32,
    ) -> Result<Vec<RawRequest>, TriageError> {
        config.base_url_for(city)?;
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&page)
            .cloned()
            .unwrap_or_default())
    }
}
