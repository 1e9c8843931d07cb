//! Per-city poll cycle (§4.E).
//!
//! Each cycle pages through the last 24 hours of open requests, classifying
//! only ids the state store doesn't already have cached, then evicts
//! previously-cached ids that no longer appear anywhere upstream. Generic
//! over `StateStore`/`UpstreamFetcher`/`ClassifierBackend` so tests can run
//! the same loop against in-memory doubles, mirroring `ingest.py::poll_city`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::classifier::ClassifierBackend;
use crate::config::Config;
use crate::error::TriageError;
use crate::model::merge_record;
use crate::store::StateStore;
use crate::upstream::UpstreamFetcher;

const PAGE_SIZE: u32 = 100;
const CACHE_TTL_SECS: u64 = 24 * 3600;
const LOOKBACK_HOURS: i64 = 24;

pub struct Poller<S: StateStore, U: UpstreamFetcher, C: ClassifierBackend> {
    city: String,
    config: Arc<Config>,
    store: Arc<S>,
    upstream: Arc<U>,
    classifier: Arc<C>,
    cancellation: CancellationToken,
}

impl<S: StateStore, U: UpstreamFetcher, C: ClassifierBackend> Poller<S, U, C> {
    pub fn new(
        city: String,
        config: Arc<Config>,
        store: Arc<S>,
        upstream: Arc<U>,
        classifier: Arc<C>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            city,
            config,
            store,
            upstream,
            classifier,
            cancellation,
        }
    }

    /// Runs cycles until cancelled, sleeping `poll_interval_secs` between
    /// them (§4.E step 8). A cycle that errors is logged and retried next
    /// cycle rather than killing the poller (§4.F: "a poller must not die
    /// silently").
    pub async fn run(&self) {
        loop {
            if self.cancellation.is_cancelled() {
                return;
            }
            if let Err(e) = self.poll_once().await {
                tracing::warn!(city = %self.city, error = %e.user_message(), "poll cycle failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
                _ = self.cancellation.cancelled() => return,
            }
        }
    }

    /// Runs exactly one poll cycle (§4.E, steps 1-8). Exposed separately so
    /// tests can drive cycles deterministically without the sleep loop.
    pub async fn poll_once(&self) -> Result<(), TriageError> {
        // 1. full rescan of the last 24 hours.
        let now = chrono::Utc::now();
        let end = crate::time::format(now);
        let start = crate::time::format(now - chrono::Duration::hours(LOOKBACK_HOURS));

        let mut seen = HashSet::new();
        let mut page = 1u32;

        loop {
            if self.cancellation.is_cancelled() {
                return Ok(());
            }

            // 3. page through open requests.
            let batch = self
                .upstream
                .fetch_open_page(&self.config, &self.city, &start, &end, page, PAGE_SIZE)
                .await?;
            if batch.is_empty() {
                break;
            }

            // 4. partition this page into new vs already-cached.
            let mut new_requests = Vec::new();
            for req in &batch {
                seen.insert(req.service_request_id.clone());
                if !self
                    .store
                    .is_cached(&self.city, &req.service_request_id)
                    .await?
                {
                    new_requests.push(req.clone());
                }
            }

            // 5. classify and cache only what's new on this page. A
            // classifier failure aborts this page's insert step only —
            // `seen` already holds every id on the page, so none of them
            // get spuriously evicted at step 7.
            if !new_requests.is_empty() {
                match self.classifier.classify_batch(&new_requests).await {
                    Ok(verdicts) => {
                        for (req, verdict) in new_requests.iter().zip(verdicts.iter()) {
                            let record = merge_record(req, verdict, &self.city);
                            self.store
                                .cache_request(
                                    &self.city,
                                    &req.service_request_id,
                                    &record,
                                    CACHE_TTL_SECS,
                                )
                                .await?;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            city = %self.city,
                            page,
                            error = %e.user_message(),
                            "classifier call failed, skipping insert for this page"
                        );
                    }
                }
            }

            tracing::info!(
                city = %self.city,
                page,
                fetched = batch.len(),
                classified = new_requests.len(),
                "poll page processed"
            );

            // 6. crude rate limit between pages.
            page += 1;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
                _ = self.cancellation.cancelled() => return Ok(()),
            }
        }

        // 7. evict anything cached that's no longer open anywhere upstream.
        let cached_ids = self.store.get_cached_ids(&self.city).await?;
        for id in cached_ids {
            if self.cancellation.is_cancelled() {
                return Ok(());
            }
            if !seen.contains(&id) {
                self.store.evict_request(&self.city, &id).await?;
            }
        }

        Ok(())
    }
}
