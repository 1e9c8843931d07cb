//! End-to-end poll-cycle scenarios (spec §8, S1-S4): a `Poller` driven
//! against in-memory doubles for the upstream API, the classifier, and the
//! state store — no network involved.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use triage::classifier::FakeClassifier;
use triage::config::Config;
use triage::error::TriageError;
use triage::model::{RawRequest, RequestFlag, Verdict};
use triage::poller::Poller;
use triage::store::{MemoryStore, StateStore};
use triage::upstream::{FakeUpstream, UpstreamFetcher};

fn test_config() -> Arc<Config> {
    let mut cities = HashMap::new();
    cities.insert("springfield".to_string(), "https://springfield.example".to_string());
    Arc::new(Config {
        openai_api_key: "test-key".to_string(),
        api_keys: vec!["test".to_string()],
        redis_url: "redis://unused".to_string(),
        poll_interval_secs: 0,
        cities,
        models: vec!["gpt-test".to_string()],
    })
}

fn raw(id: &str, requested_datetime: &str) -> RawRequest {
    serde_json::from_value(json!({
        "service_request_id": id,
        "status": "open",
        "requested_datetime": requested_datetime,
        "service_name": "Pothole",
    }))
    .unwrap()
}

fn verdict(priority: u8) -> Verdict {
    Verdict {
        priority,
        flag: vec![RequestFlag::Infrastructure],
        priority_explanation: "blocks lane".to_string(),
        flag_explanation: "on street".to_string(),
        incident_label: "pothole".to_string(),
    }
}

#[tokio::test]
async fn s1_first_ingest_populates_record_and_aggregates() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let upstream = Arc::new(FakeUpstream::single_page(vec![raw(
        "7",
        "2024-01-01T00:00:00Z",
    )]));
    let classifier = Arc::new(FakeClassifier::new(vec![verdict(80)]));

    let poller = Poller::new(
        "springfield".to_string(),
        config,
        store.clone(),
        upstream,
        classifier,
        CancellationToken::new(),
    );
    poller.poll_once().await.unwrap();

    assert!(store.is_cached("springfield", "7").await.unwrap());
    let ids = store.get_cached_ids("springfield").await.unwrap();
    assert_eq!(ids.len(), 1);
    assert!(ids.contains("7"));

    let stats = store.get_city_stats("springfield").await.unwrap();
    assert_eq!(stats.num_open, 1);
    assert_eq!(stats.avg_priority, 80.0);

    let global = store.get_global_stats().await.unwrap();
    assert_eq!(global.num_open, 1);
}

#[tokio::test]
async fn s2_rerunning_an_unchanged_cycle_makes_zero_classifier_calls() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let request = raw("7", "2024-01-01T00:00:00Z");

    let upstream = Arc::new(FakeUpstream::single_page(vec![request.clone()]));
    let classifier = Arc::new(FakeClassifier::new(vec![verdict(80)]));
    let poller = Poller::new(
        "springfield".to_string(),
        config.clone(),
        store.clone(),
        upstream,
        classifier.clone(),
        CancellationToken::new(),
    );
    poller.poll_once().await.unwrap();
    assert_eq!(classifier.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    // second cycle, same upstream state: request 7 is already cached.
    let upstream2 = Arc::new(FakeUpstream::single_page(vec![request]));
    let classifier2 = Arc::new(FakeClassifier::new(vec![]));
    let poller2 = Poller::new(
        "springfield".to_string(),
        config,
        store.clone(),
        upstream2,
        classifier2.clone(),
        CancellationToken::new(),
    );
    poller2.poll_once().await.unwrap();

    assert_eq!(classifier2.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    let stats = store.get_city_stats("springfield").await.unwrap();
    assert_eq!(stats.num_open, 1);
    assert_eq!(stats.avg_priority, 80.0);
}

#[tokio::test]
async fn s3_upstream_no_longer_reporting_request_open_evicts_it() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());

    let upstream = Arc::new(FakeUpstream::single_page(vec![raw(
        "7",
        "2024-01-01T00:00:00Z",
    )]));
    let classifier = Arc::new(FakeClassifier::new(vec![verdict(80)]));
    let poller = Poller::new(
        "springfield".to_string(),
        config.clone(),
        store.clone(),
        upstream,
        classifier,
        CancellationToken::new(),
    );
    poller.poll_once().await.unwrap();
    assert_eq!(store.get_cached_ids("springfield").await.unwrap().len(), 1);

    // second cycle: upstream now reports nothing open.
    let empty_upstream = Arc::new(FakeUpstream::single_page(vec![]));
    let classifier2 = Arc::new(FakeClassifier::new(vec![]));
    let poller2 = Poller::new(
        "springfield".to_string(),
        config,
        store.clone(),
        empty_upstream,
        classifier2,
        CancellationToken::new(),
    );
    poller2.poll_once().await.unwrap();

    assert!(store.get_cached_ids("springfield").await.unwrap().is_empty());
    let stats = store.get_city_stats("springfield").await.unwrap();
    assert_eq!(stats.num_open, 0);
    assert_eq!(stats.avg_priority, 0.0);
    let global = store.get_global_stats().await.unwrap();
    assert_eq!(global.num_open, 0);
}

#[tokio::test]
async fn s4_mixed_cycle_keeps_existing_and_classifies_only_the_new_id() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());

    let upstream = Arc::new(FakeUpstream::single_page(vec![raw(
        "7",
        "2024-01-01T00:00:00Z",
    )]));
    let classifier = Arc::new(FakeClassifier::new(vec![verdict(80)]));
    let poller = Poller::new(
        "springfield".to_string(),
        config.clone(),
        store.clone(),
        upstream,
        classifier,
        CancellationToken::new(),
    );
    poller.poll_once().await.unwrap();

    // second cycle: 7 still open, 8 is new.
    let upstream2 = Arc::new(FakeUpstream::single_page(vec![
        raw("7", "2024-01-01T00:00:00Z"),
        raw("8", "2024-01-01T01:00:00Z"),
    ]));
    let classifier2 = Arc::new(FakeClassifier::new(vec![verdict(40)]));
    let poller2 = Poller::new(
        "springfield".to_string(),
        config,
        store.clone(),
        upstream2,
        classifier2.clone(),
        CancellationToken::new(),
    );
    poller2.poll_once().await.unwrap();

    assert_eq!(classifier2.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    let ids = store.get_cached_ids("springfield").await.unwrap();
    assert_eq!(ids.len(), 2);
    let stats = store.get_city_stats("springfield").await.unwrap();
    assert_eq!(stats.num_open, 2);
    assert_eq!(stats.avg_priority, 60.0); // (80 + 40) / 2
}

#[tokio::test]
async fn classifier_failure_on_a_page_is_skipped_without_spurious_eviction() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());

    let upstream = Arc::new(FakeUpstream::single_page(vec![raw(
        "9",
        "2024-01-01T00:00:00Z",
    )]));
    let classifier = Arc::new(FakeClassifier::new(vec![]));
    classifier.queue_failure(triage::error::TriageError::ClassifierOther("down".into()));
    let poller = Poller::new(
        "springfield".to_string(),
        config,
        store.clone(),
        upstream,
        classifier,
        CancellationToken::new(),
    );

    // the cycle itself succeeds (classifier errors are caught per-page).
    poller.poll_once().await.unwrap();

    // id 9 was never cached (classify failed), and nothing spurious was
    // evicted — the open set stays empty rather than erroring out.
    assert!(store.get_cached_ids("springfield").await.unwrap().is_empty());
}

/// An upstream double that cancels a token as a side effect of being
/// fetched from, used to simulate a cancellation signal arriving mid-cycle
/// (after pagination completes but before the eviction pass starts).
struct CancelOnFetch {
    inner: FakeUpstream,
    token: CancellationToken,
}

impl UpstreamFetcher for CancelOnFetch {
    async fn fetch_open_page(
        &self,
        config: &Config,
        city: &str,
        start: &str,
        end: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RawRequest>, TriageError> {
        self.token.cancel();
        self.inner
            .fetch_open_page(config, city, start, end, page, page_size)
            .await
    }
}

/// §5: "a poller must not die silently" and "honor a cancellation signal at
/// any suspension point" — a cancellation observed after pagination ends
/// stops the post-pagination eviction loop rather than running it to
/// completion.
#[tokio::test]
async fn cancellation_during_eviction_pass_stops_further_evictions() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());

    let upstream = Arc::new(FakeUpstream::single_page(vec![raw(
        "7",
        "2024-01-01T00:00:00Z",
    )]));
    let classifier = Arc::new(FakeClassifier::new(vec![verdict(80)]));
    let poller = Poller::new(
        "springfield".to_string(),
        config.clone(),
        store.clone(),
        upstream,
        classifier,
        CancellationToken::new(),
    );
    poller.poll_once().await.unwrap();
    assert_eq!(store.get_cached_ids("springfield").await.unwrap().len(), 1);

    // second cycle: upstream reports nothing open (would normally evict "7"),
    // but fetching the (empty) first page cancels the token, simulating a
    // shutdown signal arriving right as pagination wraps up.
    let token = CancellationToken::new();
    let upstream2 = Arc::new(CancelOnFetch {
        inner: FakeUpstream::single_page(vec![]),
        token: token.clone(),
    });
    let classifier2 = Arc::new(FakeClassifier::new(vec![]));
    let poller2 = Poller::new(
        "springfield".to_string(),
        config,
        store.clone(),
        upstream2,
        classifier2,
        token,
    );
    poller2.poll_once().await.unwrap();

    // the eviction loop bailed at its first cancellation check, so "7" is
    // still cached rather than evicted.
    assert_eq!(store.get_cached_ids("springfield").await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_city_surfaces_as_an_error() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let upstream = Arc::new(FakeUpstream::single_page(vec![]));
    let classifier = Arc::new(FakeClassifier::new(vec![]));
    let poller = Poller::new(
        "gotham".to_string(),
        config,
        store,
        upstream,
        classifier,
        CancellationToken::new(),
    );
    let err = poller.poll_once().await.unwrap_err();
    assert!(matches!(err, triage::error::TriageError::UnknownCity(_)));
}
