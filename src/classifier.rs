//! LLM-backed classifier client (§4.C).
//!
//! Mirrors `openai_client.py`: one chat-completion call per batch of
//! requests, asking for a structured-output JSON object so each request
//! gets back exactly one [`Verdict`], in order. A request whose `media_url`
//! is an `https` URL is attached as a low-detail image; requests without
//! one are text-only.
//!
//! Models are tried in the order given by [`Config::models`] (§6). A bad
//! image (model rejects the URL) is retried once on the *same* model with
//! the image stripped; a rate limit moves straight to the next model with
//! no retry on the current one. Exhausting the chain surfaces the last
//! error, which the outer [`crate::retry::retry_with_jitter`] layer retries
//! with backoff+jitter when it's a transient failure (connection, timeout,
//! internal server error, or a rate limit that survived every model) —
//! mirroring the Python original's `@backoff.on_exception` decorator around
//! the whole `classify_batch` function.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::Config;
use crate::error::TriageError;
use crate::model::{RawRequest, Verdict, has_attachable_image};
use crate::retry::{RetryPolicy, retry_with_jitter};

const DEFAULT_CHUNK_SIZE: usize = 5;
const IMAGE_DETAIL: &str = "low";
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_secs(30);
const RETRY_MAX_ATTEMPTS: u32 = 6;

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
struct BatchVerdict {
    requests: Vec<Verdict>,
}

/// A batch classifier, implemented by [`ClassifierClient`] for production
/// use and by [`FakeClassifier`] in tests — the same split
/// [`crate::store::StateStore`] uses for the real/fake store pair.
pub trait ClassifierBackend: Send + Sync {
    /// Classifies `requests` in a single call, walking the model fallback
    /// chain. `len(output) == len(input)` whenever this returns `Ok`
    /// (§8, testable property 4).
    async fn classify_batch(&self, requests: &[RawRequest]) -> Result<Vec<Verdict>, TriageError>;

    /// How long to sleep between chunks in [`classify_batch_in_chunks`].
    /// Mirrors the original's `settings.poll_interval` throttle.
    fn chunk_sleep(&self) -> Duration;

    /// Splits `requests` into fixed-size chunks, classifies each
    /// independently via [`Self::classify_batch`], and concatenates the
    /// results in order. Sleeps [`Self::chunk_sleep`] between chunks as a
    /// crude throttle (§4.C, "chunked variant").
    async fn classify_batch_in_chunks(
        &self,
        requests: &[RawRequest],
    ) -> Result<Vec<Verdict>, TriageError> {
        classify_in_chunks(self, requests, DEFAULT_CHUNK_SIZE).await
    }
}

async fn classify_in_chunks<C: ClassifierBackend + ?Sized>(
    backend: &C,
    requests: &[RawRequest],
    chunk_size: usize,
) -> Result<Vec<Verdict>, TriageError> {
    let mut out = Vec::with_capacity(requests.len());
    let chunks: Vec<&[RawRequest]> = requests.chunks(chunk_size.max(1)).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        out.extend(backend.classify_batch(chunk).await?);
        if i + 1 < chunks.len() {
            tokio::time::sleep(backend.chunk_sleep()).await;
        }
    }
    Ok(out)
}

pub struct ClassifierClient {
    http: reqwest::Client,
    api_key: String,
    models: Vec<String>,
    poll_interval_secs: u64,
}

impl ClassifierClient {
    pub fn new(config: &Config) -> Result<Self, TriageError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            api_key: config.openai_api_key.clone(),
            models: config.models.clone(),
            poll_interval_secs: config.poll_interval_secs,
        })
    }

    /// Classifies one batch, walking the model fallback chain (§4.C
    /// steps 1-4) and retrying the whole chain with backoff+jitter on
    /// transient errors (connection, timeout, internal server error, or a
    /// rate limit that survived the fallback chain) — the outer-layer retry
    /// mirrors the Python original's
    /// `@backoff.on_exception(backoff.expo, TRANSIENT_ERRORS, jitter=full_jitter)`
    /// wrapping the whole `classify_batch` function.
    async fn classify_chain(&self, requests: &[RawRequest]) -> Result<Vec<Verdict>, TriageError> {
        if self.models.is_empty() {
            return Err(TriageError::ClassifierOther(
                "no classifier models configured".to_string(),
            ));
        }
        let policy = RetryPolicy::new(RETRY_BASE, RETRY_MAX, RETRY_MAX_ATTEMPTS);
        retry_with_jitter(policy, TriageError::is_transient, || {
            run_fallback_chain(&self.models, |model, with_images| {
                self.try_model(model, requests, with_images)
            })
        })
        .await
    }

    async fn try_model(
        &self,
        model: &str,
        requests: &[RawRequest],
        with_images: bool,
    ) -> Result<Vec<Verdict>, TriageError> {
        let body = build_request_body(model, requests, with_images);

        // A connection/timeout failure here becomes `TriageError::Request`,
        // which `is_transient()` already treats as retryable — the same
        // transport-error class the outer `classify_chain` retry wraps.
        let response = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(TriageError::ClassifierRateLimit {
                provider: model.to_string(),
            });
        }
        if status.as_u16() == 400 {
            let text = response.text().await.unwrap_or_default();
            let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let param = body["error"]["param"].as_str();
            let code = body["error"]["code"].as_str();
            if param == Some("url") && code == Some("invalid_value") {
                return Err(TriageError::ClassifierBadImage);
            }
            return Err(TriageError::ClassifierOther(text));
        }
        if status.is_server_error() {
            // Internal server error: treated as transient the same way
            // connection/timeout failures are, per §4.C's "Transient errors".
            return Err(match response.error_for_status() {
                Err(e) => TriageError::Request(e),
                Ok(_) => TriageError::ClassifierOther(format!(
                    "classifier returned status {status}"
                )),
            });
        }
        if !status.is_success() {
            return Err(TriageError::ClassifierOther(format!(
                "classifier returned status {status}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| TriageError::ClassifierOther(e.to_string()))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| TriageError::ClassifierOther("missing message content".to_string()))?;
        let batch: BatchVerdict = serde_json::from_str(content)
            .map_err(|e| TriageError::ClassifierOther(format!("malformed verdict json: {e}")))?;

        if batch.requests.len() != requests.len() {
            return Err(TriageError::ClassifierOther(format!(
                "expected {} verdicts, got {}",
                requests.len(),
                batch.requests.len()
            )));
        }
        Ok(batch.requests)
    }
}

/// Model-fallback control flow (§4.C steps 1-4), factored out of
/// [`ClassifierClient`] so it can be exercised directly in tests without a
/// live endpoint: `attempt(model, with_images)` makes one call attempt.
async fn run_fallback_chain<'m, F, Fut>(
    models: &'m [String],
    mut attempt: F,
) -> Result<Vec<Verdict>, TriageError>
where
    F: FnMut(&'m str, bool) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<Verdict>, TriageError>>,
{
    let mut last_err = None;
    for model in models {
        match attempt(model, true).await {
            Ok(verdicts) => return Ok(verdicts),
            Err(TriageError::ClassifierBadImage) => match attempt(model, false).await {
                Ok(verdicts) => return Ok(verdicts),
                Err(e @ TriageError::ClassifierRateLimit { .. }) => {
                    tracing::warn!(
                        model,
                        "imageless retry rate limited, falling back to next model"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            },
            Err(e @ TriageError::ClassifierRateLimit { .. }) => {
                tracing::warn!(model, "classifier rate limited, falling back to next model");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        TriageError::ClassifierOther("classifier fallback chain exhausted".to_string())
    }))
}

impl ClassifierBackend for ClassifierClient {
    async fn classify_batch(&self, requests: &[RawRequest]) -> Result<Vec<Verdict>, TriageError> {
        self.classify_chain(requests).await
    }

    fn chunk_sleep(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// `messages = [system, user_1, user_2, ...]`, one user message per
/// request (§4.C, "Input assembly").
fn build_request_body(model: &str, requests: &[RawRequest], with_images: bool) -> Value {
    let schema = schemars::schema_for!(BatchVerdict);
    let mut messages = vec![json!({"role": "system", "content": SYSTEM_PROMPT})];
    messages.extend(requests.iter().map(|req| build_user_message(req, with_images)));

    json!({
        "model": model,
        "messages": messages,
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": "batch_verdict",
                "schema": schema,
                "strict": true,
            },
        },
    })
}

/// One user message: the request serialized as compact JSON, plus an
/// `image_url` part when `with_images` and the request carries an
/// attachable `media_url` (§4.C).
fn build_user_message(req: &RawRequest, with_images: bool) -> Value {
    let compact = serde_json::to_string(&raw_request_as_value(req))
        .unwrap_or_else(|_| "{}".to_string());
    let mut parts = vec![json!({
        "type": "text",
        "text": compact,
    })];

    if with_images && has_attachable_image(req) {
        if let Some(url) = &req.media_url {
            parts.push(json!({
                "type": "image_url",
                "image_url": {"url": url, "detail": IMAGE_DETAIL},
            }));
        }
    }

    json!({"role": "user", "content": parts})
}

fn raw_request_as_value(req: &RawRequest) -> Value {
    let mut obj = req.extra.clone();
    obj.insert("service_request_id".into(), json!(req.service_request_id));
    if let Some(v) = &req.status {
        obj.insert("status".into(), json!(v));
    }
    if let Some(v) = &req.requested_datetime {
        obj.insert("requested_datetime".into(), json!(v));
    }
    if let Some(v) = &req.service_name {
        obj.insert("service_name".into(), json!(v));
    }
    if let Some(v) = &req.description {
        obj.insert("description".into(), json!(v));
    }
    if let Some(v) = &req.media_url {
        obj.insert("media_url".into(), json!(v));
    }
    if let Some(v) = &req.address {
        obj.insert("address".into(), json!(v));
    }
    if let Some(v) = req.lat {
        obj.insert("lat".into(), json!(v));
    }
    if let Some(v) = req.long {
        obj.insert("long".into(), json!(v));
    }
    Value::Object(obj)
}

const SYSTEM_PROMPT: &str = "You triage municipal service requests. For each request, \
assign a priority from 0 (no urgency) to 100 (immediate safety risk), one or more \
category flags, a short incident label, and brief explanations for the priority and \
flags you chose. Return exactly one verdict per request, in the same order.";

/// In-memory double for [`ClassifierBackend`], used by poller tests so they
/// don't depend on a live LLM endpoint. Not `#[cfg(test)]`-gated for the
/// same reason `MemoryStore` isn't — it needs to stay visible to
/// integration tests under `tests/`.
pub struct FakeClassifier {
    verdicts: std::sync::Mutex<std::collections::VecDeque<Verdict>>,
    pub calls: std::sync::atomic::AtomicUsize,
    fail_next: std::sync::Mutex<std::collections::VecDeque<TriageError>>,
}

impl FakeClassifier {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        Self {
            verdicts: std::sync::Mutex::new(verdicts.into()),
            calls: std::sync::atomic::AtomicUsize::new(0),
            fail_next: std::sync::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Queues an error to return on the next `classify_batch` call instead
    /// of consuming queued verdicts.
    pub fn queue_failure(&self, err: TriageError) {
        self.fail_next.lock().unwrap().push_back(err);
    }
}

impl ClassifierBackend for FakeClassifier {
    async fn classify_batch(&self, requests: &[RawRequest]) -> Result<Vec<Verdict>, TriageError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(err) = self.fail_next.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut queue = self.verdicts.lock().unwrap();
        let mut out = Vec::with_capacity(requests.len());
        for _ in requests {
            out.push(queue.pop_front().unwrap_or(Verdict {
                priority: 0,
                flag: vec![],
                priority_explanation: String::new(),
                flag_explanation: String::new(),
                incident_label: String::new(),
            }));
        }
        Ok(out)
    }

    fn chunk_sleep(&self) -> Duration {
        Duration::from_millis(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> RawRequest {
        serde_json::from_value(json!({
            "service_request_id": "1",
            "service_name": "Pothole",
            "description": "large hole in the road",
        }))
        .unwrap()
    }

    #[test]
    fn user_message_omits_image_without_https_media_url() {
        let mut req = sample_request();
        req.media_url = Some("http://insecure.example/a.png".to_string());
        let message = build_user_message(&req, true);
        let parts = message["content"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn user_message_attaches_https_image_at_low_detail() {
        let mut req = sample_request();
        req.media_url = Some("https://example.com/a.png".to_string());
        let message = build_user_message(&req, true);
        let parts = message["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["image_url"]["detail"], json!("low"));
    }

    #[test]
    fn with_images_false_suppresses_attachment_even_with_https_url() {
        let mut req = sample_request();
        req.media_url = Some("https://example.com/a.png".to_string());
        let message = build_user_message(&req, false);
        let parts = message["content"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn request_body_has_one_user_message_per_request() {
        let reqs = vec![sample_request(), sample_request()];
        let body = build_request_body("gpt-test", &reqs, true);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3); // system + 2 user
        assert_eq!(messages[0]["role"], json!("system"));
        assert_eq!(messages[1]["role"], json!("user"));
        assert_eq!(messages[2]["role"], json!("user"));
    }

    #[tokio::test]
    async fn fake_classifier_preserves_order_and_length() {
        let fake = FakeClassifier::new(vec![
            Verdict {
                priority: 10,
                flag: vec![],
                priority_explanation: "a".into(),
                flag_explanation: "a".into(),
                incident_label: "a".into(),
            },
            Verdict {
                priority: 20,
                flag: vec![],
                priority_explanation: "b".into(),
                flag_explanation: "b".into(),
                incident_label: "b".into(),
            },
        ]);
        let reqs = vec![sample_request(), sample_request()];
        let out = fake.classify_batch(&reqs).await.unwrap();
        assert_eq!(out.len(), reqs.len());
        assert_eq!(out[0].priority, 10);
        assert_eq!(out[1].priority, 20);
    }

    fn dummy_verdict() -> Verdict {
        Verdict {
            priority: 1,
            flag: vec![],
            priority_explanation: String::new(),
            flag_explanation: String::new(),
            incident_label: String::new(),
        }
    }

    /// S5: first call on model M1 rejects the image; the imageless retry on
    /// the same model succeeds. Exactly two attempts, no fallback to M2.
    #[tokio::test]
    async fn bad_image_retries_once_on_same_model_before_success() {
        let models = vec!["m1".to_string(), "m2".to_string()];
        let calls = std::sync::Mutex::new(Vec::new());
        let result = run_fallback_chain(&models, |model, with_images| {
            calls.lock().unwrap().push((model.to_string(), with_images));
            async move {
                if with_images {
                    Err(TriageError::ClassifierBadImage)
                } else {
                    Ok(vec![dummy_verdict()])
                }
            }
        })
        .await;

        assert!(result.is_ok());
        let calls = calls.into_inner().unwrap();
        assert_eq!(
            calls,
            vec![("m1".to_string(), true), ("m1".to_string(), false)]
        );
    }

    /// S6: M1 rate-limits, M2 succeeds — same result as a single M2 call,
    /// with no retry attempted against M1 first.
    #[tokio::test]
    async fn rate_limit_falls_through_to_next_model() {
        let models = vec!["m1".to_string(), "m2".to_string()];
        let calls = std::sync::Mutex::new(Vec::new());
        let result = run_fallback_chain(&models, |model, with_images| {
            calls.lock().unwrap().push(model.to_string());
            let model = model.to_string();
            async move {
                if model == "m1" {
                    Err(TriageError::ClassifierRateLimit { provider: model })
                } else {
                    Ok(vec![dummy_verdict()])
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.into_inner().unwrap(), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn rate_limit_exhausting_chain_reraises() {
        let models = vec!["only".to_string()];
        let result: Result<Vec<Verdict>, TriageError> = run_fallback_chain(&models, |model, _| {
            let model = model.to_string();
            async move { Err(TriageError::ClassifierRateLimit { provider: model }) }
        })
        .await;
        assert!(matches!(result, Err(TriageError::ClassifierRateLimit { .. })));
    }

    /// The outer retry layer (§4.C "Transient errors... at the outer
    /// layer") re-walks the whole fallback chain from scratch on a
    /// transient error, rather than giving up after one exhausted pass.
    #[tokio::test]
    async fn outer_retry_re_walks_the_chain_on_transient_error() {
        let models = vec!["only".to_string()];
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let policy = RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            RETRY_MAX_ATTEMPTS,
        );

        let result = retry_with_jitter(policy, TriageError::is_transient, || {
            run_fallback_chain(&models, |model, _| {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let model = model.to_string();
                async move {
                    if n < 2 {
                        Err(TriageError::ClassifierRateLimit { provider: model })
                    } else {
                        Ok(vec![dummy_verdict()])
                    }
                }
            })
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    /// A non-transient error (no retryable taxonomy, §7) is not retried by
    /// the outer layer — it surfaces on the first attempt.
    #[tokio::test]
    async fn outer_retry_does_not_retry_non_transient_errors() {
        let models = vec!["only".to_string()];
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let policy = RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            RETRY_MAX_ATTEMPTS,
        );

        let result: Result<Vec<Verdict>, TriageError> =
            retry_with_jitter(policy, TriageError::is_transient, || {
                run_fallback_chain(&models, |_, _| {
                    attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    async move { Err(TriageError::ClassifierOther("boom".into())) }
                })
            })
            .await;

        assert!(matches!(result, Err(TriageError::ClassifierOther(_))));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_structured_error_propagates_without_fallback() {
        let models = vec!["m1".to_string(), "m2".to_string()];
        let calls = std::sync::Mutex::new(0u32);
        let result: Result<Vec<Verdict>, TriageError> = run_fallback_chain(&models, |_, _| {
            *calls.lock().unwrap() += 1;
            async move { Err(TriageError::ClassifierOther("boom".into())) }
        })
        .await;
        assert!(matches!(result, Err(TriageError::ClassifierOther(_))));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn chunking_preserves_order_across_chunk_boundaries() {
        let verdicts: Vec<Verdict> = (0..7)
            .map(|i| Verdict {
                priority: i,
                flag: vec![],
                priority_explanation: i.to_string(),
                flag_explanation: i.to_string(),
                incident_label: i.to_string(),
            })
            .collect();
        let fake = FakeClassifier::new(verdicts);
        let reqs: Vec<RawRequest> = (0..7).map(|_| sample_request()).collect();
        let out = fake.classify_batch_in_chunks(&reqs).await.unwrap();
        assert_eq!(out.len(), 7);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(v.priority, i as u8);
        }
    }
}
