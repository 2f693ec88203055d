//! The dispatch orchestrator: route a job to a model, acquire a credential
//! (queueing when none is free), send the attempt, classify the result, and
//! loop until success or the attempt/model-switch budgets run out.
//!
//! Slot lifetime is guarded: every reserved credential slot is released
//! exactly once, including when the downstream client disconnects and the
//! dispatch future is dropped mid-flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::Rng;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ErrorKind;
use crate::key_manager::KeyManager;
use crate::pool_cooldown::PoolCooldownEngine;
use crate::providers::ProviderRegistry;
use crate::request_queue::{QueueOutcome, RequestQueue};
use crate::routing::{ModelRouter, RequestFeatures, RouteDecision};
use crate::upstream::{
    AttemptOutcome, RateLimitInfo, Upstream, UpstreamBody, UpstreamRequest,
};

/// Downstream headers forwarded to the upstream verbatim.
const FORWARDED_HEADERS: &[&str] = &["anthropic-version", "anthropic-beta"];

/// A downstream request being dispatched.
#[derive(Debug)]
pub struct Job {
    pub job_id: Uuid,
    pub path: String,
    pub forward_headers: Vec<(String, String)>,
    pub body: Bytes,
    pub incoming_model: String,
    pub features: RequestFeatures,
    pub attempted_credentials: HashSet<String>,
    pub attempted_models: HashSet<String>,
    /// Models in first-attempt order, for traces.
    pub attempted_model_order: Vec<String>,
    pub attempt_count: u32,
    pub model_switch_count: u32,
    pub started_at: Instant,
}

impl Job {
    /// Parse a downstream request body (Anthropic Messages shape), extract
    /// the model and routing features once, and capture the headers worth
    /// forwarding.
    pub fn from_request(
        path: &str,
        headers: &axum::http::HeaderMap,
        body: Bytes,
    ) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| format!("invalid JSON body: {}", e))?;
        let incoming_model = value
            .get("model")
            .and_then(|m| m.as_str())
            .ok_or_else(|| "missing 'model' field".to_string())?
            .to_string();
        let features = extract_features(&value);

        let mut forward_headers = Vec::new();
        for name in FORWARDED_HEADERS {
            if let Some(v) = headers.get(*name).and_then(|v| v.to_str().ok()) {
                forward_headers.push((name.to_string(), v.to_string()));
            }
        }

        Ok(Self {
            job_id: Uuid::new_v4(),
            path: path.to_string(),
            forward_headers,
            body,
            incoming_model,
            features,
            attempted_credentials: HashSet::new(),
            attempted_models: HashSet::new(),
            attempted_model_order: Vec::new(),
            attempt_count: 0,
            model_switch_count: 0,
            started_at: Instant::now(),
        })
    }

    fn note_model(&mut self, model: &str) {
        if self.attempted_models.insert(model.to_string()) {
            self.attempted_model_order.push(model.to_string());
        }
    }
}

/// Pull routing features from an Anthropic Messages body.
fn extract_features(value: &serde_json::Value) -> RequestFeatures {
    let messages = value.get("messages").and_then(|m| m.as_array());
    let message_count = messages.map(|m| m.len() as u64).unwrap_or(0);
    let has_vision = messages
        .map(|msgs| {
            msgs.iter().any(|msg| {
                msg.get("content")
                    .and_then(|c| c.as_array())
                    .map(|blocks| {
                        blocks.iter().any(|b| {
                            b.get("type").and_then(|t| t.as_str()) == Some("image")
                        })
                    })
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);
    let system_length = match value.get("system") {
        Some(serde_json::Value::String(s)) => s.len() as u64,
        Some(serde_json::Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .map(|t| t.len() as u64)
            .sum(),
        _ => 0,
    };
    RequestFeatures {
        max_tokens: value.get("max_tokens").and_then(|t| t.as_u64()),
        message_count,
        system_length,
        has_tools: value
            .get("tools")
            .and_then(|t| t.as_array())
            .map(|t| !t.is_empty())
            .unwrap_or(false),
        has_vision,
        is_stream: value.get("stream").and_then(|s| s.as_bool()).unwrap_or(false),
    }
}

/// Terminal dispatch failure, surfaced to the downstream client.
#[derive(Debug)]
pub struct DispatchFailure {
    pub kind: ErrorKind,
    /// Upstream status to pass through, when there is one.
    pub status: Option<u16>,
    pub message: String,
}

impl DispatchFailure {
    fn internal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }
}

/// The dispatched response handed back to the API layer.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: UpstreamBody,
}

/// Releases a reserved credential slot exactly once. Explicit completion
/// records the real outcome; dropping an armed guard (downstream
/// disconnect) records a client abort, which counts as nothing.
struct SlotGuard {
    key_manager: Arc<KeyManager>,
    queue: Arc<RequestQueue>,
    credential_id: String,
    armed: bool,
}

impl SlotGuard {
    fn new(key_manager: Arc<KeyManager>, queue: Arc<RequestQueue>, credential_id: String) -> Self {
        Self {
            key_manager,
            queue,
            credential_id,
            armed: true,
        }
    }

    async fn success(mut self, latency_ms: u64) {
        self.armed = false;
        self.key_manager
            .record_success(&self.credential_id, latency_ms)
            .await;
        self.queue.signal_slot_available().await;
    }

    async fn failure(mut self, kind: ErrorKind) {
        self.armed = false;
        self.key_manager.record_failure(&self.credential_id, kind).await;
        self.queue.signal_slot_available().await;
    }

    async fn rate_limited(mut self, retry_after: Duration) {
        self.armed = false;
        self.key_manager
            .record_rate_limit(&self.credential_id, retry_after)
            .await;
        self.queue.signal_slot_available().await;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let key_manager = self.key_manager.clone();
        let queue = self.queue.clone();
        let credential_id = std::mem::take(&mut self.credential_id);
        tokio::spawn(async move {
            key_manager.record_client_abort(&credential_id).await;
            queue.signal_slot_available().await;
        });
    }
}

/// Dispatch tuning, lifted out of [`Config`].
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub queue_timeout: Duration,
    pub request_timeout: Duration,
    /// Pool cooldowns at or below this are slept off before sending.
    pub sleep_threshold: Duration,
    pub retry_jitter: Duration,
}

impl From<&Config> for DispatchSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            queue_timeout: config.queue_timeout(),
            request_timeout: config.request_timeout(),
            sleep_threshold: Duration::from_millis(config.pool_cooldown.sleep_threshold_ms),
            retry_jitter: Duration::from_millis(config.pool_cooldown.retry_jitter_ms),
        }
    }
}

/// The attempt-loop orchestrator. Safe to share across concurrent jobs;
/// all shared mutation goes through the component locks.
pub struct RetryController {
    key_manager: Arc<KeyManager>,
    router: Arc<ModelRouter>,
    pool_cooldown: Arc<PoolCooldownEngine>,
    queue: Arc<RequestQueue>,
    registry: Arc<ProviderRegistry>,
    upstream: Arc<dyn Upstream>,
    settings: DispatchSettings,
}

impl RetryController {
    pub fn new(
        key_manager: Arc<KeyManager>,
        router: Arc<ModelRouter>,
        pool_cooldown: Arc<PoolCooldownEngine>,
        queue: Arc<RequestQueue>,
        registry: Arc<ProviderRegistry>,
        upstream: Arc<dyn Upstream>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            key_manager,
            router,
            pool_cooldown,
            queue,
            registry,
            upstream,
            settings,
        }
    }

    /// Run the attempt loop for one job.
    pub async fn dispatch(&self, job: &mut Job) -> Result<ProxyResponse, DispatchFailure> {
        let deadline = job.started_at + self.settings.request_timeout;
        let max_switches = self
            .router
            .config()
            .await
            .failover
            .max_model_switches_per_request;
        // Once the switch budget is spent the model is pinned and only
        // credentials rotate.
        let mut pinned: Option<RouteDecision> = None;
        // Credential- and wire-level failures keep the current model: the
        // carried decision is re-used instead of re-routing, so only 429s
        // move a job between models.
        let mut carry: Option<RouteDecision> = None;
        let mut last_decision: Option<RouteDecision> = None;

        loop {
            if job.attempt_count > self.settings.max_retries {
                return Err(DispatchFailure::internal(
                    ErrorKind::RetriesExhausted,
                    format!("gave up after {} attempts", job.attempt_count),
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.deadline_failure(job));
            }

            let decision = match pinned.clone().or_else(|| carry.clone()) {
                Some(d) => d,
                None => match self
                    .router
                    .select_model(&job.incoming_model, &job.features, &job.attempted_models)
                    .await
                {
                    Some(d) => d,
                    None => match last_decision.clone() {
                        // Every candidate tried: keep the last model and
                        // rotate credentials until the budgets run out.
                        Some(d) => {
                            pinned = Some(d.clone());
                            d
                        }
                        None => {
                            return Err(DispatchFailure::internal(
                                ErrorKind::ExhaustedModels,
                                format!(
                                    "no routable model for '{}'",
                                    job.incoming_model
                                ),
                            ));
                        }
                    },
                },
            };
            last_decision = Some(decision.clone());

            let resolution = match self
                .registry
                .resolve_provider_for_model(&decision.selected_model)
            {
                Ok(r) => r,
                Err(e) => {
                    return Err(DispatchFailure::internal(
                        ErrorKind::ExhaustedModels,
                        e.to_string(),
                    ));
                }
            };

            // Short pool cooldowns are slept off rather than burned as
            // upstream 429s; long ones are left to the router's model
            // cooldowns and the retry backoff.
            let pool_wait = self
                .pool_cooldown
                .remaining_for(&resolution.provider_name, &decision.selected_model)
                .await;
            if !pool_wait.is_zero() && pool_wait <= self.settings.sleep_threshold {
                let jitter_ms = self.settings.retry_jitter.as_millis() as u64;
                let jitter = if jitter_ms > 0 {
                    Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
                } else {
                    Duration::ZERO
                };
                tokio::time::sleep(bounded(pool_wait + jitter, deadline)).await;
            }

            let key = match self
                .key_manager
                .acquire_key(&job.attempted_credentials, &resolution.provider_name)
                .await
            {
                Some(key) => key,
                None => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let wait = self.settings.queue_timeout.min(remaining);
                    let ticket = self
                        .queue
                        .enqueue(&job.job_id.to_string(), Some(wait))
                        .await;
                    tracing::debug!(
                        job = %job.job_id,
                        outcome = ?ticket.outcome,
                        waited_ms = ticket.waited.as_millis() as u64,
                        "Queue wait finished"
                    );
                    match ticket.outcome {
                        QueueOutcome::Granted => continue,
                        QueueOutcome::Timeout => {
                            return Err(DispatchFailure::internal(
                                ErrorKind::QueueTimeout,
                                "timed out waiting for an available credential",
                            ));
                        }
                        QueueOutcome::RejectedFull => {
                            return Err(DispatchFailure::internal(
                                ErrorKind::QueueFull,
                                "request queue is full",
                            ));
                        }
                        QueueOutcome::Cancelled => {
                            return Err(DispatchFailure::internal(
                                ErrorKind::QueueCancelled,
                                "request was cancelled while queued",
                            ));
                        }
                        QueueOutcome::Shutdown => {
                            return Err(DispatchFailure::internal(
                                ErrorKind::QueueShutdown,
                                "proxy is shutting down",
                            ));
                        }
                    }
                }
            };

            let guard = SlotGuard::new(
                self.key_manager.clone(),
                self.queue.clone(),
                key.credential_id.clone(),
            );
            job.attempted_credentials.insert(key.credential_id.clone());
            job.note_model(&decision.selected_model);
            job.attempt_count += 1;

            let outcome = self
                .upstream
                .send(
                    UpstreamRequest {
                        path: &job.path,
                        forward_headers: &job.forward_headers,
                        body: &job.body,
                        target_model: &resolution.target_model,
                        is_stream: job.features.is_stream,
                    },
                    &key,
                )
                .await;

            match outcome {
                AttemptOutcome::Success(success) => {
                    self.record_headers(&resolution.provider_name, &decision, &success.rate_limits)
                        .await;
                    let body = match success.body {
                        UpstreamBody::Buffered(bytes) => {
                            guard.success(success.latency_ms).await;
                            UpstreamBody::Buffered(bytes)
                        }
                        UpstreamBody::Stream(stream) => {
                            // The slot stays held while the stream runs; the
                            // guard resolves when it finishes (or aborts).
                            UpstreamBody::Stream(
                                guarded_stream(stream, guard, job.started_at).boxed(),
                            )
                        }
                    };
                    tracing::info!(
                        job = %job.job_id,
                        model = %decision.selected_model,
                        credential = %key.credential_id,
                        attempts = job.attempt_count,
                        status = success.status,
                        "Dispatch succeeded"
                    );
                    return Ok(ProxyResponse {
                        status: success.status,
                        content_type: success.content_type,
                        body,
                    });
                }
                AttemptOutcome::Failure(failure) => {
                    self.record_headers(&resolution.provider_name, &decision, &failure.rate_limits)
                        .await;
                    tracing::warn!(
                        job = %job.job_id,
                        model = %decision.selected_model,
                        credential = %key.credential_id,
                        kind = %failure.kind,
                        status = ?failure.status,
                        attempt = job.attempt_count,
                        "Attempt failed"
                    );
                    match failure.kind {
                        ErrorKind::RateLimited => {
                            let retry_after = failure
                                .rate_limits
                                .retry_after
                                .unwrap_or(self.settings.base_delay);
                            guard.rate_limited(retry_after).await;
                            self.pool_cooldown
                                .record_hit(&resolution.provider_name, &decision.selected_model)
                                .await;
                            self.router
                                .record_model_cooldown(&decision.selected_model, false)
                                .await;
                            let can_switch = pinned.is_none()
                                && job.model_switch_count < max_switches
                                && !decision.fallback_remaining.is_empty();
                            if can_switch {
                                job.model_switch_count += 1;
                                carry = None;
                                self.router.record_failover().await;
                                continue;
                            }
                            // Out of switches (or fallbacks): stay on this
                            // model and rotate credentials after a backoff.
                            pinned = Some(decision);
                            self.backoff(job.attempt_count, deadline).await;
                            continue;
                        }
                        ErrorKind::AuthError => {
                            // Breaker trips inside record_failure; rotate to
                            // another credential on the same model.
                            guard.failure(ErrorKind::AuthError).await;
                            carry = Some(decision);
                            continue;
                        }
                        kind if kind.is_retryable() => {
                            // The model was fine; the credential or the wire
                            // was not. Keep the model, rotate credentials.
                            guard.failure(kind).await;
                            carry = Some(decision);
                            self.backoff(job.attempt_count, deadline).await;
                            continue;
                        }
                        kind => {
                            // Non-retryable: surface the upstream verdict.
                            guard.failure(kind).await;
                            return Err(DispatchFailure {
                                kind,
                                status: failure.status,
                                message: failure.message,
                            });
                        }
                    }
                }
            }
        }
    }

    fn deadline_failure(&self, job: &Job) -> DispatchFailure {
        if job.attempt_count == 0 {
            DispatchFailure::internal(
                ErrorKind::QueueTimeout,
                "request timed out before any credential was acquired",
            )
        } else {
            DispatchFailure::internal(
                ErrorKind::RetriesExhausted,
                format!("request timed out after {} attempts", job.attempt_count),
            )
        }
    }

    async fn record_headers(
        &self,
        provider: &str,
        decision: &RouteDecision,
        info: &RateLimitInfo,
    ) {
        if info.headers.remaining.is_none()
            && info.headers.limit.is_none()
            && info.headers.reset.is_none()
        {
            return;
        }
        self.pool_cooldown
            .record_headers(provider, &decision.selected_model, info.headers)
            .await;
    }

    /// Exponential backoff with jitter, bounded by the job deadline.
    async fn backoff(&self, attempt: u32, deadline: Instant) {
        let exponent = attempt.saturating_sub(1).min(16);
        let nominal = self
            .settings
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.settings.max_delay);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.5);
        let delay = nominal.mul_f64(jitter);
        tokio::time::sleep(bounded(delay, deadline)).await;
    }
}

fn bounded(delay: Duration, deadline: Instant) -> Duration {
    delay.min(deadline.saturating_duration_since(Instant::now()))
}

/// Wrap a streaming body so the credential slot resolves when the stream
/// ends: cleanly → success, mid-flight error → failure, dropped by the
/// downstream client → the guard's drop path records a client abort.
fn guarded_stream(
    inner: BoxStream<'static, Result<Bytes, std::io::Error>>,
    guard: SlotGuard,
    started_at: Instant,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        let mut stream = inner;
        let mut guard = Some(guard);
        let mut errored = false;
        while let Some(item) = stream.next().await {
            if item.is_err() {
                errored = true;
            }
            yield item;
            if errored {
                break;
            }
        }
        if let Some(guard) = guard.take() {
            if errored {
                guard.failure(ErrorKind::StreamPrematureClose).await;
            } else {
                guard.success(started_at.elapsed().as_millis() as u64).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, KeyEntry, KeysSpec, PacingConfig, PoolCooldownConfig};
    use crate::providers::UNTAGGED_PROVIDER;
    use crate::routing::config::RoutingConfig;
    use crate::upstream::{UpstreamFailure, UpstreamSuccess};
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::Mutex;

    /// Scripted upstream: pops one outcome per call, records what was sent.
    struct FakeUpstream {
        script: Mutex<VecDeque<Scripted>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    enum Scripted {
        Ok,
        Status {
            status: u16,
            retry_after: Option<u64>,
        },
        Wire(ErrorKind),
    }

    impl FakeUpstream {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        async fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait::async_trait]
    impl Upstream for FakeUpstream {
        async fn send(
            &self,
            request: UpstreamRequest<'_>,
            key: &crate::key_manager::AcquiredKey,
        ) -> AttemptOutcome {
            self.calls
                .lock()
                .await
                .push((request.target_model.to_string(), key.credential_id.clone()));
            match self.script.lock().await.pop_front() {
                None | Some(Scripted::Ok) => AttemptOutcome::Success(UpstreamSuccess {
                    status: 200,
                    content_type: Some("application/json".to_string()),
                    latency_ms: 5,
                    rate_limits: RateLimitInfo::default(),
                    body: UpstreamBody::Buffered(Bytes::from_static(b"{\"id\":\"msg_1\"}")),
                }),
                Some(Scripted::Status {
                    status,
                    retry_after,
                }) => AttemptOutcome::Failure(UpstreamFailure {
                    kind: crate::error::classify_http_status(status),
                    status: Some(status),
                    message: format!("HTTP {}", status),
                    rate_limits: RateLimitInfo {
                        retry_after: retry_after.map(Duration::from_secs),
                        ..RateLimitInfo::default()
                    },
                    latency_ms: 5,
                }),
                Some(Scripted::Wire(kind)) => AttemptOutcome::Failure(UpstreamFailure {
                    kind,
                    status: None,
                    message: "wire error".to_string(),
                    rate_limits: RateLimitInfo::default(),
                    latency_ms: 5,
                }),
            }
        }
    }

    struct Harness {
        controller: RetryController,
        key_manager: Arc<KeyManager>,
        router: Arc<ModelRouter>,
        queue: Arc<RequestQueue>,
        upstream: Arc<FakeUpstream>,
    }

    async fn harness(upstream: Arc<FakeUpstream>, keys: usize, settings: DispatchSettings) -> Harness {
        harness_with(upstream, keys, 5, settings, RoutingConfig::default()).await
    }

    async fn harness_with(
        upstream: Arc<FakeUpstream>,
        keys: usize,
        per_key: u32,
        settings: DispatchSettings,
        routing: RoutingConfig,
    ) -> Harness {
        let key_manager = Arc::new(KeyManager::new(
            per_key,
            200,
            CircuitBreakerConfig::default(),
        ));
        key_manager
            .load_keys(&KeysSpec::Flat(
                (0..keys).map(|i| KeyEntry::Secret(format!("sk-{}", i))).collect(),
            ))
            .await;
        let router = Arc::new(ModelRouter::new(
            crate::config::ModelRoutingBootConfig {
                persist_config_edits: false,
                ..Default::default()
            },
            routing,
            None,
        ));
        let pool = Arc::new(PoolCooldownEngine::new(
            PoolCooldownConfig::default(),
            PacingConfig::default(),
        ));
        let queue = Arc::new(RequestQueue::new(10, settings.queue_timeout));
        let registry = Arc::new(ProviderRegistry::new(HashMap::new(), HashMap::new()));
        let controller = RetryController::new(
            key_manager.clone(),
            router.clone(),
            pool,
            queue.clone(),
            registry,
            upstream.clone(),
            settings,
        );
        Harness {
            controller,
            key_manager,
            router,
            queue,
            upstream,
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            queue_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_secs(5),
            sleep_threshold: Duration::from_millis(0),
            retry_jitter: Duration::from_millis(0),
        }
    }

    fn job(body: &str) -> Job {
        let headers = axum::http::HeaderMap::new();
        Job::from_request("/v1/messages", &headers, Bytes::from(body.to_string())).unwrap()
    }

    fn plain_job() -> Job {
        job(r#"{"model":"some-model","max_tokens":256,"messages":[{"role":"user","content":"hi"}]}"#)
    }

    fn vision_job() -> Job {
        job(
            r#"{"model":"some-model","max_tokens":256,"messages":[{"role":"user","content":[{"type":"image","source":{}},{"type":"text","text":"hi"}]}]}"#,
        )
    }

    #[test]
    fn feature_extraction_covers_the_anthropic_shape() {
        let j = job(
            r#"{
                "model": "claude-sonnet-4-5",
                "max_tokens": 8192,
                "system": "You are terse.",
                "stream": true,
                "tools": [{"name": "bash"}],
                "messages": [
                    {"role": "user", "content": [{"type": "image", "source": {}}]},
                    {"role": "assistant", "content": "ok"},
                    {"role": "user", "content": "go"}
                ]
            }"#,
        );
        assert_eq!(j.incoming_model, "claude-sonnet-4-5");
        assert_eq!(j.features.max_tokens, Some(8192));
        assert_eq!(j.features.message_count, 3);
        assert_eq!(j.features.system_length, 14);
        assert!(j.features.has_tools);
        assert!(j.features.has_vision);
        assert!(j.features.is_stream);
    }

    #[test]
    fn missing_model_is_rejected() {
        let headers = axum::http::HeaderMap::new();
        assert!(Job::from_request(
            "/v1/messages",
            &headers,
            Bytes::from_static(b"{\"messages\":[]}")
        )
        .is_err());
        assert!(
            Job::from_request("/v1/messages", &headers, Bytes::from_static(b"nope")).is_err()
        );
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let upstream = FakeUpstream::new(vec![Scripted::Ok]);
        let h = harness(upstream, 2, settings()).await;
        let mut job = plain_job();
        let response = h.controller.dispatch(&mut job).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.attempted_model_order, vec!["glm-4.6".to_string()]);
        assert_eq!(h.key_manager.total_in_flight().await, 0);
    }

    #[tokio::test]
    async fn rate_limit_fails_over_to_fallback_model() {
        let upstream = FakeUpstream::new(vec![
            Scripted::Status {
                status: 429,
                retry_after: Some(1),
            },
            Scripted::Ok,
        ]);
        let h = harness(upstream, 3, settings()).await;
        let mut job = vision_job();
        let response = h.controller.dispatch(&mut job).await.unwrap();
        assert_eq!(response.status, 200);
        // Heavy tier: primary then fallback.
        assert_eq!(
            job.attempted_model_order,
            vec!["glm-4.7".to_string(), "glm-4.6".to_string()]
        );
        assert_eq!(job.model_switch_count, 1);
        let stats = h.router.stats().await;
        assert_eq!(stats.failover_total, 1);
        assert!(stats.by_tier_heavy >= 1);
        // Different credentials on the two attempts.
        let calls = h.upstream.calls().await;
        assert_ne!(calls[0].1, calls[1].1);
        // The 429'd model is now cooling.
        assert!(h
            .router
            .cooldowns()
            .await
            .iter()
            .any(|c| c.model == "glm-4.7"));
    }

    #[tokio::test]
    async fn auth_error_rotates_credential_and_opens_breaker() {
        let upstream = FakeUpstream::new(vec![
            Scripted::Status {
                status: 401,
                retry_after: None,
            },
            Scripted::Ok,
        ]);
        let h = harness(upstream, 2, settings()).await;
        let mut job = plain_job();
        let response = h.controller.dispatch(&mut job).await.unwrap();
        assert_eq!(response.status, 200);
        let calls = h.upstream.calls().await;
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].1, calls[1].1);
        let health = h.key_manager.provider_health_stats().await;
        assert_eq!(health[UNTAGGED_PROVIDER].open_circuits, 1);
    }

    #[tokio::test]
    async fn client_error_surfaces_with_upstream_status() {
        let upstream = FakeUpstream::new(vec![Scripted::Status {
            status: 404,
            retry_after: None,
        }]);
        let h = harness(upstream, 2, settings()).await;
        let mut job = plain_job();
        let err = h.controller.dispatch(&mut job).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ClientError);
        assert_eq!(err.status, Some(404));
        assert_eq!(job.attempt_count, 1);
        assert_eq!(h.key_manager.total_in_flight().await, 0);
    }

    #[tokio::test]
    async fn permission_error_is_not_retried() {
        let upstream = FakeUpstream::new(vec![Scripted::Status {
            status: 403,
            retry_after: None,
        }]);
        let h = harness(upstream, 2, settings()).await;
        let err = h.controller.dispatch(&mut plain_job()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionError);
        assert_eq!(h.upstream.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_until_exhausted() {
        let upstream = FakeUpstream::new(vec![
            Scripted::Wire(ErrorKind::SocketHangup),
            Scripted::Status {
                status: 500,
                retry_after: None,
            },
            Scripted::Wire(ErrorKind::Timeout),
            Scripted::Wire(ErrorKind::ConnectionRefused),
        ]);
        let h = harness(upstream, 5, settings()).await;
        let mut job = plain_job();
        let err = h.controller.dispatch(&mut job).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RetriesExhausted);
        // maxRetries = 3 → 4 attempts, all on the same model: wire errors
        // rotate credentials, not models.
        assert_eq!(job.attempt_count, 4);
        assert_eq!(job.attempted_model_order, vec!["glm-4.6".to_string()]);
        assert_eq!(h.key_manager.total_in_flight().await, 0);
    }

    #[tokio::test]
    async fn switch_budget_pins_model_and_rotates_credentials() {
        let upstream = FakeUpstream::new(vec![
            Scripted::Status { status: 429, retry_after: None },
            Scripted::Status { status: 429, retry_after: None },
            Scripted::Status { status: 429, retry_after: None },
            Scripted::Status { status: 429, retry_after: None },
        ]);
        let h = harness(upstream, 6, settings()).await;
        let mut job = vision_job();
        let err = h.controller.dispatch(&mut job).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RetriesExhausted);
        // Heavy tier has 2 models; the budget caps distinct models at
        // maxModelSwitchesPerRequest + 1 even across 4 attempts.
        let config = h.router.config().await;
        assert!(
            job.attempted_models.len() as u32
                <= config.failover.max_model_switches_per_request + 1
        );
        assert_eq!(job.attempted_models.len(), 2);
        // Every attempt used a distinct credential.
        let calls = h.upstream.calls().await;
        let creds: std::collections::HashSet<_> = calls.iter().map(|c| c.1.clone()).collect();
        assert_eq!(creds.len(), calls.len());
    }

    #[tokio::test]
    async fn queue_full_is_reported() {
        let upstream = FakeUpstream::new(vec![]);
        let mut s = settings();
        s.queue_timeout = Duration::from_millis(50);
        let h = harness_with(upstream, 1, 1, s, RoutingConfig::default()).await;
        // Occupy the only slot out-of-band.
        let held = h
            .key_manager
            .acquire_key(&HashSet::new(), UNTAGGED_PROVIDER)
            .await
            .unwrap();
        // Fill the queue to capacity with parked waiters.
        let mut parked = Vec::new();
        for i in 0..10 {
            let queue = h.queue.clone();
            parked.push(tokio::spawn(async move {
                queue
                    .enqueue(&format!("filler-{}", i), Some(Duration::from_secs(5)))
                    .await
            }));
        }
        while h.queue.len().await < 10 {
            tokio::task::yield_now().await;
        }
        let err = h.controller.dispatch(&mut plain_job()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QueueFull);
        assert!(h.upstream.calls().await.is_empty());
        h.queue.clear(QueueOutcome::Shutdown).await;
        for p in parked {
            let _ = p.await;
        }
        h.key_manager.record_client_abort(&held.credential_id).await;
    }

    #[tokio::test]
    async fn queue_timeout_makes_zero_upstream_calls() {
        let upstream = FakeUpstream::new(vec![]);
        let mut s = settings();
        s.queue_timeout = Duration::from_millis(40);
        s.request_timeout = Duration::from_millis(120);
        let h = harness_with(upstream, 1, 1, s, RoutingConfig::default()).await;
        let held = h
            .key_manager
            .acquire_key(&HashSet::new(), UNTAGGED_PROVIDER)
            .await
            .unwrap();
        let mut job = plain_job();
        let err = h.controller.dispatch(&mut job).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QueueTimeout);
        assert_eq!(job.attempt_count, 0);
        assert!(h.upstream.calls().await.is_empty());
        h.key_manager.record_client_abort(&held.credential_id).await;
    }

    #[tokio::test]
    async fn queued_job_proceeds_when_slot_frees() {
        let upstream = FakeUpstream::new(vec![]);
        let h = harness_with(upstream, 1, 1, settings(), RoutingConfig::default()).await;
        let h = Arc::new(h);
        let held = h
            .key_manager
            .acquire_key(&HashSet::new(), UNTAGGED_PROVIDER)
            .await
            .unwrap();

        let dispatcher = {
            let h = h.clone();
            tokio::spawn(async move {
                let mut job = plain_job();
                h.controller.dispatch(&mut job).await.map(|r| r.status)
            })
        };
        while h.queue.is_empty().await {
            tokio::task::yield_now().await;
        }
        // Free the slot the way a finishing job would.
        h.key_manager.record_success(&held.credential_id, 3).await;
        h.queue.signal_slot_available().await;

        let status = dispatcher.await.unwrap().unwrap();
        assert_eq!(status, 200);
        assert_eq!(h.upstream.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn dropped_slot_guard_records_client_abort() {
        let upstream = FakeUpstream::new(vec![]);
        let h = harness(upstream, 1, settings()).await;
        let key = h
            .key_manager
            .acquire_key(&HashSet::new(), UNTAGGED_PROVIDER)
            .await
            .unwrap();
        let guard = SlotGuard::new(
            h.key_manager.clone(),
            h.queue.clone(),
            key.credential_id.clone(),
        );
        drop(guard);
        // The drop path releases via a spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.key_manager.total_in_flight().await, 0);
        let snapshots = h.key_manager.snapshots().await;
        assert_eq!(snapshots[0].consecutive_failures, 0);
        assert_eq!(snapshots[0].total_requests, 0);
    }

    #[tokio::test]
    async fn concurrent_jobs_spread_across_credentials() {
        // Three credentials at one slot each, five concurrent jobs: three
        // dispatch immediately, two queue behind them.
        let upstream = FakeUpstream::new(vec![]);
        let h = Arc::new(harness_with(upstream, 3, 1, settings(), RoutingConfig::default()).await);
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let h = h.clone();
            tasks.push(tokio::spawn(async move {
                let mut job = plain_job();
                h.controller.dispatch(&mut job).await.map(|r| r.status)
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 200);
        }
        let calls = h.upstream.calls().await;
        assert_eq!(calls.len(), 5);
        // The first wave held all three credentials concurrently, so every
        // credential appears across the five calls.
        let distinct: std::collections::HashSet<_> = calls.iter().map(|c| c.1.clone()).collect();
        assert_eq!(distinct.len(), 3);
        let stats = h.queue.stats().await;
        assert!(stats.peak_size <= 2);
        assert_eq!(h.key_manager.total_in_flight().await, 0);
    }
}
