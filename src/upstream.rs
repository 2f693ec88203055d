//! Single-attempt upstream wire module.
//!
//! Issues exactly one HTTP call against a provider: builds the auth header,
//! rewrites the JSON `model` field, streams the request, and classifies the
//! result. Streaming (SSE) bodies are never buffered — chunks are re-framed
//! at line boundaries and pumped through, preserving `data: [DONE]`.
//! Rate-limit headers are extracted on every response regardless of status
//! so the pool cooldown engine can pace proactively.

use std::error::Error as _;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::{classify_http_status, ErrorKind};
use crate::key_manager::AcquiredKey;
use crate::pool_cooldown::RateLimitHeaders;
use crate::providers::ProviderRegistry;

/// Cap on any retry-after value taken from headers.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(600);

/// A single attempt's request, already sanitized by the API layer.
#[derive(Debug)]
pub struct UpstreamRequest<'a> {
    /// Path under the provider's base path (e.g. `/v1/messages`).
    pub path: &'a str,
    /// Downstream headers worth forwarding (anthropic-version etc.).
    pub forward_headers: &'a [(String, String)],
    /// Original request body.
    pub body: &'a Bytes,
    /// Upstream model written into the body's `model` field.
    pub target_model: &'a str,
    pub is_stream: bool,
}

/// Rate-limit state observed on a response, plus any explicit retry-after.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitInfo {
    pub headers: RateLimitHeaders,
    pub retry_after: Option<Duration>,
}

pub enum UpstreamBody {
    Buffered(Bytes),
    Stream(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamSuccess {
    pub status: u16,
    pub content_type: Option<String>,
    /// Time to the response head in milliseconds.
    pub latency_ms: u64,
    pub rate_limits: RateLimitInfo,
    pub body: UpstreamBody,
}

#[derive(Debug)]
pub struct UpstreamFailure {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
    pub rate_limits: RateLimitInfo,
    pub latency_ms: u64,
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Success(UpstreamSuccess),
    Failure(UpstreamFailure),
}

/// Seam between the retry controller and the wire. Production uses
/// [`HttpUpstreamClient`]; tests script outcomes.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: UpstreamRequest<'_>, key: &AcquiredKey) -> AttemptOutcome;
}

/// Production upstream over a shared keep-alive `reqwest` client.
pub struct HttpUpstreamClient {
    client: reqwest::Client,
    registry: std::sync::Arc<ProviderRegistry>,
    upstream_timeout: Duration,
    max_body_bytes: usize,
}

impl HttpUpstreamClient {
    pub fn new(
        registry: std::sync::Arc<ProviderRegistry>,
        upstream_timeout: Duration,
        free_socket_timeout: Duration,
        keep_alive_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(free_socket_timeout)
            .tcp_keepalive(keep_alive_timeout)
            .build()?;
        Ok(Self {
            client,
            registry,
            upstream_timeout,
            max_body_bytes: 32 * 1024 * 1024,
        })
    }

    fn failure(
        &self,
        kind: ErrorKind,
        status: Option<u16>,
        message: String,
        rate_limits: RateLimitInfo,
        started: Instant,
    ) -> AttemptOutcome {
        AttemptOutcome::Failure(UpstreamFailure {
            kind,
            status,
            message,
            rate_limits,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstreamClient {
    async fn send(&self, request: UpstreamRequest<'_>, key: &AcquiredKey) -> AttemptOutcome {
        let started = Instant::now();
        let no_limits = RateLimitInfo::default();

        let Some(provider) = self.registry.get(&key.provider_name) else {
            return self.failure(
                ErrorKind::ConnectionRefused,
                None,
                format!("provider '{}' not configured", key.provider_name),
                no_limits,
                started,
            );
        };
        let url = format!("{}{}", provider.base_url(), request.path);

        let upstream_body = match rewrite_model(request.body, request.target_model) {
            Ok(b) => b,
            Err(e) => {
                return self.failure(
                    ErrorKind::ClientError,
                    None,
                    format!("failed to rewrite model in request body: {}", e),
                    no_limits,
                    started,
                );
            }
        };

        let mut upstream_req = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .body(upstream_body);
        if let Some((name, value)) = self
            .registry
            .format_auth_header(&key.provider_name, &key.secret)
        {
            upstream_req = upstream_req.header(name, value);
        }
        for (name, value) in &provider.extra_headers {
            upstream_req = upstream_req.header(name.as_str(), value.as_str());
        }
        for (name, value) in request.forward_headers {
            upstream_req = upstream_req.header(name.as_str(), value.as_str());
        }
        // Streaming responses must not get a whole-body timeout — it would
        // kill long generations. The head is bounded separately below.
        if !request.is_stream {
            upstream_req = upstream_req.timeout(self.upstream_timeout);
        }

        tracing::debug!(
            provider = %key.provider_name,
            credential = %key.credential_id,
            model = %request.target_model,
            url = %url,
            stream = request.is_stream,
            "Sending upstream request"
        );

        let send = upstream_req.send();
        let response = if request.is_stream {
            match tokio::time::timeout(self.upstream_timeout, send).await {
                Ok(result) => result,
                Err(_) => {
                    return self.failure(
                        ErrorKind::Timeout,
                        None,
                        "timed out waiting for streaming response head".to_string(),
                        no_limits,
                        started,
                    );
                }
            }
        } else {
            send.await
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let kind = classify_transport_error(&e);
                return self.failure(kind, None, e.to_string(), no_limits, started);
            }
        };

        let status = response.status().as_u16();
        let rate_limits = extract_rate_limit_info(response.headers());
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let latency_ms = started.elapsed().as_millis() as u64;

        if (200..300).contains(&status) {
            let is_event_stream = content_type
                .as_deref()
                .map(|ct| ct.starts_with("text/event-stream"))
                .unwrap_or(false);
            if request.is_stream && is_event_stream {
                return AttemptOutcome::Success(UpstreamSuccess {
                    status,
                    content_type,
                    latency_ms,
                    rate_limits,
                    body: UpstreamBody::Stream(sse_line_stream(response.bytes_stream()).boxed()),
                });
            }
            return match read_body_capped(response, self.max_body_bytes).await {
                Ok(bytes) => AttemptOutcome::Success(UpstreamSuccess {
                    status,
                    content_type,
                    latency_ms,
                    rate_limits,
                    body: UpstreamBody::Buffered(bytes),
                }),
                Err(failure_kind) => self.failure(
                    failure_kind,
                    Some(status),
                    "failed to read upstream response body".to_string(),
                    rate_limits,
                    started,
                ),
            };
        }

        // Error status: buffer the (small) body for the message.
        let body = read_body_capped(response, 64 * 1024).await.unwrap_or_default();
        let kind = classify_http_status(status);
        let message = extract_error_message(&body)
            .unwrap_or_else(|| format!("upstream returned HTTP {}", status));
        self.failure(kind, Some(status), message, rate_limits, started)
    }
}

/// Rewrite the `model` field in the JSON request body.
pub fn rewrite_model(body: &[u8], new_model: &str) -> Result<Bytes, String> {
    let mut value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON: {}", e))?;
    value["model"] = serde_json::Value::String(new_model.to_string());
    serde_json::to_vec(&value)
        .map(Bytes::from)
        .map_err(|e| format!("failed to serialize: {}", e))
}

/// Pull the `error.message` out of an Anthropic-shaped error body.
fn extract_error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
}

/// Read a response body, bailing out once it exceeds `cap` bytes.
async fn read_body_capped(
    response: reqwest::Response,
    cap: usize,
) -> Result<Bytes, ErrorKind> {
    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| classify_transport_error(&e))?;
        if buf.len() + chunk.len() > cap {
            return Err(ErrorKind::HttpParseError);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

/// Classify a transport-level `reqwest` error into the wire taxonomy.
pub fn classify_transport_error(error: &reqwest::Error) -> ErrorKind {
    if error.is_timeout() {
        return ErrorKind::Timeout;
    }
    if error.is_connect() {
        return ErrorKind::ConnectionRefused;
    }
    // Walk the source chain looking for the underlying I/O condition.
    let mut source: Option<&(dyn std::error::Error + 'static)> = error.source();
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
                std::io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
                std::io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::UnexpectedEof => {
                    ErrorKind::SocketHangup
                }
                _ => ErrorKind::SocketHangup,
            };
        }
        source = err.source();
    }
    if error.is_body() || error.is_decode() {
        return ErrorKind::HttpParseError;
    }
    ErrorKind::SocketHangup
}

/// Extract rate-limit headers and retry-after from a response.
pub fn extract_rate_limit_info(headers: &reqwest::header::HeaderMap) -> RateLimitInfo {
    let get_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
    };
    RateLimitInfo {
        headers: RateLimitHeaders {
            remaining: get_u64("x-ratelimit-remaining"),
            limit: get_u64("x-ratelimit-limit"),
            reset: get_u64("x-ratelimit-reset"),
        },
        retry_after: parse_retry_after(headers),
    }
}

/// Parse `retry-after`: integer seconds, or an HTTP-date / RFC 3339
/// timestamp. Values are capped so a bogus header cannot park a credential
/// for hours.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        if secs == 0 {
            return None;
        }
        return Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER));
    }
    let target = chrono::DateTime::parse_from_rfc2822(raw)
        .ok()
        .or_else(|| chrono::DateTime::parse_from_rfc3339(raw).ok())?;
    let delta = target.signed_duration_since(chrono::Utc::now());
    let delta = delta.to_std().ok()?;
    if delta.is_zero() {
        None
    } else {
        Some(delta.min(MAX_RETRY_AFTER))
    }
}

/// Re-frame a raw byte stream at line boundaries so every SSE event flushes
/// to the downstream client as soon as it completes. Content passes through
/// unmodified, including the terminating `data: [DONE]`.
pub fn sse_line_stream(
    inner: impl futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    futures::stream::unfold(
        (Box::pin(inner), Vec::<u8>::new(), false),
        |(mut stream, mut buf, mut done)| async move {
            loop {
                if done {
                    return None;
                }
                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    return Some((Ok(Bytes::from(line)), (stream, buf, done)));
                }
                match stream.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        done = true;
                        return Some((
                            Err(std::io::Error::other(e.to_string())),
                            (stream, buf, done),
                        ));
                    }
                    None => {
                        done = true;
                        if buf.is_empty() {
                            return None;
                        }
                        let rest = std::mem::take(&mut buf);
                        return Some((Ok(Bytes::from(rest)), (stream, buf, done)));
                    }
                }
            }
        },
    )
}
