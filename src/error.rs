//! Outcome taxonomy for upstream attempts and dispatch failures.
//!
//! Every attempt against an upstream resolves to exactly one [`ErrorKind`]
//! (with `success` represented separately by the caller). The kind drives
//! retry behavior, circuit-breaker accounting, cooldown decisions, and the
//! HTTP status surfaced to the downstream client.

use axum::http::StatusCode;
use serde::Serialize;

/// Classification of a failed attempt or terminal dispatch outcome.
///
/// Wire kinds come from the upstream response or transport; internal kinds
/// are produced by the queue and the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP 429 from the upstream.
    RateLimited,
    /// HTTP 5xx from the upstream.
    ServerError,
    /// HTTP 401 — credential is bad, switch to another one.
    AuthError,
    /// HTTP 403 — surfaced to the caller, not retried.
    PermissionError,
    /// Other 4xx (except 408/425/429) — surfaced to the caller.
    ClientError,
    /// Wire-level timeout.
    Timeout,
    /// Upstream closed the connection before a response.
    SocketHangup,
    ConnectionRefused,
    BrokenPipe,
    ConnectionAborted,
    /// Streaming body ended before the terminating event.
    StreamPrematureClose,
    /// Response could not be parsed as HTTP.
    HttpParseError,
    /// Downstream client disconnected; not a failure of the credential.
    ClientAborted,
    QueueTimeout,
    QueueFull,
    QueueCancelled,
    QueueShutdown,
    RetriesExhausted,
    ExhaustedModels,
}

impl ErrorKind {
    /// Stable snake_case name used in logs, stats, and error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::AuthError => "auth_error",
            Self::PermissionError => "permission_error",
            Self::ClientError => "client_error",
            Self::Timeout => "timeout",
            Self::SocketHangup => "socket_hangup",
            Self::ConnectionRefused => "connection_refused",
            Self::BrokenPipe => "broken_pipe",
            Self::ConnectionAborted => "connection_aborted",
            Self::StreamPrematureClose => "stream_premature_close",
            Self::HttpParseError => "http_parse_error",
            Self::ClientAborted => "client_aborted",
            Self::QueueTimeout => "queue_timeout",
            Self::QueueFull => "queue_full",
            Self::QueueCancelled => "queue_cancelled",
            Self::QueueShutdown => "queue_shutdown",
            Self::RetriesExhausted => "retries_exhausted",
            Self::ExhaustedModels => "exhausted_models",
        }
    }

    /// Whether another attempt (possibly on a different credential or model)
    /// can recover from this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::ServerError
                | Self::Timeout
                | Self::SocketHangup
                | Self::ConnectionRefused
                | Self::BrokenPipe
                | Self::ConnectionAborted
                | Self::StreamPrematureClose
                | Self::HttpParseError
        )
    }

    /// Whether the failure counts toward the credential's circuit breaker.
    ///
    /// Rate limits are tracked by the pool cooldown engine instead, and a
    /// downstream disconnect says nothing about the credential.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            Self::ServerError
                | Self::AuthError
                | Self::Timeout
                | Self::SocketHangup
                | Self::ConnectionRefused
                | Self::BrokenPipe
                | Self::ConnectionAborted
                | Self::StreamPrematureClose
                | Self::HttpParseError
        )
    }

    /// Whether dispatch must stop and surface this kind to the caller.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PermissionError
                | Self::ClientError
                | Self::ClientAborted
                | Self::QueueTimeout
                | Self::QueueFull
                | Self::QueueCancelled
                | Self::QueueShutdown
                | Self::RetriesExhausted
                | Self::ExhaustedModels
        )
    }

    /// HTTP status reported downstream when this kind terminates a job.
    pub fn downstream_status(&self) -> StatusCode {
        match self {
            Self::AuthError => StatusCode::UNAUTHORIZED,
            Self::PermissionError => StatusCode::FORBIDDEN,
            Self::ClientError => StatusCode::BAD_REQUEST,
            Self::QueueTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::ServerError => StatusCode::BAD_GATEWAY,
            Self::Timeout
            | Self::SocketHangup
            | Self::ConnectionRefused
            | Self::BrokenPipe
            | Self::ConnectionAborted
            | Self::StreamPrematureClose
            | Self::HttpParseError => StatusCode::BAD_GATEWAY,
            // Sustained rate limiting is reported as unavailability so SDK
            // clients back off instead of hammering the proxy.
            Self::RateLimited
            | Self::QueueFull
            | Self::QueueCancelled
            | Self::QueueShutdown
            | Self::RetriesExhausted
            | Self::ExhaustedModels => StatusCode::SERVICE_UNAVAILABLE,
            Self::ClientAborted => StatusCode::BAD_REQUEST,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an upstream HTTP status into an [`ErrorKind`].
///
/// 2xx is a success and never reaches this function. 408 and 425 are treated
/// as retryable wire conditions rather than client errors.
pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimited,
        401 => ErrorKind::AuthError,
        403 => ErrorKind::PermissionError,
        408 => ErrorKind::Timeout,
        425 => ErrorKind::ServerError,
        400..=499 => ErrorKind::ClientError,
        _ => ErrorKind::ServerError,
    }
}

/// Canonical error body matching the Anthropic error shape.
pub fn error_body(kind: ErrorKind, message: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "type": kind.as_str(),
            "message": message,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::SocketHangup.is_retryable());
        assert!(!ErrorKind::AuthError.is_retryable());
        assert!(!ErrorKind::PermissionError.is_retryable());
        assert!(!ErrorKind::ClientError.is_retryable());
        assert!(!ErrorKind::ClientAborted.is_retryable());
    }

    #[test]
    fn rate_limits_do_not_trip_the_breaker() {
        assert!(!ErrorKind::RateLimited.counts_as_breaker_failure());
        assert!(!ErrorKind::ClientAborted.counts_as_breaker_failure());
        assert!(ErrorKind::ServerError.counts_as_breaker_failure());
        assert!(ErrorKind::Timeout.counts_as_breaker_failure());
        assert!(ErrorKind::AuthError.counts_as_breaker_failure());
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_http_status(429), ErrorKind::RateLimited);
        assert_eq!(classify_http_status(401), ErrorKind::AuthError);
        assert_eq!(classify_http_status(403), ErrorKind::PermissionError);
        assert_eq!(classify_http_status(404), ErrorKind::ClientError);
        assert_eq!(classify_http_status(408), ErrorKind::Timeout);
        assert_eq!(classify_http_status(500), ErrorKind::ServerError);
        assert_eq!(classify_http_status(529), ErrorKind::ServerError);
    }

    #[test]
    fn downstream_status_mapping() {
        assert_eq!(
            ErrorKind::QueueTimeout.downstream_status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ErrorKind::QueueFull.downstream_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorKind::RetriesExhausted.downstream_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorKind::AuthError.downstream_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ErrorKind::PermissionError.downstream_status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn error_body_shape() {
        let body = error_body(ErrorKind::RetriesExhausted, "all attempts failed");
        assert_eq!(body["error"]["type"], "retries_exhausted");
        assert_eq!(body["error"]["message"], "all attempts failed");
    }
}
