//! Downstream proxy endpoint: Anthropic-wire-format requests in, buffered
//! or SSE-streamed responses out. The handler authenticates against the
//! single proxy API key, parses the job once, and hands it to the retry
//! controller.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::error::{error_body, ErrorKind};
use crate::retry::Job;
use crate::upstream::UpstreamBody;

use super::AppState;

/// POST /v1/messages - the primary completion/streaming endpoint.
pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, "/v1/messages".to_string(), headers, body).await
}

/// POST /v1/* - other Anthropic-compatible endpoints pass through with the
/// same credential selection and retry semantics.
pub async fn passthrough(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, format!("/v1/{}", rest), headers, body).await
}

async fn handle(state: Arc<AppState>, path: String, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(response) = verify_proxy_auth(&headers, &state) {
        return response;
    }

    let mut job = match Job::from_request(&path, &headers, body) {
        Ok(job) => job,
        Err(message) => {
            return error_response(StatusCode::BAD_REQUEST, ErrorKind::ClientError, &message);
        }
    };

    tracing::debug!(
        job = %job.job_id,
        model = %job.incoming_model,
        stream = job.features.is_stream,
        path = %job.path,
        "Accepted downstream request"
    );

    match state.retry.dispatch(&mut job).await {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            match response.body {
                UpstreamBody::Buffered(bytes) => {
                    let mut response_headers = HeaderMap::new();
                    if let Some(ct) = response
                        .content_type
                        .as_deref()
                        .and_then(|ct| HeaderValue::from_str(ct).ok())
                    {
                        response_headers.insert(header::CONTENT_TYPE, ct);
                    }
                    (status, response_headers, Body::from(bytes)).into_response()
                }
                UpstreamBody::Stream(stream) => {
                    let mut response_headers = HeaderMap::new();
                    response_headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("text/event-stream"),
                    );
                    response_headers
                        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                    (status, response_headers, Body::from_stream(stream)).into_response()
                }
            }
        }
        Err(failure) => {
            let status = failure
                .status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or_else(|| failure.kind.downstream_status());
            error_response(status, failure.kind, &failure.message)
        }
    }
}

/// Check the downstream `x-api-key` (or `Authorization: Bearer`) against
/// the configured proxy key. Auth is disabled when no key is configured.
fn verify_proxy_auth(headers: &HeaderMap, state: &AppState) -> Result<(), Response> {
    let Some(expected) = &state.config.proxy_api_key else {
        return Ok(());
    };
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(error_response(
            StatusCode::UNAUTHORIZED,
            ErrorKind::AuthError,
            "invalid proxy API key",
        ))
    }
}

fn error_response(status: StatusCode, kind: ErrorKind, message: &str) -> Response {
    (status, axum::Json(error_body(kind, message))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_canonical_body() {
        let response = error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::RetriesExhausted,
            "all attempts failed",
        );
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
