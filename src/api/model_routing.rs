//! Model routing admin endpoints: view and edit the routing policy, inspect
//! cooldowns, and dry-run routing decisions.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use crate::routing::config::RoutingConfigError;
use crate::routing::{RequestFeatures, MODEL_SWITCH_POLICY};

use super::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_routing).put(put_routing))
        .route("/reset", post(reset_routing))
        .route("/simulate", post(simulate))
        .route("/cooldowns", get(cooldowns))
        .route("/test", get(test_route))
        .route("/explain", post(explain))
        .route("/overrides", put(put_override).delete(delete_override))
        .route("/export", get(export))
}

fn config_error(e: RoutingConfigError) -> (StatusCode, String) {
    match e {
        RoutingConfigError::Io(_, _) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        _ => (StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// GET /model-routing - current policy, stats, and the shipped answer to
/// the hot-model boundary question.
async fn get_routing(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let config = state.router.config().await;
    let stats = state.router.stats().await;
    Json(serde_json::json!({
        "enabled": state.router.enabled().await,
        "modelSwitchPolicy": MODEL_SWITCH_POLICY,
        "config": config,
        "stats": stats,
    }))
}

/// PUT /model-routing - deep-merge a partial (or full) policy edit.
/// Unknown keys are rejected; validation warnings are returned alongside
/// the applied config.
async fn put_routing(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if !patch.is_object() {
        return Err((
            StatusCode::BAD_REQUEST,
            "expected a JSON object".to_string(),
        ));
    }
    let (config, warnings) = state
        .router
        .apply_update(patch)
        .await
        .map_err(config_error)?;
    Ok(Json(serde_json::json!({
        "config": config,
        "warnings": warnings,
    })))
}

/// POST /model-routing/reset - clear cooldowns and decision stats.
async fn reset_routing(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.router.reset().await;
    Json(serde_json::json!({ "reset": true }))
}

#[derive(Debug, Deserialize)]
struct SimulateRequest {
    model: String,
    #[serde(default)]
    features: RequestFeatures,
}

/// POST /model-routing/simulate - dry-run a decision without touching
/// stats or cooldowns.
async fn simulate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SimulateRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let decision = state
        .router
        .simulate(&req.model, &req.features)
        .await
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("no routable model for '{}'", req.model),
            )
        })?;
    Ok(Json(serde_json::json!({ "decision": decision })))
}

/// GET /model-routing/cooldowns - active per-model cooldowns.
async fn cooldowns(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "cooldowns": state.router.cooldowns().await }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestQuery {
    model: String,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    message_count: Option<u64>,
    #[serde(default)]
    system_length: Option<u64>,
    #[serde(default)]
    has_tools: Option<bool>,
    #[serde(default)]
    has_vision: Option<bool>,
}

/// GET /model-routing/test?model=...&maxTokens=... - quick decision check
/// from query parameters.
async fn test_route(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TestQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let features = RequestFeatures {
        max_tokens: query.max_tokens,
        message_count: query.message_count.unwrap_or(1),
        system_length: query.system_length.unwrap_or(0),
        has_tools: query.has_tools.unwrap_or(false),
        has_vision: query.has_vision.unwrap_or(false),
        is_stream: false,
    };
    let decision = state
        .router
        .simulate(&query.model, &features)
        .await
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("no routable model for '{}'", query.model),
            )
        })?;
    Ok(Json(serde_json::json!({ "decision": decision })))
}

/// POST /model-routing/explain - full decision trace: matched rule, shadow
/// classifier verdict, and cooldown skips, straight off the decision.
async fn explain(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SimulateRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let decision = state
        .router
        .simulate(&req.model, &req.features)
        .await
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("no routable model for '{}'", req.model),
            )
        })?;
    Ok(Json(serde_json::json!({
        "incomingModel": req.model,
        "features": req.features,
        "decision": decision,
        "modelSwitchPolicy": MODEL_SWITCH_POLICY,
    })))
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    model: String,
    target: String,
}

/// PUT /model-routing/overrides - install `{model, target}`; `model` may
/// be `*` to catch everything.
async fn put_override(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OverrideRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if req.model.trim().is_empty() || req.target.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "model and target are required".to_string(),
        ));
    }
    state
        .router
        .set_override(&req.model, &req.target)
        .await
        .map_err(config_error)?;
    Ok(Json(serde_json::json!({ "model": req.model, "target": req.target })))
}

#[derive(Debug, Deserialize)]
struct DeleteOverrideQuery {
    model: String,
}

/// DELETE /model-routing/overrides?model=...
async fn delete_override(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeleteOverrideQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let removed = state
        .router
        .remove_override(&query.model)
        .await
        .map_err(config_error)?;
    if !removed {
        return Err((
            StatusCode::NOT_FOUND,
            format!("no override for '{}'", query.model),
        ));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// GET /model-routing/export - the full policy document, suitable for
/// re-import via PUT.
async fn export(State(state): State<Arc<AppState>>) -> Json<crate::routing::config::RoutingConfig> {
    Json(state.router.config().await)
}
