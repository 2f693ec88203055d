//! `GET /stats` — one aggregated observability snapshot across the queue,
//! credential pool, router, and pool cooldown engine.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use super::AppState;

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let queue = state.queue.stats().await;
    let provider_health = state.key_manager.provider_health_stats().await;
    let credentials = state.key_manager.snapshots().await;
    let routing = state.router.stats().await;
    let pool_cooldowns = state.pool_cooldown.snapshot().await;

    Json(serde_json::json!({
        "uptimeMs": state.started_at.elapsed().as_millis() as u64,
        "totalInFlight": state.key_manager.total_in_flight().await,
        "queue": queue,
        "providerHealth": provider_health,
        "credentials": credentials,
        "modelRouting": routing,
        "poolCooldowns": pool_cooldowns,
    }))
}
