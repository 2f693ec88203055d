//! `GET /metrics` — Prometheus text exposition.
//!
//! The router's own counters are the source of truth; scrape time syncs
//! them into registered collectors so counter semantics hold across
//! scrapes (a router reset clamps deltas to zero rather than going
//! backwards).

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::sync::Mutex;

use super::AppState;

pub struct ProxyMetrics {
    registry: Registry,
    routing_enabled: IntGauge,
    decisions_total: IntCounter,
    failovers_total: IntCounter,
    cooldowns_active: IntGauge,
    overrides_active: IntGauge,
    /// Router totals already folded into the counters.
    exported: Mutex<(u64, u64)>,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let routing_enabled = IntGauge::new(
            "glm_proxy_model_routing_enabled",
            "Whether model routing is enabled",
        )?;
        let decisions_total = IntCounter::new(
            "glm_proxy_model_routing_decisions_total",
            "Routing decisions made",
        )?;
        let failovers_total = IntCounter::new(
            "glm_proxy_model_routing_failovers_total",
            "Model failovers during dispatch",
        )?;
        let cooldowns_active = IntGauge::new(
            "glm_proxy_model_routing_cooldowns_active",
            "Models currently in cooldown",
        )?;
        let overrides_active = IntGauge::new(
            "glm_proxy_model_routing_overrides_active",
            "Saved model overrides",
        )?;
        registry.register(Box::new(routing_enabled.clone()))?;
        registry.register(Box::new(decisions_total.clone()))?;
        registry.register(Box::new(failovers_total.clone()))?;
        registry.register(Box::new(cooldowns_active.clone()))?;
        registry.register(Box::new(overrides_active.clone()))?;
        Ok(Self {
            registry,
            routing_enabled,
            decisions_total,
            failovers_total,
            cooldowns_active,
            overrides_active,
            exported: Mutex::new((0, 0)),
        })
    }

    pub async fn render(&self, state: &AppState) -> Result<String, prometheus::Error> {
        let stats = state.router.stats().await;
        self.routing_enabled
            .set(state.router.enabled().await as i64);
        self.cooldowns_active
            .set(state.router.cooldowns().await.len() as i64);
        self.overrides_active
            .set(state.router.overrides_active().await as i64);

        let mut exported = self.exported.lock().await;
        self.decisions_total
            .inc_by(stats.decisions_total.saturating_sub(exported.0));
        self.failovers_total
            .inc_by(stats.failover_total.saturating_sub(exported.1));
        *exported = (
            exported.0.max(stats.decisions_total),
            exported.1.max(stats.failover_total),
        );
        drop(exported);

        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render(&state).await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {}", e),
        )
            .into_response(),
    }
}
