//! HTTP surface: the downstream proxy endpoint plus the admin API
//! (`/stats`, `/metrics`, `/model-routing/*`), wired over a shared
//! [`AppState`].

pub mod metrics;
pub mod model_routing;
pub mod proxy;
pub mod stats;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::key_manager::KeyManager;
use crate::pool_cooldown::PoolCooldownEngine;
use crate::providers::ProviderRegistry;
use crate::request_queue::{QueueOutcome, RequestQueue};
use crate::retry::{DispatchSettings, RetryController};
use crate::routing::config::RoutingConfigStore;
use crate::routing::ModelRouter;
use crate::upstream::HttpUpstreamClient;

pub struct AppState {
    pub config: Config,
    pub key_manager: Arc<KeyManager>,
    pub router: Arc<ModelRouter>,
    pub pool_cooldown: Arc<PoolCooldownEngine>,
    pub queue: Arc<RequestQueue>,
    pub retry: Arc<RetryController>,
    pub registry: Arc<ProviderRegistry>,
    pub metrics: metrics::ProxyMetrics,
    pub started_at: Instant,
}

/// Assemble every core component from config.
pub async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let registry = Arc::new(ProviderRegistry::new(
        config.providers.clone(),
        config.model_mapping.clone(),
    ));
    if registry.silent_default_injected() {
        tracing::warn!(
            "No '{}' provider configured; the built-in default was injected alongside \
             the configured providers",
            crate::providers::DEFAULT_PROVIDER
        );
    }

    let key_manager = Arc::new(KeyManager::new(
        config.max_concurrency_per_key,
        config.max_total_concurrency,
        config.circuit_breaker.clone(),
    ));
    key_manager.load_keys(&config.keys).await;

    let store = RoutingConfigStore::new(&config.model_routing.config_file);
    let (routing_config, warnings) = store.load()?;
    for warning in warnings {
        tracing::warn!("Routing config: {}", warning);
    }
    let router = Arc::new(ModelRouter::new(
        config.model_routing.clone(),
        routing_config,
        Some(store),
    ));

    let pool_cooldown = Arc::new(PoolCooldownEngine::new(
        config.pool_cooldown.clone(),
        config.proactive_pacing.clone(),
    ));
    let queue = Arc::new(RequestQueue::new(config.queue.size, config.queue_timeout()));
    let upstream = Arc::new(HttpUpstreamClient::new(
        registry.clone(),
        config.upstream_timeout(),
        std::time::Duration::from_millis(config.free_socket_timeout_ms),
        std::time::Duration::from_millis(config.keep_alive_timeout_ms),
    )?);
    let retry = Arc::new(RetryController::new(
        key_manager.clone(),
        router.clone(),
        pool_cooldown.clone(),
        queue.clone(),
        registry.clone(),
        upstream,
        DispatchSettings::from(&config),
    ));

    Ok(Arc::new(AppState {
        config,
        key_manager,
        router,
        pool_cooldown,
        queue,
        retry,
        registry,
        metrics: metrics::ProxyMetrics::new()?,
        started_at: Instant::now(),
    }))
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

/// Build the full route table.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats::get_stats))
        .route("/metrics", get(metrics::get_metrics))
        .nest("/model-routing", model_routing::routes())
        .route("/v1/messages", post(proxy::messages))
        .route("/v1/*rest", post(proxy::passthrough))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the server until SIGINT, then drain gracefully: stop accepting,
/// flush the queue with a shutdown verdict, and give in-flight requests a
/// bounded window to finish.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown_timeout = config.shutdown_timeout();
    let state = build_state(config).await?;
    let queue = state.queue.clone();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "glm-proxy listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received; draining");
            queue.clear(QueueOutcome::Shutdown).await;
            // Watchdog: if in-flight work outlives the drain window, stop
            // waiting for it.
            tokio::spawn(async move {
                tokio::time::sleep(shutdown_timeout).await;
                tracing::warn!(
                    timeout_ms = shutdown_timeout.as_millis() as u64,
                    "Drain window elapsed; exiting"
                );
                std::process::exit(0);
            });
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
