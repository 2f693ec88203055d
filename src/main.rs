//! glm-proxy — HTTP server entry point.

use glm_proxy::{api, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "glm_proxy=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        host = %config.host,
        port = config.port,
        max_total_concurrency = config.max_total_concurrency,
        routing_enabled = config.model_routing.enabled,
        "Loaded configuration"
    );
    if config.proxy_api_key.is_none() {
        tracing::warn!("GLM_PROXY_API_KEY is not set; downstream auth is disabled");
    }

    api::serve(config).await
}
