//! Configuration management for the proxy.
//!
//! All keys can be overridden via `GLM_*` environment variables; numeric and
//! boolean values are parsed permissively (invalid values are ignored and the
//! default kept). The credential set is loaded from `GLM_API_KEYS` (inline
//! JSON) or `GLM_KEYS_FILE`, as either a flat list or a map of provider name
//! to list. Provider registry and model mapping configuration follow the same
//! pattern (`GLM_PROVIDERS`/`GLM_PROVIDERS_FILE`, `GLM_MODEL_MAPPING`).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read {0}: {1}")]
    Io(String, #[source] std::io::Error),
}

/// Circuit breaker thresholds, applied per credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker stays open before probing.
    pub cooldown_period_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_period_ms: 60_000,
        }
    }
}

/// Per-(provider, model) pool cooldown tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolCooldownConfig {
    /// Base backoff for the first 429.
    pub base_ms: u64,
    /// Cap on a single computed cooldown.
    pub cap_ms: u64,
    /// A quiet period this long resets the consecutive-hit count.
    pub decay_ms: u64,
    /// Below this remaining cooldown the dispatcher sleeps instead of failing.
    pub sleep_threshold_ms: u64,
    /// Extra jitter applied when retrying into a cooling pool.
    pub retry_jitter_ms: u64,
    /// Absolute ceiling on any cooldown window.
    pub max_cooldown_ms: u64,
}

impl Default for PoolCooldownConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 15_000,
            decay_ms: 15_000,
            sleep_threshold_ms: 2_000,
            retry_jitter_ms: 250,
            max_cooldown_ms: 60_000,
        }
    }
}

/// Proactive pacing from `x-ratelimit-remaining` headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PacingConfig {
    pub enabled: bool,
    /// Pacing kicks in when the remaining quota drops to this or below.
    pub remaining_threshold: u64,
    /// Maximum pacing delay, scaled linearly as remaining approaches zero.
    pub pacing_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remaining_threshold: 15,
            pacing_delay_ms: 500,
        }
    }
}

/// Request queue bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub size: usize,
    pub timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            size: 100,
            timeout_ms: 30_000,
        }
    }
}

/// Boot-time knobs for the model router. The routing policy itself lives in
/// the schema-versioned routing config file (see `routing::config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelRoutingBootConfig {
    pub enabled: bool,
    /// Used when routing is disabled or nothing matches.
    pub default_model: String,
    /// Whether runtime PUTs are written back to `config_file`.
    pub persist_config_edits: bool,
    pub config_file: PathBuf,
}

impl Default for ModelRoutingBootConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_model: "glm-4.6".to_string(),
            persist_config_edits: true,
            config_file: PathBuf::from("model-routing.json"),
        }
    }
}

/// A single credential in the keys spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyEntry {
    /// Bare secret string; id is derived, weight defaults to 1.
    Secret(String),
    Detailed {
        #[serde(default)]
        id: Option<String>,
        secret: String,
        #[serde(default)]
        weight: Option<f64>,
    },
}

/// Credential set: a flat list (untagged provider) or per-provider lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeysSpec {
    Flat(Vec<KeyEntry>),
    ByProvider(HashMap<String, Vec<KeyEntry>>),
}

impl Default for KeysSpec {
    fn default() -> Self {
        Self::Flat(Vec::new())
    }
}

/// Top-level proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Downstream clients must present this key; `None` disables auth.
    pub proxy_api_key: Option<String>,

    pub max_concurrency_per_key: u32,
    pub max_total_concurrency: u32,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub upstream_timeout_ms: u64,
    pub keep_alive_timeout_ms: u64,
    pub free_socket_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,

    pub queue: QueueConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub pool_cooldown: PoolCooldownConfig,
    pub proactive_pacing: PacingConfig,
    pub model_routing: ModelRoutingBootConfig,

    /// Provider registry configuration, keyed by provider name.
    pub providers: HashMap<String, crate::providers::ProviderConfig>,
    /// Incoming model → upstream target mapping.
    pub model_mapping: HashMap<String, crate::providers::ModelMappingEntry>,
    pub keys: KeysSpec,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8788,
            proxy_api_key: None,
            max_concurrency_per_key: 5,
            max_total_concurrency: 200,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            request_timeout_ms: 300_000,
            upstream_timeout_ms: 60_000,
            keep_alive_timeout_ms: 60_000,
            free_socket_timeout_ms: 8_000,
            shutdown_timeout_ms: 10_000,
            queue: QueueConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pool_cooldown: PoolCooldownConfig::default(),
            proactive_pacing: PacingConfig::default(),
            model_routing: ModelRoutingBootConfig::default(),
            providers: HashMap::new(),
            model_mapping: HashMap::new(),
            keys: KeysSpec::default(),
        }
    }
}

/// Permissive env parse: unset or unparseable values fall back to `default`.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse inline JSON from `inline_key`, else read the file named by
/// `file_key`. Malformed inline JSON is ignored with a warning; a named but
/// unreadable file is a hard error.
fn env_json<T: serde::de::DeserializeOwned>(
    inline_key: &str,
    file_key: &str,
) -> Result<Option<T>, ConfigError> {
    if let Some(raw) = env_string(inline_key) {
        match serde_json::from_str(&raw) {
            Ok(v) => return Ok(Some(v)),
            Err(e) => {
                tracing::warn!(key = inline_key, error = %e, "Ignoring malformed JSON value");
            }
        }
    }
    if let Some(path) = env_string(file_key) {
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(path.clone(), e))?;
        let v = serde_json::from_str(&contents)
            .map_err(|e| ConfigError::InvalidValue(file_key.to_string(), e.to_string()))?;
        return Ok(Some(v));
    }
    Ok(None)
}

impl Config {
    /// Load configuration from `GLM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut config = Self {
            host: env_string("GLM_HOST").unwrap_or(defaults.host),
            port: env_parse("GLM_PORT", defaults.port),
            proxy_api_key: env_string("GLM_PROXY_API_KEY"),
            max_concurrency_per_key: env_parse(
                "GLM_MAX_CONCURRENCY_PER_KEY",
                defaults.max_concurrency_per_key,
            ),
            max_total_concurrency: env_parse(
                "GLM_MAX_TOTAL_CONCURRENCY",
                defaults.max_total_concurrency,
            ),
            max_retries: env_parse("GLM_MAX_RETRIES", defaults.max_retries),
            retry_base_delay_ms: env_parse("GLM_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms),
            retry_max_delay_ms: env_parse("GLM_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms),
            request_timeout_ms: env_parse("GLM_REQUEST_TIMEOUT", defaults.request_timeout_ms),
            upstream_timeout_ms: env_parse("GLM_UPSTREAM_TIMEOUT", defaults.upstream_timeout_ms),
            keep_alive_timeout_ms: env_parse(
                "GLM_KEEP_ALIVE_TIMEOUT",
                defaults.keep_alive_timeout_ms,
            ),
            free_socket_timeout_ms: env_parse(
                "GLM_FREE_SOCKET_TIMEOUT",
                defaults.free_socket_timeout_ms,
            ),
            shutdown_timeout_ms: env_parse("GLM_SHUTDOWN_TIMEOUT", defaults.shutdown_timeout_ms),
            queue: QueueConfig {
                size: env_parse("GLM_QUEUE_SIZE", defaults.queue.size),
                timeout_ms: env_parse("GLM_QUEUE_TIMEOUT", defaults.queue.timeout_ms),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env_parse(
                    "GLM_CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                    defaults.circuit_breaker.failure_threshold,
                ),
                cooldown_period_ms: env_parse(
                    "GLM_CIRCUIT_BREAKER_COOLDOWN_PERIOD",
                    defaults.circuit_breaker.cooldown_period_ms,
                ),
            },
            pool_cooldown: PoolCooldownConfig {
                base_ms: env_parse("GLM_POOL_COOLDOWN_BASE_MS", defaults.pool_cooldown.base_ms),
                cap_ms: env_parse("GLM_POOL_COOLDOWN_CAP_MS", defaults.pool_cooldown.cap_ms),
                decay_ms: env_parse("GLM_POOL_COOLDOWN_DECAY_MS", defaults.pool_cooldown.decay_ms),
                sleep_threshold_ms: env_parse(
                    "GLM_POOL_COOLDOWN_SLEEP_THRESHOLD_MS",
                    defaults.pool_cooldown.sleep_threshold_ms,
                ),
                retry_jitter_ms: env_parse(
                    "GLM_POOL_COOLDOWN_RETRY_JITTER_MS",
                    defaults.pool_cooldown.retry_jitter_ms,
                ),
                max_cooldown_ms: env_parse(
                    "GLM_POOL_COOLDOWN_MAX_COOLDOWN_MS",
                    defaults.pool_cooldown.max_cooldown_ms,
                ),
            },
            proactive_pacing: PacingConfig {
                enabled: env_bool("GLM_PACING_ENABLED", defaults.proactive_pacing.enabled),
                remaining_threshold: env_parse(
                    "GLM_PACING_REMAINING_THRESHOLD",
                    defaults.proactive_pacing.remaining_threshold,
                ),
                pacing_delay_ms: env_parse(
                    "GLM_PACING_DELAY_MS",
                    defaults.proactive_pacing.pacing_delay_ms,
                ),
            },
            model_routing: ModelRoutingBootConfig {
                enabled: env_bool("GLM_MODEL_ROUTING_ENABLED", defaults.model_routing.enabled),
                default_model: env_string("GLM_DEFAULT_MODEL")
                    .unwrap_or(defaults.model_routing.default_model),
                persist_config_edits: env_bool(
                    "GLM_MODEL_ROUTING_PERSIST",
                    defaults.model_routing.persist_config_edits,
                ),
                config_file: env_string("GLM_MODEL_ROUTING_CONFIG_FILE")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.model_routing.config_file),
            },
            providers: HashMap::new(),
            model_mapping: HashMap::new(),
            keys: KeysSpec::default(),
        };

        if let Some(providers) = env_json("GLM_PROVIDERS", "GLM_PROVIDERS_FILE")? {
            config.providers = providers;
        }
        if let Some(mapping) = env_json("GLM_MODEL_MAPPING", "GLM_MODEL_MAPPING_FILE")? {
            config.model_mapping = mapping;
        }
        if let Some(keys) = env_json("GLM_API_KEYS", "GLM_KEYS_FILE")? {
            config.keys = keys;
        }

        Ok(config)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }

    pub fn upstream_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn queue_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.queue.timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.max_concurrency_per_key, 5);
        assert_eq!(c.max_total_concurrency, 200);
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.queue.size, 100);
        assert_eq!(c.queue.timeout_ms, 30_000);
        assert_eq!(c.request_timeout_ms, 300_000);
        assert_eq!(c.free_socket_timeout_ms, 8_000);
        assert_eq!(c.circuit_breaker.failure_threshold, 5);
        assert_eq!(c.circuit_breaker.cooldown_period_ms, 60_000);
        assert_eq!(c.pool_cooldown.base_ms, 500);
        assert_eq!(c.proactive_pacing.remaining_threshold, 15);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        std::env::set_var("GLM_TEST_PERMISSIVE_PARSE", "not-a-number");
        assert_eq!(env_parse("GLM_TEST_PERMISSIVE_PARSE", 42u32), 42);
        std::env::set_var("GLM_TEST_PERMISSIVE_PARSE", "7");
        assert_eq!(env_parse("GLM_TEST_PERMISSIVE_PARSE", 42u32), 7);
        std::env::remove_var("GLM_TEST_PERMISSIVE_PARSE");
    }

    #[test]
    fn bool_parsing_is_permissive() {
        std::env::set_var("GLM_TEST_BOOL_PARSE", "yes");
        assert!(env_bool("GLM_TEST_BOOL_PARSE", false));
        std::env::set_var("GLM_TEST_BOOL_PARSE", "0");
        assert!(!env_bool("GLM_TEST_BOOL_PARSE", true));
        std::env::set_var("GLM_TEST_BOOL_PARSE", "maybe");
        assert!(env_bool("GLM_TEST_BOOL_PARSE", true));
        std::env::remove_var("GLM_TEST_BOOL_PARSE");
    }

    #[test]
    fn keys_spec_accepts_flat_and_per_provider_shapes() {
        let flat: KeysSpec = serde_json::from_str(r#"["sk-a", {"secret": "sk-b", "weight": 2}]"#)
            .expect("flat list");
        match flat {
            KeysSpec::Flat(entries) => assert_eq!(entries.len(), 2),
            KeysSpec::ByProvider(_) => panic!("expected flat list"),
        }

        let by_provider: KeysSpec =
            serde_json::from_str(r#"{"zai": ["sk-a"], "backup": [{"secret": "sk-b"}]}"#)
                .expect("provider map");
        match by_provider {
            KeysSpec::ByProvider(map) => assert_eq!(map.len(), 2),
            KeysSpec::Flat(_) => panic!("expected provider map"),
        }
    }
}
