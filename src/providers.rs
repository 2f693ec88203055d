//! Provider registry: resolves which upstream a model belongs to and how to
//! authenticate against it.
//!
//! Providers are configured as a map of name → connection details. Untagged
//! credentials belong to the pseudo-provider `__untagged__`, which routes to
//! the default provider's endpoint.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Provider name assumed for credentials configured without a provider tag.
pub const UNTAGGED_PROVIDER: &str = "__untagged__";

/// Name of the built-in default provider.
pub const DEFAULT_PROVIDER: &str = "zai";

/// How the provider expects the API key to be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthScheme {
    #[serde(rename = "x-api-key")]
    XApiKey,
    #[serde(rename = "bearer")]
    Bearer,
    #[serde(rename = "custom")]
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    Free,
    Metered,
    Premium,
}

/// Connection details for one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub target_host: String,
    #[serde(default)]
    pub target_base_path: String,
    #[serde(default = "default_protocol")]
    pub target_protocol: String,
    pub auth_scheme: AuthScheme,
    #[serde(default)]
    pub custom_auth_header: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default = "default_cost_tier")]
    pub cost_tier: CostTier,
}

fn default_protocol() -> String {
    "https".to_string()
}

fn default_cost_tier() -> CostTier {
    CostTier::Metered
}

impl ProviderConfig {
    /// The built-in default provider: z.ai's Anthropic-compatible endpoint.
    pub fn builtin_default() -> Self {
        Self {
            target_host: "api.z.ai".to_string(),
            target_base_path: "/api/anthropic".to_string(),
            target_protocol: "https".to_string(),
            auth_scheme: AuthScheme::Bearer,
            custom_auth_header: None,
            extra_headers: HashMap::new(),
            cost_tier: CostTier::Metered,
        }
    }

    /// Base URL for this provider, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}{}",
            self.target_protocol,
            self.target_host,
            self.target_base_path.trim_end_matches('/')
        )
    }
}

/// One entry in the incoming-model → upstream mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelMappingEntry {
    /// Route to the default provider with this target model.
    Target(String),
    /// Route to a named provider.
    Detailed {
        target: String,
        #[serde(default)]
        provider: Option<String>,
    },
}

/// The resolved (provider, model) pair for an upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResolution {
    pub provider_name: String,
    pub target_model: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("model mapping names unconfigured provider '{0}'")]
    UnconfiguredProvider(String),
}

/// Immutable lookup built once at boot from config.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
    mapping: HashMap<String, ModelMappingEntry>,
    default_provider: String,
    silent_default_injected: bool,
}

impl ProviderRegistry {
    /// Build the registry. The default provider is injected only when the
    /// user configured other providers without one; that injection is
    /// flagged so the boot path can warn about it.
    pub fn new(
        mut providers: HashMap<String, ProviderConfig>,
        mapping: HashMap<String, ModelMappingEntry>,
    ) -> Self {
        let mut silent_default_injected = false;
        if providers.is_empty() {
            providers.insert(DEFAULT_PROVIDER.to_string(), ProviderConfig::builtin_default());
        } else if !providers.contains_key(DEFAULT_PROVIDER) {
            providers.insert(DEFAULT_PROVIDER.to_string(), ProviderConfig::builtin_default());
            silent_default_injected = true;
        }
        Self {
            providers,
            mapping,
            default_provider: DEFAULT_PROVIDER.to_string(),
            silent_default_injected,
        }
    }

    /// Whether the default provider was added behind the user's back.
    pub fn silent_default_injected(&self) -> bool {
        self.silent_default_injected
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn get(&self, provider_name: &str) -> Option<&ProviderConfig> {
        // Untagged credentials use the default provider's endpoint.
        if provider_name == UNTAGGED_PROVIDER {
            return self.providers.get(&self.default_provider);
        }
        self.providers.get(provider_name)
    }

    /// Resolve an upstream model name to the provider that serves it.
    ///
    /// String mapping values route to the default provider; detailed values
    /// may name another provider, which must be configured. Unmapped models
    /// go to the default provider unchanged.
    pub fn resolve_provider_for_model(
        &self,
        model: &str,
    ) -> Result<ProviderResolution, RegistryError> {
        match self.mapping.get(model) {
            None => Ok(ProviderResolution {
                provider_name: self.default_provider.clone(),
                target_model: model.to_string(),
            }),
            Some(ModelMappingEntry::Target(target)) => Ok(ProviderResolution {
                provider_name: self.default_provider.clone(),
                target_model: target.clone(),
            }),
            Some(ModelMappingEntry::Detailed { target, provider }) => {
                let provider_name = provider
                    .clone()
                    .unwrap_or_else(|| self.default_provider.clone());
                if !self.providers.contains_key(&provider_name) {
                    return Err(RegistryError::UnconfiguredProvider(provider_name));
                }
                Ok(ProviderResolution {
                    provider_name,
                    target_model: target.clone(),
                })
            }
        }
    }

    /// Format the auth header for a provider. Returns `None` for an unknown
    /// provider or a `custom` scheme missing its header name.
    pub fn format_auth_header(
        &self,
        provider_name: &str,
        api_key: &str,
    ) -> Option<(String, String)> {
        let provider = self.get(provider_name)?;
        match provider.auth_scheme {
            AuthScheme::XApiKey => Some(("x-api-key".to_string(), api_key.to_string())),
            AuthScheme::Bearer => Some((
                "authorization".to_string(),
                format!("Bearer {}", api_key),
            )),
            AuthScheme::Custom => provider
                .custom_auth_header
                .as_ref()
                .map(|name| (name.to_ascii_lowercase(), api_key.to_string())),
        }
    }
}
