//! Routing policy schema and persistence.
//!
//! The policy is a schema-versioned JSON document (`version: "2.x"`),
//! runtime-editable through the admin API. Unknown keys are accepted with a
//! warning at boot (forward compatibility) but rejected for runtime PUTs.
//! Writes go through a temp file and atomic rename, keeping one `.bak`
//! sibling of the previous version.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema version written by this build. Readers accept any `2.x`.
pub const SCHEMA_VERSION: &str = "2.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Light,
    Medium,
    Heavy,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Medium => "medium",
            Self::Heavy => "heavy",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Tier {
    fn default() -> Self {
        Self::Medium
    }
}

/// Whether the classifier may change a rule-matched tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientModelPolicy {
    #[serde(rename = "classify")]
    Classify,
    /// The rule's tier is final; the classifier still runs shadow-only.
    #[serde(rename = "rule-match-only")]
    RuleMatchOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    /// Ordered candidate models; earlier is preferred.
    pub models: Vec<String>,
    #[serde(default = "default_policy")]
    pub client_model_policy: ClientModelPolicy,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_policy() -> ClientModelPolicy {
    ClientModelPolicy::RuleMatchOnly
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tiers {
    pub light: TierConfig,
    pub medium: TierConfig,
    pub heavy: TierConfig,
}

impl Tiers {
    pub fn get(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Light => &self.light,
            Tier::Medium => &self.medium,
            Tier::Heavy => &self.heavy,
        }
    }

    /// The tier whose candidate list contains `model`, if any.
    pub fn containing(&self, model: &str) -> Option<Tier> {
        for tier in [Tier::Light, Tier::Medium, Tier::Heavy] {
            if self.get(tier).models.iter().any(|m| m == model) {
                return Some(tier);
            }
        }
        None
    }

    pub fn longest_chain(&self) -> usize {
        [&self.light, &self.medium, &self.heavy]
            .iter()
            .map(|t| t.models.len())
            .max()
            .unwrap_or(0)
    }
}

/// One classification rule. All present predicates must match (conjunction);
/// an empty rule matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    /// Glob over the incoming model name (e.g. `claude-*-haiku*`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_tools: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_vision: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_gte: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count_gte: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_length_gte: Option<u64>,
    pub tier: Tier,
}

impl RouteRule {
    pub fn is_unconditional(&self) -> bool {
        self.model.is_none()
            && self.has_tools.is_none()
            && self.has_vision.is_none()
            && self.max_tokens_gte.is_none()
            && self.message_count_gte.is_none()
            && self.system_length_gte.is_none()
    }
}

/// Feature thresholds for the tier classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifierConfig {
    pub heavy_max_tokens_gte: u64,
    pub heavy_message_count_gte: u64,
    pub light_max_tokens_lt: u64,
    #[serde(flatten, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            heavy_max_tokens_gte: 16_384,
            heavy_message_count_gte: 48,
            light_max_tokens_lt: 1_024,
            extra: serde_json::Map::new(),
        }
    }
}

/// Per-upstream-model cooldown tuning for the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelCooldownConfig {
    pub default_ms: u64,
    pub max_ms: u64,
    pub decay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_cooldown_entries: usize,
    /// 429s for the same model landing within this window after a recorded
    /// one register as a single backoff step.
    pub burst_window_ms: u64,
    #[serde(flatten, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ModelCooldownConfig {
    fn default() -> Self {
        Self {
            default_ms: 5_000,
            max_ms: 60_000,
            decay_ms: 30_000,
            backoff_multiplier: 2.0,
            max_cooldown_entries: 64,
            burst_window_ms: 1_000,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailoverConfig {
    /// Cap on distinct upstream models tried for a single job. Must be ≥ 2.
    pub max_model_switches_per_request: u32,
    /// Failovers inside this window after startup are counted separately
    /// (cold-start thrash vs steady-state thrash).
    pub warmup_duration_ms: u64,
    #[serde(flatten, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_model_switches_per_request: 2,
            warmup_duration_ms: 60_000,
            extra: serde_json::Map::new(),
        }
    }
}

/// The full routing policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingConfig {
    pub version: String,
    pub enabled: bool,
    pub default_model: String,
    pub tiers: Tiers,
    pub rules: Vec<RouteRule>,
    pub classifier: ClassifierConfig,
    pub cooldown: ModelCooldownConfig,
    pub failover: FailoverConfig,
    /// Saved overrides: exact incoming model → upstream model. The key `*`
    /// matches any incoming model.
    pub overrides: HashMap<String, String>,
    #[serde(flatten, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            enabled: true,
            default_model: "glm-4.6".to_string(),
            tiers: Tiers {
                light: TierConfig {
                    models: vec!["glm-4.5-air".to_string()],
                    client_model_policy: ClientModelPolicy::RuleMatchOnly,
                    extra: serde_json::Map::new(),
                },
                medium: TierConfig {
                    models: vec!["glm-4.6".to_string(), "glm-4.5-air".to_string()],
                    client_model_policy: ClientModelPolicy::RuleMatchOnly,
                    extra: serde_json::Map::new(),
                },
                heavy: TierConfig {
                    models: vec!["glm-4.7".to_string(), "glm-4.6".to_string()],
                    client_model_policy: ClientModelPolicy::RuleMatchOnly,
                    extra: serde_json::Map::new(),
                },
            },
            rules: vec![
                RouteRule {
                    model: Some("*haiku*".to_string()),
                    tier: Tier::Light,
                    ..RouteRule::default()
                },
                RouteRule {
                    model: Some("*opus*".to_string()),
                    tier: Tier::Heavy,
                    ..RouteRule::default()
                },
                RouteRule {
                    has_vision: Some(true),
                    tier: Tier::Heavy,
                    ..RouteRule::default()
                },
                RouteRule {
                    max_tokens_gte: Some(16_384),
                    tier: Tier::Heavy,
                    ..RouteRule::default()
                },
                // Catch-all; must stay last and unconditional.
                RouteRule {
                    tier: Tier::Medium,
                    ..RouteRule::default()
                },
            ],
            classifier: ClassifierConfig::default(),
            cooldown: ModelCooldownConfig::default(),
            failover: FailoverConfig::default(),
            overrides: HashMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RoutingConfigError {
    #[error("unsupported schema version '{0}' (expected 2.x)")]
    UnsupportedVersion(String),

    #[error("tier '{0}' has no models")]
    EmptyTier(&'static str),

    #[error("rules must end with an unconditional catch-all rule with tier 'medium'")]
    MissingCatchAll,

    #[error("failover.maxModelSwitchesPerRequest must be at least 2 (got {0})")]
    SwitchBudgetTooSmall(u32),

    #[error("unknown keys: {0}")]
    UnknownKeys(String),

    #[error("override for '{0}' maps to an empty model name")]
    EmptyOverride(String),

    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
}

impl RoutingConfig {
    /// Validate the document. Structural problems are errors; advisory
    /// findings come back as warnings. With `strict`, unknown keys are an
    /// error; otherwise they produce a warning (boot-time forward compat).
    pub fn validate(&self, strict: bool) -> Result<Vec<String>, RoutingConfigError> {
        let mut warnings = Vec::new();

        if !self.version.starts_with("2.") {
            return Err(RoutingConfigError::UnsupportedVersion(self.version.clone()));
        }

        for (name, tier) in [
            ("light", &self.tiers.light),
            ("medium", &self.tiers.medium),
            ("heavy", &self.tiers.heavy),
        ] {
            if tier.models.is_empty() {
                return Err(RoutingConfigError::EmptyTier(name));
            }
        }

        match self.rules.last() {
            Some(last) if last.is_unconditional() && last.tier == Tier::Medium => {}
            _ => return Err(RoutingConfigError::MissingCatchAll),
        }

        if self.failover.max_model_switches_per_request < 2 {
            return Err(RoutingConfigError::SwitchBudgetTooSmall(
                self.failover.max_model_switches_per_request,
            ));
        }

        for (incoming, target) in &self.overrides {
            if target.trim().is_empty() {
                return Err(RoutingConfigError::EmptyOverride(incoming.clone()));
            }
        }

        let unknown = self.unknown_keys();
        if !unknown.is_empty() {
            if strict {
                return Err(RoutingConfigError::UnknownKeys(unknown.join(", ")));
            }
            warnings.push(format!("ignoring unknown keys: {}", unknown.join(", ")));
        }

        let longest = self.tiers.longest_chain();
        if self.failover.max_model_switches_per_request as usize > longest {
            warnings.push(format!(
                "maxModelSwitchesPerRequest ({}) exceeds the longest tier chain ({} models); \
                 the extra switch budget can never be spent",
                self.failover.max_model_switches_per_request, longest
            ));
        }

        for rule in self.rules.iter().take(self.rules.len().saturating_sub(1)) {
            if rule.is_unconditional() {
                warnings.push(
                    "an unconditional rule before the catch-all shadows later rules".to_string(),
                );
                break;
            }
        }

        Ok(warnings)
    }

    fn unknown_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.extra.keys().cloned().collect();
        keys.extend(self.failover.extra.keys().map(|k| format!("failover.{}", k)));
        keys.extend(self.cooldown.extra.keys().map(|k| format!("cooldown.{}", k)));
        keys.extend(
            self.classifier
                .extra
                .keys()
                .map(|k| format!("classifier.{}", k)),
        );
        for (name, tier) in [
            ("light", &self.tiers.light),
            ("medium", &self.tiers.medium),
            ("heavy", &self.tiers.heavy),
        ] {
            keys.extend(tier.extra.keys().map(|k| format!("tiers.{}.{}", name, k)));
        }
        keys.sort();
        keys
    }
}

/// Disk persistence for the routing policy.
#[derive(Debug, Clone)]
pub struct RoutingConfigStore {
    path: PathBuf,
}

impl RoutingConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the policy from disk. A missing file yields the defaults; a
    /// present file is validated non-strictly and its warnings returned.
    pub fn load(&self) -> Result<(RoutingConfig, Vec<String>), RoutingConfigError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((RoutingConfig::default(), Vec::new()));
            }
            Err(e) => return Err(RoutingConfigError::Io(self.path.clone(), e)),
        };
        let config: RoutingConfig = serde_json::from_str(&contents)
            .map_err(|e| RoutingConfigError::Parse(self.path.clone(), e))?;
        let warnings = config.validate(false)?;
        Ok((config, warnings))
    }

    /// Write the policy atomically: serialize to a temp file, preserve the
    /// previous version as `.bak`, then rename into place.
    pub fn save(&self, config: &RoutingConfig) -> Result<(), RoutingConfigError> {
        let io_err = |e| RoutingConfigError::Io(self.path.clone(), e);
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let contents = serde_json::to_string_pretty(config)
            .map_err(|e| RoutingConfigError::Parse(self.path.clone(), e))?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, contents).map_err(io_err)?;
        if self.path.exists() {
            std::fs::copy(&self.path, self.path.with_extension("bak")).map_err(io_err)?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_with_no_warnings() {
        let config = RoutingConfig::default();
        let warnings = config.validate(true).expect("default config valid");
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    #[test]
    fn catch_all_must_be_last_and_medium() {
        let mut config = RoutingConfig::default();
        config.rules.pop();
        assert!(matches!(
            config.validate(true),
            Err(RoutingConfigError::MissingCatchAll)
        ));

        let mut config = RoutingConfig::default();
        config.rules.last_mut().unwrap().tier = Tier::Heavy;
        assert!(matches!(
            config.validate(true),
            Err(RoutingConfigError::MissingCatchAll)
        ));
    }

    #[test]
    fn switch_budget_below_two_is_rejected() {
        let mut config = RoutingConfig::default();
        config.failover.max_model_switches_per_request = 1;
        assert!(matches!(
            config.validate(true),
            Err(RoutingConfigError::SwitchBudgetTooSmall(1))
        ));
    }

    #[test]
    fn oversized_switch_budget_warns_but_passes() {
        let mut config = RoutingConfig::default();
        config.failover.max_model_switches_per_request = 10;
        let warnings = config.validate(true).expect("valid");
        assert!(
            warnings
                .iter()
                .any(|w| w.contains("maxModelSwitchesPerRequest")),
            "expected a switch-budget warning, got {:?}",
            warnings
        );
    }

    #[test]
    fn unknown_keys_warn_at_boot_and_fail_strict() {
        let raw = serde_json::json!({
            "version": "2.1",
            "futureKnob": true,
            "failover": { "maxModelSwitchesPerRequest": 3, "futureNested": 1 }
        });
        let config: RoutingConfig = serde_json::from_value(raw).unwrap();
        let warnings = config.validate(false).expect("boot accepts unknowns");
        assert!(warnings.iter().any(|w| w.contains("futureKnob")));
        assert!(warnings.iter().any(|w| w.contains("failover.futureNested")));
        assert!(matches!(
            config.validate(true),
            Err(RoutingConfigError::UnknownKeys(_))
        ));
    }

    #[test]
    fn version_must_be_2x() {
        let mut config = RoutingConfig::default();
        config.version = "3.0".to_string();
        assert!(matches!(
            config.validate(false),
            Err(RoutingConfigError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn save_round_trips_and_keeps_a_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model-routing.json");
        let store = RoutingConfigStore::new(&path);

        let (config, warnings) = store.load().expect("missing file yields defaults");
        assert!(warnings.is_empty());
        store.save(&config).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("bak").exists());

        let mut edited = config.clone();
        edited.failover.max_model_switches_per_request = 3;
        store.save(&edited).unwrap();
        assert!(path.with_extension("bak").exists());

        let (reloaded, _) = store.load().unwrap();
        assert_eq!(reloaded.failover.max_model_switches_per_request, 3);

        // The backup holds the previous version.
        let bak: RoutingConfig = serde_json::from_str(
            &std::fs::read_to_string(path.with_extension("bak")).unwrap(),
        )
        .unwrap();
        assert_eq!(bak.failover.max_model_switches_per_request, 2);
    }

    #[test]
    fn tiers_lookup_by_model() {
        let config = RoutingConfig::default();
        assert_eq!(config.tiers.containing("glm-4.7"), Some(Tier::Heavy));
        assert_eq!(config.tiers.containing("glm-4.5-air"), Some(Tier::Light));
        assert_eq!(config.tiers.containing("unknown"), None);
    }
}
