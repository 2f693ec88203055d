//! Model routing: maps an incoming request to a tier and an ordered list of
//! upstream candidate models, honoring saved overrides, rules, the tier
//! classifier, and per-model cooldowns.
//!
//! Classification is first-match-wins: saved overrides, then the configured
//! rule list (whose last rule is an unconditional medium catch-all), then —
//! only where a tier's policy allows it — the feature classifier. Under
//! `rule-match-only` the classifier still runs shadow-only so its verdict
//! shows up in decision traces without affecting routing or stats.

pub mod config;
pub mod cooldown;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::ModelRoutingBootConfig;
use config::{
    ClientModelPolicy, RoutingConfig, RoutingConfigError, RoutingConfigStore, Tier,
};
use cooldown::{CooldownRecord, ModelCooldownMap, ModelCooldownSnapshot};

/// Documented answer to the hot-model boundary question: once the
/// model-switch budget is spent, the dispatcher keeps the model and rotates
/// credentials. Surfaced through `GET /model-routing`.
pub const MODEL_SWITCH_POLICY: &str = "rotate-credentials";

/// Request features extracted once per job, used by rules and classifier.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestFeatures {
    pub max_tokens: Option<u64>,
    pub message_count: u64,
    pub system_length: u64,
    pub has_tools: bool,
    pub has_vision: bool,
    #[serde(skip)]
    pub is_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DecisionSource {
    #[serde(rename = "rule")]
    Rule,
    #[serde(rename = "classifier")]
    Classifier,
    #[serde(rename = "saved-override")]
    SavedOverride,
    #[serde(rename = "default")]
    Default,
}

/// The router's verdict for one attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
    pub tier: Tier,
    pub selected_model: String,
    pub fallback_remaining: Vec<String>,
    pub source: DecisionSource,
    pub reason: String,
    pub cooldown_reasons: Vec<String>,
}

/// Decision counters; all monotonic, reset together with cooldowns.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    pub decisions_total: u64,
    pub by_tier_light: u64,
    pub by_tier_medium: u64,
    pub by_tier_heavy: u64,
    pub by_source_rule: u64,
    pub by_source_classifier: u64,
    pub by_source_saved_override: u64,
    pub by_source_default: u64,
    pub failover_total: u64,
    /// Failovers within the warmup window after startup, when selection has
    /// no history to base decisions on.
    pub failover_warmup_total: u64,
    pub burst_dampened_total: u64,
}

struct RouterInner {
    config: RoutingConfig,
    cooldowns: ModelCooldownMap,
    stats: RouterStats,
}

/// Model router singleton; one per worker process.
pub struct ModelRouter {
    inner: Mutex<RouterInner>,
    boot: ModelRoutingBootConfig,
    store: Option<RoutingConfigStore>,
    started_at: Instant,
}

impl ModelRouter {
    pub fn new(
        boot: ModelRoutingBootConfig,
        config: RoutingConfig,
        store: Option<RoutingConfigStore>,
    ) -> Self {
        Self {
            inner: Mutex::new(RouterInner {
                config,
                cooldowns: ModelCooldownMap::default(),
                stats: RouterStats::default(),
            }),
            boot,
            store,
            started_at: Instant::now(),
        }
    }

    pub async fn enabled(&self) -> bool {
        self.boot.enabled && self.inner.lock().await.config.enabled
    }

    /// Route one attempt. Records decision stats; returns `None` when every
    /// candidate has already been attempted.
    pub async fn select_model(
        &self,
        incoming_model: &str,
        features: &RequestFeatures,
        attempted_models: &HashSet<String>,
    ) -> Option<RouteDecision> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let decision = decide(
            &inner.config,
            &inner.cooldowns,
            self.boot.enabled,
            &self.boot.default_model,
            incoming_model,
            features,
            attempted_models,
            now,
        )?;
        inner.stats.decisions_total += 1;
        match decision.tier {
            Tier::Light => inner.stats.by_tier_light += 1,
            Tier::Medium => inner.stats.by_tier_medium += 1,
            Tier::Heavy => inner.stats.by_tier_heavy += 1,
        }
        match decision.source {
            DecisionSource::Rule => inner.stats.by_source_rule += 1,
            DecisionSource::Classifier => inner.stats.by_source_classifier += 1,
            DecisionSource::SavedOverride => inner.stats.by_source_saved_override += 1,
            DecisionSource::Default => inner.stats.by_source_default += 1,
        }
        Some(decision)
    }

    /// Route without recording stats — used by simulate/test/explain.
    pub async fn simulate(
        &self,
        incoming_model: &str,
        features: &RequestFeatures,
    ) -> Option<RouteDecision> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        decide(
            &inner.config,
            &inner.cooldowns,
            self.boot.enabled,
            &self.boot.default_model,
            incoming_model,
            features,
            &HashSet::new(),
            now,
        )
    }

    /// Record a 429 against an upstream model. Returns the cooldown record;
    /// dampened records are counted but do not escalate the backoff.
    pub async fn record_model_cooldown(
        &self,
        model: &str,
        force_dampened: bool,
    ) -> CooldownRecord {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let cooldown_cfg = inner.config.cooldown.clone();
        let record = inner
            .cooldowns
            .record(model, &cooldown_cfg, force_dampened, now);
        if record.burst_dampened {
            inner.stats.burst_dampened_total += 1;
        }
        tracing::info!(
            model,
            count = record.count,
            cooldown_ms = record.cooldown_ms,
            burst_dampened = record.burst_dampened,
            "Model cooldown recorded"
        );
        record
    }

    /// Count a model failover (switch to another upstream model mid-job).
    pub async fn record_failover(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.failover_total += 1;
        let warmup = Duration::from_millis(inner.config.failover.warmup_duration_ms);
        if self.started_at.elapsed() < warmup {
            inner.stats.failover_warmup_total += 1;
        }
    }

    pub async fn cooldowns(&self) -> Vec<ModelCooldownSnapshot> {
        let inner = self.inner.lock().await;
        inner.cooldowns.snapshot(Instant::now())
    }

    pub async fn stats(&self) -> RouterStats {
        self.inner.lock().await.stats
    }

    pub async fn config(&self) -> RoutingConfig {
        self.inner.lock().await.config.clone()
    }

    pub async fn overrides_active(&self) -> usize {
        self.inner.lock().await.config.overrides.len()
    }

    /// Clear cooldowns and decision stats.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.cooldowns.reset();
        inner.stats = RouterStats::default();
    }

    /// Apply a runtime edit: deep-merge `patch` over the current document,
    /// validate strictly (unknown keys reject), persist when configured.
    /// Returns the new config and any validation warnings.
    pub async fn apply_update(
        &self,
        patch: serde_json::Value,
    ) -> Result<(RoutingConfig, Vec<String>), RoutingConfigError> {
        let mut inner = self.inner.lock().await;
        let parse_err = |e| {
            RoutingConfigError::Parse(
                self.store
                    .as_ref()
                    .map(|s| s.path().to_path_buf())
                    .unwrap_or_default(),
                e,
            )
        };
        let mut merged = serde_json::to_value(&inner.config).map_err(parse_err)?;
        deep_merge(&mut merged, &patch);
        let candidate: RoutingConfig = serde_json::from_value(merged).map_err(parse_err)?;
        let warnings = candidate.validate(true)?;
        self.persist(&candidate)?;
        inner.config = candidate.clone();
        Ok((candidate, warnings))
    }

    /// Install or replace a saved override.
    pub async fn set_override(
        &self,
        incoming_model: &str,
        target_model: &str,
    ) -> Result<(), RoutingConfigError> {
        let mut inner = self.inner.lock().await;
        let mut candidate = inner.config.clone();
        candidate
            .overrides
            .insert(incoming_model.to_string(), target_model.to_string());
        candidate.validate(true)?;
        self.persist(&candidate)?;
        inner.config = candidate;
        Ok(())
    }

    /// Remove a saved override. Returns whether it existed.
    pub async fn remove_override(
        &self,
        incoming_model: &str,
    ) -> Result<bool, RoutingConfigError> {
        let mut inner = self.inner.lock().await;
        if !inner.config.overrides.contains_key(incoming_model) {
            return Ok(false);
        }
        let mut candidate = inner.config.clone();
        candidate.overrides.remove(incoming_model);
        self.persist(&candidate)?;
        inner.config = candidate;
        Ok(true)
    }

    fn persist(&self, config: &RoutingConfig) -> Result<(), RoutingConfigError> {
        if !self.boot.persist_config_edits {
            return Ok(());
        }
        match &self.store {
            Some(store) => store.save(config),
            None => Ok(()),
        }
    }
}

/// Pure decision function; all inputs explicit so tests can drive it.
#[allow(clippy::too_many_arguments)]
fn decide(
    config: &RoutingConfig,
    cooldowns: &ModelCooldownMap,
    boot_enabled: bool,
    boot_default_model: &str,
    incoming_model: &str,
    features: &RequestFeatures,
    attempted: &HashSet<String>,
    now: Instant,
) -> Option<RouteDecision> {
    if !boot_enabled || !config.enabled {
        // Passthrough: forward the incoming model (or the boot default when
        // the client sent none we recognize as non-empty).
        let model = if incoming_model.is_empty() {
            boot_default_model
        } else {
            incoming_model
        };
        if attempted.contains(model) {
            return None;
        }
        return Some(RouteDecision {
            tier: Tier::Medium,
            selected_model: model.to_string(),
            fallback_remaining: Vec::new(),
            source: DecisionSource::Default,
            reason: "routing disabled; passthrough".to_string(),
            cooldown_reasons: Vec::new(),
        });
    }

    let override_target = config
        .overrides
        .get(incoming_model)
        .or_else(|| config.overrides.get("*"));

    let (tier, source, mut reason, candidates) = match override_target {
        Some(target) => {
            let tier = config.tiers.containing(target).unwrap_or(Tier::Medium);
            let mut candidates = vec![target.clone()];
            for model in &config.tiers.get(tier).models {
                if model != target {
                    candidates.push(model.clone());
                }
            }
            (
                tier,
                DecisionSource::SavedOverride,
                format!("override {} -> {}", incoming_model, target),
                candidates,
            )
        }
        None => {
            let (rule_idx, rule) = config
                .rules
                .iter()
                .enumerate()
                .find(|(_, rule)| rule_matches(rule, incoming_model, features))?;
            let mut tier = rule.tier;
            let mut source = DecisionSource::Rule;
            let mut reason = format!("rule #{} matched (tier {})", rule_idx, tier);

            let classified = classify(tier, features, &config.classifier);
            match config.tiers.get(tier).client_model_policy {
                ClientModelPolicy::Classify => {
                    if classified != tier {
                        reason.push_str(&format!("; classifier moved {} -> {}", tier, classified));
                        tier = classified;
                        source = DecisionSource::Classifier;
                    }
                }
                ClientModelPolicy::RuleMatchOnly => {
                    // Shadow-only: visible in traces, never routed on.
                    if classified != tier {
                        reason.push_str(&format!("; shadow={}", classified));
                    }
                }
            }
            let candidates = config.tiers.get(tier).models.clone();
            (tier, source, reason, candidates)
        }
    };

    let mut selected: Option<String> = None;
    let mut fallback_remaining = Vec::new();
    let mut cooldown_reasons = Vec::new();
    let mut best_cooling: Option<(String, Duration)> = None;

    for model in &candidates {
        if attempted.contains(model) {
            continue;
        }
        if let Some(remaining) = cooldowns.remaining(model, now) {
            cooldown_reasons.push(format!(
                "{} cooling down ({} ms remaining)",
                model,
                remaining.as_millis()
            ));
            match &best_cooling {
                Some((_, best)) if *best <= remaining => {}
                _ => best_cooling = Some((model.clone(), remaining)),
            }
            continue;
        }
        match selected {
            None => selected = Some(model.clone()),
            Some(_) => fallback_remaining.push(model.clone()),
        }
    }

    let selected_model = match selected {
        Some(model) => model,
        None => {
            // Every unattempted candidate is cooling: degrade gracefully by
            // taking the one that clears soonest rather than failing.
            let (model, remaining) = best_cooling?;
            reason.push_str(&format!(
                "; all candidates cooling, selected shortest remaining ({} ms)",
                remaining.as_millis()
            ));
            model
        }
    };

    Some(RouteDecision {
        tier,
        selected_model,
        fallback_remaining,
        source,
        reason,
        cooldown_reasons,
    })
}

fn rule_matches(
    rule: &config::RouteRule,
    incoming_model: &str,
    features: &RequestFeatures,
) -> bool {
    if let Some(pattern) = &rule.model {
        match glob::Pattern::new(pattern) {
            Ok(p) => {
                if !p.matches(incoming_model) {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    if let Some(expected) = rule.has_tools {
        if features.has_tools != expected {
            return false;
        }
    }
    if let Some(expected) = rule.has_vision {
        if features.has_vision != expected {
            return false;
        }
    }
    if let Some(threshold) = rule.max_tokens_gte {
        if features.max_tokens.map_or(true, |t| t < threshold) {
            return false;
        }
    }
    if let Some(threshold) = rule.message_count_gte {
        if features.message_count < threshold {
            return false;
        }
    }
    if let Some(threshold) = rule.system_length_gte {
        if features.system_length < threshold {
            return false;
        }
    }
    true
}

/// Feature-based tier classifier. Promotes clearly heavy workloads,
/// demotes clearly light ones, otherwise keeps the rule's tier.
fn classify(
    tier: Tier,
    features: &RequestFeatures,
    cfg: &config::ClassifierConfig,
) -> Tier {
    if features
        .max_tokens
        .map_or(false, |t| t >= cfg.heavy_max_tokens_gte)
        || features.message_count >= cfg.heavy_message_count_gte
    {
        return Tier::Heavy;
    }
    if tier == Tier::Medium
        && !features.has_tools
        && !features.has_vision
        && features
            .max_tokens
            .map_or(false, |t| t < cfg.light_max_tokens_lt)
    {
        return Tier::Light;
    }
    tier
}

/// Recursive merge: objects merge key-wise, everything else replaces.
fn deep_merge(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
