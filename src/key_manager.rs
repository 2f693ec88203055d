//! Owner of the credential set. Selection, outcome recording, and reloads
//! all go through one async mutex, so scoring and slot reservation are
//! atomic with respect to concurrent jobs.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{CircuitBreakerConfig, KeyEntry, KeysSpec};
use crate::credential::{Credential, CredentialSnapshot, CircuitState, ReleaseOutcome};
use crate::error::ErrorKind;
use crate::providers::UNTAGGED_PROVIDER;

/// Weight of the in-flight saturation penalty in the selection score.
const SATURATION_PENALTY: f64 = 0.5;
/// Weight of the recent-failure EWMA penalty.
const FAILURE_PENALTY: f64 = 0.3;
/// Weight of the low-latency bonus.
const LATENCY_BONUS: f64 = 0.1;

/// The identity handed to the dispatcher when a slot is reserved. The
/// secret travels with it so the wire layer never touches the pool.
#[derive(Debug, Clone)]
pub struct AcquiredKey {
    pub credential_id: String,
    pub secret: String,
    pub provider_name: String,
}

/// Per-provider health rollup for `/stats`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub total: u32,
    pub available: u32,
    pub in_flight: u32,
    pub open_circuits: u32,
    pub error_rate: f64,
}

struct Inner {
    credentials: Vec<Credential>,
}

/// Owns all credential state; a singleton within a worker process.
pub struct KeyManager {
    inner: Mutex<Inner>,
    max_concurrency_per_key: u32,
    max_total_concurrency: u32,
    breaker: CircuitBreakerConfig,
}

impl KeyManager {
    pub fn new(
        max_concurrency_per_key: u32,
        max_total_concurrency: u32,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                credentials: Vec::new(),
            }),
            max_concurrency_per_key,
            max_total_concurrency,
            breaker,
        }
    }

    /// Replace the credential set. Credentials that survive the reload (same
    /// id) keep their in-flight counters, breaker state, and stats.
    pub async fn load_keys(&self, spec: &KeysSpec) {
        let mut fresh = Vec::new();
        match spec {
            KeysSpec::Flat(entries) => {
                self.build_credentials(&mut fresh, UNTAGGED_PROVIDER, entries);
            }
            KeysSpec::ByProvider(map) => {
                let mut providers: Vec<&String> = map.keys().collect();
                providers.sort();
                for provider in providers {
                    self.build_credentials(&mut fresh, provider, &map[provider]);
                }
            }
        }

        let mut inner = self.inner.lock().await;
        let mut old: HashMap<String, Credential> = inner
            .credentials
            .drain(..)
            .map(|c| (c.id.clone(), c))
            .collect();
        for mut cred in fresh {
            if let Some(existing) = old.remove(&cred.id) {
                // Same identity: keep live counters, adopt new tuning.
                let (secret, weight) = (cred.secret.clone(), cred.weight);
                cred = existing;
                cred.secret = secret;
                cred.weight = weight;
            }
            inner.credentials.push(cred);
        }
        tracing::info!(count = inner.credentials.len(), "Credential pool loaded");
    }

    fn build_credentials(&self, out: &mut Vec<Credential>, provider: &str, entries: &[KeyEntry]) {
        for (idx, entry) in entries.iter().enumerate() {
            let (id, secret, weight) = match entry {
                KeyEntry::Secret(secret) => (None, secret.clone(), 1.0),
                KeyEntry::Detailed { id, secret, weight } => {
                    (id.clone(), secret.clone(), weight.unwrap_or(1.0))
                }
            };
            let id = id.unwrap_or_else(|| format!("{}-{}", provider.trim_start_matches('_').trim_end_matches('_'), idx + 1));
            if weight <= 0.0 {
                tracing::warn!(credential = %id, weight, "Ignoring credential with non-positive weight");
                continue;
            }
            out.push(Credential::new(
                id,
                secret,
                provider.to_string(),
                weight,
                self.max_concurrency_per_key,
                self.breaker.failure_threshold,
                Duration::from_millis(self.breaker.cooldown_period_ms),
            ));
        }
    }

    /// Select and reserve the best available credential for a provider.
    ///
    /// Returns `None` when every matching credential is attempted,
    /// saturated, rate-limited, or circuit-broken, or when the total
    /// concurrency budget is spent — the caller must queue.
    pub async fn acquire_key(
        &self,
        attempted: &HashSet<String>,
        provider_name: &str,
    ) -> Option<AcquiredKey> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let total_in_flight: u32 = inner.credentials.iter().map(|c| c.in_flight).sum();
        if total_in_flight >= self.max_total_concurrency {
            return None;
        }

        let mut candidates: Vec<usize> = Vec::new();
        for (idx, cred) in inner.credentials.iter_mut().enumerate() {
            // Untagged keys serve the default provider.
            let provider_matches = cred.provider_name == provider_name
                || (cred.provider_name == UNTAGGED_PROVIDER
                    && provider_name == crate::providers::DEFAULT_PROVIDER);
            if !provider_matches {
                continue;
            }
            if attempted.contains(&cred.id) {
                continue;
            }
            if !cred.can_acquire(now) {
                continue;
            }
            candidates.push(idx);
        }

        // Highest score wins; ties break on credential id so identical
        // stats always produce the same pick.
        candidates.sort_by(|&a, &b| {
            let (sa, sb) = (
                score(&inner.credentials[a]),
                score(&inner.credentials[b]),
            );
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| inner.credentials[a].id.cmp(&inner.credentials[b].id))
        });

        for idx in candidates {
            let cred = &mut inner.credentials[idx];
            if cred.try_acquire(now) {
                return Some(AcquiredKey {
                    credential_id: cred.id.clone(),
                    secret: cred.secret.clone(),
                    provider_name: cred.provider_name.clone(),
                });
            }
        }
        None
    }

    pub async fn record_success(&self, credential_id: &str, latency_ms: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if let Some(cred) = inner.credentials.iter_mut().find(|c| c.id == credential_id) {
            cred.release(ReleaseOutcome::Success { latency_ms }, now);
        }
    }

    pub async fn record_failure(&self, credential_id: &str, kind: ErrorKind) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if let Some(cred) = inner.credentials.iter_mut().find(|c| c.id == credential_id) {
            cred.release(ReleaseOutcome::Failure { kind }, now);
            if cred.circuit.state(now) == CircuitState::Open {
                tracing::warn!(
                    credential = %credential_id,
                    consecutive_failures = cred.circuit.consecutive_failures,
                    kind = %kind,
                    "Circuit breaker open"
                );
            }
        }
    }

    /// Release after a 429: the slot frees, the credential sits out
    /// `retry_after`, and the breaker is left alone.
    pub async fn record_rate_limit(&self, credential_id: &str, retry_after: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if let Some(cred) = inner.credentials.iter_mut().find(|c| c.id == credential_id) {
            cred.release(ReleaseOutcome::RateLimited, now);
            let candidate = now + retry_after;
            cred.rate_limited_until = Some(match cred.rate_limited_until {
                Some(existing) => existing.max(candidate),
                None => candidate,
            });
        }
    }

    /// Release after a downstream disconnect; counts as nothing.
    pub async fn record_client_abort(&self, credential_id: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if let Some(cred) = inner.credentials.iter_mut().find(|c| c.id == credential_id) {
            cred.release(ReleaseOutcome::ClientAborted, now);
        }
    }

    pub async fn total_in_flight(&self) -> u32 {
        let inner = self.inner.lock().await;
        inner.credentials.iter().map(|c| c.in_flight).sum()
    }

    /// Per-provider rollup used by the `/stats` providerHealth block.
    pub async fn provider_health_stats(&self) -> HashMap<String, ProviderHealth> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mut out: HashMap<String, ProviderHealth> = HashMap::new();
        let mut requests: HashMap<String, (u64, u64)> = HashMap::new();
        for cred in inner.credentials.iter_mut() {
            let entry = out.entry(cred.provider_name.clone()).or_default();
            entry.total += 1;
            entry.in_flight += cred.in_flight;
            if cred.can_acquire(now) {
                entry.available += 1;
            }
            if cred.circuit.state(now) == CircuitState::Open {
                entry.open_circuits += 1;
            }
            let r = requests.entry(cred.provider_name.clone()).or_default();
            r.0 += cred.stats.total_requests;
            r.1 += cred.stats.failures;
        }
        for (provider, health) in out.iter_mut() {
            if let Some(&(total, failures)) = requests.get(provider) {
                if total > 0 {
                    health.error_rate = failures as f64 / total as f64;
                }
            }
        }
        out
    }

    pub async fn snapshots(&self) -> Vec<CredentialSnapshot> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner
            .credentials
            .iter_mut()
            .map(|c| c.snapshot(now))
            .collect()
    }
}

/// Selection score: weight scaled by health, penalized for saturation and
/// recent failures, with a small bonus for fast credentials. The exact
/// coefficients matter less than the ordering properties: identical stats
/// select deterministically, and a freshly failed credential sorts last.
fn score(cred: &Credential) -> f64 {
    let saturation = cred.in_flight as f64 / cred.max_concurrency.max(1) as f64;
    cred.weight * (1.0 - cred.error_rate())
        - SATURATION_PENALTY * saturation
        - FAILURE_PENALTY * cred.stats.failure_ewma
        + LATENCY_BONUS / (1.0 + cred.stats.latency_ewma_ms / 1_000.0)
}
