//! Per-upstream-model cooldowns for the router.
//!
//! Distinct from the pool cooldown engine (which is per provider pool):
//! these windows stop the router from failing over onto a model that was
//! itself just rate-limited. When a burst of concurrent in-flight requests
//! all hit 429 near-simultaneously, the duplicates are dampened so the
//! burst registers as a single backoff step instead of N.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::config::ModelCooldownConfig;

#[derive(Debug, Clone)]
struct CooldownEntry {
    cooldown_until: Instant,
    count: u32,
    /// Whether the most recent record was burst-dampened.
    burst_dampened: bool,
    last_recorded_at: Instant,
}

/// Result of recording a model cooldown.
#[derive(Debug, Clone, Copy)]
pub struct CooldownRecord {
    pub cooldown_ms: u64,
    pub count: u32,
    pub burst_dampened: bool,
}

/// Observability view of one active cooldown.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCooldownSnapshot {
    pub model: String,
    pub remaining_ms: u64,
    pub count: u32,
    pub burst_dampened: bool,
}

/// Owned by the router, mutated under its lock.
#[derive(Debug, Default)]
pub struct ModelCooldownMap {
    entries: HashMap<String, CooldownEntry>,
}

impl ModelCooldownMap {
    /// Record a 429 against `model`. `force_dampened` lets the caller mark
    /// a record as part of a known burst; otherwise dampening is detected
    /// from the configured burst window.
    pub fn record(
        &mut self,
        model: &str,
        config: &ModelCooldownConfig,
        force_dampened: bool,
        now: Instant,
    ) -> CooldownRecord {
        self.evict_expired(config, now);

        let (count, dampened) = match self.entries.get(model) {
            Some(existing) => {
                let since_last = now.duration_since(existing.last_recorded_at);
                if force_dampened || since_last < Duration::from_millis(config.burst_window_ms) {
                    (existing.count.max(1), true)
                } else if since_last > Duration::from_millis(config.decay_ms) {
                    (1, false)
                } else {
                    (existing.count + 1, false)
                }
            }
            None => (1, force_dampened),
        };

        let exponent = count.saturating_sub(1).min(16);
        let cooldown_ms = ((config.default_ms as f64)
            * config.backoff_multiplier.powi(exponent as i32))
        .min(config.max_ms as f64) as u64;
        let candidate = now + Duration::from_millis(cooldown_ms);

        let entry = self
            .entries
            .entry(model.to_string())
            .or_insert_with(|| CooldownEntry {
                cooldown_until: candidate,
                count,
                burst_dampened: dampened,
                last_recorded_at: now,
            });
        entry.count = count;
        entry.burst_dampened = dampened;
        entry.last_recorded_at = now;
        // Monotone: a shorter window never replaces a longer one.
        entry.cooldown_until = entry.cooldown_until.max(candidate);

        CooldownRecord {
            cooldown_ms,
            count,
            burst_dampened: dampened,
        }
    }

    /// Remaining cooldown for a model, if it is currently blocked.
    pub fn remaining(&self, model: &str, now: Instant) -> Option<Duration> {
        self.entries
            .get(model)
            .and_then(|e| e.cooldown_until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    pub fn count_for(&self, model: &str) -> u32 {
        self.entries.get(model).map(|e| e.count).unwrap_or(0)
    }

    /// Active cooldowns, longest remaining first.
    pub fn snapshot(&self, now: Instant) -> Vec<ModelCooldownSnapshot> {
        let mut out: Vec<ModelCooldownSnapshot> = self
            .entries
            .iter()
            .filter_map(|(model, entry)| {
                entry.cooldown_until.checked_duration_since(now).map(|rem| {
                    ModelCooldownSnapshot {
                        model: model.clone(),
                        remaining_ms: rem.as_millis() as u64,
                        count: entry.count,
                        burst_dampened: entry.burst_dampened,
                    }
                })
            })
            .filter(|s| s.remaining_ms > 0)
            .collect();
        out.sort_by(|a, b| b.remaining_ms.cmp(&a.remaining_ms).then(a.model.cmp(&b.model)));
        out
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Keep the map bounded: expired entries are dropped once the entry
    /// count passes the configured cap.
    fn evict_expired(&mut self, config: &ModelCooldownConfig, now: Instant) {
        if self.entries.len() < config.max_cooldown_entries {
            return;
        }
        self.entries.retain(|_, e| e.cooldown_until > now);
    }
}
