//! Per-(provider, model) rate-limit tracking: exponential backoff on 429s,
//! decay after quiet periods, and proactive pacing derived from
//! `x-ratelimit-remaining` headers.
//!
//! A 429 on one pool never affects another pool's window, and a
//! late-arriving shorter cooldown can never shorten an existing longer one.
//! Pools are created lazily on first hit and kept for the life of the
//! process so their counters stay visible in stats.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{PacingConfig, PoolCooldownConfig};

/// Ceiling on the consecutive-hit exponent.
pub const MAX_POOL_COUNT: u32 = 10;

#[derive(Debug, Default)]
struct ModelPool {
    cooldown_until: Option<Instant>,
    count: u32,
    last_hit_at: Option<Instant>,
    pacing_until: Option<Instant>,
    last_rate_limit_remaining: Option<u64>,
    last_rate_limit_limit: Option<u64>,
    last_rate_limit_reset: Option<u64>,
    total_hits: u64,
}

impl ModelPool {
    fn remaining(&self, now: Instant) -> Duration {
        let cooldown = self
            .cooldown_until
            .and_then(|until| until.checked_duration_since(now))
            .unwrap_or_default();
        let pacing = self
            .pacing_until
            .and_then(|until| until.checked_duration_since(now))
            .unwrap_or_default();
        cooldown.max(pacing)
    }
}

/// Result of recording a 429 against a pool.
#[derive(Debug, Clone, Copy)]
pub struct HitRecord {
    pub cooldown_ms: u64,
    pub count: u32,
    /// Whether the pool was already inside a cooldown window when the hit
    /// landed.
    pub was_already_blocked: bool,
}

/// Rate-limit header values observed on an upstream response.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitHeaders {
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    pub reset: Option<u64>,
}

/// Observability snapshot of one pool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub provider: String,
    pub model: String,
    pub remaining_ms: u64,
    pub count: u32,
    pub total_hits: u64,
    pub last_rate_limit_remaining: Option<u64>,
    pub last_rate_limit_limit: Option<u64>,
    pub last_rate_limit_reset: Option<u64>,
}

/// Tracks 429 backoff and header-driven pacing per (provider, model) pool.
#[derive(Debug)]
pub struct PoolCooldownEngine {
    pools: Mutex<HashMap<(String, String), ModelPool>>,
    cooldown: PoolCooldownConfig,
    pacing: PacingConfig,
}

impl PoolCooldownEngine {
    pub fn new(cooldown: PoolCooldownConfig, pacing: PacingConfig) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            cooldown,
            pacing,
        }
    }

    /// Record a 429 for the pool and compute its next cooldown window.
    ///
    /// The consecutive-hit count decays to zero after a quiet period of
    /// `decay_ms`, is capped at [`MAX_POOL_COUNT`], and drives exponential
    /// backoff `base · 2^(count−1)` capped at `cap_ms`, with ±15 % jitter.
    /// The resulting window only ever extends the existing one.
    pub async fn record_hit(&self, provider: &str, model: &str) -> HitRecord {
        let now = Instant::now();
        let mut pools = self.pools.lock().await;
        let pool = pools
            .entry((provider.to_string(), model.to_string()))
            .or_default();

        if let Some(last_hit) = pool.last_hit_at {
            if now.duration_since(last_hit) > Duration::from_millis(self.cooldown.decay_ms) {
                pool.count = 0;
            }
        }
        pool.count = (pool.count + 1).min(MAX_POOL_COUNT);
        pool.total_hits += 1;

        let base = self.cooldown.base_ms.saturating_mul(1u64 << (pool.count - 1).min(32));
        let capped = base.min(self.cooldown.cap_ms).min(self.cooldown.max_cooldown_ms);
        let jitter: f64 = rand::thread_rng().gen_range(0.85..=1.15);
        let cooldown_ms = ((capped as f64) * jitter) as u64;

        let was_already_blocked = pool
            .cooldown_until
            .map(|until| until > now)
            .unwrap_or(false);

        let candidate = now + Duration::from_millis(cooldown_ms);
        pool.cooldown_until = Some(match pool.cooldown_until {
            Some(existing) => existing.max(candidate),
            None => candidate,
        });
        pool.last_hit_at = Some(now);

        tracing::info!(
            provider,
            model,
            count = pool.count,
            cooldown_ms,
            was_already_blocked,
            "Pool rate limited"
        );

        HitRecord {
            cooldown_ms,
            count: pool.count,
            was_already_blocked,
        }
    }

    /// Store observed rate-limit headers and, when the remaining quota is at
    /// or below the pacing threshold, extend the pool's pacing window. The
    /// delay scales linearly as remaining approaches zero and never shortens
    /// an existing cooldown or pacing window.
    pub async fn record_headers(&self, provider: &str, model: &str, headers: RateLimitHeaders) {
        let now = Instant::now();
        let mut pools = self.pools.lock().await;
        let pool = pools
            .entry((provider.to_string(), model.to_string()))
            .or_default();

        if headers.remaining.is_some() {
            pool.last_rate_limit_remaining = headers.remaining;
        }
        if headers.limit.is_some() {
            pool.last_rate_limit_limit = headers.limit;
        }
        if headers.reset.is_some() {
            pool.last_rate_limit_reset = headers.reset;
        }

        if !self.pacing.enabled {
            return;
        }
        let Some(remaining) = headers.remaining else {
            return;
        };
        let threshold = self.pacing.remaining_threshold;
        if remaining > threshold {
            return;
        }

        let delay_ms = self.pacing.pacing_delay_ms * (threshold - remaining + 1) / (threshold + 1);
        let candidate = now + Duration::from_millis(delay_ms);
        pool.pacing_until = Some(match pool.pacing_until {
            Some(existing) => existing.max(candidate),
            None => candidate,
        });

        tracing::debug!(provider, model, remaining, delay_ms, "Proactive pacing applied");
    }

    /// Remaining block time for one pool: the larger of cooldown and pacing.
    pub async fn remaining_for(&self, provider: &str, model: &str) -> Duration {
        let now = Instant::now();
        let pools = self.pools.lock().await;
        pools
            .get(&(provider.to_string(), model.to_string()))
            .map(|pool| pool.remaining(now))
            .unwrap_or_default()
    }

    /// The longest remaining block across all pools.
    pub async fn any_remaining(&self) -> Duration {
        let now = Instant::now();
        let pools = self.pools.lock().await;
        pools
            .values()
            .map(|pool| pool.remaining(now))
            .max()
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> Vec<PoolSnapshot> {
        let now = Instant::now();
        let pools = self.pools.lock().await;
        let mut out: Vec<PoolSnapshot> = pools
            .iter()
            .map(|((provider, model), pool)| PoolSnapshot {
                provider: provider.clone(),
                model: model.clone(),
                remaining_ms: pool.remaining(now).as_millis() as u64,
                count: pool.count,
                total_hits: pool.total_hits,
                last_rate_limit_remaining: pool.last_rate_limit_remaining,
                last_rate_limit_limit: pool.last_rate_limit_limit,
                last_rate_limit_reset: pool.last_rate_limit_reset,
            })
            .collect();
        out.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(base_ms: u64, cap_ms: u64, decay_ms: u64) -> PoolCooldownEngine {
        PoolCooldownEngine::new(
            PoolCooldownConfig {
                base_ms,
                cap_ms,
                decay_ms,
                max_cooldown_ms: 60_000,
                ..PoolCooldownConfig::default()
            },
            PacingConfig::default(),
        )
    }

    fn assert_within_jitter(actual_ms: u64, nominal_ms: u64) {
        let lo = (nominal_ms as f64 * 0.85) as u64;
        let hi = (nominal_ms as f64 * 1.15).ceil() as u64;
        assert!(
            (lo..=hi).contains(&actual_ms),
            "{} outside [{}, {}] for nominal {}",
            actual_ms,
            lo,
            hi,
            nominal_ms
        );
    }

    #[tokio::test]
    async fn backoff_ladder_doubles_then_caps() {
        let engine = engine(500, 2_000, 60_000);
        let mut nominals = vec![500u64, 1_000, 2_000];
        nominals.extend(std::iter::repeat(2_000).take(7));
        for (i, nominal) in nominals.into_iter().enumerate() {
            let hit = engine.record_hit("zai", "glm-4.6").await;
            assert_within_jitter(hit.cooldown_ms, nominal);
            assert_eq!(hit.count as usize, (i + 1).min(MAX_POOL_COUNT as usize));
        }
    }

    #[tokio::test]
    async fn count_never_exceeds_max() {
        let engine = engine(100, 200, 60_000);
        for _ in 0..25 {
            let hit = engine.record_hit("zai", "glm-4.6").await;
            assert!(hit.count <= MAX_POOL_COUNT);
        }
    }

    #[tokio::test]
    async fn pools_are_isolated() {
        let engine = engine(500, 15_000, 60_000);
        engine.record_hit("zai", "glm-4.7").await;
        let a = engine.remaining_for("zai", "glm-4.7").await;
        let b = engine.remaining_for("zai", "glm-4.6").await;
        assert!(a > Duration::ZERO);
        assert_eq!(b, Duration::ZERO);
    }

    #[tokio::test]
    async fn repeated_hits_never_shorten_the_window() {
        let engine = engine(5_000, 15_000, 60_000);
        engine.record_hit("zai", "glm-4.6").await;
        let first = engine.remaining_for("zai", "glm-4.6").await;
        // A second hit computes a larger window; the merged window must not
        // be shorter than what was already in place.
        engine.record_hit("zai", "glm-4.6").await;
        let second = engine.remaining_for("zai", "glm-4.6").await;
        assert!(second >= first - Duration::from_millis(50));
    }

    #[tokio::test]
    async fn second_hit_reports_already_blocked() {
        let engine = engine(5_000, 15_000, 60_000);
        let first = engine.record_hit("zai", "glm-4.6").await;
        assert!(!first.was_already_blocked);
        let second = engine.record_hit("zai", "glm-4.6").await;
        assert!(second.was_already_blocked);
    }

    #[tokio::test]
    async fn pacing_applies_linear_delay_at_threshold() {
        let engine = PoolCooldownEngine::new(
            PoolCooldownConfig::default(),
            PacingConfig {
                enabled: true,
                remaining_threshold: 15,
                pacing_delay_ms: 500,
            },
        );
        // remaining == 0 → full delay.
        engine
            .record_headers(
                "zai",
                "glm-4.6",
                RateLimitHeaders {
                    remaining: Some(0),
                    limit: Some(100),
                    reset: None,
                },
            )
            .await;
        let remaining = engine.remaining_for("zai", "glm-4.6").await;
        assert!(remaining >= Duration::from_millis(400));
        assert!(remaining <= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn pacing_above_threshold_is_a_no_op() {
        let engine = PoolCooldownEngine::new(PoolCooldownConfig::default(), PacingConfig::default());
        engine
            .record_headers(
                "zai",
                "glm-4.6",
                RateLimitHeaders {
                    remaining: Some(5_000),
                    limit: Some(10_000),
                    reset: None,
                },
            )
            .await;
        assert_eq!(
            engine.remaining_for("zai", "glm-4.6").await,
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn pacing_never_shortens_existing_cooldown() {
        let engine = engine(10_000, 15_000, 60_000);
        engine.record_hit("zai", "glm-4.6").await;
        let before = engine.remaining_for("zai", "glm-4.6").await;
        engine
            .record_headers(
                "zai",
                "glm-4.6",
                RateLimitHeaders {
                    remaining: Some(1),
                    limit: Some(100),
                    reset: None,
                },
            )
            .await;
        let after = engine.remaining_for("zai", "glm-4.6").await;
        assert!(after >= before - Duration::from_millis(50));
    }

    #[tokio::test]
    async fn any_remaining_is_the_max_across_pools() {
        let engine = engine(500, 15_000, 60_000);
        engine.record_hit("zai", "glm-4.5-air").await;
        engine.record_hit("zai", "glm-4.7").await;
        engine.record_hit("zai", "glm-4.7").await;
        let any = engine.any_remaining().await;
        let heavy = engine.remaining_for("zai", "glm-4.7").await;
        assert_eq!(any, heavy);
    }

    #[tokio::test]
    async fn count_decays_after_quiet_period() {
        let engine = engine(500, 15_000, 0);
        let first = engine.record_hit("zai", "glm-4.6").await;
        assert_eq!(first.count, 1);
        // decay_ms == 0 means any elapsed time resets the streak.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = engine.record_hit("zai", "glm-4.6").await;
        assert_eq!(second.count, 1);
    }
}
