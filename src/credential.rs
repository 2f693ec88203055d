//! A single upstream credential: identity, in-flight counter, circuit
//! breaker, and rolling statistics.
//!
//! All mutation happens under the [`KeyManager`](crate::key_manager)'s lock;
//! this module only defines the state machine and its invariants. The
//! in-flight counter is touched exclusively by `try_acquire`/`release`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::ErrorKind;

/// Ring buffer length for recent outcome display.
const RECENT_OUTCOMES: usize = 50;

/// Smoothing factor for the latency and failure EWMAs.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-credential circuit breaker.
///
/// Closed → Open after `failure_threshold` consecutive failures; Open →
/// HalfOpen once `cooldown_period` has elapsed; HalfOpen admits exactly one
/// probe, whose outcome closes or re-opens the circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    pub consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    failure_threshold: u32,
    cooldown_period: Duration,
    /// Recent outcomes, newest last; `true` = success.
    recent: VecDeque<bool>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_period: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            failure_threshold,
            cooldown_period,
            recent: VecDeque::with_capacity(RECENT_OUTCOMES),
        }
    }

    /// Advance Open → HalfOpen when the cooldown has elapsed.
    fn tick(&mut self, now: Instant) {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if now.duration_since(opened_at) >= self.cooldown_period {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = false;
                }
            }
        }
    }

    /// Whether an acquire may pass the breaker right now. A HalfOpen circuit
    /// admits one probe; this marks the probe as taken.
    fn admit(&mut self, now: Instant) -> bool {
        self.tick(now);
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Like [`admit`](Self::admit) but without consuming the half-open
    /// probe; used for candidate filtering before a slot is reserved.
    fn would_admit(&mut self, now: Instant) -> bool {
        self.tick(now);
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !self.probe_in_flight,
        }
    }

    fn record_success(&mut self) {
        self.push_outcome(true);
        self.consecutive_failures = 0;
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.opened_at = None;
        }
        self.probe_in_flight = false;
    }

    fn record_failure(&mut self, now: Instant) {
        self.push_outcome(false);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state == CircuitState::HalfOpen
            || self.consecutive_failures >= self.failure_threshold
        {
            self.trip(now);
        }
        self.probe_in_flight = false;
    }

    /// Open immediately, regardless of the failure count.
    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn push_outcome(&mut self, success: bool) {
        if self.recent.len() == RECENT_OUTCOMES {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
    }

    pub fn state(&mut self, now: Instant) -> CircuitState {
        self.tick(now);
        self.state
    }

    /// Failure fraction over the recent-outcome window (0.0 when empty).
    pub fn error_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|&&ok| !ok).count();
        failures as f64 / self.recent.len() as f64
    }
}

/// Cumulative and rolling statistics for one credential.
#[derive(Debug, Clone, Default)]
pub struct CredentialStats {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_used_at: Option<Instant>,
    /// Sliding EWMA of observed latency in milliseconds.
    pub latency_ewma_ms: f64,
    /// EWMA of the failure indicator (1.0 = failing constantly).
    pub failure_ewma: f64,
}

impl CredentialStats {
    fn record(&mut self, success: bool, latency_ms: Option<u64>, now: Instant) {
        self.total_requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.last_used_at = Some(now);
        let indicator = if success { 0.0 } else { 1.0 };
        self.failure_ewma = EWMA_ALPHA * indicator + (1.0 - EWMA_ALPHA) * self.failure_ewma;
        if let Some(ms) = latency_ms {
            if self.latency_ewma_ms == 0.0 {
                self.latency_ewma_ms = ms as f64;
            } else {
                self.latency_ewma_ms =
                    EWMA_ALPHA * ms as f64 + (1.0 - EWMA_ALPHA) * self.latency_ewma_ms;
            }
        }
    }
}

/// The outcome fed back into a credential on release.
#[derive(Debug, Clone, Copy)]
pub enum ReleaseOutcome {
    Success { latency_ms: u64 },
    Failure { kind: ErrorKind },
    /// 429: slot released, `rate_limited_until` set elsewhere, breaker
    /// untouched.
    RateLimited,
    /// Downstream disconnect: slot released, nothing counted.
    ClientAborted,
}

/// One upstream credential and its mutable dispatch state.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub secret: String,
    pub provider_name: String,
    pub weight: f64,
    pub max_concurrency: u32,
    pub in_flight: u32,
    pub circuit: CircuitBreaker,
    /// Set when the upstream explicitly rate-limited this credential;
    /// distinct from the per-model pool cooldown.
    pub rate_limited_until: Option<Instant>,
    pub stats: CredentialStats,
}

impl Credential {
    pub fn new(
        id: String,
        secret: String,
        provider_name: String,
        weight: f64,
        max_concurrency: u32,
        failure_threshold: u32,
        cooldown_period: Duration,
    ) -> Self {
        Self {
            id,
            secret,
            provider_name,
            weight,
            max_concurrency,
            in_flight: 0,
            circuit: CircuitBreaker::new(failure_threshold, cooldown_period),
            rate_limited_until: None,
            stats: CredentialStats::default(),
        }
    }

    /// Whether an acquire would currently succeed, without reserving the
    /// slot or consuming a half-open probe.
    pub fn can_acquire(&mut self, now: Instant) -> bool {
        if self.in_flight >= self.max_concurrency {
            return false;
        }
        if let Some(until) = self.rate_limited_until {
            if now < until {
                return false;
            }
        }
        self.circuit.would_admit(now)
    }

    /// Attempt to reserve a slot. Fails when the credential is saturated,
    /// its breaker is open, or it is in an explicit rate-limit window.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.in_flight >= self.max_concurrency {
            return false;
        }
        if let Some(until) = self.rate_limited_until {
            if now < until {
                return false;
            }
            self.rate_limited_until = None;
        }
        if !self.circuit.admit(now) {
            return false;
        }
        self.in_flight += 1;
        true
    }

    /// Release a slot and fold the outcome into stats and the breaker.
    pub fn release(&mut self, outcome: ReleaseOutcome, now: Instant) {
        debug_assert!(self.in_flight > 0, "release without acquire");
        self.in_flight = self.in_flight.saturating_sub(1);
        match outcome {
            ReleaseOutcome::Success { latency_ms } => {
                self.stats.record(true, Some(latency_ms), now);
                self.circuit.record_success();
            }
            ReleaseOutcome::Failure { kind } => {
                self.stats.record(false, None, now);
                if kind == ErrorKind::AuthError {
                    // A rejected key will not start working by itself.
                    self.stats.failure_ewma = 1.0;
                    self.circuit.record_failure(now);
                    self.circuit.trip(now);
                } else if kind.counts_as_breaker_failure() {
                    self.circuit.record_failure(now);
                }
            }
            ReleaseOutcome::RateLimited => {
                // Counted by the pool cooldown engine, not the breaker.
                self.stats.last_used_at = Some(now);
                self.circuit.probe_in_flight = false;
            }
            ReleaseOutcome::ClientAborted => {
                self.stats.last_used_at = Some(now);
                self.circuit.probe_in_flight = false;
            }
        }
    }

    pub fn error_rate(&self) -> f64 {
        self.circuit.error_rate()
    }

    pub fn snapshot(&mut self, now: Instant) -> CredentialSnapshot {
        CredentialSnapshot {
            id: self.id.clone(),
            provider_name: self.provider_name.clone(),
            weight: self.weight,
            in_flight: self.in_flight,
            max_concurrency: self.max_concurrency,
            circuit_state: self.circuit.state(now),
            consecutive_failures: self.circuit.consecutive_failures,
            rate_limited_remaining_ms: self
                .rate_limited_until
                .and_then(|until| until.checked_duration_since(now))
                .map(|d| d.as_millis() as u64),
            total_requests: self.stats.total_requests,
            successes: self.stats.successes,
            failures: self.stats.failures,
            error_rate: self.error_rate(),
            latency_ewma_ms: self.stats.latency_ewma_ms,
        }
    }
}

/// Read-only view of a credential for observability. The secret never
/// leaves the key manager.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSnapshot {
    pub id: String,
    pub provider_name: String,
    pub weight: f64,
    pub in_flight: u32,
    pub max_concurrency: u32,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub rate_limited_remaining_ms: Option<u64>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub error_rate: f64,
    pub latency_ewma_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credential(max_concurrency: u32) -> Credential {
        Credential::new(
            "key-1".to_string(),
            "sk-test".to_string(),
            "zai".to_string(),
            1.0,
            max_concurrency,
            5,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn acquire_respects_concurrency_bound() {
        let mut cred = test_credential(2);
        let now = Instant::now();
        assert!(cred.try_acquire(now));
        assert!(cred.try_acquire(now));
        assert!(!cred.try_acquire(now));
        assert_eq!(cred.in_flight, 2);
        cred.release(ReleaseOutcome::Success { latency_ms: 10 }, now);
        assert!(cred.try_acquire(now));
    }

    #[test]
    fn breaker_opens_after_threshold_and_recovers_via_probe() {
        let mut cred = test_credential(5);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(cred.try_acquire(now));
            cred.release(
                ReleaseOutcome::Failure {
                    kind: ErrorKind::ServerError,
                },
                now,
            );
        }
        assert_eq!(cred.circuit.state(now), CircuitState::Open);
        assert!(!cred.try_acquire(now));

        // After the cooldown, one probe is admitted; a second is not.
        let later = now + Duration::from_secs(61);
        assert!(cred.try_acquire(later));
        assert_eq!(cred.circuit.state(later), CircuitState::HalfOpen);
        assert!(!cred.try_acquire(later));

        cred.release(ReleaseOutcome::Success { latency_ms: 20 }, later);
        assert_eq!(cred.circuit.state(later), CircuitState::Closed);
        assert_eq!(cred.circuit.consecutive_failures, 0);
        assert!(cred.try_acquire(later));
    }

    #[test]
    fn failed_probe_reopens_the_circuit() {
        let mut cred = test_credential(5);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(cred.try_acquire(now));
            cred.release(
                ReleaseOutcome::Failure {
                    kind: ErrorKind::Timeout,
                },
                now,
            );
        }
        let later = now + Duration::from_secs(61);
        assert!(cred.try_acquire(later));
        cred.release(
            ReleaseOutcome::Failure {
                kind: ErrorKind::Timeout,
            },
            later,
        );
        assert_eq!(cred.circuit.state(later), CircuitState::Open);
        assert!(!cred.try_acquire(later));
    }

    #[test]
    fn auth_error_trips_breaker_immediately() {
        let mut cred = test_credential(5);
        let now = Instant::now();
        assert!(cred.try_acquire(now));
        cred.release(
            ReleaseOutcome::Failure {
                kind: ErrorKind::AuthError,
            },
            now,
        );
        assert_eq!(cred.circuit.state(now), CircuitState::Open);
        assert!(!cred.try_acquire(now));
    }

    #[test]
    fn rate_limit_window_blocks_acquire_but_not_breaker() {
        let mut cred = test_credential(5);
        let now = Instant::now();
        assert!(cred.try_acquire(now));
        cred.release(ReleaseOutcome::RateLimited, now);
        cred.rate_limited_until = Some(now + Duration::from_secs(5));
        assert!(!cred.try_acquire(now));
        assert_eq!(cred.circuit.state(now), CircuitState::Closed);
        assert!(cred.try_acquire(now + Duration::from_secs(6)));
    }

    #[test]
    fn client_abort_releases_without_counting() {
        let mut cred = test_credential(5);
        let now = Instant::now();
        assert!(cred.try_acquire(now));
        let failures_before = cred.circuit.consecutive_failures;
        cred.release(ReleaseOutcome::ClientAborted, now);
        assert_eq!(cred.in_flight, 0);
        assert_eq!(cred.circuit.consecutive_failures, failures_before);
        assert_eq!(cred.stats.total_requests, 0);
    }

    #[test]
    fn error_rate_tracks_recent_window() {
        let mut cred = test_credential(10);
        let now = Instant::now();
        for i in 0..4 {
            assert!(cred.try_acquire(now));
            if i % 2 == 0 {
                cred.release(ReleaseOutcome::Success { latency_ms: 5 }, now);
            } else {
                cred.release(
                    ReleaseOutcome::Failure {
                        kind: ErrorKind::ServerError,
                    },
                    now,
                );
            }
        }
        assert!((cred.error_rate() - 0.5).abs() < f64::EPSILON);
    }
}
