//! Per-provider circuit breakers
//!
//! Each provider gets a three-state health machine: `closed` admits all
//! requests, `open` rejects everything until a cooldown passes, `half_open`
//! admits a bounded probe whose outcome decides the next state. Only
//! provider-side failures (5xx, network, timeout) count toward opening; a
//! single caller's bad prompt must never poison a provider for everyone.
//!
//! One process owns its breaker state. Snapshots can be persisted for
//! diagnostics but are not authoritative across restarts or nodes.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects before the first probe.
    pub cooldown: Duration,
    /// Probes admitted while half-open before the outcome is known.
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            half_open_max_probes: 1,
        }
    }
}

/// Diagnostic view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    half_open_since: Option<DateTime<Utc>>,
    half_open_probes: u32,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_time: None,
            last_success_time: None,
            opened_at: None,
            half_open_since: None,
            half_open_probes: 0,
        }
    }
}

/// Circuit breaker for a single provider.
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    fn new(provider: String, config: BreakerConfig) -> Self {
        Self {
            provider,
            config,
            core: Mutex::new(BreakerCore::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a request may be attempted right now. An expired cooldown
    /// moves the breaker to half-open and admits the caller as the probe.
    pub fn can_attempt(&self) -> bool {
        let mut core = self.lock();
        let now = Utc::now();

        match core.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled_down = core
                    .opened_at
                    .map(|t| now.signed_duration_since(t).to_std().unwrap_or_default())
                    .map(|elapsed| elapsed >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    core.state = BreakerState::HalfOpen;
                    core.half_open_since = Some(now);
                    core.half_open_probes = 1;
                    info!(provider = %self.provider, "circuit breaker half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if core.half_open_probes < self.config.half_open_max_probes {
                    core.half_open_probes += 1;
                    return true;
                }
                // A probe that never reported (e.g. the caller went away)
                // must not wedge the breaker: after another cooldown, admit
                // a fresh probe.
                let stale = core
                    .half_open_since
                    .map(|t| now.signed_duration_since(t).to_std().unwrap_or_default())
                    .map(|elapsed| elapsed >= self.config.cooldown)
                    .unwrap_or(true);
                if stale {
                    core.half_open_since = Some(now);
                    core.half_open_probes = 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful attempt: the counter resets and the breaker
    /// closes (a success observed while open means the provider recovered
    /// under an in-flight straggler).
    pub fn record_success(&self) {
        let mut core = self.lock();
        core.failure_count = 0;
        core.last_failure_time = None;
        core.last_success_time = Some(Utc::now());
        if core.state != BreakerState::Closed {
            info!(provider = %self.provider, "circuit breaker closed after successful request");
        }
        core.state = BreakerState::Closed;
        core.opened_at = None;
        core.half_open_since = None;
        core.half_open_probes = 0;
    }

    /// Record a failed attempt. A closed breaker opens at the threshold; a
    /// half-open probe failure re-opens with `opened_at` re-stamped so the
    /// next cooldown starts now.
    pub fn record_failure(&self) {
        let mut core = self.lock();
        let now = Utc::now();
        core.failure_count += 1;
        core.last_failure_time = Some(now);

        match core.state {
            BreakerState::Closed => {
                if core.failure_count >= self.config.failure_threshold {
                    core.state = BreakerState::Open;
                    core.opened_at = Some(now);
                    warn!(
                        provider = %self.provider,
                        failures = core.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                core.state = BreakerState::Open;
                core.opened_at = Some(now);
                core.half_open_since = None;
                core.half_open_probes = 0;
                warn!(provider = %self.provider, "half-open probe failed, circuit breaker re-opened");
            }
            BreakerState::Open => {}
        }
    }

    /// Operator override: force the breaker closed and clear all counters,
    /// stamping a synthetic success.
    pub fn reset(&self) {
        let mut core = self.lock();
        core.state = BreakerState::Closed;
        core.failure_count = 0;
        core.last_failure_time = None;
        core.last_success_time = Some(Utc::now());
        core.opened_at = None;
        core.half_open_since = None;
        core.half_open_probes = 0;
        info!(provider = %self.provider, "circuit breaker reset by operator");
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let core = self.lock();
        BreakerSnapshot {
            provider: self.provider.clone(),
            state: core.state,
            failure_count: core.failure_count,
            last_failure_time: core.last_failure_time,
            last_success_time: core.last_success_time,
            opened_at: core.opened_at,
        }
    }
}

/// Process-wide map from provider name to its breaker.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// The process-wide registry with default tuning. Admin endpoints
    /// inspect this instance; everything else takes an `Arc` to it.
    pub fn global() -> Arc<BreakerRegistry> {
        static GLOBAL: OnceLock<Arc<BreakerRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(BreakerRegistry::new(BreakerConfig::default())))
            .clone()
    }

    /// Breaker for a provider, created on first use.
    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider.to_string(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub fn can_attempt(&self, provider: &str) -> bool {
        self.breaker(provider).can_attempt()
    }

    pub fn record_success(&self, provider: &str) {
        self.breaker(provider).record_success();
    }

    pub fn record_failure(&self, provider: &str) {
        self.breaker(provider).record_failure();
    }

    pub fn reset(&self, provider: &str) {
        self.breaker(provider).reset();
    }

    pub fn state(&self, provider: &str) -> BreakerState {
        self.breaker(provider).state()
    }

    /// Snapshots of every breaker seen so far, for diagnostics persistence
    /// and the admin surface.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker_with(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test".to_string(),
            BreakerConfig {
                failure_threshold: threshold,
                cooldown,
                half_open_max_probes: 1,
            },
        )
    }

    #[test]
    fn opens_at_failure_threshold() {
        let breaker = breaker_with(5, Duration::from_secs(60));
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_attempt());

        breaker.record_failure();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Open);
        assert!(snapshot.opened_at.is_some());
        assert_eq!(snapshot.failure_count, 5);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn success_resets_counter_below_threshold() {
        let breaker = breaker_with(5, Duration::from_secs(60));
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.snapshot().opened_at.is_none());
    }

    #[test]
    fn cooldown_expiry_admits_half_open_probe() {
        let breaker = breaker_with(1, Duration::from_millis(0));
        breaker.record_failure();
        // Zero cooldown: the very next admission check flips to half-open.
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_budget_limits_concurrent_probes() {
        let breaker = breaker_with(1, Duration::from_millis(50));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(60));

        // First caller becomes the probe; the budget of one rejects the
        // second until the probe reports (or another cooldown passes).
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn half_open_success_closes() {
        let breaker = breaker_with(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.can_attempt());
        breaker.record_success();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert!(snapshot.opened_at.is_none());
        assert!(snapshot.last_success_time.is_some());
    }

    #[test]
    fn half_open_failure_reopens_and_restamps() {
        let breaker = breaker_with(1, Duration::from_millis(0));
        breaker.record_failure();
        let first_opened = breaker.snapshot().opened_at.unwrap();

        assert!(breaker.can_attempt());
        std::thread::sleep(Duration::from_millis(5));
        breaker.record_failure();

        let snapshot = breaker.snapshot();
        // Re-opened, not stuck half-open, and the cooldown restarts now.
        assert_eq!(snapshot.state, BreakerState::Open);
        assert!(snapshot.opened_at.unwrap() > first_opened);
    }

    #[test]
    fn reset_forces_closed_from_any_state() {
        let breaker = breaker_with(1, Duration::from_secs(60));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.reset();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert!(snapshot.opened_at.is_none());
        assert!(snapshot.last_success_time.is_some());
        assert!(breaker.can_attempt());
    }

    #[test]
    fn registry_tracks_providers_independently() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
            half_open_max_probes: 1,
        });

        registry.record_failure("openai");
        assert_eq!(registry.state("openai"), BreakerState::Open);
        assert_eq!(registry.state("deepseek"), BreakerState::Closed);
        assert!(!registry.can_attempt("openai"));
        assert!(registry.can_attempt("deepseek"));

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].provider, "deepseek");
        assert_eq!(snapshots[1].provider, "openai");
    }
}
