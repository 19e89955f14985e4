//! Per-platform circuit breakers.
//!
//! Each platform gets its own [`CircuitBreaker`]; every transition of a breaker
//! happens under that breaker's mutex, so state changes are linearizable per
//! platform while different platforms never contend.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::taxonomy::NotifyError;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast, no calls reach the platform.
    Open,
    /// Letting a bounded number of probes through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before probing, in milliseconds.
    pub cooldown_ms: u64,
    /// Probe attempts allowed while half-open.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 60_000,
            half_open_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, cooldown: Duration, half_open_probes: u32) -> Self {
        Self {
            failure_threshold,
            cooldown_ms: cooldown.as_millis() as u64,
            half_open_probes,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if self.half_open_probes == 0 {
            return Err("half_open_probes must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Admission for one attempt, handed back when its outcome is recorded.
///
/// A permit remembers the breaker generation it was issued in, so an outcome
/// that arrives after the breaker moved on can neither change its state nor
/// free a probe slot it never held.
#[derive(Debug)]
#[must_use = "a permit must be handed back with the attempt outcome"]
pub struct BreakerPermit {
    probe: bool,
    generation: u64,
}

impl BreakerPermit {
    /// Whether this permit holds a half-open probe slot.
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub platform: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_probes_issued: u32,
    pub last_transition: DateTime<Utc>,
    /// Times the breaker went from closed or half-open to open.
    pub times_opened: u64,
    /// Attempts rejected with `CircuitOpen`.
    pub rejected: u64,
}

struct BreakerState {
    state: CircuitState,
    /// Bumped on every transition; permits from an older generation are stale.
    generation: u64,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_issued: u32,
    last_transition: DateTime<Utc>,
    times_opened: u64,
    rejected: u64,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.generation += 1;
        self.last_transition = Utc::now();
        self.probes_issued = 0;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.times_opened += 1;
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {}
        }
    }
}

/// Circuit breaker for one platform.
pub struct CircuitBreaker {
    platform: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(platform: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            platform: platform.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                consecutive_failures: 0,
                opened_at: None,
                probes_issued: 0,
                last_transition: Utc::now(),
                times_opened: 0,
                rejected: 0,
            }),
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, moving Open to HalfOpen if the cooldown has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_cooldown(&mut inner);
        inner.state
    }

    /// Ask permission for one attempt.
    ///
    /// Fails with `CircuitOpen` while open, and while half-open once every
    /// probe slot is taken.
    pub fn try_acquire(&self) -> Result<BreakerPermit, NotifyError> {
        let mut inner = self.inner.lock();
        self.check_cooldown(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit {
                probe: false,
                generation: inner.generation,
            }),
            CircuitState::HalfOpen if inner.probes_issued < self.config.half_open_probes => {
                inner.probes_issued += 1;
                debug!(
                    platform = %self.platform,
                    probe = inner.probes_issued,
                    max_probes = self.config.half_open_probes,
                    "Circuit breaker allowing half-open probe"
                );
                Ok(BreakerPermit {
                    probe: true,
                    generation: inner.generation,
                })
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.rejected += 1;
                Err(NotifyError::circuit_open(&self.platform))
            }
        }
    }

    /// Record a successful attempt.
    pub fn record_success(&self, permit: BreakerPermit) {
        let mut inner = self.inner.lock();
        if !self.is_current(&inner, &permit) {
            return;
        }
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.transition(CircuitState::Closed);
                info!(platform = %self.platform, "Circuit breaker closed after successful probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Record an attempt that failed in a way that reflects platform health.
    pub fn record_failure(&self, permit: BreakerPermit) {
        let mut inner = self.inner.lock();
        if !self.is_current(&inner, &permit) {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let failures = inner.consecutive_failures;
                    inner.transition(CircuitState::Open);
                    warn!(
                        platform = %self.platform,
                        failures,
                        cooldown_ms = self.config.cooldown_ms,
                        "Circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                inner.transition(CircuitState::Open);
                warn!(
                    platform = %self.platform,
                    cooldown_ms = self.config.cooldown_ms,
                    "Circuit breaker reopened after failed probe"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Record an attempt whose outcome says nothing about platform health.
    ///
    /// Frees the probe slot if the permit held one.
    pub fn record_neutral(&self, permit: BreakerPermit) {
        let mut inner = self.inner.lock();
        if permit.probe
            && self.is_current(&inner, &permit)
            && inner.state == CircuitState::HalfOpen
        {
            inner.probes_issued = inner.probes_issued.saturating_sub(1);
        }
    }

    /// Report an attempt outcome, routing errors by whether they reflect
    /// platform health.
    pub fn record_outcome(&self, permit: BreakerPermit, error: Option<&NotifyError>) {
        match error {
            None => self.record_success(permit),
            Some(err) if err.code().affects_platform_health() => self.record_failure(permit),
            Some(_) => self.record_neutral(permit),
        }
    }

    fn is_current(&self, inner: &BreakerState, permit: &BreakerPermit) -> bool {
        if permit.generation == inner.generation {
            return true;
        }
        debug!(
            platform = %self.platform,
            permit_generation = permit.generation,
            generation = inner.generation,
            "Ignoring outcome from a previous breaker state"
        );
        false
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed);
        info!(platform = %self.platform, "Circuit breaker reset");
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock();
        self.check_cooldown(&mut inner);
        CircuitBreakerSnapshot {
            platform: self.platform.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_probes_issued: inner.probes_issued,
            last_transition: inner.last_transition,
            times_opened: inner.times_opened,
            rejected: inner.rejected,
        }
    }

    fn check_cooldown(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.cooldown()
        {
            inner.transition(CircuitState::HalfOpen);
            info!(platform = %self.platform, "Circuit breaker half-open, probing");
        }
    }
}

/// Lazily created breakers keyed by platform name.
pub struct CircuitBreakerSet {
    default: CircuitBreakerConfig,
    overrides: RwLock<HashMap<String, CircuitBreakerConfig>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerSet {
    pub fn new(default: CircuitBreakerConfig) -> Self {
        Self::with_overrides(default, HashMap::new())
    }

    pub fn with_overrides(
        default: CircuitBreakerConfig,
        overrides: HashMap<String, CircuitBreakerConfig>,
    ) -> Self {
        Self {
            default,
            overrides: RwLock::new(overrides),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config_for(&self, platform: &str) -> CircuitBreakerConfig {
        self.overrides
            .read()
            .get(platform)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Get or create the breaker for a platform.
    pub fn get(&self, platform: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(platform) {
                return breaker.clone();
            }
        }

        let config = self.config_for(platform);
        let mut breakers = self.breakers.write();
        breakers
            .entry(platform.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(platform, config)))
            .clone()
    }

    /// Install an override; any existing breaker for the platform is replaced
    /// with a fresh closed one.
    pub fn set_config(&self, platform: impl Into<String>, config: CircuitBreakerConfig) {
        let platform = platform.into();
        self.breakers.write().remove(&platform);
        self.overrides.write().insert(platform, config);
    }

    /// State of a platform's breaker, `None` if it was never used.
    pub fn state(&self, platform: &str) -> Option<CircuitState> {
        self.breakers.read().get(platform).map(|b| b.state())
    }

    /// Reset one breaker. Returns false if the platform has none.
    pub fn reset(&self, platform: &str) -> bool {
        match self.breakers.read().get(platform) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    /// Snapshot every breaker, sorted by platform name.
    pub fn snapshot(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.read().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.platform.cmp(&b.platform));
        snapshots
    }
}

impl Default for CircuitBreakerSet {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
