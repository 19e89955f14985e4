//! Retry decisions and backoff computation.
//!
//! [`decide`] is a pure function of the classified error, the number of
//! attempts already made and the policy. [`RetryEngine`] adds per-platform
//! policy overrides on top of a default policy.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::taxonomy::NotifyError;

/// How the base delay grows with each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `min(base * multiplier^n, max)`
    #[default]
    Exponential,
    /// `min(base * (n + 1), max)`
    Linear,
    /// `base`
    Fixed,
}

/// Randomization applied after the base delay is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterType {
    None,
    /// `delay * (1 ± jitter_fraction)`
    #[default]
    Uniform,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[base, previous * 3]`.
    Decorrelated,
}

/// Retry policy for dispatch attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts allowed per target, the first one included.
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any computed delay in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor for exponential backoff.
    pub multiplier: f64,
    pub strategy: BackoffStrategy,
    pub jitter: JitterType,
    /// Spread used by [`JitterType::Uniform`].
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            multiplier: 2.0,
            strategy: BackoffStrategy::Exponential,
            jitter: JitterType::Uniform,
            jitter_fraction: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self::with_max_attempts(1)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retry number `retry_index` (0-based) without jitter.
    pub fn backoff(&self, retry_index: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let max = self.max_delay_ms as f64;
        let delay_ms = match self.strategy {
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
                (base * self.multiplier.powi(exponent)).min(max)
            }
            BackoffStrategy::Linear => (base * (f64::from(retry_index) + 1.0)).min(max),
            BackoffStrategy::Fixed => base,
        };
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Apply the configured jitter to `delay`.
    ///
    /// `previous` is the delay used before the previous retry; only the
    /// decorrelated mode looks at it.
    pub fn jittered(&self, delay: Duration, previous: Option<Duration>) -> Duration {
        let max = self.max_delay_ms as f64;
        let delay_ms = delay.as_millis() as f64;
        let r = rand::random::<f64>();

        let jittered_ms = match self.jitter {
            JitterType::None => return delay,
            JitterType::Uniform => {
                let fraction = self.jitter_fraction.clamp(0.0, 1.0);
                delay_ms * (1.0 + fraction * (2.0 * r - 1.0))
            }
            JitterType::Full => delay_ms * r,
            JitterType::Decorrelated => {
                let base = self.base_delay_ms as f64;
                let previous_ms = previous.map(|p| p.as_millis() as f64).unwrap_or(base);
                let upper = (previous_ms * 3.0).max(base);
                base + r * (upper - base)
            }
        };

        Duration::from_millis(jittered_ms.clamp(0.0, max) as u64)
    }

    /// Backoff plus jitter for retry number `retry_index`.
    pub fn delay_for(&self, retry_index: u32, previous: Option<Duration>) -> Duration {
        self.jittered(self.backoff(retry_index), previous)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            ));
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(format!("multiplier must be >= 1.0, got {}", self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(format!(
                "jitter_fraction must be within [0, 1], got {}",
                self.jitter_fraction
            ));
        }
        Ok(())
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn stop() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

/// Decide whether to retry after `attempt` attempts ended with `error`.
///
/// Non-retryable codes stop immediately regardless of the remaining budget.
/// A rate limit hint carried by the error raises the delay to at least the hint,
/// still bounded by `max_delay`.
pub fn decide(
    error: &NotifyError,
    attempt: u32,
    previous_delay: Option<Duration>,
    policy: &RetryPolicy,
) -> RetryDecision {
    if !error.is_retryable() || !policy.should_retry(attempt) {
        return RetryDecision::stop();
    }

    let retry_index = attempt.saturating_sub(1);
    let mut delay = policy.delay_for(retry_index, previous_delay);
    if let Some(hint) = error.retry_after() {
        delay = delay.max(hint).min(policy.max_delay());
    }
    RetryDecision::after(delay)
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn wait(delay: Duration, cancel: &CancellationToken) -> Result<(), NotifyError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NotifyError::cancelled("cancelled during retry backoff")),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Transient retry bookkeeping for one target.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    attempts: u32,
    last_delay: Option<Duration>,
    history: Vec<NotifyError>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_error(&mut self, error: NotifyError) {
        self.history.push(error);
    }

    pub fn record_delay(&mut self, delay: Duration) {
        self.last_delay = Some(delay);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    pub fn last_error(&self) -> Option<&NotifyError> {
        self.history.last()
    }

    pub fn history(&self) -> &[NotifyError] {
        &self.history
    }

    pub fn into_history(self) -> Vec<NotifyError> {
        self.history
    }
}

/// Default retry policy plus per-platform overrides.
pub struct RetryEngine {
    default: RetryPolicy,
    overrides: RwLock<HashMap<String, RetryPolicy>>,
}

impl RetryEngine {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_overrides(default: RetryPolicy, overrides: HashMap<String, RetryPolicy>) -> Self {
        Self {
            default,
            overrides: RwLock::new(overrides),
        }
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default
    }

    pub fn set_policy(&self, platform: impl Into<String>, policy: RetryPolicy) {
        self.overrides.write().insert(platform.into(), policy);
    }

    pub fn remove_policy(&self, platform: &str) -> Option<RetryPolicy> {
        self.overrides.write().remove(platform)
    }

    /// Effective policy for a platform.
    pub fn policy_for(&self, platform: &str) -> RetryPolicy {
        self.overrides
            .read()
            .get(platform)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Decide using the effective policy of `platform` and the target's state.
    pub fn decide_for(&self, platform: &str, error: &NotifyError, state: &RetryState) -> RetryDecision {
        let policy = self.policy_for(platform);
        decide(error, state.attempts(), state.last_delay(), &policy)
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
