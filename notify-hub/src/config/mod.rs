//! Hub configuration.
//!
//! Every section deserializes with defaults for missing fields, so a config
//! file only needs to name what it changes. Durations are stored as `*_ms`
//! integers.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::callback::CallbackExecutorConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dispatcher::WorkerConfig;
use crate::error::{Error, Result};
use crate::queue::{OverflowPolicy, QueueConfig};
use crate::retry::RetryPolicy;

pub const ENV_WORKERS: &str = "NOTIFY_HUB_WORKERS";
pub const ENV_QUEUE_CAPACITY: &str = "NOTIFY_HUB_QUEUE_CAPACITY";
pub const ENV_OVERFLOW_POLICY: &str = "NOTIFY_HUB_OVERFLOW_POLICY";
pub const ENV_ATTEMPT_TIMEOUT_MS: &str = "NOTIFY_HUB_ATTEMPT_TIMEOUT_MS";
pub const ENV_MAX_ATTEMPTS: &str = "NOTIFY_HUB_MAX_ATTEMPTS";

/// Default retry policy plus per-platform overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub default: RetryPolicy,
    pub platforms: HashMap<String, RetryPolicy>,
}

/// Default breaker settings plus per-platform overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub default: CircuitBreakerConfig,
    pub platforms: HashMap<String, CircuitBreakerConfig>,
}

/// Configuration for one dispatcher instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub callbacks: CallbackExecutorConfig,
    /// Upper bound for a single platform call.
    pub attempt_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            callbacks: CallbackExecutorConfig::default(),
            attempt_timeout_ms: 30_000,
        }
    }
}

impl HubConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&contents)?;
        debug!(path = %path.display(), "Loaded hub config");
        Ok(config)
    }

    /// Override fields from `NOTIFY_HUB_*` environment variables.
    ///
    /// Supported env vars:
    /// - `NOTIFY_HUB_WORKERS`
    /// - `NOTIFY_HUB_QUEUE_CAPACITY`
    /// - `NOTIFY_HUB_OVERFLOW_POLICY` (`reject`, `block`, `drop_oldest`)
    /// - `NOTIFY_HUB_ATTEMPT_TIMEOUT_MS`
    /// - `NOTIFY_HUB_MAX_ATTEMPTS` (default retry policy only)
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = var(ENV_WORKERS) {
            self.worker.concurrency = parse_var(ENV_WORKERS, &value)?;
        }
        if let Some(value) = var(ENV_QUEUE_CAPACITY) {
            self.queue.capacity = parse_var(ENV_QUEUE_CAPACITY, &value)?;
        }
        if let Some(value) = var(ENV_OVERFLOW_POLICY) {
            self.queue.overflow_policy = value
                .parse::<OverflowPolicy>()
                .map_err(|e| Error::config(format!("{ENV_OVERFLOW_POLICY}: {e}")))?;
        }
        if let Some(value) = var(ENV_ATTEMPT_TIMEOUT_MS) {
            self.attempt_timeout_ms = parse_var(ENV_ATTEMPT_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = var(ENV_MAX_ATTEMPTS) {
            self.retry.default.max_attempts = parse_var(ENV_MAX_ATTEMPTS, &value)?;
        }
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(Error::config("queue capacity must be at least 1"));
        }
        if self.worker.concurrency == 0 {
            return Err(Error::config("worker concurrency must be at least 1"));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(Error::config("attempt_timeout_ms must be positive"));
        }

        self.retry
            .default
            .validate()
            .map_err(|e| Error::config(format!("retry.default: {e}")))?;
        for (platform, policy) in &self.retry.platforms {
            policy
                .validate()
                .map_err(|e| Error::config(format!("retry.platforms.{platform}: {e}")))?;
        }

        self.circuit_breaker
            .default
            .validate()
            .map_err(|e| Error::config(format!("circuit_breaker.default: {e}")))?;
        for (platform, config) in &self.circuit_breaker.platforms {
            config.validate().map_err(|e| {
                Error::config(format!("circuit_breaker.platforms.{platform}: {e}"))
            })?;
        }

        self.callbacks
            .validate()
            .map_err(|e| Error::config(format!("callbacks: {e}")))?;
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| Error::config(format!("{key}={value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{BackoffStrategy, JitterType};
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = HubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.attempt_timeout(), Duration::from_secs(30));
        assert_eq!(config.queue.overflow_policy, OverflowPolicy::Reject);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = HubConfig::from_json_str(
            r#"{
                "queue": { "capacity": 10, "overflow_policy": "drop_oldest" },
                "retry": {
                    "default": { "max_attempts": 5, "strategy": "linear", "jitter": "none" },
                    "platforms": { "sms": { "max_attempts": 1 } }
                },
                "circuit_breaker": { "platforms": { "email": { "failure_threshold": 2 } } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.queue.capacity, 10);
        assert_eq!(config.queue.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.queue.warning_threshold, QueueConfig::default().warning_threshold);
        assert_eq!(config.retry.default.max_attempts, 5);
        assert_eq!(config.retry.default.strategy, BackoffStrategy::Linear);
        assert_eq!(config.retry.default.jitter, JitterType::None);
        assert_eq!(config.retry.platforms["sms"].max_attempts, 1);
        assert_eq!(config.circuit_breaker.platforms["email"].failure_threshold, 2);
        assert_eq!(config.worker.concurrency, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HubConfig::default();
        config.queue.capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = HubConfig::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.circuit_breaker.default.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.retry.default.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.retry.default.base_delay_ms = 10_000;
        config.retry.default.max_delay_ms = 1_000;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config
            .retry
            .platforms
            .insert("sms".to_string(), RetryPolicy { multiplier: 0.1, ..Default::default() });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.platforms.sms"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_WORKERS, "8"),
            (ENV_QUEUE_CAPACITY, "64"),
            (ENV_OVERFLOW_POLICY, "block"),
            (ENV_ATTEMPT_TIMEOUT_MS, "1500"),
            (ENV_MAX_ATTEMPTS, "7"),
        ]);
        let mut config = HubConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.queue.capacity, 64);
        assert_eq!(config.queue.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.attempt_timeout(), Duration::from_millis(1500));
        assert_eq!(config.retry.default.max_attempts, 7);
    }

    #[test]
    fn test_env_override_invalid_value() {
        let mut config = HubConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_WORKERS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_WORKERS));

        let mut config = HubConfig::default();
        assert!(
            config
                .apply_overrides(|key| (key == ENV_OVERFLOW_POLICY).then(|| "sideways".to_string()))
                .is_err()
        );
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "worker": {{ "concurrency": 2 }}, "attempt_timeout_ms": 250 }}"#).unwrap();

        let config = HubConfig::from_file(file.path()).unwrap();
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.attempt_timeout(), Duration::from_millis(250));

        assert!(matches!(
            HubConfig::from_file(file.path().with_extension("missing")),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            HubConfig::from_json_str("{ not json"),
            Err(Error::Serialization(_))
        ));
    }
}
