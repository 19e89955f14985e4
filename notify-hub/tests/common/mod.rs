//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use notify_hub::retry::{BackoffStrategy, JitterType};
use notify_hub::{HubConfig, Message, NotifyError, Platform, PlatformReceipt, Target};
use parking_lot::Mutex;

type Script = dyn Fn(&Target, u32) -> Result<PlatformReceipt, NotifyError> + Send + Sync;

/// Platform whose outcome is decided by a script given the target and the
/// 1-based call number for that (message, target) pair.
pub struct MockPlatform {
    name: String,
    script: Box<Script>,
    delay: Duration,
    calls: AtomicU32,
    per_target: Mutex<HashMap<(String, String), u32>>,
}

impl MockPlatform {
    pub fn new<F>(name: &str, script: F) -> Self
    where
        F: Fn(&Target, u32) -> Result<PlatformReceipt, NotifyError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            script: Box::new(script),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            per_target: Mutex::new(HashMap::new()),
        }
    }

    pub fn succeeding(name: &str) -> Self {
        Self::new(name, |_, _| Ok(PlatformReceipt::with_external_id("ok")))
    }

    /// Fails the first `failures` calls for every target with a retryable
    /// error, then succeeds.
    pub fn failing_times(name: &str, failures: u32) -> Self {
        let platform = name.to_string();
        Self::new(name, move |_, call| {
            if call <= failures {
                Err(NotifyError::platform_unavailable(&platform, "temporarily down"))
            } else {
                Ok(PlatformReceipt::with_external_id(format!("call-{call}")))
            }
        })
    }

    pub fn always_failing(name: &str, error: NotifyError) -> Self {
        Self::new(name, move |_, _| Err(error.clone()))
    }

    /// Each call takes `delay` before the script runs.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &Message, target: &Target) -> Result<PlatformReceipt, NotifyError> {
        let call = {
            let mut per_target = self.per_target.lock();
            let count = per_target
                .entry((message.id.clone(), target.value.clone()))
                .or_insert(0);
            *count += 1;
            *count
        };
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(target, call)
    }
}

/// Config with millisecond retry delays and no jitter.
pub fn fast_config() -> HubConfig {
    let mut config = HubConfig::default();
    config.retry.default.base_delay_ms = 1;
    config.retry.default.max_delay_ms = 10;
    config.retry.default.strategy = BackoffStrategy::Fixed;
    config.retry.default.jitter = JitterType::None;
    config.attempt_timeout_ms = 2_000;
    config.callbacks.retention_ms = 60_000;
    config
}

pub fn message_to(platform: &str, recipient: &str) -> Message {
    Message::builder()
        .title("test")
        .body(format!("hello {recipient}"))
        .target(Target::user(platform, recipient))
        .build()
        .unwrap()
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
