//! External notification platforms.
//!
//! A [`Platform`] delivers one message to one target on an external service.
//! Each dispatcher owns its own [`PlatformRegistry`]; there is no process-wide
//! registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::domain::{Message, PlatformReceipt, Target};
use crate::taxonomy::NotifyError;

/// An external notification service.
///
/// Dropping the future returned by [`Platform::send`] cancels the attempt;
/// implementations should not rely on running to completion.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Registry key, matched against [`Target::platform`].
    fn name(&self) -> &str;

    /// Deliver `message` to `target`.
    async fn send(&self, message: &Message, target: &Target) -> Result<PlatformReceipt, NotifyError>;

    /// Check connectivity/credentials.
    async fn health(&self) -> Result<(), NotifyError> {
        Ok(())
    }

    /// Release resources held by the platform.
    async fn shutdown(&self) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Health of one registered platform.
#[derive(Debug, Clone)]
pub struct PlatformHealth {
    pub platform: String,
    pub result: Result<(), NotifyError>,
}

impl PlatformHealth {
    pub fn is_healthy(&self) -> bool {
        self.result.is_ok()
    }
}

/// Platforms known to one dispatcher, keyed by name.
#[derive(Default)]
pub struct PlatformRegistry {
    platforms: RwLock<HashMap<String, Arc<dyn Platform>>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a platform, returning the one it replaced.
    pub fn register(&self, platform: Arc<dyn Platform>) -> Option<Arc<dyn Platform>> {
        let name = platform.name().to_string();
        let previous = self.platforms.write().insert(name.clone(), platform);
        if previous.is_some() {
            info!(platform = %name, "Replaced registered platform");
        } else {
            debug!(platform = %name, "Registered platform");
        }
        previous
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Platform>> {
        let removed = self.platforms.write().remove(name);
        if removed.is_some() {
            debug!(platform = %name, "Unregistered platform");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Platform>> {
        self.platforms.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.platforms.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.platforms.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.platforms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.read().is_empty()
    }

    fn all(&self) -> Vec<Arc<dyn Platform>> {
        self.platforms.read().values().cloned().collect()
    }

    /// Run every platform's health check concurrently.
    pub async fn health_check_all(&self) -> Vec<PlatformHealth> {
        let checks = self.all().into_iter().map(|platform| async move {
            let result = platform.health().await;
            if let Err(e) = &result {
                warn!(platform = %platform.name(), error = %e, "Platform health check failed");
            }
            PlatformHealth {
                platform: platform.name().to_string(),
                result,
            }
        });

        let mut results = join_all(checks).await;
        results.sort_by(|a, b| a.platform.cmp(&b.platform));
        results
    }

    /// Shut down every platform; failures are logged and skipped.
    pub async fn shutdown_all(&self) {
        let shutdowns = self.all().into_iter().map(|platform| async move {
            if let Err(e) = platform.shutdown().await {
                warn!(platform = %platform.name(), error = %e, "Platform shutdown failed");
            }
        });
        join_all(shutdowns).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::ErrorCode;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubPlatform {
        name: &'static str,
        healthy: bool,
        shut_down: AtomicBool,
    }

    impl StubPlatform {
        fn new(name: &'static str, healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                healthy,
                shut_down: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Platform for StubPlatform {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _message: &Message, _target: &Target) -> Result<PlatformReceipt, NotifyError> {
            Ok(PlatformReceipt::default())
        }

        async fn health(&self) -> Result<(), NotifyError> {
            if self.healthy {
                Ok(())
            } else {
                Err(NotifyError::platform_unavailable(self.name, "down"))
            }
        }

        async fn shutdown(&self) -> Result<(), NotifyError> {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_register_and_replace() {
        let registry = PlatformRegistry::new();
        assert!(registry.register(StubPlatform::new("slack", true)).is_none());
        assert!(registry.register(StubPlatform::new("email", true)).is_none());
        assert!(registry.register(StubPlatform::new("slack", false)).is_some());

        assert_eq!(registry.names(), vec!["email", "slack"]);
        assert!(registry.contains("slack"));
        assert!(registry.unregister("slack").is_some());
        assert!(registry.get("slack").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_health_check_all() {
        let registry = PlatformRegistry::new();
        registry.register(StubPlatform::new("a", true));
        registry.register(StubPlatform::new("b", false));

        let health = registry.health_check_all().await;
        assert_eq!(health.len(), 2);
        assert!(health[0].is_healthy());
        assert_eq!(
            health[1].result.as_ref().unwrap_err().code(),
            ErrorCode::PlatformUnavailable
        );
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let registry = PlatformRegistry::new();
        let a = StubPlatform::new("a", true);
        registry.register(a.clone());
        registry.shutdown_all().await;
        assert!(a.shut_down.load(Ordering::SeqCst));
    }
}
