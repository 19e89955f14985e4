//! Outcome callbacks.
//!
//! Callbacks are registered globally or per message in a [`CallbackRegistry`]
//! and run by a [`CallbackExecutor`] on its own worker pool, so triggering one
//! never waits on user code. Every invocation runs inside a panic boundary with
//! its own timeout and retry policy; invocations that exhaust their retries end
//! up as dead letters.

mod chain;
mod executor;
mod registry;
mod stats;

pub use chain::CallbackChain;
pub use executor::{CallbackExecutor, CallbackExecutorConfig, DeadLetter};
pub use registry::{
    CallbackRecord, CallbackRegistry, CallbackStatus, ExecutionAttempt, Registration,
};
pub use stats::{CallbackStats, CallbackStatsSnapshot, KindStats};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Message, SendResult};
use crate::retry::{BackoffStrategy, JitterType, RetryPolicy};
use crate::taxonomy::NotifyError;

/// Which event a callback reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    Result,
    Error,
    Progress,
}

impl CallbackKind {
    pub const ALL: [CallbackKind; 3] = [Self::Result, Self::Error, Self::Progress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Result => "result",
            Self::Error => "error",
            Self::Progress => "progress",
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a fan-out send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// Payload delivered to callbacks.
#[derive(Debug, Clone)]
pub enum CallbackEvent {
    /// A target reached a terminal state.
    Result(SendResult),
    /// A target failed or was cancelled.
    Error {
        message: Arc<Message>,
        error: NotifyError,
    },
    /// Another target of a message settled.
    Progress {
        message_id: String,
        progress: Progress,
    },
}

impl CallbackEvent {
    pub fn kind(&self) -> CallbackKind {
        match self {
            Self::Result(_) => CallbackKind::Result,
            Self::Error { .. } => CallbackKind::Error,
            Self::Progress { .. } => CallbackKind::Progress,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Self::Result(result) => &result.message_id,
            Self::Error { message, .. } => &message.id,
            Self::Progress { message_id, .. } => message_id,
        }
    }
}

pub type CallbackFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type ResultFn = Arc<dyn Fn(SendResult) -> CallbackFuture + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(Arc<Message>, NotifyError) -> CallbackFuture + Send + Sync>;
pub type ProgressFn = Arc<dyn Fn(String, Progress) -> CallbackFuture + Send + Sync>;
/// Predicate deciding whether a callback runs for an event.
pub type Condition = Arc<dyn Fn(&CallbackEvent) -> bool + Send + Sync>;

/// The user function behind a callback.
#[derive(Clone)]
pub enum CallbackHandler {
    Result(ResultFn),
    Error(ErrorFn),
    Progress(ProgressFn),
}

impl CallbackHandler {
    pub fn kind(&self) -> CallbackKind {
        match self {
            Self::Result(_) => CallbackKind::Result,
            Self::Error(_) => CallbackKind::Error,
            Self::Progress(_) => CallbackKind::Progress,
        }
    }
}

/// Retry policy for failing callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackRetryPolicy {
    /// Retries after the first execution.
    pub max_retries: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for CallbackRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_interval_ms: 100,
            max_interval_ms: 5000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl CallbackRetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// The equivalent dispatch retry policy, used for backoff computation.
    pub fn as_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.saturating_add(1),
            base_delay_ms: self.initial_interval_ms,
            max_delay_ms: self.max_interval_ms.max(self.initial_interval_ms),
            multiplier: self.multiplier.max(1.0),
            strategy: BackoffStrategy::Exponential,
            jitter: if self.jitter {
                JitterType::Uniform
            } else {
                JitterType::None
            },
            jitter_fraction: 0.25,
        }
    }

    /// Delay before retry number `retry_index` (0-based).
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        self.as_retry_policy().delay_for(retry_index, None)
    }
}

/// A registered callback.
#[derive(Clone)]
pub struct Callback {
    id: String,
    handler: CallbackHandler,
    /// Higher runs first within a chain or registration list.
    pub priority: i32,
    pub timeout: Duration,
    pub retry_policy: CallbackRetryPolicy,
    pub metadata: HashMap<String, String>,
    condition: Option<Condition>,
}

impl Callback {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    fn with_handler(handler: CallbackHandler) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            handler,
            priority: 0,
            timeout: Self::DEFAULT_TIMEOUT,
            retry_policy: CallbackRetryPolicy::default(),
            metadata: HashMap::new(),
            condition: None,
        }
    }

    /// Callback for terminal per-target results.
    pub fn on_result<F, Fut>(f: F) -> Self
    where
        F: Fn(SendResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::with_handler(CallbackHandler::Result(Arc::new(
            move |result: SendResult| -> CallbackFuture { Box::pin(f(result)) },
        )))
    }

    /// Callback for failed or cancelled targets.
    pub fn on_error<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Message>, NotifyError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::with_handler(CallbackHandler::Error(Arc::new(
            move |message: Arc<Message>, error: NotifyError| -> CallbackFuture {
                Box::pin(f(message, error))
            },
        )))
    }

    /// Callback for fan-out progress.
    pub fn on_progress<F, Fut>(f: F) -> Self
    where
        F: Fn(String, Progress) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::with_handler(CallbackHandler::Progress(Arc::new(
            move |message_id: String, progress: Progress| -> CallbackFuture {
                Box::pin(f(message_id, progress))
            },
        )))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: CallbackRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Only run when `condition` holds for the event.
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&CallbackEvent) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> CallbackKind {
        self.handler.kind()
    }

    /// Whether this callback reacts to `event` at all.
    pub(crate) fn handles(&self, event: &CallbackEvent) -> bool {
        self.kind() == event.kind()
    }

    /// Evaluate the condition; a missing condition always passes.
    pub(crate) fn condition_holds(&self, event: &CallbackEvent) -> bool {
        self.condition.as_ref().is_none_or(|condition| condition(event))
    }

    /// Start the user function for `event`.
    ///
    /// Returns `None` when the event kind does not match the handler.
    pub(crate) fn invoke(&self, event: CallbackEvent) -> Option<CallbackFuture> {
        match (&self.handler, event) {
            (CallbackHandler::Result(f), CallbackEvent::Result(result)) => Some(f(result)),
            (CallbackHandler::Error(f), CallbackEvent::Error { message, error }) => {
                Some(f(message, error))
            }
            (
                CallbackHandler::Progress(f),
                CallbackEvent::Progress {
                    message_id,
                    progress,
                },
            ) => Some(f(message_id, progress)),
            _ => None,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Target;

    fn progress_event() -> CallbackEvent {
        CallbackEvent::Progress {
            message_id: "m1".to_string(),
            progress: Progress {
                completed: 1,
                total: 2,
            },
        }
    }

    #[test]
    fn test_callback_defaults() {
        let cb = Callback::on_progress(|_, _| async { Ok(()) });
        assert_eq!(cb.kind(), CallbackKind::Progress);
        assert_eq!(cb.priority, 0);
        assert_eq!(cb.timeout, Duration::from_secs(5));
        assert!(!cb.id().is_empty());
        assert!(cb.condition_holds(&progress_event()));
    }

    #[test]
    fn test_handles_only_matching_kind() {
        let cb = Callback::on_result(|_| async { Ok(()) });
        assert!(!cb.handles(&progress_event()));
        assert!(cb.invoke(progress_event()).is_none());

        let target = Target::user("sms", "+1");
        let result = SendResult::undelivered(
            "m1",
            &target,
            1,
            vec![],
            Duration::ZERO,
            NotifyError::cancelled("stop"),
        );
        assert!(cb.handles(&CallbackEvent::Result(result)));
    }

    #[test]
    fn test_condition() {
        let cb = Callback::on_progress(|_, _| async { Ok(()) }).when(|event| match event {
            CallbackEvent::Progress { progress, .. } => progress.completed == progress.total,
            _ => false,
        });
        assert!(!cb.condition_holds(&progress_event()));
    }

    #[test]
    fn test_retry_policy_conversion() {
        let policy = CallbackRetryPolicy {
            max_retries: 3,
            initial_interval_ms: 10,
            max_interval_ms: 40,
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.as_retry_policy().max_attempts, 4);
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(5), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_invoke_runs_user_function() {
        let cb = Callback::on_progress(|id, progress| async move {
            anyhow::ensure!(id == "m1" && progress.total == 2, "unexpected event");
            Ok(())
        });
        let future = cb.invoke(progress_event()).unwrap();
        assert!(future.await.is_ok());
    }
}
