//! Error taxonomy for dispatch failures.
//!
//! Every failure the engine reasons about is a [`NotifyError`] carrying a code
//! from the closed [`ErrorCode`] set. The code fixes the category, severity and
//! retryability, so the retry engine and circuit breakers never look at error
//! strings.
//!
//! | Category | Codes | Retryable |
//! |----------|-------|-----------|
//! | Configuration | `InvalidConfig`, `MissingConfig`, `PlatformNotRegistered` | No |
//! | Platform | `RateLimited`, `PlatformUnavailable`, `PlatformError` | Yes |
//! | Platform | `AuthenticationFailed`, `PermissionDenied`, `CircuitOpen` | No |
//! | Message | `InvalidMessage`, `MessageTooLarge`, `UnsupportedFormat` | No |
//! | Queue | `QueueFull` | Yes |
//! | Queue | `QueueClosed` | No |
//! | Network | `NetworkTimeout`, `ConnectionFailed`, `DnsResolution` | Yes |
//! | Validation | `ValidationFailed`, `InvalidTarget` | No |
//! | System | `SystemOverload` | Yes |
//! | System | `ProcessTimeout`, `Cancelled`, `ShuttingDown`, `Internal` | No |

mod aggregate;

pub use aggregate::{BatchClassification, ErrorAggregator, TargetError};

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Context key holding a rate limit hint in milliseconds.
pub const RETRY_AFTER_MS: &str = "retry_after_ms";

/// Broad grouping of error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Platform,
    Message,
    Queue,
    Network,
    Validation,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Platform => "platform",
            Self::Message => "message",
            Self::Queue => "queue",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::System => "system",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to an error code. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Closed set of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Configuration
    InvalidConfig,
    MissingConfig,
    PlatformNotRegistered,
    // Platform
    AuthenticationFailed,
    PermissionDenied,
    RateLimited,
    PlatformUnavailable,
    PlatformError,
    CircuitOpen,
    // Message
    InvalidMessage,
    MessageTooLarge,
    UnsupportedFormat,
    // Queue
    QueueFull,
    QueueClosed,
    // Network
    NetworkTimeout,
    ConnectionFailed,
    DnsResolution,
    // Validation
    ValidationFailed,
    InvalidTarget,
    // System
    SystemOverload,
    ProcessTimeout,
    Cancelled,
    ShuttingDown,
    Internal,
}

impl ErrorCode {
    /// Every code, in declaration order.
    pub const ALL: [ErrorCode; 24] = [
        Self::InvalidConfig,
        Self::MissingConfig,
        Self::PlatformNotRegistered,
        Self::AuthenticationFailed,
        Self::PermissionDenied,
        Self::RateLimited,
        Self::PlatformUnavailable,
        Self::PlatformError,
        Self::CircuitOpen,
        Self::InvalidMessage,
        Self::MessageTooLarge,
        Self::UnsupportedFormat,
        Self::QueueFull,
        Self::QueueClosed,
        Self::NetworkTimeout,
        Self::ConnectionFailed,
        Self::DnsResolution,
        Self::ValidationFailed,
        Self::InvalidTarget,
        Self::SystemOverload,
        Self::ProcessTimeout,
        Self::Cancelled,
        Self::ShuttingDown,
        Self::Internal,
    ];

    const fn spec(self) -> (ErrorCategory, Severity, bool) {
        use ErrorCategory as C;
        use Severity as S;
        match self {
            Self::InvalidConfig => (C::Configuration, S::Error, false),
            Self::MissingConfig => (C::Configuration, S::Error, false),
            Self::PlatformNotRegistered => (C::Configuration, S::Error, false),
            Self::AuthenticationFailed => (C::Platform, S::Error, false),
            Self::PermissionDenied => (C::Platform, S::Error, false),
            Self::RateLimited => (C::Platform, S::Warn, true),
            Self::PlatformUnavailable => (C::Platform, S::Error, true),
            Self::PlatformError => (C::Platform, S::Warn, true),
            Self::CircuitOpen => (C::Platform, S::Warn, false),
            Self::InvalidMessage => (C::Message, S::Error, false),
            Self::MessageTooLarge => (C::Message, S::Error, false),
            Self::UnsupportedFormat => (C::Message, S::Error, false),
            Self::QueueFull => (C::Queue, S::Warn, true),
            Self::QueueClosed => (C::Queue, S::Error, false),
            Self::NetworkTimeout => (C::Network, S::Warn, true),
            Self::ConnectionFailed => (C::Network, S::Warn, true),
            Self::DnsResolution => (C::Network, S::Warn, true),
            Self::ValidationFailed => (C::Validation, S::Error, false),
            Self::InvalidTarget => (C::Validation, S::Error, false),
            Self::SystemOverload => (C::System, S::Critical, true),
            Self::ProcessTimeout => (C::System, S::Error, false),
            Self::Cancelled => (C::System, S::Info, false),
            Self::ShuttingDown => (C::System, S::Warn, false),
            Self::Internal => (C::System, S::Critical, false),
        }
    }

    pub const fn category(self) -> ErrorCategory {
        self.spec().0
    }

    pub const fn severity(self) -> Severity {
        self.spec().1
    }

    pub const fn is_retryable(self) -> bool {
        self.spec().2
    }

    /// Whether an outcome with this code says something about the health of the
    /// platform that produced it. Codes that don't are neutral for circuit breakers.
    pub const fn affects_platform_health(self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::PlatformUnavailable
                | Self::PlatformError
                | Self::NetworkTimeout
                | Self::ConnectionFailed
                | Self::DnsResolution
                | Self::SystemOverload
                | Self::Internal
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid_config",
            Self::MissingConfig => "missing_config",
            Self::PlatformNotRegistered => "platform_not_registered",
            Self::AuthenticationFailed => "authentication_failed",
            Self::PermissionDenied => "permission_denied",
            Self::RateLimited => "rate_limited",
            Self::PlatformUnavailable => "platform_unavailable",
            Self::PlatformError => "platform_error",
            Self::CircuitOpen => "circuit_open",
            Self::InvalidMessage => "invalid_message",
            Self::MessageTooLarge => "message_too_large",
            Self::UnsupportedFormat => "unsupported_format",
            Self::QueueFull => "queue_full",
            Self::QueueClosed => "queue_closed",
            Self::NetworkTimeout => "network_timeout",
            Self::ConnectionFailed => "connection_failed",
            Self::DnsResolution => "dns_resolution",
            Self::ValidationFailed => "validation_failed",
            Self::InvalidTarget => "invalid_target",
            Self::SystemOverload => "system_overload",
            Self::ProcessTimeout => "process_timeout",
            Self::Cancelled => "cancelled",
            Self::ShuttingDown => "shutting_down",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type SharedCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A classified dispatch error.
///
/// Cheap to clone: the optional underlying cause is reference counted so the
/// same error can sit in a retry history, a [`SendResult`](crate::domain::SendResult)
/// and a callback invocation at once.
#[derive(Debug, Clone, Error)]
#[error("[{code}] {message}")]
pub struct NotifyError {
    code: ErrorCode,
    message: String,
    context: BTreeMap<String, String>,
    occurred_at: DateTime<Utc>,
    #[source]
    cause: Option<SharedCause>,
}

impl NotifyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            occurred_at: Utc::now(),
            cause: None,
        }
    }

    /// Attach a context entry (platform, target, endpoint, ...).
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Wrap an underlying cause.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Minimum wait requested by the platform, if it sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        self.context_value(RETRY_AFTER_MS)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    // ========== Configuration ==========

    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfig, detail)
    }

    pub fn missing_config(key: &str) -> Self {
        Self::new(ErrorCode::MissingConfig, format!("missing configuration: {key}"))
            .with_context("key", key)
    }

    pub fn platform_not_registered(platform: &str) -> Self {
        Self::new(
            ErrorCode::PlatformNotRegistered,
            format!("platform not registered: {platform}"),
        )
        .with_context("platform", platform)
    }

    // ========== Platform ==========

    pub fn authentication_failed(platform: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthenticationFailed, detail).with_context("platform", platform)
    }

    pub fn permission_denied(platform: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, detail).with_context("platform", platform)
    }

    pub fn rate_limited(platform: &str, retry_after: Option<Duration>) -> Self {
        let err = Self::new(ErrorCode::RateLimited, format!("rate limited by {platform}"))
            .with_context("platform", platform);
        match retry_after {
            Some(after) => err.with_context(RETRY_AFTER_MS, after.as_millis()),
            None => err,
        }
    }

    pub fn platform_unavailable(platform: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::PlatformUnavailable, detail).with_context("platform", platform)
    }

    pub fn platform_error(platform: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::PlatformError, detail).with_context("platform", platform)
    }

    pub fn circuit_open(platform: &str) -> Self {
        Self::new(
            ErrorCode::CircuitOpen,
            format!("circuit breaker open for platform {platform}"),
        )
        .with_context("platform", platform)
    }

    // ========== Message ==========

    pub fn invalid_message(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidMessage, detail)
    }

    pub fn message_too_large(size: usize, limit: usize) -> Self {
        Self::new(
            ErrorCode::MessageTooLarge,
            format!("message of {size} bytes exceeds limit of {limit} bytes"),
        )
        .with_context("size", size)
        .with_context("limit", limit)
    }

    pub fn unsupported_format(platform: &str, format: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::UnsupportedFormat,
            format!("{platform} does not support {format} messages"),
        )
        .with_context("platform", platform)
    }

    // ========== Queue ==========

    pub fn queue_full(capacity: usize) -> Self {
        Self::new(
            ErrorCode::QueueFull,
            format!("dispatch queue at capacity ({capacity})"),
        )
        .with_context("capacity", capacity)
    }

    pub fn queue_closed() -> Self {
        Self::new(ErrorCode::QueueClosed, "dispatch queue is closed")
    }

    // ========== Network ==========

    pub fn network_timeout(platform: &str, timeout: Duration) -> Self {
        Self::new(
            ErrorCode::NetworkTimeout,
            format!("{platform} did not respond within {}ms", timeout.as_millis()),
        )
        .with_context("platform", platform)
        .with_context("timeout_ms", timeout.as_millis())
    }

    pub fn connection_failed(platform: &str, endpoint: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionFailed, detail)
            .with_context("platform", platform)
            .with_context("endpoint", endpoint)
    }

    pub fn dns_resolution(platform: &str, host: &str) -> Self {
        Self::new(ErrorCode::DnsResolution, format!("failed to resolve {host}"))
            .with_context("platform", platform)
            .with_context("endpoint", host)
    }

    // ========== Validation ==========

    pub fn validation(field: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, detail).with_context("field", field)
    }

    pub fn invalid_target(target: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidTarget, detail).with_context("target", target)
    }

    // ========== System ==========

    pub fn system_overload(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::SystemOverload, detail)
    }

    pub fn process_timeout(timeout: Duration) -> Self {
        Self::new(
            ErrorCode::ProcessTimeout,
            format!("processing exceeded {}ms", timeout.as_millis()),
        )
        .with_context("timeout_ms", timeout.as_millis())
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, detail)
    }

    pub fn shutting_down() -> Self {
        Self::new(ErrorCode::ShuttingDown, "dispatcher is shutting down")
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, detail)
    }

    /// Convert a recovered panic payload into an `Internal` error.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::internal(format!("panic: {}", panic_message(payload)))
    }
}

impl From<std::io::Error> for NotifyError {
    fn from(err: std::io::Error) -> Self {
        classify_io_error("unknown", err)
    }
}

/// Classify an IO error produced while talking to `platform`.
pub fn classify_io_error(platform: &str, err: std::io::Error) -> NotifyError {
    use std::io::ErrorKind;

    let code = match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ErrorCode::NetworkTimeout,
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => ErrorCode::ConnectionFailed,
        ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
        ErrorKind::InvalidInput | ErrorKind::InvalidData => ErrorCode::InvalidMessage,
        _ => ErrorCode::PlatformError,
    };

    NotifyError::new(code, err.to_string())
        .with_context("platform", platform)
        .with_cause(err)
}

/// Best-effort extraction of a panic payload message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "<non-string panic payload>".to_string()
}

#[derive(Serialize)]
struct NotifyErrorView<'a> {
    code: ErrorCode,
    category: ErrorCategory,
    severity: Severity,
    retryable: bool,
    message: &'a str,
    #[serde(skip_serializing_if = "is_empty_context")]
    context: &'a BTreeMap<String, String>,
    occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
}

fn is_empty_context(context: &&BTreeMap<String, String>) -> bool {
    context.is_empty()
}

impl Serialize for NotifyError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        NotifyErrorView {
            code: self.code,
            category: self.category(),
            severity: self.severity(),
            retryable: self.is_retryable(),
            message: &self.message,
            context: &self.context,
            occurred_at: self.occurred_at,
            cause: self.cause.as_ref().map(|c| c.to_string()),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorCode::NetworkTimeout.is_retryable());
        assert!(ErrorCode::RateLimited.is_retryable());
        assert!(ErrorCode::PlatformUnavailable.is_retryable());
        assert!(ErrorCode::SystemOverload.is_retryable());

        assert!(!ErrorCode::AuthenticationFailed.is_retryable());
        assert!(!ErrorCode::ValidationFailed.is_retryable());
        assert!(!ErrorCode::MessageTooLarge.is_retryable());
        assert!(!ErrorCode::InvalidConfig.is_retryable());
        assert!(!ErrorCode::CircuitOpen.is_retryable());
    }

    #[test]
    fn test_fixed_severities() {
        assert_eq!(ErrorCode::AuthenticationFailed.severity(), Severity::Error);
        assert_eq!(ErrorCode::NetworkTimeout.severity(), Severity::Warn);
        assert_eq!(ErrorCode::SystemOverload.severity(), Severity::Critical);
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Warn > Severity::Info);
    }

    #[test]
    fn test_every_code_has_a_category() {
        for code in ErrorCode::ALL {
            // as_str and category must agree with serde naming
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
            let _ = code.category();
        }
    }

    #[test]
    fn test_cancellation_is_neutral_for_breakers() {
        assert!(!ErrorCode::Cancelled.affects_platform_health());
        assert!(!ErrorCode::ValidationFailed.affects_platform_health());
        assert!(!ErrorCode::CircuitOpen.affects_platform_health());
        assert!(ErrorCode::NetworkTimeout.affects_platform_health());
    }

    #[test]
    fn test_factory_context() {
        let err = NotifyError::network_timeout("slack", Duration::from_millis(1500));
        assert_eq!(err.code(), ErrorCode::NetworkTimeout);
        assert_eq!(err.category(), ErrorCategory::Network);
        assert_eq!(err.context_value("platform"), Some("slack"));
        assert_eq!(err.context_value("timeout_ms"), Some("1500"));
        assert!(err.to_string().starts_with("[network_timeout]"));
    }

    #[test]
    fn test_rate_limit_hint() {
        let err = NotifyError::rate_limited("sms", Some(Duration::from_secs(2)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(NotifyError::rate_limited("sms", None).retry_after(), None);
    }

    #[test]
    fn test_io_classification_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = classify_io_error("email", io);
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.cause().map(|c| c.to_string()), Some("refused".to_string()));
    }

    #[test]
    fn test_panic_payloads() {
        let err = NotifyError::from_panic(&"boom");
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(err.message().contains("boom"));

        let owned: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(owned.as_ref()), "owned boom");
    }

    #[test]
    fn test_serialization_includes_classification() {
        let err = NotifyError::authentication_failed("discord", "bad token");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "authentication_failed");
        assert_eq!(json["category"], "platform");
        assert_eq!(json["severity"], "error");
        assert_eq!(json["retryable"], false);
        assert_eq!(json["context"]["platform"], "discord");
    }
}
