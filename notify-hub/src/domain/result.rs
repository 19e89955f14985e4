//! Per-target delivery outcomes.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Target;
use crate::taxonomy::NotifyError;

/// Lifecycle of a single (message, target) delivery.
///
/// `Pending -> Attempting -> {Success | Retrying -> Attempting | Failed}`;
/// `Cancelled` can interrupt any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    Attempting,
    Retrying,
    Success,
    Failed,
    Cancelled,
}

impl TargetState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// What a platform reports back on a successful send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformReceipt {
    /// Identifier assigned by the external service, if any.
    pub external_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl PlatformReceipt {
    pub fn with_external_id(id: impl Into<String>) -> Self {
        Self {
            external_id: Some(id.into()),
            metadata: HashMap::new(),
        }
    }
}

/// Terminal outcome for one (message, target) pair.
#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub message_id: String,
    pub target: Target,
    pub platform: String,
    pub success: bool,
    pub state: TargetState,
    /// Final classified error, `None` on success.
    pub error: Option<NotifyError>,
    /// Every classified error seen across attempts, oldest first.
    pub error_history: Vec<NotifyError>,
    /// Number of calls that reached the platform.
    pub attempts: u32,
    /// Wall time from the first attempt to the terminal state.
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    pub receipt: Option<PlatformReceipt>,
}

impl SendResult {
    pub(crate) fn delivered(
        message_id: &str,
        target: &Target,
        attempts: u32,
        error_history: Vec<NotifyError>,
        duration: Duration,
        receipt: PlatformReceipt,
    ) -> Self {
        Self {
            message_id: message_id.to_string(),
            target: target.clone(),
            platform: target.platform.clone(),
            success: true,
            state: TargetState::Success,
            error: None,
            error_history,
            attempts,
            duration,
            timestamp: Utc::now(),
            receipt: Some(receipt),
        }
    }

    pub(crate) fn undelivered(
        message_id: &str,
        target: &Target,
        attempts: u32,
        error_history: Vec<NotifyError>,
        duration: Duration,
        error: NotifyError,
    ) -> Self {
        let state = if error.is_cancelled() {
            TargetState::Cancelled
        } else {
            TargetState::Failed
        };
        Self {
            message_id: message_id.to_string(),
            target: target.clone(),
            platform: target.platform.clone(),
            success: false,
            state,
            error: Some(error),
            error_history,
            attempts,
            duration,
            timestamp: Utc::now(),
            receipt: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == TargetState::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_error_sets_cancelled_state() {
        let target = Target::user("sms", "+1555");
        let result = SendResult::undelivered(
            "m1",
            &target,
            1,
            vec![],
            Duration::from_millis(5),
            NotifyError::cancelled("caller went away"),
        );
        assert!(result.is_cancelled());
        assert!(!result.success);
        assert!(result.state.is_terminal());
    }

    #[test]
    fn test_delivered_result() {
        let target = Target::channel("slack", "#ops");
        let result = SendResult::delivered(
            "m1",
            &target,
            2,
            vec![NotifyError::platform_error("slack", "500")],
            Duration::from_millis(20),
            PlatformReceipt::with_external_id("ts-1"),
        );
        assert!(result.success);
        assert_eq!(result.state, TargetState::Success);
        assert_eq!(result.platform, "slack");
        assert_eq!(result.error_history.len(), 1);
        assert!(!TargetState::Retrying.is_terminal());
    }
}
