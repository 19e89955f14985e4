//! Caller-side view of an asynchronous dispatch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::domain::{Message, SendResult};
use crate::taxonomy::{BatchClassification, ErrorAggregator, NotifyError};

/// Overall status of a dispatched message.
///
/// Moves forward only: `Pending -> Running -> {Success | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl DispatchStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Success | Self::Failed | Self::Cancelled => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

/// Terminal outcome of one message across all of its targets.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub message_id: String,
    pub status: DispatchStatus,
    pub classification: BatchClassification,
    /// One result per target, in target order.
    pub results: Vec<SendResult>,
    /// Combined error when any target did not succeed.
    pub error: Option<NotifyError>,
    pub completed_at: DateTime<Utc>,
}

impl DispatchReport {
    pub fn from_results(message_id: impl Into<String>, results: Vec<SendResult>) -> Self {
        let mut aggregator = ErrorAggregator::new();
        for result in &results {
            match &result.error {
                Some(error) if !result.success => {
                    aggregator.record_failure(&result.platform, &result.target.value, error.clone())
                }
                _ => aggregator.record_success(),
            }
        }

        let classification = aggregator.classification();
        let status = match classification {
            BatchClassification::AllSucceeded => DispatchStatus::Success,
            BatchClassification::Cancelled => DispatchStatus::Cancelled,
            BatchClassification::PartialFailure | BatchClassification::AllFailed => {
                DispatchStatus::Failed
            }
        };

        Self {
            message_id: message_id.into(),
            status,
            classification,
            results,
            error: aggregator.to_error(),
            completed_at: Utc::now(),
        }
    }

    /// Report for a message none of whose targets were attempted.
    pub(crate) fn unattempted(message: &Message, error: NotifyError) -> Self {
        let results = message
            .targets
            .iter()
            .map(|target| {
                SendResult::undelivered(
                    &message.id,
                    target,
                    0,
                    Vec::new(),
                    Duration::ZERO,
                    error.clone(),
                )
            })
            .collect();
        Self::from_results(&message.id, results)
    }

    pub fn is_success(&self) -> bool {
        self.status == DispatchStatus::Success
    }

    /// Calls that reached a platform, summed over targets.
    pub fn total_attempts(&self) -> u32 {
        self.results.iter().map(|r| r.attempts).sum()
    }
}

#[derive(Debug, Clone)]
struct HandleState {
    status: DispatchStatus,
    report: Option<Arc<DispatchReport>>,
}

struct HandleInner {
    message_id: String,
    state: watch::Sender<HandleState>,
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
}

/// Token returned by `send_async`.
///
/// Cloning is cheap; every clone observes the same status. The handle settles
/// exactly once.
#[derive(Clone)]
pub struct AsyncHandle {
    inner: Arc<HandleInner>,
}

impl AsyncHandle {
    /// New pending handle whose cancellation follows `parent`.
    pub(crate) fn new(message_id: impl Into<String>, parent: &CancellationToken) -> Self {
        let (state, _) = watch::channel(HandleState {
            status: DispatchStatus::Pending,
            report: None,
        });
        Self {
            inner: Arc::new(HandleInner {
                message_id: message_id.into(),
                state,
                cancel: parent.child_token(),
                created_at: Utc::now(),
            }),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.inner.message_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn status(&self) -> DispatchStatus {
        self.inner.state.borrow().status
    }

    /// Final report, if the handle has settled.
    pub fn report(&self) -> Option<Arc<DispatchReport>> {
        self.inner.state.borrow().report.clone()
    }

    /// Request cancellation. A queued message is settled as cancelled when a
    /// worker picks it up; a running one at its next suspension point.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<DispatchStatus> {
        let (tx, rx) = watch::channel(self.status());
        let mut state = self.inner.state.subscribe();
        tokio::spawn(async move {
            loop {
                let status = state.borrow_and_update().status;
                tx.send_if_modified(|current| {
                    let changed = *current != status;
                    *current = status;
                    changed
                });
                if status.is_terminal() || state.changed().await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    /// Wait for the terminal report.
    pub async fn wait(&self) -> Arc<DispatchReport> {
        let mut state = self.inner.state.subscribe();
        loop {
            if let Some(report) = state.borrow_and_update().report.clone() {
                return report;
            }
            // The sender lives as long as `self`, so this only fails if the
            // runtime tears the handle down under us.
            if state.changed().await.is_err() {
                return Arc::new(DispatchReport {
                    message_id: self.inner.message_id.clone(),
                    status: DispatchStatus::Cancelled,
                    classification: BatchClassification::Cancelled,
                    results: Vec::new(),
                    error: Some(NotifyError::cancelled("handle dropped before settling")),
                    completed_at: Utc::now(),
                });
            }
        }
    }

    /// Wait for the report for at most `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Arc<DispatchReport>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Move from `Pending` to `Running`. Returns false if the handle already
    /// left `Pending`.
    pub(crate) fn mark_running(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if state.status == DispatchStatus::Pending {
                state.status = DispatchStatus::Running;
                true
            } else {
                false
            }
        })
    }

    /// Record the terminal report. Only the first call has any effect.
    pub(crate) fn settle(&self, report: DispatchReport) -> bool {
        let report = Arc::new(report);
        self.inner.state.send_if_modified(move |state| {
            if state.status.is_terminal() {
                return false;
            }
            state.status = report.status;
            state.report = Some(report);
            true
        })
    }
}

impl std::fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("message_id", &self.inner.message_id)
            .field("status", &self.status())
            .finish()
    }
}
