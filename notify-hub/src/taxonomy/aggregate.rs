//! Aggregation of per-target errors from a fan-out send.

use serde::Serialize;

use super::{ErrorCode, NotifyError, Severity};

/// A failure bound to the target it happened on.
#[derive(Debug, Clone, Serialize)]
pub struct TargetError {
    /// Platform the target lives on.
    pub platform: String,
    /// Target value (user id, channel, address, ...).
    pub target: String,
    /// Terminal classified error for that target.
    pub error: NotifyError,
}

/// Combined outcome of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchClassification {
    /// Every target succeeded (also the classification of an empty batch).
    AllSucceeded,
    /// At least one target succeeded and at least one failed.
    PartialFailure,
    /// No target succeeded.
    AllFailed,
    /// At least one target was cancelled before settling.
    Cancelled,
}

/// Collects per-target outcomes and exposes both the individual errors and a
/// combined classification.
#[derive(Debug, Clone, Default)]
pub struct ErrorAggregator {
    errors: Vec<TargetError>,
    successes: usize,
    cancelled: usize,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.successes += 1;
    }

    pub fn record_failure(
        &mut self,
        platform: impl Into<String>,
        target: impl Into<String>,
        error: NotifyError,
    ) {
        if error.is_cancelled() {
            self.cancelled += 1;
        }
        self.errors.push(TargetError {
            platform: platform.into(),
            target: target.into(),
            error,
        });
    }

    pub fn errors(&self) -> &[TargetError] {
        &self.errors
    }

    pub fn successes(&self) -> usize {
        self.successes
    }

    pub fn failures(&self) -> usize {
        self.errors.len()
    }

    pub fn total(&self) -> usize {
        self.successes + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn classification(&self) -> BatchClassification {
        if self.cancelled > 0 {
            BatchClassification::Cancelled
        } else if self.errors.is_empty() {
            BatchClassification::AllSucceeded
        } else if self.successes == 0 {
            BatchClassification::AllFailed
        } else {
            BatchClassification::PartialFailure
        }
    }

    /// Most severe error seen, if any.
    pub fn highest_severity(&self) -> Option<Severity> {
        self.errors.iter().map(|e| e.error.severity()).max()
    }

    /// Fold the batch into a single error for callers that want one value.
    ///
    /// Returns `None` when nothing failed. The combined code is taken from the
    /// most severe individual error; the per-target errors stay available via
    /// [`errors`](Self::errors).
    pub fn to_error(&self) -> Option<NotifyError> {
        let worst = self.errors.iter().max_by_key(|e| e.error.severity())?;
        let code = match self.classification() {
            BatchClassification::Cancelled => ErrorCode::Cancelled,
            _ => worst.error.code(),
        };

        Some(
            NotifyError::new(code, self.summary())
                .with_context("failed", self.errors.len())
                .with_context("succeeded", self.successes)
                .with_context("first_platform", &worst.platform),
        )
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        match self.classification() {
            BatchClassification::AllSucceeded => {
                format!("all {} targets succeeded", self.successes)
            }
            BatchClassification::AllFailed => {
                format!("all {} targets failed", self.errors.len())
            }
            BatchClassification::PartialFailure => format!(
                "partial failure: {} of {} targets failed",
                self.errors.len(),
                self.total()
            ),
            BatchClassification::Cancelled => format!(
                "cancelled: {} of {} targets did not complete",
                self.cancelled,
                self.total()
            ),
        }
    }
}
