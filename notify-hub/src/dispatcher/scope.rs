//! Cancellation and deadline shared by every attempt of one message.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::taxonomy::NotifyError;

#[derive(Clone)]
pub(crate) struct DispatchScope {
    cancel: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl DispatchScope {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Bound the whole scope by `timeout`; `None` leaves it unbounded.
    pub(crate) fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| (Instant::now() + t, t));
        self
    }

    /// Fail fast if the scope is already cancelled or past its deadline.
    pub(crate) fn check(&self) -> Result<(), NotifyError> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        if let Some((deadline, timeout)) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(NotifyError::process_timeout(timeout));
        }
        Ok(())
    }

    /// Resolves once the scope is cancelled or its deadline passes.
    ///
    /// Cancellation wins over the deadline when both are ready.
    pub(crate) async fn interrupted(&self) -> NotifyError {
        match self.deadline {
            Some((deadline, timeout)) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => cancelled(),
                    _ = tokio::time::sleep_until(deadline) => NotifyError::process_timeout(timeout),
                }
            }
            None => {
                self.cancel.cancelled().await;
                cancelled()
            }
        }
    }

    /// Sleep for `delay` unless the scope is interrupted first.
    pub(crate) async fn sleep(&self, delay: Duration) -> Result<(), NotifyError> {
        tokio::select! {
            biased;
            err = self.interrupted() => Err(err),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn cancelled() -> NotifyError {
    NotifyError::cancelled("dispatch cancelled")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::ErrorCode;

    #[tokio::test]
    async fn test_sleep_interrupted_by_cancel() {
        let token = CancellationToken::new();
        let scope = DispatchScope::new(token.clone());
        token.cancel();
        let err = scope.sleep(Duration::from_secs(30)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert!(scope.check().is_err());
    }

    #[tokio::test]
    async fn test_deadline_yields_process_timeout() {
        let scope = DispatchScope::new(CancellationToken::new())
            .with_timeout(Some(Duration::from_millis(10)));
        let err = scope.sleep(Duration::from_secs(30)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProcessTimeout);
        assert_eq!(scope.check().unwrap_err().code(), ErrorCode::ProcessTimeout);
    }

    #[tokio::test]
    async fn test_sleep_completes() {
        let scope = DispatchScope::new(CancellationToken::new()).with_timeout(None);
        assert!(scope.sleep(Duration::from_millis(1)).await.is_ok());
        assert!(scope.check().is_ok());
    }
}
