//! Bounded dispatch queue.
//!
//! The dispatcher only talks to the [`DispatchQueue`] trait so the backend can
//! be swapped without touching callers. [`MemoryQueue`] is the in-process ring
//! buffer used by default.

mod memory;

pub use memory::MemoryQueue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::taxonomy::NotifyError;

/// What to do when an enqueue finds the queue at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail immediately with `QueueFull`.
    #[default]
    Reject,
    /// Wait for space, honoring the caller's cancellation.
    Block,
    /// Evict the oldest buffered item to make room.
    DropOldest,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "block" => Ok(Self::Block),
            "drop_oldest" | "dropoldest" => Ok(Self::DropOldest),
            other => Err(format!("unknown overflow policy: {other}")),
        }
    }
}

/// Configuration for the dispatch queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of buffered items.
    pub capacity: usize,
    /// Behavior when full.
    pub overflow_policy: OverflowPolicy,
    /// Depth at which the queue reports `Warning`.
    pub warning_threshold: usize,
    /// Depth at which the queue reports `Critical`.
    pub critical_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            overflow_policy: OverflowPolicy::Reject,
            warning_threshold: 500,
            critical_threshold: 900,
        }
    }
}

impl QueueConfig {
    pub fn depth_status(&self, depth: usize) -> QueueDepthStatus {
        if depth >= self.critical_threshold {
            QueueDepthStatus::Critical
        } else if depth >= self.warning_threshold {
            QueueDepthStatus::Warning
        } else {
            QueueDepthStatus::Normal
        }
    }
}

/// Status of queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDepthStatus {
    Normal,
    Warning,
    Critical,
}

/// A bounded FIFO of pending dispatch items.
///
/// Each enqueued item is handed to exactly one successful `dequeue` call.
#[async_trait]
pub trait DispatchQueue<T: Send + 'static>: Send + Sync {
    /// Add an item.
    ///
    /// Under [`OverflowPolicy::DropOldest`] a full queue evicts its oldest item
    /// and returns it so the caller can settle it; otherwise returns `Ok(None)`.
    async fn enqueue(&self, item: T, cancel: &CancellationToken) -> Result<Option<T>, NotifyError>;

    /// Wait for the next item.
    ///
    /// Fails with `Cancelled` when `cancel` fires and with `QueueClosed` once the
    /// queue is closed and empty.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<T, NotifyError>;

    /// Current depth.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    /// Stop accepting items and wake every blocked caller.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Remove and return everything still buffered.
    fn drain(&self) -> Vec<T>;
}
