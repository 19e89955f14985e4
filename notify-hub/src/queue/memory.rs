//! In-memory ring buffer backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DispatchQueue, OverflowPolicy, QueueConfig};
use crate::taxonomy::NotifyError;

/// Bounded in-memory FIFO.
pub struct MemoryQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
    /// Signalled when an item becomes available.
    not_empty: Notify,
    /// Signalled when space becomes available.
    not_full: Notify,
    /// Items evicted under `DropOldest`.
    evicted: AtomicU64,
}

impl<T> MemoryQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            policy,
            closed: AtomicBool::new(false),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.capacity, config.overflow_policy)
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Number of items evicted by `DropOldest` so far.
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn push_rejecting(&self, item: T) -> Result<(), NotifyError> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return Err(NotifyError::queue_full(self.capacity));
            }
            items.push_back(item);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    fn push_evicting(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.not_empty.notify_one();

        if evicted.is_some() {
            let total = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                capacity = self.capacity,
                evicted_total = total,
                "Dispatch queue full, dropped oldest item"
            );
        }
        evicted
    }
}

#[async_trait]
impl<T: Send + 'static> DispatchQueue<T> for MemoryQueue<T> {
    async fn enqueue(&self, item: T, cancel: &CancellationToken) -> Result<Option<T>, NotifyError> {
        if self.is_closed() {
            return Err(NotifyError::queue_closed());
        }

        match self.policy {
            OverflowPolicy::Reject => self.push_rejecting(item).map(|_| None),
            OverflowPolicy::DropOldest => Ok(self.push_evicting(item)),
            OverflowPolicy::Block => {
                loop {
                    let notified = self.not_full.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if self.is_closed() {
                        return Err(NotifyError::queue_closed());
                    }

                    {
                        let mut items = self.items.lock();
                        if items.len() < self.capacity {
                            items.push_back(item);
                            drop(items);
                            self.not_empty.notify_one();
                            return Ok(None);
                        }
                    }

                    debug!(capacity = self.capacity, "Dispatch queue full, waiting for space");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(NotifyError::cancelled(
                                "enqueue cancelled while waiting for queue space",
                            ));
                        }
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<T, NotifyError> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let item = self.items.lock().pop_front();
            if let Some(item) = item {
                self.not_full.notify_one();
                return Ok(item);
            }

            if self.is_closed() {
                return Err(NotifyError::queue_closed());
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(NotifyError::cancelled("dequeue cancelled"));
                }
                _ = &mut notified => {}
            }
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Dispatch queue closed");
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.items.lock().drain(..).collect();
        self.not_full.notify_waiters();
        drained
    }
}
