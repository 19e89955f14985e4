//! Worker pool draining the dispatch queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::handle::AsyncHandle;
use super::{DispatcherCore, Envelope};
use crate::domain::Message;
use crate::queue::DispatchQueue;
use crate::taxonomy::{ErrorCode, NotifyError};

/// Grace period for force-cancelled work to settle before it is aborted.
const FORCE_CANCEL_GRACE: Duration = Duration::from_millis(500);

/// Configuration for the dispatch worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Upper bound for processing one message across all its targets and
    /// retries, in milliseconds. `0` disables the bound.
    pub process_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            process_timeout_ms: 300_000, // 5 minutes
        }
    }
}

impl WorkerConfig {
    pub fn process_timeout(&self) -> Option<Duration> {
        (self.process_timeout_ms > 0).then(|| Duration::from_millis(self.process_timeout_ms))
    }
}

struct InFlight {
    message: Arc<Message>,
    handle: AsyncHandle,
}

/// Fixed-size pool of workers, each looping dequeue then process.
///
/// Workers share nothing but the queue and the counters below. A panic while
/// processing one message settles that message as failed and the worker moves
/// on to the next one.
pub struct WorkerPool {
    config: WorkerConfig,
    /// Stops workers from taking new messages.
    stop: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
    in_flight: Arc<DashMap<u64, InFlight>>,
    next_slot: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
    panics: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            stop: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
            in_flight: Arc::new(DashMap::new()),
            next_slot: Arc::new(AtomicU64::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            processed: Arc::new(AtomicU64::new(0)),
            panics: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Spawn `config.concurrency` workers.
    pub(crate) fn start(&self, queue: Arc<dyn DispatchQueue<Envelope>>, core: Arc<DispatcherCore>) {
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Worker pool already stopped, not starting");
            return;
        };
        if !join_set.is_empty() {
            return;
        }

        let workers = self.config.concurrency.max(1);
        info!(workers, "Starting dispatch worker pool");

        for worker_id in 0..workers {
            let queue = queue.clone();
            let core = core.clone();
            let stop = self.stop.clone();
            let in_flight = self.in_flight.clone();
            let next_slot = self.next_slot.clone();
            let active = self.active.clone();
            let processed = self.processed.clone();
            let panics = self.panics.clone();

            join_set.spawn(async move {
                debug!(worker_id, "Dispatch worker started");

                loop {
                    if stop.is_cancelled() {
                        break;
                    }

                    let envelope = match queue.dequeue(&stop).await {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            if e.code() != ErrorCode::QueueClosed && !stop.is_cancelled() {
                                warn!(worker_id, error = %e, "Dequeue failed, worker exiting");
                            }
                            break;
                        }
                    };

                    let slot = next_slot.fetch_add(1, Ordering::Relaxed);
                    let message = envelope.message().clone();
                    let handle = envelope.handle().clone();
                    in_flight.insert(
                        slot,
                        InFlight {
                            message: message.clone(),
                            handle: handle.clone(),
                        },
                    );
                    active.fetch_add(1, Ordering::SeqCst);

                    let result = AssertUnwindSafe(core.process(envelope)).catch_unwind().await;
                    if let Err(panic) = result {
                        panics.fetch_add(1, Ordering::Relaxed);
                        let err = NotifyError::from_panic(&*panic)
                            .with_context("message_id", &message.id);
                        error!(
                            worker_id,
                            message_id = %message.id,
                            error = %err,
                            "Recovered panic while processing message"
                        );
                        core.settle_unattempted(&message, &handle, err);
                    }

                    active.fetch_sub(1, Ordering::SeqCst);
                    in_flight.remove(&slot);
                    processed.fetch_add(1, Ordering::Relaxed);
                }

                debug!(worker_id, "Dispatch worker stopped");
            });
        }
    }

    /// Messages currently being processed.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled() && self.tasks.lock().as_ref().is_some_and(|t| !t.is_empty())
    }

    /// Stop taking new messages and wait up to `timeout` for in-flight ones.
    ///
    /// Whatever is still running afterwards is cancelled and its handle
    /// settled as `Cancelled`. Returns the number of messages force-cancelled.
    #[instrument(skip(self, core))]
    pub(crate) async fn stop(&self, timeout: Duration, core: &DispatcherCore) -> usize {
        info!(timeout_ms = timeout.as_millis() as u64, "Stopping dispatch worker pool");
        self.stop.cancel();

        let join_set = self.tasks.lock().take();
        let Some(mut join_set) = join_set else {
            return 0;
        };

        let finished = tokio::time::timeout(timeout, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;
        if finished.is_ok() {
            info!("Dispatch worker pool stopped");
            return 0;
        }

        let forced = self.in_flight.len();
        warn!(
            in_flight = forced,
            "Worker pool stop timed out, cancelling in-flight messages"
        );
        for entry in self.in_flight.iter() {
            entry.handle.cancel();
        }

        let settled = tokio::time::timeout(FORCE_CANCEL_GRACE, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;
        if settled.is_err() {
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }

        // Anything aborted mid-flight never got to settle its handle.
        let leftovers: Vec<u64> = self.in_flight.iter().map(|e| *e.key()).collect();
        for slot in leftovers {
            if let Some((_, entry)) = self.in_flight.remove(&slot) {
                core.settle_unattempted(
                    &entry.message,
                    &entry.handle,
                    NotifyError::cancelled("worker pool stopped before the message completed"),
                );
            }
        }
        self.active.store(0, Ordering::SeqCst);

        info!(forced, "Dispatch worker pool stopped");
        forced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.process_timeout(), Some(Duration::from_secs(300)));

        let unbounded = WorkerConfig {
            process_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(unbounded.process_timeout(), None);
    }

    #[test]
    fn test_pool_not_running_before_start() {
        let pool = WorkerPool::new(WorkerConfig::default());
        assert!(!pool.is_running());
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.processed_count(), 0);
    }
}
