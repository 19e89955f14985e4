//! Dispatch orchestration.
//!
//! A [`Dispatcher`] owns its queue, worker pool, circuit breakers, retry
//! engine, platform registry and callback executor. Nothing is shared between
//! instances, so several dispatchers can live in one process without seeing
//! each other.
//!
//! Every target goes through the same attempt loop whether the message was
//! sent synchronously or through the queue:
//!
//! ```text
//! Pending -> Attempting -> Success
//!                       -> Retrying -> Attempting ...
//!                       -> Failed
//! (any non-terminal state) -> Cancelled
//! ```

mod handle;
mod scope;
mod worker_pool;

pub use handle::{AsyncHandle, DispatchReport, DispatchStatus};
pub use worker_pool::{WorkerConfig, WorkerPool};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use self::scope::DispatchScope;
use crate::callback::{CallbackExecutor, CallbackRegistry};
use crate::circuit_breaker::CircuitBreakerSet;
use crate::config::HubConfig;
use crate::domain::{Message, PlatformReceipt, SendResult, Target, TargetState};
use crate::metrics::{DispatchMetrics, HubSnapshot, QueueSnapshot, WorkerSnapshot};
use crate::platform::{Platform, PlatformRegistry};
use crate::queue::{DispatchQueue, MemoryQueue};
use crate::retry::{self, RetryEngine, RetryState};
use crate::taxonomy::NotifyError;

/// A message waiting in the dispatch queue together with its handle.
pub struct Envelope {
    message: Arc<Message>,
    handle: AsyncHandle,
    enqueued_at: DateTime<Utc>,
}

impl Envelope {
    fn new(message: Arc<Message>, handle: AsyncHandle) -> Self {
        Self {
            message,
            handle,
            enqueued_at: Utc::now(),
        }
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    pub fn handle(&self) -> &AsyncHandle {
        &self.handle
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}

/// State shared between the dispatcher front-end and its workers.
pub(crate) struct DispatcherCore {
    attempt_timeout: Duration,
    process_timeout: Option<Duration>,
    platforms: PlatformRegistry,
    breakers: CircuitBreakerSet,
    retry: RetryEngine,
    callbacks: CallbackExecutor,
    metrics: DispatchMetrics,
}

impl DispatcherCore {
    /// Process one dequeued message and settle its handle.
    #[instrument(skip_all, fields(message_id = %envelope.message.id))]
    pub(crate) async fn process(&self, envelope: Envelope) {
        let Envelope {
            message,
            handle,
            enqueued_at,
        } = envelope;

        if handle.is_cancelled() {
            self.settle_unattempted(
                &message,
                &handle,
                NotifyError::cancelled("cancelled while queued"),
            );
            return;
        }
        if !handle.mark_running() {
            return;
        }

        debug!(
            message_id = %message.id,
            queued_ms = (Utc::now() - enqueued_at).num_milliseconds(),
            targets = message.targets.len(),
            "Processing queued message"
        );

        let scope = DispatchScope::new(handle.cancellation_token().clone())
            .with_timeout(self.process_timeout);
        let report = self.dispatch(&message, &scope).await;
        handle.settle(report);
    }

    /// Attempt every target of `message` concurrently and build the report.
    async fn dispatch(&self, message: &Arc<Message>, scope: &DispatchScope) -> DispatchReport {
        let total = message.targets.len();
        let completed = AtomicUsize::new(0);

        let attempts = message.targets.iter().map(|target| {
            let completed = &completed;
            async move {
                let result = self.attempt(message, target, scope).await;
                self.finish_target(message, &result);
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                self.callbacks.trigger_progress(&message.id, done, total);
                result
            }
        });
        let results = join_all(attempts).await;

        self.callbacks.registry().release_message(&message.id);
        let report = DispatchReport::from_results(&message.id, results);
        self.metrics.record_report(&report);

        info!(
            message_id = %message.id,
            status = ?report.status,
            classification = ?report.classification,
            attempts = report.total_attempts(),
            "Message dispatch finished"
        );
        report
    }

    /// Drive one target to a terminal state.
    #[instrument(
        skip_all,
        level = "debug",
        fields(message_id = %message.id, platform = %target.platform)
    )]
    async fn attempt(
        &self,
        message: &Arc<Message>,
        target: &Target,
        scope: &DispatchScope,
    ) -> SendResult {
        let started = Instant::now();
        let platform_name = target.platform.as_str();
        let policy = self.retry.policy_for(platform_name);
        let mut retry_state = RetryState::new();

        let outcome: Result<PlatformReceipt, NotifyError> = loop {
            if let Err(interrupt) = scope.check() {
                break Err(interrupt);
            }

            let Some(platform) = self.platforms.get(platform_name) else {
                let err = NotifyError::platform_not_registered(platform_name);
                retry_state.record_error(err.clone());
                break Err(err);
            };

            let breaker = self.breakers.get(platform_name);
            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(err) => {
                    self.metrics.record_circuit_rejection(platform_name);
                    debug!(
                        message_id = %message.id,
                        platform = platform_name,
                        target = %target.value,
                        "Circuit open, failing fast"
                    );
                    retry_state.record_error(err.clone());
                    break Err(err);
                }
            };

            retry_state.record_attempt();
            debug!(
                message_id = %message.id,
                platform = platform_name,
                target = %target.value,
                attempt = retry_state.attempts(),
                state = ?TargetState::Attempting,
                "Sending to platform"
            );

            let call_started = Instant::now();
            let result = match self.call_platform(&platform, message, target, scope).await {
                Ok(result) => result,
                Err(interrupt) => {
                    breaker.record_neutral(permit);
                    break Err(interrupt);
                }
            };
            self.metrics
                .record_attempt(platform_name, result.is_ok(), call_started.elapsed());
            breaker.record_outcome(permit, result.as_ref().err());

            let err = match result {
                Ok(receipt) => break Ok(receipt),
                Err(err) => err,
            };
            retry_state.record_error(err.clone());

            let decision = retry::decide(
                &err,
                retry_state.attempts(),
                retry_state.last_delay(),
                &policy,
            );
            if !decision.retry {
                break Err(err);
            }

            retry_state.record_delay(decision.delay);
            self.metrics.record_retry(platform_name);
            debug!(
                message_id = %message.id,
                platform = platform_name,
                target = %target.value,
                attempt = retry_state.attempts(),
                delay_ms = decision.delay.as_millis() as u64,
                error = %err,
                state = ?TargetState::Retrying,
                "Attempt failed, retrying"
            );

            if let Err(interrupt) = scope.sleep(decision.delay).await {
                break Err(interrupt);
            }
        };

        let attempts = retry_state.attempts();
        let history = retry_state.into_history();
        match outcome {
            Ok(receipt) => SendResult::delivered(
                &message.id,
                target,
                attempts,
                history,
                started.elapsed(),
                receipt,
            ),
            Err(err) => {
                let result = SendResult::undelivered(
                    &message.id,
                    target,
                    attempts,
                    history,
                    started.elapsed(),
                    err,
                );
                debug!(
                    message_id = %message.id,
                    platform = platform_name,
                    target = %target.value,
                    attempts,
                    state = ?result.state,
                    "Target settled without delivery"
                );
                result
            }
        }
    }

    /// One platform call under the attempt timeout and a panic boundary.
    ///
    /// The outer error means the scope was interrupted before the call
    /// finished; the inner result is the classified outcome of the call.
    async fn call_platform(
        &self,
        platform: &Arc<dyn Platform>,
        message: &Message,
        target: &Target,
        scope: &DispatchScope,
    ) -> Result<Result<PlatformReceipt, NotifyError>, NotifyError> {
        let name = platform.name();
        let call = AssertUnwindSafe(platform.send(message, target)).catch_unwind();

        tokio::select! {
            biased;
            interrupt = scope.interrupted() => Err(interrupt),
            result = tokio::time::timeout(self.attempt_timeout, call) => Ok(match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => {
                    let err = NotifyError::from_panic(&*panic).with_context("platform", name);
                    error!(
                        message_id = %message.id,
                        platform = name,
                        error = %err,
                        "Recovered panic in platform send"
                    );
                    Err(err)
                }
                Err(_) => Err(NotifyError::network_timeout(name, self.attempt_timeout)),
            }),
        }
    }

    fn finish_target(&self, message: &Arc<Message>, result: &SendResult) {
        self.callbacks.trigger_result(result.clone());
        if let Some(error) = &result.error {
            self.callbacks.trigger_error(message.clone(), error.clone());
        }
    }

    /// Settle a handle whose message never reached its targets.
    pub(crate) fn settle_unattempted(
        &self,
        message: &Arc<Message>,
        handle: &AsyncHandle,
        error: NotifyError,
    ) {
        if handle.status().is_terminal() {
            return;
        }
        let report = DispatchReport::unattempted(message, error);
        for result in &report.results {
            self.finish_target(message, result);
        }
        self.callbacks.registry().release_message(&message.id);
        self.metrics.record_report(&report);
        handle.settle(report);
    }
}

/// Entry point of the dispatch engine.
pub struct Dispatcher {
    config: HubConfig,
    core: Arc<DispatcherCore>,
    queue: Arc<dyn DispatchQueue<Envelope>>,
    pool: WorkerPool,
    accepting: AtomicBool,
}

impl Dispatcher {
    /// Build a dispatcher backed by the in-memory queue.
    pub fn new(config: HubConfig) -> crate::Result<Self> {
        let queue: Arc<dyn DispatchQueue<Envelope>> =
            Arc::new(MemoryQueue::from_config(&config.queue));
        Self::with_queue(config, queue)
    }

    /// Build a dispatcher over a custom queue backend.
    pub fn with_queue(
        config: HubConfig,
        queue: Arc<dyn DispatchQueue<Envelope>>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let registry = Arc::new(CallbackRegistry::new());
        let core = DispatcherCore {
            attempt_timeout: config.attempt_timeout(),
            process_timeout: config.worker.process_timeout(),
            platforms: PlatformRegistry::new(),
            breakers: CircuitBreakerSet::with_overrides(
                config.circuit_breaker.default.clone(),
                config.circuit_breaker.platforms.clone(),
            ),
            retry: RetryEngine::with_overrides(
                config.retry.default.clone(),
                config.retry.platforms.clone(),
            ),
            callbacks: CallbackExecutor::new(config.callbacks.clone(), registry),
            metrics: DispatchMetrics::new(),
        };

        Ok(Self {
            pool: WorkerPool::new(config.worker.clone()),
            config,
            core: Arc::new(core),
            queue,
            accepting: AtomicBool::new(true),
        })
    }

    /// Start the dispatch workers and the callback executor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        self.core.callbacks.start();
        self.pool.start(self.queue.clone(), self.core.clone());
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a platform, returning the one it replaced.
    pub fn register_platform(&self, platform: Arc<dyn Platform>) -> Option<Arc<dyn Platform>> {
        self.core.platforms.register(platform)
    }

    pub fn platforms(&self) -> &PlatformRegistry {
        &self.core.platforms
    }

    pub fn callbacks(&self) -> &CallbackExecutor {
        &self.core.callbacks
    }

    pub fn callback_registry(&self) -> &Arc<CallbackRegistry> {
        self.core.callbacks.registry()
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerSet {
        &self.core.breakers
    }

    pub fn retry_engine(&self) -> &RetryEngine {
        &self.core.retry
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.core.metrics
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn admit(&self, message: &Message) -> Result<(), NotifyError> {
        if !self.is_accepting() {
            return Err(NotifyError::shutting_down());
        }
        message.validate()
    }

    /// Deliver `message` to all of its targets and wait for the outcome.
    ///
    /// Retry delays are experienced inline. Only invalid messages or a
    /// dispatcher that is shutting down produce an `Err`; delivery failures are
    /// reported in the returned [`DispatchReport`].
    pub async fn send(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, NotifyError> {
        self.admit(&message)?;
        let message = Arc::new(message);
        let scope = DispatchScope::new(cancel.child_token())
            .with_timeout(self.core.process_timeout);
        Ok(self.core.dispatch(&message, &scope).await)
    }

    /// Queue `message` and return a handle immediately.
    ///
    /// Under [`OverflowPolicy::Block`](crate::queue::OverflowPolicy::Block) this
    /// waits for queue space, honoring `cancel`. Cancelling `cancel` later
    /// cancels the dispatch.
    pub async fn send_async(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<AsyncHandle, NotifyError> {
        self.admit(&message)?;
        let message = Arc::new(message);
        let handle = AsyncHandle::new(message.id.clone(), cancel);
        let envelope = Envelope::new(message.clone(), handle.clone());

        match self.queue.enqueue(envelope, cancel).await {
            Ok(evicted) => {
                self.core.metrics.record_enqueued();
                if let Some(evicted) = evicted {
                    self.core.metrics.record_evicted();
                    warn!(
                        message_id = %evicted.message.id,
                        evicted_by = %message.id,
                        "Dropped oldest queued message"
                    );
                    let err = NotifyError::queue_full(self.queue.capacity())
                        .with_context("evicted_by", &message.id);
                    self.core
                        .settle_unattempted(&evicted.message, &evicted.handle, err);
                }
                debug!(message_id = %message.id, depth = self.queue.len(), "Message queued");
                Ok(handle)
            }
            Err(err) => {
                self.core.metrics.record_rejected();
                debug!(message_id = %message.id, error = %err, "Message not queued");
                Err(err)
            }
        }
    }

    /// Run the full attempt cycle for a single target.
    pub async fn attempt(
        &self,
        message: Arc<Message>,
        target: &Target,
        cancel: &CancellationToken,
    ) -> SendResult {
        let scope = DispatchScope::new(cancel.child_token());
        let result = self.core.attempt(&message, target, &scope).await;
        self.core.finish_target(&message, &result);
        result
    }

    pub fn snapshot(&self) -> HubSnapshot {
        let depth = self.queue.len();
        HubSnapshot {
            taken_at: Utc::now(),
            queue: QueueSnapshot {
                depth,
                capacity: self.queue.capacity(),
                status: self.config.queue.depth_status(depth),
                overflow_policy: self.config.queue.overflow_policy,
                closed: self.queue.is_closed(),
            },
            workers: WorkerSnapshot {
                concurrency: self.config.worker.concurrency,
                active: self.pool.active_count(),
                running: self.pool.is_running(),
                processed: self.pool.processed_count(),
                panics: self.pool.panic_count(),
            },
            dispatch: self.core.metrics.counters(),
            platforms: self.core.metrics.platform_stats(),
            circuit_breakers: self.core.breakers.snapshot(),
            callbacks: self.core.callbacks.snapshot(),
        }
    }

    /// Stop the dispatcher.
    ///
    /// New sends are refused, in-flight messages get up to `timeout` to finish
    /// before being cancelled, messages still queued are settled as cancelled,
    /// then callbacks are drained and platforms shut down.
    pub async fn shutdown(&self, timeout: Duration) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down dispatcher");

        self.pool.stop(timeout, &self.core).await;

        self.queue.close();
        let leftovers = self.queue.drain();
        if !leftovers.is_empty() {
            warn!(count = leftovers.len(), "Cancelling messages still queued at shutdown");
        }
        for envelope in leftovers {
            self.core.settle_unattempted(
                &envelope.message,
                &envelope.handle,
                NotifyError::cancelled("dispatcher shut down before delivery"),
            );
        }

        self.core.callbacks.shutdown(timeout).await;
        self.core.platforms.shutdown_all().await;
        info!("Dispatcher shut down");
    }
}
