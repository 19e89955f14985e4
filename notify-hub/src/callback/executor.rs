//! Callback worker pool and dead-letter store.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{CallbackStatus, ExecutionAttempt, Registration};
use super::stats::{CallbackStats, CallbackStatsSnapshot, Outcome};
use super::{Callback, CallbackEvent, CallbackKind, CallbackRegistry, Progress};
use crate::domain::{Message, SendResult};
use crate::retry;
use crate::taxonomy::{NotifyError, panic_message};

/// Configuration for the callback executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackExecutorConfig {
    /// Concurrent callback workers.
    pub workers: usize,
    /// Pending invocations buffered before triggers start dead-lettering.
    pub queue_capacity: usize,
    /// Maximum dead letters kept; the oldest is evicted beyond this.
    pub dead_letter_capacity: usize,
    /// How long settled records and dead letters are kept, in milliseconds.
    pub retention_ms: u64,
    /// Interval of the retention sweeper in milliseconds.
    pub sweep_interval_ms: u64,
    /// Latency samples kept per callback kind.
    pub stats_window: usize,
}

impl Default for CallbackExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            dead_letter_capacity: 1000,
            retention_ms: 3_600_000,
            sweep_interval_ms: 60_000,
            stats_window: 1000,
        }
    }
}

impl CallbackExecutorConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("callback workers must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("callback queue_capacity must be at least 1".to_string());
        }
        if self.sweep_interval_ms == 0 {
            return Err("callback sweep_interval_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// A callback invocation that permanently failed.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: u64,
    /// Execution record, absent when the invocation never ran.
    pub record_id: Option<String>,
    pub callback_id: String,
    pub message_id: String,
    pub kind: CallbackKind,
    pub reason: String,
    pub attempts: u32,
    pub history: Vec<ExecutionAttempt>,
    pub dead_lettered_at: DateTime<Utc>,
    callback: Callback,
    event: CallbackEvent,
}

struct CallbackJob {
    event: CallbackEvent,
    registrations: Vec<Registration>,
}

/// Dead letters keyed by their increasing id, so the oldest is the first key.
struct DeadLetterStore {
    letters: Mutex<BTreeMap<u64, DeadLetter>>,
    capacity: usize,
}

impl DeadLetterStore {
    fn new(capacity: usize) -> Self {
        Self {
            letters: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Insert a letter, evicting the oldest ones beyond capacity.
    fn insert(&self, letter: DeadLetter) {
        let mut letters = self.letters.lock();
        while letters.len() >= self.capacity {
            let Some((oldest, _)) = letters.pop_first() else {
                break;
            };
            debug!(dead_letter_id = oldest, "Evicted oldest callback dead letter");
        }
        letters.insert(letter.id, letter);
    }

    /// Put back a letter taken out for replay. Does not evict.
    fn restore(&self, letter: DeadLetter) {
        self.letters.lock().insert(letter.id, letter);
    }

    fn remove(&self, id: u64) -> Option<DeadLetter> {
        self.letters.lock().remove(&id)
    }

    fn len(&self) -> usize {
        self.letters.lock().len()
    }

    fn list(&self) -> Vec<DeadLetter> {
        self.letters.lock().values().cloned().collect()
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut letters = self.letters.lock();
        let before = letters.len();
        letters.retain(|_, letter| letter.dead_lettered_at > cutoff);
        before - letters.len()
    }
}

struct ExecutorShared {
    config: CallbackExecutorConfig,
    registry: Arc<CallbackRegistry>,
    stats: CallbackStats,
    dead_letters: DeadLetterStore,
    next_dead_letter_id: AtomicU64,
    saturated: AtomicU64,
    /// Aborts running callbacks and backoff waits.
    cancel: CancellationToken,
}

impl ExecutorShared {
    async fn process(&self, job: CallbackJob) {
        for registration in &job.registrations {
            match registration {
                Registration::Single(cb) if cb.handles(&job.event) => {
                    self.execute(cb, &job.event).await;
                }
                Registration::Single(_) => {}
                Registration::Chain(chain) => {
                    for cb in chain.matching(&job.event) {
                        self.execute(cb, &job.event).await;
                    }
                }
            }
        }
    }

    /// Run one callback to completion, retrying per its policy.
    async fn execute(&self, cb: &Callback, event: &CallbackEvent) -> CallbackStatus {
        let message_id = event.message_id();
        let record_id = self.registry.open_record(cb, message_id);

        let holds = std::panic::catch_unwind(AssertUnwindSafe(|| cb.condition_holds(event)));
        match holds {
            Ok(true) => {}
            Ok(false) => {
                debug!(callback_id = %cb.id(), message_id, "Callback condition false, skipping");
                self.registry.set_status(&record_id, CallbackStatus::Skipped);
                return CallbackStatus::Skipped;
            }
            Err(panic) => {
                let reason = format!("condition panicked: {}", panic_message(&*panic));
                error!(callback_id = %cb.id(), message_id, %reason, "Recovered panic in callback condition");
                self.dead_letter(cb, event, Some(record_id.as_str()), reason, 0);
                return CallbackStatus::DeadLettered;
            }
        }

        let max_attempts = cb.retry_policy.max_retries.saturating_add(1);
        let mut attempts = 0;
        let mut reason = String::new();

        while attempts < max_attempts {
            attempts += 1;
            self.registry.set_status(&record_id, CallbackStatus::Running);

            let started_at = Utc::now();
            let start = Instant::now();
            let result = self.run_once(cb, event.clone()).await;
            let elapsed = start.elapsed();

            let outcome = match &result {
                Ok(()) => Outcome::Success,
                Err((outcome, _)) => *outcome,
            };
            self.stats.record(cb.kind(), elapsed, outcome);
            self.registry.push_attempt(
                &record_id,
                ExecutionAttempt {
                    attempt: attempts,
                    started_at,
                    duration_ms: elapsed.as_millis() as u64,
                    error: result.as_ref().err().map(|(_, reason)| reason.clone()),
                },
            );

            match result {
                Ok(()) => {
                    self.registry.set_status(&record_id, CallbackStatus::Succeeded);
                    return CallbackStatus::Succeeded;
                }
                Err((_, err)) => reason = err,
            }

            if self.cancel.is_cancelled() {
                break;
            }
            if attempts < max_attempts {
                let delay = cb.retry_policy.delay_for(attempts - 1);
                debug!(
                    callback_id = %cb.id(),
                    message_id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Callback failed, retrying"
                );
                self.registry.set_status(&record_id, CallbackStatus::Retrying);
                if retry::wait(delay, &self.cancel).await.is_err() {
                    reason = format!("{reason}; executor stopped during retry backoff");
                    break;
                }
            }
        }

        self.dead_letter(cb, event, Some(record_id.as_str()), reason, attempts);
        CallbackStatus::DeadLettered
    }

    async fn run_once(&self, cb: &Callback, event: CallbackEvent) -> Result<(), (Outcome, String)> {
        let invocation = AssertUnwindSafe(async move {
            match cb.invoke(event) {
                Some(future) => future.await,
                None => Ok(()),
            }
        })
        .catch_unwind();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err((Outcome::Failure, "callback executor stopped".to_string()))
            }
            result = tokio::time::timeout(cb.timeout, invocation) => match result {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err((Outcome::Failure, format!("{e:#}"))),
                Ok(Err(panic)) => {
                    let message = panic_message(&*panic);
                    error!(callback_id = %cb.id(), panic = %message, "Recovered panic in callback");
                    Err((Outcome::Panic, format!("callback panicked: {message}")))
                }
                Err(_) => Err((
                    Outcome::Timeout,
                    format!("callback timed out after {}ms", cb.timeout.as_millis()),
                )),
            },
        }
    }

    fn dead_letter(
        &self,
        cb: &Callback,
        event: &CallbackEvent,
        record_id: Option<&str>,
        reason: String,
        attempts: u32,
    ) {
        let history = record_id
            .and_then(|id| self.registry.record(id))
            .map(|record| record.history)
            .unwrap_or_default();
        if let Some(id) = record_id {
            self.registry.set_status(id, CallbackStatus::DeadLettered);
        }

        let id = self.next_dead_letter_id.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            dead_letter_id = id,
            callback_id = %cb.id(),
            message_id = %event.message_id(),
            kind = %cb.kind(),
            attempts,
            %reason,
            "Callback moved to dead letters"
        );
        self.dead_letters.insert(DeadLetter {
            id,
            record_id: record_id.map(str::to_string),
            callback_id: cb.id().to_string(),
            message_id: event.message_id().to_string(),
            kind: cb.kind(),
            reason,
            attempts,
            history,
            dead_lettered_at: Utc::now(),
            callback: cb.clone(),
            event: event.clone(),
        });
    }

    /// Dead-letter every callback of a job that could not be queued.
    fn dead_letter_job(&self, job: CallbackJob, reason: &str) {
        for registration in &job.registrations {
            match registration {
                Registration::Single(cb) if cb.handles(&job.event) => {
                    self.dead_letter(cb, &job.event, None, reason.to_string(), 0);
                }
                Registration::Single(_) => {}
                Registration::Chain(chain) => {
                    for cb in chain.matching(&job.event) {
                        self.dead_letter(cb, &job.event, None, reason.to_string(), 0);
                    }
                }
            }
        }
    }

    fn purge_dead_letters(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        self.dead_letters.purge_older_than(cutoff)
    }

    fn sweep(&self) {
        let retention = self.config.retention();
        let records = self.registry.purge_settled(retention);
        let letters = self.purge_dead_letters(retention);
        if records > 0 || letters > 0 {
            debug!(records, dead_letters = letters, "Purged expired callback state");
        }
    }
}

/// Runs callbacks on a dedicated worker pool.
///
/// Triggers look up the registrations for the message and hand them to the
/// pool through a bounded channel with `try_send`; they never wait for a
/// callback to run.
pub struct CallbackExecutor {
    shared: Arc<ExecutorShared>,
    sender: RwLock<Option<mpsc::Sender<CallbackJob>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<CallbackJob>>>,
    /// Stops the retention sweeper.
    sweeper_cancel: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
    started: AtomicBool,
}

impl CallbackExecutor {
    pub fn new(config: CallbackExecutorConfig, registry: Arc<CallbackRegistry>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            shared: Arc::new(ExecutorShared {
                stats: CallbackStats::new(config.stats_window),
                dead_letters: DeadLetterStore::new(config.dead_letter_capacity),
                config,
                registry,
                next_dead_letter_id: AtomicU64::new(0),
                saturated: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
            sender: RwLock::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            sweeper_cancel: CancellationToken::new(),
            tasks: Mutex::new(Some(JoinSet::new())),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the workers and the retention sweeper. Later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Callback executor already stopped, not starting");
            return;
        };

        info!(
            workers = self.shared.config.workers,
            queue_capacity = self.shared.config.queue_capacity,
            "Starting callback executor"
        );

        for worker_id in 0..self.shared.config.workers.max(1) {
            let shared = self.shared.clone();
            let receiver = self.receiver.clone();
            join_set.spawn(async move {
                debug!(worker_id, "Callback worker started");
                loop {
                    let job = {
                        let mut guard = receiver.lock().await;
                        tokio::select! {
                            biased;
                            _ = shared.cancel.cancelled() => None,
                            job = guard.recv() => job,
                        }
                    };
                    let Some(job) = job else { break };
                    shared.process(job).await;
                }
                debug!(worker_id, "Callback worker stopped");
            });
        }

        let shared = self.shared.clone();
        let cancel = self.sweeper_cancel.clone();
        join_set.spawn(async move {
            let mut interval = tokio::time::interval(shared.config.sweep_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => shared.sweep(),
                }
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.sender.read().is_some()
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.shared.registry
    }

    pub fn stats(&self) -> &CallbackStats {
        &self.shared.stats
    }

    /// Queue callbacks for a terminal per-target result.
    pub fn trigger_result(&self, result: SendResult) -> bool {
        self.trigger(CallbackEvent::Result(result))
    }

    /// Queue callbacks for a failed target.
    pub fn trigger_error(&self, message: Arc<Message>, error: NotifyError) -> bool {
        self.trigger(CallbackEvent::Error { message, error })
    }

    /// Queue progress callbacks.
    pub fn trigger_progress(&self, message_id: &str, completed: usize, total: usize) -> bool {
        self.trigger(CallbackEvent::Progress {
            message_id: message_id.to_string(),
            progress: Progress { completed, total },
        })
    }

    /// Queue callbacks for `event`.
    ///
    /// Returns whether a job was queued. Never blocks: a full or closed
    /// channel dead-letters the invocation instead.
    pub fn trigger(&self, event: CallbackEvent) -> bool {
        let registrations: Vec<Registration> = self
            .shared
            .registry
            .lookup(event.message_id())
            .into_iter()
            .filter(|registration| match registration {
                Registration::Single(cb) => cb.handles(&event),
                Registration::Chain(chain) => chain.matching(&event).next().is_some(),
            })
            .collect();
        if registrations.is_empty() {
            return false;
        }

        let job = CallbackJob {
            event,
            registrations,
        };
        let sender = self.sender.read().clone();
        let Some(sender) = sender else {
            self.shared.dead_letter_job(job, "callback executor stopped");
            return false;
        };

        match sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                self.shared.saturated.fetch_add(1, Ordering::Relaxed);
                self.shared.dead_letter_job(job, "callback executor saturated");
                false
            }
            Err(TrySendError::Closed(job)) => {
                self.shared.dead_letter_job(job, "callback executor stopped");
                false
            }
        }
    }

    /// Dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.dead_letters.list()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.shared.dead_letters.len()
    }

    /// Submit a dead-lettered invocation again.
    pub fn replay_dead_letter(&self, id: u64) -> Result<(), NotifyError> {
        let Some(letter) = self.shared.dead_letters.remove(id) else {
            return Err(NotifyError::validation(
                "dead_letter_id",
                format!("no dead letter with id {id}"),
            ));
        };

        let sender = self.sender.read().clone();
        let Some(sender) = sender else {
            self.shared.dead_letters.restore(letter);
            return Err(NotifyError::shutting_down());
        };

        let job = CallbackJob {
            event: letter.event.clone(),
            registrations: vec![Registration::Single(letter.callback.clone())],
        };
        match sender.try_send(job) {
            Ok(()) => {
                info!(dead_letter_id = id, callback_id = %letter.callback_id, "Replaying callback dead letter");
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    TrySendError::Full(_) => {
                        NotifyError::system_overload("callback executor saturated")
                    }
                    TrySendError::Closed(_) => NotifyError::shutting_down(),
                };
                self.shared.dead_letters.restore(letter);
                Err(err)
            }
        }
    }

    pub fn discard_dead_letter(&self, id: u64) -> bool {
        self.shared.dead_letters.remove(id).is_some()
    }

    /// Purge settled records and dead letters older than the retention window.
    pub fn sweep(&self) {
        self.shared.sweep();
    }

    pub fn snapshot(&self) -> CallbackStatsSnapshot {
        let queued_jobs = self
            .sender
            .read()
            .as_ref()
            .map_or(0, |sender| sender.max_capacity() - sender.capacity());
        CallbackStatsSnapshot {
            kinds: self.shared.stats.all(),
            queued_jobs,
            dead_letters: self.shared.dead_letters.len(),
            saturated: self.shared.saturated.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting triggers, let queued callbacks finish for up to
    /// `timeout`, then abort the rest.
    ///
    /// Invocations that never got to run are dead-lettered.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Stopping callback executor");
        self.sender.write().take();
        self.sweeper_cancel.cancel();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            let drained = tokio::time::timeout(timeout, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Callback executor did not drain in time, cancelling running callbacks"
                );
                self.shared.cancel.cancel();
                let settled = tokio::time::timeout(Duration::from_millis(250), async {
                    while join_set.join_next().await.is_some() {}
                })
                .await;
                if settled.is_err() {
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                }
            }
        }
        self.shared.cancel.cancel();

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        while let Ok(job) = receiver.try_recv() {
            self.shared.dead_letter_job(job, "callback executor stopped");
        }
        info!("Callback executor stopped");
    }
}
