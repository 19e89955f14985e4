//! Callback execution statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use super::CallbackKind;

/// How one callback execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
    Timeout,
    Panic,
}

#[derive(Debug)]
struct KindTracker {
    executions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    panics: AtomicU64,
    /// Most recent execution latencies, oldest first.
    latencies: Mutex<VecDeque<Duration>>,
}

impl KindTracker {
    fn new(window: usize) -> Self {
        Self {
            executions: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            panics: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(window.min(4096))),
        }
    }
}

/// Per-kind statistics.
#[derive(Debug, Clone, Serialize)]
pub struct KindStats {
    pub kind: CallbackKind,
    pub executions: u64,
    pub successes: u64,
    /// Failed executions, timeouts and panics included.
    pub failures: u64,
    pub timeouts: u64,
    pub panics: u64,
    /// `successes / executions`, 1.0 when nothing ran yet.
    pub success_rate: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// Samples the percentiles were computed from.
    pub samples: usize,
}

/// Pull-style view of the callback executor.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackStatsSnapshot {
    pub kinds: Vec<KindStats>,
    pub queued_jobs: usize,
    pub dead_letters: usize,
    /// Triggers dead-lettered because the job channel was full.
    pub saturated: u64,
}

/// Rolling latency windows and counters per callback kind.
#[derive(Debug)]
pub struct CallbackStats {
    window: usize,
    result: KindTracker,
    error: KindTracker,
    progress: KindTracker,
}

impl CallbackStats {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            result: KindTracker::new(window),
            error: KindTracker::new(window),
            progress: KindTracker::new(window),
        }
    }

    fn tracker(&self, kind: CallbackKind) -> &KindTracker {
        match kind {
            CallbackKind::Result => &self.result,
            CallbackKind::Error => &self.error,
            CallbackKind::Progress => &self.progress,
        }
    }

    pub(crate) fn record(&self, kind: CallbackKind, latency: Duration, outcome: Outcome) {
        let tracker = self.tracker(kind);
        tracker.executions.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::Success => {
                tracker.successes.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failure => {
                tracker.failures.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Timeout => {
                tracker.failures.fetch_add(1, Ordering::Relaxed);
                tracker.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Panic => {
                tracker.failures.fetch_add(1, Ordering::Relaxed);
                tracker.panics.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut latencies = tracker.latencies.lock();
        if latencies.len() >= self.window {
            latencies.pop_front();
        }
        latencies.push_back(latency);
    }

    pub fn kind_stats(&self, kind: CallbackKind) -> KindStats {
        let tracker = self.tracker(kind);
        let mut samples: Vec<Duration> = tracker.latencies.lock().iter().copied().collect();
        samples.sort_unstable();

        let executions = tracker.executions.load(Ordering::Relaxed);
        let successes = tracker.successes.load(Ordering::Relaxed);
        let success_rate = if executions == 0 {
            1.0
        } else {
            successes as f64 / executions as f64
        };

        KindStats {
            kind,
            executions,
            successes,
            failures: tracker.failures.load(Ordering::Relaxed),
            timeouts: tracker.timeouts.load(Ordering::Relaxed),
            panics: tracker.panics.load(Ordering::Relaxed),
            success_rate,
            p50_ms: percentile_ms(&samples, 50.0),
            p95_ms: percentile_ms(&samples, 95.0),
            p99_ms: percentile_ms(&samples, 99.0),
            samples: samples.len(),
        }
    }

    pub fn all(&self) -> Vec<KindStats> {
        CallbackKind::ALL
            .iter()
            .map(|kind| self.kind_stats(*kind))
            .collect()
    }
}

/// Nearest-rank percentile of sorted samples, in milliseconds.
fn percentile_ms(sorted: &[Duration], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index].as_nanos() as f64 / 1_000_000.0
}
