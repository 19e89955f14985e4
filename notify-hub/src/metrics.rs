//! Dispatch counters and the pull-style hub snapshot.
//!
//! The engine only maintains counters; exporting them is left to whoever
//! polls [`HubSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::callback::CallbackStatsSnapshot;
use crate::circuit_breaker::CircuitBreakerSnapshot;
use crate::dispatcher::{DispatchReport, DispatchStatus};
use crate::queue::{OverflowPolicy, QueueDepthStatus};

#[derive(Debug, Default)]
struct PlatformCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    circuit_rejections: AtomicU64,
    latency_total_ms: AtomicU64,
}

/// Per-platform attempt statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformStats {
    pub platform: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub circuit_rejections: u64,
    pub avg_latency_ms: f64,
}

/// Message-level counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchCounters {
    pub enqueued: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_attempts: u64,
    pub total_retries: u64,
}

/// Counters updated by the dispatcher.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    platforms: DashMap<String, PlatformCounters>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_platform(&self, platform: &str, f: impl FnOnce(&PlatformCounters)) {
        if let Some(counters) = self.platforms.get(platform) {
            f(&counters);
            return;
        }
        let counters = self.platforms.entry(platform.to_string()).or_default();
        f(&counters);
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a settled message by its final status.
    pub fn record_report(&self, report: &DispatchReport) {
        let counter = match report.status {
            DispatchStatus::Success => &self.succeeded,
            DispatchStatus::Failed => &self.failed,
            DispatchStatus::Cancelled => &self.cancelled,
            DispatchStatus::Pending | DispatchStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one call that reached a platform.
    pub fn record_attempt(&self, platform: &str, success: bool, latency: Duration) {
        self.with_platform(platform, |c| {
            c.attempts.fetch_add(1, Ordering::Relaxed);
            if success {
                c.successes.fetch_add(1, Ordering::Relaxed);
            } else {
                c.failures.fetch_add(1, Ordering::Relaxed);
            }
            c.latency_total_ms
                .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        });
    }

    pub fn record_retry(&self, platform: &str) {
        self.with_platform(platform, |c| {
            c.retries.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_circuit_rejection(&self, platform: &str) {
        self.with_platform(platform, |c| {
            c.circuit_rejections.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn platform_stats(&self) -> Vec<PlatformStats> {
        let mut stats: Vec<PlatformStats> = self
            .platforms
            .iter()
            .map(|entry| {
                let c = entry.value();
                let attempts = c.attempts.load(Ordering::Relaxed);
                let latency_total = c.latency_total_ms.load(Ordering::Relaxed);
                PlatformStats {
                    platform: entry.key().clone(),
                    attempts,
                    successes: c.successes.load(Ordering::Relaxed),
                    failures: c.failures.load(Ordering::Relaxed),
                    retries: c.retries.load(Ordering::Relaxed),
                    circuit_rejections: c.circuit_rejections.load(Ordering::Relaxed),
                    avg_latency_ms: if attempts == 0 {
                        0.0
                    } else {
                        latency_total as f64 / attempts as f64
                    },
                }
            })
            .collect();
        stats.sort_by(|a, b| a.platform.cmp(&b.platform));
        stats
    }

    pub fn counters(&self) -> DispatchCounters {
        let (total_attempts, total_retries) = self.platforms.iter().fold((0, 0), |acc, entry| {
            (
                acc.0 + entry.attempts.load(Ordering::Relaxed),
                acc.1 + entry.retries.load(Ordering::Relaxed),
            )
        });
        DispatchCounters {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            total_attempts,
            total_retries,
        }
    }
}

/// Queue state at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub depth: usize,
    pub capacity: usize,
    pub status: QueueDepthStatus,
    pub overflow_policy: OverflowPolicy,
    pub closed: bool,
}

/// Worker pool state at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub concurrency: usize,
    pub active: usize,
    pub running: bool,
    pub processed: u64,
    pub panics: u64,
}

/// Everything an external collector needs, in one value.
#[derive(Debug, Clone, Serialize)]
pub struct HubSnapshot {
    pub taken_at: DateTime<Utc>,
    pub queue: QueueSnapshot,
    pub workers: WorkerSnapshot,
    pub dispatch: DispatchCounters,
    pub platforms: Vec<PlatformStats>,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub callbacks: CallbackStatsSnapshot,
}

impl HubSnapshot {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
