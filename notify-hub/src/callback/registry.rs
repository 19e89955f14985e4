//! Callback registrations and execution records.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::{Callback, CallbackChain, CallbackKind, CallbackRetryPolicy};

/// One registration entry: a lone callback or an ordered chain.
#[derive(Debug, Clone)]
pub enum Registration {
    Single(Callback),
    Chain(CallbackChain),
}

impl Registration {
    /// Priority used to order registrations against each other.
    pub fn priority(&self) -> i32 {
        match self {
            Self::Single(cb) => cb.priority,
            Self::Chain(chain) => chain.entries().first().map_or(0, |cb| cb.priority),
        }
    }

    /// Remove a callback by id; returns whether anything was removed and
    /// whether the registration is now empty.
    fn remove(&mut self, callback_id: &str) -> (bool, bool) {
        match self {
            Self::Single(cb) => {
                let hit = cb.id() == callback_id;
                (hit, hit)
            }
            Self::Chain(chain) => {
                let hit = chain.remove(callback_id);
                (hit, chain.is_empty())
            }
        }
    }
}

/// Execution status of one callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    /// The condition did not hold.
    Skipped,
    DeadLettered,
}

impl CallbackStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::DeadLettered)
    }
}

/// One execution of a callback.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAttempt {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// `None` on success.
    pub error: Option<String>,
}

/// Bookkeeping for one callback invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackRecord {
    pub id: String,
    pub callback_id: String,
    pub message_id: String,
    pub kind: CallbackKind,
    pub priority: i32,
    pub timeout_ms: u64,
    pub retry_policy: CallbackRetryPolicy,
    pub status: CallbackStatus,
    pub history: Vec<ExecutionAttempt>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Registered callbacks plus the records of their executions.
///
/// Lookups take read locks; only register, unregister and record updates write.
#[derive(Default)]
pub struct CallbackRegistry {
    global: RwLock<Vec<Registration>>,
    per_message: RwLock<HashMap<String, Vec<Registration>>>,
    records: RwLock<HashMap<String, CallbackRecord>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register callbacks that run for every message. Returns their ids.
    pub fn register_global(&self, callbacks: impl IntoIterator<Item = Callback>) -> Vec<String> {
        let mut global = self.global.write();
        callbacks
            .into_iter()
            .map(|cb| {
                let id = cb.id().to_string();
                debug!(callback_id = %id, kind = %cb.kind(), "Registered global callback");
                global.push(Registration::Single(cb));
                id
            })
            .collect()
    }

    pub fn register_global_chain(&self, chain: CallbackChain) {
        if !chain.is_empty() {
            self.global.write().push(Registration::Chain(chain));
        }
    }

    /// Register callbacks for a single message. Returns their ids.
    pub fn register_for_message(
        &self,
        message_id: impl Into<String>,
        callbacks: impl IntoIterator<Item = Callback>,
    ) -> Vec<String> {
        let message_id = message_id.into();
        let mut ids = Vec::new();
        let mut per_message = self.per_message.write();
        let entries = per_message.entry(message_id.clone()).or_default();
        for cb in callbacks {
            ids.push(cb.id().to_string());
            entries.push(Registration::Single(cb));
        }
        debug!(message_id = %message_id, count = ids.len(), "Registered message callbacks");
        ids
    }

    pub fn register_chain_for_message(&self, message_id: impl Into<String>, chain: CallbackChain) {
        if chain.is_empty() {
            return;
        }
        self.per_message
            .write()
            .entry(message_id.into())
            .or_default()
            .push(Registration::Chain(chain));
    }

    /// Remove a callback wherever it is registered.
    pub fn unregister(&self, callback_id: &str) -> bool {
        fn prune(entries: &mut Vec<Registration>, callback_id: &str) -> bool {
            let mut removed = false;
            entries.retain_mut(|registration| {
                let (hit, empty) = registration.remove(callback_id);
                removed |= hit;
                !empty
            });
            removed
        }

        let mut removed = prune(&mut self.global.write(), callback_id);
        let mut per_message = self.per_message.write();
        for entries in per_message.values_mut() {
            removed |= prune(entries, callback_id);
        }
        per_message.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Drop every registration scoped to `message_id`.
    pub fn release_message(&self, message_id: &str) -> bool {
        self.per_message.write().remove(message_id).is_some()
    }

    /// Registrations that apply to `message_id`, highest priority first.
    pub fn lookup(&self, message_id: &str) -> Vec<Registration> {
        let mut registrations = self.global.read().clone();
        if let Some(entries) = self.per_message.read().get(message_id) {
            registrations.extend(entries.iter().cloned());
        }
        registrations.sort_by_key(|registration| std::cmp::Reverse(registration.priority()));
        registrations
    }

    pub fn global_count(&self) -> usize {
        self.global.read().len()
    }

    /// Number of messages with their own registrations.
    pub fn message_count(&self) -> usize {
        self.per_message.read().len()
    }

    pub(crate) fn open_record(&self, callback: &Callback, message_id: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let record = CallbackRecord {
            id: id.clone(),
            callback_id: callback.id().to_string(),
            message_id: message_id.to_string(),
            kind: callback.kind(),
            priority: callback.priority,
            timeout_ms: callback.timeout.as_millis() as u64,
            retry_policy: callback.retry_policy.clone(),
            status: CallbackStatus::Pending,
            history: Vec::new(),
            metadata: callback.metadata.clone(),
            created_at: Utc::now(),
            settled_at: None,
        };
        self.records.write().insert(id.clone(), record);
        id
    }

    pub(crate) fn set_status(&self, record_id: &str, status: CallbackStatus) {
        if let Some(record) = self.records.write().get_mut(record_id) {
            record.status = status;
            if status.is_settled() {
                record.settled_at = Some(Utc::now());
            }
        }
    }

    pub(crate) fn push_attempt(&self, record_id: &str, attempt: ExecutionAttempt) {
        if let Some(record) = self.records.write().get_mut(record_id) {
            record.history.push(attempt);
        }
    }

    pub fn record(&self, record_id: &str) -> Option<CallbackRecord> {
        self.records.read().get(record_id).cloned()
    }

    pub fn records_for_message(&self, message_id: &str) -> Vec<CallbackRecord> {
        let mut records: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Remove records that settled more than `retention` ago.
    pub fn purge_settled(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| record.settled_at.is_none_or(|settled| settled > cutoff));
        before - records.len()
    }
}
