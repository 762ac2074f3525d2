//! Background worker status tracking.
//!
//! Workers report progress through [`StatusService`]; every change is
//! broadcast as a [`StatusUpdate`] which the hub relays to connections
//! subscribed to the `worker-status` channel.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const WORKER_STATUS_CHANNEL: &str = "worker-status";

const UPDATE_BUFFER: usize = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerStatus {
    pub name: String,
    pub state: WorkerState,
    /// 0-100.
    pub progress: u32,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: String,
    pub items_total: u64,
    pub items_done: u64,
}

impl WorkerStatus {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// One status change, as broadcast to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub worker_name: String,
    pub status: WorkerStatus,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn to_message(&self) -> WorkerStatusMessage {
        let status = &self.status;
        WorkerStatusMessage {
            kind: WORKER_STATUS_CHANNEL.into(),
            worker_name: self.worker_name.clone(),
            status: WorkerStatusData {
                name: status.name.clone(),
                state: status.state,
                progress: status.progress,
                message: status.message.clone(),
                started_at: status.started_at.map(rfc3339),
                completed_at: status.completed_at.map(rfc3339),
                error: status.error.clone(),
                items_total: status.items_total,
                items_done: status.items_done,
            },
            timestamp: self.timestamp,
        }
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Wire shape of a worker-status channel message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub worker_name: String,
    pub status: WorkerStatusData,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusData {
    pub name: String,
    pub state: WorkerState,
    pub progress: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub items_total: u64,
    pub items_done: u64,
}

/// Registry of worker statuses plus a broadcast of every change.
pub struct StatusService {
    statuses: RwLock<HashMap<String, WorkerStatus>>,
    updates: broadcast::Sender<StatusUpdate>,
}

impl Default for StatusService {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusService {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            statuses: RwLock::new(HashMap::new()),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.updates.receiver_count()
    }

    /// Start tracking a worker in the idle state. No-op if already known.
    pub fn register_worker(&self, name: &str) {
        self.statuses
            .write()
            .entry(name.to_string())
            .or_insert_with(|| WorkerStatus::new(name));
    }

    pub fn update_status(&self, name: &str, state: WorkerState, progress: u32, message: &str) {
        let mut statuses = self.statuses.write();
        let status = statuses
            .entry(name.to_string())
            .or_insert_with(|| WorkerStatus::new(name));
        status.state = state;
        status.progress = progress;
        status.message = message.to_string();
        let now = Utc::now();
        if state == WorkerState::Running && status.started_at.is_none() {
            status.started_at = Some(now);
            status.completed_at = None;
            status.error.clear();
        }
        if matches!(state, WorkerState::Completed | WorkerState::Failed) {
            status.completed_at = Some(now);
        }
        self.broadcast(status);
    }

    /// Record item progress. Unknown workers are ignored.
    pub fn set_progress(&self, name: &str, items_done: u64, items_total: u64, message: &str) {
        self.modify(name, |status| {
            status.items_done = items_done;
            status.items_total = items_total;
            status.message = message.to_string();
            if items_total > 0 {
                status.progress = (items_done * 100 / items_total) as u32;
            }
        });
    }

    pub fn set_error(&self, name: &str, error: &str) {
        self.modify(name, |status| {
            status.error = error.to_string();
            status.state = WorkerState::Failed;
            status.completed_at = Some(Utc::now());
        });
    }

    pub fn start_worker(&self, name: &str) {
        let mut statuses = self.statuses.write();
        let status = statuses
            .entry(name.to_string())
            .or_insert_with(|| WorkerStatus::new(name));
        *status = WorkerStatus {
            state: WorkerState::Running,
            started_at: Some(Utc::now()),
            message: "Starting...".into(),
            ..WorkerStatus::new(name)
        };
        self.broadcast(status);
    }

    pub fn complete_worker(&self, name: &str, message: &str) {
        self.modify(name, |status| {
            status.state = WorkerState::Completed;
            status.completed_at = Some(Utc::now());
            status.progress = 100;
            status.message = message.to_string();
        });
    }

    /// Back to idle. The last run's timestamps are kept.
    pub fn reset_worker(&self, name: &str) {
        self.modify(name, |status| {
            status.state = WorkerState::Idle;
            status.progress = 0;
            status.message.clear();
            status.items_done = 0;
            status.items_total = 0;
        });
    }

    pub fn status(&self, name: &str) -> Option<WorkerStatus> {
        self.statuses.read().get(name).cloned()
    }

    /// Current status of every known worker, ordered by name.
    pub fn snapshot(&self) -> Vec<StatusUpdate> {
        let now = Utc::now();
        let mut updates: Vec<StatusUpdate> = self
            .statuses
            .read()
            .iter()
            .map(|(name, status)| StatusUpdate {
                worker_name: name.clone(),
                status: status.clone(),
                timestamp: now,
            })
            .collect();
        updates.sort_by(|a, b| a.worker_name.cmp(&b.worker_name));
        updates
    }

    fn modify(&self, name: &str, f: impl FnOnce(&mut WorkerStatus)) {
        let mut statuses = self.statuses.write();
        if let Some(status) = statuses.get_mut(name) {
            f(status);
            self.broadcast(status);
        }
    }

    // Called with the write lock held so updates leave in mutation order.
    fn broadcast(&self, status: &WorkerStatus) {
        let _ = self.updates.send(StatusUpdate {
            worker_name: status.name.clone(),
            status: status.clone(),
            timestamp: Utc::now(),
        });
    }
}
