//! Deduplicating status cache for asynchronous operations.
//!
//! Each logical operation (a mergeability check, a merge, a tarball build) is
//! identified by an [`OperationKey`]. At most one job per key is queued or busy
//! at a time: submitting again while one is in flight hands back the existing
//! status instead of launching a second job. The global map lock is only held
//! long enough to find or create a key's slot; the check-and-set itself runs
//! under the slot's own mutex.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKey(String);

impl OperationKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn can_merge(request_id: Uuid) -> Self {
        Self(format!("can_merge:{}", request_id))
    }

    pub fn merge(request_id: Uuid) -> Self {
        Self(format!("merge:{}", request_id))
    }

    pub fn tarball(revision: &str, path: Option<&str>) -> Self {
        Self(format!("tarball:{}:{}", revision, path.unwrap_or("")))
    }

    pub fn refresh(repo_id: &str) -> Self {
        Self(format!("refresh:{}", repo_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Absent,
    Queued,
    Busy,
    Ready,
    Error,
}

impl TaskState {
    /// Queued or busy
    pub fn is_pending(self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Busy)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Ready | TaskState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub key: OperationKey,
    pub job_id: Uuid,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub updated: DateTime<Utc>,
}

impl TaskStatus {
    fn queued(key: OperationKey) -> Self {
        Self {
            key,
            job_id: Uuid::new_v4(),
            state: TaskState::Queued,
            result: None,
            error: None,
            updated: Utc::now(),
        }
    }

    pub fn ticket(&self) -> TaskTicket {
        TaskTicket {
            key: self.key.clone(),
            job_id: self.job_id,
        }
    }
}

/// Handle passed to the job runner; reports are matched on `job_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTicket {
    pub key: OperationKey,
    pub job_id: Uuid,
}

/// Result of [`TaskStatusTracker::submit`]
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// A job for the key was already queued or busy
    Existing(TaskStatus),
    /// A new job was queued and launched
    Submitted(TaskStatus),
}

impl Submission {
    pub fn status(&self) -> &TaskStatus {
        match self {
            Submission::Existing(status) | Submission::Submitted(status) => status,
        }
    }

    pub fn into_status(self) -> TaskStatus {
        match self {
            Submission::Existing(status) | Submission::Submitted(status) => status,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Submission::Submitted(_))
    }
}

/// The `{status: ...}` body returned by status endpoints; `null` when absent
pub fn status_body(status: Option<&TaskStatus>) -> Value {
    json!({ "status": status.map(|s| s.state) })
}

type Slot = Arc<Mutex<Option<TaskStatus>>>;

pub struct TaskStatusTracker {
    slots: Mutex<HashMap<OperationKey, Slot>>,
    ttl: Option<Duration>,
}

impl Default for TaskStatusTracker {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TaskStatusTracker {
    /// `ttl` bounds how long ready/error entries stay readable
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn slot(&self, key: &OperationKey) -> Slot {
        self.slots.lock().entry(key.clone()).or_default().clone()
    }

    fn expired(&self, status: &TaskStatus) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        if !status.state.is_terminal() {
            return false;
        }
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => Utc::now() - status.updated >= ttl,
            Err(_) => false,
        }
    }

    /// Queue a job for `key` unless one is already queued or busy.
    ///
    /// `launch` runs under the key's lock with the ticket of the new job; it
    /// must hand the work off rather than report on the same key itself.
    pub fn submit<F>(&self, key: OperationKey, launch: F) -> Submission
    where
        F: FnOnce(TaskTicket),
    {
        let slot = self.slot(&key);
        let mut current = slot.lock();

        if let Some(status) = current.as_ref() {
            if status.state.is_pending() {
                debug!(key = %key, job_id = %status.job_id, "job already in flight");
                return Submission::Existing(status.clone());
            }
        }

        let status = TaskStatus::queued(key);
        debug!(key = %status.key, job_id = %status.job_id, "job queued");
        *current = Some(status.clone());
        launch(status.ticket());
        Submission::Submitted(status)
    }

    /// Current status, or `None` when absent or expired
    pub fn get(&self, key: &OperationKey) -> Option<TaskStatus> {
        let slot = self.slots.lock().get(key).cloned()?;
        let mut current = slot.lock();
        if current.as_ref().is_some_and(|status| self.expired(status)) {
            *current = None;
        }
        current.clone()
    }

    pub fn state(&self, key: &OperationKey) -> TaskState {
        self.get(key).map_or(TaskState::Absent, |status| status.state)
    }

    fn report<F>(&self, ticket: &TaskTicket, update: F) -> bool
    where
        F: FnOnce(&mut TaskStatus),
    {
        let Some(slot) = self.slots.lock().get(&ticket.key).cloned() else {
            return false;
        };
        let mut current = slot.lock();
        match current.as_mut() {
            Some(status) if status.job_id == ticket.job_id && !status.state.is_terminal() => {
                update(status);
                status.updated = Utc::now();
                true
            }
            _ => {
                warn!(key = %ticket.key, job_id = %ticket.job_id, "ignoring stale job report");
                false
            }
        }
    }

    /// Called by the runner when the job starts
    pub fn mark_busy(&self, ticket: &TaskTicket) -> bool {
        self.report(ticket, |status| status.state = TaskState::Busy)
    }

    /// Record the job outcome
    pub fn finish(&self, ticket: &TaskTicket, outcome: Result<Value, String>) -> bool {
        self.report(ticket, |status| match outcome {
            Ok(value) => {
                status.state = TaskState::Ready;
                status.result = Some(value);
            }
            Err(error) => {
                status.state = TaskState::Error;
                status.error = Some(error);
            }
        })
    }

    /// Drop expired and empty slots, returning how many were removed.
    ///
    /// A slot still held outside the map belongs to a caller that fetched it
    /// and has not locked it yet, so it stays.
    pub fn prune(&self) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Some(current) => current.as_ref().is_some_and(|status| !self.expired(status)),
                None => true,
            }
        });
        let removed = before - slots.len();
        if removed > 0 {
            debug!(removed, "pruned task slots");
        }
        removed
    }
}
