//! Handoff to the background job runner.
//!
//! A runner receives a boxed job together with its [`TaskTicket`]; it reports
//! `busy` when the job starts and `ready`/`error` when it completes. Runners
//! never retry.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::error::ForgeResult;
use crate::tasks::{TaskStatusTracker, TaskTicket};

pub type Job = BoxFuture<'static, Result<Value, String>>;

pub trait JobRunner: Send + Sync {
    fn submit(&self, ticket: TaskTicket, job: Job, tracker: Arc<TaskStatusTracker>);
}

/// Wrap synchronous backend work so it runs on the blocking pool
pub fn blocking_job<F>(work: F) -> Job
where
    F: FnOnce() -> ForgeResult<Value> + Send + 'static,
{
    async move {
        match tokio::task::spawn_blocking(work).await {
            Ok(outcome) => outcome.map_err(|e| e.to_string()),
            Err(e) => Err(format!("job panicked: {}", e)),
        }
    }
    .boxed()
}

async fn run(ticket: TaskTicket, job: Job, tracker: Arc<TaskStatusTracker>) {
    tracker.mark_busy(&ticket);
    let outcome = job.await;
    match &outcome {
        Ok(_) => info!(key = %ticket.key, job_id = %ticket.job_id, "job finished"),
        Err(e) => warn!(key = %ticket.key, job_id = %ticket.job_id, error = %e, "job failed"),
    }
    tracker.finish(&ticket, outcome);
    tracker.prune();
}

/// Spawns each job onto a tokio runtime
pub struct TokioJobRunner {
    handle: Handle,
}

impl TokioJobRunner {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Runner on the runtime of the calling task
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl JobRunner for TokioJobRunner {
    fn submit(&self, ticket: TaskTicket, job: Job, tracker: Arc<TaskStatusTracker>) {
        self.handle.spawn(run(ticket, job, tracker));
    }
}

/// Holds jobs until [`ManualJobRunner::run_pending`] is awaited
#[derive(Default)]
pub struct ManualJobRunner {
    queue: Mutex<Vec<(TaskTicket, Job, Arc<TaskStatusTracker>)>>,
}

impl ManualJobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run every queued job in submission order, returning how many ran
    pub async fn run_pending(&self) -> usize {
        let jobs = std::mem::take(&mut *self.queue.lock());
        let count = jobs.len();
        for (ticket, job, tracker) in jobs {
            run(ticket, job, tracker).await;
        }
        count
    }
}

impl JobRunner for ManualJobRunner {
    fn submit(&self, ticket: TaskTicket, job: Job, tracker: Arc<TaskStatusTracker>) {
        self.queue.lock().push((ticket, job, tracker));
    }
}
