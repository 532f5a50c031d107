use std::sync::Arc;
use tracing::info;

use crate::context::RequestContext;
use crate::jobs::blocking_job;
use crate::tasks::{OperationKey, Submission, TaskStatus, TaskStatusTracker};

/// Recomputes repository statistics in the background
pub struct RefreshService {
    tracker: Arc<TaskStatusTracker>,
}

impl RefreshService {
    pub fn new(tracker: Arc<TaskStatusTracker>) -> Self {
        Self { tracker }
    }

    pub fn refresh(&self, ctx: &RequestContext) -> Submission {
        let backend = ctx.repo.backend.clone();
        let repo_id = ctx.repo.id.clone();
        let job = blocking_job(move || {
            let stats = backend.stats()?;
            info!(repo = %repo_id, commits = stats.commit_count, "repository refreshed");
            Ok(serde_json::to_value(stats)?)
        });
        self.tracker.submit(OperationKey::refresh(&ctx.repo.id), |ticket| {
            ctx.jobs.submit(ticket, job, self.tracker.clone())
        })
    }

    pub fn status(&self, ctx: &RequestContext) -> Option<TaskStatus> {
        self.tracker.get(&OperationKey::refresh(&ctx.repo.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Identity;
    use crate::context::{Actor, RepoHandle};
    use crate::jobs::{JobRunner, ManualJobRunner};
    use crate::memory::MemoryBackend;
    use serde_json::json;

    #[tokio::test]
    async fn refresh_reports_stats() {
        let backend = Arc::new(MemoryBackend::new("refresh"));
        backend.add_commit("c1", &[], 100, "init");
        backend.add_commit("c2", &["c1"], 200, "next");
        backend.set_branch("master", "c2");
        backend.set_tag("v1", "c1");

        let jobs = Arc::new(ManualJobRunner::new());
        let runner: Arc<dyn JobRunner> = jobs.clone();
        let ctx = RequestContext::new(
            RepoHandle::new("refresh", backend),
            Actor::new("ops", Identity::new("Ops", "ops@example.com")),
            runner,
        );
        let service = RefreshService::new(Arc::new(TaskStatusTracker::default()));

        assert!(service.refresh(&ctx).is_new());
        assert!(!service.refresh(&ctx).is_new());
        jobs.run_pending().await;

        let status = service.status(&ctx).unwrap();
        assert_eq!(
            status.result,
            Some(json!({ "commit_count": 2, "branch_count": 1, "tag_count": 1 }))
        );
    }
}
