use chrono::Utc;
use futures::future::FutureExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::discussion::Discussion;
use super::model::{
    render_changes, BranchSubstitution, Change, Downstream, MergeRequest, MergeRequestDraft,
    MergeRequestEdit, MergeRequestStatus, Resolved,
};
use super::store::MergeRequestStore;
use crate::backend::{Identity, MergeCheck};
use crate::context::{AccessControl, Permission, RepoHandle, RepositoryRegistry, RequestContext};
use crate::diff::unidiff;
use crate::error::{ForgeError, ForgeResult};
use crate::jobs::{blocking_job, Job};
use crate::log::CommitSummary;
use crate::tasks::{OperationKey, Submission, TaskState, TaskStatus, TaskStatusTracker};

struct BranchTip {
    name: String,
    commit_id: String,
}

/// Resolve `requested`, falling back to the repository's default branch
fn resolve_branch(
    repo: &RepoHandle,
    requested: &str,
    substitutions: &mut Vec<BranchSubstitution>,
) -> ForgeResult<BranchTip> {
    if let Some(commit_id) = repo.backend.resolve_branch(requested)? {
        return Ok(BranchTip {
            name: requested.to_string(),
            commit_id,
        });
    }

    let default = repo.backend.default_branch()?;
    let commit_id = repo
        .backend
        .resolve_branch(&default)?
        .ok_or_else(|| ForgeError::not_found("branch", requested))?;
    warn!(repo = %repo.id, requested, used = %default, "branch missing, using default");
    substitutions.push(BranchSubstitution {
        repo_id: repo.id.clone(),
        requested: requested.to_string(),
        used: default.clone(),
    });
    Ok(BranchTip {
        name: default,
        commit_id,
    })
}

/// Tip of the source branch, or the recorded commit if the branch is gone
fn current_source_commit(downstream: &RepoHandle, source: &Downstream) -> ForgeResult<String> {
    Ok(downstream
        .backend
        .resolve_branch(&source.branch)?
        .unwrap_or_else(|| source.commit_id.clone()))
}

fn status_note(old: MergeRequestStatus, new: MergeRequestStatus) -> String {
    render_changes(&[Change::Replaced {
        field: "Status",
        old: old.to_string(),
        new: new.to_string(),
    }])
}

/// The `{can_merge: ...}` body; `null` while unknown
pub fn can_merge_body(can_merge: Option<bool>) -> Value {
    json!({ "can_merge": can_merge })
}

/// Lifecycle of merge requests from a downstream branch into a target branch
pub struct MergeRequestEngine {
    store: Arc<dyn MergeRequestStore>,
    discussion: Arc<dyn Discussion>,
    access: Arc<dyn AccessControl>,
    registry: Arc<dyn RepositoryRegistry>,
    tracker: Arc<TaskStatusTracker>,
}

impl MergeRequestEngine {
    pub fn new(
        store: Arc<dyn MergeRequestStore>,
        discussion: Arc<dyn Discussion>,
        access: Arc<dyn AccessControl>,
        registry: Arc<dyn RepositoryRegistry>,
        tracker: Arc<TaskStatusTracker>,
    ) -> Self {
        Self {
            store,
            discussion,
            access,
            registry,
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<TaskStatusTracker> {
        &self.tracker
    }

    async fn require(
        &self,
        ctx: &RequestContext,
        repo_id: &str,
        permission: Permission,
    ) -> ForgeResult<()> {
        if self.access.has_permission(&ctx.actor, repo_id, permission).await {
            Ok(())
        } else {
            Err(ForgeError::PermissionDenied(format!(
                "{} lacks {:?} access to {}",
                ctx.actor.username, permission, repo_id
            )))
        }
    }

    /// Load a request targeting the context repository
    async fn load(&self, ctx: &RequestContext, id: Uuid) -> ForgeResult<MergeRequest> {
        match self.store.get(id).await? {
            Some(request) if request.target_repo == ctx.repo.id => Ok(request),
            _ => Err(ForgeError::not_found("merge request", id.to_string())),
        }
    }

    /// Tip of the request's target branch, or of the default branch if it is gone
    fn target_tip(
        &self,
        ctx: &RequestContext,
        request: &MergeRequest,
        substitutions: &mut Vec<BranchSubstitution>,
    ) -> ForgeResult<BranchTip> {
        resolve_branch(&ctx.repo, &request.target_branch, substitutions)
    }

    #[instrument(skip(self, ctx, draft), fields(repo = %ctx.repo.id, target = %draft.target_repo))]
    pub async fn create(
        &self,
        ctx: &RequestContext,
        draft: MergeRequestDraft,
    ) -> ForgeResult<Resolved<MergeRequest>> {
        self.require(ctx, &draft.target_repo, Permission::Write).await?;
        let target = self.registry.require(&draft.target_repo)?;

        let mut substitutions = Vec::new();
        let source = resolve_branch(&ctx.repo, &draft.source_branch, &mut substitutions)?;
        let target_branch = resolve_branch(&target, &draft.target_branch, &mut substitutions)?;

        let number = self.store.next_number(&target.id).await?;
        let title = format!("Discussion for Merge Request #{}: {}", number, draft.summary);
        let thread_id = self.discussion.open_thread(&title).await?;

        let now = Utc::now();
        let request = MergeRequest {
            id: Uuid::new_v4(),
            number,
            downstream: Downstream {
                repo_id: ctx.repo.id.clone(),
                branch: source.name,
                commit_id: source.commit_id,
            },
            target_repo: target.id,
            target_branch: target_branch.name,
            status: MergeRequestStatus::Open,
            summary: draft.summary,
            description: draft.description,
            thread_id,
            creator: ctx.actor.username.clone(),
            created: now,
            modified: now,
        };
        self.store.insert(request.clone()).await?;

        info!(id = %request.id, number, "merge request created");
        Ok(Resolved::new(request, substitutions))
    }

    #[instrument(skip(self, ctx, edit), fields(repo = %ctx.repo.id))]
    pub async fn edit(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        edit: MergeRequestEdit,
    ) -> ForgeResult<Resolved<MergeRequest>> {
        self.require(ctx, &ctx.repo.id, Permission::Write).await?;
        let mut request = self.load(ctx, id).await?;
        if !request.is_open() {
            return Err(ForgeError::InvalidTransition {
                from: request.status.to_string(),
                to: "edited".to_string(),
            });
        }

        let downstream = self.registry.require(&request.downstream.repo_id)?;
        let mut substitutions = Vec::new();
        let source = resolve_branch(&downstream, &edit.source_branch, &mut substitutions)?;
        let target = resolve_branch(&ctx.repo, &edit.target_branch, &mut substitutions)?;

        let mut changes = Vec::new();
        if request.summary != edit.summary {
            changes.push(Change::Replaced {
                field: "Summary",
                old: std::mem::replace(&mut request.summary, edit.summary.clone()),
                new: edit.summary,
            });
        }
        if request.target_branch != target.name {
            changes.push(Change::Replaced {
                field: "Target branch",
                old: std::mem::replace(&mut request.target_branch, target.name.clone()),
                new: target.name,
            });
        }
        if request.downstream.branch != source.name {
            changes.push(Change::Replaced {
                field: "Source branch",
                old: std::mem::replace(&mut request.downstream.branch, source.name.clone()),
                new: source.name,
            });
        }
        if request.description != edit.description {
            changes.push(Change::Diff {
                field: "Description",
                diff: unidiff(&request.description, &edit.description)?,
            });
            request.description = edit.description;
        }
        request.downstream.commit_id = source.commit_id;
        request.modified = Utc::now();

        if !changes.is_empty() {
            self.discussion
                .add_post(&request.thread_id, &render_changes(&changes), true)
                .await?;
        }
        self.store.update(request.clone()).await?;
        Ok(Resolved::new(request, substitutions))
    }

    /// Queue a mergeability check; returns the in-flight one if any
    #[instrument(skip(self, ctx), fields(repo = %ctx.repo.id))]
    pub async fn request_mergeability_check(
        &self,
        ctx: &RequestContext,
        id: Uuid,
    ) -> ForgeResult<Resolved<Submission>> {
        let request = self.load(ctx, id).await?;
        if !request.is_open() {
            return Err(ForgeError::MergeNotAllowed(format!("merge request is {}", request.status)));
        }

        let mut substitutions = Vec::new();
        let target_branch = self.target_tip(ctx, &request, &mut substitutions)?.name;
        let downstream = self.registry.require(&request.downstream.repo_id)?;
        let target = ctx.repo.clone();
        let source = request.downstream.clone();
        let job = blocking_job(move || {
            let commit = current_source_commit(&downstream, &source)?;
            target
                .backend
                .import_branch(downstream.backend.as_ref(), &source.branch, &commit)?;
            let check = target.backend.merge_check(&commit, &target_branch)?;
            Ok(serde_json::to_value(check)?)
        });

        let submission = self.tracker.submit(OperationKey::can_merge(request.id), |ticket| {
            ctx.jobs.submit(ticket, job, self.tracker.clone())
        });
        Ok(Resolved::new(submission, substitutions))
    }

    pub async fn mergeability(
        &self,
        ctx: &RequestContext,
        id: Uuid,
    ) -> ForgeResult<Option<TaskStatus>> {
        let request = self.load(ctx, id).await?;
        Ok(self.tracker.get(&OperationKey::can_merge(request.id)))
    }

    /// Cached mergeability, trusted only for the current source and target tips
    pub async fn can_merge(&self, ctx: &RequestContext, id: Uuid) -> ForgeResult<Option<bool>> {
        let request = self.load(ctx, id).await?;
        if !request.is_open() {
            return Ok(Some(false));
        }

        let Some(status) = self.tracker.get(&OperationKey::can_merge(request.id)) else {
            return Ok(None);
        };
        if status.state != TaskState::Ready {
            return Ok(None);
        }
        let check = status
            .result
            .and_then(|v| serde_json::from_value::<MergeCheck>(v).ok());
        let Some(check) = check else {
            return Ok(None);
        };

        let downstream = self.registry.require(&request.downstream.repo_id)?;
        let source = current_source_commit(&downstream, &request.downstream)?;
        let target = self.target_tip(ctx, &request, &mut Vec::new())?;
        if check.source_commit == source && target.commit_id == check.target_commit {
            Ok(Some(check.mergeable))
        } else {
            Ok(None)
        }
    }

    #[instrument(skip(self, ctx), fields(repo = %ctx.repo.id))]
    pub async fn merge(&self, ctx: &RequestContext, id: Uuid) -> ForgeResult<Resolved<Submission>> {
        self.require(ctx, &ctx.repo.id, Permission::Write).await?;
        let request = self.load(ctx, id).await?;

        let key = OperationKey::merge(request.id);
        if let Some(status) = self.tracker.get(&key) {
            if status.state.is_pending() {
                return Ok(Resolved::new(Submission::Existing(status), Vec::new()));
            }
        }
        if !request.is_open() {
            return Err(ForgeError::MergeNotAllowed(format!("merge request is {}", request.status)));
        }
        match self.can_merge(ctx, id).await? {
            Some(true) => {}
            Some(false) => {
                return Err(ForgeError::MergeNotAllowed(
                    "source branch does not merge cleanly".to_string(),
                ))
            }
            None => {
                return Err(ForgeError::MergeNotAllowed(
                    "mergeability has not been checked for the current commits".to_string(),
                ))
            }
        }

        let mut substitutions = Vec::new();
        let target_branch = self.target_tip(ctx, &request, &mut substitutions)?.name;
        let downstream = self.registry.require(&request.downstream.repo_id)?;
        let job = self.merge_job(
            ctx.repo.clone(),
            downstream,
            request,
            target_branch,
            ctx.actor.identity.clone(),
        );
        let submission = self
            .tracker
            .submit(key, |ticket| ctx.jobs.submit(ticket, job, self.tracker.clone()));
        Ok(Resolved::new(submission, substitutions))
    }

    fn merge_job(
        &self,
        target: RepoHandle,
        downstream: RepoHandle,
        request: MergeRequest,
        target_branch: String,
        author: Identity,
    ) -> Job {
        let store = self.store.clone();
        let discussion = self.discussion.clone();

        async move {
            // The request may have been closed since the merge was queued
            match store.get(request.id).await.map_err(|e| e.to_string())? {
                Some(current) if current.is_open() => {}
                Some(current) => return Err(format!("merge request is {}", current.status)),
                None => return Err(format!("merge request not found: {}", request.id)),
            }

            let source = request.downstream.clone();
            let message = format!("Merge request #{}: {}", request.number, request.summary);
            let backend = target.backend.clone();

            let merged = tokio::task::spawn_blocking(move || -> ForgeResult<String> {
                let commit = current_source_commit(&downstream, &source)?;
                backend.import_branch(downstream.backend.as_ref(), &source.branch, &commit)?;
                backend.merge(&commit, &target_branch, &message, &author)
            })
            .await
            .map_err(|e| format!("job panicked: {}", e))?
            .map_err(|e| e.to_string())?;

            mark_merged(store.as_ref(), discussion.as_ref(), request.id)
                .await
                .map_err(|e| e.to_string())?;
            info!(id = %request.id, commit = %merged, "merge request merged");
            Ok::<Value, String>(json!({ "merged_commit": merged }))
        }
        .boxed()
    }

    pub async fn merge_status(
        &self,
        ctx: &RequestContext,
        id: Uuid,
    ) -> ForgeResult<Option<TaskStatus>> {
        let request = self.load(ctx, id).await?;
        Ok(self.tracker.get(&OperationKey::merge(request.id)))
    }

    /// Operator status change; setting the current status again is a no-op
    #[instrument(skip(self, ctx), fields(repo = %ctx.repo.id))]
    pub async fn set_status(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        status: MergeRequestStatus,
    ) -> ForgeResult<MergeRequest> {
        self.require(ctx, &ctx.repo.id, Permission::Write).await?;
        let mut request = self.load(ctx, id).await?;
        if request.status == status {
            return Ok(request);
        }
        let merging = self.tracker.state(&OperationKey::merge(request.id)).is_pending();
        if request.status.is_terminal() || merging {
            return Err(ForgeError::InvalidTransition {
                from: request.status.to_string(),
                to: status.to_string(),
            });
        }

        self.discussion
            .add_post(&request.thread_id, &status_note(request.status, status), true)
            .await?;
        request.status = status;
        request.modified = Utc::now();
        self.store.update(request.clone()).await?;
        Ok(request)
    }

    pub async fn get(&self, ctx: &RequestContext, id: Uuid) -> ForgeResult<MergeRequest> {
        self.load(ctx, id).await
    }

    /// Lookup by the request number within the context repository
    pub async fn get_by_number(
        &self,
        ctx: &RequestContext,
        number: u64,
    ) -> ForgeResult<MergeRequest> {
        self.store
            .get_by_number(&ctx.repo.id, number)
            .await?
            .ok_or_else(|| ForgeError::not_found("merge request", format!("#{}", number)))
    }

    /// Commits on the source branch that the target branch does not have yet
    pub async fn commits(
        &self,
        ctx: &RequestContext,
        id: Uuid,
    ) -> ForgeResult<Resolved<Vec<CommitSummary>>> {
        let request = self.load(ctx, id).await?;
        let downstream = self.registry.require(&request.downstream.repo_id)?;
        let mut substitutions = Vec::new();
        let target = self.target_tip(ctx, &request, &mut substitutions)?;
        let source = current_source_commit(&downstream, &request.downstream)?;

        let merged: HashSet<String> = ctx
            .repo
            .backend
            .log(&target.commit_id, usize::MAX)?
            .into_iter()
            .map(|commit| commit.id)
            .collect();
        let commits = downstream
            .backend
            .log(&source, usize::MAX)?
            .into_iter()
            .filter(|commit| !merged.contains(&commit.id))
            .map(|commit| CommitSummary::from_commit(downstream.backend.as_ref(), commit))
            .collect();
        Ok(Resolved::new(commits, substitutions))
    }

    /// Requests targeting the context repository; no statuses means open only
    pub async fn list(
        &self,
        ctx: &RequestContext,
        statuses: &[MergeRequestStatus],
    ) -> ForgeResult<Vec<MergeRequest>> {
        let statuses = if statuses.is_empty() {
            &[MergeRequestStatus::Open][..]
        } else {
            statuses
        };
        self.store.list(&ctx.repo.id, statuses).await
    }
}

async fn mark_merged(
    store: &dyn MergeRequestStore,
    discussion: &dyn Discussion,
    id: Uuid,
) -> ForgeResult<()> {
    let mut request = store
        .get(id)
        .await?
        .ok_or_else(|| ForgeError::not_found("merge request", id.to_string()))?;
    if !request.is_open() {
        return Err(ForgeError::InvalidTransition {
            from: request.status.to_string(),
            to: MergeRequestStatus::Merged.to_string(),
        });
    }
    let previous = request.status;
    request.status = MergeRequestStatus::Merged;
    request.modified = Utc::now();
    store.update(request.clone()).await?;
    discussion
        .add_post(&request.thread_id, &status_note(previous, MergeRequestStatus::Merged), true)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RepositoryBackend;
    use crate::context::{Actor, InMemoryRegistry, StaticAccessControl};
    use crate::jobs::{JobRunner, ManualJobRunner};
    use crate::memory::MemoryBackend;
    use crate::merge_request::discussion::InMemoryDiscussion;
    use crate::merge_request::store::{InMemoryMergeRequestStore, MergeRequestStore};
    use pretty_assertions::assert_eq;

    struct Fixture {
        engine: MergeRequestEngine,
        store: Arc<InMemoryMergeRequestStore>,
        upstream: Arc<MemoryBackend>,
        fork: Arc<MemoryBackend>,
        discussion: Arc<InMemoryDiscussion>,
        jobs: Arc<ManualJobRunner>,
    }

    fn alice() -> Actor {
        Actor::new("alice", Identity::new("Alice", "alice@example.com"))
    }

    fn fixture() -> Fixture {
        let upstream = Arc::new(MemoryBackend::new("upstream"));
        upstream.add_commit("c1", &[], 100, "initial");
        upstream.set_files("c1", &[("README", "hello\n")]);
        upstream.set_branch("master", "c1");

        let fork = Arc::new(MemoryBackend::new("fork"));
        fork.add_commit("c1", &[], 100, "initial");
        fork.add_commit("c2", &["c1"], 200, "feature work");
        fork.set_files("c1", &[("README", "hello\n")]);
        fork.set_files("c2", &[("README", "hello\n"), ("feature.rs", "fn f() {}\n")]);
        fork.set_branch("master", "c1");
        fork.set_branch("feature", "c2");

        let registry = Arc::new(InMemoryRegistry::new());
        registry.register("upstream", upstream.clone());
        registry.register("fork", fork.clone());

        let access = Arc::new(StaticAccessControl::new());
        access.grant("alice", "upstream", Permission::Write);

        let store = Arc::new(InMemoryMergeRequestStore::new());
        let discussion = Arc::new(InMemoryDiscussion::new());
        let engine = MergeRequestEngine::new(
            store.clone(),
            discussion.clone(),
            access,
            registry,
            Arc::new(TaskStatusTracker::default()),
        );

        Fixture {
            engine,
            store,
            upstream,
            fork,
            discussion,
            jobs: Arc::new(ManualJobRunner::new()),
        }
    }

    impl Fixture {
        fn ctx_as(&self, repo: &str, actor: Actor) -> RequestContext {
            let backend: Arc<dyn RepositoryBackend> = if repo == "fork" {
                self.fork.clone()
            } else {
                self.upstream.clone()
            };
            let jobs: Arc<dyn JobRunner> = self.jobs.clone();
            RequestContext::new(RepoHandle::new(repo, backend), actor, jobs)
        }

        fn ctx(&self, repo: &str) -> RequestContext {
            self.ctx_as(repo, alice())
        }

        fn draft(&self, source_branch: &str) -> MergeRequestDraft {
            MergeRequestDraft {
                source_branch: source_branch.to_string(),
                target_repo: "upstream".to_string(),
                target_branch: "master".to_string(),
                summary: "Add feature".to_string(),
                description: "Adds it.\n".to_string(),
            }
        }

        async fn open_request(&self) -> MergeRequest {
            self.engine
                .create(&self.ctx("fork"), self.draft("feature"))
                .await
                .unwrap()
                .value
        }

        async fn checked_request(&self) -> MergeRequest {
            let request = self.open_request().await;
            self.engine
                .request_mergeability_check(&self.ctx("upstream"), request.id)
                .await
                .unwrap();
            self.jobs.run_pending().await;
            request
        }
    }

    #[tokio::test]
    async fn create_opens_request_with_thread() {
        let fx = fixture();
        let created = fx.engine.create(&fx.ctx("fork"), fx.draft("feature")).await.unwrap();
        let request = created.value;

        assert!(created.substitutions.is_empty());
        assert_eq!(request.status, MergeRequestStatus::Open);
        assert_eq!(request.number, 1);
        assert_eq!(
            request.downstream,
            Downstream {
                repo_id: "fork".to_string(),
                branch: "feature".to_string(),
                commit_id: "c2".to_string(),
            }
        );
        assert_eq!(
            fx.discussion.title(&request.thread_id).as_deref(),
            Some("Discussion for Merge Request #1: Add feature")
        );
        assert_eq!(fx.open_request().await.number, 2);

        let listed = fx.engine.list(&fx.ctx("upstream"), &[]).await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn create_requires_write_on_target() {
        let fx = fixture();
        let bob = Actor::new("bob", Identity::new("Bob", "bob@example.com"));
        let result = fx.engine.create(&fx.ctx_as("fork", bob), fx.draft("feature")).await;
        assert!(matches!(result, Err(ForgeError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn missing_source_branch_falls_back_to_default() {
        let fx = fixture();
        let created = fx.engine.create(&fx.ctx("fork"), fx.draft("deleted")).await.unwrap();

        assert_eq!(
            created.substitutions,
            vec![BranchSubstitution {
                repo_id: "fork".to_string(),
                requested: "deleted".to_string(),
                used: "master".to_string(),
            }]
        );
        assert_eq!(created.value.downstream.branch, "master");
        assert_eq!(created.value.downstream.commit_id, "c1");
    }

    #[tokio::test]
    async fn edit_posts_change_log_and_tracks_source() {
        let fx = fixture();
        let request = fx.open_request().await;
        let ctx = fx.ctx("upstream");

        fx.fork.add_commit("c3", &["c2"], 300, "more work");
        fx.fork.set_branch("feature", "c3");

        let edited = fx
            .engine
            .edit(
                &ctx,
                request.id,
                MergeRequestEdit {
                    summary: "Better feature".to_string(),
                    description: "Adds it properly.\n".to_string(),
                    source_branch: "feature".to_string(),
                    target_branch: "master".to_string(),
                },
            )
            .await
            .unwrap()
            .value;
        assert_eq!(edited.summary, "Better feature");
        assert_eq!(edited.downstream.commit_id, "c3");
        assert_eq!(edited.status, MergeRequestStatus::Open);

        let posts = fx.discussion.posts(&request.thread_id);
        assert_eq!(posts.len(), 1);
        assert!(posts[0].is_meta);
        assert!(posts[0].text.starts_with("- **Summary**: Add feature → Better feature\n"));
        assert!(posts[0].text.contains("-Adds it.\n+Adds it properly.\n"));
        assert!(!posts[0].text.contains("Target branch"));

        // Resubmitting the same values posts nothing
        fx.engine
            .edit(
                &ctx,
                request.id,
                MergeRequestEdit {
                    summary: edited.summary.clone(),
                    description: edited.description.clone(),
                    source_branch: "feature".to_string(),
                    target_branch: "master".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(fx.discussion.posts(&request.thread_id).len(), 1);
    }

    #[tokio::test]
    async fn closed_request_cannot_be_edited() {
        let fx = fixture();
        let request = fx.open_request().await;
        let ctx = fx.ctx("upstream");
        fx.engine
            .set_status(&ctx, request.id, MergeRequestStatus::Rejected)
            .await
            .unwrap();

        let result = fx
            .engine
            .edit(
                &ctx,
                request.id,
                MergeRequestEdit {
                    summary: "x".to_string(),
                    description: String::new(),
                    source_branch: "feature".to_string(),
                    target_branch: "master".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(ForgeError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn mergeability_check_is_deduplicated() {
        let fx = fixture();
        let request = fx.open_request().await;
        let ctx = fx.ctx("upstream");

        let first = fx.engine.request_mergeability_check(&ctx, request.id).await.unwrap();
        let second = fx.engine.request_mergeability_check(&ctx, request.id).await.unwrap();
        assert!(first.substitutions.is_empty());
        assert_eq!(first.value.status().job_id, second.value.status().job_id);
        assert_eq!(fx.jobs.pending(), 1);
        assert_eq!(fx.engine.can_merge(&ctx, request.id).await.unwrap(), None);

        fx.jobs.run_pending().await;
        let status = fx.engine.mergeability(&ctx, request.id).await.unwrap().unwrap();
        assert_eq!(status.state, TaskState::Ready);
        assert_eq!(fx.engine.can_merge(&ctx, request.id).await.unwrap(), Some(true));
        assert_eq!(can_merge_body(Some(true)), json!({ "can_merge": true }));
    }

    #[tokio::test]
    async fn stale_check_is_not_trusted() {
        let fx = fixture();
        let request = fx.checked_request().await;
        let ctx = fx.ctx("upstream");
        assert_eq!(fx.engine.can_merge(&ctx, request.id).await.unwrap(), Some(true));

        fx.fork.add_commit("c3", &["c2"], 300, "more work");
        fx.fork.set_branch("feature", "c3");
        assert_eq!(fx.engine.can_merge(&ctx, request.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn merge_requires_positive_check() {
        let fx = fixture();
        let request = fx.open_request().await;
        let ctx = fx.ctx("upstream");

        let unchecked = fx.engine.merge(&ctx, request.id).await;
        assert!(matches!(unchecked, Err(ForgeError::MergeNotAllowed(_))));

        fx.upstream.add_commit("u2", &["c1"], 250, "upstream work");
        fx.upstream.set_branch("master", "u2");
        fx.upstream.set_merge_conflicts(&["README"]);
        fx.engine.request_mergeability_check(&ctx, request.id).await.unwrap();
        fx.jobs.run_pending().await;

        assert_eq!(fx.engine.can_merge(&ctx, request.id).await.unwrap(), Some(false));
        let conflicted = fx.engine.merge(&ctx, request.id).await;
        assert!(matches!(conflicted, Err(ForgeError::MergeNotAllowed(_))));
        assert_eq!(fx.jobs.pending(), 0);
    }

    #[tokio::test]
    async fn concurrent_merges_run_once() {
        let fx = fixture();
        let request = fx.checked_request().await;
        let ctx = fx.ctx("upstream");

        let (a, b) = tokio::join!(
            fx.engine.merge(&ctx, request.id),
            fx.engine.merge(&ctx, request.id)
        );
        assert_eq!(a.unwrap().value.status().job_id, b.unwrap().value.status().job_id);
        assert_eq!(fx.jobs.pending(), 1);

        fx.jobs.run_pending().await;
        assert_eq!(fx.upstream.merge_count(), 1);
        assert_eq!(fx.upstream.resolve_branch("master").unwrap().as_deref(), Some("c2"));

        let merged = fx.engine.get(&ctx, request.id).await.unwrap();
        assert_eq!(merged.status, MergeRequestStatus::Merged);
        let status = fx.engine.merge_status(&ctx, request.id).await.unwrap().unwrap();
        assert_eq!(status.state, TaskState::Ready);
        assert_eq!(status.result, Some(json!({ "merged_commit": "c2" })));

        let posts = fx.discussion.posts(&request.thread_id);
        assert_eq!(posts.last().map(|p| p.text.as_str()), Some("- **Status**: open → merged"));

        let again = fx.engine.merge(&ctx, request.id).await;
        assert!(matches!(again, Err(ForgeError::MergeNotAllowed(_))));
        assert_eq!(fx.engine.can_merge(&ctx, request.id).await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn failed_merge_leaves_request_open() {
        let fx = fixture();
        fx.upstream.add_commit("u2", &["c1"], 250, "upstream work");
        fx.upstream.set_branch("master", "u2");
        let request = fx.checked_request().await;
        let ctx = fx.ctx("upstream");

        fx.engine.merge(&ctx, request.id).await.unwrap();
        fx.upstream.set_merge_conflicts(&["README"]);
        fx.jobs.run_pending().await;

        let status = fx.engine.merge_status(&ctx, request.id).await.unwrap().unwrap();
        assert_eq!(status.state, TaskState::Error);
        assert!(status.error.unwrap_or_default().contains("README"));
        assert_eq!(
            fx.engine.get(&ctx, request.id).await.unwrap().status,
            MergeRequestStatus::Open
        );
    }

    #[tokio::test]
    async fn status_changes_are_one_way() {
        let fx = fixture();
        let request = fx.open_request().await;
        let ctx = fx.ctx("upstream");

        fx.engine
            .set_status(&ctx, request.id, MergeRequestStatus::Open)
            .await
            .unwrap();
        assert!(fx.discussion.posts(&request.thread_id).is_empty());

        let rejected = fx
            .engine
            .set_status(&ctx, request.id, MergeRequestStatus::Rejected)
            .await
            .unwrap();
        assert_eq!(rejected.status, MergeRequestStatus::Rejected);
        assert_eq!(
            fx.discussion.posts(&request.thread_id)[0].text,
            "- **Status**: open → rejected"
        );

        let reopen = fx.engine.set_status(&ctx, request.id, MergeRequestStatus::Open).await;
        assert!(matches!(reopen, Err(ForgeError::InvalidTransition { .. })));

        assert!(fx.engine.list(&ctx, &[]).await.unwrap().is_empty());
        assert_eq!(
            fx.engine
                .list(&ctx, &[MergeRequestStatus::Rejected])
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn status_change_is_refused_while_merge_is_queued() {
        let fx = fixture();
        let request = fx.checked_request().await;
        let ctx = fx.ctx("upstream");

        fx.engine.merge(&ctx, request.id).await.unwrap();
        let rejected = fx.engine.set_status(&ctx, request.id, MergeRequestStatus::Rejected).await;
        assert!(matches!(rejected, Err(ForgeError::InvalidTransition { .. })));

        fx.jobs.run_pending().await;
        assert_eq!(fx.upstream.merge_count(), 1);
        assert_eq!(
            fx.engine.get(&ctx, request.id).await.unwrap().status,
            MergeRequestStatus::Merged
        );
        let posts: Vec<String> = fx
            .discussion
            .posts(&request.thread_id)
            .into_iter()
            .map(|post| post.text)
            .collect();
        assert_eq!(posts, vec!["- **Status**: open → merged".to_string()]);
    }

    #[tokio::test]
    async fn queued_merge_skips_request_closed_meanwhile() {
        let fx = fixture();
        let request = fx.checked_request().await;
        let ctx = fx.ctx("upstream");

        fx.engine.merge(&ctx, request.id).await.unwrap();
        let mut closed = fx.engine.get(&ctx, request.id).await.unwrap();
        closed.status = MergeRequestStatus::Rejected;
        fx.store.update(closed).await.unwrap();
        fx.jobs.run_pending().await;

        let status = fx.engine.merge_status(&ctx, request.id).await.unwrap().unwrap();
        assert_eq!(status.state, TaskState::Error);
        assert!(status.error.unwrap_or_default().contains("rejected"));
        assert_eq!(fx.upstream.merge_count(), 0);
        assert_eq!(fx.upstream.resolve_branch("master").unwrap().as_deref(), Some("c1"));
        assert_eq!(
            fx.engine.get(&ctx, request.id).await.unwrap().status,
            MergeRequestStatus::Rejected
        );
    }

    #[tokio::test]
    async fn mark_merged_refuses_closed_request() {
        let fx = fixture();
        let request = fx.open_request().await;
        let ctx = fx.ctx("upstream");
        fx.engine
            .set_status(&ctx, request.id, MergeRequestStatus::Rejected)
            .await
            .unwrap();

        let result = mark_merged(fx.store.as_ref(), fx.discussion.as_ref(), request.id).await;
        assert!(matches!(result, Err(ForgeError::InvalidTransition { .. })));
        assert_eq!(fx.discussion.posts(&request.thread_id).len(), 1);
    }

    /// Request against `release`, which is then deleted upstream
    async fn request_on_deleted_target(fx: &Fixture) -> MergeRequest {
        fx.upstream.set_branch("release", "c1");
        let mut draft = fx.draft("feature");
        draft.target_branch = "release".to_string();
        let request = fx.engine.create(&fx.ctx("fork"), draft).await.unwrap().value;
        assert_eq!(request.target_branch, "release");
        fx.upstream.delete_branch("release");
        request
    }

    fn release_to_master() -> BranchSubstitution {
        BranchSubstitution {
            repo_id: "upstream".to_string(),
            requested: "release".to_string(),
            used: "master".to_string(),
        }
    }

    #[tokio::test]
    async fn deleted_target_falls_back_for_check_and_merge() {
        let fx = fixture();
        let request = request_on_deleted_target(&fx).await;
        let ctx = fx.ctx("upstream");

        let check = fx.engine.request_mergeability_check(&ctx, request.id).await.unwrap();
        assert_eq!(check.substitutions, vec![release_to_master()]);
        fx.jobs.run_pending().await;
        let status = fx.engine.mergeability(&ctx, request.id).await.unwrap().unwrap();
        assert_eq!(status.state, TaskState::Ready);
        assert_eq!(fx.engine.can_merge(&ctx, request.id).await.unwrap(), Some(true));

        let merge = fx.engine.merge(&ctx, request.id).await.unwrap();
        assert_eq!(merge.substitutions, vec![release_to_master()]);
        fx.jobs.run_pending().await;
        assert_eq!(fx.upstream.merge_count(), 1);
        assert_eq!(fx.upstream.resolve_branch("master").unwrap().as_deref(), Some("c2"));
        assert_eq!(fx.upstream.resolve_branch("release").unwrap(), None);
    }

    #[tokio::test]
    async fn edit_with_deleted_target_records_substitution() {
        let fx = fixture();
        let request = request_on_deleted_target(&fx).await;

        let edited = fx
            .engine
            .edit(
                &fx.ctx("upstream"),
                request.id,
                MergeRequestEdit {
                    summary: request.summary.clone(),
                    description: request.description.clone(),
                    source_branch: "feature".to_string(),
                    target_branch: "release".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(edited.substitutions, vec![release_to_master()]);
        assert_eq!(edited.value.target_branch, "master");
        assert_eq!(
            fx.discussion.posts(&request.thread_id)[0].text,
            "- **Target branch**: release → master"
        );
    }

    #[tokio::test]
    async fn lookup_by_number_is_scoped_to_target_repo() {
        let fx = fixture();
        let first = fx.open_request().await;
        let second = fx.open_request().await;
        let ctx = fx.ctx("upstream");

        assert_eq!(fx.engine.get_by_number(&ctx, 2).await.unwrap().id, second.id);
        assert_eq!(fx.engine.get_by_number(&ctx, 1).await.unwrap().id, first.id);
        let unknown = fx.engine.get_by_number(&ctx, 3).await;
        assert!(matches!(unknown, Err(ForgeError::NotFound { .. })));
        let other_repo = fx.engine.get_by_number(&fx.ctx("fork"), 1).await;
        assert!(matches!(other_repo, Err(ForgeError::NotFound { .. })));
    }

    #[tokio::test]
    async fn commits_lists_source_work_missing_from_target() {
        let fx = fixture();
        let request = fx.open_request().await;
        let ctx = fx.ctx("upstream");

        let ids = |listed: Vec<CommitSummary>| -> Vec<String> {
            listed.into_iter().map(|c| c.id).collect()
        };
        let listed = fx.engine.commits(&ctx, request.id).await.unwrap();
        assert!(listed.substitutions.is_empty());
        assert_eq!(ids(listed.value), vec!["c2".to_string()]);

        fx.fork.add_commit("c3", &["c2"], 300, "more work");
        fx.fork.set_branch("feature", "c3");
        let listed = fx.engine.commits(&ctx, request.id).await.unwrap();
        assert_eq!(ids(listed.value), vec!["c3".to_string(), "c2".to_string()]);
    }

    #[tokio::test]
    async fn requests_are_scoped_to_target_repo() {
        let fx = fixture();
        let request = fx.open_request().await;
        let wrong = fx.engine.get(&fx.ctx("fork"), request.id).await;
        assert!(matches!(wrong, Err(ForgeError::NotFound { .. })));
    }
}
