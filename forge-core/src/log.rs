use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{Commit, Identity, RepositoryBackend};
use crate::error::ForgeResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: String,
}

/// One row of the paged commit listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub id: String,
    pub parents: Vec<ParentRef>,
    pub url: String,
    pub message: String,
    pub tree: Option<String>,
    pub committed_date: DateTime<Utc>,
    pub authored_date: DateTime<Utc>,
    pub author: Identity,
    pub committer: Identity,
}

impl CommitSummary {
    pub fn from_commit(backend: &dyn RepositoryBackend, commit: Commit) -> Self {
        Self {
            url: backend.url_for_commit(&commit.id),
            parents: commit.parents.into_iter().map(|id| ParentRef { id }).collect(),
            id: commit.id,
            message: commit.message,
            tree: commit.tree,
            committed_date: commit.committed,
            authored_date: commit.authored,
            author: commit.author,
            committer: commit.committer,
        }
    }
}

/// One page of history plus the commit that starts the next page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPage {
    pub commits: Vec<CommitSummary>,
    pub next_commit: Option<CommitSummary>,
    pub limit: usize,
    pub path: Option<String>,
    /// Whether `path` names a file (rather than a directory) at `rev`
    pub is_file: bool,
}

/// Whether `commit` changed `path` relative to every parent it has here
fn touches(backend: &dyn RepositoryBackend, commit: &Commit, path: &str) -> ForgeResult<bool> {
    let here = backend.path_entry(&commit.id, path)?.map(|entry| entry.oid);
    let parents = backend.commits(&commit.parents)?;
    if parents.is_empty() {
        return Ok(here.is_some());
    }
    for parent in &parents {
        if backend.path_entry(&parent.id, path)?.map(|entry| entry.oid) == here {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Up to `limit` commits reachable from `rev`, newest first, optionally only
/// those that changed `path`
pub fn commit_page(
    backend: &dyn RepositoryBackend,
    rev: &str,
    path: Option<&str>,
    limit: usize,
) -> ForgeResult<LogPage> {
    let limit = limit.max(1);
    let path = path.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty());

    let mut commits = match path {
        None => backend.log(rev, limit + 1)?,
        Some(path) => {
            let mut matching = Vec::new();
            for commit in backend.log(rev, usize::MAX)? {
                if touches(backend, &commit, path)? {
                    matching.push(commit);
                    if matching.len() > limit {
                        break;
                    }
                }
            }
            matching
        }
    };
    let next_commit = if commits.len() > limit { commits.pop() } else { None };

    let is_file = match path {
        Some(path) => {
            let tip = backend.resolve_commit(rev)?;
            backend.path_entry(&tip, path)?.is_some_and(|entry| !entry.is_dir)
        }
        None => false,
    };
    debug!(rev, ?path, count = commits.len(), "commit page");

    Ok(LogPage {
        commits: commits
            .into_iter()
            .map(|commit| CommitSummary::from_commit(backend, commit))
            .collect(),
        next_commit: next_commit.map(|commit| CommitSummary::from_commit(backend, commit)),
        limit,
        path: path.map(str::to_string),
        is_file,
    })
}
