use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use crate::config::{BackendKind, RepositoryConfig};
use crate::error::{ForgeError, ForgeResult};
use crate::memory::MemoryBackend;
use crate::repository::GitBackend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// A commit as supplied by the backend. Never mutated by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub parents: Vec<String>,
    pub author: Identity,
    pub committer: Identity,
    pub authored: DateTime<Utc>,
    pub committed: DateTime<Utc>,
    pub message: String,
    pub tree: Option<String>,
}

impl Commit {
    /// Check if this is a root commit (no parents)
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// Check if this is a merge commit (multiple parents)
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// First line of the message
    pub fn summary(&self) -> Option<&str> {
        self.message.lines().next().filter(|line| !line.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Branch,
    Tag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefInfo {
    pub name: String,
    pub kind: RefKind,
    pub commit_id: String,
}

/// Readiness of a repository as seen by the forge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoStatus {
    Ready,
    Initializing,
    Unavailable,
}

/// One entry of a flattened tree listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub oid: String,
    pub is_dir: bool,
}

/// Outcome of a mergeability check of a source commit into a target branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCheck {
    pub mergeable: bool,
    pub fast_forward: bool,
    pub conflicts: Vec<String>,
    pub source_commit: String,
    pub target_commit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStats {
    pub commit_count: usize,
    pub branch_count: usize,
    pub tag_count: usize,
}

/// Capability interface implemented once per VCS kind.
///
/// Implementations are selected at configuration time through
/// [`open_backend`]; callers only ever see `Arc<dyn RepositoryBackend>`.
pub trait RepositoryBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Location other backends can import from (path or URL)
    fn location(&self) -> String;

    fn status(&self) -> RepoStatus;

    fn is_empty(&self) -> ForgeResult<bool>;

    /// Name of the branch used when a requested branch does not exist
    fn default_branch(&self) -> ForgeResult<String>;

    fn list_branches(&self) -> ForgeResult<Vec<RefInfo>>;

    fn list_tags(&self) -> ForgeResult<Vec<RefInfo>>;

    /// Commit id at the tip of `name`, or `None` if there is no such branch
    fn resolve_branch(&self, name: &str) -> ForgeResult<Option<String>>;

    /// Resolve a revision (id, branch or tag) to a commit id
    fn resolve_commit(&self, rev: &str) -> ForgeResult<String>;

    fn commit(&self, id: &str) -> ForgeResult<Option<Commit>>;

    /// Flattened listing of every tree and blob reachable from the commit
    fn tree_entries(&self, commit_id: &str) -> ForgeResult<Vec<TreeEntry>>;

    /// Content of the blob at `path` in the commit, or `None` if absent
    fn blob(&self, commit_id: &str, path: &str) -> ForgeResult<Option<Vec<u8>>>;

    /// Tree or blob entry at `path` in the commit
    fn path_entry(&self, commit_id: &str, path: &str) -> ForgeResult<Option<TreeEntry>> {
        Ok(self.tree_entries(commit_id)?.into_iter().find(|entry| entry.path == path))
    }

    fn merge_check(&self, source_commit: &str, target_branch: &str) -> ForgeResult<MergeCheck>;

    /// Merge `source_commit` into `target_branch`, returning the new tip
    fn merge(
        &self,
        source_commit: &str,
        target_branch: &str,
        message: &str,
        author: &Identity,
    ) -> ForgeResult<String>;

    /// Make `commit_id` from `branch` of `source` available in this repository
    fn import_branch(
        &self,
        source: &dyn RepositoryBackend,
        branch: &str,
        commit_id: &str,
    ) -> ForgeResult<()>;

    /// Batched commit lookup; unknown ids are skipped
    fn commits(&self, ids: &[String]) -> ForgeResult<Vec<Commit>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(commit) = self.commit(id)? {
                found.push(commit);
            }
        }
        Ok(found)
    }

    /// Branch and tag tips used as traversal starting points
    fn heads(&self) -> ForgeResult<Vec<RefInfo>> {
        let mut heads = self.list_branches()?;
        heads.extend(self.list_tags()?);
        Ok(heads)
    }

    /// Commits reachable from `start`, newest committed first
    fn log(&self, start: &str, limit: usize) -> ForgeResult<Vec<Commit>> {
        let start = self.resolve_commit(start)?;
        let mut seen = HashSet::new();
        let mut queue = BinaryHeap::new();
        let mut result = Vec::new();

        if let Some(commit) = self.commit(&start)? {
            seen.insert(commit.id.clone());
            queue.push(ByDate(commit));
        }

        while let Some(ByDate(commit)) = queue.pop() {
            if result.len() >= limit {
                break;
            }
            for parent in self.commits(&commit.parents)? {
                if seen.insert(parent.id.clone()) {
                    queue.push(ByDate(parent));
                }
            }
            result.push(commit);
        }

        Ok(result)
    }

    fn stats(&self) -> ForgeResult<RepoStats> {
        let branches = self.list_branches()?;
        let tags = self.list_tags()?;
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = branches
            .iter()
            .chain(tags.iter())
            .map(|r| r.commit_id.clone())
            .collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(commit) = self.commit(&id)? {
                stack.extend(commit.parents);
            }
        }
        Ok(RepoStats {
            commit_count: seen.len(),
            branch_count: branches.len(),
            tag_count: tags.len(),
        })
    }

    fn short_id(&self, id: &str) -> String {
        id.chars().take(7).collect()
    }

    fn url_for_commit(&self, id: &str) -> String {
        format!("ci/{}/", id)
    }
}

struct ByDate(Commit);

impl PartialEq for ByDate {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ByDate {}

impl PartialOrd for ByDate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByDate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .committed
            .cmp(&other.0.committed)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

/// Open the backend configured for a repository
pub fn open_backend(config: &RepositoryConfig) -> ForgeResult<Arc<dyn RepositoryBackend>> {
    match config.kind {
        BackendKind::Git => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| ForgeError::Config("git repository requires a path".to_string()))?;
            Ok(Arc::new(
                GitBackend::open(path)?.with_url_prefix(config.url_prefix.clone()),
            ))
        }
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new("memory"))),
    }
}
