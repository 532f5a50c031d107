//! In-memory repository backend
//!
//! Commits, trees and refs are scripted by the caller. Merge outcomes can be
//! forced with [`MemoryBackend::set_merge_conflicts`], and executed merges are
//! counted so callers can assert how often a merge actually ran.

use chrono::{TimeZone, Utc};
use git2::{ObjectType, Oid};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::backend::{
    Commit, Identity, MergeCheck, RefInfo, RefKind, RepoStatus, RepositoryBackend, TreeEntry,
};
use crate::config::BackendKind;
use crate::error::{ForgeError, ForgeResult};

struct Inner {
    commits: HashMap<String, Commit>,
    trees: HashMap<String, BTreeMap<String, Vec<u8>>>,
    branches: BTreeMap<String, String>,
    tags: BTreeMap<String, String>,
    default_branch: String,
    status: RepoStatus,
    merge_conflicts: Vec<String>,
    merges: usize,
}

pub struct MemoryBackend {
    name: String,
    inner: RwLock<Inner>,
}

fn blob_oid(content: &[u8]) -> String {
    Oid::hash_object(ObjectType::Blob, content)
        .map(|oid| oid.to_string())
        .unwrap_or_default()
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Inner {
                commits: HashMap::new(),
                trees: HashMap::new(),
                branches: BTreeMap::new(),
                tags: BTreeMap::new(),
                default_branch: "master".to_string(),
                status: RepoStatus::Ready,
                merge_conflicts: Vec::new(),
                merges: 0,
            }),
        }
    }

    pub fn add_commit(&self, id: &str, parents: &[&str], seconds: i64, message: &str) {
        let when = Utc.timestamp_opt(seconds, 0).single().unwrap_or_else(Utc::now);
        let who = Identity::new("Tester", "tester@example.com");
        self.inner.write().commits.insert(
            id.to_string(),
            Commit {
                id: id.to_string(),
                parents: parents.iter().map(|p| p.to_string()).collect(),
                author: who.clone(),
                committer: who,
                authored: when,
                committed: when,
                message: message.to_string(),
                tree: None,
            },
        );
    }

    /// Replace the tree of a commit with the given text files
    pub fn set_files(&self, commit_id: &str, files: &[(&str, &str)]) {
        let tree = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
            .collect();
        self.inner.write().trees.insert(commit_id.to_string(), tree);
    }

    pub fn set_file_bytes(&self, commit_id: &str, path: &str, content: &[u8]) {
        self.inner
            .write()
            .trees
            .entry(commit_id.to_string())
            .or_default()
            .insert(path.to_string(), content.to_vec());
    }

    pub fn set_branch(&self, name: &str, commit_id: &str) {
        self.inner.write().branches.insert(name.to_string(), commit_id.to_string());
    }

    pub fn delete_branch(&self, name: &str) {
        self.inner.write().branches.remove(name);
    }

    pub fn set_tag(&self, name: &str, commit_id: &str) {
        self.inner.write().tags.insert(name.to_string(), commit_id.to_string());
    }

    pub fn set_default_branch(&self, name: &str) {
        self.inner.write().default_branch = name.to_string();
    }

    pub fn set_status(&self, status: RepoStatus) {
        self.inner.write().status = status;
    }

    /// Paths reported as conflicting by every later merge check
    pub fn set_merge_conflicts(&self, paths: &[&str]) {
        self.inner.write().merge_conflicts = paths.iter().map(|p| p.to_string()).collect();
    }

    /// Number of merges executed so far
    pub fn merge_count(&self) -> usize {
        self.inner.read().merges
    }

    fn read(&self) -> ForgeResult<RwLockReadGuard<'_, Inner>> {
        let inner = self.inner.read();
        if inner.status == RepoStatus::Ready {
            Ok(inner)
        } else {
            Err(ForgeError::BackendUnavailable(self.name.clone()))
        }
    }

    fn write(&self) -> ForgeResult<RwLockWriteGuard<'_, Inner>> {
        let inner = self.inner.write();
        if inner.status == RepoStatus::Ready {
            Ok(inner)
        } else {
            Err(ForgeError::BackendUnavailable(self.name.clone()))
        }
    }
}

impl Inner {
    fn is_ancestor(&self, ancestor: &str, of: &str) -> bool {
        let mut stack = vec![of.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == ancestor {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&id) {
                stack.extend(commit.parents.iter().cloned());
            }
        }
        false
    }

    fn check(&self, source_commit: &str, target_branch: &str) -> ForgeResult<MergeCheck> {
        if !self.commits.contains_key(source_commit) {
            return Err(ForgeError::not_found("commit", source_commit));
        }
        let target = self
            .branches
            .get(target_branch)
            .ok_or_else(|| ForgeError::not_found("branch", target_branch))?;

        let up_to_date = self.is_ancestor(source_commit, target);
        let fast_forward = !up_to_date && self.is_ancestor(target, source_commit);
        let conflicts = if up_to_date || fast_forward {
            Vec::new()
        } else {
            self.merge_conflicts.clone()
        };

        Ok(MergeCheck {
            mergeable: conflicts.is_empty(),
            fast_forward,
            conflicts,
            source_commit: source_commit.to_string(),
            target_commit: target.clone(),
        })
    }
}

impl RepositoryBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn location(&self) -> String {
        format!("memory://{}", self.name)
    }

    fn status(&self) -> RepoStatus {
        self.inner.read().status
    }

    fn is_empty(&self) -> ForgeResult<bool> {
        Ok(self.read()?.commits.is_empty())
    }

    fn default_branch(&self) -> ForgeResult<String> {
        Ok(self.read()?.default_branch.clone())
    }

    fn list_branches(&self) -> ForgeResult<Vec<RefInfo>> {
        Ok(self
            .read()?
            .branches
            .iter()
            .map(|(name, id)| RefInfo {
                name: name.clone(),
                kind: RefKind::Branch,
                commit_id: id.clone(),
            })
            .collect())
    }

    fn list_tags(&self) -> ForgeResult<Vec<RefInfo>> {
        Ok(self
            .read()?
            .tags
            .iter()
            .map(|(name, id)| RefInfo {
                name: name.clone(),
                kind: RefKind::Tag,
                commit_id: id.clone(),
            })
            .collect())
    }

    fn resolve_branch(&self, name: &str) -> ForgeResult<Option<String>> {
        Ok(self.read()?.branches.get(name).cloned())
    }

    fn resolve_commit(&self, rev: &str) -> ForgeResult<String> {
        let inner = self.read()?;
        if inner.commits.contains_key(rev) {
            return Ok(rev.to_string());
        }
        inner
            .branches
            .get(rev)
            .or_else(|| inner.tags.get(rev))
            .cloned()
            .ok_or_else(|| ForgeError::not_found("revision", rev))
    }

    fn commit(&self, id: &str) -> ForgeResult<Option<Commit>> {
        Ok(self.read()?.commits.get(id).cloned())
    }

    fn tree_entries(&self, commit_id: &str) -> ForgeResult<Vec<TreeEntry>> {
        let inner = self.read()?;
        if !inner.commits.contains_key(commit_id) {
            return Err(ForgeError::not_found("commit", commit_id));
        }
        let Some(files) = inner.trees.get(commit_id) else {
            return Ok(Vec::new());
        };

        let mut dirs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut entries = Vec::new();
        for (path, content) in files {
            let oid = blob_oid(content);
            let mut parent = path.as_str();
            while let Some((dir, _)) = parent.rsplit_once('/') {
                dirs.entry(dir.to_string())
                    .or_default()
                    .push(format!("{} {}", path, oid));
                parent = dir;
            }
            entries.push(TreeEntry {
                path: path.clone(),
                oid,
                is_dir: false,
            });
        }
        for (dir, children) in dirs {
            entries.push(TreeEntry {
                path: dir,
                oid: blob_oid(children.join("\n").as_bytes()),
                is_dir: true,
            });
        }
        Ok(entries)
    }

    fn blob(&self, commit_id: &str, path: &str) -> ForgeResult<Option<Vec<u8>>> {
        let inner = self.read()?;
        if !inner.commits.contains_key(commit_id) {
            return Err(ForgeError::not_found("commit", commit_id));
        }
        Ok(inner
            .trees
            .get(commit_id)
            .and_then(|files| files.get(path))
            .cloned())
    }

    fn merge_check(&self, source_commit: &str, target_branch: &str) -> ForgeResult<MergeCheck> {
        self.read()?.check(source_commit, target_branch)
    }

    fn merge(
        &self,
        source_commit: &str,
        target_branch: &str,
        message: &str,
        author: &Identity,
    ) -> ForgeResult<String> {
        let mut inner = self.write()?;
        let check = inner.check(source_commit, target_branch)?;
        if !check.mergeable {
            return Err(ForgeError::MergeNotAllowed(format!(
                "conflicts in {}",
                check.conflicts.join(", ")
            )));
        }
        inner.merges += 1;

        if check.fast_forward {
            inner
                .branches
                .insert(target_branch.to_string(), source_commit.to_string());
            return Ok(source_commit.to_string());
        }
        if inner.is_ancestor(source_commit, &check.target_commit) {
            return Ok(check.target_commit);
        }

        let id = format!("merge-{}", inner.merges);
        let mut tree = inner.trees.get(&check.target_commit).cloned().unwrap_or_default();
        if let Some(source_tree) = inner.trees.get(source_commit) {
            tree.extend(source_tree.iter().map(|(p, c)| (p.clone(), c.clone())));
        }
        let now = Utc::now();
        inner.trees.insert(id.clone(), tree);
        inner.commits.insert(
            id.clone(),
            Commit {
                id: id.clone(),
                parents: vec![check.target_commit.clone(), source_commit.to_string()],
                author: author.clone(),
                committer: author.clone(),
                authored: now,
                committed: now,
                message: message.to_string(),
                tree: None,
            },
        );
        inner.branches.insert(target_branch.to_string(), id.clone());
        Ok(id)
    }

    fn import_branch(
        &self,
        source: &dyn RepositoryBackend,
        _branch: &str,
        commit_id: &str,
    ) -> ForgeResult<()> {
        let mut pending = vec![commit_id.to_string()];
        let mut copied = BTreeSet::new();

        while let Some(id) = pending.pop() {
            if self.read()?.commits.contains_key(&id) || !copied.insert(id.clone()) {
                continue;
            }
            let commit = source
                .commit(&id)?
                .ok_or_else(|| ForgeError::not_found("commit", id.as_str()))?;

            let mut files = BTreeMap::new();
            for entry in source.tree_entries(&id)? {
                if entry.is_dir {
                    continue;
                }
                if let Some(content) = source.blob(&id, &entry.path)? {
                    files.insert(entry.path, content);
                }
            }

            pending.extend(commit.parents.iter().cloned());
            let mut inner = self.write()?;
            inner.trees.insert(id.clone(), files);
            inner.commits.insert(id, commit);
        }
        Ok(())
    }
}
