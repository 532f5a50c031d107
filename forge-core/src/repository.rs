use chrono::{DateTime, TimeZone, Utc};
use git2::{
    BranchType, ErrorCode, ObjectType, Oid, Repository as Git2Repository, Signature, Sort,
    TreeWalkMode, TreeWalkResult,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use crate::backend::{
    Commit, Identity, MergeCheck, RefInfo, RefKind, RepoStats, RepoStatus, RepositoryBackend,
    TreeEntry,
};
use crate::config::BackendKind;
use crate::error::{ForgeError, ForgeResult};

/// Git repository backend over libgit2.
///
/// The repository is reopened for every operation so the backend can be
/// shared across threads and job workers.
pub struct GitBackend {
    path: PathBuf,
    url_prefix: String,
}

impl GitBackend {
    /// Open an existing repository
    pub fn open<P: AsRef<Path>>(path: P) -> ForgeResult<Self> {
        let path = path.as_ref().to_path_buf();
        Git2Repository::open(&path)
            .map_err(|e| {
                ForgeError::BackendUnavailable(format!("{}: {}", path.display(), e.message()))
            })?;

        Ok(GitBackend {
            path,
            url_prefix: String::new(),
        })
    }

    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = prefix.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn repo(&self) -> ForgeResult<Git2Repository> {
        Git2Repository::open(&self.path).map_err(|e| {
            ForgeError::BackendUnavailable(format!("{}: {}", self.path.display(), e.message()))
        })
    }

    fn find_commit<'r>(&self, repo: &'r Git2Repository, id: &str) -> ForgeResult<git2::Commit<'r>> {
        let oid = Oid::from_str(id).map_err(|_| ForgeError::not_found("commit", id))?;
        repo.find_commit(oid).map_err(|e| match e.code() {
            ErrorCode::NotFound => ForgeError::not_found("commit", id),
            _ => e.into(),
        })
    }

    fn branch_tip<'r>(
        &self,
        repo: &'r Git2Repository,
        name: &str,
    ) -> ForgeResult<git2::Commit<'r>> {
        let branch = repo
            .find_branch(name, BranchType::Local)
            .map_err(|e| match e.code() {
                ErrorCode::NotFound | ErrorCode::InvalidSpec => {
                    ForgeError::not_found("branch", name)
                }
                _ => e.into(),
            })?;
        Ok(branch.get().peel_to_commit()?)
    }

    /// Convert a git2::Commit to the backend-neutral model
    fn to_model(commit: &git2::Commit) -> ForgeResult<Commit> {
        let author = commit.author();
        let committer = commit.committer();

        Ok(Commit {
            id: commit.id().to_string(),
            parents: commit.parent_ids().map(|oid| oid.to_string()).collect(),
            author: Identity::new(
                author.name().unwrap_or("Unknown"),
                author.email().unwrap_or(""),
            ),
            committer: Identity::new(
                committer.name().unwrap_or("Unknown"),
                committer.email().unwrap_or(""),
            ),
            authored: to_utc(author.when().seconds())?,
            committed: to_utc(commit.time().seconds())?,
            message: commit.message().unwrap_or("").to_string(),
            tree: Some(commit.tree_id().to_string()),
        })
    }

    fn analyze(
        repo: &Git2Repository,
        source: &git2::Commit,
        target: &git2::Commit,
    ) -> ForgeResult<MergeCheck> {
        let mut check = MergeCheck {
            mergeable: true,
            fast_forward: false,
            conflicts: Vec::new(),
            source_commit: source.id().to_string(),
            target_commit: target.id().to_string(),
        };

        if source.id() == target.id() || repo.graph_descendant_of(target.id(), source.id())? {
            return Ok(check);
        }
        if repo.graph_descendant_of(source.id(), target.id())? {
            check.fast_forward = true;
            return Ok(check);
        }

        let index = repo.merge_commits(target, source, None)?;
        if index.has_conflicts() {
            check.mergeable = false;
            check.conflicts = conflicted_paths(&index)?;
        }
        Ok(check)
    }
}

fn to_utc(seconds: i64) -> ForgeResult<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| ForgeError::Backend(format!("invalid commit timestamp {}", seconds)))
}

fn conflicted_paths(index: &git2::Index) -> ForgeResult<Vec<String>> {
    let mut conflicts = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
        if let Some(entry) = entry {
            let path = String::from_utf8_lossy(&entry.path).into_owned();
            if !conflicts.contains(&path) {
                conflicts.push(path);
            }
        }
    }
    Ok(conflicts)
}

impl RepositoryBackend for GitBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Git
    }

    fn location(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    fn status(&self) -> RepoStatus {
        match self.repo() {
            Ok(_) => RepoStatus::Ready,
            Err(_) => RepoStatus::Unavailable,
        }
    }

    fn is_empty(&self) -> ForgeResult<bool> {
        Ok(self.repo()?.is_empty()?)
    }

    fn default_branch(&self) -> ForgeResult<String> {
        let repo = self.repo()?;
        let head = repo.find_reference("HEAD")?;
        Ok(head
            .symbolic_target()
            .and_then(|target| target.strip_prefix("refs/heads/"))
            .unwrap_or("master")
            .to_string())
    }

    fn list_branches(&self) -> ForgeResult<Vec<RefInfo>> {
        let repo = self.repo()?;
        let mut branches = Vec::new();

        for branch in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.name()? {
                let commit = branch.get().peel_to_commit()?;
                branches.push(RefInfo {
                    name: name.to_string(),
                    kind: RefKind::Branch,
                    commit_id: commit.id().to_string(),
                });
            }
        }

        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    fn list_tags(&self) -> ForgeResult<Vec<RefInfo>> {
        let repo = self.repo()?;
        let mut tags = Vec::new();

        for name in repo.tag_names(None)?.iter().flatten() {
            let object = repo.revparse_single(&format!("refs/tags/{}", name))?;
            // Tags on trees or blobs have no place in the history views
            if let Ok(commit) = object.peel_to_commit() {
                tags.push(RefInfo {
                    name: name.to_string(),
                    kind: RefKind::Tag,
                    commit_id: commit.id().to_string(),
                });
            }
        }

        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    fn resolve_branch(&self, name: &str) -> ForgeResult<Option<String>> {
        let repo = self.repo()?;
        let tip = match self.branch_tip(&repo, name) {
            Ok(commit) => Some(commit.id().to_string()),
            Err(ForgeError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        Ok(tip)
    }

    fn resolve_commit(&self, rev: &str) -> ForgeResult<String> {
        let repo = self.repo()?;
        let object = repo.revparse_single(rev).map_err(|e| match e.code() {
            ErrorCode::NotFound | ErrorCode::InvalidSpec | ErrorCode::Ambiguous => {
                ForgeError::not_found("revision", rev)
            }
            _ => e.into(),
        })?;
        let commit = object
            .peel_to_commit()
            .map_err(|_| ForgeError::not_found("revision", rev))?;
        Ok(commit.id().to_string())
    }

    fn commit(&self, id: &str) -> ForgeResult<Option<Commit>> {
        let repo = self.repo()?;
        let commit = match self.find_commit(&repo, id) {
            Ok(commit) => Some(Self::to_model(&commit)?),
            Err(ForgeError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        Ok(commit)
    }

    fn commits(&self, ids: &[String]) -> ForgeResult<Vec<Commit>> {
        let repo = self.repo()?;
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            match self.find_commit(&repo, id) {
                Ok(commit) => found.push(Self::to_model(&commit)?),
                Err(ForgeError::NotFound { .. }) => {
                    debug!(commit = %id, "commit outside repository")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    fn tree_entries(&self, commit_id: &str) -> ForgeResult<Vec<TreeEntry>> {
        let repo = self.repo()?;
        let tree = self.find_commit(&repo, commit_id)?.tree()?;

        let mut entries = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if let Some(name) = entry.name() {
                entries.push(TreeEntry {
                    path: format!("{}{}", root, name),
                    oid: entry.id().to_string(),
                    is_dir: entry.kind() == Some(ObjectType::Tree),
                });
            }
            TreeWalkResult::Ok
        })?;

        Ok(entries)
    }

    fn blob(&self, commit_id: &str, path: &str) -> ForgeResult<Option<Vec<u8>>> {
        let repo = self.repo()?;
        let tree = self.find_commit(&repo, commit_id)?.tree()?;

        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let content = match entry.to_object(&repo)?.into_blob() {
            Ok(blob) => Some(blob.content().to_vec()),
            Err(_) => None,
        };
        Ok(content)
    }

    fn path_entry(&self, commit_id: &str, path: &str) -> ForgeResult<Option<TreeEntry>> {
        let repo = self.repo()?;
        let tree = self.find_commit(&repo, commit_id)?.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => TreeEntry {
                path: path.to_string(),
                oid: entry.id().to_string(),
                is_dir: entry.kind() == Some(ObjectType::Tree),
            },
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(entry))
    }

    fn log(&self, start: &str, limit: usize) -> ForgeResult<Vec<Commit>> {
        let repo = self.repo()?;
        let start = self.resolve_commit(start)?;

        let mut revwalk = repo.revwalk()?;
        revwalk.set_sorting(Sort::TIME)?;
        revwalk.push(Oid::from_str(&start)?)?;

        let mut commits = Vec::new();
        for oid in revwalk.take(limit) {
            let commit = repo.find_commit(oid?)?;
            commits.push(Self::to_model(&commit)?);
        }
        Ok(commits)
    }

    fn stats(&self) -> ForgeResult<RepoStats> {
        let repo = self.repo()?;
        let branches = self.list_branches()?;
        let tags = self.list_tags()?;

        let mut revwalk = repo.revwalk()?;
        let tips: HashSet<&str> = branches
            .iter()
            .chain(tags.iter())
            .map(|r| r.commit_id.as_str())
            .collect();
        for tip in tips {
            revwalk.push(Oid::from_str(tip)?)?;
        }

        Ok(RepoStats {
            commit_count: revwalk.count(),
            branch_count: branches.len(),
            tag_count: tags.len(),
        })
    }

    #[instrument(skip(self), fields(repo = %self.path.display()))]
    fn merge_check(&self, source_commit: &str, target_branch: &str) -> ForgeResult<MergeCheck> {
        let repo = self.repo()?;
        let source = self.find_commit(&repo, source_commit)?;
        let target = self.branch_tip(&repo, target_branch)?;

        let check = Self::analyze(&repo, &source, &target)?;
        debug!(mergeable = check.mergeable, conflicts = check.conflicts.len(), "merge check done");
        Ok(check)
    }

    #[instrument(skip(self, message, author), fields(repo = %self.path.display()))]
    fn merge(
        &self,
        source_commit: &str,
        target_branch: &str,
        message: &str,
        author: &Identity,
    ) -> ForgeResult<String> {
        let repo = self.repo()?;
        let source = self.find_commit(&repo, source_commit)?;
        let target = self.branch_tip(&repo, target_branch)?;
        let refname = format!("refs/heads/{}", target_branch);

        let check = Self::analyze(&repo, &source, &target)?;
        if !check.mergeable {
            return Err(ForgeError::MergeNotAllowed(format!(
                "conflicts in {}",
                check.conflicts.join(", ")
            )));
        }

        if check.fast_forward {
            repo.reference(&refname, source.id(), true, "Fast-forward merge")?;
            info!(tip = %source.id(), "fast-forwarded {}", target_branch);
            return Ok(source.id().to_string());
        }
        if target.id() == source.id() || repo.graph_descendant_of(target.id(), source.id())? {
            return Ok(target.id().to_string());
        }

        let mut index = repo.merge_commits(&target, &source, None)?;
        let tree_oid = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_oid)?;
        let sig = Signature::now(&author.name, &author.email)?;

        let merged = repo.commit(Some(&refname), &sig, &sig, message, &tree, &[&target, &source])?;
        info!(tip = %merged, "merged into {}", target_branch);
        Ok(merged.to_string())
    }

    fn import_branch(
        &self,
        source: &dyn RepositoryBackend,
        branch: &str,
        commit_id: &str,
    ) -> ForgeResult<()> {
        let repo = self.repo()?;
        if source.location() == self.location() || self.find_commit(&repo, commit_id).is_ok() {
            return Ok(());
        }

        let refspec = format!("+refs/heads/{}:refs/forge/imports/{}", branch, branch);
        let mut remote = repo.remote_anonymous(&source.location())?;
        remote.fetch(&[refspec.as_str()], None, None)?;
        debug!(source = %source.location(), branch, "imported branch");

        self.find_commit(&repo, commit_id).map(|_| ())
    }

    fn url_for_commit(&self, id: &str) -> String {
        format!("{}ci/{}/", self.url_prefix, id)
    }
}
