//! Snapshot tarballs of a revision, built in the background

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::backend::RepositoryBackend;
use crate::config::ArchiveConfig;
use crate::context::RequestContext;
use crate::error::{ForgeError, ForgeResult};
use crate::jobs::blocking_job;
use crate::tasks::{OperationKey, Submission, TaskStatus, TaskStatusTracker};

/// Produces the archive for one commit, optionally limited to a subtree
pub trait ArchiveWriter: Send + Sync {
    fn write_archive(
        &self,
        backend: &dyn RepositoryBackend,
        commit_id: &str,
        path: Option<&str>,
    ) -> ForgeResult<PathBuf>;
}

/// Writes `root/<short id>[-<path>].tar.gz`, entries rooted at the same name
pub struct TarballWriter {
    root: PathBuf,
}

impl TarballWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

async fn build_tar(prefix: &str, files: &[(String, Vec<u8>)]) -> std::io::Result<Vec<u8>> {
    let mut builder = async_tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = async_tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, format!("{}/{}", prefix, path), content.as_slice())
            .await?;
    }
    builder.into_inner().await
}

impl ArchiveWriter for TarballWriter {
    fn write_archive(
        &self,
        backend: &dyn RepositoryBackend,
        commit_id: &str,
        path: Option<&str>,
    ) -> ForgeResult<PathBuf> {
        let mut name = backend.short_id(commit_id);
        if let Some(path) = path {
            name.push('-');
            name.push_str(&path.replace('/', "-"));
        }

        let mut files = Vec::new();
        for entry in backend.tree_entries(commit_id)? {
            if entry.is_dir {
                continue;
            }
            let inside = match path {
                Some(prefix) => entry
                    .path
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/')),
                None => true,
            };
            if !inside {
                continue;
            }
            if let Some(content) = backend.blob(commit_id, &entry.path)? {
                files.push((entry.path, content));
            }
        }

        let tar = futures::executor::block_on(build_tar(&name, &files))?;
        fs::create_dir_all(&self.root)?;
        let dest = self.root.join(format!("{}.tar.gz", name));
        let mut encoder = GzEncoder::new(fs::File::create(&dest)?, Compression::default());
        encoder.write_all(&tar)?;
        encoder.finish()?;
        debug!(files = files.len(), "tarball packed");
        Ok(dest)
    }
}

pub struct ArchiveService {
    config: ArchiveConfig,
    tracker: Arc<TaskStatusTracker>,
    writer: Arc<dyn ArchiveWriter>,
}

impl ArchiveService {
    pub fn new(
        config: ArchiveConfig,
        tracker: Arc<TaskStatusTracker>,
        writer: Arc<dyn ArchiveWriter>,
    ) -> Self {
        Self { config, tracker, writer }
    }

    fn key(
        &self,
        ctx: &RequestContext,
        revision: &str,
        path: Option<&str>,
    ) -> ForgeResult<(String, OperationKey)> {
        if !self.config.enabled {
            return Err(ForgeError::not_found("archive", revision));
        }
        let commit_id = ctx.repo.backend.resolve_commit(revision)?;
        let path = path.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty());
        let key = OperationKey::tarball(&commit_id, path);
        Ok((commit_id, key))
    }

    /// Status of the archive for `revision`, `None` if never requested
    pub fn status(
        &self,
        ctx: &RequestContext,
        revision: &str,
        path: Option<&str>,
    ) -> ForgeResult<Option<TaskStatus>> {
        let (_, key) = self.key(ctx, revision, path)?;
        Ok(self.tracker.get(&key))
    }

    #[instrument(skip(self, ctx), fields(repo = %ctx.repo.id))]
    pub fn request(
        &self,
        ctx: &RequestContext,
        revision: &str,
        path: Option<&str>,
    ) -> ForgeResult<Submission> {
        let (commit_id, key) = self.key(ctx, revision, path)?;
        let backend = ctx.repo.backend.clone();
        let writer = self.writer.clone();
        let subtree = path.map(|p| p.trim_matches('/').to_string()).filter(|p| !p.is_empty());

        let job = blocking_job(move || {
            let written = writer.write_archive(backend.as_ref(), &commit_id, subtree.as_deref())?;
            debug!(commit = %commit_id, path = %written.display(), "archive written");
            Ok(json!({ "path": written.display().to_string() }))
        });
        Ok(self.tracker.submit(key, |ticket| ctx.jobs.submit(ticket, job, self.tracker.clone())))
    }
}
