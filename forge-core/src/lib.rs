pub mod archive;
pub mod backend;
pub mod config;
pub mod context;
pub mod diff;
pub mod error;
pub mod jobs;
pub mod log;
pub mod memory;
pub mod merge_request;
pub mod refresh;
pub mod repository;
pub mod tasks;

pub use archive::{ArchiveService, ArchiveWriter, TarballWriter};
pub use backend::{
    open_backend, Commit, Identity, MergeCheck, RefInfo, RefKind, RepoStats, RepoStatus,
    RepositoryBackend, TreeEntry,
};
pub use config::{BackendKind, ForgeConfig, GraphConfig};
pub use context::{Actor, Permission, RepoHandle, RequestContext};
pub use diff::{ChangeKind, DiffEngine, DiffEntry, DiffFormat, FileDiff, PagedChanges};
pub use error::{ForgeError, ForgeResult};
pub use jobs::{JobRunner, ManualJobRunner, TokioJobRunner};
pub use log::{commit_page, CommitSummary, LogPage};
pub use memory::MemoryBackend;
pub use merge_request::{MergeRequest, MergeRequestEngine, MergeRequestStatus};
pub use refresh::RefreshService;
pub use repository::GitBackend;
pub use tasks::{OperationKey, Submission, TaskState, TaskStatus, TaskStatusTracker};
