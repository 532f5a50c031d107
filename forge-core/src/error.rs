//! Error types shared by the forge crates

use thiserror::Error;

pub type ForgeResult<T> = Result<T, ForgeError>;

/// Errors surfaced by repository, diff, graph and merge-request operations
#[derive(Error, Debug)]
pub enum ForgeError {
    /// Repository not reachable or not finished initializing
    #[error("Repository unavailable: {0}")]
    BackendUnavailable(String),

    /// Repository has no commits yet
    #[error("Repository has no commits")]
    EmptyRepository,

    /// Unknown commit, path, branch or merge request
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Merge attempted while not mergeable or not open
    #[error("Merge not allowed: {0}")]
    MergeNotAllowed(String),

    /// Topological sort did not emit every discovered commit
    #[error("Commit graph inconsistent: {emitted} of {expected} commits emitted")]
    GraphInconsistency { expected: usize, emitted: usize },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Status change out of a terminal state
    #[error("Invalid merge request transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Error reported by the underlying VCS library
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl ForgeError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ForgeError::NotFound { kind, id: id.into() }
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            ForgeError::BackendUnavailable(_) => "backend_unavailable",
            ForgeError::EmptyRepository => "empty_repository",
            ForgeError::NotFound { .. } => "not_found",
            ForgeError::MergeNotAllowed(_) => "merge_not_allowed",
            ForgeError::GraphInconsistency { .. } => "graph_inconsistency",
            ForgeError::PermissionDenied(_) => "permission_denied",
            ForgeError::InvalidTransition { .. } => "invalid_transition",
            ForgeError::Backend(_) => "backend",
            ForgeError::Config(_) => "config",
            ForgeError::Io(_) => "io",
            ForgeError::Serialization(_) => "serialization",
        }
    }
}

impl From<git2::Error> for ForgeError {
    fn from(err: git2::Error) -> Self {
        ForgeError::Backend(err.message().to_string())
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        ForgeError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ForgeError {
    fn from(err: toml::de::Error) -> Self {
        ForgeError::Config(err.to_string())
    }
}
