use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{Identity, RepositoryBackend};
use crate::error::{ForgeError, ForgeResult};
use crate::jobs::JobRunner;

/// The user on whose behalf an operation runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub username: String,
    pub identity: Identity,
}

impl Actor {
    pub fn new(username: impl Into<String>, identity: Identity) -> Self {
        Self {
            username: username.into(),
            identity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn has_permission(&self, actor: &Actor, repo_id: &str, permission: Permission) -> bool;
}

/// Grants held in memory; a higher permission implies the lower ones
#[derive(Default)]
pub struct StaticAccessControl {
    grants: RwLock<HashMap<(String, String), Permission>>,
}

impl StaticAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, username: &str, repo_id: &str, permission: Permission) {
        self.grants
            .write()
            .insert((username.to_string(), repo_id.to_string()), permission);
    }
}

#[async_trait]
impl AccessControl for StaticAccessControl {
    async fn has_permission(&self, actor: &Actor, repo_id: &str, permission: Permission) -> bool {
        self.grants
            .read()
            .get(&(actor.username.clone(), repo_id.to_string()))
            .is_some_and(|granted| *granted >= permission)
    }
}

/// Lookup of repositories by id, used to reach forks and merge targets
pub trait RepositoryRegistry: Send + Sync {
    fn get(&self, repo_id: &str) -> Option<Arc<dyn RepositoryBackend>>;

    fn require(&self, repo_id: &str) -> ForgeResult<RepoHandle> {
        self.get(repo_id)
            .map(|backend| RepoHandle::new(repo_id, backend))
            .ok_or_else(|| ForgeError::not_found("repository", repo_id))
    }
}

#[derive(Default)]
pub struct InMemoryRegistry {
    repos: RwLock<HashMap<String, Arc<dyn RepositoryBackend>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, repo_id: &str, backend: Arc<dyn RepositoryBackend>) {
        self.repos.write().insert(repo_id.to_string(), backend);
    }
}

impl RepositoryRegistry for InMemoryRegistry {
    fn get(&self, repo_id: &str) -> Option<Arc<dyn RepositoryBackend>> {
        self.repos.read().get(repo_id).cloned()
    }
}

#[derive(Clone)]
pub struct RepoHandle {
    pub id: String,
    pub backend: Arc<dyn RepositoryBackend>,
}

impl RepoHandle {
    pub fn new(id: impl Into<String>, backend: Arc<dyn RepositoryBackend>) -> Self {
        Self { id: id.into(), backend }
    }
}

/// Everything an operation needs about the request it serves
#[derive(Clone)]
pub struct RequestContext {
    pub repo: RepoHandle,
    pub actor: Actor,
    pub jobs: Arc<dyn JobRunner>,
}

impl RequestContext {
    pub fn new(repo: RepoHandle, actor: Actor, jobs: Arc<dyn JobRunner>) -> Self {
        Self { repo, actor, jobs }
    }
}
