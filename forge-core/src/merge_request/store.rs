use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use super::model::{MergeRequest, MergeRequestStatus};
use crate::error::{ForgeError, ForgeResult};

/// Persistence for merge requests. Requests are never deleted.
#[async_trait]
pub trait MergeRequestStore: Send + Sync {
    /// Reserve the next request number for a target repository
    async fn next_number(&self, target_repo: &str) -> ForgeResult<u64>;

    async fn insert(&self, request: MergeRequest) -> ForgeResult<()>;

    async fn get(&self, id: Uuid) -> ForgeResult<Option<MergeRequest>>;

    /// Lookup by the per-repository number shown to users
    async fn get_by_number(
        &self,
        target_repo: &str,
        number: u64,
    ) -> ForgeResult<Option<MergeRequest>>;

    async fn update(&self, request: MergeRequest) -> ForgeResult<()>;

    /// Requests for a target repository in any of `statuses`, by number
    async fn list(
        &self,
        target_repo: &str,
        statuses: &[MergeRequestStatus],
    ) -> ForgeResult<Vec<MergeRequest>>;
}

#[derive(Default)]
struct StoreState {
    requests: HashMap<Uuid, MergeRequest>,
    counters: HashMap<String, u64>,
}

#[derive(Default)]
pub struct InMemoryMergeRequestStore {
    state: Mutex<StoreState>,
}

impl InMemoryMergeRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MergeRequestStore for InMemoryMergeRequestStore {
    async fn next_number(&self, target_repo: &str) -> ForgeResult<u64> {
        let mut state = self.state.lock();
        let counter = state.counters.entry(target_repo.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn insert(&self, request: MergeRequest) -> ForgeResult<()> {
        self.state.lock().requests.insert(request.id, request);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> ForgeResult<Option<MergeRequest>> {
        Ok(self.state.lock().requests.get(&id).cloned())
    }

    async fn get_by_number(
        &self,
        target_repo: &str,
        number: u64,
    ) -> ForgeResult<Option<MergeRequest>> {
        Ok(self
            .state
            .lock()
            .requests
            .values()
            .find(|r| r.target_repo == target_repo && r.number == number)
            .cloned())
    }

    async fn update(&self, request: MergeRequest) -> ForgeResult<()> {
        let mut state = self.state.lock();
        match state.requests.get_mut(&request.id) {
            Some(existing) => {
                *existing = request;
                Ok(())
            }
            None => Err(ForgeError::not_found("merge request", request.id.to_string())),
        }
    }

    async fn list(
        &self,
        target_repo: &str,
        statuses: &[MergeRequestStatus],
    ) -> ForgeResult<Vec<MergeRequest>> {
        let mut found: Vec<_> = self
            .state
            .lock()
            .requests
            .values()
            .filter(|r| r.target_repo == target_repo && statuses.contains(&r.status))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.number);
        Ok(found)
    }
}
