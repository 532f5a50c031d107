use forge_core::{ForgeError, ForgeResult, RepoStatus, RepositoryBackend};
use std::collections::HashSet;
use tracing::{debug, instrument};

use crate::core::CommitGraph;

/// Fetches the commits reachable from a set of heads, one batch per frontier
pub struct GraphBuilder<'b> {
    backend: &'b dyn RepositoryBackend,
    /// Maximum commits fetched; 0 means unbounded
    limit: usize,
}

impl<'b> GraphBuilder<'b> {
    pub fn new(backend: &'b dyn RepositoryBackend) -> Self {
        Self { backend, limit: 0 }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[instrument(skip(self, heads), fields(heads = heads.len(), limit = self.limit))]
    pub fn build(&self, heads: &[String]) -> ForgeResult<CommitGraph> {
        if self.backend.status() != RepoStatus::Ready {
            return Err(ForgeError::BackendUnavailable(self.backend.location()));
        }

        let mut graph = CommitGraph::new();
        let mut seen = HashSet::new();
        let mut frontier: Vec<String> = heads
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect();

        while !frontier.is_empty() {
            if self.limit > 0 {
                let remaining = self.limit.saturating_sub(graph.len());
                if remaining == 0 {
                    break;
                }
                frontier.truncate(remaining);
            }

            let mut next = Vec::new();
            for commit in self.backend.commits(&frontier)? {
                for parent in &commit.parents {
                    if seen.insert(parent.clone()) {
                        next.push(parent.clone());
                    }
                }
                graph.add_commit(commit);
            }
            frontier = next;
        }

        debug!(commits = graph.len(), "commit graph built");
        Ok(graph)
    }
}
