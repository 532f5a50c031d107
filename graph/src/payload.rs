//! The commit-browser graph query

use forge_core::{Commit, ForgeResult, GraphConfig, RepoStatus, RepositoryBackend};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, instrument};

use crate::builder::GraphBuilder;
use crate::layout::{ColumnLayoutEngine, TopoSorter};

pub const EMPTY_MESSAGE: &str = "No commit message.";

/// One commit as placed in the rendered graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRow {
    pub oid: String,
    pub short_id: String,
    pub row: usize,
    pub column: usize,
    pub parents: Vec<String>,
    pub message: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphPayload {
    /// Commit ids in row order
    pub commits: Vec<String>,
    pub built_tree: BTreeMap<String, RenderRow>,
    /// Number of columns in use
    pub next_column: usize,
    pub max_row: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GraphView {
    Ready(GraphPayload),
    NotReady,
    NoCommits,
}

fn first_line(commit: &Commit) -> String {
    commit.summary().unwrap_or(EMPTY_MESSAGE).to_string()
}

/// Build the graph view for every branch and tag head of a repository
#[instrument(skip(backend, config), fields(repo = %backend.location()))]
pub fn graph_query(
    backend: &dyn RepositoryBackend,
    config: &GraphConfig,
) -> ForgeResult<GraphView> {
    if backend.status() != RepoStatus::Ready {
        return Ok(GraphView::NotReady);
    }
    if backend.is_empty()? {
        return Ok(GraphView::NoCommits);
    }

    let heads: Vec<String> = backend.heads()?.into_iter().map(|r| r.commit_id).collect();
    let graph = GraphBuilder::new(backend).with_limit(config.fetch_limit).build(&heads)?;
    if graph.is_empty() {
        return Ok(GraphView::NoCommits);
    }

    let order = TopoSorter::new(&graph).sort(&heads)?;
    let mut columns = ColumnLayoutEngine::new();
    let mut built_tree = BTreeMap::new();
    let mut commits = Vec::with_capacity(order.len());

    for (row, id) in order.into_iter().enumerate() {
        let Some(commit) = graph.get(id) else {
            continue;
        };
        let column = columns.place(commit);
        built_tree.insert(
            commit.id.clone(),
            RenderRow {
                oid: commit.id.clone(),
                short_id: commit.id.chars().take(config.short_id_len).collect(),
                row,
                column,
                parents: commit.parents.clone(),
                message: first_line(commit),
                url: backend.url_for_commit(&commit.id),
            },
        );
        commits.push(commit.id.clone());
    }

    info!(commits = commits.len(), width = columns.width(), "graph built");
    Ok(GraphView::Ready(GraphPayload {
        max_row: commits.len().saturating_sub(1),
        next_column: columns.width(),
        built_tree,
        commits,
    }))
}
