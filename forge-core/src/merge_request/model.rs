use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeRequestStatus {
    Open,
    Merged,
    Rejected,
}

impl MergeRequestStatus {
    /// Merged and rejected requests never change status again
    pub fn is_terminal(self) -> bool {
        !matches!(self, MergeRequestStatus::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MergeRequestStatus::Open => "open",
            MergeRequestStatus::Merged => "merged",
            MergeRequestStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for MergeRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the proposed changes come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downstream {
    pub repo_id: String,
    pub branch: String,
    pub commit_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: Uuid,
    /// Sequential per target repository, starting at 1
    pub number: u64,
    pub downstream: Downstream,
    pub target_repo: String,
    pub target_branch: String,
    pub status: MergeRequestStatus,
    pub summary: String,
    pub description: String,
    pub thread_id: String,
    pub creator: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl MergeRequest {
    pub fn is_open(&self) -> bool {
        self.status == MergeRequestStatus::Open
    }

    pub fn discussion_title(&self) -> String {
        format!("Discussion for Merge Request #{}: {}", self.number, self.summary)
    }
}

/// Input for creating a merge request from the current repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestDraft {
    pub source_branch: String,
    pub target_repo: String,
    pub target_branch: String,
    pub summary: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestEdit {
    pub summary: String,
    pub description: String,
    pub source_branch: String,
    pub target_branch: String,
}

/// A requested branch that no longer exists and was replaced by the default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSubstitution {
    pub repo_id: String,
    pub requested: String,
    pub used: String,
}

/// A value together with any branch substitutions made while producing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolved<T> {
    pub value: T,
    pub substitutions: Vec<BranchSubstitution>,
}

impl<T> Resolved<T> {
    pub fn new(value: T, substitutions: Vec<BranchSubstitution>) -> Self {
        Self { value, substitutions }
    }
}

/// One line of an edit change-log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Replaced { field: &'static str, old: String, new: String },
    Diff { field: &'static str, diff: String },
}

/// Render change-log entries as the body of a meta note
pub fn render_changes(changes: &[Change]) -> String {
    changes
        .iter()
        .map(|change| match change {
            Change::Replaced { field, old, new } => format!("- **{}**: {} → {}", field, old, new),
            Change::Diff { field, diff } => format!("- **{}**:\n\n```diff\n{}```", field, diff),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
