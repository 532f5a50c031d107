//! Merge requests: proposals to merge a downstream branch into a target branch

pub mod discussion;
pub mod engine;
pub mod model;
pub mod store;

pub use discussion::{Discussion, InMemoryDiscussion, Post};
pub use engine::{can_merge_body, MergeRequestEngine};
pub use model::{
    BranchSubstitution, Downstream, MergeRequest, MergeRequestDraft, MergeRequestEdit,
    MergeRequestStatus, Resolved,
};
pub use store::{InMemoryMergeRequestStore, MergeRequestStore};
