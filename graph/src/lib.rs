//! Commit graph construction and layout for the commit browser

pub mod builder;
pub mod core;
pub mod layout;
pub mod payload;

pub use builder::GraphBuilder;
pub use self::core::{CommitGraph, GraphStats};
pub use layout::{ColumnLayoutEngine, TopoSorter};
pub use payload::{graph_query, GraphPayload, GraphView, RenderRow};
