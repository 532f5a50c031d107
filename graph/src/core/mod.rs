pub mod dag;

pub use dag::{CommitGraph, GraphStats};
