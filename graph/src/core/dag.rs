use forge_core::Commit;
use std::collections::HashMap;

/// Commit history fetched for one request.
///
/// Parents outside the fetched set are boundary nodes: they can appear as keys
/// of the child map but never in the commit map.
#[derive(Debug, Clone, Default)]
pub struct CommitGraph {
    commits: HashMap<String, Commit>,
    /// Commit ids in the order they were added
    order: Vec<String>,
    /// Quick lookup: commit ID -> children IDs
    children: HashMap<String, Vec<String>>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a commit, linking it as a child of each of its parents
    pub fn add_commit(&mut self, commit: Commit) {
        let id = commit.id.clone();
        if self.commits.contains_key(&id) {
            return;
        }

        for parent_id in &commit.parents {
            let children = self.children.entry(parent_id.clone()).or_default();
            if !children.contains(&id) {
                children.push(id.clone());
            }
        }

        self.order.push(id.clone());
        self.commits.insert(id, commit);
    }

    pub fn get(&self, id: &str) -> Option<&Commit> {
        self.commits.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.commits.contains_key(id)
    }

    /// Commit ids in insertion order
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn commits(&self) -> impl Iterator<Item = &Commit> {
        self.order.iter().filter_map(|id| self.commits.get(id))
    }

    pub fn children_of(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Parent referenced by a fetched commit but not fetched itself
    pub fn is_boundary(&self, id: &str) -> bool {
        self.children.contains_key(id) && !self.commits.contains_key(id)
    }

    pub fn boundary(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .children
            .keys()
            .filter(|id| !self.commits.contains_key(*id))
            .map(String::as_str)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Get all root commits (no parents)
    pub fn roots(&self) -> Vec<&Commit> {
        self.commits().filter(|c| c.is_root()).collect()
    }

    /// Get all leaf commits (no children)
    pub fn leaves(&self) -> Vec<&Commit> {
        self.commits().filter(|c| self.children_of(&c.id).is_empty()).collect()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            total_commits: self.len(),
            merge_commits: self.commits().filter(|c| c.is_merge()).count(),
            root_commits: self.roots().len(),
            leaf_commits: self.leaves().len(),
            boundary_commits: self.boundary().len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphStats {
    pub total_commits: usize,
    pub merge_commits: usize,
    pub root_commits: usize,
    pub leaf_commits: usize,
    pub boundary_commits: usize,
}


#[cfg(test)]
mod tests {
    use super::fixtures::commit;
    use super::*;

    #[test]
    fn children_are_deduplicated_in_insertion_order() {
        let mut graph = CommitGraph::new();
        graph.add_commit(commit("base", &[], 1));
        graph.add_commit(commit("b1", &["base"], 2));
        graph.add_commit(commit("b2", &["base"], 3));
        graph.add_commit(commit("odd", &["b1", "b1"], 4));

        assert_eq!(graph.children_of("base"), ["b1", "b2"]);
        assert_eq!(graph.children_of("b1"), ["odd"]);
        assert!(graph.children_of("odd").is_empty());
        assert_eq!(graph.ids(), ["base", "b1", "b2", "odd"]);
    }

    #[test]
    fn missing_parents_are_boundary() {
        let mut graph = CommitGraph::new();
        graph.add_commit(commit("c3", &["c2"], 3));
        graph.add_commit(commit("m", &["c3", "side"], 4));

        assert!(graph.is_boundary("c2"));
        assert!(!graph.is_boundary("c3"));
        assert!(graph.get("c2").is_none());
        assert_eq!(graph.boundary(), vec!["c2", "side"]);

        let stats = graph.stats();
        assert_eq!(stats.total_commits, 2);
        assert_eq!(stats.merge_commits, 1);
        assert_eq!(stats.root_commits, 0);
        assert_eq!(stats.leaf_commits, 1);
    }
}
