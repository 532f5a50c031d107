//! Render ordering of a commit graph.
//!
//! Heads are sorted oldest-first by commit date and used as a stack, so the
//! newest head is emitted first. A commit is only emitted once all of its
//! children in the graph have been, which keeps every child above its parents.

use forge_core::{ForgeError, ForgeResult};
use std::collections::HashMap;
use tracing::error;

use crate::core::CommitGraph;

pub struct TopoSorter<'g> {
    graph: &'g CommitGraph,
    index: HashMap<&'g str, usize>,
    /// In-graph parents per node, duplicates removed
    parents: Vec<Vec<usize>>,
}

impl<'g> TopoSorter<'g> {
    pub fn new(graph: &'g CommitGraph) -> Self {
        let index: HashMap<&str, usize> = graph
            .ids()
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let parents = graph
            .commits()
            .map(|commit| {
                let mut linked: Vec<usize> = Vec::with_capacity(commit.parents.len());
                for parent in &commit.parents {
                    if let Some(&p) = index.get(parent.as_str()) {
                        if !linked.contains(&p) {
                            linked.push(p);
                        }
                    }
                }
                linked
            })
            .collect();

        Self { graph, index, parents }
    }

    /// Every commit exactly once, children before parents
    pub fn sort(&self, heads: &[String]) -> ForgeResult<Vec<&'g str>> {
        let ids = self.graph.ids();
        let mut pending = vec![0usize; ids.len()];
        for linked in &self.parents {
            for &p in linked {
                pending[p] += 1;
            }
        }

        let mut stack: Vec<usize> = heads
            .iter()
            .filter_map(|h| self.index.get(h.as_str()).copied())
            .collect();
        // Stable: heads with equal dates keep their input order
        stack.sort_by_key(|&i| self.graph.get(&ids[i]).map(|c| c.committed));

        let mut visited = vec![false; ids.len()];
        let mut emitted = Vec::with_capacity(ids.len());

        while let Some(n) = stack.pop() {
            // Reached again once its last child is emitted
            if visited[n] || pending[n] > 0 {
                continue;
            }
            visited[n] = true;
            emitted.push(ids[n].as_str());

            for &p in &self.parents[n] {
                pending[p] -= 1;
                if pending[p] == 0 {
                    stack.push(p);
                }
            }
        }

        if emitted.len() != ids.len() {
            error!(
                expected = ids.len(),
                emitted = emitted.len(),
                "topological sort did not reach every commit"
            );
            return Err(ForgeError::GraphInconsistency {
                expected: ids.len(),
                emitted: emitted.len(),
            });
        }
        Ok(emitted)
    }
}
