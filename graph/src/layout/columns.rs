use forge_core::Commit;
use std::collections::HashMap;

/// Assigns each commit in render order to a column.
///
/// Slots are either free or reserved for a parent that has not been placed
/// yet. Slots are never removed, so the width only grows.
#[derive(Debug, Default)]
pub struct ColumnLayoutEngine {
    slots: Vec<Option<String>>,
    columns: HashMap<String, usize>,
}

impl ColumnLayoutEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn free_slot(&mut self) -> usize {
        match self.slots.iter().position(Option::is_none) {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }

    /// Place the next commit and reserve columns for its unplaced parents
    pub fn place(&mut self, commit: &Commit) -> usize {
        let column = match self.columns.get(&commit.id) {
            Some(&column) => column,
            None => {
                let column = self.free_slot();
                self.columns.insert(commit.id.clone(), column);
                column
            }
        };
        self.slots[column] = None;

        // First parent in list order wins the first free slot
        for parent in &commit.parents {
            if self.columns.contains_key(parent) {
                continue;
            }
            let slot = self.free_slot();
            self.columns.insert(parent.clone(), slot);
            self.slots[slot] = Some(parent.clone());
        }
        column
    }

    pub fn column_of(&self, id: &str) -> Option<usize> {
        self.columns.get(id).copied()
    }

    /// Number of slots ever opened
    pub fn width(&self) -> usize {
        self.slots.len()
    }
}
