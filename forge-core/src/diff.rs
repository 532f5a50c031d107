use git2::Patch;
use serde::{Deserialize, Serialize};
use similar::{DiffTag, TextDiff};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use tracing::debug;

use crate::backend::{RepositoryBackend, TreeEntry};
use crate::error::{ForgeError, ForgeResult};

pub const BINARY_PLACEHOLDER: &str = "Cannot display: file marked as a binary type.";

/// How many leading bytes are scanned for NUL when sniffing binary content
const BINARY_SNIFF_LEN: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
    Copied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub kind: ChangeKind,
    pub is_dir: bool,
    /// Rename or copy source
    pub source: Option<String>,
}

/// One window of changes plus the total across all kinds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedChanges {
    pub added: Vec<DiffEntry>,
    pub removed: Vec<DiffEntry>,
    pub changed: Vec<DiffEntry>,
    pub copied: Vec<DiffEntry>,
    pub total: usize,
}

impl PagedChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && self.copied.is_empty()
    }

    /// Window `[start, start + count)` over classified entries
    fn window(entries: Vec<DiffEntry>, start: usize, count: usize) -> Self {
        let mut page = PagedChanges {
            total: entries.len(),
            ..PagedChanges::default()
        };
        for entry in entries.into_iter().skip(start).take(count) {
            page.push(entry);
        }
        page
    }

    fn push(&mut self, entry: DiffEntry) {
        match entry.kind {
            ChangeKind::Added => self.added.push(entry),
            ChangeKind::Removed => self.removed.push(entry),
            ChangeKind::Changed => self.changed.push(entry),
            ChangeKind::Copied => self.copied.push(entry),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitChanges {
    pub commit_id: String,
    pub page: usize,
    pub limit: usize,
    pub changes: PagedChanges,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffFormat {
    #[default]
    Unified,
    SideBySide,
}

/// How a side-by-side row lines up the two texts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowTag {
    Equal,
    Replace,
    Delete,
    Insert,
}

impl From<DiffTag> for RowTag {
    fn from(tag: DiffTag) -> Self {
        match tag {
            DiffTag::Equal => RowTag::Equal,
            DiffTag::Replace => RowTag::Replace,
            DiffTag::Delete => RowTag::Delete,
            DiffTag::Insert => RowTag::Insert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberedLine {
    pub number: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideBySideRow {
    pub tag: RowTag,
    pub left: Option<NumberedLine>,
    pub right: Option<NumberedLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideBySideTable {
    pub left_label: String,
    pub right_label: String,
    pub rows: Vec<SideBySideRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum FileDiff {
    Unified { text: String },
    SideBySide(SideBySideTable),
    Binary { message: String },
}

/// Clamp `limit` to at least one and `page` to the last existing page
pub fn sanitize_paging(limit: usize, page: usize, total: usize) -> (usize, usize) {
    let limit = limit.max(1);
    let max_page = total.div_ceil(limit).saturating_sub(1);
    (limit, page.min(max_page))
}

pub fn is_binary(content: &[u8]) -> bool {
    content.iter().take(BINARY_SNIFF_LEN).any(|b| *b == 0)
}

/// Unified diff of two texts labelled `old` and `new`
pub fn unidiff(old: &str, new: &str) -> ForgeResult<String> {
    patch_text(old.as_bytes(), "old", new.as_bytes(), "new")
}

fn patch_text(old: &[u8], old_path: &str, new: &[u8], new_path: &str) -> ForgeResult<String> {
    let mut patch = Patch::from_buffers(
        old,
        Some(Path::new(old_path)),
        new,
        Some(Path::new(new_path)),
        None,
    )?;
    let buf = patch.to_buf()?;
    let text = String::from_utf8_lossy(&buf);

    // Drop the `diff --git` preamble, keep from the file labels on
    Ok(match text.find("--- ") {
        Some(start) => text[start..].to_string(),
        None => String::new(),
    })
}

fn within(path: &str, filter: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(prefix) => {
            path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
        }
    }
}

fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(dir, _)| dir)
}

/// Every directory above `path`, innermost first
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(parent_dir(path), |dir| parent_dir(*dir))
}

/// Computes path-level and line-level differences between commit snapshots
pub struct DiffEngine<'b> {
    backend: &'b dyn RepositoryBackend,
}

impl<'b> DiffEngine<'b> {
    pub fn new(backend: &'b dyn RepositoryBackend) -> Self {
        DiffEngine { backend }
    }

    fn snapshot(
        &self,
        commit_id: Option<&str>,
        filter: Option<&str>,
    ) -> ForgeResult<BTreeMap<String, TreeEntry>> {
        let Some(commit_id) = commit_id else {
            return Ok(BTreeMap::new());
        };
        Ok(self
            .backend
            .tree_entries(commit_id)?
            .into_iter()
            .filter(|entry| within(&entry.path, filter))
            .map(|entry| (entry.path.clone(), entry))
            .collect())
    }

    /// Every change from `base` (None = empty tree) to `target`, ordered
    /// added, removed, changed, copied and by path within each kind
    pub fn classify(
        &self,
        base: Option<&str>,
        target: &str,
        filter: Option<&str>,
    ) -> ForgeResult<Vec<DiffEntry>> {
        let filter = filter.map(|f| f.trim_end_matches('/')).filter(|f| !f.is_empty());
        let old = self.snapshot(base, filter)?;
        let new = self.snapshot(Some(target), filter)?;

        let mut added: BTreeSet<&str> = new
            .keys()
            .filter(|p| !old.contains_key(*p))
            .map(String::as_str)
            .collect();
        let mut removed: BTreeSet<&str> = old
            .keys()
            .filter(|p| !new.contains_key(*p))
            .map(String::as_str)
            .collect();

        let mut old_by_oid: HashMap<&str, Vec<&str>> = HashMap::new();
        for entry in old.values().filter(|e| !e.is_dir) {
            old_by_oid.entry(entry.oid.as_str()).or_default().push(entry.path.as_str());
        }

        let mut copied = Vec::new();
        let mut renamed = BTreeSet::new();
        for path in added.clone() {
            let entry = &new[path];
            if entry.is_dir {
                continue;
            }
            let Some(candidates) = old_by_oid.get(entry.oid.as_str()) else {
                continue;
            };
            let source = candidates
                .iter()
                .find(|p| removed.contains(*p) && !renamed.contains(*p))
                .or_else(|| candidates.first())
                .copied();
            if let Some(source) = source {
                if removed.contains(source) {
                    renamed.insert(source);
                }
                added.remove(path);
                copied.push(DiffEntry {
                    path: path.to_string(),
                    kind: ChangeKind::Copied,
                    is_dir: false,
                    source: Some(source.to_string()),
                });
            }
        }
        for source in &renamed {
            removed.remove(source);
        }

        // A directory holding a copy target or rename source cannot stand in
        // for its contents; those are listed one by one instead
        let split_added: HashSet<&str> = copied
            .iter()
            .flat_map(|entry| ancestors(&entry.path))
            .collect();
        let split_removed: HashSet<&str> =
            renamed.iter().flat_map(|path| ancestors(*path)).collect();

        let mut entries = Vec::new();
        for (paths, split, kind, snapshot) in [
            (&added, &split_added, ChangeKind::Added, &new),
            (&removed, &split_removed, ChangeKind::Removed, &old),
        ] {
            for path in paths.iter() {
                if split.contains(path) {
                    continue;
                }
                // A new or vanished directory stands in for its contents
                if parent_dir(path).is_some_and(|dir| paths.contains(dir) && !split.contains(dir)) {
                    continue;
                }
                entries.push(DiffEntry {
                    path: path.to_string(),
                    kind,
                    is_dir: snapshot[*path].is_dir,
                    source: None,
                });
            }
        }

        for (path, after) in &new {
            if let Some(before) = old.get(path) {
                if before.oid != after.oid && !(before.is_dir && after.is_dir) {
                    entries.push(DiffEntry {
                        path: path.clone(),
                        kind: ChangeKind::Changed,
                        is_dir: after.is_dir,
                        source: None,
                    });
                }
            }
        }

        entries.extend(copied);
        Ok(entries)
    }

    /// Changes intersecting the window `[start, start + count)`
    pub fn changes(
        &self,
        base: Option<&str>,
        target: &str,
        filter: Option<&str>,
        start: usize,
        count: usize,
    ) -> ForgeResult<PagedChanges> {
        let page = PagedChanges::window(self.classify(base, target, filter)?, start, count);
        debug!(target, total = page.total, start, count, "paged diff");
        Ok(page)
    }

    /// Changes introduced by a commit relative to its first parent
    pub fn commit_changes(
        &self,
        commit_id: &str,
        page: usize,
        limit: usize,
    ) -> ForgeResult<CommitChanges> {
        let commit = self
            .backend
            .commit(commit_id)?
            .ok_or_else(|| ForgeError::not_found("commit", commit_id))?;

        let base = commit.parents.first().map(String::as_str);
        let entries = self.classify(base, &commit.id, None)?;
        let (limit, page) = sanitize_paging(limit, page, entries.len());
        let changes = PagedChanges::window(entries, page * limit, limit);

        Ok(CommitChanges {
            commit_id: commit.id,
            page,
            limit,
            changes,
        })
    }

    /// Line-level diff of one path between two commits
    pub fn file_diff(
        &self,
        base: Option<&str>,
        target: &str,
        path: &str,
        format: DiffFormat,
    ) -> ForgeResult<FileDiff> {
        let new = self
            .backend
            .blob(target, path)?
            .ok_or_else(|| ForgeError::not_found("path", path))?;
        let old = match base {
            Some(base) => self.backend.blob(base, path)?.unwrap_or_default(),
            None => Vec::new(),
        };

        if is_binary(&old) || is_binary(&new) {
            return Ok(FileDiff::Binary {
                message: BINARY_PLACEHOLDER.to_string(),
            });
        }

        match format {
            DiffFormat::Unified => Ok(FileDiff::Unified {
                text: patch_text(&old, path, &new, path)?,
            }),
            DiffFormat::SideBySide => Ok(FileDiff::SideBySide(side_by_side(
                &String::from_utf8_lossy(&old),
                &String::from_utf8_lossy(&new),
                &format!("a/{}", path),
                &format!("b/{}", path),
            ))),
        }
    }
}

/// Align two texts into rows using the line diff opcodes
pub fn side_by_side(old: &str, new: &str, left_label: &str, right_label: &str) -> SideBySideTable {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();
    let line = |lines: &[&str], idx: usize| NumberedLine {
        number: idx + 1,
        text: lines[idx].to_string(),
    };

    let diff = TextDiff::from_slices(&a, &b);
    let mut rows = Vec::new();
    for op in diff.ops() {
        let tag = RowTag::from(op.tag());
        let left = op.old_range();
        let right = op.new_range();
        for k in 0..left.len().max(right.len()) {
            rows.push(SideBySideRow {
                tag,
                left: (k < left.len()).then(|| line(&a, left.start + k)),
                right: (k < right.len()).then(|| line(&b, right.start + k)),
            });
        }
    }

    SideBySideTable {
        left_label: left_label.to_string(),
        right_label: right_label.to_string(),
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use pretty_assertions::assert_eq;

    fn entry(path: &str, kind: ChangeKind, is_dir: bool, source: Option<&str>) -> DiffEntry {
        DiffEntry {
            path: path.to_string(),
            kind,
            is_dir,
            source: source.map(str::to_string),
        }
    }

    fn two_commits() -> MemoryBackend {
        let backend = MemoryBackend::new("diff");
        backend.add_commit("a", &[], 100, "a");
        backend.add_commit("b", &["a"], 200, "b");
        backend.set_files(
            "a",
            &[
                ("README", "readme\n"),
                ("src/old_name.rs", "fn moved() {}\n"),
                ("src/lib.rs", "fn one() {}\n"),
                ("docs/guide.md", "guide\n"),
                ("docs/api.md", "api\n"),
            ],
        );
        backend.set_files(
            "b",
            &[
                ("README", "readme\n"),
                ("src/new_name.rs", "fn moved() {}\n"),
                ("src/lib.rs", "fn two() {}\n"),
                ("tests/it.rs", "#[test] fn t() {}\n"),
                ("tests/data/input.txt", "data\n"),
                ("README.copy", "readme\n"),
            ],
        );
        backend
    }

    #[test]
    fn self_diff_is_empty() {
        let backend = two_commits();
        let engine = DiffEngine::new(&backend);
        let page = engine.changes(Some("b"), "b", None, 0, 100).unwrap();
        assert!(page.is_empty());
        assert_eq!(page.total, 0);
    }

    #[test]
    fn classifies_all_kinds() {
        let backend = two_commits();
        let engine = DiffEngine::new(&backend);
        let entries = engine.classify(Some("a"), "b", None).unwrap();

        assert_eq!(
            entries,
            vec![
                entry("tests", ChangeKind::Added, true, None),
                entry("docs", ChangeKind::Removed, true, None),
                entry("src/lib.rs", ChangeKind::Changed, false, None),
                entry("README.copy", ChangeKind::Copied, false, Some("README")),
                entry("src/new_name.rs", ChangeKind::Copied, false, Some("src/old_name.rs")),
            ]
        );
    }

    #[test]
    fn rename_with_identical_content_is_copied() {
        let backend = MemoryBackend::new("rename");
        backend.add_commit("a", &[], 100, "a");
        backend.add_commit("b", &["a"], 200, "b");
        backend.set_files("a", &[("old.txt", "same\n")]);
        backend.set_files("b", &[("new.txt", "same\n")]);

        let page = DiffEngine::new(&backend).changes(Some("a"), "b", None, 0, 10).unwrap();
        assert!(page.added.is_empty());
        assert!(page.removed.is_empty());
        assert_eq!(page.copied, vec![entry("new.txt", ChangeKind::Copied, false, Some("old.txt"))]);
    }

    #[test]
    fn renamed_directory_lists_contents() {
        let backend = MemoryBackend::new("dir-rename");
        backend.add_commit("a", &[], 100, "a");
        backend.add_commit("b", &["a"], 200, "b");
        backend.add_commit("c", &["b"], 300, "c");
        backend.set_files("a", &[("docs/guide.md", "guide\n"), ("docs/api.md", "api\n")]);
        backend.set_files("b", &[("manual/guide.md", "guide\n"), ("manual/api.md", "api\n")]);
        backend.set_files("c", &[("book/guide.md", "guide\n"), ("book/extra.md", "extra\n")]);
        let engine = DiffEngine::new(&backend);

        assert_eq!(
            engine.classify(Some("a"), "b", None).unwrap(),
            vec![
                entry("manual/api.md", ChangeKind::Copied, false, Some("docs/api.md")),
                entry("manual/guide.md", ChangeKind::Copied, false, Some("docs/guide.md")),
            ]
        );
        assert_eq!(
            engine.classify(Some("b"), "c", None).unwrap(),
            vec![
                entry("book/extra.md", ChangeKind::Added, false, None),
                entry("manual/api.md", ChangeKind::Removed, false, None),
                entry("book/guide.md", ChangeKind::Copied, false, Some("manual/guide.md")),
            ]
        );
    }

    #[test]
    fn reversed_diff_swaps_added_and_removed() {
        let backend = two_commits();
        let engine = DiffEngine::new(&backend);
        let forward = engine.changes(Some("a"), "b", None, 0, 100).unwrap();
        let backward = engine.changes(Some("b"), "a", None, 0, 100).unwrap();

        let paths = |entries: &[DiffEntry]| {
            entries.iter().map(|e| e.path.clone()).collect::<Vec<_>>()
        };
        assert_eq!(paths(&forward.removed), paths(&backward.added));
        // A copy has no source on the way back, so it shows up as removed
        assert_eq!(paths(&backward.removed), vec!["README.copy", "tests"]);
        assert_eq!(forward.changed, backward.changed);
        assert_eq!(
            backward.copied,
            vec![entry("src/old_name.rs", ChangeKind::Copied, false, Some("src/new_name.rs"))]
        );
    }

    #[test]
    fn window_spans_kinds_in_order() {
        let backend = two_commits();
        let engine = DiffEngine::new(&backend);

        let page = engine.changes(Some("a"), "b", None, 1, 3).unwrap();
        assert_eq!(page.total, 5);
        assert!(page.added.is_empty());
        assert_eq!(page.removed.len(), 1);
        assert_eq!(page.changed.len(), 1);
        assert_eq!(page.copied.len(), 1);

        let past_end = engine.changes(Some("a"), "b", None, 10, 3).unwrap();
        assert!(past_end.is_empty());
        assert_eq!(past_end.total, 5);
    }

    #[test]
    fn path_filter_limits_scope() {
        let backend = two_commits();
        let engine = DiffEngine::new(&backend);
        let page = engine.changes(Some("a"), "b", Some("src/"), 0, 100).unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.changed[0].path, "src/lib.rs");
        assert_eq!(page.copied[0].path, "src/new_name.rs");
    }

    #[test]
    fn commit_changes_against_first_parent() {
        let backend = two_commits();
        let engine = DiffEngine::new(&backend);

        let root = engine.commit_changes("a", 0, 25).unwrap();
        assert_eq!(root.changes.total, 3);
        assert_eq!(
            root.changes.added.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
            vec!["README", "docs", "src"]
        );

        let clamped = engine.commit_changes("b", 7, 2).unwrap();
        assert_eq!((clamped.page, clamped.limit), (2, 2));
        assert_eq!(clamped.changes.copied.len(), 1);

        assert!(matches!(
            engine.commit_changes("zzz", 0, 10),
            Err(ForgeError::NotFound { .. })
        ));
    }

    #[test]
    fn sanitize_paging_bounds() {
        assert_eq!(sanitize_paging(0, 3, 10), (1, 3));
        assert_eq!(sanitize_paging(25, 4, 30), (25, 1));
        assert_eq!(sanitize_paging(25, 0, 0), (25, 0));
    }

    #[test]
    fn unified_file_diff() {
        let backend = MemoryBackend::new("unified");
        backend.add_commit("a", &[], 100, "a");
        backend.add_commit("b", &["a"], 200, "b");
        backend.set_files("a", &[("f.txt", "same\nold\n")]);
        backend.set_files("b", &[("f.txt", "same\nnew\n")]);

        let diff = DiffEngine::new(&backend)
            .file_diff(Some("a"), "b", "f.txt", DiffFormat::Unified)
            .unwrap();
        let FileDiff::Unified { text } = diff else {
            panic!("expected unified diff");
        };
        assert!(text.starts_with("--- a/f.txt\n+++ b/f.txt\n"));
        assert!(text.contains("-old\n"));
        assert!(text.contains("+new\n"));
    }

    #[test]
    fn side_by_side_aligns_rows() {
        let table = side_by_side("a\nb\nc\n", "a\nx\ny\nc\n", "a/f", "b/f");
        let tags: Vec<_> = table.rows.iter().map(|r| r.tag).collect();
        assert_eq!(tags, vec![RowTag::Equal, RowTag::Replace, RowTag::Replace, RowTag::Equal]);

        assert_eq!(table.rows[1].left.as_ref().map(|l| l.text.as_str()), Some("b"));
        assert_eq!(table.rows[2].left, None);
        assert_eq!(
            table.rows[3].right,
            Some(NumberedLine {
                number: 4,
                text: "c".to_string()
            })
        );
    }

    #[test]
    fn binary_content_short_circuits() {
        let backend = MemoryBackend::new("binary");
        backend.add_commit("a", &[], 100, "a");
        backend.add_commit("b", &["a"], 200, "b");
        backend.set_file_bytes("a", "logo.png", &[0x89, b'P', b'N', b'G', 0, 1]);
        backend.set_file_bytes("b", "logo.png", &[0x89, b'P', b'N', b'G', 0, 2]);

        let engine = DiffEngine::new(&backend);
        for format in [DiffFormat::Unified, DiffFormat::SideBySide] {
            assert_eq!(
                engine.file_diff(Some("a"), "b", "logo.png", format).unwrap(),
                FileDiff::Binary {
                    message: BINARY_PLACEHOLDER.to_string()
                }
            );
        }
    }

    #[test]
    fn missing_paths() {
        let backend = two_commits();
        let engine = DiffEngine::new(&backend);

        let added = engine
            .file_diff(Some("a"), "b", "tests/it.rs", DiffFormat::SideBySide)
            .unwrap();
        let FileDiff::SideBySide(table) = added else {
            panic!("expected side-by-side diff");
        };
        assert!(table.rows.iter().all(|r| r.tag == RowTag::Insert && r.left.is_none()));

        assert!(matches!(
            engine.file_diff(Some("a"), "b", "nope.rs", DiffFormat::Unified),
            Err(ForgeError::NotFound { kind: "path", .. })
        ));
    }

    #[test]
    fn description_unidiff() {
        let text = unidiff("line one\nline two\n", "line one\nline 2\n").unwrap();
        assert!(text.starts_with("--- a/old\n+++ b/new\n"));
        assert!(text.contains("-line two\n"));
        assert!(text.contains("+line 2\n"));
    }
}
