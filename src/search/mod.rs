//! Compiles the backup-selection document into a tree of matchers and
//! drives the one filesystem traversal each backup performs.

pub mod config;

use std::cell::Cell;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::metadata::Policy;
use crate::stat::{self, Kind, Stat};

pub type NodeId = u32;

pub enum Matcher {
    Literal(Vec<u8>),
    Regex(Regex),
}

pub struct MatchNode {
    pub matcher: Matcher,
    pub policy: Option<Policy>,
    pub line_nr: u32,
    pub policy_line_nr: Option<u32>,
    pub children: Option<Vec<NodeId>>,
    pub subnodes_contain_regex: bool,
    pub matched: Cell<bool>,
}

pub struct ExprEntry {
    pub regex: Regex,
    pub line_nr: u32,
    pub matched: Cell<bool>,
}

impl ExprEntry {
    fn new(regex: Regex, line_nr: u32) -> Self {
        Self {
            regex,
            line_nr,
            matched: Cell::new(false),
        }
    }
}

/// Tree of matchers compiled from the config document, plus the two
/// expression lists (`ignore`, `summarize`) shared across the whole tree -
/// owned `Vec`s on the root rather than a shared pointer-to-pointer, since
/// nothing here needs interior mutability beyond the per-node `matched`
/// flags.
pub struct SearchTree {
    pub nodes: Vec<MatchNode>,
    pub roots: Vec<NodeId>,
    pub ignore_exprs: Vec<ExprEntry>,
    pub summarize_exprs: Vec<ExprEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResultType {
    File,
    Directory,
    Symlink,
}

pub struct SearchResult {
    pub path: Utf8PathBuf,
    pub kind: SearchResultType,
    pub stat: Stat,
    pub matched_node: Option<NodeId>,
    pub effective_policy: Policy,
}

pub enum Event {
    Entry(SearchResult),
    EndOfDirectory(Utf8PathBuf),
}

impl SearchTree {
    pub fn empty() -> Self {
        SearchTree {
            nodes: Vec::new(),
            roots: Vec::new(),
            ignore_exprs: Vec::new(),
            summarize_exprs: Vec::new(),
        }
    }

    /// Walks `root` once, yielding one event per visited entry plus an
    /// `EndOfDirectory` marker after each directory's children.
    /// Materialized eagerly into a `Vec` rather than
    /// produced lazily: a tracked tree is small enough to hold in memory
    /// at once, the same way the rest of this crate (and backpak's index/
    /// snapshot types) load whole structures rather than stream them.
    pub fn traverse(&self, root: &Utf8Path) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        self.visit_known_children(root, &self.roots, Policy::None, &mut events)?;
        Ok(events)
    }

    fn visit_known_children(
        &self,
        dir: &Utf8Path,
        node_ids: &[NodeId],
        inherited_policy: Policy,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        for &id in node_ids {
            let name = match &self.nodes[id as usize].matcher {
                Matcher::Literal(n) => n.clone(),
                // A bare regex child only gets a turn once its directory
                // is opened fully; see `visit_directory_fully`.
                Matcher::Regex(_) => continue,
            };
            let path = dir.join(String::from_utf8_lossy(&name).as_ref());
            self.visit_path(&path, Some(id), inherited_policy, events)?;
        }
        Ok(())
    }

    fn visit_path(
        &self,
        path: &Utf8Path,
        node_id: Option<NodeId>,
        inherited_policy: Policy,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        if self.is_ignored(path) {
            return Ok(());
        }

        let st = match stat::lstat(path) {
            Ok(st) => st,
            Err(_) => return Ok(()), // vanished between enumeration and stat
        };
        if st.kind == Kind::Other {
            return Ok(());
        }

        if let Some(id) = node_id {
            self.nodes[id as usize].matched.set(true);
        }
        let node = node_id.map(|id| &self.nodes[id as usize]);
        let policy = node.and_then(|n| n.policy).unwrap_or(inherited_policy);

        // `[ignore]` excludes the path and its subtree the same way an
        // `ignore <regex>` expression does: no `Entry` event, no descent.
        if policy == Policy::Ignore {
            return Ok(());
        }

        let kind = match st.kind {
            Kind::Regular => SearchResultType::File,
            Kind::Symlink => SearchResultType::Symlink,
            Kind::Directory => SearchResultType::Directory,
            Kind::Other => unreachable!("filtered above"),
        };
        let is_directory = st.kind == Kind::Directory;

        events.push(Event::Entry(SearchResult {
            path: path.to_owned(),
            kind,
            stat: st,
            matched_node: node_id,
            effective_policy: policy,
        }));

        if is_directory {
            if self.is_summarized(path) {
                // Matches halt propagation of remaining summarize
                // expressions, and of recursive reporting, into this node.
            } else {
                let has_regex_children =
                    node.map(|n| n.subnodes_contain_regex).unwrap_or(false);
                // A node with `none` policy and no regex subnodes doesn't
                // open the directory; it only visits named children.
                if policy != Policy::None || has_regex_children {
                    self.visit_directory_fully(path, node_id, policy, events)?;
                } else {
                    let known = node
                        .and_then(|n| n.children.clone())
                        .unwrap_or_default();
                    self.visit_known_children(path, &known, policy, events)?;
                }
            }
            events.push(Event::EndOfDirectory(path.to_owned()));
        }
        Ok(())
    }

    fn visit_directory_fully(
        &self,
        dir: &Utf8Path,
        node_id: Option<NodeId>,
        policy: Policy,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let known = node_id
            .and_then(|id| self.nodes[id as usize].children.clone())
            .unwrap_or_default();

        let entries =
            std::fs::read_dir(dir).with_context(|| format!("Couldn't read directory {dir}"))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("Couldn't read an entry of {dir}"))?;
            let name = entry.file_name().to_string_lossy().into_owned();

            let child_id = known
                .iter()
                .copied()
                .find(|&id| {
                    matches!(&self.nodes[id as usize].matcher, Matcher::Literal(n) if n.as_slice() == name.as_bytes())
                })
                .or_else(|| {
                    known.iter().copied().find(|&id| {
                        matches!(&self.nodes[id as usize].matcher, Matcher::Regex(r) if r.is_match(&name))
                    })
                });

            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|p| anyhow::anyhow!("{} isn't valid UTF-8", p.display()))?;
            self.visit_path(&path, child_id, policy, events)?;
        }
        Ok(())
    }

    fn is_ignored(&self, path: &Utf8Path) -> bool {
        self.ignore_exprs.iter().any(|e| {
            let m = e.regex.is_match(path.as_str());
            if m {
                e.matched.set(true);
            }
            m
        })
    }

    fn is_summarized(&self, path: &Utf8Path) -> bool {
        self.summarize_exprs.iter().any(|e| {
            let m = e.regex.is_match(path.as_str());
            if m {
                e.matched.set(true);
            }
            m
        })
    }

    /// Matchers and ignore/summarize expressions that never fired during
    /// the traversal - non-fatal diagnostics surfaced after a backup.
    pub fn unmatched_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for node in &self.nodes {
            if !node.matched.get() {
                let (kind, pattern) = match &node.matcher {
                    Matcher::Literal(n) => ("string", String::from_utf8_lossy(n).into_owned()),
                    Matcher::Regex(r) => ("regex", r.as_str().to_owned()),
                };
                warnings.push(format!(
                    "config: line {}: {kind} never matched a path: \"{pattern}\"",
                    node.line_nr
                ));
            }
        }
        for e in &self.ignore_exprs {
            if !e.matched.get() {
                warnings.push(format!(
                    "config: line {}: ignore expression never matched: \"{}\"",
                    e.line_nr,
                    e.regex.as_str()
                ));
            }
        }
        for e in &self.summarize_exprs {
            if !e.matched.get() {
                warnings.push(format!(
                    "config: line {}: summarize expression never matched: \"{}\"",
                    e.line_nr,
                    e.regex.as_str()
                ));
            }
        }
        warnings
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn traverses_a_small_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir_all(root.join("tmp/files")).unwrap();
        fs::write(root.join("tmp/files/a.txt"), b"hello").unwrap();

        let config = format!("[copy]\n{}/tmp/files/\n", root);
        let tree = SearchTree::parse(&config).unwrap();
        let events = tree.traverse(Utf8Path::new("/")).unwrap();

        let paths: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::Entry(r) => Some(r.path.clone()),
                Event::EndOfDirectory(_) => None,
            })
            .collect();
        assert!(paths.iter().any(|p| p.as_str().ends_with("tmp/files/a.txt")));
    }

    #[test]
    fn ignore_expression_skips_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("a/keep.txt"), b"hi").unwrap();
        fs::write(root.join("a/skip.tmp"), b"hi").unwrap();

        let config = format!("[copy]\n{}/a/\nignore \\.tmp$\n", root);
        let tree = SearchTree::parse(&config).unwrap();
        let events = tree.traverse(Utf8Path::new("/")).unwrap();

        let paths: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::Entry(r) => Some(r.path.clone()),
                Event::EndOfDirectory(_) => None,
            })
            .collect();
        assert!(paths.iter().any(|p| p.as_str().ends_with("keep.txt")));
        assert!(!paths.iter().any(|p| p.as_str().ends_with("skip.tmp")));
    }

    #[test]
    fn ignore_policy_excludes_the_path_and_its_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir_all(root.join("a/keep")).unwrap();
        fs::create_dir_all(root.join("a/skip")).unwrap();
        fs::write(root.join("a/keep/file.txt"), b"hi").unwrap();
        fs::write(root.join("a/skip/file.txt"), b"hi").unwrap();

        let config = format!("[copy]\n{root}/a/keep/\n[ignore]\n{root}/a/skip/\n");
        let tree = SearchTree::parse(&config).unwrap();
        let events = tree.traverse(Utf8Path::new("/")).unwrap();

        let paths: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::Entry(r) => Some(r.path.clone()),
                Event::EndOfDirectory(_) => None,
            })
            .collect();
        assert!(paths.iter().any(|p| p.as_str().ends_with("a/keep/file.txt")));
        assert!(!paths.iter().any(|p| p.as_str().contains("skip")));
    }

    #[test]
    fn unmatched_literal_is_reported() {
        let tree = SearchTree::parse("[copy]\n/does/not/exist\n").unwrap();
        tree.traverse(Utf8Path::new("/")).ok();
        let warnings = tree.unmatched_warnings();
        assert!(warnings.iter().any(|w| w.contains("never matched")));
    }
}
