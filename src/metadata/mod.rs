//! The in-memory tree of tracked paths plus its binary on-disk format
//! (spec'd layout in `codec`). This is the component `BackupEngine`
//! mutates during a backup and atomically rewrites at the end, mirroring
//! how backpak's `index.rs`/`snapshot.rs` load a binary structure up front,
//! mutate it in memory, and rewrite it atomically via `file_util::safe_copy_to_file`.

pub mod codec;

use std::fs::File;
use std::io::Write;

use anyhow::{Context, Result, bail, ensure};
use camino::Utf8Path;
use rustc_hash::FxHashMap;

use crate::hashing::Hash20;
use codec::{Cursor, write_bytes, write_i64, write_u16, write_varuint};

pub type NodeId = u32;
pub type BackupPointId = u32;

/// `{ id, timestamp, ref_count }` minus `id`, which is just the index into
/// [`MetadataRoot::backup_history`] (newest = 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupPoint {
    pub timestamp: i64,
    pub ref_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    None,
    Copy,
    Mirror,
    Track,
    Ignore,
}

impl Policy {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Policy::None,
            1 => Policy::Copy,
            2 => Policy::Mirror,
            3 => Policy::Track,
            4 => Policy::Ignore,
            other => bail!("invalid policy byte {other}"),
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            Policy::None => 0,
            Policy::Copy => 1,
            Policy::Mirror => 2,
            Policy::Track => 3,
            Policy::Ignore => 4,
        }
    }
}

/// A path's state at one backup point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathState {
    NonExisting,
    Regular {
        uid: u64,
        gid: u64,
        mtime: i64,
        mode: u16,
        size: u64,
        hash: Hash20,
        slot: u8,
    },
    Symlink {
        uid: u64,
        gid: u64,
        mtime: i64,
        target: Vec<u8>,
    },
    Directory {
        uid: u64,
        gid: u64,
        mtime: i64,
        mode: u16,
    },
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub backup_point: BackupPointId,
    pub state: PathState,
}

#[derive(Debug, Clone)]
pub struct ConfigHistoryEntry {
    pub backup_point: BackupPointId,
    pub size: u64,
    pub hash: Hash20,
    pub slot: u8,
}

/// The ephemeral per-backup classification a node carries, reset at the
/// start of every backup and owned in spirit by the change detection
/// algorithm in `engine`, which supplies the exclusivity-enforcing setters
/// via an `impl Hint` block of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hint {
    pub class: ChangeClass,
    pub transition: Option<TypeTransition>,
    pub owner_changed: bool,
    pub permissions_changed: bool,
    pub mtime_changed: bool,
    pub content_changed: bool,
    pub fresh_hash: bool,
    pub policy_changed: bool,
    pub loses_history: bool,
    pub affects_parent_timestamp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeClass {
    #[default]
    None,
    Unchanged,
    Added,
    Removed,
    NotPartOfRepository,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTransition {
    RegularToSymlink,
    RegularToDirectory,
    SymlinkToRegular,
    SymlinkToDirectory,
    DirectoryToRegular,
    DirectoryToSymlink,
}

/// One tracked path: its policy, its history of recorded states, its
/// children (if it's a directory), and this backup's ephemeral hint.
///
/// `path` is cached in full (not recomputed from ancestors on every access)
/// as the absolute path, a single owned string. The on-disk format still
/// nests by path *component*, the same decomposition `SearchTree` uses, so
/// `path` is derived once at load (or insertion) time by joining the
/// parent's cached path with this node's name.
#[derive(Debug, Clone)]
pub struct PathNode {
    pub path: Vec<u8>,
    pub policy: Policy,
    pub history: Vec<HistoryEntry>,
    pub children: Option<Vec<NodeId>>,
    pub hint: Hint,
}

/// The full on-disk metadata store: backup history, config history, the
/// path arena, and the derived `path_table` index. `current_backup` isn't a
/// separate field here; history entries and config-history entries bound to
/// it use the sentinel
/// [`MetadataRoot::CURRENT_BACKUP`] until [`MetadataRoot::canonicalize`]
/// assigns it a real id (or drops it, if nothing ended up referencing it).
pub struct MetadataRoot {
    pub backup_history: Vec<BackupPoint>,
    pub config_history: Vec<ConfigHistoryEntry>,
    pub total_path_count: u64,
    pub nodes: Vec<PathNode>,
    pub roots: Vec<NodeId>,
    /// Absolute path -> node id. Indexes only nodes present at load time;
    /// nodes created by `engine::initiate` during the current backup are
    /// deliberately *not* inserted here.
    pub path_table: FxHashMap<Vec<u8>, NodeId>,
}

impl MetadataRoot {
    pub const CURRENT_BACKUP: BackupPointId = u32::MAX;

    pub fn empty() -> Self {
        MetadataRoot {
            backup_history: Vec::new(),
            config_history: Vec::new(),
            total_path_count: 0,
            nodes: Vec::new(),
            roots: Vec::new(),
            path_table: FxHashMap::default(),
        }
    }

    /// Loads `<repo>/metadata`, or an empty tree if it doesn't exist yet
    /// (a fresh repository before its first backup).
    pub fn load(repo_dir: &Utf8Path) -> Result<Self> {
        let path = repo_dir.join("metadata");
        if !path.exists() {
            return Ok(Self::empty());
        }
        let buf = std::fs::read(&path).with_context(|| format!("Couldn't read {path}"))?;
        Self::parse(&buf).with_context(|| format!("{path} is corrupt"))
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(buf);

        let backup_history_length = cur.varuint()?;
        let mut backup_history = Vec::with_capacity(backup_history_length as usize);
        for _ in 0..backup_history_length {
            backup_history.push(BackupPoint {
                timestamp: cur.i64()?,
                ref_count: 0,
            });
        }

        let config_history_length = cur.varuint()?;
        let mut config_history = Vec::with_capacity(config_history_length as usize);
        for _ in 0..config_history_length {
            let backup_id = cur.varuint()?;
            ensure!(
                (backup_id as usize) < backup_history.len(),
                "backup id is out of range"
            );
            let size = cur.varuint()?;
            let (hash, slot) = parse_hash_and_slot(&mut cur, size)?;
            config_history.push(ConfigHistoryEntry {
                backup_point: backup_id as u32,
                size,
                hash,
                slot,
            });
        }

        let total_path_count = cur.varuint()?;
        let mut nodes = Vec::new();
        let roots = parse_path_list(&mut cur, b"", backup_history.len(), &mut nodes)?;
        ensure!(cur.is_empty(), "unneeded trailing bytes");
        if total_path_count == 0 {
            ensure!(nodes.is_empty(), "unneeded trailing bytes");
        }

        let mut root = MetadataRoot {
            backup_history,
            config_history,
            total_path_count,
            nodes,
            roots,
            path_table: FxHashMap::default(),
        };

        let reachable = root.count_reachable();
        ensure!(
            reachable as u64 == root.total_path_count,
            "total_path_count {} does not match {} reachable nodes",
            root.total_path_count,
            reachable
        );

        root.rebuild_ref_counts();
        root.rebuild_path_table();
        Ok(root)
    }

    /// Canonicalizes, then streams the encoded form to a temp file,
    /// fsyncs it, renames it over `<repo>/metadata`, and fsyncs the
    /// containing directory - the same ordering backpak's
    /// `file_util::safe_copy_to_file` follows for pack/index writes.
    pub fn write(&mut self, repo_dir: &Utf8Path, current_backup_timestamp: Option<i64>) -> Result<()> {
        self.canonicalize(current_backup_timestamp);
        let bytes = self.encode();

        let tmp_path = repo_dir.join("tmp-file");
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("Couldn't create {tmp_path}"))?;
        tmp.write_all(&bytes)
            .with_context(|| format!("Couldn't write {tmp_path}"))?;
        tmp.sync_all()
            .with_context(|| format!("Couldn't sync {tmp_path}"))?;
        drop(tmp);

        let final_path = repo_dir.join("metadata");
        std::fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("Couldn't rename {tmp_path} to {final_path}"))?;

        let dir = File::open(repo_dir).with_context(|| format!("Couldn't open {repo_dir}"))?;
        dir.sync_all()
            .with_context(|| format!("Couldn't sync {repo_dir}"))?;
        Ok(())
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_varuint(&mut out, self.backup_history.len() as u64);
        for bp in &self.backup_history {
            write_i64(&mut out, bp.timestamp);
        }

        write_varuint(&mut out, self.config_history.len() as u64);
        for c in &self.config_history {
            write_varuint(&mut out, c.backup_point as u64);
            write_varuint(&mut out, c.size);
            write_hash_and_slot(&mut out, &c.hash, c.size, c.slot);
        }

        write_varuint(&mut out, self.total_path_count);
        self.encode_path_list(&mut out, &self.roots);
        out
    }

    fn encode_path_list(&self, out: &mut Vec<u8>, ids: &[NodeId]) {
        write_varuint(out, ids.len() as u64);
        for &id in ids {
            let node = &self.nodes[id as usize];
            write_bytes(out, last_component(&node.path));
            out.push(node.policy.to_u8());
            write_varuint(out, node.history.len() as u64);
            for h in &node.history {
                write_varuint(out, h.backup_point as u64);
                encode_state(out, &h.state);
            }
            self.encode_path_list(out, node.children.as_deref().unwrap_or(&[]));
        }
    }

    /// Drops dead backup points, merges the current backup into history if
    /// it's referenced, renumbers ids newest-first from 0. Also recomputes
    /// `total_path_count`, since whatever `engine::finish` did to the tree
    /// is the new ground truth.
    pub fn canonicalize(&mut self, current_backup_timestamp: Option<i64>) {
        let mut counts = vec![0u32; self.backup_history.len()];
        let mut current_count = 0u32;
        self.for_each_backup_point_ref(|id| {
            if id == Self::CURRENT_BACKUP {
                current_count += 1;
            } else {
                counts[id as usize] += 1;
            }
        });

        let current_survives = current_count > 0;
        let mut mapping: Vec<Option<BackupPointId>> = vec![None; self.backup_history.len()];
        let mut next_id: BackupPointId = if current_survives { 1 } else { 0 };
        for (old_id, count) in counts.iter().enumerate() {
            if *count > 0 {
                mapping[old_id] = Some(next_id);
                next_id += 1;
            }
        }

        let mut new_history = Vec::with_capacity(next_id as usize);
        if current_survives {
            new_history.push(BackupPoint {
                timestamp: current_backup_timestamp
                    .expect("current backup referenced but has no timestamp"),
                ref_count: current_count,
            });
        }
        for (old_id, bp) in self.backup_history.iter().enumerate() {
            if mapping[old_id].is_some() {
                new_history.push(BackupPoint {
                    timestamp: bp.timestamp,
                    ref_count: counts[old_id],
                });
            }
        }

        self.for_each_backup_point_ref_mut(|id| {
            *id = if *id == Self::CURRENT_BACKUP {
                0
            } else {
                mapping[*id as usize].expect("dead backup point still referenced")
            };
        });

        self.backup_history = new_history;
        self.total_path_count = self.count_reachable() as u64;
    }

    /// All node ids currently reachable from `roots` through `children`.
    /// Used both internally (encoding, ref-count derivation) and by
    /// `engine`, which needs to iterate every live node during a backup.
    pub(crate) fn reachable_ids(&self) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack = self.roots.clone();
        while let Some(id) = stack.pop() {
            result.push(id);
            if let Some(children) = &self.nodes[id as usize].children {
                stack.extend(children.iter().copied());
            }
        }
        result
    }

    fn count_reachable(&self) -> usize {
        self.reachable_ids().len()
    }

    pub fn for_each_node(&self, mut f: impl FnMut(&PathNode)) {
        for id in self.reachable_ids() {
            f(&self.nodes[id as usize]);
        }
    }

    pub fn for_each_node_mut(&mut self, mut f: impl FnMut(&mut PathNode)) {
        for id in self.reachable_ids() {
            f(&mut self.nodes[id as usize]);
        }
    }

    fn for_each_backup_point_ref(&self, mut f: impl FnMut(BackupPointId)) {
        for c in &self.config_history {
            f(c.backup_point);
        }
        self.for_each_node(|n| {
            for h in &n.history {
                f(h.backup_point);
            }
        });
    }

    fn for_each_backup_point_ref_mut(&mut self, mut f: impl FnMut(&mut BackupPointId)) {
        for c in &mut self.config_history {
            f(&mut c.backup_point);
        }
        self.for_each_node_mut(|n| {
            for h in &mut n.history {
                f(&mut h.backup_point);
            }
        });
    }

    fn rebuild_ref_counts(&mut self) {
        let mut counts = vec![0u32; self.backup_history.len()];
        self.for_each_backup_point_ref(|id| counts[id as usize] += 1);
        for (bp, count) in self.backup_history.iter_mut().zip(counts) {
            bp.ref_count = count;
        }
    }

    fn rebuild_path_table(&mut self) {
        let mut table = FxHashMap::default();
        for id in self.reachable_ids() {
            table.insert(self.nodes[id as usize].path.clone(), id);
        }
        self.path_table = table;
    }

    /// Allocates a brand-new node and returns its id. Callers are
    /// responsible for attaching it to a parent's `children` (or to
    /// `roots`) - this deliberately does *not* touch `path_table`, which
    /// only indexes nodes present at load time.
    pub fn alloc_node(&mut self, path: Vec<u8>, policy: Policy) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(PathNode {
            path,
            policy,
            history: Vec::new(),
            children: None,
            hint: Hint::default(),
        });
        id
    }

    /// Unlinks `id` from `roots`/its parent's `children` and from
    /// `path_table`. The node itself stays in the `nodes` arena as an
    /// orphaned, unreachable slot - nothing ever scans `nodes` directly, so
    /// this needs no compaction. Ref counts and `total_path_count` are
    /// derived data, recomputed wholesale by [`MetadataRoot::canonicalize`],
    /// so detaching doesn't touch them.
    pub fn detach(&mut self, id: NodeId) {
        self.roots.retain(|&r| r != id);
        for node in &mut self.nodes {
            if let Some(children) = &mut node.children {
                children.retain(|&c| c != id);
            }
        }
        self.path_table.retain(|_, v| *v != id);
    }
}

fn last_component(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

fn validate_name(name: &[u8]) -> Result<()> {
    ensure!(!name.is_empty(), "filename with length zero");
    ensure!(!name.contains(&0u8), "filename with null-bytes");
    ensure!(!name.contains(&b'/'), "invalid filename");
    ensure!(name != b".", "invalid filename");
    ensure!(name != b"..", "invalid filename");
    Ok(())
}

fn parse_path_list(
    cur: &mut Cursor,
    parent_path: &[u8],
    backup_history_len: usize,
    nodes: &mut Vec<PathNode>,
) -> Result<Vec<NodeId>> {
    let count = cur.varuint()?;
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = cur.bytes()?;
        validate_name(name)?;

        let parent = crate::path::PathRepr::borrowed(parent_path);
        let child = crate::path::PathRepr::borrowed(name);
        let path = crate::path::join(&parent, &child).as_bytes().to_vec();

        let policy = Policy::from_u8(cur.u8()?)?;

        let history_len = cur.varuint()?;
        ensure!(history_len > 0, "path node with empty history");
        let mut history = Vec::with_capacity(history_len as usize);
        let mut prev: Option<u64> = None;
        for _ in 0..history_len {
            let backup_id = cur.varuint()?;
            ensure!(
                (backup_id as usize) < backup_history_len,
                "backup id is out of range"
            );
            if let Some(prev_id) = prev {
                ensure!(
                    backup_id > prev_id,
                    "history entries are not strictly increasing"
                );
            }
            prev = Some(backup_id);
            let state = parse_state(cur)?;
            history.push(HistoryEntry {
                backup_point: backup_id as u32,
                state,
            });
        }

        let id = nodes.len() as NodeId;
        nodes.push(PathNode {
            path: path.clone(),
            policy,
            history,
            children: None,
            hint: Hint::default(),
        });

        let children = parse_path_list(cur, &path, backup_history_len, nodes)?;
        nodes[id as usize].children = if children.is_empty() {
            None
        } else {
            Some(children)
        };

        ids.push(id);
    }
    Ok(ids)
}

fn parse_state(cur: &mut Cursor) -> Result<PathState> {
    let tag = cur.u8()?;
    Ok(match tag {
        0 => PathState::NonExisting,
        1 => {
            let uid = cur.varuint()?;
            let gid = cur.varuint()?;
            let mtime = cur.i64()?;
            let mode = cur.u16()?;
            let size = cur.varuint()?;
            let (hash, slot) = parse_hash_and_slot(cur, size)?;
            PathState::Regular {
                uid,
                gid,
                mtime,
                mode,
                size,
                hash,
                slot,
            }
        }
        2 => {
            let uid = cur.varuint()?;
            let gid = cur.varuint()?;
            let mtime = cur.i64()?;
            let target = cur.bytes()?.to_vec();
            PathState::Symlink {
                uid,
                gid,
                mtime,
                target,
            }
        }
        3 => {
            let uid = cur.varuint()?;
            let gid = cur.varuint()?;
            let mtime = cur.i64()?;
            let mode = cur.u16()?;
            PathState::Directory {
                uid,
                gid,
                mtime,
                mode,
            }
        }
        _ => bail!("invalid path state type"),
    })
}

fn parse_hash_and_slot(cur: &mut Cursor, size: u64) -> Result<(Hash20, u8)> {
    if size > 20 {
        let bytes = cur.fixed_bytes(20)?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(bytes);
        let slot = cur.u8()?;
        Ok((Hash20(arr), slot))
    } else {
        let bytes = cur.fixed_bytes(size as usize)?;
        Ok((Hash20::inline(bytes), 0))
    }
}

fn write_hash_and_slot(out: &mut Vec<u8>, hash: &Hash20, size: u64, slot: u8) {
    if size > 20 {
        out.extend_from_slice(hash.as_bytes());
        out.push(slot);
    } else {
        out.extend_from_slice(&hash.as_bytes()[..size as usize]);
    }
}

fn encode_state(out: &mut Vec<u8>, state: &PathState) {
    match state {
        PathState::NonExisting => out.push(0),
        PathState::Regular {
            uid,
            gid,
            mtime,
            mode,
            size,
            hash,
            slot,
        } => {
            out.push(1);
            write_varuint(out, *uid);
            write_varuint(out, *gid);
            write_i64(out, *mtime);
            write_u16(out, *mode);
            write_varuint(out, *size);
            write_hash_and_slot(out, hash, *size, *slot);
        }
        PathState::Symlink {
            uid,
            gid,
            mtime,
            target,
        } => {
            out.push(2);
            write_varuint(out, *uid);
            write_varuint(out, *gid);
            write_i64(out, *mtime);
            write_bytes(out, target);
        }
        PathState::Directory {
            uid,
            gid,
            mtime,
            mode,
        } => {
            out.push(3);
            write_varuint(out, *uid);
            write_varuint(out, *gid);
            write_i64(out, *mtime);
            write_u16(out, *mode);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaf(path: &str, backup_point: u32, state: PathState) -> PathNode {
        PathNode {
            path: path.as_bytes().to_vec(),
            policy: Policy::Track,
            history: vec![HistoryEntry { backup_point, state }],
            children: None,
            hint: Hint::default(),
        }
    }

    #[test]
    fn empty_tree_round_trips() {
        let root = MetadataRoot::empty();
        let bytes = root.encode();
        let decoded = MetadataRoot::parse(&bytes).unwrap();
        assert_eq!(decoded.total_path_count, 0);
        assert!(decoded.roots.is_empty());
    }

    #[test]
    fn single_path_round_trips() {
        let mut root = MetadataRoot::empty();
        root.backup_history.push(BackupPoint {
            timestamp: 1_700_000_000,
            ref_count: 1,
        });
        let id = root.nodes.len() as NodeId;
        root.nodes.push(leaf(
            "/a",
            0,
            PathState::Regular {
                uid: 1000,
                gid: 1000,
                mtime: 123,
                mode: 0o644,
                size: 5,
                hash: Hash20::inline(b"hello"),
                slot: 0,
            },
        ));
        root.roots.push(id);
        root.total_path_count = 1;
        root.rebuild_ref_counts();

        let bytes = root.encode();
        let decoded = MetadataRoot::parse(&bytes).unwrap();
        assert_eq!(decoded.total_path_count, 1);
        assert_eq!(decoded.nodes[0].path, b"/a");
        assert_eq!(decoded.backup_history[0].ref_count, 1);
    }

    #[test]
    fn truncated_file_reports_expected_got() {
        let err = MetadataRoot::parse(&[1]).unwrap_err();
        assert_eq!(err.to_string(), "expected 1 bytes, got 0");
    }

    #[test]
    fn out_of_range_backup_id_rejected() {
        // backup_history_length = 0, then a config-history entry claiming id 0.
        let mut buf = Vec::new();
        write_varuint(&mut buf, 0); // backup_history_length
        write_varuint(&mut buf, 1); // config_history_length
        write_varuint(&mut buf, 0); // backup_id
        write_varuint(&mut buf, 0); // size
        let err = MetadataRoot::parse(&buf).unwrap_err();
        assert_eq!(err.to_string(), "backup id is out of range");
    }

    #[test]
    fn blank_name_rejected() {
        let mut buf = Vec::new();
        write_varuint(&mut buf, 0); // backup_history_length
        write_varuint(&mut buf, 0); // config_history_length
        write_varuint(&mut buf, 1); // total_path_count
        write_varuint(&mut buf, 1); // top-level PathList count
        write_bytes(&mut buf, b""); // name_length = 0
        let err = MetadataRoot::parse(&buf).unwrap_err();
        assert_eq!(err.to_string(), "filename with length zero");
    }

    #[test]
    fn canonicalize_drops_dead_backup_points_and_renumbers() {
        let mut root = MetadataRoot::empty();
        root.backup_history.push(BackupPoint { timestamp: 10, ref_count: 0 });
        root.backup_history.push(BackupPoint { timestamp: 20, ref_count: 0 });
        let id = root.nodes.len() as NodeId;
        root.nodes.push(leaf("/a", 1, PathState::NonExisting));
        root.roots.push(id);
        root.total_path_count = 1;

        root.canonicalize(None);

        assert_eq!(root.backup_history.len(), 1);
        assert_eq!(root.backup_history[0].timestamp, 20);
        assert_eq!(root.nodes[0].history[0].backup_point, 0);
    }

    #[test]
    fn canonicalize_prepends_current_backup_when_referenced() {
        let mut root = MetadataRoot::empty();
        let id = root.nodes.len() as NodeId;
        root.nodes.push(leaf(
            "/a",
            MetadataRoot::CURRENT_BACKUP,
            PathState::NonExisting,
        ));
        root.roots.push(id);
        root.total_path_count = 1;

        root.canonicalize(Some(42));

        assert_eq!(root.backup_history.len(), 1);
        assert_eq!(root.backup_history[0].timestamp, 42);
        assert_eq!(root.nodes[0].history[0].backup_point, 0);
    }
}
