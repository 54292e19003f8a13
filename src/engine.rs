//! Change detection and the two-phase backup protocol.
//!
//! Grounded on backpak's `backup.rs` for the overall shape of "walk, then
//! commit" machinery, generalized from backpak's threaded chunk/tree/upload
//! pipeline to a single-threaded, synchronous model: one `initiate` pass
//! annotates the tree with hints, one `finish` pass commits them.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::blob::{BlobStore, INLINE_THRESHOLD};
use crate::metadata::{
    ChangeClass, ConfigHistoryEntry, Hint, HistoryEntry, MetadataRoot, NodeId, PathState, Policy,
    TypeTransition,
};
use crate::search::{Event, SearchResult, SearchResultType, SearchTree};

/// Snapshots the backup-selection document itself into `config_history`,
/// the same way a path's body is hashed and (if large enough) stored as a
/// blob. Every backup appends one entry, bound to the current backup point
/// until [`MetadataRoot::canonicalize`] assigns it a real id.
pub fn record_config(metadata: &mut MetadataRoot, blobs: &BlobStore, document: &[u8]) -> Result<()> {
    let size = document.len() as u64;
    let (hash, slot) = if size <= INLINE_THRESHOLD {
        (crate::hashing::Hash20::inline(document), 0)
    } else {
        let address = blobs.store(crate::hashing::Hash20::sha1(document), document)?;
        (address.hash, address.slot)
    };
    metadata.config_history.push(ConfigHistoryEntry {
        backup_point: MetadataRoot::CURRENT_BACKUP,
        size,
        hash,
        slot,
    });
    Ok(())
}

/// Representing the change class as an enum makes most of its exclusivity
/// a property of the type; this setter is what `engine` owns on top, per
/// the doc comment on [`crate::metadata::Hint`].
impl Hint {
    fn set_class(&mut self, class: ChangeClass) {
        self.class = class;
    }
}

/// Aggregate statistics accumulated while walking the annotated tree in
/// [`finish`]. The change report (`report.rs`) renders these.
#[derive(Debug, Default, Clone)]
pub struct BackupStats {
    pub added: u64,
    pub removed: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub bytes_stored: u64,
    /// Paths whose mtime-only change is suppressed because a child already
    /// explains it.
    pub suppressed_parents: FxHashSet<Vec<u8>>,
}

/// Walks the search results, annotating each visited node's `hint` and
/// allocating nodes for paths seen for the first time. Nodes present in
/// `metadata` but absent from `events` are annotated as removed or
/// `not_part_of_repository` depending on their stored policy.
pub fn initiate(metadata: &mut MetadataRoot, tree: &SearchTree, root: &Utf8Path) -> Result<()> {
    let events = tree.traverse(root)?;
    let mut seen: FxHashSet<NodeId> = FxHashSet::default();
    // Nodes allocated during this traversal, keyed by path: `path_table`
    // only indexes nodes present at load time, but `traverse` yields
    // parents before children, so a child's parent is always either
    // already in `path_table` or already in here by the time we see it.
    let mut created: FxHashMap<Vec<u8>, NodeId> = FxHashMap::default();

    for event in &events {
        let Event::Entry(result) = event else {
            continue;
        };
        let id = visit_result(metadata, result, &mut created);
        seen.insert(id);
    }

    for id in metadata.reachable_ids() {
        if !seen.contains(&id) {
            mark_absent(metadata, id);
        }
    }

    Ok(())
}

/// Attaches a freshly allocated node to its parent's `children`, or to
/// `roots` if it's top-level. The parent must already exist, either from
/// a previous backup (`path_table`) or earlier in this same traversal
/// (`created`).
fn attach(metadata: &mut MetadataRoot, created: &FxHashMap<Vec<u8>, NodeId>, path: &[u8], id: NodeId) {
    let parent_path = parent_of(path);
    let is_top_level = matches!(parent_path.as_deref(), None | Some(b"/"));
    if is_top_level {
        metadata.roots.push(id);
        return;
    }
    let parent_path = parent_path.unwrap();
    let parent_id = metadata
        .path_table
        .get(&parent_path)
        .or_else(|| created.get(&parent_path))
        .copied()
        .expect("parent path visited before its child");
    metadata.nodes[parent_id as usize]
        .children
        .get_or_insert_with(Vec::new)
        .push(id);
}

fn visit_result(
    metadata: &mut MetadataRoot,
    result: &SearchResult,
    created: &mut FxHashMap<Vec<u8>, NodeId>,
) -> NodeId {
    let path_bytes = result.path.as_str().as_bytes().to_vec();

    let id = match metadata.path_table.get(&path_bytes).copied() {
        Some(id) => id,
        None => {
            let id = metadata.alloc_node(path_bytes.clone(), result.effective_policy);
            attach(metadata, created, &path_bytes, id);
            created.insert(path_bytes, id);
            metadata.nodes[id as usize].hint.set_class(ChangeClass::Added);
            return id;
        }
    };

    let (policy_changed, loses_history_flag) = {
        let node = &mut metadata.nodes[id as usize];
        if node.policy == result.effective_policy {
            (false, false)
        } else {
            let loses = loses_history(node.policy, result.effective_policy);
            node.policy = result.effective_policy;
            (true, loses)
        }
    };

    let head = metadata.nodes[id as usize].history.first().cloned();

    let node = &mut metadata.nodes[id as usize];
    node.hint.policy_changed = policy_changed;
    node.hint.loses_history = loses_history_flag;

    let Some(head) = head else {
        node.hint.set_class(ChangeClass::Added);
        return id;
    };

    match (&head.state, result.kind) {
        (PathState::NonExisting, _) => {
            node.hint.set_class(ChangeClass::Added);
        }
        (
            PathState::Regular {
                uid,
                gid,
                mtime,
                mode,
                size,
                ..
            },
            SearchResultType::File,
        ) => {
            if *uid != result.stat.uid || *gid != result.stat.gid {
                node.hint.owner_changed = true;
            }
            if *mode != result.stat.mode {
                node.hint.permissions_changed = true;
            }
            if *mtime != result.stat.mtime {
                node.hint.mtime_changed = true;
            }
            // Only size and mtime stand in for content change here. Also
            // hashing same-size, same-mtime files to catch a body that
            // changed without touching either would mean hashing every
            // unchanged file on every backup - exactly what the
            // hash-avoidance rule below exists to avoid. A write that
            // preserves both size and mtime goes undetected.
            if *size != result.stat.size || node.hint.mtime_changed {
                node.hint.content_changed = true;
            }
            node.hint.set_class(ChangeClass::Unchanged);
        }
        (PathState::Symlink { uid, gid, mtime, target }, SearchResultType::Symlink) => {
            if *uid != result.stat.uid || *gid != result.stat.gid {
                node.hint.owner_changed = true;
            }
            if *mtime != result.stat.mtime {
                node.hint.mtime_changed = true;
            }
            if result.stat.target.as_deref() != Some(target.as_slice()) {
                node.hint.content_changed = true;
            }
            node.hint.set_class(ChangeClass::Unchanged);
        }
        (PathState::Directory { uid, gid, mtime, mode }, SearchResultType::Directory) => {
            if *uid != result.stat.uid || *gid != result.stat.gid {
                node.hint.owner_changed = true;
            }
            if *mode != result.stat.mode {
                node.hint.permissions_changed = true;
            }
            if *mtime != result.stat.mtime {
                node.hint.mtime_changed = true;
            }
            node.hint.set_class(ChangeClass::Unchanged);
        }
        (old, new) => {
            node.hint.transition = Some(type_transition(old, new));
            node.hint.content_changed = true;
            node.hint.set_class(ChangeClass::Unchanged);
        }
    }

    id
}

fn loses_history(old: Policy, new: Policy) -> bool {
    matches!(old, Policy::Track) && matches!(new, Policy::Copy | Policy::Ignore | Policy::None)
}

fn type_transition(old: &PathState, new: SearchResultType) -> TypeTransition {
    use SearchResultType as R;
    match (old, new) {
        (PathState::Regular { .. }, R::Symlink) => TypeTransition::RegularToSymlink,
        (PathState::Regular { .. }, R::Directory) => TypeTransition::RegularToDirectory,
        (PathState::Symlink { .. }, R::File) => TypeTransition::SymlinkToRegular,
        (PathState::Symlink { .. }, R::Directory) => TypeTransition::SymlinkToDirectory,
        (PathState::Directory { .. }, R::File) => TypeTransition::DirectoryToRegular,
        (PathState::Directory { .. }, R::Symlink) => TypeTransition::DirectoryToSymlink,
        _ => unreachable!("NonExisting handled separately"),
    }
}

fn mark_absent(metadata: &mut MetadataRoot, id: NodeId) {
    let node = &mut metadata.nodes[id as usize];
    match node.policy {
        Policy::Mirror | Policy::None => node.hint.set_class(ChangeClass::NotPartOfRepository),
        Policy::Copy | Policy::Track | Policy::Ignore => node.hint.set_class(ChangeClass::Removed),
    }
}

/// Walks every annotated node, hashing/storing/prepending history as its
/// hint dictates. Must run after [`initiate`] and before the metadata file
/// is written.
pub fn finish(metadata: &mut MetadataRoot, blobs: &BlobStore) -> Result<BackupStats> {
    let mut stats = BackupStats::default();
    let mut to_detach = Vec::new();

    for id in metadata.reachable_ids() {
        let class = metadata.nodes[id as usize].hint.class;
        match class {
            ChangeClass::Added => {
                commit_fresh_state(metadata, blobs, id, &mut stats)?;
                stats.added += 1;
                mark_parent_affected(metadata, id, &mut stats);
            }
            ChangeClass::Removed => {
                metadata.nodes[id as usize].history.insert(
                    0,
                    HistoryEntry {
                        backup_point: MetadataRoot::CURRENT_BACKUP,
                        state: PathState::NonExisting,
                    },
                );
                stats.removed += 1;
                mark_parent_affected(metadata, id, &mut stats);
            }
            ChangeClass::NotPartOfRepository => {
                to_detach.push(id);
                mark_parent_affected(metadata, id, &mut stats);
            }
            ChangeClass::Unchanged => {
                let hint = metadata.nodes[id as usize].hint;
                if hint.transition.is_some() || hint.content_changed {
                    commit_fresh_state(metadata, blobs, id, &mut stats)?;
                    stats.changed += 1;
                    mark_parent_affected(metadata, id, &mut stats);
                } else if hint.owner_changed || hint.permissions_changed || hint.mtime_changed {
                    commit_metadata_only_change(metadata, id)?;
                    stats.changed += 1;
                } else {
                    stats.unchanged += 1;
                }
            }
            ChangeClass::None => {}
        }
    }

    for id in to_detach {
        metadata.detach(id);
    }

    Ok(stats)
}

fn mark_parent_affected(metadata: &MetadataRoot, id: NodeId, stats: &mut BackupStats) {
    let path = &metadata.nodes[id as usize].path;
    if let Some(parent) = parent_of(path) {
        stats.suppressed_parents.insert(parent);
    }
}

/// The directory containing `path`, or `None` if `path` is already the root.
fn parent_of(path: &[u8]) -> Option<Vec<u8>> {
    let trimmed = if path.len() > 1 && path.ends_with(b"/") {
        &path[..path.len() - 1]
    } else {
        path
    };
    let idx = trimmed.iter().rposition(|&b| b == b'/')?;
    Some(if idx == 0 { b"/".to_vec() } else { trimmed[..idx].to_vec() })
}

fn full_path_of(node_path: &[u8]) -> Utf8PathBuf {
    Utf8PathBuf::from(String::from_utf8_lossy(node_path).into_owned())
}

fn commit_fresh_state(
    metadata: &mut MetadataRoot,
    blobs: &BlobStore,
    id: NodeId,
    stats: &mut BackupStats,
) -> Result<()> {
    let full = full_path_of(&metadata.nodes[id as usize].path);
    let st = crate::stat::lstat(&full)?;

    let state = match st.kind {
        crate::stat::Kind::Regular => {
            let (hash, size, slot) = blobs.hash_and_store(std::fs::File::open(&full)?)?;
            if size > INLINE_THRESHOLD {
                stats.bytes_stored += size;
            }
            PathState::Regular {
                uid: st.uid,
                gid: st.gid,
                mtime: st.mtime,
                mode: st.mode,
                size,
                hash,
                slot: slot.unwrap_or(0),
            }
        }
        crate::stat::Kind::Symlink => PathState::Symlink {
            uid: st.uid,
            gid: st.gid,
            mtime: st.mtime,
            target: st.target.unwrap_or_default(),
        },
        crate::stat::Kind::Directory => PathState::Directory {
            uid: st.uid,
            gid: st.gid,
            mtime: st.mtime,
            mode: st.mode,
        },
        crate::stat::Kind::Other => {
            anyhow::bail!("{full}: not a regular file, symlink, or directory")
        }
    };

    metadata.nodes[id as usize].history.insert(
        0,
        HistoryEntry {
            backup_point: MetadataRoot::CURRENT_BACKUP,
            state,
        },
    );
    Ok(())
}

/// Metadata-only change (owner/permissions/mtime, no content change).
/// `Track` (and `Copy`/`Ignore`, which we treat the same way) prepends a
/// new state; `Mirror`/`None` mutate the head state in place.
fn commit_metadata_only_change(metadata: &mut MetadataRoot, id: NodeId) -> Result<()> {
    let full = full_path_of(&metadata.nodes[id as usize].path);
    let st = crate::stat::lstat(&full)?;

    let node = &mut metadata.nodes[id as usize];
    let policy = node.policy;

    let new_state = match &node.history[0].state {
        PathState::Regular { size, hash, slot, .. } => PathState::Regular {
            uid: st.uid,
            gid: st.gid,
            mtime: st.mtime,
            mode: st.mode,
            size: *size,
            hash: *hash,
            slot: *slot,
        },
        PathState::Symlink { target, .. } => PathState::Symlink {
            uid: st.uid,
            gid: st.gid,
            mtime: st.mtime,
            target: target.clone(),
        },
        PathState::Directory { .. } => PathState::Directory {
            uid: st.uid,
            gid: st.gid,
            mtime: st.mtime,
            mode: st.mode,
        },
        PathState::NonExisting => unreachable!("NonExisting heads don't take metadata updates"),
    };

    match policy {
        Policy::Mirror | Policy::None => {
            node.history[0].state = new_state;
        }
        Policy::Track | Policy::Copy | Policy::Ignore => {
            node.history.insert(
                0,
                HistoryEntry {
                    backup_point: MetadataRoot::CURRENT_BACKUP,
                    state: new_state,
                },
            );
        }
    }
    Ok(())
}
