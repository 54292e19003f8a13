//! Reconstructs files, symlinks, and directories from a backup point.
//!
//! Grounded on backpak's `ui/restore.rs` for the overall "walk the recorded
//! tree, recreate each entry" shape, generalized from backpak's chunked
//! pack reads to a direct `BlobStore::read`/inline-bytes lookup.

use std::os::unix::fs::{PermissionsExt, fchown};

use anyhow::{Context, Result};
use camino::Utf8Path;
use rustix::fd::AsFd;

use crate::blob::{BlobStore, INLINE_THRESHOLD};
use crate::metadata::{BackupPointId, MetadataRoot, PathState};

/// Restores every path whose most recent state at-or-before `backup_id` is
/// live (not `NonExisting`), optionally limited to paths under `prefix`,
/// writing them out under `destination`.
pub fn restore(
    metadata: &MetadataRoot,
    blobs: &BlobStore,
    backup_id: BackupPointId,
    prefix: Option<&Utf8Path>,
    destination: &Utf8Path,
) -> Result<u64> {
    let mut restored = 0u64;
    let mut failure = None;

    metadata.for_each_node(|node| {
        if failure.is_some() {
            return;
        }
        let path_str = String::from_utf8_lossy(&node.path);
        let path = Utf8Path::new(path_str.as_ref());
        if let Some(prefix) = prefix {
            if path != prefix && !prefix.as_str().is_empty() && !path.starts_with(prefix) {
                return;
            }
        }

        // `backup_point` ids count backwards from the most recent backup
        // (0), so the state as of `backup_id` is the newest entry no more
        // recent than it - the first one (history is newest-first) whose
        // id is at least `backup_id`.
        let Some(entry) = node.history.iter().find(|h| h.backup_point >= backup_id) else {
            return;
        };

        if matches!(entry.state, PathState::NonExisting) {
            return;
        }

        let relative = path.strip_prefix("/").unwrap_or(path);
        let out_path = destination.join(relative);

        if let Err(e) = restore_one(blobs, &entry.state, &out_path) {
            failure = Some(e);
            return;
        }
        restored += 1;
    });

    if let Some(e) = failure {
        return Err(e);
    }
    Ok(restored)
}

fn restore_one(blobs: &BlobStore, state: &PathState, out_path: &Utf8Path) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Couldn't create {parent}"))?;
    }

    match state {
        PathState::Regular {
            uid,
            gid,
            mtime,
            mode,
            size,
            hash,
            slot,
        } => {
            let body = if *size <= INLINE_THRESHOLD {
                hash.as_bytes()[..*size as usize].to_vec()
            } else {
                blobs.read(&crate::blob::BlobAddress {
                    hash: *hash,
                    size: *size,
                    slot: *slot,
                })?
            };
            std::fs::write(out_path, &body)
                .with_context(|| format!("Couldn't write {out_path}"))?;
            apply_attrs(out_path, *uid, *gid, *mtime, Some(*mode))?;
        }
        PathState::Symlink { uid, gid, mtime, target } => {
            let target_path = std::path::Path::new(std::str::from_utf8(target)?);
            if out_path.as_std_path().symlink_metadata().is_ok() {
                std::fs::remove_file(out_path)?;
            }
            std::os::unix::fs::symlink(target_path, out_path)
                .with_context(|| format!("Couldn't create symlink {out_path}"))?;
            apply_symlink_attrs(out_path, *uid, *gid, *mtime)?;
        }
        PathState::Directory { uid, gid, mtime, mode } => {
            std::fs::create_dir_all(out_path)
                .with_context(|| format!("Couldn't create {out_path}"))?;
            apply_attrs(out_path, *uid, *gid, *mtime, Some(*mode))?;
        }
        PathState::NonExisting => unreachable!("filtered by caller"),
    }
    Ok(())
}

fn apply_attrs(path: &Utf8Path, uid: u64, gid: u64, mtime: i64, mode: Option<u16>) -> Result<()> {
    let file = std::fs::File::open(path).with_context(|| format!("Couldn't open {path}"))?;
    fchown(file.as_fd(), Some(uid as u32), Some(gid as u32))
        .with_context(|| format!("Couldn't chown {path}"))?;
    if let Some(mode) = mode {
        let perms = std::fs::Permissions::from_mode(mode as u32);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("Couldn't chmod {path}"))?;
    }
    let times = jiff::Timestamp::from_second(mtime)
        .map_err(|e| anyhow::anyhow!("{mtime} isn't a valid timestamp: {e}"))?;
    let system_time: std::time::SystemTime = times.into();
    file.set_modified(system_time)
        .with_context(|| format!("Couldn't set mtime of {path}"))?;
    Ok(())
}

/// Symlinks can't be `chmod`/`set_modified` through a regular file handle;
/// ownership is the only attribute restorable without dereferencing.
fn apply_symlink_attrs(path: &Utf8Path, uid: u64, gid: u64, _mtime: i64) -> Result<()> {
    rustix::fs::chownat(
        rustix::fs::CWD,
        path.as_std_path(),
        Some(
            rustix::fs::Uid::from_raw(uid as u32),
        ),
        Some(rustix::fs::Gid::from_raw(gid as u32)),
        rustix::fs::AtFlags::SYMLINK_NOFOLLOW,
    )
    .map_err(|e| anyhow::anyhow!("Couldn't chown symlink {path}: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::{finish, initiate};
    use crate::search::SearchTree;

    #[test]
    fn restores_a_single_file() {
        let src = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(src.path()).unwrap();
        let file = root.join("a.txt");
        std::fs::write(&file, b"hello, world").unwrap();

        let config = format!("[copy]\n{file}\n");
        let tree = SearchTree::parse(&config).unwrap();
        let blobs = BlobStore::open(root);
        let mut metadata = MetadataRoot::empty();
        initiate(&mut metadata, &tree, Utf8Path::new("/")).unwrap();
        finish(&mut metadata, &blobs).unwrap();
        metadata.canonicalize(Some(0));

        let dest = tempfile::tempdir().unwrap();
        let dest_path = Utf8Path::from_path(dest.path()).unwrap();
        let count = restore(&metadata, &blobs, 0, None, dest_path).unwrap();
        assert_eq!(count, 1);

        let restored = dest_path.join(file.strip_prefix("/").unwrap());
        assert_eq!(std::fs::read(restored).unwrap(), b"hello, world");
    }
}
