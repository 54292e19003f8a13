//! Content-addressed storage of file bodies.
//!
//! Grounded on backpak's `backend::fs::FilesystemBackend` for the basic
//! shape of a repository-relative store (bucketed subdirectories, atomic
//! writes via a temp file + rename), generalized from backpak's pack-file
//! model to one-blob-per-file addressed by `(hash, size, slot)`.

use std::fs::File;
use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::hashing::{Hash20, HashingReader};
use crate::metadata::{MetadataRoot, PathState};

/// Files this small or smaller are inlined into the metadata instead of
/// being stored as blobs.
pub const INLINE_THRESHOLD: u64 = 20;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

pub struct BlobStore {
    root: Utf8PathBuf,
}

/// The address a regular file's body is stored (or would be stored) under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobAddress {
    pub hash: Hash20,
    pub size: u64,
    pub slot: u8,
}

impl BlobAddress {
    /// `<repo>/<hex[0]>/<hex[1..3]>/<hex[3..40]>x<size>x<slot>`.
    pub fn relative_path(&self) -> Utf8PathBuf {
        let hex = self.hash.hex();
        Utf8PathBuf::from(format!(
            "{}/{}/{}x{}x{}",
            &hex[0..1],
            &hex[1..3],
            &hex[3..40],
            self.size,
            self.slot
        ))
    }
}

impl BlobStore {
    pub fn open(root: &Utf8Path) -> Self {
        BlobStore {
            root: root.to_owned(),
        }
    }

    fn full_path(&self, address: &BlobAddress) -> Utf8PathBuf {
        self.root.join(address.relative_path())
    }

    /// Stores `body`, deduplicating by `(hash, size)` and resolving hash
    /// collisions by trying successive `slot`s. Returns the final address.
    /// A no-op (beyond the byte-compare) if an identical blob is already
    /// present.
    pub fn store(&self, hash: Hash20, body: &[u8]) -> Result<BlobAddress> {
        let size = body.len() as u64;
        debug_assert!(size > INLINE_THRESHOLD, "small bodies are inlined, not stored");

        let mut slot: u8 = 0;
        loop {
            let address = BlobAddress { hash, size, slot };
            let path = self.full_path(&address);
            match std::fs::read(&path) {
                Ok(existing) => {
                    if existing == body {
                        return Ok(address);
                    }
                    slot = slot
                        .checked_add(1)
                        .context("too many hash collisions for one (hash, size) pair")?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.write_atomically(&path, body)?;
                    return Ok(address);
                }
                Err(e) => return Err(e).with_context(|| format!("Couldn't read {path}")),
            }
        }
    }

    fn write_atomically(&self, dest: &Utf8Path, body: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Couldn't create {parent}"))?;
        }

        let tmp_path = self.root.join("tmp-file");
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("Couldn't create {tmp_path}"))?;
        tmp.write_all(body)
            .with_context(|| format!("Couldn't write {tmp_path}"))?;
        tmp.sync_all()
            .with_context(|| format!("Couldn't sync {tmp_path}"))?;
        drop(tmp);

        std::fs::rename(&tmp_path, dest)
            .with_context(|| format!("Couldn't rename {tmp_path} to {dest}"))?;

        let parent_dir = dest.parent().unwrap_or(&self.root);
        File::open(parent_dir)
            .and_then(|d| d.sync_all())
            .with_context(|| format!("Couldn't sync {parent_dir}"))?;
        Ok(())
    }

    /// Streams `reader`'s contents while hashing, so callers don't need to
    /// buffer a whole file to learn its hash before deciding whether (and
    /// where) to store it. Mirrors backpak's `HashingReader` usage when
    /// copying file bodies into a pack. Returns `(hash, size, slot)`; `slot`
    /// is `None` for inlined (`size <= 20`) bodies.
    pub fn hash_and_store(&self, mut reader: impl Read) -> Result<(Hash20, u64, Option<u8>)> {
        let mut hashing = HashingReader::new(&mut reader);
        let mut buf = Vec::new();
        hashing.read_to_end(&mut buf)?;
        let (hash, _) = hashing.finalize();
        let size = buf.len() as u64;
        if size <= INLINE_THRESHOLD {
            Ok((Hash20::inline(&buf), size, None))
        } else {
            let address = self.store(hash, &buf)?;
            Ok((hash, size, Some(address.slot)))
        }
    }

    pub fn read(&self, address: &BlobAddress) -> Result<Vec<u8>> {
        let path = self.full_path(address);
        std::fs::read(&path).with_context(|| format!("Couldn't read {path}"))
    }

    /// For every regular state with `size > 20`, verify the blob exists, is
    /// a regular file, and hashes back to the recorded hash and size.
    /// Returns the absolute paths of nodes with at least one failing state,
    /// each reported at most once.
    pub fn check_integrity(&self, metadata: &MetadataRoot) -> Vec<Utf8PathBuf> {
        let mut failed = Vec::new();
        metadata.for_each_node(|node| {
            let mut ok = true;
            for entry in &node.history {
                if let PathState::Regular {
                    size, hash, slot, ..
                } = &entry.state
                {
                    if *size > INLINE_THRESHOLD && !self.blob_is_intact(*hash, *size, *slot) {
                        ok = false;
                    }
                }
            }
            if !ok {
                failed.push(Utf8PathBuf::from(String::from_utf8_lossy(&node.path).into_owned()));
            }
        });
        failed
    }

    fn blob_is_intact(&self, hash: Hash20, size: u64, slot: u8) -> bool {
        let address = BlobAddress { hash, size, slot };
        let path = self.full_path(&address);
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            return false;
        };
        if !meta.is_file() || meta.len() != size {
            return false;
        }
        let Ok(body) = std::fs::read(&path) else {
            return false;
        };
        Hash20::sha1(&body) == hash
    }

    /// Removes every stored blob not referenced by any live history state
    /// (including config history). Returns `(files_removed, bytes_removed)`.
    pub fn collect_garbage(&self, metadata: &MetadataRoot) -> Result<(u64, u64)> {
        let mut live = std::collections::HashSet::new();
        for c in &metadata.config_history {
            if c.size > INLINE_THRESHOLD {
                live.insert(BlobAddress {
                    hash: c.hash,
                    size: c.size,
                    slot: c.slot,
                });
            }
        }
        metadata.for_each_node(|node| {
            for entry in &node.history {
                if let PathState::Regular {
                    size, hash, slot, ..
                } = &entry.state
                {
                    if *size > INLINE_THRESHOLD {
                        live.insert(BlobAddress {
                            hash: *hash,
                            size: *size,
                            slot: *slot,
                        });
                    }
                }
            }
        });

        let mut removed_count = 0u64;
        let mut removed_bytes = 0u64;
        for &first in HEX_DIGITS {
            let first_dir = self.root.join((first as char).to_string());
            if !first_dir.exists() {
                continue;
            }
            for entry in walk_files(&first_dir)? {
                let relative = entry.strip_prefix(&self.root).unwrap_or(&entry).to_owned();
                if relative.as_str() == "tmp-file" {
                    continue;
                }
                if let Some(address) = parse_address(relative.as_str()) {
                    if live.contains(&address) {
                        continue;
                    }
                }
                let len = std::fs::metadata(&entry).map(|m| m.len()).unwrap_or(0);
                if std::fs::remove_file(&entry).is_ok() {
                    removed_count += 1;
                    removed_bytes += len;
                }
            }
        }
        Ok((removed_count, removed_bytes))
    }
}

fn walk_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_owned()];
    while let Some(d) = stack.pop() {
        for entry in std::fs::read_dir(&d).with_context(|| format!("Couldn't read {d}"))? {
            let entry = entry?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|p| anyhow::anyhow!("{} isn't valid UTF-8", p.display()))?;
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}

/// Parses `<hex0>/<hex1hex2>/<hex3..40>x<size>x<slot>` back into a
/// `BlobAddress`.
fn parse_address(relative: &str) -> Option<BlobAddress> {
    let mut parts = relative.splitn(3, '/');
    let first = parts.next()?;
    let second = parts.next()?;
    let rest = parts.next()?;

    let mut xs = rest.rsplitn(3, 'x');
    let slot: u8 = xs.next()?.parse().ok()?;
    let size: u64 = xs.next()?.parse().ok()?;
    let hex_tail = xs.next()?;

    let full_hex = format!("{first}{second}{hex_tail}");
    let hash: Hash20 = full_hex.parse().ok()?;
    Some(BlobAddress { hash, size, slot })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_round_trips_through_relative_path() {
        let address = BlobAddress {
            hash: Hash20::sha1(b"Developers, developers, developers!"),
            size: 42,
            slot: 3,
        };
        let relative = address.relative_path();
        assert_eq!(parse_address(relative.as_str()), Some(address));
    }

    #[test]
    fn store_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let store = BlobStore::open(root);

        let body = b"x".repeat(21);
        let hash = Hash20::sha1(&body);
        let address = store.store(hash, &body).unwrap();
        assert_eq!(address.slot, 0);
        assert_eq!(store.read(&address).unwrap(), body);
    }

    #[test]
    fn colliding_hash_bumps_slot() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let store = BlobStore::open(root);

        // Simulate a collision: same (hash, size), different bytes.
        let shared_hash = Hash20::sha1(b"whichever body produced this hash");
        let body_a = b"a".repeat(25);
        let body_b = b"b".repeat(25);

        let addr_a = store.store(shared_hash, &body_a).unwrap();
        let addr_b = store.store(shared_hash, &body_b).unwrap();

        assert_eq!(addr_a.slot, 0);
        assert_eq!(addr_b.slot, 1);
        assert_eq!(store.read(&addr_a).unwrap(), body_a);
        assert_eq!(store.read(&addr_b).unwrap(), body_b);
    }

    #[test]
    fn storing_identical_body_twice_reuses_slot() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let store = BlobStore::open(root);

        let body = b"same body".repeat(4);
        let hash = Hash20::sha1(&body);
        let first = store.store(hash, &body).unwrap();
        let second = store.store(hash, &body).unwrap();
        assert_eq!(first, second);
    }
}
