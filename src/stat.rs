//! Filesystem syscall wrappers: a thin layer over `rustix::fs` so the rest
//! of the crate only ever sees the four kinds of path state the metadata
//! model knows about.

use anyhow::{Context, Result};
use camino::Utf8Path;
use rustix::fs::{AtFlags, FileType, Mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Regular,
    Symlink,
    Directory,
    /// Device nodes, FIFOs, sockets - out of scope.
    Other,
}

#[derive(Debug, Clone)]
pub struct Stat {
    pub kind: Kind,
    pub uid: u64,
    pub gid: u64,
    pub mtime: i64,
    /// Low 12 permission bits; filetype bits are encoded separately by the
    /// `kind` tag rather than packed into this field.
    pub mode: u16,
    pub size: u64,
    /// Populated only for `Kind::Symlink`.
    pub target: Option<Vec<u8>>,
}

/// `lstat`s `path` - never follows a trailing symlink, since the engine
/// needs to see symlinks as symlinks.
pub fn lstat(path: &Utf8Path) -> Result<Stat> {
    let raw = rustix::fs::statat(rustix::fs::CWD, path.as_std_path(), AtFlags::SYMLINK_NOFOLLOW)
        .with_context(|| format!("Couldn't stat {path}"))?;

    let file_type = FileType::from_raw_mode(raw.st_mode);
    let mode = Mode::from_raw_mode(raw.st_mode).bits() as u16 & 0o7777;

    let (kind, target) = match file_type {
        FileType::RegularFile => (Kind::Regular, None),
        FileType::Directory => (Kind::Directory, None),
        FileType::Symlink => {
            let target = std::fs::read_link(path)
                .with_context(|| format!("Couldn't read symlink target of {path}"))?;
            (Kind::Symlink, Some(path_to_bytes(&target)))
        }
        _ => (Kind::Other, None),
    };

    Ok(Stat {
        kind,
        uid: raw.st_uid as u64,
        gid: raw.st_gid as u64,
        mtime: raw.st_mtime as i64,
        mode,
        size: raw.st_size as u64,
        target,
    })
}

#[cfg(unix)]
fn path_to_bytes(p: &std::path::Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    p.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_to_bytes(p: &std::path::Path) -> Vec<u8> {
    p.to_string_lossy().into_owned().into_bytes()
}
