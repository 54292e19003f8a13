//! Human-readable summary of a finished backup: counts, bytes stored, and a
//! per-path list of what changed. Grounded on backpak's progress-line
//! printing (`ui/backup.rs`, `progress.rs`) for the "pretty sizes + colored
//! verbs to a terminal" idiom, generalized from backpak's live progress
//! counters to a one-shot end-of-run report, since the engine here runs as
//! a single synchronous pass with no background progress thread.

use byte_unit::{Byte, UnitType};
use console::style;

use crate::engine::BackupStats;
use crate::metadata::{ChangeClass, MetadataRoot};

/// Prints the change report to stderr: one line per path that changed,
/// suppressing parent directories whose only change was an mtime bump a
/// child already explains, then a summary line. `color` overrides
/// `console`'s own terminal detection when set (from `~/.config/nb.toml`).
pub fn print(metadata: &MetadataRoot, stats: &BackupStats, color: Option<bool>) {
    if let Some(enabled) = color {
        console::set_colors_enabled_stderr(enabled);
    }

    metadata.for_each_node(|node| {
        let line = match node.hint.class {
            ChangeClass::Added => Some(style("+").green()),
            ChangeClass::Removed => Some(style("-").red()),
            ChangeClass::NotPartOfRepository => Some(style("x").red()),
            ChangeClass::Unchanged
                if node.hint.transition.is_some() || node.hint.content_changed =>
            {
                Some(style("M").yellow())
            }
            ChangeClass::Unchanged
                if node.hint.owner_changed
                    || node.hint.permissions_changed
                    || node.hint.mtime_changed =>
            {
                if stats.suppressed_parents.contains(&node.path) {
                    None
                } else {
                    Some(style("m").dim())
                }
            }
            _ => None,
        };

        if let Some(marker) = line {
            eprintln!("{marker} {}", String::from_utf8_lossy(&node.path));
        }
    });

    let size = Byte::from_u64(stats.bytes_stored).get_appropriate_unit(UnitType::Binary);
    eprintln!(
        "{} added, {} removed, {} changed, {} unchanged ({size:.2} stored)",
        stats.added, stats.removed, stats.changed, stats.unchanged,
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::{finish, initiate};
    use crate::search::SearchTree;
    use crate::blob::BlobStore;
    use camino::Utf8Path;

    #[test]
    fn prints_without_panicking_on_a_mixed_backup() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(root.join("a.txt"), b"hello, world").unwrap();

        let config = format!("[copy]\n{root}/a.txt\n");
        let tree = SearchTree::parse(&config).unwrap();
        let blobs = BlobStore::open(root);
        let mut metadata = MetadataRoot::empty();

        initiate(&mut metadata, &tree, Utf8Path::new("/")).unwrap();
        let stats = finish(&mut metadata, &blobs).unwrap();
        print(&metadata, &stats, Some(false));
    }
}
