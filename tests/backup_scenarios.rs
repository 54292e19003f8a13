mod common;

use camino::Utf8Path;
use nb::blob::{BlobAddress, BlobStore};
use nb::hashing::Hash20;
use nb::metadata::{MetadataRoot, PathState, Policy};
use tempfile::tempdir;

use common::{cli, write_config};

#[test]
fn empty_start_creates_three_path_nodes_and_no_blobs() {
    let src = tempdir().unwrap();
    let repo = tempdir().unwrap();
    let repo_path = Utf8Path::from_path(repo.path()).unwrap();
    let files_dir = src.path().join("tmp").join("files");
    std::fs::create_dir_all(&files_dir).unwrap();
    std::fs::write(files_dir.join("a.txt"), b"hello").unwrap();

    cli().unwrap().arg("init").arg(repo.path()).assert().success();
    write_config(repo.path(), &format!("[copy]\n{}/\n", files_dir.display()));
    cli().unwrap().arg("backup").arg(repo.path()).assert().success();

    let metadata = MetadataRoot::load(repo_path).unwrap();
    assert_eq!(metadata.backup_history.len(), 1);
    assert_eq!(metadata.config_history.len(), 1);

    let mut paths = Vec::new();
    metadata.for_each_node(|n| paths.push(String::from_utf8_lossy(&n.path).into_owned()));
    assert!(paths.iter().any(|p| p.ends_with("tmp")));
    assert!(paths.iter().any(|p| p.ends_with("tmp/files")));
    assert!(paths.iter().any(|p| p.ends_with("tmp/files/a.txt")));

    assert!(BlobStore::open(repo_path).read(&BlobAddress {
        hash: Hash20::ZERO,
        size: 5,
        slot: 0,
    }).is_err());
}

#[test]
fn boundary_blob_is_stored_at_twenty_one_bytes() {
    let src = tempdir().unwrap();
    let repo = tempdir().unwrap();
    let repo_path = Utf8Path::from_path(repo.path()).unwrap();
    let file = src.path().join("a.txt");
    let body = vec![b'x'; 21];
    std::fs::write(&file, &body).unwrap();

    cli().unwrap().arg("init").arg(repo.path()).assert().success();
    write_config(repo.path(), &format!("[copy]\n{}\n", file.display()));
    cli().unwrap().arg("backup").arg(repo.path()).assert().success();

    let metadata = MetadataRoot::load(repo_path).unwrap();
    let mut found = false;
    metadata.for_each_node(|n| {
        if let Some(entry) = n.history.first() {
            if let PathState::Regular { size, hash, slot, .. } = &entry.state {
                if *size == 21 {
                    found = true;
                    assert_eq!(*hash, Hash20::sha1(&body));
                    let address = BlobAddress { hash: *hash, size: *size, slot: *slot };
                    assert!(BlobStore::open(repo_path).read(&address).is_ok());
                }
            }
        }
    });
    assert!(found, "no 21-byte regular state recorded");
}

#[test]
fn colliding_hash_gets_a_distinct_slot() {
    let repo = tempdir().unwrap();
    let repo_path = Utf8Path::from_path(repo.path()).unwrap();
    let blobs = BlobStore::open(repo_path);

    let shared_hash = Hash20::sha1(b"unrelated seed");
    let first = blobs.store(shared_hash, b"first body, twenty chars").unwrap();
    let second = blobs.store(shared_hash, b"second body, different!").unwrap();

    assert_eq!(first.slot, 0);
    assert_eq!(second.slot, 1);
    assert_ne!(blobs.read(&first).unwrap(), blobs.read(&second).unwrap());
}

#[test]
fn removal_under_mirror_detaches_the_node_and_gc_frees_its_blob() {
    let src = tempdir().unwrap();
    let repo = tempdir().unwrap();
    let repo_path = Utf8Path::from_path(repo.path()).unwrap();
    let file = src.path().join("a.txt");
    std::fs::write(&file, vec![b'x'; 30]).unwrap();

    cli().unwrap().arg("init").arg(repo.path()).assert().success();
    write_config(repo.path(), &format!("[mirror]\n{}\n", file.display()));
    cli().unwrap().arg("backup").arg(repo.path()).assert().success();
    let before = MetadataRoot::load(repo_path).unwrap();
    assert_eq!(before.total_path_count, 1);

    std::fs::remove_file(&file).unwrap();
    cli().unwrap().arg("backup").arg(repo.path()).assert().success();
    let after = MetadataRoot::load(repo_path).unwrap();
    assert_eq!(after.total_path_count, 0);

    cli().unwrap().arg("gc").arg(repo.path()).assert().success();
    let still_valid = MetadataRoot::load(repo_path);
    assert!(still_valid.is_ok());
}

#[test]
fn removal_under_track_keeps_history_and_restores_the_previous_bytes() {
    let src = tempdir().unwrap();
    let repo = tempdir().unwrap();
    let repo_path = Utf8Path::from_path(repo.path()).unwrap();
    let file = src.path().join("a.txt");
    std::fs::write(&file, b"some tracked content, not inlined").unwrap();

    cli().unwrap().arg("init").arg(repo.path()).assert().success();
    write_config(repo.path(), &format!("[track]\n{}\n", file.display()));
    cli().unwrap().arg("backup").arg(repo.path()).assert().success();

    std::fs::remove_file(&file).unwrap();
    cli().unwrap().arg("backup").arg(repo.path()).assert().success();

    let metadata = MetadataRoot::load(repo_path).unwrap();
    let mut node_path = None;
    metadata.for_each_node(|n| {
        if n.policy == Policy::Track && matches!(n.history.first().map(|h| &h.state), Some(PathState::NonExisting)) {
            node_path = Some(String::from_utf8_lossy(&n.path).into_owned());
        }
    });
    assert!(node_path.is_some());

    let dest = tempdir().unwrap();
    // Backup point 1 is the backup before the removal (0 is the removal itself).
    cli()
        .unwrap()
        .arg("restore")
        .arg(repo.path())
        .arg("1")
        .arg(dest.path())
        .assert()
        .success();

    let restored = dest.path().join(file.strip_prefix("/").unwrap_or(&file));
    assert_eq!(
        std::fs::read(restored).unwrap(),
        b"some tracked content, not inlined"
    );
}

#[test]
fn corruption_is_reported_for_exactly_the_affected_path() {
    let src = tempdir().unwrap();
    let repo = tempdir().unwrap();
    let repo_path = Utf8Path::from_path(repo.path()).unwrap();
    let file = src.path().join("a.txt");
    std::fs::write(&file, vec![b'x'; 21]).unwrap();

    cli().unwrap().arg("init").arg(repo.path()).assert().success();
    write_config(repo.path(), &format!("[copy]\n{}\n", file.display()));
    cli().unwrap().arg("backup").arg(repo.path()).assert().success();

    let metadata = MetadataRoot::load(repo_path).unwrap();
    let mut address = None;
    metadata.for_each_node(|n| {
        if let Some(entry) = n.history.first() {
            if let PathState::Regular { size, hash, slot, .. } = &entry.state {
                if *size > 20 {
                    address = Some(BlobAddress { hash: *hash, size: *size, slot: *slot });
                }
            }
        }
    });
    let address = address.expect("no blob-backed regular state recorded");

    let blob_path = repo_path.join(address.relative_path());
    let mut body = std::fs::read(&blob_path).unwrap();
    body.pop();
    std::fs::write(&blob_path, &body).unwrap();

    cli()
        .unwrap()
        .arg("check")
        .arg(repo.path())
        .assert()
        .failure()
        .stderr(predicates::str::contains("a.txt"));
}
