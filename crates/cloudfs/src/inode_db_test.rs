// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use rstest::rstest;

use crate::client::Client;
use crate::fixtures::*;
use crate::{Error, InodeID, InodeKind, Permissions, Service};

/// A service that keeps at most `size` idle inodes, regardless of age.
fn bounded_service(client: &Arc<MemoryClient>, root: &std::path::Path, size: usize) -> Service {
    let mut config = test_config(root);
    config.inodes.cache_max_size = size;
    config.inodes.cache_max_age_secs = 0;
    let client: Arc<dyn Client> = Arc::clone(client) as Arc<dyn Client>;
    Service::new(client, &config).expect("failed to open bounded service")
}

#[rstest]
fn test_lookup_resolves_paths(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let docs = client.add_directory(client.root(), "docs");
    let report = client.add_file(docs, "report.txt", content(10));
    let service = service(&client, tmpdir.path());
    let inodes = service.inodes();

    let root = inodes.root().unwrap();
    assert_eq!(root.id(), InodeID::from_handle(client.root()));
    assert_eq!(root.kind(), InodeKind::Directory);

    let file = inodes.lookup("docs/report.txt", root.id()).unwrap();
    assert_eq!(file.id(), InodeID::from_handle(report));
    assert_eq!(file.name(), "report.txt");
    assert_eq!(file.path(root.id()).unwrap(), "docs/report.txt");

    let again = inodes.lookup("./docs/../docs/report.txt", root.id()).unwrap();
    assert_eq!(again.id(), file.id());

    let missing = inodes.lookup("docs/missing.txt", root.id());
    assert!(matches!(missing, Err(Error::NotFound(_))));
}

#[rstest]
fn test_resident_inodes_are_shared(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    client.add_directory(client.root(), "shared");
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();

    let first = root.child("shared").unwrap().expect("child");
    assert_eq!(first.references(), 1);
    let second = service.inodes().get(first.id(), true).unwrap().expect("resident");
    assert_eq!(first.references(), 2);
    let third = second.clone();
    assert_eq!(first.references(), 3);
    drop(second);
    drop(third);
    assert_eq!(first.references(), 1);
}

#[rstest]
fn test_removed_inode_lives_until_released(
    tmpdir: tempfile::TempDir,
    client: Arc<MemoryClient>,
) {
    init_logging();
    let service = service(&client, tmpdir.path());
    let inodes = service.inodes();
    let root = service.root().unwrap();

    let file = root.make_file("draft.txt").unwrap();
    let id = file.id();
    let cached = service.files().path(".txt", id);
    assert!(id.is_synthetic());
    assert!(cached.exists(), "creating a file creates its cache file");

    file.unlink().unwrap();
    assert!(file.removed());
    assert!(root.child("draft.txt").unwrap().is_none());

    // still addressable by identity while referenced
    let held = inodes.get(id, true).unwrap().expect("removed but referenced");
    drop(file);
    assert!(inodes.exists(id).unwrap());
    drop(held);

    assert!(inodes.get(id, true).unwrap().is_none());
    assert!(!inodes.exists(id).unwrap());
    assert!(!cached.exists(), "destroying a file removes its content");
}

#[rstest]
fn test_names_are_unique(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    client.add_file(client.root(), "cloud.txt", content(4));
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();

    let _local = root.make_file("local.txt").unwrap();
    assert!(matches!(
        root.make_file("local.txt"),
        Err(Error::AlreadyExists(_))
    ));
    assert!(matches!(
        root.make_directory("local.txt"),
        Err(Error::AlreadyExists(_))
    ));
    assert!(matches!(
        root.make_file("cloud.txt"),
        Err(Error::AlreadyExists(_))
    ));
}

#[rstest]
#[case("")]
#[case(".")]
#[case("..")]
#[case("a/b")]
#[case("nul\0")]
fn test_invalid_names_are_rejected(
    tmpdir: tempfile::TempDir,
    client: Arc<MemoryClient>,
    #[case] name: &str,
) {
    init_logging();
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    assert!(matches!(root.make_file(name), Err(Error::InvalidName(_))));
    assert!(matches!(root.make_directory(name), Err(Error::InvalidName(_))));
}

#[rstest]
fn test_long_names_are_rejected(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let name = "x".repeat(256);
    assert!(matches!(root.make_file(&name), Err(Error::NameTooLong(_))));
    assert!(root.make_file(&"x".repeat(255)).is_ok());
}

#[rstest]
fn test_children_merge_local_and_cloud(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let root_handle = client.root();
    client.add_file(root_handle, "b-cloud.txt", content(4));
    client.add_directory(root_handle, "c-dir");
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let _local = root.make_file("a-local.txt").unwrap();

    let mut names: Vec<_> = root.children().unwrap().iter().map(|c| c.name()).collect();
    names.sort();
    assert_eq!(names, vec!["a-local.txt", "b-cloud.txt", "c-dir"]);
    assert!(root.has_children().unwrap());
    assert!(root.has_child("a-local.txt").unwrap());
}

#[rstest]
fn test_move_updates_cloud_and_index(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let root_handle = client.root();
    let handle = client.add_file(root_handle, "old.txt", content(8));
    let dest_handle = client.add_directory(root_handle, "dest");
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let dest = root.child("dest").unwrap().expect("dest");
    let file = root.child("old.txt").unwrap().expect("file");

    file.move_to("new.txt", &dest).unwrap();

    let info = client.info(handle).expect("node still exists");
    assert_eq!(info.name, "new.txt");
    assert_eq!(info.parent, Some(dest_handle));
    assert!(root.child("old.txt").unwrap().is_none());
    let moved = dest.child("new.txt").unwrap().expect("moved");
    assert_eq!(moved.id(), file.id());
    assert_eq!(file.path(root.id()).unwrap(), "dest/new.txt");
}

#[rstest]
fn test_concurrent_moves_to_one_name(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let dest = root.make_directory("dest").unwrap();
    let a = root.make_file("a.txt").unwrap();
    let b = root.make_file("b.txt").unwrap();
    let barrier = Barrier::new(2);

    let (first, second) = std::thread::scope(|scope| {
        let first = scope.spawn(|| {
            barrier.wait();
            a.move_to("c.txt", &dest)
        });
        let second = scope.spawn(|| {
            barrier.wait();
            b.move_to("c.txt", &dest)
        });
        (first.join().unwrap(), second.join().unwrap())
    });

    let outcomes = [&first, &second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .any(|r| matches!(r, Err(Error::AlreadyExists(_))))
    );
    let winner = dest.child("c.txt").unwrap().expect("winner");
    let expected = if first.is_ok() { a.id() } else { b.id() };
    assert_eq!(winner.id(), expected);
}

#[rstest]
fn test_directory_cannot_move_beneath_itself(
    tmpdir: tempfile::TempDir,
    client: Arc<MemoryClient>,
) {
    init_logging();
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let outer = root.make_directory("outer").unwrap();
    let inner = outer.make_directory("inner").unwrap();
    assert!(matches!(
        outer.move_to("loop", &inner),
        Err(Error::InvalidName(_))
    ));
    assert!(matches!(outer.move_to("x", &outer), Err(Error::InvalidName(_))));
}

#[rstest]
fn test_replace_takes_the_target_name(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let root_handle = client.root();
    let source_handle = client.add_file(root_handle, "source.txt", content(3));
    let target_handle = client.add_file(root_handle, "target.txt", content(5));
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let source = root.child("source.txt").unwrap().expect("source");
    let target = root.child("target.txt").unwrap().expect("target");

    source.replace(&target, false).unwrap();

    assert!(target.removed());
    assert!(client.info(target_handle).is_none());
    assert_eq!(client.info(source_handle).map(|i| i.name).as_deref(), Some("target.txt"));
    let found = root.child("target.txt").unwrap().expect("replaced");
    assert_eq!(found.id(), source.id());
    assert!(root.child("source.txt").unwrap().is_none());
}

#[rstest]
fn test_replace_checks_kinds(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let file = root.make_file("file.txt").unwrap();
    let empty = root.make_directory("empty").unwrap();
    let full = root.make_directory("full").unwrap();
    let _inside = full.make_directory("inside").unwrap();
    let other = root.make_directory("other").unwrap();

    assert!(matches!(file.replace(&empty, true), Err(Error::IsDirectory(_))));
    assert!(matches!(empty.replace(&file, true), Err(Error::NotDirectory(_))));
    assert!(matches!(other.replace(&empty, false), Err(Error::AlreadyExists(_))));
    assert!(matches!(other.replace(&full, true), Err(Error::NotEmpty(_))));
    other.replace(&empty, true).unwrap();
    assert_eq!(root.child("empty").unwrap().map(|c| c.id()), Some(other.id()));
}

#[rstest]
fn test_unlink_checks_directory_contents(
    tmpdir: tempfile::TempDir,
    client: Arc<MemoryClient>,
) {
    init_logging();
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let dir = root.make_directory("dir").unwrap();
    let file = dir.make_file("file.txt").unwrap();

    assert!(matches!(dir.unlink(), Err(Error::NotEmpty(_))));
    file.unlink().unwrap();
    dir.unlink().unwrap();
    assert!(matches!(root.unlink(), Err(Error::ReadOnly(_))));
    assert!(matches!(file.unlink(), Err(Error::NotFound(_))));
}

#[rstest]
fn test_read_only_directories(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let locked = client.add_directory(client.root(), "locked");
    client.add_file(locked, "kept.txt", content(4));
    client.update(locked, |info| info.permissions = Permissions::ReadOnly);
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let dir = root.child("locked").unwrap().expect("locked");
    let kept = dir.child("kept.txt").unwrap().expect("kept");

    assert!(matches!(dir.make_file("new.txt"), Err(Error::ReadOnly(_))));
    assert!(matches!(dir.make_directory("new"), Err(Error::ReadOnly(_))));
    assert!(matches!(kept.unlink(), Err(Error::ReadOnly(_))));
    assert!(matches!(kept.move_to("out.txt", &root), Err(Error::ReadOnly(_))));
}

#[rstest]
fn test_local_files_survive_restart(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let id = {
        let service = service(&client, tmpdir.path());
        let root = service.root().unwrap();
        let file = root.make_file("notes.md").unwrap();
        file.id()
    };

    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let file = root.child("notes.md").unwrap().expect("persisted");
    assert_eq!(file.id(), id);
    assert!(file.was_modified());
    assert_eq!(file.extension(), ".md");
    assert!(service.inodes().modified(id).unwrap());
}

#[rstest]
fn test_current_removes_orphaned_content(
    tmpdir: tempfile::TempDir,
    client: Arc<MemoryClient>,
) {
    init_logging();
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let kept = root.make_file("kept.txt").unwrap();

    let files = service.files();
    let orphan = files.path(".bin", InodeID::synthetic(9999));
    std::fs::write(&orphan, b"stale").unwrap();
    let unrelated = files.root().join("README");
    std::fs::write(&unrelated, b"not ours").unwrap();

    assert_eq!(service.current().unwrap(), 1);
    assert!(!orphan.exists());
    assert!(unrelated.exists());
    assert!(files.path(".txt", kept.id()).exists());
}

#[rstest]
fn test_clear_waits_for_references(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    client.add_directory(client.root(), "held");
    let service = service(&client, tmpdir.path());
    let inodes = service.inodes().clone();
    let held = inodes.root().unwrap().child("held").unwrap().expect("held");
    assert!(inodes.resident_count() >= 2);

    let start = Instant::now();
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
    });
    inodes.clear();
    releaser.join().unwrap();

    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(inodes.resident_count(), 0);
}

#[rstest]
fn test_clear_gives_up_on_leaked_references(
    tmpdir: tempfile::TempDir,
    client: Arc<MemoryClient>,
) {
    init_logging();
    let service = service(&client, tmpdir.path());
    let inodes = service.inodes();
    let leaked = inodes.root().unwrap();

    let start = Instant::now();
    inodes.clear();
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert_eq!(inodes.resident_count(), 1);
    assert_eq!(leaked.references(), 1);
}

#[rstest]
fn test_idle_inodes_stay_resident_within_bound(
    tmpdir: tempfile::TempDir,
    client: Arc<MemoryClient>,
) {
    init_logging();
    let handles: Vec<_> = (0..20)
        .map(|i| client.add_file(client.root(), &format!("file{i:02}.txt"), content(4)))
        .collect();
    let service = service(&client, tmpdir.path());
    let inodes = service.inodes();
    let root = inodes.root().unwrap();

    drop(root.children().unwrap());
    assert_eq!(inodes.resident_count(), 21);
    for handle in handles {
        assert_eq!(inodes.references(InodeID::from_handle(handle)), 0);
    }
}

#[rstest]
fn test_idle_inodes_are_trimmed(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let handles: Vec<_> = (0..50)
        .map(|i| client.add_file(client.root(), &format!("file{i:02}.txt"), content(4)))
        .collect();
    let service = bounded_service(&client, tmpdir.path(), 10);
    let inodes = service.inodes();
    let root = inodes.root().unwrap();

    let listing = root.children().unwrap();
    assert_eq!(listing.len(), 50);
    assert_eq!(inodes.resident_count(), 51);
    drop(listing);
    assert_eq!(inodes.resident_count(), 11);

    // the oldest were evicted and come back under the same identity
    let first = root.child("file00.txt").unwrap().expect("evicted file");
    assert_eq!(first.id(), InodeID::from_handle(handles[0]));
    assert_eq!(first.name(), "file00.txt");
    assert_eq!(first.references(), 1);
    let again = inodes.get(first.id(), true).unwrap().expect("resident");
    assert_eq!(first.references(), 2);
    drop(again);
}

#[rstest]
fn test_trim_keeps_local_state(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let clean = client.add_file(client.root(), "clean.txt", content(4));
    let dirty = client.add_file(client.root(), "dirty.txt", content(4));
    let service = bounded_service(&client, tmpdir.path(), 0);
    let inodes = service.inodes();
    let root = inodes.root().unwrap();

    let local = root.make_file("local.txt").unwrap().id();
    let file = root.child("dirty.txt").unwrap().expect("dirty");
    file.set_modified(true).unwrap();
    drop(file);
    drop(root.child("clean.txt").unwrap().expect("clean"));
    inodes.trim();

    assert_eq!(inodes.resident_count(), 3);
    assert!(inodes.get(local, true).unwrap().is_some());
    assert_eq!(inodes.references(InodeID::from_handle(dirty)), 0);
    assert!(inodes.resident(InodeID::from_handle(clean)).is_none());
    assert_eq!(root.child("local.txt").unwrap().map(|f| f.id()), Some(local));
}

#[rstest]
fn test_trim_respects_minimum_age(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let handle = client.add_file(client.root(), "young.txt", content(4));
    let mut config = test_config(tmpdir.path());
    config.inodes.cache_max_size = 0;
    config.inodes.cache_max_age_secs = 300;
    let service = Service::new(Arc::clone(&client) as Arc<dyn Client>, &config).unwrap();
    let inodes = service.inodes();
    let root = inodes.root().unwrap();

    drop(root.child("young.txt").unwrap().expect("file"));
    inodes.trim();
    assert_eq!(inodes.references(InodeID::from_handle(handle)), 0);
    assert_eq!(inodes.resident_count(), 2);
}
