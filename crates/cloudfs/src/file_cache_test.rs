// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::sync::Arc;
use std::time::{Duration, Instant};

use rstest::rstest;

use crate::client::Client;
use crate::fixtures::*;
use crate::{Error, InodeID};

#[rstest]
fn test_cache_file_naming(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    let service = service(&client, tmpdir.path());
    let files = service.files();
    let id = InodeID::synthetic(0x2a);
    let path = files.path(".txt", id);
    assert_eq!(path.parent(), Some(files.root()));
    assert_eq!(
        path.file_name().and_then(|n| n.to_str()),
        Some("800000000000002a.txt")
    );
    assert_eq!(files.path("", id).file_name().and_then(|n| n.to_str()), Some("800000000000002a"));
}

#[rstest]
fn test_one_context_per_file(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    client.add_file(client.root(), "shared.bin", content(10));
    let service = service(&client, tmpdir.path());
    let file = service.root().unwrap().child("shared.bin").unwrap().expect("file");
    let files = service.files();

    assert!(files.context(&file, true).unwrap().is_none());
    let first = files.context(&file, false).unwrap().expect("created");
    let second = files.context(&file, true).unwrap().expect("live");
    let third = second.clone();
    assert!(Arc::ptr_eq(first.context(), second.context()));
    assert_eq!(files.live_count(), 1);

    drop(first);
    drop(second);
    assert_eq!(files.live_count(), 1);
    assert!(!third.is_cancelled());
    drop(third);
    assert_eq!(files.live_count(), 0);
}

#[rstest]
fn test_releasing_last_reference_cancels(
    tmpdir: tempfile::TempDir,
    client: Arc<MemoryClient>,
) {
    init_logging();
    client.add_file(client.root(), "data.bin", content(10));
    let service = service(&client, tmpdir.path());
    let file = service.root().unwrap().child("data.bin").unwrap().expect("file");

    let opened = service.files().context(&file, false).unwrap().expect("created");
    let context = Arc::clone(opened.context());
    drop(opened);
    assert!(context.is_cancelled());

    // a new opener gets a fresh context
    let reopened = service.files().context(&file, false).unwrap().expect("created");
    assert!(!Arc::ptr_eq(reopened.context(), &context));
    assert!(!reopened.is_cancelled());
}

#[rstest]
fn test_directories_have_no_context(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    assert!(matches!(
        service.files().context(&root, false),
        Err(Error::IsDirectory(_))
    ));
}

#[rstest]
fn test_remove_spares_content_in_use(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let service = service(&client, tmpdir.path());
    let files = service.files();
    let id = InodeID::synthetic(7);

    let info = files.create(".dat", id, true, true).unwrap();
    info.write_at(b"content", 0).unwrap();
    files.remove(".dat", id).unwrap();
    assert!(info.path().exists());

    let path = info.path().to_owned();
    drop(info);
    files.remove(".dat", id).unwrap();
    assert!(!path.exists());
    // removing what is already gone is fine
    files.remove(".dat", id).unwrap();
}

#[rstest]
fn test_create_without_creating(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    let service = service(&client, tmpdir.path());
    let result = service.files().create(".dat", InodeID::synthetic(8), true, false);
    assert!(matches!(result, Err(Error::Io(..))));
}

#[rstest]
fn test_file_info_positioned_io(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    let service = service(&client, tmpdir.path());
    let info = service
        .files()
        .create("", InodeID::synthetic(9), true, true)
        .unwrap();
    info.write_at(b"0123456789", 0).unwrap();
    info.write_at(b"ab", 4).unwrap();

    let mut buffer = [0; 8];
    assert_eq!(info.read_at(&mut buffer, 2).unwrap(), 8);
    assert_eq!(&buffer, b"23ab6789");
    assert_eq!(info.read_at(&mut buffer, 6).unwrap(), 4);
    assert_eq!(&buffer[..4], b"6789");

    info.set_len(3).unwrap();
    assert_eq!(info.read_at(&mut buffer, 0).unwrap(), 3);
}

#[rstest]
fn test_stat_prefers_live_context(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    client.add_file(client.root(), "sized.bin", content(1234));
    let service = service(&client, tmpdir.path());
    let file = service.root().unwrap().child("sized.bin").unwrap().expect("file");
    let files = service.files();
    let extension = file.extension();

    assert_eq!(files.stat(&extension, file.id()).unwrap(), None);
    let opened = files.context(&file, false).unwrap().expect("created");
    let (size, _) = files.stat(&extension, file.id()).unwrap().expect("live");
    assert_eq!(size, 1234);
    assert_eq!(opened.size(), 1234);
}

#[rstest]
fn test_cancel_waits_for_release(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    client.add_file(client.root(), "open.bin", content(10));
    let service = service(&client, tmpdir.path());
    let file = service.root().unwrap().child("open.bin").unwrap().expect("file");
    let files = Arc::clone(service.files());
    let opened = files.context(&file, false).unwrap().expect("created");
    let context = Arc::clone(opened.context());

    let start = Instant::now();
    let closer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        drop(opened);
    });
    files.cancel();
    closer.join().unwrap();

    assert!(context.is_cancelled());
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(files.live_count(), 0);
}

#[rstest]
fn test_flush_uploads_modified_files(tmpdir: tempfile::TempDir, client: Arc<MemoryClient>) {
    init_logging();
    let service = service(&client, tmpdir.path());
    let root = service.root().unwrap();
    let created = root.make_file("new.txt").unwrap();
    let untouched = root.make_file("other.txt").unwrap();
    untouched.set_modified(false).unwrap();
    service
        .files()
        .create(".txt", created.id(), true, false)
        .unwrap()
        .write_at(b"payload", 0)
        .unwrap();

    service.files().flush(&[created.clone(), untouched.clone()]).unwrap();

    let uploaded = client.child(client.root(), "new.txt").expect("uploaded");
    assert_eq!(client.content(uploaded.handle).unwrap().as_ref(), b"payload");
    assert_eq!(created.handle(), Some(uploaded.handle));
    assert!(!created.was_modified());
    assert!(client.child(client.root(), "other.txt").is_none());
}
