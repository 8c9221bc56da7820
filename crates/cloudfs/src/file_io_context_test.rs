// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::sync::Arc;
use std::time::Duration;

use crate::client::Client;
use crate::fixtures::*;
use crate::{Error, FileRange, FileRef, InodeID, NodeHandle, Permissions, Service};

const SIZE: u64 = MIB;

struct Harness {
    client: Arc<MemoryClient>,
    service: Service,
    handle: NodeHandle,
    _tmpdir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        init_logging();
        let tmpdir = tmpdir();
        let client = client();
        let handle = client.add_file(client.root(), "big.bin", content(SIZE));
        let service = service(&client, tmpdir.path());
        Self {
            client,
            service,
            handle,
            _tmpdir: tmpdir,
        }
    }

    fn open(&self, write: bool) -> FileRef {
        self.service
            .open(InodeID::from_handle(self.handle), write)
            .expect("open test file")
    }

    fn expected(&self, begin: u64, end: u64) -> Vec<u8> {
        content(SIZE)[begin as usize..end as usize].to_vec()
    }
}

#[tokio::test]
async fn test_adjacent_reads_coalesce() {
    let harness = Harness::new();
    let file = harness.open(false);

    let first = file.read(0, 64 * KIB).await.unwrap();
    let second = file.read(64 * KIB, 64 * KIB).await.unwrap();

    assert_eq!(first.as_ref(), harness.expected(0, 64 * KIB).as_slice());
    assert_eq!(second.as_ref(), harness.expected(64 * KIB, 128 * KIB).as_slice());
    assert_eq!(file.cached_ranges(), vec![FileRange::new(0, 128 * KIB)]);
}

#[tokio::test]
async fn test_concurrent_neighbours_coalesce() {
    let harness = Harness::new();
    let file = harness.open(false);
    file.read(0, 128 * KIB).await.unwrap();

    harness.client.set_throttle(Some(Duration::from_millis(2)));
    let (a, b) = tokio::join!(
        file.read(128 * KIB, 64 * KIB),
        file.read(192 * KIB, 64 * KIB)
    );

    assert_eq!(a.unwrap().as_ref(), harness.expected(128 * KIB, 192 * KIB).as_slice());
    assert_eq!(b.unwrap().as_ref(), harness.expected(192 * KIB, 256 * KIB).as_slice());
    assert_eq!(file.cached_ranges(), vec![FileRange::new(0, 256 * KIB)]);
}

#[tokio::test]
async fn test_overlapping_reads_share_a_fetch() {
    let harness = Harness::new();
    let file = harness.open(false);
    harness.client.set_throttle(Some(Duration::from_millis(2)));

    let (a, b) = tokio::join!(file.read(0, 64 * KIB), file.read(16 * KIB, 32 * KIB));

    assert_eq!(a.unwrap().len() as u64, 64 * KIB);
    assert_eq!(b.unwrap().as_ref(), harness.expected(16 * KIB, 48 * KIB).as_slice());
    assert_eq!(harness.client.downloads(), 1);
}

#[tokio::test]
async fn test_reads_are_clamped_to_the_file() {
    let harness = Harness::new();
    let file = harness.open(false);

    let tail = file.read(768 * KIB, 512 * KIB).await.unwrap();
    assert_eq!(tail.len() as u64, 256 * KIB);
    assert_eq!(tail.as_ref(), harness.expected(768 * KIB, SIZE).as_slice());

    assert!(file.read(0, 0).await.unwrap().is_empty());
    assert!(file.read(SIZE, 10).await.unwrap().is_empty());
    assert!(file.read(SIZE + 10, 10).await.unwrap().is_empty());
    assert_eq!(harness.client.downloads(), 1);
}

#[tokio::test]
async fn test_cached_reads_do_not_download() {
    let harness = Harness::new();
    let file = harness.open(false);
    file.read(0, 128 * KIB).await.unwrap();
    let downloads = harness.client.downloads();

    let inner = file.read(10, 1000).await.unwrap();
    assert_eq!(inner.as_ref(), harness.expected(10, 1010).as_slice());
    assert_eq!(harness.client.downloads(), downloads);
}

#[tokio::test]
async fn test_releasing_mid_read_cancels() {
    let harness = Harness::new();
    let file = harness.open(false);
    harness.client.set_throttle(Some(Duration::from_millis(20)));

    let context = Arc::clone(file.context());
    let read = tokio::spawn(async move { context.read(0, 256 * KIB).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(file);

    let result = read.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
}

#[tokio::test]
async fn test_cancelled_context_refuses_reads() {
    let harness = Harness::new();
    let file = harness.open(false);
    file.cancel();
    file.cancel();
    assert!(file.is_cancelled());
    assert!(matches!(file.read(0, 10).await, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_fetch_succeeding_after_cancel_is_discarded() {
    let harness = Harness::new();
    let file = harness.open(false);
    let gate = harness.client.hold_completions();

    let context = Arc::clone(file.context());
    let read = tokio::spawn(async move { context.read(0, 64 * KIB).await });
    for _ in 0..200 {
        if gate.held() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(gate.held(), 1, "download never delivered its content");

    // the content has arrived but success is reported only after
    // the context is cancelled
    file.cancel();
    gate.open();

    let result = read.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");

    // let the late success land before looking at the cache
    for _ in 0..200 {
        if gate.held() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(file.cached_ranges().is_empty());
    assert_eq!(harness.client.downloads(), 1);
}

#[tokio::test]
async fn test_failed_fetches_are_retried() {
    let harness = Harness::new();
    let file = harness.open(false);
    harness.client.fail_next(2);

    let data = file.read(0, 32 * KIB).await.unwrap();
    assert_eq!(data.as_ref(), harness.expected(0, 32 * KIB).as_slice());
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let harness = Harness::new();
    let file = harness.open(false);
    harness.client.fail_next(10);

    let result = file.read(0, 32 * KIB).await;
    assert!(matches!(result, Err(Error::Network(_))), "{result:?}");
    assert!(file.cached_ranges().is_empty());

    // the failed range is fetched again by the next read
    let data = file.read(0, 32 * KIB).await.unwrap();
    assert_eq!(data.len() as u64, 32 * KIB);
}

#[tokio::test]
async fn test_write_marks_file_modified() {
    let harness = Harness::new();
    let file = harness.open(true);

    assert_eq!(file.write(10, b"hello").await.unwrap(), 5);
    assert!(file.was_modified());
    assert!(file.file().was_modified());
    assert_eq!(file.size(), SIZE);
    let mut expected = harness.expected(8, 17);
    expected[2..7].copy_from_slice(b"hello");
    assert_eq!(file.read(8, 9).await.unwrap().as_ref(), expected.as_slice());

    file.write(SIZE, b"tail").await.unwrap();
    assert_eq!(file.size(), SIZE + 4);
    assert_eq!(file.cached_ranges(), vec![FileRange::new(0, SIZE + 4)]);
}

#[tokio::test]
async fn test_flush_uploads_content() {
    let harness = Harness::new();
    let file = harness.open(true);
    let id = file.file().id();
    file.truncate(100).await.unwrap();
    file.write(0, b"fresh").await.unwrap();

    file.flush().unwrap();

    assert!(!file.was_modified());
    assert!(!file.file().was_modified());
    let handle = file.file().handle().expect("bound to new node");
    assert_ne!(handle, harness.handle);
    assert_eq!(file.file().id(), id, "identity survives the upload");
    let uploaded = harness.client.content(handle).unwrap();
    assert_eq!(uploaded.len(), 100);
    assert_eq!(&uploaded[..5], b"fresh");
    assert_eq!(&uploaded[5..], &harness.expected(5, 100)[..]);
}

#[tokio::test]
async fn test_truncate_shrinks_and_grows() {
    let harness = Harness::new();
    let file = harness.open(true);

    file.truncate(1000).await.unwrap();
    assert_eq!(file.size(), 1000);
    assert_eq!(file.read(0, SIZE).await.unwrap().len(), 1000);

    file.truncate(2000).await.unwrap();
    let grown = file.read(1000, 1000).await.unwrap();
    assert!(grown.iter().all(|b| *b == 0));
    assert_eq!(file.cached_ranges(), vec![FileRange::new(0, 2000)]);
}

#[tokio::test]
async fn test_read_only_files_refuse_writes() {
    let harness = Harness::new();
    harness
        .client
        .update(harness.handle, |info| info.permissions = Permissions::ReadOnly);
    let file = harness.open(false);

    assert!(matches!(file.write(0, b"x").await, Err(Error::ReadOnly(_))));
    assert!(matches!(file.truncate(0).await, Err(Error::ReadOnly(_))));
    assert!(matches!(
        harness.service.open(file.file().id(), true),
        Err(Error::ReadOnly(_))
    ));
}
