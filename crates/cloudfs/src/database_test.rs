// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use rstest::rstest;

use super::{Database, InodeRow};
use crate::fixtures::*;
use crate::{BindHandle, Error, InodeID, NodeHandle};

fn row(id: InodeID, parent: u64, name: &str) -> InodeRow {
    InodeRow {
        id,
        handle: None,
        bind: None,
        extension: ".txt".into(),
        modified: true,
        location: Some((NodeHandle(parent), name.into())),
    }
}

#[rstest]
fn test_synthetic_ids_are_never_reused() {
    init_logging();
    let db = Database::open_in_memory().unwrap();
    let (a, b) = db
        .transaction(|tx| {
            let a = tx.next_id()?;
            tx.insert(&row(a, 1, "a"))?;
            tx.remove(a)?;
            Ok((a, tx.next_id()?))
        })
        .unwrap();
    assert!(a.is_synthetic());
    assert!(b.is_synthetic());
    assert_ne!(a, b);
}

#[rstest]
fn test_row_lookups() {
    init_logging();
    let db = Database::open_in_memory().unwrap();
    db.transaction(|tx| {
        let id = tx.next_id()?;
        tx.insert(&row(id, 1, "report.txt"))?;
        assert_eq!(tx.by_id(id)?, Some(row(id, 1, "report.txt")));
        assert_eq!(tx.by_name(NodeHandle(1), "report.txt")?.map(|r| r.id), Some(id));
        assert!(tx.by_name(NodeHandle(2), "report.txt")?.is_none());

        let bind = BindHandle::generate();
        tx.set_bind_handle(id, Some(&bind))?;
        assert_eq!(tx.by_bind_handle(&bind)?.map(|r| r.id), Some(id));

        // binding a node clears the bind handle
        tx.set_handle(id, NodeHandle(99))?;
        let bound = tx.by_handle(NodeHandle(99))?.expect("row by handle");
        assert_eq!(bound.id, id);
        assert_eq!(bound.bind, None);

        tx.set_location(id, NodeHandle(2), "moved.txt")?;
        assert_eq!(tx.children(NodeHandle(2))?.len(), 1);
        assert!(tx.children(NodeHandle(1))?.is_empty());

        tx.clear_location(id)?;
        assert_eq!(tx.by_id(id)?.and_then(|r| r.location), None);
        assert_eq!(tx.ids()?, vec![id]);
        Ok(())
    })
    .unwrap();
}

#[rstest]
fn test_names_are_unique_within_a_parent() {
    init_logging();
    let db = Database::open_in_memory().unwrap();
    let result = db.transaction(|tx| {
        let a = tx.next_id()?;
        let b = tx.next_id()?;
        tx.insert(&row(a, 1, "same"))?;
        tx.insert(&row(b, 1, "same"))
    });
    assert!(matches!(result, Err(Error::Database(_))));
}

#[rstest]
fn test_failed_transactions_roll_back() {
    init_logging();
    let db = Database::open_in_memory().unwrap();
    let id = db.transaction(|tx| tx.next_id()).unwrap();
    let _ = db.transaction(|tx| {
        tx.insert(&row(id, 1, "ghost"))?;
        Err::<(), _>(Error::Cancelled)
    });
    assert_eq!(db.transaction(|tx| tx.by_id(id)).unwrap(), None);
}

#[rstest]
fn test_reopen_clears_bind_handles(tmpdir: tempfile::TempDir) {
    init_logging();
    let path = tmpdir.path().join("inodes.db");
    let id = {
        let db = Database::open(&path).unwrap();
        db.transaction(|tx| {
            let id = tx.next_id()?;
            let mut r = row(id, 1, "uploading");
            r.bind = Some(BindHandle::generate());
            tx.insert(&r)?;
            Ok(id)
        })
        .unwrap()
    };
    let db = Database::open(&path).unwrap();
    let reopened = db.transaction(|tx| tx.by_id(id)).unwrap().unwrap();
    assert_eq!(reopened.bind, None);
    let next = db.transaction(|tx| tx.next_id()).unwrap();
    assert!(next > id, "counter must persist across opens");
}

#[rstest]
fn test_newer_schema_is_rejected(tmpdir: tempfile::TempDir) {
    init_logging();
    let path = tmpdir.path().join("inodes.db");
    {
        let connection = rusqlite::Connection::open(&path).unwrap();
        connection
            .pragma_update(None, "user_version", 1000)
            .unwrap();
    }
    assert!(matches!(
        Database::open(&path),
        Err(Error::DatabaseTooNew(_, 1000))
    ));
}

#[rstest]
fn test_synthetic_ids_stop_short_of_the_end(tmpdir: tempfile::TempDir) {
    init_logging();
    let path = tmpdir.path().join("inodes.db");
    drop(Database::open(&path).unwrap());
    {
        let connection = rusqlite::Connection::open(&path).unwrap();
        connection
            .execute("UPDATE inode_id SET next = ?1", [i64::MAX - 3])
            .unwrap();
    }

    let db = Database::open(&path).unwrap();
    let last = db.transaction(|tx| tx.next_id()).unwrap();
    assert_eq!(last.as_u64(), u64::MAX - 3);
    assert!(db.transaction(|tx| tx.next_id()).is_err());
}
