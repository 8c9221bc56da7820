// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Persistent inode rows, stored in sqlite.
//!
//! A row exists for every inode whose identity or state cannot be
//! recovered from the cloud alone: files that have never been
//! uploaded, files with local modifications, files whose node
//! handle changed after an upload and files with an upload in
//! flight.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, named_params};

use crate::{BindHandle, Error, InodeID, NodeHandle, Result};

#[cfg(test)]
#[path = "./database_test.rs"]
mod database_test;

/// Schema upgrades, indexed by the version they produce minus one.
const MIGRATIONS: &[&str] = &[
    // 1: initial schema
    "CREATE TABLE inodes (
        id INTEGER PRIMARY KEY NOT NULL,
        handle INTEGER UNIQUE,
        bind_handle TEXT UNIQUE,
        extension TEXT NOT NULL,
        modified INTEGER NOT NULL,
        name TEXT,
        parent_handle INTEGER,
        UNIQUE (name, parent_handle)
    );
    CREATE INDEX inodes_by_parent ON inodes (parent_handle);
    CREATE TABLE inode_id (next INTEGER NOT NULL);
    INSERT INTO inode_id (next) VALUES (1);",
];

/// The named statements used against the database.
struct Queries;

impl Queries {
    const INSERT_INODE: &'static str = "INSERT INTO inodes \
        (id, handle, bind_handle, extension, modified, name, parent_handle) \
        VALUES (:id, :handle, :bind_handle, :extension, :modified, :name, :parent_handle)";
    const GET_INODE_BY_ID: &'static str = "SELECT * FROM inodes WHERE id = :id";
    const GET_INODE_BY_HANDLE: &'static str = "SELECT * FROM inodes WHERE handle = :handle";
    const GET_INODE_BY_BIND_HANDLE: &'static str =
        "SELECT * FROM inodes WHERE bind_handle = :bind_handle";
    const GET_INODE_BY_NAME_AND_PARENT_HANDLE: &'static str =
        "SELECT * FROM inodes WHERE name = :name AND parent_handle = :parent_handle";
    const GET_INODES_BY_PARENT_HANDLE: &'static str =
        "SELECT * FROM inodes WHERE parent_handle = :parent_handle ORDER BY name";
    const GET_INODE_IDS: &'static str = "SELECT id FROM inodes";
    const SET_NAME_AND_PARENT_HANDLE: &'static str =
        "UPDATE inodes SET name = :name, parent_handle = :parent_handle WHERE id = :id";
    const CLEAR_NAME_AND_PARENT_HANDLE: &'static str =
        "UPDATE inodes SET name = NULL, parent_handle = NULL WHERE id = :id";
    const SET_HANDLE: &'static str =
        "UPDATE inodes SET handle = :handle, bind_handle = NULL WHERE id = :id";
    const SET_BIND_HANDLE: &'static str =
        "UPDATE inodes SET bind_handle = :bind_handle WHERE id = :id";
    const SET_MODIFIED: &'static str = "UPDATE inodes SET modified = :modified WHERE id = :id";
    const CLEAR_BIND_HANDLES: &'static str = "UPDATE inodes SET bind_handle = NULL";
    const REMOVE_INODE_BY_ID: &'static str = "DELETE FROM inodes WHERE id = :id";
    const GET_NEXT_INODE_ID: &'static str = "SELECT next FROM inode_id";
    const SET_NEXT_INODE_ID: &'static str = "UPDATE inode_id SET next = :next";
}

/// One persisted inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRow {
    pub id: InodeID,
    pub handle: Option<NodeHandle>,
    pub bind: Option<BindHandle>,
    pub extension: String,
    pub modified: bool,
    /// The parent directory and name, absent once unlinked.
    pub location: Option<(NodeHandle, String)>,
}

impl InodeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: InodeID::from_i64(row.get("id")?),
            handle: row
                .get::<_, Option<i64>>("handle")?
                .map(NodeHandle::from_i64),
            bind: row
                .get::<_, Option<String>>("bind_handle")?
                .map(BindHandle::from),
            extension: row.get("extension")?,
            modified: row.get("modified")?,
            location: match (
                row.get::<_, Option<i64>>("parent_handle")?,
                row.get::<_, Option<String>>("name")?,
            ) {
                (Some(parent), Some(name)) => Some((NodeHandle::from_i64(parent), name)),
                _ => None,
            },
        })
    }
}

/// The inode database.
pub struct Database {
    path: PathBuf,
    connection: Mutex<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open (or create) the database at the given path,
    /// upgrading its schema as needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| Error::Io("create database directory", parent.to_owned(), err))?;
        }
        let connection = Connection::open(&path)?;
        Self::initialize(path, connection)
    }

    /// Open a private database that lives only as long as this instance.
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(PathBuf::from(":memory:"), Connection::open_in_memory()?)
    }

    fn initialize(path: PathBuf, mut connection: Connection) -> Result<Self> {
        let version: i64 = connection.pragma_query_value(None, "user_version", |r| r.get(0))?;
        let latest = MIGRATIONS.len() as i64;
        if version > latest {
            return Err(Error::DatabaseTooNew(path, version));
        }
        let transaction = connection.transaction()?;
        for (index, migration) in MIGRATIONS.iter().enumerate().skip(version as usize) {
            tracing::debug!(?path, "upgrading inode database to version {}", index + 1);
            transaction.execute_batch(migration)?;
        }
        transaction.pragma_update(None, "user_version", latest)?;
        // bind handles identify uploads in flight, none can
        // survive a restart of the process
        let cleared = transaction.execute(Queries::CLEAR_BIND_HANDLES, [])?;
        if cleared > 0 {
            tracing::debug!("cleared {cleared} stale bind handle(s)");
        }
        transaction.commit()?;
        Ok(Self {
            path,
            connection: Mutex::new(connection),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the given function inside a single transaction, which is
    /// committed only if the function succeeds.
    pub fn transaction<T, F>(&self, func: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut connection = self.connection.lock();
        let inner = connection.transaction()?;
        let transaction = Transaction { inner };
        let result = func(&transaction)?;
        transaction.inner.commit()?;
        Ok(result)
    }
}

/// Access to the named statements within a transaction.
pub struct Transaction<'c> {
    inner: rusqlite::Transaction<'c>,
}

impl Transaction<'_> {
    pub fn insert(&self, row: &InodeRow) -> Result<()> {
        self.inner
            .prepare_cached(Queries::INSERT_INODE)?
            .execute(named_params! {
                ":id": row.id.as_i64(),
                ":handle": row.handle.map(NodeHandle::as_i64),
                ":bind_handle": row.bind.as_ref().map(BindHandle::as_str),
                ":extension": row.extension,
                ":modified": row.modified,
                ":name": row.location.as_ref().map(|(_, name)| name.as_str()),
                ":parent_handle": row.location.as_ref().map(|(parent, _)| parent.as_i64()),
            })?;
        Ok(())
    }

    pub fn by_id(&self, id: InodeID) -> Result<Option<InodeRow>> {
        Ok(self
            .inner
            .prepare_cached(Queries::GET_INODE_BY_ID)?
            .query_row(named_params! {":id": id.as_i64()}, InodeRow::from_row)
            .optional()?)
    }

    pub fn by_handle(&self, handle: NodeHandle) -> Result<Option<InodeRow>> {
        Ok(self
            .inner
            .prepare_cached(Queries::GET_INODE_BY_HANDLE)?
            .query_row(
                named_params! {":handle": handle.as_i64()},
                InodeRow::from_row,
            )
            .optional()?)
    }

    pub fn by_bind_handle(&self, bind: &BindHandle) -> Result<Option<InodeRow>> {
        Ok(self
            .inner
            .prepare_cached(Queries::GET_INODE_BY_BIND_HANDLE)?
            .query_row(
                named_params! {":bind_handle": bind.as_str()},
                InodeRow::from_row,
            )
            .optional()?)
    }

    pub fn by_name(&self, parent: NodeHandle, name: &str) -> Result<Option<InodeRow>> {
        Ok(self
            .inner
            .prepare_cached(Queries::GET_INODE_BY_NAME_AND_PARENT_HANDLE)?
            .query_row(
                named_params! {":name": name, ":parent_handle": parent.as_i64()},
                InodeRow::from_row,
            )
            .optional()?)
    }

    pub fn children(&self, parent: NodeHandle) -> Result<Vec<InodeRow>> {
        let mut statement = self
            .inner
            .prepare_cached(Queries::GET_INODES_BY_PARENT_HANDLE)?;
        let rows = statement
            .query_map(
                named_params! {":parent_handle": parent.as_i64()},
                InodeRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn ids(&self) -> Result<Vec<InodeID>> {
        let mut statement = self.inner.prepare_cached(Queries::GET_INODE_IDS)?;
        let ids = statement
            .query_map([], |row| row.get::<_, i64>(0).map(InodeID::from_i64))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn set_location(&self, id: InodeID, parent: NodeHandle, name: &str) -> Result<bool> {
        let changed = self
            .inner
            .prepare_cached(Queries::SET_NAME_AND_PARENT_HANDLE)?
            .execute(named_params! {
                ":id": id.as_i64(),
                ":name": name,
                ":parent_handle": parent.as_i64(),
            })?;
        Ok(changed > 0)
    }

    /// Release the row's name so that it may be claimed by another.
    pub fn clear_location(&self, id: InodeID) -> Result<bool> {
        let changed = self
            .inner
            .prepare_cached(Queries::CLEAR_NAME_AND_PARENT_HANDLE)?
            .execute(named_params! {":id": id.as_i64()})?;
        Ok(changed > 0)
    }

    /// Associate a row with its node, clearing any bind handle.
    pub fn set_handle(&self, id: InodeID, handle: NodeHandle) -> Result<bool> {
        let changed = self
            .inner
            .prepare_cached(Queries::SET_HANDLE)?
            .execute(named_params! {":id": id.as_i64(), ":handle": handle.as_i64()})?;
        Ok(changed > 0)
    }

    pub fn set_bind_handle(&self, id: InodeID, bind: Option<&BindHandle>) -> Result<bool> {
        let changed = self
            .inner
            .prepare_cached(Queries::SET_BIND_HANDLE)?
            .execute(named_params! {
                ":id": id.as_i64(),
                ":bind_handle": bind.map(BindHandle::as_str),
            })?;
        Ok(changed > 0)
    }

    pub fn set_modified(&self, id: InodeID, modified: bool) -> Result<bool> {
        let changed = self
            .inner
            .prepare_cached(Queries::SET_MODIFIED)?
            .execute(named_params! {":id": id.as_i64(), ":modified": modified})?;
        Ok(changed > 0)
    }

    pub fn remove(&self, id: InodeID) -> Result<bool> {
        let changed = self
            .inner
            .prepare_cached(Queries::REMOVE_INODE_BY_ID)?
            .execute(named_params! {":id": id.as_i64()})?;
        Ok(changed > 0)
    }

    /// Allocate the next synthetic identity.
    ///
    /// The counter only ever moves forward so that identities are
    /// never reused, even after the rows that held them are gone.
    pub fn next_id(&self) -> Result<InodeID> {
        let next: i64 = self
            .inner
            .prepare_cached(Queries::GET_NEXT_INODE_ID)?
            .query_row([], |row| row.get(0))?;
        // the last two identities stay free so that mounts can
        // shift every identity past their reserved numbers
        if next >= i64::MAX - 2 {
            return Err(Error::internal("synthetic inode identities exhausted"));
        }
        self.inner
            .prepare_cached(Queries::SET_NEXT_INODE_ID)?
            .execute(named_params! {":next": next + 1})?;
        Ok(InodeID::synthetic(next as u64))
    }
}
