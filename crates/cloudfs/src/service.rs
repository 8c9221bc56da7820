// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The operations a platform binding needs, in one place.

use std::sync::Arc;

use bytes::Bytes;

use crate::client::Client;
use crate::database::Database;
use crate::file_cache::{FileCache, FileRef};
use crate::inode::{Attributes, InodeKind, InodeRef};
use crate::{Config, Error, InodeDB, InodeID, NodeEventQueue, Permissions, Result};

#[cfg(test)]
#[path = "./service_test.rs"]
mod service_test;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub id: InodeID,
    pub name: String,
    pub kind: InodeKind,
}

/// A mounted cloud tree, bundling the client with the inode index
/// and the content cache built over it.
pub struct Service {
    client: Arc<dyn Client>,
    inodes: InodeDB,
    files: Arc<FileCache>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("inodes", &self.inodes)
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Open the database and cache described by the configuration.
    pub fn new(client: Arc<dyn Client>, config: &Config) -> Result<Self> {
        let root = &config.storage.root;
        std::fs::create_dir_all(root)
            .map_err(|err| Error::Io("create storage directory", root.clone(), err))?;
        let database = Arc::new(Database::open(config.storage.database_path())?);
        let files = Arc::new(FileCache::new(
            config.storage.cache_root(),
            Arc::clone(&client),
            config.cache.clone(),
        )?);
        let inodes = InodeDB::new(
            Arc::clone(&client),
            database,
            Arc::clone(&files),
            config.inodes.clone(),
        );
        tracing::debug!(root = ?config.storage.root, "opened cloud service");
        Ok(Self {
            client,
            inodes,
            files,
        })
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn inodes(&self) -> &InodeDB {
        &self.inodes
    }

    pub fn files(&self) -> &Arc<FileCache> {
        &self.files
    }

    pub fn root(&self) -> Result<InodeRef> {
        self.inodes.root()
    }

    /// Resolve an identity, failing if it is unknown.
    pub fn get(&self, id: InodeID) -> Result<InodeRef> {
        self.inodes
            .get(id, false)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn directory(&self, id: InodeID) -> Result<InodeRef> {
        let directory = self.get(id)?;
        if !directory.is_directory() {
            return Err(Error::NotDirectory(id.to_string()));
        }
        Ok(directory)
    }

    pub fn lookup(&self, parent: InodeID, name: &str) -> Result<InodeRef> {
        self.directory(parent)?
            .child(name)?
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    pub fn getattr(&self, id: InodeID) -> Result<Attributes> {
        self.get(id)?.attributes()
    }

    pub fn readdir(&self, id: InodeID) -> Result<Vec<DirEntry>> {
        let entries = self
            .directory(id)?
            .children()?
            .into_iter()
            .map(|child| DirEntry {
                id: child.id(),
                name: child.name(),
                kind: child.kind(),
            })
            .collect();
        Ok(entries)
    }

    /// Open a file, sharing its context with any other opener.
    pub fn open(&self, id: InodeID, write: bool) -> Result<FileRef> {
        let file = self.get(id)?;
        if file.is_directory() {
            return Err(Error::IsDirectory(id.to_string()));
        }
        if write && file.permissions() < Permissions::ReadWrite {
            return Err(Error::ReadOnly(id.to_string()));
        }
        self.files
            .context(&file, false)?
            .ok_or_else(|| Error::internal(format!("no context created for {id}")))
    }

    /// Create an empty file and open it.
    pub fn create(&self, parent: InodeID, name: &str) -> Result<(InodeRef, FileRef)> {
        let file = self.directory(parent)?.make_file(name)?;
        let opened = self
            .files
            .context(&file, false)?
            .ok_or_else(|| Error::internal(format!("no context created for {}", file.id())))?;
        Ok((file, opened))
    }

    pub async fn read(&self, file: &FileRef, offset: u64, length: u64) -> Result<Bytes> {
        file.read(offset, length).await
    }

    pub async fn write(&self, file: &FileRef, offset: u64, data: &[u8]) -> Result<u64> {
        file.write(offset, data).await
    }

    /// Resize a file, whether or not it is open.
    pub async fn truncate(&self, id: InodeID, size: u64) -> Result<()> {
        let file = self.open(id, true)?;
        file.truncate(size).await?;
        self.release(file)
    }

    /// Close one opener of a file, uploading any modified content.
    pub fn release(&self, file: FileRef) -> Result<()> {
        if file.was_modified() {
            file.flush()?;
        }
        Ok(())
    }

    pub fn fsync(&self, file: &FileRef) -> Result<()> {
        file.flush()
    }

    pub fn mkdir(&self, parent: InodeID, name: &str) -> Result<InodeRef> {
        self.directory(parent)?.make_directory(name)
    }

    pub fn rmdir(&self, parent: InodeID, name: &str) -> Result<()> {
        let directory = self.lookup(parent, name)?;
        if !directory.is_directory() {
            return Err(Error::NotDirectory(name.to_owned()));
        }
        directory.unlink()
    }

    pub fn unlink(&self, parent: InodeID, name: &str) -> Result<()> {
        let file = self.lookup(parent, name)?;
        if file.is_directory() {
            return Err(Error::IsDirectory(name.to_owned()));
        }
        file.unlink()
    }

    /// Move `parent/name` to `new_parent/new_name`, replacing
    /// whatever is already there.
    pub fn rename(
        &self,
        parent: InodeID,
        name: &str,
        new_parent: InodeID,
        new_name: &str,
    ) -> Result<()> {
        let source = self.lookup(parent, name)?;
        let target = self.directory(new_parent)?;
        match target.child(new_name)? {
            Some(existing) => source.replace(&existing, true),
            None => source.move_to(new_name, &target),
        }
    }

    /// Apply server-pushed changes.
    pub fn updated(&self, events: &mut NodeEventQueue) {
        self.inodes.updated(events)
    }

    /// Drop stale rows and orphaned cache files.
    pub fn current(&self) -> Result<usize> {
        self.inodes.current()
    }

    /// Cancel every open file then release every inode, each
    /// bounded by its configured timeout.
    pub fn shutdown(&self) {
        tracing::debug!("shutting down cloud service");
        self.files.cancel();
        self.inodes.clear();
    }
}
