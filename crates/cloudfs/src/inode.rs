// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Directory and file inodes.
//!
//! Inodes are created and owned by the [`InodeDB`]. Everyone else
//! holds an [`InodeRef`], a counted handle that keeps the inode
//! resident and that carries the operations which need to consult
//! or update the index.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};

use crate::database::InodeRow;
use crate::{Error, InodeDB, InodeID, NodeHandle, NodeInfo, Permissions, Result};

/// The longest name, in bytes, that a directory entry may have.
pub const MAX_NAME_LENGTH: usize = 255;

/// The size reported for every directory.
pub const DIRECTORY_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InodeKind {
    Directory,
    File,
}

/// What `getattr` reports about an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub id: InodeID,
    pub kind: InodeKind,
    pub size: u64,
    pub modified: SystemTime,
    pub permissions: Permissions,
}

#[derive(Debug, Clone)]
pub(crate) struct InodeState {
    pub name: String,
    /// Absent only for the root directory.
    pub parent: Option<NodeHandle>,
    /// Always present for directories, absent for files that
    /// have never been uploaded.
    pub handle: Option<NodeHandle>,
    pub modified: SystemTime,
    pub permissions: Permissions,
    /// Size of the content in the cloud.
    pub size: u64,
    /// Appended to the cache file's name.
    pub extension: String,
    /// Local content differs from what's in the cloud.
    pub dirty: bool,
    /// A local move that the server has not yet echoed back.
    pub unacknowledged: Option<(NodeHandle, String)>,
}

pub struct Inode {
    id: InodeID,
    kind: InodeKind,
    removed: AtomicBool,
    pub(crate) state: Mutex<InodeState>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("removed", &self.removed())
            .finish_non_exhaustive()
    }
}

impl Inode {
    pub(crate) fn new(id: InodeID, kind: InodeKind, state: InodeState) -> Self {
        Self {
            id,
            kind,
            removed: AtomicBool::new(false),
            state: Mutex::new(state),
        }
    }

    /// Describe a node that was found in the cloud.
    pub(crate) fn from_info(info: &NodeInfo) -> Self {
        let kind = match info.is_directory {
            true => InodeKind::Directory,
            false => InodeKind::File,
        };
        Self::new(
            InodeID::from_handle(info.handle),
            kind,
            InodeState {
                name: info.name.clone(),
                parent: info.parent,
                handle: Some(info.handle),
                modified: info.modified,
                permissions: info.permissions,
                size: info.size,
                extension: extension_of(&info.name),
                dirty: false,
                unacknowledged: None,
            },
        )
    }

    /// Describe a file from its persisted row, along with what
    /// the cloud knows about it if it has been uploaded.
    pub(crate) fn from_row(row: &InodeRow, info: Option<&NodeInfo>) -> Self {
        let (parent, name) = match (&row.location, info) {
            (Some((parent, name)), _) => (Some(*parent), name.clone()),
            (None, Some(info)) => (info.parent, info.name.clone()),
            (None, None) => (None, String::new()),
        };
        let inode = Self::new(
            row.id,
            InodeKind::File,
            InodeState {
                name,
                parent,
                handle: row.handle,
                modified: info.map(|i| i.modified).unwrap_or_else(SystemTime::now),
                permissions: info.map(|i| i.permissions).unwrap_or(Permissions::Full),
                size: info.map(|i| i.size).unwrap_or_default(),
                extension: row.extension.clone(),
                dirty: row.modified,
                unacknowledged: None,
            },
        );
        if row.location.is_none() {
            inode.set_removed_flag(true);
        }
        inode
    }

    pub fn id(&self) -> InodeID {
        self.id
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == InodeKind::File
    }

    /// True once this inode has been unlinked from its parent.
    ///
    /// Removed inodes remain addressable by id until the last
    /// reference is released, but are never found by name.
    pub fn removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Only ever changed while the index is locked.
    pub(crate) fn set_removed_flag(&self, removed: bool) {
        self.removed.store(removed, Ordering::Release);
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn parent(&self) -> Option<NodeHandle> {
        self.state.lock().parent
    }

    /// The parent and name this inode is currently linked as.
    pub fn location(&self) -> Option<(NodeHandle, String)> {
        let state = self.state.lock();
        state.parent.map(|p| (p, state.name.clone()))
    }

    pub fn handle(&self) -> Option<NodeHandle> {
        self.state.lock().handle
    }

    pub fn permissions(&self) -> Permissions {
        self.state.lock().permissions
    }

    pub fn extension(&self) -> String {
        self.state.lock().extension.clone()
    }

    /// True if the local content has not yet been uploaded.
    pub fn was_modified(&self) -> bool {
        self.state.lock().dirty
    }

    /// The handle of this directory, for use as a parent.
    pub(crate) fn directory_handle(&self) -> Result<NodeHandle> {
        if !self.is_directory() {
            return Err(Error::NotDirectory(self.id.to_string()));
        }
        self.handle()
            .ok_or_else(|| Error::internal(format!("directory {} has no handle", self.id)))
    }
}

/// A counted reference to a resident inode.
///
/// While any reference exists the inode remains in memory. When
/// the last reference to a removed inode is dropped, the inode is
/// destroyed along with its persisted row and cached content.
pub struct InodeRef {
    inode: Arc<Inode>,
    db: InodeDB,
}

impl std::fmt::Debug for InodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inode.fmt(f)
    }
}

impl Deref for InodeRef {
    type Target = Inode;

    fn deref(&self) -> &Self::Target {
        &self.inode
    }
}

impl Clone for InodeRef {
    fn clone(&self) -> Self {
        self.db.add_reference(&self.inode);
        Self {
            inode: Arc::clone(&self.inode),
            db: self.db.clone(),
        }
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        self.db.release(&self.inode);
    }
}

impl InodeRef {
    /// Wrap an inode whose reference has already been counted.
    pub(crate) fn adopt(inode: Arc<Inode>, db: InodeDB) -> Self {
        Self { inode, db }
    }

    pub(crate) fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn db(&self) -> &InodeDB {
        &self.db
    }

    /// Number of live references to this inode.
    pub fn references(&self) -> usize {
        self.db.references(self.id())
    }

    pub fn attributes(&self) -> Result<Attributes> {
        let state = self.state.lock().clone();
        let (size, modified) = match self.kind() {
            InodeKind::Directory => (DIRECTORY_SIZE, state.modified),
            InodeKind::File if state.dirty || state.handle.is_none() => {
                let files = self.db.files();
                match files.stat(&state.extension, self.id())? {
                    Some((size, modified)) => (size, modified),
                    None => (state.size, state.modified),
                }
            }
            InodeKind::File => (state.size, state.modified),
        };
        Ok(Attributes {
            id: self.id(),
            kind: self.kind(),
            size,
            modified,
            permissions: state.permissions,
        })
    }

    /// Apply a fresh description of this inode from the cloud.
    ///
    /// A location that disagrees with a pending local move is
    /// ignored, one that matches acknowledges the move.
    pub fn info(&self, info: &NodeInfo) -> Result<()> {
        if let Some(parent) = info.parent {
            let location = (parent, info.name.clone());
            let relocate = {
                let mut state = self.state.lock();
                match &state.unacknowledged {
                    Some(pending) if *pending == location => {
                        tracing::trace!(id = %self.id(), "move acknowledged");
                        state.unacknowledged = None;
                        false
                    }
                    Some(_) => {
                        tracing::debug!(id = %self.id(), "ignoring location, local move pending");
                        false
                    }
                    None => state.parent.map(|p| (p, state.name.clone())) != Some(location),
                }
            };
            if relocate {
                self.moved(&info.name, parent)?;
            }
        }
        let mut state = self.state.lock();
        state.modified = info.modified;
        state.permissions = info.permissions;
        if !state.dirty {
            state.size = info.size;
        }
        Ok(())
    }

    /// Record that this inode was moved by someone else.
    ///
    /// Removed inodes are not indexed by name so only their
    /// bookkeeping is updated.
    pub fn moved(&self, name: &str, parent: NodeHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.parent == Some(parent) && state.name == name {
            return Ok(());
        }
        let removed = self.removed();
        if !removed {
            let from = state.parent.map(|p| (p, state.name.clone()));
            self.db.relocate(self.id(), from, parent, name)?;
        }
        state.parent = Some(parent);
        state.name = name.to_owned();
        drop(state);
        if !removed {
            self.db
                .database()
                .transaction(|tx| tx.set_location(self.id(), parent, name))?;
        }
        Ok(())
    }

    /// Mark this inode as removed (or restore it).
    ///
    /// Removing releases the inode's name, restoring reclaims it
    /// and fails if the name has since been taken.
    pub fn set_removed(&self, removed: bool) -> Result<()> {
        let state = self.state.lock();
        self.db.set_removed(self, &state, removed)
    }

    /// Move this inode to `name` within `parent`.
    pub fn move_to(&self, name: &str, parent: &InodeRef) -> Result<()> {
        self.db.move_inode(self, name, parent)
    }

    /// Take the place of `target`, which is removed.
    pub fn replace(&self, target: &InodeRef, replace_directories: bool) -> Result<()> {
        self.db.replace_inode(self, target, replace_directories)
    }

    /// Remove this inode from its parent.
    pub fn unlink(&self) -> Result<()> {
        self.db.unlink_inode(self)
    }

    /// The path of this inode relative to the given ancestor.
    pub fn path(&self, ancestor: InodeID) -> Result<String> {
        let mut components = Vec::new();
        let mut current = self.clone();
        loop {
            if current.id() == ancestor {
                components.reverse();
                return Ok(components.join("/"));
            }
            let Some((parent, name)) = current.location() else {
                return Err(Error::NotFound(format!(
                    "{} is not an ancestor of {}",
                    ancestor,
                    self.id()
                )));
            };
            if current.removed() {
                return Err(Error::NotFound(self.id().to_string()));
            }
            components.push(name);
            current = self
                .db
                .get_by_handle(parent, false)?
                .ok_or_else(|| Error::NotFound(format!("parent {parent} of {}", current.id())))?;
        }
    }

    pub fn children(&self) -> Result<Vec<InodeRef>> {
        self.db.children(self)
    }

    pub fn child(&self, name: &str) -> Result<Option<InodeRef>> {
        self.db.child(self, name)
    }

    pub fn has_child(&self, name: &str) -> Result<bool> {
        Ok(self.child(name)?.is_some())
    }

    pub fn has_children(&self) -> Result<bool> {
        self.db.has_children(self)
    }

    pub fn make_directory(&self, name: &str) -> Result<InodeRef> {
        self.db.make_directory(self, name)
    }

    pub fn make_file(&self, name: &str) -> Result<InodeRef> {
        self.db.make_file(self, name)
    }

    /// Flag whether this file has local content awaiting upload.
    pub fn set_modified(&self, modified: bool) -> Result<()> {
        self.db.set_modified(self, modified)
    }

    pub fn touch(&self, when: SystemTime) {
        self.state.lock().modified = when;
    }
}

/// Reject names that cannot be stored in a directory.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(Error::InvalidName(name.to_owned()));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::NameTooLong(name.to_owned()));
    }
    Ok(())
}

/// The cache file extension for a name, including the leading dot.
pub(crate) fn extension_of(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default()
}

/// Exclusive access to several inodes at once.
///
/// Locks are always taken in order of inode id so that two
/// operations over overlapping sets of inodes cannot deadlock.
pub(crate) struct LockSet<'a> {
    guards: Vec<(InodeID, MutexGuard<'a, InodeState>)>,
}

impl<'a> LockSet<'a> {
    pub fn lock(inodes: &[&'a Inode]) -> Self {
        let mut inodes = inodes.to_vec();
        inodes.sort_by_key(|i| i.id());
        inodes.dedup_by_key(|i| i.id());
        Self {
            guards: inodes
                .into_iter()
                .map(|i| (i.id(), i.state.lock()))
                .collect(),
        }
    }

    pub fn get(&self, id: InodeID) -> Option<&InodeState> {
        self.guards
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, g)| &**g)
    }

    pub fn get_mut(&mut self, id: InodeID) -> Option<&mut InodeState> {
        self.guards
            .iter_mut()
            .find(|(i, _)| *i == id)
            .map(|(_, g)| &mut **g)
    }
}
