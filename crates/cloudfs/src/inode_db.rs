// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The identity and directory index of every known inode.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::client::Client;
use crate::database::{Database, InodeRow};
use crate::file_cache::FileCache;
use crate::inode::{Inode, InodeRef, InodeState, LockSet, extension_of, validate_name};
use crate::{BindHandle, Error, InodeID, NodeHandle, NodeInfo, Permissions, Result, config};

#[cfg(test)]
#[path = "./inode_db_test.rs"]
mod inode_db_test;

/// The key under which an inode is linked into its parent.
type NameKey = (NodeHandle, String);

struct Entry {
    inode: Arc<Inode>,
    references: usize,
    /// When the last reference was released, if it has not been
    /// referenced since.
    idle_since: Option<Instant>,
}

impl Entry {
    fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            references: 1,
            idle_since: None,
        }
    }
}

#[derive(Default)]
struct Index {
    by_id: HashMap<InodeID, Entry>,
    by_handle: HashMap<NodeHandle, InodeID>,
    by_bind: HashMap<BindHandle, InodeID>,
    by_name: HashMap<NameKey, InodeID>,
    /// Unreferenced inodes, oldest first.
    idle: BTreeSet<(Instant, InodeID)>,
}

impl Index {
    /// Claim a name for the given inode.
    fn claim(&mut self, key: NameKey, id: InodeID) -> Result<()> {
        match self.by_name.get(&key) {
            Some(existing) if *existing == id => Ok(()),
            Some(existing) => Err(Error::internal(format!(
                "{}/{} claimed by {id} while held by {existing}",
                key.0, key.1
            ))),
            None => {
                self.by_name.insert(key, id);
                Ok(())
            }
        }
    }

    /// Release a name, if it is held by the given inode.
    fn release(&mut self, key: &NameKey, id: InodeID) {
        if self.by_name.get(key) == Some(&id) {
            self.by_name.remove(key);
        }
    }

    fn is_named(&self, id: InodeID, parent: NodeHandle, name: &str) -> bool {
        self.by_name.get(&(parent, name.to_owned())) == Some(&id)
    }

    /// Drop every index entry that refers to the given inode.
    fn forget(&mut self, inode: &Inode) {
        let id = inode.id();
        if let Some(Entry {
            idle_since: Some(since),
            ..
        }) = self.by_id.remove(&id)
        {
            self.idle.remove(&(since, id));
        }
        self.by_handle.retain(|_, v| *v != id);
        self.by_bind.retain(|_, v| *v != id);
        self.by_name.retain(|_, v| *v != id);
    }

    /// Take a new reference to a resident inode.
    fn acquire(&mut self, id: InodeID) -> Option<Arc<Inode>> {
        let entry = self.by_id.get_mut(&id)?;
        entry.references += 1;
        if let Some(since) = entry.idle_since.take() {
            self.idle.remove(&(since, id));
        }
        Some(Arc::clone(&entry.inode))
    }

    /// Drop an unreferenced inode that holds nothing the database
    /// and the cloud cannot restore.
    ///
    /// Returns false, leaving the inode in place, when it is still
    /// referenced, removed, carries local changes or its state is
    /// currently locked.
    fn evict(&mut self, id: InodeID) -> bool {
        let Some(entry) = self.by_id.get(&id) else {
            return false;
        };
        if entry.references > 0 || entry.inode.removed() {
            return false;
        }
        let inode = Arc::clone(&entry.inode);
        // the index lock is held, so inode state may only be tried
        let Some(state) = inode.state.try_lock() else {
            return false;
        };
        let Some(handle) = state.handle else {
            return false;
        };
        if state.dirty || state.unacknowledged.is_some() {
            return false;
        }
        if let Some(parent) = state.parent {
            self.release(&(parent, state.name.clone()), id);
        }
        if self.by_handle.get(&handle) == Some(&id) {
            self.by_handle.remove(&handle);
        }
        self.by_bind.retain(|_, v| *v != id);
        self.by_id.remove(&id);
        true
    }
}

struct Inner {
    client: Arc<dyn Client>,
    database: Arc<Database>,
    files: Arc<FileCache>,
    config: config::Inodes,
    index: Mutex<Index>,
    drained: Condvar,
    discard: AtomicBool,
}

/// Allocates and resolves inode identities and owns every
/// resident [`Inode`].
///
/// Inodes are materialized on demand from memory, the database or
/// the cloud, in that order, and stay resident until they are
/// removed and released, trimmed once idle or the index is cleared.
#[derive(Clone)]
pub struct InodeDB {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InodeDB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeDB")
            .field("database", &self.inner.database)
            .finish_non_exhaustive()
    }
}

impl InodeDB {
    pub fn new(
        client: Arc<dyn Client>,
        database: Arc<Database>,
        files: Arc<FileCache>,
        config: config::Inodes,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                database,
                files,
                config,
                index: Mutex::new(Index::default()),
                drained: Condvar::new(),
                discard: AtomicBool::new(false),
            }),
        }
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.inner.client
    }

    pub fn database(&self) -> &Database {
        &self.inner.database
    }

    pub fn files(&self) -> &Arc<FileCache> {
        &self.inner.files
    }

    /// While set, batches of server events are dropped.
    pub fn discard(&self, discard: bool) {
        self.inner.discard.store(discard, Ordering::Release);
    }

    pub fn discarding(&self) -> bool {
        self.inner.discard.load(Ordering::Acquire)
    }

    pub(crate) fn max_attempts(&self) -> usize {
        self.inner.config.max_move_attempts.max(1)
    }

    /// The root directory of the cloud tree.
    pub fn root(&self) -> Result<InodeRef> {
        let handle = self.client().root();
        self.get_by_handle(handle, false)?
            .ok_or_else(|| Error::NotFound(format!("root node {handle}")))
    }

    /// Resolve an inode by identity.
    ///
    /// Unless `in_memory_only`, an inode that is not resident is
    /// loaded from the database or, failing that, the cloud.
    pub fn get(&self, id: InodeID, in_memory_only: bool) -> Result<Option<InodeRef>> {
        if let Some(inode) = self.resident(id) {
            return Ok(Some(inode));
        }
        if in_memory_only {
            return Ok(None);
        }
        if let Some(row) = self.database().transaction(|tx| tx.by_id(id))? {
            return self.from_row(row).map(Some);
        }
        let Some(handle) = id.handle() else {
            return Ok(None);
        };
        let Some(info) = self.client().get(handle) else {
            return Ok(None);
        };
        // the node may belong to a file whose identity predates it
        Ok(self.from_info(&info)?.filter(|inode| inode.id() == id))
    }

    /// Resolve an inode by the handle of its cloud node.
    pub fn get_by_handle(
        &self,
        handle: NodeHandle,
        in_memory_only: bool,
    ) -> Result<Option<InodeRef>> {
        {
            let mut index = self.inner.index.lock();
            if let Some(id) = index.by_handle.get(&handle).copied() {
                if let Some(inode) = self.acquire(&mut index, id) {
                    return Ok(Some(inode));
                }
            }
        }
        if in_memory_only {
            return Ok(None);
        }
        if let Some(row) = self.database().transaction(|tx| tx.by_handle(handle))? {
            return self.from_row(row).map(Some);
        }
        match self.client().get(handle) {
            Some(info) => self.from_info(&info),
            None => Ok(None),
        }
    }

    /// Resolve a relative path, one component at a time.
    pub fn lookup(&self, path: &str, parent: InodeID) -> Result<InodeRef> {
        let mut current = self
            .get(parent, false)?
            .ok_or_else(|| Error::NotFound(parent.to_string()))?;
        for component in path.split('/') {
            match component {
                "" | "." => continue,
                ".." => {
                    let parent = current
                        .parent()
                        .ok_or_else(|| Error::NotFound(format!("parent of {}", current.id())))?;
                    current = self
                        .get_by_handle(parent, false)?
                        .ok_or_else(|| Error::NotFound(parent.to_string()))?;
                }
                name => {
                    current = self
                        .child(&current, name)?
                        .ok_or_else(|| Error::NotFound(path.to_owned()))?;
                }
            }
        }
        Ok(current)
    }

    /// True if the identity is known to memory or the database.
    pub fn exists(&self, id: InodeID) -> Result<bool> {
        if self.inner.index.lock().by_id.contains_key(&id) {
            return Ok(true);
        }
        Ok(self.database().transaction(|tx| tx.by_id(id))?.is_some())
    }

    /// True if the file has local content awaiting upload.
    pub fn modified(&self, id: InodeID) -> Result<bool> {
        if let Some(inode) = self.get(id, true)? {
            return Ok(inode.was_modified());
        }
        Ok(self
            .database()
            .transaction(|tx| tx.by_id(id))?
            .is_some_and(|row| row.modified))
    }

    /// Every child of a directory, merging local-only files with
    /// the cloud listing.
    pub fn children(&self, directory: &InodeRef) -> Result<Vec<InodeRef>> {
        let parent = directory.directory_handle()?;
        let mut children = Vec::new();
        let mut seen = HashSet::new();
        // local state takes precedence over the cloud, so rows are
        // materialized first and claim their names
        for row in self.database().transaction(|tx| tx.children(parent))? {
            if row.handle.is_some() && !row.modified {
                continue;
            }
            let child = self.from_row(row)?;
            if self.is_named(&child, parent) && seen.insert(child.id()) {
                children.push(child);
            }
        }
        for info in self.client().children(parent)? {
            let Some(child) = self.from_info(&info)? else {
                continue;
            };
            if self.is_named(&child, parent) && seen.insert(child.id()) {
                children.push(child);
            }
        }
        Ok(children)
    }

    /// The child of a directory with the given name.
    pub fn child(&self, directory: &InodeRef, name: &str) -> Result<Option<InodeRef>> {
        self.child_of(directory.directory_handle()?, name)
    }

    pub fn has_children(&self, directory: &InodeRef) -> Result<bool> {
        self.has_children_of(directory.directory_handle()?)
    }

    fn has_children_of(&self, parent: NodeHandle) -> Result<bool> {
        if !self.database().transaction(|tx| tx.children(parent))?.is_empty() {
            return Ok(true);
        }
        self.client().has_children(parent)
    }

    /// Never locks the state of any inode, so it may be called
    /// while holding inode locks.
    fn child_of(&self, parent: NodeHandle, name: &str) -> Result<Option<InodeRef>> {
        {
            let mut index = self.inner.index.lock();
            if let Some(id) = index.by_name.get(&(parent, name.to_owned())).copied() {
                if let Some(inode) = self.acquire(&mut index, id) {
                    return Ok(Some(inode));
                }
            }
        }
        if let Some(row) = self.database().transaction(|tx| tx.by_name(parent, name))? {
            let inode = self.from_row(row)?;
            if self.is_named_as(&inode, parent, name) {
                return Ok(Some(inode));
            }
        }
        if let Some(info) = self.client().child(parent, name) {
            if let Some(inode) = self.from_info(&info)? {
                if self.is_named_as(&inode, parent, name) {
                    return Ok(Some(inode));
                }
            }
        }
        Ok(None)
    }

    fn is_named(&self, inode: &InodeRef, parent: NodeHandle) -> bool {
        match inode.location() {
            Some((p, name)) if p == parent => self.is_named_as(inode, parent, &name),
            _ => false,
        }
    }

    fn is_named_as(&self, inode: &InodeRef, parent: NodeHandle, name: &str) -> bool {
        self.inner.index.lock().is_named(inode.id(), parent, name)
    }

    /// Create a directory, in the cloud first.
    pub fn make_directory(&self, parent: &InodeRef, name: &str) -> Result<InodeRef> {
        validate_name(name)?;
        let handle = parent.directory_handle()?;
        let state = parent.state.lock();
        Self::check_writable(parent, &state)?;
        if self.child_of(handle, name)?.is_some() {
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        let info = self.client().make_directory(name, handle)?;
        drop(state);
        tracing::debug!(%handle, name, "created directory {}", info.handle);
        self.from_info(&info)?
            .ok_or_else(|| Error::NotFound(format!("new directory {}", info.handle)))
    }

    /// Create an empty, local-only file.
    pub fn make_file(&self, parent: &InodeRef, name: &str) -> Result<InodeRef> {
        validate_name(name)?;
        let handle = parent.directory_handle()?;
        let state = parent.state.lock();
        Self::check_writable(parent, &state)?;
        if self.child_of(handle, name)?.is_some() {
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        let extension = extension_of(name);
        let file = self.add_file(handle, name, &extension)?;
        drop(state);
        tracing::debug!(%handle, name, "created file {}", file.id());
        Ok(file)
    }

    /// Allocate a synthetic identity for a new file, persist it and
    /// create its (empty) cache file.
    fn add_file(&self, parent: NodeHandle, name: &str, extension: &str) -> Result<InodeRef> {
        let row = self.database().transaction(|tx| {
            let row = InodeRow {
                id: tx.next_id()?,
                handle: None,
                bind: None,
                extension: extension.to_owned(),
                modified: true,
                location: Some((parent, name.to_owned())),
            };
            tx.insert(&row)?;
            Ok(row)
        })?;
        if let Err(err) = self.files().create(extension, row.id, false, true) {
            self.database().transaction(|tx| tx.remove(row.id))?;
            return Err(err);
        }
        let mut index = self.inner.index.lock();
        self.install(&mut index, Inode::from_row(&row, None), None)
    }

    fn check_writable(parent: &Inode, state: &InodeState) -> Result<()> {
        if parent.removed() {
            return Err(Error::NotFound(parent.id().to_string()));
        }
        if state.permissions != Permissions::Full {
            return Err(Error::ReadOnly(parent.id().to_string()));
        }
        Ok(())
    }

    /// Record that an inode now holds the given name.
    pub fn child_added(&self, inode: &Inode, parent: NodeHandle, name: &str) -> Result<()> {
        self.inner
            .index
            .lock()
            .claim((parent, name.to_owned()), inode.id())
    }

    /// Record that an inode no longer holds the given name.
    pub fn child_removed(&self, inode: &Inode, parent: NodeHandle, name: &str) -> Result<()> {
        let mut index = self.inner.index.lock();
        let key = (parent, name.to_owned());
        match index.by_name.get(&key) {
            Some(id) if *id == inode.id() => {
                index.by_name.remove(&key);
                Ok(())
            }
            other => Err(Error::internal(format!(
                "{} released {parent}/{name} held by {other:?}",
                inode.id()
            ))),
        }
    }

    /// Move an inode's name claim from one key to another.
    pub(crate) fn relocate(
        &self,
        id: InodeID,
        from: Option<NameKey>,
        parent: NodeHandle,
        name: &str,
    ) -> Result<()> {
        let mut index = self.inner.index.lock();
        let key = (parent, name.to_owned());
        if let Some(other) = index.by_name.get(&key) {
            if *other != id {
                return Err(Error::AlreadyExists(name.to_owned()));
            }
        }
        if let Some(from) = from {
            index.release(&from, id);
        }
        index.claim(key, id)
    }

    pub(crate) fn set_removed(
        &self,
        inode: &Inode,
        state: &InodeState,
        removed: bool,
    ) -> Result<()> {
        let key = state.parent.map(|p| (p, state.name.clone()));
        {
            let mut index = self.inner.index.lock();
            if inode.removed() == removed {
                return Ok(());
            }
            if let Some(key) = &key {
                if removed {
                    index.release(key, inode.id());
                } else {
                    match index.by_name.get(key) {
                        Some(other) if *other != inode.id() => {
                            return Err(Error::AlreadyExists(key.1.clone()));
                        }
                        _ => index.claim(key.clone(), inode.id())?,
                    }
                }
            }
            inode.set_removed_flag(removed);
        }
        tracing::trace!(id = %inode.id(), removed, "updated removed flag");
        self.database().transaction(|tx| match (&key, removed) {
            (Some((parent, name)), false) => tx.set_location(inode.id(), *parent, name),
            _ => tx.clear_location(inode.id()),
        })?;
        Ok(())
    }

    /// See [`InodeRef::move_to`].
    pub fn move_inode(&self, source: &InodeRef, name: &str, target: &InodeRef) -> Result<()> {
        validate_name(name)?;
        let target_handle = target.directory_handle()?;
        if source.is_directory() {
            self.ensure_not_within(source, target)?;
        }
        for _ in 0..self.max_attempts() {
            let Some(parent_handle) = source.parent() else {
                return Err(Error::ReadOnly("cannot move the root directory".into()));
            };
            let parent = self
                .get_by_handle(parent_handle, false)?
                .ok_or_else(|| Error::NotFound(parent_handle.to_string()))?;
            let mut locks = LockSet::lock(&[source.inode(), parent.inode(), target.inode()]);
            let Some(current) = locks.get(source.id()).cloned() else {
                return Err(Error::internal("source inode was not locked"));
            };
            if current.parent != Some(parent_handle) {
                tracing::trace!(id = %source.id(), "parent changed during move, retrying");
                continue;
            }
            if source.removed() || target.removed() || parent.removed() {
                return Err(Error::NotFound(source.id().to_string()));
            }
            if parent_handle == target_handle && current.name == name {
                return Ok(());
            }
            for directory in [parent.id(), target.id()] {
                let permissions = locks.get(directory).map(|s| s.permissions);
                if permissions != Some(Permissions::Full) {
                    return Err(Error::ReadOnly(directory.to_string()));
                }
            }
            if let Some(occupant) = self.child_of(target_handle, name)? {
                if occupant.id() != source.id() {
                    return Err(Error::AlreadyExists(name.to_owned()));
                }
            }
            if let Some(handle) = current.handle {
                self.client().move_node(handle, name, target_handle)?;
            }
            self.relocate(
                source.id(),
                Some((parent_handle, current.name.clone())),
                target_handle,
                name,
            )?;
            if let Some(state) = locks.get_mut(source.id()) {
                state.parent = Some(target_handle);
                state.name = name.to_owned();
                if state.handle.is_some() {
                    state.unacknowledged = Some((target_handle, name.to_owned()));
                }
            }
            drop(locks);
            self.database()
                .transaction(|tx| tx.set_location(source.id(), target_handle, name))?;
            tracing::debug!(id = %source.id(), "moved to {target_handle}/{name}");
            return Ok(());
        }
        Err(Error::TooMuchContention("move", source.id()))
    }

    /// Refuse to move a directory beneath itself.
    fn ensure_not_within(&self, directory: &InodeRef, target: &InodeRef) -> Result<()> {
        let mut current = Some(target.clone());
        while let Some(inode) = current {
            if inode.id() == directory.id() {
                return Err(Error::InvalidName(format!(
                    "cannot move {} beneath itself",
                    directory.id()
                )));
            }
            current = match inode.parent() {
                Some(parent) => self.get_by_handle(parent, false)?,
                None => None,
            };
        }
        Ok(())
    }

    /// See [`InodeRef::replace`].
    pub fn replace_inode(
        &self,
        source: &InodeRef,
        target: &InodeRef,
        replace_directories: bool,
    ) -> Result<()> {
        if source.id() == target.id() {
            return Ok(());
        }
        match (source.is_directory(), target.is_directory()) {
            (false, true) => return Err(Error::IsDirectory(target.id().to_string())),
            (true, false) => return Err(Error::NotDirectory(target.id().to_string())),
            (true, true) if !replace_directories => {
                return Err(Error::AlreadyExists(target.id().to_string()));
            }
            _ => {}
        }
        if source.is_directory() {
            self.ensure_not_within(source, target)?;
        }
        for _ in 0..self.max_attempts() {
            let (Some(source_parent), Some(target_parent)) = (source.parent(), target.parent())
            else {
                return Err(Error::ReadOnly("cannot replace the root directory".into()));
            };
            let from = self
                .get_by_handle(source_parent, false)?
                .ok_or_else(|| Error::NotFound(source_parent.to_string()))?;
            let to = self
                .get_by_handle(target_parent, false)?
                .ok_or_else(|| Error::NotFound(target_parent.to_string()))?;
            let mut locks = LockSet::lock(&[
                source.inode(),
                from.inode(),
                target.inode(),
                to.inode(),
            ]);
            let (Some(current), Some(victim)) = (
                locks.get(source.id()).cloned(),
                locks.get(target.id()).cloned(),
            ) else {
                return Err(Error::internal("replace inodes were not locked"));
            };
            if current.parent != Some(source_parent) || victim.parent != Some(target_parent) {
                tracing::trace!(id = %source.id(), "parent changed during replace, retrying");
                continue;
            }
            if source.removed() || target.removed() {
                return Err(Error::NotFound(target.id().to_string()));
            }
            for directory in [from.id(), to.id()] {
                let permissions = locks.get(directory).map(|s| s.permissions);
                if permissions != Some(Permissions::Full) {
                    return Err(Error::ReadOnly(directory.to_string()));
                }
            }
            if let Some(handle) = victim.handle.filter(|_| target.is_directory()) {
                if self.has_children_of(handle)? {
                    return Err(Error::NotEmpty(target.id().to_string()));
                }
            }
            if let Some(handle) = victim.handle {
                self.client().remove(handle)?;
            }
            if let Some(handle) = current.handle {
                self.client().move_node(handle, &victim.name, target_parent)?;
            }
            {
                let mut index = self.inner.index.lock();
                index.release(&(target_parent, victim.name.clone()), target.id());
                target.set_removed_flag(true);
            }
            self.relocate(
                source.id(),
                Some((source_parent, current.name.clone())),
                target_parent,
                &victim.name,
            )?;
            if let Some(state) = locks.get_mut(source.id()) {
                state.parent = Some(target_parent);
                state.name = victim.name.clone();
                if state.handle.is_some() {
                    state.unacknowledged = Some((target_parent, victim.name.clone()));
                }
            }
            drop(locks);
            self.database().transaction(|tx| {
                tx.clear_location(target.id())?;
                tx.set_location(source.id(), target_parent, &victim.name)
            })?;
            tracing::debug!(id = %source.id(), "replaced {}", target.id());
            return Ok(());
        }
        Err(Error::TooMuchContention("replace", source.id()))
    }

    /// See [`InodeRef::unlink`].
    pub fn unlink_inode(&self, inode: &InodeRef) -> Result<()> {
        for _ in 0..self.max_attempts() {
            let Some(parent_handle) = inode.parent() else {
                return Err(Error::ReadOnly("cannot unlink the root directory".into()));
            };
            let parent = self
                .get_by_handle(parent_handle, false)?
                .ok_or_else(|| Error::NotFound(parent_handle.to_string()))?;
            let locks = LockSet::lock(&[inode.inode(), parent.inode()]);
            let Some(current) = locks.get(inode.id()).cloned() else {
                return Err(Error::internal("unlinked inode was not locked"));
            };
            if current.parent != Some(parent_handle) {
                tracing::trace!(id = %inode.id(), "parent changed during unlink, retrying");
                continue;
            }
            if inode.removed() {
                return Err(Error::NotFound(inode.id().to_string()));
            }
            if locks.get(parent.id()).map(|s| s.permissions) != Some(Permissions::Full) {
                return Err(Error::ReadOnly(parent.id().to_string()));
            }
            if let Some(handle) = current.handle {
                if inode.is_directory() && self.has_children_of(handle)? {
                    return Err(Error::NotEmpty(inode.id().to_string()));
                }
                self.client().remove(handle)?;
            }
            self.set_removed(inode, &current, true)?;
            drop(locks);
            tracing::debug!(id = %inode.id(), "unlinked {parent_handle}/{}", current.name);
            return Ok(());
        }
        Err(Error::TooMuchContention("unlink", inode.id()))
    }

    /// Flag whether a file has local content awaiting upload,
    /// persisting a row for it if needed.
    pub fn set_modified(&self, file: &InodeRef, modified: bool) -> Result<()> {
        if file.is_directory() {
            return Err(Error::IsDirectory(file.id().to_string()));
        }
        let mut state = file.state.lock();
        state.dirty = modified;
        self.persist(file, &state, |tx, id| tx.set_modified(id, modified))
    }

    /// Make sure a row exists for the file, then apply `update` to it.
    fn persist<F>(&self, file: &Inode, state: &InodeState, update: F) -> Result<()>
    where
        F: FnOnce(&crate::database::Transaction<'_>, InodeID) -> Result<bool>,
    {
        let id = file.id();
        let removed = file.removed();
        self.database().transaction(|tx| {
            if tx.by_id(id)?.is_none() {
                tx.insert(&InodeRow {
                    id,
                    handle: state.handle,
                    bind: None,
                    extension: state.extension.clone(),
                    modified: state.dirty,
                    location: state
                        .parent
                        .filter(|_| !removed)
                        .map(|p| (p, state.name.clone())),
                })?;
            }
            update(tx, id)?;
            Ok(())
        })
    }

    /// Allocate the bind handle for an upload of this file.
    pub fn binding(&self, file: &InodeRef) -> Result<BindHandle> {
        let bind = BindHandle::generate();
        {
            let state = file.state.lock();
            self.persist(file, &state, |tx, id| tx.set_bind_handle(id, Some(&bind)))?;
        }
        let mut index = self.inner.index.lock();
        index.by_bind.retain(|_, v| *v != file.id());
        index.by_bind.insert(bind.clone(), file.id());
        Ok(bind)
    }

    /// The file whose upload is identified by the given bind handle.
    pub fn binding_for(&self, bind: &BindHandle) -> Option<InodeRef> {
        let mut index = self.inner.index.lock();
        let id = index.by_bind.get(bind).copied()?;
        self.acquire(&mut index, id)
    }

    /// Associate a file with the node its upload produced.
    pub fn bound(&self, file: &InodeRef, info: &NodeInfo) -> Result<()> {
        let mut state = file.state.lock();
        {
            let mut index = self.inner.index.lock();
            index.by_bind.retain(|_, v| *v != file.id());
            if let Some(old) = state.handle {
                if index.by_handle.get(&old) == Some(&file.id()) {
                    index.by_handle.remove(&old);
                }
            }
            index.by_handle.insert(info.handle, file.id());
        }
        state.handle = Some(info.handle);
        state.size = info.size;
        state.modified = info.modified;
        state.permissions = info.permissions;
        self.persist(file, &state, |tx, id| tx.set_handle(id, info.handle))?;
        tracing::debug!(id = %file.id(), "bound to {}", info.handle);
        Ok(())
    }

    /// Forget a failed upload's bind handle.
    pub fn unbind(&self, file: &InodeRef) -> Result<()> {
        self.inner
            .index
            .lock()
            .by_bind
            .retain(|_, v| *v != file.id());
        self.database()
            .transaction(|tx| tx.set_bind_handle(file.id(), None))?;
        Ok(())
    }

    /// Remove cache files and stale rows that no longer belong to
    /// any inode.
    pub fn current(&self) -> Result<usize> {
        let rows = self.database().transaction(|tx| {
            let mut rows = Vec::new();
            for id in tx.ids()? {
                rows.extend(tx.by_id(id)?);
            }
            Ok(rows)
        })?;
        for row in rows {
            if self.get(row.id, true)?.is_some() {
                continue;
            }
            let unlinked = row.location.is_none();
            let vanished = !row.modified && row.handle.is_some_and(|h| self.client().get(h).is_none());
            if unlinked || vanished {
                tracing::debug!(id = %row.id, "purging stale inode row");
                self.purge(&row)?;
            }
        }
        self.files().current(self)
    }

    /// Delete a cold row along with its cached content.
    pub(crate) fn purge(&self, row: &InodeRow) -> Result<()> {
        self.database().transaction(|tx| tx.remove(row.id))?;
        self.files().remove(&row.extension, row.id)
    }

    /// Purge every resident inode, waiting for outstanding
    /// references to be released.
    ///
    /// Gives up once the configured timeout has elapsed so that a
    /// leaked reference cannot hang shutdown.
    pub fn clear(&self) {
        let timeout = self.inner.config.shutdown_timeout();
        let deadline = Instant::now() + timeout;
        let mut index = self.inner.index.lock();
        loop {
            let idle: Vec<_> = index
                .by_id
                .values()
                .filter(|e| e.references == 0)
                .map(|e| Arc::clone(&e.inode))
                .collect();
            for inode in idle {
                index.forget(&inode);
            }
            if index.by_id.is_empty() {
                tracing::debug!("inode index cleared");
                return;
            }
            if self.inner.drained.wait_until(&mut index, deadline).timed_out() {
                tracing::warn!(
                    "{} inode(s) still referenced after {timeout:?}, proceeding",
                    index.by_id.len()
                );
                return;
            }
        }
    }

    /// Number of references held to a resident inode.
    pub fn references(&self, id: InodeID) -> usize {
        self.inner
            .index
            .lock()
            .by_id
            .get(&id)
            .map(|e| e.references)
            .unwrap_or_default()
    }

    /// Evict the longest idle inodes while more than the configured
    /// number are idle.
    ///
    /// Inodes idle for less than the configured age are kept even
    /// when over the limit. Inodes that cannot be evicted stay
    /// resident until they are referenced and released again.
    pub fn trim(&self) {
        let mut index = self.inner.index.lock();
        self.trim_locked(&mut index, Instant::now());
    }

    fn trim_locked(&self, index: &mut Index, now: Instant) {
        let max_size = self.inner.config.cache_max_size;
        let max_age = self.inner.config.cache_max_age();
        let mut evicted = 0usize;
        while index.idle.len() > max_size {
            let Some(&(since, id)) = index.idle.first() else {
                break;
            };
            if max_age.is_some_and(|age| now.saturating_duration_since(since) < age) {
                break;
            }
            index.idle.pop_first();
            if index.evict(id) {
                evicted += 1;
            } else if let Some(entry) = index.by_id.get_mut(&id) {
                entry.idle_since = None;
            }
        }
        if evicted > 0 {
            tracing::trace!(evicted, idle = index.idle.len(), "trimmed inode index");
        }
    }

    /// Number of resident inodes.
    pub fn resident_count(&self) -> usize {
        self.inner.index.lock().by_id.len()
    }

    pub(crate) fn resident(&self, id: InodeID) -> Option<InodeRef> {
        let mut index = self.inner.index.lock();
        self.acquire(&mut index, id)
    }

    pub(crate) fn resident_by_handle(&self, handle: NodeHandle) -> Option<InodeRef> {
        let mut index = self.inner.index.lock();
        let id = index.by_handle.get(&handle).copied()?;
        self.acquire(&mut index, id)
    }

    pub(crate) fn resident_child(&self, parent: NodeHandle, name: &str) -> Option<InodeRef> {
        let mut index = self.inner.index.lock();
        let id = index.by_name.get(&(parent, name.to_owned())).copied()?;
        self.acquire(&mut index, id)
    }

    fn acquire(&self, index: &mut Index, id: InodeID) -> Option<InodeRef> {
        let inode = index.acquire(id)?;
        Some(InodeRef::adopt(inode, self.clone()))
    }

    pub(crate) fn add_reference(&self, inode: &Arc<Inode>) {
        let mut index = self.inner.index.lock();
        let id = inode.id();
        match index.by_id.get(&id) {
            Some(entry) if Arc::ptr_eq(&entry.inode, inode) => {
                index.acquire(id);
            }
            _ => {
                // cleared while still referenced, track it again
                index.by_id.insert(id, Entry::new(Arc::clone(inode)));
            }
        }
    }

    pub(crate) fn release(&self, inode: &Arc<Inode>) {
        {
            let mut index = self.inner.index.lock();
            let Some(entry) = index.by_id.get_mut(&inode.id()) else {
                return;
            };
            if !Arc::ptr_eq(&entry.inode, inode) {
                return;
            }
            debug_assert!(entry.references > 0, "inode released too many times");
            entry.references = entry.references.saturating_sub(1);
            if entry.references > 0 {
                return;
            }
            self.inner.drained.notify_all();
            if !inode.removed() {
                let now = Instant::now();
                entry.idle_since = Some(now);
                index.idle.insert((now, inode.id()));
                self.trim_locked(&mut index, now);
                return;
            }
            index.forget(inode);
        }
        self.destroy(inode);
    }

    /// Erase every trace of a removed inode.
    fn destroy(&self, inode: &Inode) {
        let id = inode.id();
        let extension = inode.extension();
        tracing::debug!(%id, "destroying removed inode");
        if let Err(err) = self.database().transaction(|tx| tx.remove(id)) {
            tracing::warn!(%id, "failed to remove inode row: {err}");
        }
        if inode.is_file() {
            if let Err(err) = self.files().remove(&extension, id) {
                tracing::warn!(%id, "failed to remove cached content: {err}");
            }
        }
    }

    /// Materialize a persisted file.
    fn from_row(&self, row: InodeRow) -> Result<InodeRef> {
        let info = row.handle.and_then(|h| self.client().get(h));
        let mut index = self.inner.index.lock();
        if let Some(inode) = self.acquire(&mut index, row.id) {
            return Ok(inode);
        }
        let bind = row.bind.clone();
        self.install(&mut index, Inode::from_row(&row, info.as_ref()), bind)
    }

    /// Materialize a node described by the cloud.
    ///
    /// Returns `None` when the node is a directory that has already
    /// been claimed under a different identity, which would only
    /// happen if the cloud reused a handle.
    fn from_info(&self, info: &NodeInfo) -> Result<Option<InodeRef>> {
        if let Some(inode) = self.resident_by_handle(info.handle) {
            return Ok(Some(inode));
        }
        let row = match info.is_directory {
            true => None,
            false => self.database().transaction(|tx| tx.by_handle(info.handle))?,
        };
        let mut index = self.inner.index.lock();
        if let Some(id) = index.by_handle.get(&info.handle).copied() {
            return Ok(self.acquire(&mut index, id));
        }
        if let Some(bind) = &info.bind {
            if let Some(id) = index.by_bind.get(bind).copied() {
                return Ok(self.acquire(&mut index, id));
            }
        }
        let inode = match &row {
            Some(row) => Inode::from_row(row, Some(info)),
            None => Inode::from_info(info),
        };
        if let Some(existing) = index.by_id.get(&inode.id()) {
            if existing.inode.is_directory() != inode.is_directory() {
                tracing::warn!(id = %inode.id(), "identity claimed by a different kind of node");
                return Ok(None);
            }
            return Ok(self.acquire(&mut index, inode.id()));
        }
        self.install(&mut index, inode, None).map(Some)
    }

    /// Take ownership of a newly materialized inode.
    fn install(
        &self,
        index: &mut Index,
        inode: Inode,
        bind: Option<BindHandle>,
    ) -> Result<InodeRef> {
        let inode = Arc::new(inode);
        let id = inode.id();
        if !inode.removed() {
            if let Some(key) = inode.location() {
                if index.by_name.contains_key(&key) {
                    // someone else holds the name, this inode stays
                    // reachable by identity only
                    tracing::debug!(%id, "{}/{} is shadowed", key.0, key.1);
                } else {
                    index.claim(key, id)?;
                }
            }
        }
        if let Some(handle) = inode.handle() {
            index.by_handle.insert(handle, id);
        }
        if let Some(bind) = bind {
            index.by_bind.insert(bind, id);
        }
        index.by_id.insert(id, Entry::new(Arc::clone(&inode)));
        Ok(InodeRef::adopt(inode, self.clone()))
    }
}
