// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The on-disk content cache.
//!
//! Every file's content is cached in a single file named after its
//! identity and extension. At most one [`FileIOContext`] exists per
//! identity, shared by everyone holding a [`FileRef`] to it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use crate::client::Client;
use crate::file_io_context::FileIOContext;
use crate::inode::InodeRef;
use crate::{Error, InodeDB, InodeID, Result, config};

#[cfg(test)]
#[path = "./file_cache_test.rs"]
mod file_cache_test;

/// An opened cache file.
#[derive(Debug)]
pub struct FileInfo {
    id: InodeID,
    extension: String,
    path: PathBuf,
    file: Option<File>,
    size: u64,
    modified: SystemTime,
}

impl FileInfo {
    pub fn id(&self) -> InodeID {
        self.id
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The size of the cache file when it was opened.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    fn handle(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| {
            Error::Io(
                "access",
                self.path.clone(),
                io::Error::new(io::ErrorKind::Unsupported, "opened without a file handle"),
            )
        })
    }

    /// Read into the buffer, returning how much was read before
    /// reaching the end of the file.
    pub fn read_at(&self, buffer: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.handle()?;
        let mut count = 0;
        while count < buffer.len() {
            match positioned::read(file, &mut buffer[count..], offset + count as u64) {
                Ok(0) => break,
                Ok(n) => count += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io("read", self.path.clone(), err)),
            }
        }
        Ok(count)
    }

    pub fn write_at(&self, buffer: &[u8], offset: u64) -> Result<()> {
        let file = self.handle()?;
        let mut count = 0;
        while count < buffer.len() {
            match positioned::write(file, &buffer[count..], offset + count as u64) {
                Ok(0) => {
                    let err = io::Error::from(io::ErrorKind::WriteZero);
                    return Err(Error::Io("write", self.path.clone(), err));
                }
                Ok(n) => count += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io("write", self.path.clone(), err)),
            }
        }
        Ok(())
    }

    pub fn set_len(&self, size: u64) -> Result<()> {
        self.handle()?
            .set_len(size)
            .map_err(|err| Error::Io("resize", self.path.clone(), err))
    }
}

#[cfg(unix)]
mod positioned {
    use std::os::unix::fs::FileExt;

    pub fn read(file: &std::fs::File, buffer: &mut [u8], offset: u64) -> std::io::Result<usize> {
        file.read_at(buffer, offset)
    }

    pub fn write(file: &std::fs::File, buffer: &[u8], offset: u64) -> std::io::Result<usize> {
        file.write_at(buffer, offset)
    }
}

#[cfg(windows)]
mod positioned {
    use std::os::windows::fs::FileExt;

    pub fn read(file: &std::fs::File, buffer: &mut [u8], offset: u64) -> std::io::Result<usize> {
        file.seek_read(buffer, offset)
    }

    pub fn write(file: &std::fs::File, buffer: &[u8], offset: u64) -> std::io::Result<usize> {
        file.seek_write(buffer, offset)
    }
}

struct Live {
    context: Arc<FileIOContext>,
    references: usize,
}

#[derive(Default)]
struct CacheState {
    contexts: HashMap<InodeID, Live>,
    infos: HashMap<InodeID, Weak<FileInfo>>,
}

/// Owns the cache directory and every live [`FileIOContext`].
pub struct FileCache {
    root: PathBuf,
    client: Arc<dyn Client>,
    options: config::Cache,
    state: Mutex<CacheState>,
    drained: Condvar,
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl FileCache {
    /// Use the given directory for cached content, creating it if needed.
    pub fn new<P: Into<PathBuf>>(
        root: P,
        client: Arc<dyn Client>,
        options: config::Cache,
    ) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|err| Error::Io("create cache directory", root.clone(), err))?;
        Ok(Self {
            root,
            client,
            options,
            state: Mutex::new(CacheState::default()),
            drained: Condvar::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the content of the given identity is cached.
    pub fn path(&self, extension: &str, id: InodeID) -> PathBuf {
        self.root.join(format!("{}{extension}", id.file_name()))
    }

    /// Open (or create) the cache file for an identity.
    pub fn create(
        &self,
        extension: &str,
        id: InodeID,
        want_file: bool,
        create_if_missing: bool,
    ) -> Result<Arc<FileInfo>> {
        let mut state = self.state.lock();
        self.open_info(&mut state, extension, id, want_file, create_if_missing)
    }

    fn open_info(
        &self,
        state: &mut CacheState,
        extension: &str,
        id: InodeID,
        want_file: bool,
        create_if_missing: bool,
    ) -> Result<Arc<FileInfo>> {
        if let Some(info) = state.infos.get(&id).and_then(Weak::upgrade) {
            if info.file.is_some() || !want_file {
                return Ok(info);
            }
        }
        let path = self.path(extension, id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .truncate(false)
            .open(&path)
            .map_err(|err| Error::Io("open", path.clone(), err))?;
        let metadata = file
            .metadata()
            .map_err(|err| Error::Io("stat", path.clone(), err))?;
        let info = Arc::new(FileInfo {
            id,
            extension: extension.to_owned(),
            path,
            file: want_file.then_some(file),
            size: metadata.len(),
            modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
        });
        state.infos.retain(|_, weak| weak.strong_count() > 0);
        state.infos.insert(id, Arc::downgrade(&info));
        Ok(info)
    }

    /// The current size and modification time of cached content.
    pub fn stat(&self, extension: &str, id: InodeID) -> Result<Option<(u64, SystemTime)>> {
        let live = self
            .state
            .lock()
            .contexts
            .get(&id)
            .map(|l| Arc::clone(&l.context));
        if let Some(context) = live {
            return Ok(Some((context.size(), context.modified())));
        }
        let path = self.path(extension, id);
        match std::fs::metadata(&path) {
            Ok(metadata) => Ok(Some((
                metadata.len(),
                metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            ))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::Io("stat", path, err)),
        }
    }

    /// The I/O context of a file, shared with every other holder.
    ///
    /// Unless `in_memory_only`, a context is created if none is live.
    pub fn context(self: &Arc<Self>, file: &InodeRef, in_memory_only: bool) -> Result<Option<FileRef>> {
        if file.is_directory() {
            return Err(Error::IsDirectory(file.id().to_string()));
        }
        let id = file.id();
        let local = file.was_modified() || file.handle().is_none();
        let cloud_size = file.state.lock().size;
        let extension = file.extension();

        let mut state = self.state.lock();
        if let Some(live) = state.contexts.get_mut(&id) {
            live.references += 1;
            return Ok(Some(FileRef {
                context: Arc::clone(&live.context),
                cache: Arc::clone(self),
            }));
        }
        if in_memory_only {
            return Ok(None);
        }
        let info = self.open_info(&mut state, &extension, id, true, true)?;
        let context = FileIOContext::new(
            Arc::clone(&self.client),
            file.clone(),
            info,
            local,
            cloud_size,
            self.options.clone(),
        )?;
        tracing::debug!(%id, local, "opened cache context");
        state.contexts.insert(
            id,
            Live {
                context: Arc::clone(&context),
                references: 1,
            },
        );
        Ok(Some(FileRef {
            context,
            cache: Arc::clone(self),
        }))
    }

    /// Upload every modified file in the batch.
    ///
    /// All files are attempted, the first failure is returned.
    pub fn flush(self: &Arc<Self>, files: &[InodeRef]) -> Result<()> {
        let mut first_error = None;
        for file in files.iter().filter(|f| f.was_modified()) {
            let result = self
                .context(file, false)
                .and_then(|context| context.map(|c| c.flush()).unwrap_or(Ok(())));
            if let Err(err) = result {
                tracing::warn!(id = %file.id(), "flush failed: {err}");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Delete cached content, unless something still needs it.
    ///
    /// A live context is cancelled rather than deleted, and content
    /// whose [`FileInfo`] is still held is left alone.
    pub fn remove(&self, extension: &str, id: InodeID) -> Result<()> {
        let state = self.state.lock();
        if let Some(live) = state.contexts.get(&id) {
            let context = Arc::clone(&live.context);
            drop(state);
            context.cancel();
            return Ok(());
        }
        if state.infos.get(&id).is_some_and(|w| w.strong_count() > 0) {
            tracing::debug!(%id, "cached content is in use, not removing");
            return Ok(());
        }
        drop(state);
        let path = self.path(extension, id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::trace!(?path, "removed cached content");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Io("remove", path, err)),
        }
    }

    /// Cancel every live context and wait for them to be released.
    ///
    /// Gives up once the configured timeout has elapsed.
    pub fn cancel(&self) {
        let contexts: Vec<_> = self
            .state
            .lock()
            .contexts
            .values()
            .map(|l| Arc::clone(&l.context))
            .collect();
        for context in contexts {
            context.cancel();
        }
        let timeout = self.options.shutdown_timeout();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.contexts.is_empty() {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                tracing::warn!(
                    "{} file(s) still open after {timeout:?}, proceeding",
                    state.contexts.len()
                );
                return;
            }
        }
        tracing::debug!("file cache drained");
    }

    /// Number of live contexts.
    pub fn live_count(&self) -> usize {
        self.state.lock().contexts.len()
    }

    /// Delete cache files that belong to no known inode.
    ///
    /// Returns how many files were removed.
    pub fn current(&self, inodes: &InodeDB) -> Result<usize> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|err| Error::Io("scan", self.root.clone(), err))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|err| Error::Io("scan", self.root.clone(), err))?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(InodeID::from_file_name) else {
                tracing::debug!(?name, "ignoring unrecognized file in cache");
                continue;
            };
            {
                let state = self.state.lock();
                if state.contexts.contains_key(&id)
                    || state.infos.get(&id).is_some_and(|w| w.strong_count() > 0)
                {
                    continue;
                }
            }
            if inodes.exists(id)? {
                continue;
            }
            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(Error::Io("remove", path, err)),
            }
        }
        if removed > 0 {
            tracing::info!("removed {removed} orphaned cache file(s)");
        }
        Ok(removed)
    }

    fn release(&self, context: &Arc<FileIOContext>) {
        let id = context.file().id();
        let released = {
            let mut state = self.state.lock();
            let Some(live) = state.contexts.get_mut(&id) else {
                return;
            };
            if !Arc::ptr_eq(&live.context, context) {
                return;
            }
            live.references = live.references.saturating_sub(1);
            if live.references > 0 {
                return;
            }
            let released = state.contexts.remove(&id);
            self.drained.notify_all();
            released
        };
        if let Some(live) = released {
            tracing::debug!(%id, "closing cache context");
            live.context.cancel();
        }
    }
}

/// A counted reference to a live [`FileIOContext`].
///
/// Dropping the last reference cancels the context, failing any
/// read that is still waiting on the network.
pub struct FileRef {
    context: Arc<FileIOContext>,
    cache: Arc<FileCache>,
}

impl FileRef {
    /// The context itself, which outlives this reference if held.
    pub fn context(&self) -> &Arc<FileIOContext> {
        &self.context
    }
}

impl std::fmt::Debug for FileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.context.fmt(f)
    }
}

impl Deref for FileRef {
    type Target = FileIOContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

impl Clone for FileRef {
    fn clone(&self) -> Self {
        let id = self.context.file().id();
        let mut state = self.cache.state.lock();
        match state.contexts.get_mut(&id) {
            Some(live) if Arc::ptr_eq(&live.context, &self.context) => live.references += 1,
            // released and cancelled already, the clone is inert
            _ => {}
        }
        drop(state);
        Self {
            context: Arc::clone(&self.context),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        self.cache.release(&self.context);
    }
}
