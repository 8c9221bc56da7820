// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cloudfs::inode::MAX_NAME_LENGTH;
use cloudfs::{Attributes, DirEntry, FileRef, InodeID, InodeKind, InodeRef, OsError, Service};
use dashmap::DashMap;
use fuser::consts::*;
use fuser::{
    FileAttr,
    FileType,
    MountOption,
    ReplyAttr,
    ReplyCreate,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyEntry,
    ReplyOpen,
    ReplyWrite,
    Request,
    TimeOrNow,
};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./fuse_test.rs"]
mod fuse_test;

/// Kernel inode numbers below this are never given to an identity.
const RESERVED_INODES: u64 = 2;

/// Options to configure the FUSE filesystem and
/// its behavior at runtime
#[derive(Debug, Clone)]
pub struct Config {
    /// The user id that should own all files and directories
    pub uid: nix::unistd::Uid,
    /// The group id that should own all files and directories
    pub gid: nix::unistd::Gid,
    /// Mount options to be used when setting up
    pub mount_options: HashSet<MountOption>,
    /// How long the kernel may cache entries and attributes
    pub ttl: Duration,
}

impl Config {
    /// Options for a mount owned by the current user.
    pub fn new(config: &cloudfs::Config) -> Self {
        let mount_options = [
            MountOption::FSName("cloudfs".into()),
            MountOption::DefaultPermissions,
            MountOption::NoDev,
            MountOption::NoSuid,
        ]
        .into_iter()
        .collect();
        Self {
            uid: nix::unistd::getuid(),
            gid: nix::unistd::getgid(),
            mount_options,
            ttl: Duration::from_millis(config.fuse.ttl_ms),
        }
    }
}

/// An inode that the kernel holds references to.
struct Lookup {
    inode: InodeRef,
    count: u64,
}

enum Handle {
    File(FileRef),
    /// Listings are captured when opened so that offsets
    /// remain stable across calls to readdir.
    Directory(Vec<DirEntry>),
}

/// Maps kernel requests onto the cloud service
struct Filesystem {
    service: Arc<Service>,
    opts: Config,

    root: InodeID,
    next_handle: AtomicU64,
    lookups: DashMap<u64, Lookup>,
    handles: DashMap<u64, Handle>,
}

impl Filesystem {
    // the tree has no backing device, so any realistic value
    // is enough for tools that compute usage (eg du)
    const BLOCK_SIZE: u32 = 512;

    fn new(service: Arc<Service>, opts: Config) -> Result<Self> {
        let root = service.root()?.id();
        Ok(Self {
            service,
            opts,
            root,
            // we do not allocate handle 0, so skip it for now
            next_handle: AtomicU64::new(1),
            lookups: Default::default(),
            handles: Default::default(),
        })
    }

    /// The identity behind a kernel inode number.
    ///
    /// The kernel insists on inode 1 for the root and never uses 0,
    /// so every other identity is shifted past both.
    fn inode_id(&self, ino: u64) -> InodeID {
        if ino == fuser::FUSE_ROOT_ID {
            self.root
        } else {
            InodeID::from_u64(ino.wrapping_sub(RESERVED_INODES))
        }
    }

    fn kernel_ino(&self, id: InodeID) -> u64 {
        if id == self.root {
            fuser::FUSE_ROOT_ID
        } else {
            id.as_u64().wrapping_add(RESERVED_INODES)
        }
    }

    /// Hold a reference on behalf of the kernel until it forgets it.
    fn remember(&self, inode: InodeRef) -> u64 {
        let ino = self.kernel_ino(inode.id());
        self.lookups
            .entry(ino)
            .or_insert_with(|| Lookup { inode, count: 0 })
            .count += 1;
        ino
    }

    fn allocate_handle(&self, data: Handle) -> u64 {
        loop {
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                // the 'empty/zero' handle value is never allocated
                // so that the explicit lack of handle can be detected
                continue;
            }
            match self.handles.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(data);
                    break id;
                }
            }
        }
    }

    fn file_ref(&self, fh: u64) -> Option<FileRef> {
        match self.handles.get(&fh)?.value() {
            Handle::File(file) => Some(file.clone()),
            Handle::Directory(_) => None,
        }
    }

    fn attr_from(&self, attributes: &Attributes) -> FileAttr {
        let is_directory = attributes.kind == InodeKind::Directory;
        FileAttr {
            ino: self.kernel_ino(attributes.id),
            size: attributes.size,
            blocks: attributes.size.div_ceil(Self::BLOCK_SIZE as u64),
            atime: attributes.modified,
            mtime: attributes.modified,
            ctime: attributes.modified,
            crtime: attributes.modified,
            kind: file_type(attributes.kind),
            perm: attributes.permissions.mode(is_directory),
            nlink: if is_directory { 2 } else { 1 },
            uid: self.opts.uid.as_raw(),
            gid: self.opts.gid.as_raw(),
            rdev: 0,
            blksize: Self::BLOCK_SIZE,
            flags: 0,
        }
    }
}

fn file_type(kind: InodeKind) -> FileType {
    match kind {
        InodeKind::Directory => FileType::Directory,
        InodeKind::File => FileType::RegularFile,
    }
}

/// Extract the ok value from a result, or reply with an error in FUSE
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error to FUSE and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let err = $err;
        let errno = err.os_error().unwrap_or(libc::EIO);
        if errno == libc::EIO {
            tracing::error!("{err:?}");
        } else {
            tracing::debug!("{err}");
        }
        $reply.error(errno);
        return;
    }};
}

/// Decode a name from the kernel, or reply with an error and return
macro_rules! name {
    ($reply:ident, $name:expr) => {{
        match $name.to_str() {
            Some(name) => name,
            None => {
                $reply.error(libc::EINVAL);
                return;
            }
        }
    }};
}

// these functions mirror the actual fuse ones and
// so we don't have much control over the shape
#[allow(clippy::too_many_arguments)]
impl Filesystem {
    async fn statfs(&self, _ino: u64, reply: fuser::ReplyStatfs) {
        let files = self.service.inodes().resident_count() as u64;
        reply.statfs(
            0,
            0,
            0,
            files,
            u64::MAX - files,
            Self::BLOCK_SIZE,
            MAX_NAME_LENGTH as u32,
            Self::BLOCK_SIZE,
        )
    }

    async fn lookup(&self, parent: u64, name: OsString, reply: ReplyEntry) {
        let name = name!(reply, name);
        tracing::trace!("lookup {name} in {parent}");
        let inode = unwrap!(reply, self.service.lookup(self.inode_id(parent), name));
        let attributes = unwrap!(reply, inode.attributes());
        let attr = self.attr_from(&attributes);
        self.remember(inode);
        reply.entry(&self.opts.ttl, &attr, 0);
    }

    async fn forget(&self, ino: u64, nlookup: u64) {
        let released = self.lookups.remove_if_mut(&ino, |_, lookup| {
            lookup.count = lookup.count.saturating_sub(nlookup);
            lookup.count == 0
        });
        if let Some((_, lookup)) = released {
            tracing::trace!("forget {} [{ino}]", lookup.inode.id());
        }
    }

    async fn getattr(&self, ino: u64, reply: ReplyAttr) {
        let attributes = unwrap!(reply, self.service.getattr(self.inode_id(ino)));
        reply.attr(&self.opts.ttl, &self.attr_from(&attributes));
    }

    async fn setattr(
        &self,
        ino: u64,
        size: Option<u64>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
        reply: ReplyAttr,
    ) {
        let id = self.inode_id(ino);
        let opened = fh.and_then(|fh| self.file_ref(fh));
        if let Some(size) = size {
            tracing::trace!("truncate {id} to {size}");
            match &opened {
                Some(file) => unwrap!(reply, file.truncate(size).await),
                None => unwrap!(reply, self.service.truncate(id, size).await),
            }
        }
        if let (Some(mtime), Some(file)) = (mtime, &opened) {
            let when = match mtime {
                TimeOrNow::SpecificTime(when) => when,
                TimeOrNow::Now => SystemTime::now(),
            };
            file.touch(when);
        }
        let attributes = unwrap!(reply, self.service.getattr(id));
        reply.attr(&self.opts.ttl, &self.attr_from(&attributes));
    }

    async fn open(&self, ino: u64, flags: i32, reply: ReplyOpen) {
        let id = self.inode_id(ino);
        let write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let file = unwrap!(reply, self.service.open(id, write));
        if write && flags & libc::O_TRUNC != 0 {
            unwrap!(reply, file.truncate(0).await);
        }
        let fh = self.allocate_handle(Handle::File(file));
        tracing::trace!("open {id} = {fh}");
        reply.opened(fh, 0);
    }

    async fn create(&self, parent: u64, name: OsString, reply: ReplyCreate) {
        let name = name!(reply, name);
        let (inode, file) = unwrap!(reply, self.service.create(self.inode_id(parent), name));
        let attributes = unwrap!(reply, inode.attributes());
        let attr = self.attr_from(&attributes);
        self.remember(inode);
        let fh = self.allocate_handle(Handle::File(file));
        tracing::trace!("create {name} in {parent} = {fh}");
        reply.created(&self.opts.ttl, &attr, 0, fh, 0);
    }

    async fn read(&self, fh: u64, offset: i64, size: u32, reply: ReplyData) {
        let Some(file) = self.file_ref(fh) else {
            tracing::debug!("read {fh} = EBADF");
            reply.error(libc::EBADF);
            return;
        };
        let data = unwrap!(
            reply,
            self.service.read(&file, offset.max(0) as u64, size as u64).await
        );
        tracing::trace!("read {fh} = {}/{size}", data.len());
        reply.data(&data);
    }

    async fn write(&self, fh: u64, offset: i64, data: Vec<u8>, reply: ReplyWrite) {
        let Some(file) = self.file_ref(fh) else {
            tracing::debug!("write {fh} = EBADF");
            reply.error(libc::EBADF);
            return;
        };
        let written = unwrap!(
            reply,
            self.service.write(&file, offset.max(0) as u64, &data).await
        );
        tracing::trace!("write {fh} = {written}");
        reply.written(written as u32);
    }

    async fn fsync(&self, fh: u64, reply: ReplyEmpty) {
        let Some(file) = self.file_ref(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        unwrap!(reply, self.service.fsync(&file));
        reply.ok();
    }

    async fn release(&self, fh: u64, reply: ReplyEmpty) {
        let Some((_, handle)) = self.handles.remove(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if let Handle::File(file) = handle {
            unwrap!(reply, self.service.release(file));
        }
        reply.ok();
    }

    async fn opendir(&self, ino: u64, reply: ReplyOpen) {
        let id = self.inode_id(ino);
        let entries = unwrap!(reply, self.service.readdir(id));
        let fh = self.allocate_handle(Handle::Directory(entries));
        tracing::trace!("opendir {id} = {fh}");
        reply.opened(fh, 0);
    }

    async fn readdir(&self, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let Handle::Directory(entries) = handle.value() else {
            reply.error(libc::ENOTDIR);
            return;
        };
        // offsets handed to the kernel are one past the entry's index
        let skip = offset.max(0) as usize;
        for (index, entry) in entries.iter().enumerate().skip(skip) {
            let ino = self.kernel_ino(entry.id);
            let buffer_full = reply.add(ino, index as i64 + 1, file_type(entry.kind), &entry.name);
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    async fn releasedir(&self, fh: u64, reply: ReplyEmpty) {
        let Some((_, _handle)) = self.handles.remove(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        reply.ok()
    }

    async fn mkdir(&self, parent: u64, name: OsString, reply: ReplyEntry) {
        let name = name!(reply, name);
        let directory = unwrap!(reply, self.service.mkdir(self.inode_id(parent), name));
        let attributes = unwrap!(reply, directory.attributes());
        let attr = self.attr_from(&attributes);
        self.remember(directory);
        reply.entry(&self.opts.ttl, &attr, 0);
    }

    async fn rmdir(&self, parent: u64, name: OsString, reply: ReplyEmpty) {
        let name = name!(reply, name);
        unwrap!(reply, self.service.rmdir(self.inode_id(parent), name));
        reply.ok();
    }

    async fn unlink(&self, parent: u64, name: OsString, reply: ReplyEmpty) {
        let name = name!(reply, name);
        unwrap!(reply, self.service.unlink(self.inode_id(parent), name));
        reply.ok();
    }

    async fn rename(
        &self,
        parent: u64,
        name: OsString,
        new_parent: u64,
        new_name: OsString,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // neither RENAME_EXCHANGE nor RENAME_NOREPLACE
            reply.error(libc::EINVAL);
            return;
        }
        let name = name!(reply, name);
        let new_name = name!(reply, new_name);
        unwrap!(
            reply,
            self.service.rename(
                self.inode_id(parent),
                name,
                self.inode_id(new_parent),
                new_name
            )
        );
        reply.ok();
    }
}

/// Represents a connected FUSE session.
///
/// This implements the [`fuser::Filesystem`] trait, receives
/// all requests and arranges for their async execution on the
/// runtime that created the session.
pub struct Session {
    inner: Arc<Filesystem>,
    runtime: tokio::runtime::Handle,
}

impl Session {
    /// Construct a new session which serves the provided cloud tree.
    ///
    /// Must be called from within a tokio runtime, which will
    /// execute every request that the session receives.
    pub fn new(service: Arc<Service>, opts: Config) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(Error::NoRuntime)?;
        Ok(Self {
            inner: Arc::new(Filesystem::new(service, opts)?),
            runtime,
        })
    }

    /// Mount this session and serve requests until it is unmounted.
    pub fn mount(self, mountpoint: &Path) -> Result<()> {
        let options: Vec<_> = self.inner.opts.mount_options.iter().cloned().collect();
        tracing::debug!("mounting cloudfs at {mountpoint:?}");
        fuser::mount2(self, mountpoint, &options)
            .map_err(|err| Error::Mount(mountpoint.to_owned(), err))
    }

    fn spawn<F, Fut>(&self, op: F)
    where
        F: FnOnce(Arc<Filesystem>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let fs = Arc::clone(&self.inner);
        self.runtime.spawn(async move { op(fs).await });
    }
}

impl fuser::Filesystem for Session {
    fn init(
        &mut self,
        _req: &Request<'_>,
        config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        const DESIRED: &[(&str, u32)] = &[
            ("FUSE_ASYNC_READ", FUSE_ASYNC_READ),
            ("FUSE_BIG_WRITES", FUSE_BIG_WRITES),
            ("FUSE_EXPORT_SUPPORT", FUSE_EXPORT_SUPPORT),
        ];
        let all_desired = DESIRED.iter().fold(0, |prev, (_, i)| prev | i);
        if let Err(unsupported) = config.add_capabilities(all_desired) {
            let rejected = DESIRED
                .iter()
                .filter_map(|d| (d.1 & unsupported != 0).then_some(d.0));
            for name in rejected {
                tracing::warn!("FUSE feature rejected: {name}");
            }
            if config.add_capabilities(all_desired & !unsupported).is_err() {
                tracing::warn!("FUSE features could not be negotiated");
            }
        }
        tracing::info!("Filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        self.inner.handles.clear();
        self.inner.lookups.clear();
        self.inner.service.shutdown();
        tracing::info!("Filesystem destroyed");
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: fuser::ReplyStatfs) {
        self.spawn(move |fs| async move { fs.statfs(ino, reply).await });
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_owned();
        self.spawn(move |fs| async move { fs.lookup(parent, name, reply).await });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.spawn(move |fs| async move { fs.forget(ino, nlookup).await });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        self.spawn(move |fs| async move { fs.getattr(ino, reply).await });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        self.spawn(move |fs| async move { fs.setattr(ino, size, mtime, fh, reply).await });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.spawn(move |fs| async move { fs.open(ino, flags, reply).await });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_owned();
        self.spawn(move |fs| async move { fs.create(parent, name, reply).await });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.spawn(move |fs| async move { fs.read(fh, offset, size, reply).await });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        self.spawn(move |fs| async move { fs.write(fh, offset, data, reply).await });
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        self.spawn(move |fs| async move { fs.fsync(fh, reply).await });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.spawn(move |fs| async move { fs.release(fh, reply).await });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.spawn(move |fs| async move { fs.opendir(ino, reply).await });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        self.spawn(move |fs| async move { fs.readdir(fh, offset, reply).await });
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.spawn(move |fs| async move { fs.releasedir(fh, reply).await });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_owned();
        self.spawn(move |fs| async move { fs.mkdir(parent, name, reply).await });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        self.spawn(move |fs| async move { fs.rmdir(parent, name, reply).await });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        self.spawn(move |fs| async move { fs.unlink(parent, name, reply).await });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_owned();
        let newname = newname.to_owned();
        self.spawn(move |fs| async move {
            fs.rename(parent, name, newparent, newname, flags, reply)
                .await
        });
    }
}
