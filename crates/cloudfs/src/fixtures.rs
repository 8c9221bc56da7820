// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Shared test fixtures, including an in-memory cloud.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use rstest::fixture;

use crate::client::{Client, PartialDownload, PartialDownloadCallback, RetryDecision};
use crate::{BindHandle, Config, Error, NodeHandle, NodeInfo, Permissions, Result, Service};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

pub fn init_logging() {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .without_time()
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(sub);
}

#[fixture]
pub fn tmpdir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("cloudfs-test-")
        .tempdir()
        .expect("failed to create dir for test")
}

#[fixture]
pub fn client() -> Arc<MemoryClient> {
    Arc::new(MemoryClient::new())
}

/// Content that differs at every offset within a cycle.
pub fn content(size: u64) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Configuration suited to tests, rooted in the given directory.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.root = root.to_owned();
    config.cache.retry_base_ms = 2;
    config.cache.retry_max_ms = 10;
    config.cache.shutdown_timeout_ms = 500;
    config.inodes.shutdown_timeout_ms = 500;
    config
}

/// A service over the given client, storing everything in `root`.
pub fn service(client: &Arc<MemoryClient>, root: &Path) -> Service {
    let client: Arc<dyn Client> = Arc::clone(client) as Arc<dyn Client>;
    Service::new(client, &test_config(root)).expect("failed to open service for test")
}

#[derive(Debug, Clone)]
struct Node {
    info: NodeInfo,
    content: Bytes,
}

/// A cloud that lives entirely in memory.
///
/// Handles start well above one so that they never collide with
/// the identity the kernel reserves for the mount's root.
pub struct MemoryClient {
    root: NodeHandle,
    nodes: Mutex<HashMap<NodeHandle, Node>>,
    next_handle: AtomicU64,
    throttle: Mutex<Option<Duration>>,
    chunk_size: AtomicUsize,
    failures: AtomicU32,
    downloads: AtomicUsize,
    gate: Mutex<Option<Arc<CompletionGate>>>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        let root = NodeHandle(0x1000);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                info: NodeInfo {
                    handle: root,
                    parent: None,
                    name: String::new(),
                    modified: SystemTime::now(),
                    size: 0,
                    is_directory: true,
                    permissions: Permissions::Full,
                    bind: None,
                },
                content: Bytes::new(),
            },
        );
        Self {
            root,
            nodes: Mutex::new(nodes),
            next_handle: AtomicU64::new(0x1001),
            throttle: Mutex::new(None),
            chunk_size: AtomicUsize::new(16 * KIB as usize),
            failures: AtomicU32::new(0),
            downloads: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    fn allocate(&self) -> NodeHandle {
        NodeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, parent: NodeHandle, name: &str, is_directory: bool, content: Bytes) -> NodeInfo {
        let info = NodeInfo {
            handle: self.allocate(),
            parent: Some(parent),
            name: name.to_owned(),
            modified: SystemTime::now(),
            size: content.len() as u64,
            is_directory,
            permissions: Permissions::Full,
            bind: None,
        };
        self.nodes.lock().insert(
            info.handle,
            Node {
                info: info.clone(),
                content,
            },
        );
        info
    }

    /// Add a directory without going through the client interface.
    pub fn add_directory(&self, parent: NodeHandle, name: &str) -> NodeHandle {
        self.insert(parent, name, true, Bytes::new()).handle
    }

    /// Add a file without going through the client interface.
    pub fn add_file(&self, parent: NodeHandle, name: &str, content: Vec<u8>) -> NodeHandle {
        self.insert(parent, name, false, Bytes::from(content)).handle
    }

    pub fn info(&self, handle: NodeHandle) -> Option<NodeInfo> {
        self.nodes.lock().get(&handle).map(|n| n.info.clone())
    }

    pub fn content(&self, handle: NodeHandle) -> Option<Bytes> {
        self.nodes.lock().get(&handle).map(|n| n.content.clone())
    }

    /// Change a node behind the back of any observer.
    pub fn update<F: FnOnce(&mut NodeInfo)>(&self, handle: NodeHandle, func: F) -> Option<NodeInfo> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&handle)?;
        func(&mut node.info);
        Some(node.info.clone())
    }

    /// Delay every chunk of every download by the given amount.
    pub fn set_throttle(&self, delay: Option<Duration>) {
        *self.throttle.lock() = delay;
    }

    pub fn set_chunk_size(&self, size: usize) {
        self.chunk_size.store(size.max(1), Ordering::Relaxed);
    }

    /// Make the next download fail `count` times with a network
    /// error before it succeeds, as long as it is retried.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::Relaxed);
    }

    /// Make later downloads wait for the returned gate to open
    /// after delivering their content and before reporting success.
    ///
    /// A held download no longer notices cancellation, so it
    /// succeeds even when cancelled in the meantime.
    pub fn hold_completions(&self) -> Arc<CompletionGate> {
        let gate = Arc::new(CompletionGate::default());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// How many partial downloads have been requested.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::Relaxed)
    }

    fn take_failures(&self) -> u32 {
        self.failures.swap(0, Ordering::Relaxed)
    }

    fn find_child(nodes: &HashMap<NodeHandle, Node>, parent: NodeHandle, name: &str) -> Option<NodeHandle> {
        nodes
            .values()
            .find(|n| n.info.parent == Some(parent) && n.info.name == name)
            .map(|n| n.info.handle)
    }

    fn remove_tree(nodes: &mut HashMap<NodeHandle, Node>, handle: NodeHandle) {
        let children: Vec<_> = nodes
            .values()
            .filter(|n| n.info.parent == Some(handle))
            .map(|n| n.info.handle)
            .collect();
        for child in children {
            Self::remove_tree(nodes, child);
        }
        nodes.remove(&handle);
    }
}

impl Client for MemoryClient {
    fn root(&self) -> NodeHandle {
        self.root
    }

    fn get(&self, handle: NodeHandle) -> Option<NodeInfo> {
        self.info(handle)
    }

    fn child(&self, parent: NodeHandle, name: &str) -> Option<NodeInfo> {
        let nodes = self.nodes.lock();
        Self::find_child(&nodes, parent, name).and_then(|h| nodes.get(&h).map(|n| n.info.clone()))
    }

    fn children(&self, parent: NodeHandle) -> Result<Vec<NodeInfo>> {
        let nodes = self.nodes.lock();
        if !nodes.contains_key(&parent) {
            return Err(Error::NotFound(parent.to_string()));
        }
        let mut children: Vec<_> = nodes
            .values()
            .filter(|n| n.info.parent == Some(parent))
            .map(|n| n.info.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn make_directory(&self, name: &str, parent: NodeHandle) -> Result<NodeInfo> {
        if Self::find_child(&self.nodes.lock(), parent, name).is_some() {
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        Ok(self.insert(parent, name, true, Bytes::new()))
    }

    fn move_node(&self, handle: NodeHandle, name: &str, parent: NodeHandle) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if let Some(existing) = Self::find_child(&nodes, parent, name) {
            if existing != handle {
                return Err(Error::AlreadyExists(name.to_owned()));
            }
        }
        let node = nodes
            .get_mut(&handle)
            .ok_or_else(|| Error::NotFound(handle.to_string()))?;
        node.info.parent = Some(parent);
        node.info.name = name.to_owned();
        Ok(())
    }

    fn remove(&self, handle: NodeHandle) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if !nodes.contains_key(&handle) {
            return Err(Error::NotFound(handle.to_string()));
        }
        Self::remove_tree(&mut nodes, handle);
        Ok(())
    }

    fn upload(
        &self,
        content: &Path,
        name: &str,
        parent: NodeHandle,
        bind: &BindHandle,
    ) -> Result<NodeInfo> {
        let data = std::fs::read(content)
            .map_err(|err| Error::Io("read upload", content.to_owned(), err))?;
        {
            // a new version replaces the old one
            let mut nodes = self.nodes.lock();
            if let Some(existing) = Self::find_child(&nodes, parent, name) {
                nodes.remove(&existing);
            }
        }
        let info = self.insert(parent, name, false, Bytes::from(data));
        self.update(info.handle, |i| i.bind = Some(bind.clone()))
            .ok_or_else(|| Error::NotFound(info.handle.to_string()))
    }

    fn partial_download(
        &self,
        handle: NodeHandle,
        offset: u64,
        length: u64,
    ) -> Result<Arc<dyn PartialDownload>> {
        let content = self
            .content(handle)
            .ok_or_else(|| Error::NotFound(handle.to_string()))?;
        let begin = (offset as usize).min(content.len());
        let end = (offset.saturating_add(length) as usize).min(content.len());
        self.downloads.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemoryDownload {
            content: content.slice(begin..end),
            offset,
            throttle: *self.throttle.lock(),
            chunk_size: self.chunk_size.load(Ordering::Relaxed),
            failures: self.take_failures(),
            gate: self.gate.lock().clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// A download that runs on its own thread.
pub struct MemoryDownload {
    content: Bytes,
    offset: u64,
    throttle: Option<Duration>,
    chunk_size: usize,
    failures: u32,
    gate: Option<Arc<CompletionGate>>,
    cancelled: Arc<AtomicBool>,
    completed: Arc<AtomicBool>,
}

impl PartialDownload for MemoryDownload {
    fn begin(&self, callback: Arc<dyn PartialDownloadCallback>) -> Result<()> {
        let content = self.content.clone();
        let offset = self.offset;
        let throttle = self.throttle;
        let chunk_size = self.chunk_size;
        let failures = self.failures;
        let gate = self.gate.clone();
        let cancelled = Arc::clone(&self.cancelled);
        let completed = Arc::clone(&self.completed);
        let done = Arc::clone(&callback);
        let finish = move |result: Result<()>| {
            completed.store(true, Ordering::Release);
            done.completed(result);
        };
        std::thread::spawn(move || {
            for retries in 0..failures {
                let error = Error::Network("injected failure".into());
                match callback.failed(&error, retries) {
                    RetryDecision::Abort => return finish(Err(error)),
                    RetryDecision::Retry(delay) => std::thread::sleep(delay),
                }
            }
            for (index, chunk) in content.chunks(chunk_size).enumerate() {
                if let Some(delay) = throttle {
                    std::thread::sleep(delay);
                }
                if cancelled.load(Ordering::Acquire) {
                    return finish(Err(Error::Cancelled));
                }
                let position = offset + (index * chunk_size) as u64;
                if let Err(err) = callback.data(chunk, position) {
                    return finish(Err(err));
                }
            }
            if let Some(gate) = gate {
                gate.wait();
            }
            finish(Ok(()))
        });
        Ok(())
    }

    fn cancel(&self) -> bool {
        if self.completed.load(Ordering::Acquire) {
            return false;
        }
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Holds successful downloads back until opened.
#[derive(Default)]
pub struct CompletionGate {
    open: Mutex<bool>,
    opened: Condvar,
    held: AtomicUsize,
}

impl CompletionGate {
    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    /// How many downloads are currently waiting.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        self.held.fetch_add(1, Ordering::AcqRel);
        while !*open {
            self.opened.wait(&mut open);
        }
        self.held.fetch_sub(1, Ordering::AcqRel);
    }
}
