// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Cached reads and writes for one open file.
//!
//! Each context tracks which byte ranges of its cache file hold
//! valid content. Reads fetch only the gaps, and a gap already being
//! fetched for another reader is waited on rather than fetched twice.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_retry::strategy::ExponentialBackoff;

use crate::client::{Client, PartialDownload, PartialDownloadCallback, RetryDecision};
use crate::file_cache::FileInfo;
use crate::inode::InodeRef;
use crate::range_tree::{EntryId, FileRange, FileRangeTree};
use crate::{Error, Permissions, Result, config};

#[cfg(test)]
#[path = "./file_io_context_test.rs"]
mod file_io_context_test;

/// How a single range fetch ended, as seen by its waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FetchOutcome {
    Pending,
    Done,
    Cancelled,
    Network(String),
    Io(std::io::ErrorKind, String),
}

/// One in-flight fetch of a gap in the cache.
struct RangeFetch {
    range: FileRange,
    outcome: watch::Sender<FetchOutcome>,
    download: Mutex<Option<Arc<dyn PartialDownload>>>,
}

impl RangeFetch {
    fn new(range: FileRange) -> Arc<Self> {
        let (outcome, _) = watch::channel(FetchOutcome::Pending);
        Arc::new(Self {
            range,
            outcome,
            download: Mutex::new(None),
        })
    }

    /// Publish the outcome, unless one has already been published.
    fn finish(&self, outcome: FetchOutcome) {
        self.outcome.send_if_modified(|current| {
            if *current != FetchOutcome::Pending {
                return false;
            }
            *current = outcome;
            true
        });
    }

    fn cancel(&self) {
        let download = self.download.lock().take();
        if let Some(download) = download {
            download.cancel();
        }
        self.finish(FetchOutcome::Cancelled);
    }
}

#[derive(Clone)]
enum Segment {
    Present,
    Fetching(Arc<RangeFetch>),
}

struct ContextState {
    ranges: FileRangeTree<Segment>,
    size: u64,
    modified: SystemTime,
    cancelled: bool,
    /// Content that has not yet been uploaded.
    dirty: bool,
    /// Bumped by every change to the content.
    generation: u64,
    flush_task: Option<tokio::task::JoinHandle<()>>,
}

/// The live, in-memory coordinator of one file's cached content.
pub struct FileIOContext {
    me: Weak<FileIOContext>,
    client: Arc<dyn Client>,
    file: InodeRef,
    info: Arc<FileInfo>,
    options: config::Cache,
    state: Mutex<ContextState>,
}

impl std::fmt::Debug for FileIOContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIOContext")
            .field("id", &self.file.id())
            .field("path", &self.info.path())
            .finish_non_exhaustive()
    }
}

impl FileIOContext {
    /// Build the context for a file.
    ///
    /// A file with local content is entirely present in the cache,
    /// anything else starts out empty at its cloud size.
    pub(crate) fn new(
        client: Arc<dyn Client>,
        file: InodeRef,
        info: Arc<FileInfo>,
        local: bool,
        cloud_size: u64,
        options: config::Cache,
    ) -> Result<Arc<Self>> {
        let mut ranges = FileRangeTree::new();
        let size = if local {
            info.size()
        } else {
            info.set_len(cloud_size)?;
            cloud_size
        };
        if local {
            ranges.add(FileRange::new(0, size), Segment::Present);
        }
        let modified = info.modified();
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            client,
            file,
            info,
            options,
            state: Mutex::new(ContextState {
                ranges,
                size,
                modified,
                cancelled: false,
                dirty: local,
                generation: 0,
                flush_task: None,
            }),
        }))
    }

    pub fn file(&self) -> &InodeRef {
        &self.file
    }

    pub fn info(&self) -> &Arc<FileInfo> {
        &self.info
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn modified(&self) -> SystemTime {
        self.state.lock().modified
    }

    /// True if the content has changes that have not been uploaded.
    pub fn was_modified(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// The ranges currently held in the cache, in order.
    pub fn cached_ranges(&self) -> Vec<FileRange> {
        let state = self.state.lock();
        state
            .ranges
            .iter()
            .filter(|(_, _, segment)| matches!(segment, Segment::Present))
            .map(|(_, range, _)| range)
            .collect()
    }

    /// Read up to `length` bytes from `offset`.
    ///
    /// The request is clamped to the size of the file, so reading
    /// at or beyond the end yields empty content.
    pub async fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        let range = {
            let state = self.state.lock();
            if state.cancelled {
                return Err(Error::Cancelled);
            }
            let end = offset.saturating_add(length).min(state.size);
            FileRange::new(offset.min(end), end)
        };
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        self.fetch(range).await?;
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut buffer = vec![0; range.len() as usize];
        let count = self.info.read_at(&mut buffer, range.begin)?;
        buffer.truncate(count);
        Ok(Bytes::from(buffer))
    }

    /// Make sure the given range is present in the cache.
    async fn fetch(&self, range: FileRange) -> Result<()> {
        let (started, mut waiting) = {
            let mut state = self.state.lock();
            if state.cancelled {
                return Err(Error::Cancelled);
            }
            self.plan(&mut state, range)
        };
        for fetch in started {
            self.begin(fetch);
        }
        for waiter in waiting.iter_mut() {
            let outcome = waiter
                .wait_for(|o| *o != FetchOutcome::Pending)
                .await
                .map(|o| (*o).clone())
                // the context went away with the fetch still pending
                .unwrap_or(FetchOutcome::Cancelled);
            match outcome {
                FetchOutcome::Pending | FetchOutcome::Done => {}
                FetchOutcome::Cancelled => return Err(Error::Cancelled),
                FetchOutcome::Network(message) => return Err(Error::Network(message)),
                FetchOutcome::Io(kind, message) => {
                    return Err(Error::Io(
                        "write",
                        self.info.path().to_owned(),
                        std::io::Error::new(kind, message),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Find the gaps in a range, claiming each as a new fetch.
    ///
    /// Returns the fetches to begin, and a receiver for every
    /// fetch (new or already in flight) the range depends on.
    fn plan(
        &self,
        state: &mut ContextState,
        range: FileRange,
    ) -> (Vec<Arc<RangeFetch>>, Vec<watch::Receiver<FetchOutcome>>) {
        let mut started = Vec::new();
        let mut waiting = Vec::new();
        let mut gaps = Vec::new();
        let mut position = range.begin;
        for (_, found, segment) in state.ranges.find(range) {
            if found.begin > position {
                gaps.push(FileRange::new(position, found.begin));
            }
            if let Segment::Fetching(fetch) = segment {
                waiting.push(fetch.outcome.subscribe());
            }
            position = position.max(found.end);
        }
        if position < range.end {
            gaps.push(FileRange::new(position, range.end));
        }
        for gap in gaps {
            let gap = self.read_ahead(state, gap);
            let (id, added) = state
                .ranges
                .try_add(gap, |r| Segment::Fetching(RangeFetch::new(r)));
            if !added {
                continue;
            }
            let segment = id.and_then(|id| state.ranges.get(id)).map(|(_, s)| s);
            if let Some(Segment::Fetching(fetch)) = segment {
                tracing::trace!(id = %self.file.id(), range = %fetch.range, "fetching");
                waiting.push(fetch.outcome.subscribe());
                started.push(Arc::clone(fetch));
            }
        }
        (started, waiting)
    }

    /// Grow a gap to the minimum fetch size without running into
    /// cached content or past the end of the file.
    fn read_ahead(&self, state: &ContextState, gap: FileRange) -> FileRange {
        let minimum = self.options.minimum_range_size;
        if gap.len() >= minimum {
            return gap;
        }
        let limit = state
            .ranges
            .begins_at_or_after(gap.end)
            .and_then(|id| state.ranges.get(id))
            .map(|(r, _)| r.begin)
            .unwrap_or(state.size)
            .min(state.size);
        let end = gap.begin.saturating_add(minimum).min(limit).max(gap.end);
        FileRange::new(gap.begin, end)
    }

    fn begin(&self, fetch: Arc<RangeFetch>) {
        let Some(handle) = self.file.handle() else {
            let message = format!("{} has no cloud content", self.file.id());
            self.completed(&fetch, Err(Error::NotFound(message)));
            return;
        };
        let download = match self
            .client
            .partial_download(handle, fetch.range.begin, fetch.range.len())
        {
            Ok(download) => download,
            Err(err) => {
                self.completed(&fetch, Err(err));
                return;
            }
        };
        *fetch.download.lock() = Some(Arc::clone(&download));
        if self.is_cancelled() {
            fetch.cancel();
            return;
        }
        let callback = Arc::new(FetchCallback {
            context: self.me.clone(),
            fetch: Arc::clone(&fetch),
        });
        if let Err(err) = download.begin(callback) {
            self.completed(&fetch, Err(err));
        }
    }

    /// Record the end of a fetch.
    ///
    /// Cancellation wins over a fetch that succeeds at the same time.
    fn completed(&self, fetch: &Arc<RangeFetch>, result: Result<()>) {
        let mut state = self.state.lock();
        let outcome = match result {
            _ if state.cancelled => FetchOutcome::Cancelled,
            Ok(()) => FetchOutcome::Done,
            Err(Error::Cancelled) => FetchOutcome::Cancelled,
            Err(Error::Io(_, _, err)) => FetchOutcome::Io(err.kind(), err.to_string()),
            Err(err) => FetchOutcome::Network(err.to_string()),
        };
        let entry = state
            .ranges
            .find(fetch.range)
            .find(|(_, _, segment)| {
                matches!(segment, Segment::Fetching(other) if Arc::ptr_eq(other, fetch))
            })
            .map(|(id, _, _)| id);
        if let Some(id) = entry {
            if outcome == FetchOutcome::Done {
                if let Some(segment) = state.ranges.get_mut(id) {
                    *segment = Segment::Present;
                }
                coalesce(&mut state.ranges, id);
            } else {
                state.ranges.remove_entry(id);
            }
        }
        tracing::trace!(id = %self.file.id(), range = %fetch.range, ?outcome, "fetch completed");
        fetch.download.lock().take();
        fetch.finish(outcome);
    }

    fn retry_decision(&self, error: &Error, retries: u32) -> RetryDecision {
        if self.is_cancelled()
            || !error.is_retryable()
            || retries >= self.options.max_retries
        {
            return RetryDecision::Abort;
        }
        let delay = ExponentialBackoff::from_millis(2)
            .factor((self.options.retry_base_ms / 2).max(1))
            .max_delay(std::time::Duration::from_millis(self.options.retry_max_ms))
            .nth(retries as usize)
            .unwrap_or_else(|| std::time::Duration::from_millis(self.options.retry_max_ms));
        tracing::debug!(id = %self.file.id(), retries, "retrying fetch in {delay:?}: {error}");
        RetryDecision::Retry(delay)
    }

    fn check_writable(&self) -> Result<()> {
        if self.file.permissions() < Permissions::ReadWrite {
            return Err(Error::ReadOnly(self.file.id().to_string()));
        }
        Ok(())
    }

    /// Write content at the given offset, extending the file if needed.
    ///
    /// The whole file is fetched first so that the cache always
    /// holds a complete copy of modified content.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<u64> {
        self.check_writable()?;
        let size = self.size();
        self.fetch(FileRange::new(0, size)).await?;
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(Error::Cancelled);
        }
        self.info.write_at(data, offset)?;
        let end = offset.saturating_add(data.len() as u64);
        if end > state.size {
            extend(&mut state, end);
        }
        self.changed(&mut state)?;
        Ok(data.len() as u64)
    }

    /// Change the size of the file.
    pub async fn truncate(&self, size: u64) -> Result<()> {
        self.check_writable()?;
        let current = self.size();
        self.fetch(FileRange::new(0, current.min(size))).await?;
        let doomed = {
            let mut state = self.state.lock();
            if state.cancelled {
                return Err(Error::Cancelled);
            }
            if size == state.size {
                return Ok(());
            }
            self.info.set_len(size)?;
            let doomed = match size < state.size {
                true => shrink(&mut state, size),
                false => {
                    extend(&mut state, size);
                    Vec::new()
                }
            };
            self.changed(&mut state)?;
            doomed
        };
        for fetch in doomed {
            fetch.cancel();
        }
        Ok(())
    }

    /// Update the modification time without changing content.
    pub fn touch(&self, modified: SystemTime) {
        self.state.lock().modified = modified;
        self.file.touch(modified);
    }

    /// Record a change to the content.
    fn changed(&self, state: &mut ContextState) -> Result<()> {
        state.generation += 1;
        state.modified = SystemTime::now();
        self.file.touch(state.modified);
        if !state.dirty {
            state.dirty = true;
            self.file.set_modified(true)?;
        }
        self.schedule_flush(state);
        Ok(())
    }

    /// Upload the content after a quiet period, if so configured.
    fn schedule_flush(&self, state: &mut ContextState) {
        let Some(delay) = self.options.flush_delay() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Some(task) = state.flush_task.take() {
            task.abort();
        }
        let context = self.me.clone();
        state.flush_task = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(context) = context.upgrade() else {
                return;
            };
            let id = context.file.id();
            let result = tokio::task::spawn_blocking(move || context.flush()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(%id, "delayed flush failed: {err}"),
                Err(err) => tracing::warn!(%id, "delayed flush did not run: {err}"),
            }
        }));
    }

    /// Upload modified content, binding the file to the new node.
    ///
    /// Content that changes while the upload is in flight leaves
    /// the file modified.
    pub fn flush(&self) -> Result<()> {
        let generation = {
            let state = self.state.lock();
            if state.cancelled {
                return Err(Error::Cancelled);
            }
            if !state.dirty {
                return Ok(());
            }
            state.generation
        };
        let Some((parent, name)) = self.file.location().filter(|_| !self.file.removed()) else {
            tracing::debug!(id = %self.file.id(), "not uploading unlinked file");
            return Ok(());
        };
        let inodes = self.file.db();
        let bind = inodes.binding(&self.file)?;
        tracing::debug!(id = %self.file.id(), %bind, "uploading {parent}/{name}");
        let info = match self.client.upload(self.info.path(), &name, parent, &bind) {
            Ok(info) => info,
            Err(err) => {
                inodes.unbind(&self.file)?;
                return Err(err);
            }
        };
        inodes.bound(&self.file, &info)?;
        let mut state = self.state.lock();
        if state.generation == generation {
            state.dirty = false;
            self.file.set_modified(false)?;
        }
        Ok(())
    }

    /// Abort every fetch and fail all pending reads.
    ///
    /// Safe to call more than once and concurrently with completion.
    pub fn cancel(&self) {
        let fetches = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            if let Some(task) = state.flush_task.take() {
                task.abort();
            }
            let fetching: Vec<_> = state
                .ranges
                .iter()
                .filter_map(|(id, _, segment)| match segment {
                    Segment::Fetching(fetch) => Some((id, Arc::clone(fetch))),
                    Segment::Present => None,
                })
                .collect();
            for (id, _) in &fetching {
                state.ranges.remove_entry(*id);
            }
            fetching
        };
        tracing::debug!(id = %self.file.id(), "cancelling {} fetch(es)", fetches.len());
        for (_, fetch) in fetches {
            fetch.cancel();
        }
    }
}

/// Merge a completed entry with its contiguous, completed neighbours.
fn coalesce(ranges: &mut FileRangeTree<Segment>, id: EntryId) {
    let Some((range, _)) = ranges.get(id) else {
        return;
    };
    let present = |ranges: &FileRangeTree<Segment>, id: EntryId| {
        ranges
            .get(id)
            .filter(|(_, s)| matches!(s, Segment::Present))
            .map(|(r, _)| r)
    };
    let (mut first, mut begin) = (id, range.begin);
    while let Some(prev) = ranges.prev(first) {
        match present(ranges, prev) {
            Some(r) if r.end == begin => (first, begin) = (prev, r.begin),
            _ => break,
        }
    }
    let (mut last, mut end) = (id, range.end);
    while let Some(next) = ranges.next(last) {
        match present(ranges, next) {
            Some(r) if r.begin == end => (last, end) = (next, r.end),
            _ => break,
        }
    }
    if first == last {
        return;
    }
    let after = ranges.next(last);
    ranges.remove_span(first, after);
    ranges.add(FileRange::new(begin, end), Segment::Present);
}

/// Grow a fully cached file, the new bytes being zeros.
fn extend(state: &mut ContextState, size: u64) {
    let (id, _) = state
        .ranges
        .add(FileRange::new(state.size, size), Segment::Present);
    if let Some(id) = id {
        coalesce(&mut state.ranges, id);
    }
    state.size = size;
}

/// Shrink the file, returning the fetches that are no longer needed.
fn shrink(state: &mut ContextState, size: u64) -> Vec<Arc<RangeFetch>> {
    let beyond: Vec<_> = state
        .ranges
        .find(FileRange::new(size, state.size))
        .map(|(id, range, segment)| (id, range, segment.clone()))
        .collect();
    let mut doomed = Vec::new();
    for (id, range, segment) in beyond {
        state.ranges.remove_entry(id);
        match segment {
            Segment::Fetching(fetch) => doomed.push(fetch),
            Segment::Present if range.begin < size => {
                state
                    .ranges
                    .add(FileRange::new(range.begin, size), Segment::Present);
            }
            Segment::Present => {}
        }
    }
    state.size = size;
    doomed
}

/// Delivers the progress of one fetch to its context.
struct FetchCallback {
    context: Weak<FileIOContext>,
    fetch: Arc<RangeFetch>,
}

impl PartialDownloadCallback for FetchCallback {
    fn data(&self, buffer: &[u8], offset: u64) -> Result<()> {
        let Some(context) = self.context.upgrade() else {
            return Err(Error::Cancelled);
        };
        if context.is_cancelled() {
            return Err(Error::Cancelled);
        }
        context.info.write_at(buffer, offset)
    }

    fn failed(&self, error: &Error, retries: u32) -> RetryDecision {
        match self.context.upgrade() {
            Some(context) => context.retry_decision(error, retries),
            None => RetryDecision::Abort,
        }
    }

    fn completed(&self, result: Result<()>) {
        match self.context.upgrade() {
            Some(context) => context.completed(&self.fetch, result),
            None => self.fetch.finish(FetchOutcome::Cancelled),
        }
    }
}
