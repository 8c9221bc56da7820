// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The cloud collaborators this crate is built against.
//!
//! Transport, authentication and the retry policy of individual
//! requests all live behind these traits.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::{BindHandle, Error, NodeHandle, NodeInfo, Result};

/// What a partial download should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up and complete the download with the failure.
    Abort,
    /// Try again after the given delay.
    Retry(Duration),
}

/// Receives the progress of a [`PartialDownload`].
pub trait PartialDownloadCallback: Send + Sync {
    /// Called for each chunk of content, `offset` being the
    /// chunk's position within the file.
    ///
    /// Returning an error aborts the download.
    fn data(&self, buffer: &[u8], offset: u64) -> Result<()>;

    /// Called whenever an attempt fails, the callback decides
    /// whether the download is retried.
    fn failed(&self, error: &Error, retries: u32) -> RetryDecision;

    /// Called exactly once, when the download finishes for any reason.
    fn completed(&self, result: Result<()>);
}

/// A cancellable, range-limited fetch of a file's content.
pub trait PartialDownload: Send + Sync {
    /// Start transferring content to the given callback.
    fn begin(&self, callback: Arc<dyn PartialDownloadCallback>) -> Result<()>;

    /// Request cancellation, false if the download has already
    /// completed or was already cancelled.
    fn cancel(&self) -> bool;

    fn cancelled(&self) -> bool;

    fn completed(&self) -> bool;
}

/// The cloud's view of the directory tree.
pub trait Client: Send + Sync {
    /// The handle of the root directory.
    fn root(&self) -> NodeHandle;

    /// Describe the node with the given handle.
    fn get(&self, handle: NodeHandle) -> Option<NodeInfo>;

    /// Describe the child of `parent` with the given name.
    fn child(&self, parent: NodeHandle, name: &str) -> Option<NodeInfo>;

    /// Describe every child of `parent`.
    fn children(&self, parent: NodeHandle) -> Result<Vec<NodeInfo>>;

    fn has_children(&self, parent: NodeHandle) -> Result<bool> {
        Ok(!self.children(parent)?.is_empty())
    }

    fn make_directory(&self, name: &str, parent: NodeHandle) -> Result<NodeInfo>;

    /// Move and or rename a node.
    fn move_node(&self, handle: NodeHandle, name: &str, parent: NodeHandle) -> Result<()>;

    fn remove(&self, handle: NodeHandle) -> Result<()>;

    /// Upload content as `name` under `parent`, replacing any
    /// existing file of that name.
    fn upload(
        &self,
        content: &Path,
        name: &str,
        parent: NodeHandle,
        bind: &BindHandle,
    ) -> Result<NodeInfo>;

    /// Prepare to fetch `length` bytes of a file starting at `offset`.
    fn partial_download(
        &self,
        handle: NodeHandle,
        offset: u64,
        length: u64,
    ) -> Result<Arc<dyn PartialDownload>>;
}
