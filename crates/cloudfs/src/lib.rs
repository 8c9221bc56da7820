// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The platform independent core of a cloud-backed filesystem.
//!
//! The [`InodeDB`] gives every directory and file a stable identity
//! and keeps the directory tree consistent with both local operations
//! and changes pushed by the server. The [`FileCache`] holds file
//! content on local disk, fetching only the ranges that are read.

#![deny(unsafe_op_in_unsafe_fn)]

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;

pub mod client;
pub mod config;
pub mod database;
mod error;
mod events;
pub mod file_cache;
pub mod file_io_context;
mod ids;
pub mod inode;
mod inode_db;
mod node;
pub mod range_tree;
mod service;

pub use client::{Client, PartialDownload, PartialDownloadCallback, RetryDecision};
pub use config::{Config, get_config, load_config};
pub use error::{Error, OsError, Result};
pub use file_cache::{FileCache, FileInfo, FileRef};
pub use file_io_context::FileIOContext;
pub use ids::{BindHandle, InodeID, NodeHandle};
pub use inode::{Attributes, Inode, InodeKind, InodeRef};
pub use inode_db::InodeDB;
pub use node::{NodeEvent, NodeEventKind, NodeEventQueue, NodeInfo, Permissions};
pub use range_tree::{FileRange, FileRangeTree};
pub use service::{DirEntry, Service};
