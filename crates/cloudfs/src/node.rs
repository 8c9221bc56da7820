// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::time::SystemTime;

use crate::{BindHandle, NodeHandle};

/// The level of access granted over a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Permissions {
    #[default]
    ReadOnly,
    ReadWrite,
    Full,
}

impl Permissions {
    /// Unix permission bits that best represent this level of access.
    pub fn mode(&self, is_directory: bool) -> u16 {
        match (self, is_directory) {
            (Permissions::ReadOnly, true) => 0o555,
            (Permissions::ReadOnly, false) => 0o444,
            (Permissions::ReadWrite, true) => 0o555,
            (Permissions::ReadWrite, false) => 0o644,
            (Permissions::Full, true) => 0o755,
            (Permissions::Full, false) => 0o644,
        }
    }
}

/// A description of a node as reported by the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub handle: NodeHandle,
    /// The containing directory, absent only for the root.
    pub parent: Option<NodeHandle>,
    pub name: String,
    pub modified: SystemTime,
    pub size: u64,
    pub is_directory: bool,
    pub permissions: Permissions,
    /// Set when this node was produced by one of our uploads.
    pub bind: Option<BindHandle>,
}

/// What happened to a node, as pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEventKind {
    Added,
    Modified,
    Moved,
    Permissions,
    Removed,
}

/// A single server-pushed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub info: NodeInfo,
}

impl NodeEvent {
    pub fn new(kind: NodeEventKind, info: NodeInfo) -> Self {
        Self { kind, info }
    }
}

/// Server-pushed changes in the order they were received.
pub type NodeEventQueue = std::collections::VecDeque<NodeEvent>;
