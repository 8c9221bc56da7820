// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::fmt;

#[cfg(test)]
#[path = "./ids_test.rs"]
mod ids_test;

/// Identifies a specific node (and version) in the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub u64);

impl NodeHandle {
    /// Convert a stored database value back into a handle.
    pub(crate) fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    pub(crate) fn as_i64(self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

/// Correlates an upload in progress with the node it will produce.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindHandle(String);

impl BindHandle {
    /// Generate a new, unique, bind handle.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BindHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for BindHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stable local identity for a filesystem object.
///
/// Identities come from two disjoint ranges. Objects that exist in
/// the cloud when first seen take an identity derived from their
/// node handle, while files that only exist locally are given a
/// synthetic identity from a monotonic counter. Either way, the
/// identity never changes once assigned, even when uploading a
/// new version of a file changes its node handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeID(u64);

impl InodeID {
    /// Marks identities drawn from the synthetic counter.
    const SYNTHETIC: u64 = 1 << 63;

    /// The identity derived from a cloud node handle.
    pub fn from_handle(handle: NodeHandle) -> Self {
        debug_assert!(handle.0 & Self::SYNTHETIC == 0);
        Self(handle.0 & !Self::SYNTHETIC)
    }

    /// The synthetic identity for the given counter value.
    pub fn synthetic(counter: u64) -> Self {
        Self(counter | Self::SYNTHETIC)
    }

    pub fn is_synthetic(&self) -> bool {
        self.0 & Self::SYNTHETIC != 0
    }

    /// The node handle this identity was derived from, if any.
    pub fn handle(&self) -> Option<NodeHandle> {
        (!self.is_synthetic()).then_some(NodeHandle(self.0))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub(crate) fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    pub(crate) fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// The stem used to name this identity's cache file.
    pub fn file_name(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// Recover an identity from a cache file name produced
    /// by [`Self::file_name`], ignoring any extension.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.get(..16)?;
        if name.len() > 16 && !name[16..].starts_with('.') {
            return None;
        }
        u64::from_str_radix(stem, 16).ok().map(Self)
    }
}

impl fmt::Display for InodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
