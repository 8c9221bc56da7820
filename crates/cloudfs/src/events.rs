// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Application of server-pushed changes to the inode index.
//!
//! Events arrive on a different channel than the responses to our
//! own requests so the two have no total order. A local change wins
//! until the server echoes it back: moves record the location they
//! produced and events that disagree with it are ignored, files with
//! unflushed content ignore modifications and only a removal always
//! applies.

use std::time::Instant;

use crate::inode::InodeRef;
use crate::{InodeDB, NodeEvent, NodeEventKind, NodeEventQueue, NodeHandle, NodeInfo, Result};

#[cfg(test)]
#[path = "./events_test.rs"]
mod events_test;

impl InodeDB {
    /// Apply a batch of server events in the order they were received.
    ///
    /// The queue is drained even when the batch is discarded.
    pub fn updated(&self, events: &mut NodeEventQueue) {
        if self.discarding() {
            tracing::debug!("discarding {} node event(s)", events.len());
            events.clear();
            return;
        }
        let start = Instant::now();
        let count = events.len();
        for event in events.drain(..) {
            if let Err(err) = self.apply(&event) {
                tracing::warn!(
                    kind = ?event.kind,
                    handle = %event.info.handle,
                    "failed to apply node event: {err}"
                );
            }
        }
        tracing::debug!("applied {count} node event(s) in {:?}", start.elapsed());
    }

    fn apply(&self, event: &NodeEvent) -> Result<()> {
        tracing::trace!(kind = ?event.kind, handle = %event.info.handle, name = %event.info.name);
        match event.kind {
            NodeEventKind::Added => self.node_added(&event.info),
            NodeEventKind::Modified => self.node_modified(&event.info),
            NodeEventKind::Moved => self.node_moved(&event.info),
            NodeEventKind::Permissions => self.node_permissions(&event.info),
            NodeEventKind::Removed => self.node_removed(&event.info),
        }
    }

    fn node_added(&self, info: &NodeInfo) -> Result<()> {
        if let Some(bind) = &info.bind {
            if let Some(file) = self.binding_for(bind) {
                // our own upload completed
                return self.bound(&file, info);
            }
        }
        if let Some(inode) = self.resident_by_handle(info.handle) {
            return inode.info(info);
        }
        let Some(parent) = info.parent else {
            return Ok(());
        };
        self.evict(parent, &info.name, info.handle)
    }

    /// Make room for a node that now lives at `parent/name`,
    /// unless whatever is there holds local state.
    fn evict(&self, parent: NodeHandle, name: &str, handle: NodeHandle) -> Result<()> {
        if let Some(occupant) = self.resident_child(parent, name) {
            if occupant.handle() == Some(handle) {
                return Ok(());
            }
            if has_local_state(&occupant) {
                tracing::debug!(id = %occupant.id(), "keeping local {parent}/{name}");
                return Ok(());
            }
            return occupant.set_removed(true);
        }
        let row = self
            .database()
            .transaction(|tx| tx.by_name(parent, name))?;
        if let Some(row) = row {
            if row.handle == Some(handle) {
                return Ok(());
            }
            if row.modified || row.handle.is_none() {
                tracing::debug!(id = %row.id, "keeping local {parent}/{name}");
                return Ok(());
            }
            self.purge(&row)?;
        }
        Ok(())
    }

    fn node_modified(&self, info: &NodeInfo) -> Result<()> {
        let Some(inode) = self.resident_by_handle(info.handle) else {
            return Ok(());
        };
        let mut state = inode.state.lock();
        if state.dirty {
            tracing::debug!(id = %inode.id(), "ignoring modification of locally changed file");
            return Ok(());
        }
        state.modified = info.modified;
        state.permissions = info.permissions;
        state.size = info.size;
        Ok(())
    }

    fn node_moved(&self, info: &NodeInfo) -> Result<()> {
        let Some(parent) = info.parent else {
            return Ok(());
        };
        let destination = (parent, info.name.clone());
        if let Some(inode) = self.resident_by_handle(info.handle) {
            {
                let mut state = inode.state.lock();
                if let Some(pending) = state.unacknowledged.clone() {
                    if pending == destination {
                        tracing::trace!(id = %inode.id(), "move acknowledged");
                        state.unacknowledged = None;
                    } else {
                        tracing::debug!(id = %inode.id(), "ignoring move, local move pending");
                    }
                    return Ok(());
                }
            }
            if inode.location().as_ref() == Some(&destination) {
                return Ok(());
            }
            self.evict(parent, &info.name, info.handle)?;
            return match inode.moved(&info.name, parent) {
                Err(crate::Error::AlreadyExists(_)) if !has_local_state(&inode) => {
                    // the destination is held locally, drop our copy
                    inode.set_removed(true)
                }
                result => result,
            };
        }
        let row = self
            .database()
            .transaction(|tx| tx.by_handle(info.handle))?;
        if let Some(row) = row {
            if row.location.as_ref() != Some(&destination) {
                self.evict(parent, &info.name, info.handle)?;
                self.database()
                    .transaction(|tx| tx.set_location(row.id, parent, &info.name))?;
            }
        }
        Ok(())
    }

    fn node_permissions(&self, info: &NodeInfo) -> Result<()> {
        if let Some(inode) = self.resident_by_handle(info.handle) {
            inode.state.lock().permissions = info.permissions;
        }
        Ok(())
    }

    fn node_removed(&self, info: &NodeInfo) -> Result<()> {
        if let Some(inode) = self.resident_by_handle(info.handle) {
            return inode.set_removed(true);
        }
        let row = self
            .database()
            .transaction(|tx| tx.by_handle(info.handle))?;
        if let Some(row) = row {
            self.purge(&row)?;
        }
        Ok(())
    }
}

/// True if the inode holds something the cloud does not know about.
fn has_local_state(inode: &InodeRef) -> bool {
    let state = inode.state.lock();
    state.dirty || state.handle.is_none() || state.unacknowledged.is_some()
}
