// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! An interval index over the byte ranges of a single file.
//!
//! Entries live in an arena and are addressed by a stable
//! [`EntryId`]. Two ordered indices refer into the arena, one keyed
//! by where each range begins and one keyed by where it ends.
//! Because stored ranges never overlap (and are never empty) both
//! keys are unique. An entry is always present in both indices or
//! in neither.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};

#[cfg(test)]
#[path = "./range_tree_test.rs"]
mod range_tree_test;

/// A half-open interval of bytes, `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct FileRange {
    pub begin: u64,
    pub end: u64,
}

impl FileRange {
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin <= end, "range must not end before it begins");
        Self { begin, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    /// True if any byte is shared by both ranges.
    pub fn overlaps(&self, other: &FileRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// True if every byte of `other` is within this range.
    pub fn contains(&self, other: &FileRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }
}

impl fmt::Display for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Stable address of an entry within a [`FileRangeTree`].
///
/// An id remains valid until its entry is removed, after which
/// it may be reused for a later entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(usize);

#[derive(Debug)]
struct Node<V> {
    range: FileRange,
    value: V,
}

/// Non-overlapping byte ranges of one file, each carrying a value.
#[derive(Debug)]
pub struct FileRangeTree<V> {
    nodes: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    by_begin: BTreeMap<u64, EntryId>,
    by_end: BTreeMap<u64, EntryId>,
}

impl<V> Default for FileRangeTree<V> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            by_begin: BTreeMap::new(),
            by_end: BTreeMap::new(),
        }
    }
}

impl<V> FileRangeTree<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range carrying the given value.
    ///
    /// If a stored range already covers the beginning of `range`,
    /// nothing is added and that entry is returned along with
    /// `false`. Otherwise the range is clipped so that it ends where
    /// the next stored range begins, then inserted.
    ///
    /// Empty ranges are never stored, `(None, false)` is returned.
    pub fn add(&mut self, range: FileRange, value: V) -> (Option<EntryId>, bool) {
        self.try_add(range, move |_| value)
    }

    /// Like [`Self::add`], but the value is only built if an entry is
    /// actually inserted, and is given the (possibly clipped) range.
    pub fn try_add<F>(&mut self, mut range: FileRange, make: F) -> (Option<EntryId>, bool)
    where
        F: FnOnce(FileRange) -> V,
    {
        if range.is_empty() {
            return (None, false);
        }
        if let Some(other) = self.ends_after(range.begin) {
            let existing = self.range_of(other);
            if existing.begin <= range.begin {
                return (Some(other), false);
            }
            range.end = range.end.min(existing.begin);
        }
        let value = make(range);
        (Some(self.insert(range, value)), true)
    }

    fn insert(&mut self, range: FileRange, value: V) -> EntryId {
        let node = Some(Node { range, value });
        let id = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                EntryId(slot)
            }
            None => {
                self.nodes.push(node);
                EntryId(self.nodes.len() - 1)
            }
        };
        self.by_begin.insert(range.begin, id);
        self.by_end.insert(range.end, id);
        id
    }

    /// Iterate over every stored entry that overlaps `range`, in order.
    pub fn find(&self, range: FileRange) -> Found<'_, V> {
        let next = if range.is_empty() {
            None
        } else {
            self.ends_after(range.begin)
                .filter(|id| self.range_of(*id).begin < range.end)
        };
        Found {
            tree: self,
            next,
            end: range.end,
        }
    }

    /// Remove every stored entry that overlaps `range`.
    ///
    /// Returns the first remaining entry after the removed ones.
    pub fn remove(&mut self, range: FileRange) -> Option<EntryId> {
        let doomed: Vec<_> = self.find(range).map(|(id, _, _)| id).collect();
        for id in doomed {
            self.remove_entry(id);
        }
        self.by_begin
            .range(range.begin..)
            .next()
            .map(|(_, id)| *id)
    }

    /// Remove a single entry, returning its range and value.
    pub fn remove_entry(&mut self, id: EntryId) -> Option<(FileRange, V)> {
        let node = self.nodes.get_mut(id.0)?.take()?;
        self.by_begin.remove(&node.range.begin);
        self.by_end.remove(&node.range.end);
        self.free.push(id.0);
        Some((node.range, node.value))
    }

    /// Remove the contiguous span of entries starting at `first` and
    /// ending before `end` (or running to the last entry).
    ///
    /// Returns `end`, which remains valid.
    pub fn remove_span(&mut self, first: EntryId, end: Option<EntryId>) -> Option<EntryId> {
        let mut cursor = Some(first);
        while let Some(id) = cursor {
            if Some(id) == end {
                break;
            }
            cursor = self.next(id);
            self.remove_entry(id);
        }
        end
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.by_begin.clear();
        self.by_end.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.by_begin.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_begin.len()
    }

    pub fn get(&self, id: EntryId) -> Option<(FileRange, &V)> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|n| (n.range, &n.value))
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut V> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .map(|n| &mut n.value)
    }

    /// The entry with the lowest beginning.
    pub fn first(&self) -> Option<EntryId> {
        self.by_begin.values().next().copied()
    }

    /// The entry with the highest beginning.
    pub fn last(&self) -> Option<EntryId> {
        self.by_begin.values().next_back().copied()
    }

    /// The entry a balanced search over the tree would visit first.
    pub fn root(&self) -> Option<EntryId> {
        self.by_begin.values().nth(self.len() / 2).copied()
    }

    /// The entry that follows `id` in order.
    pub fn next(&self, id: EntryId) -> Option<EntryId> {
        let begin = self.get(id)?.0.begin;
        self.by_begin
            .range((Excluded(begin), Unbounded))
            .next()
            .map(|(_, id)| *id)
    }

    /// The entry that precedes `id` in order.
    pub fn prev(&self, id: EntryId) -> Option<EntryId> {
        let begin = self.get(id)?.0.begin;
        self.by_begin.range(..begin).next_back().map(|(_, id)| *id)
    }

    /// The first entry whose range ends after `position`.
    pub fn ends_after(&self, position: u64) -> Option<EntryId> {
        self.by_end
            .range((Excluded(position), Unbounded))
            .next()
            .map(|(_, id)| *id)
    }

    /// The first entry whose range begins at or after `position`.
    pub fn begins_at_or_after(&self, position: u64) -> Option<EntryId> {
        self.by_begin.range(position..).next().map(|(_, id)| *id)
    }

    /// Every entry, ordered by where each range begins.
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, FileRange, &V)> + '_ {
        self.by_begin.values().filter_map(move |id| {
            self.get(*id).map(|(range, value)| (*id, range, value))
        })
    }

    /// Every stored range, in order.
    pub fn ranges(&self) -> Vec<FileRange> {
        self.iter().map(|(_, range, _)| range).collect()
    }

    fn range_of(&self, id: EntryId) -> FileRange {
        // ids handed out by the indices always refer to live nodes
        self.get(id).map(|(range, _)| range).unwrap_or_default()
    }
}

/// Entries overlapping a range, see [`FileRangeTree::find`].
pub struct Found<'a, V> {
    tree: &'a FileRangeTree<V>,
    next: Option<EntryId>,
    end: u64,
}

impl<'a, V> Iterator for Found<'a, V> {
    type Item = (EntryId, FileRange, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let (tree, end) = (self.tree, self.end);
        let id = self.next.take()?;
        let (range, value) = tree.get(id)?;
        self.next = tree.next(id).filter(|n| tree.range_of(*n).begin < end);
        Some((id, range, value))
    }
}
