// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use proptest::collection::vec;
use proptest::prelude::*;
use rstest::rstest;

use super::{FileRange, FileRangeTree};

fn range(begin: u64, end: u64) -> FileRange {
    FileRange::new(begin, end)
}

fn assert_partitioned<V>(tree: &FileRangeTree<V>) {
    let ranges = tree.ranges();
    for window in ranges.windows(2) {
        assert!(
            window[0].end <= window[1].begin,
            "{} and {} overlap or are unsorted",
            window[0],
            window[1]
        );
    }
    assert!(ranges.iter().all(|r| !r.is_empty()));
    assert_eq!(ranges.len(), tree.len());
}

#[rstest]
fn test_add_clips_and_rejects() {
    let mut tree = FileRangeTree::new();

    let (first, added) = tree.add(range(2, 4), 'a');
    assert!(added);

    // the beginning is free, the end runs into (2, 4)
    let (id, added) = tree.add(range(1, 3), 'b');
    assert!(added);
    assert_eq!(tree.get(id.unwrap()).map(|(r, _)| r), Some(range(1, 2)));

    // the beginning is already covered by (2, 4)
    let (id, added) = tree.add(range(3, 5), 'c');
    assert!(!added);
    assert_eq!(id, first);

    let (id, added) = tree.add(range(0, 5), 'd');
    assert!(added);
    assert_eq!(tree.get(id.unwrap()).map(|(r, _)| r), Some(range(0, 1)));

    let (_, added) = tree.add(range(4, 6), 'e');
    assert!(added);

    assert_eq!(
        tree.ranges(),
        vec![range(0, 1), range(1, 2), range(2, 4), range(4, 6)]
    );
    assert_partitioned(&tree);
}

#[rstest]
fn test_add_covered_range_is_idempotent() {
    let mut tree = FileRangeTree::new();
    let (existing, _) = tree.add(range(0, 128), ());
    let (id, added) = tree.add(range(16, 64), ());
    assert!(!added);
    assert_eq!(id, existing);
    assert_eq!(tree.ranges(), vec![range(0, 128)]);
}

#[rstest]
fn test_add_empty_range() {
    let mut tree = FileRangeTree::new();
    assert_eq!(tree.add(range(5, 5), ()), (None, false));
    assert!(tree.is_empty());
}

#[rstest]
fn test_try_add_builds_value_from_clipped_range() {
    let mut tree = FileRangeTree::new();
    tree.add(range(10, 20), FileRange::default());
    let (id, added) = tree.try_add(range(0, 15), |clipped| clipped);
    assert!(added);
    let (_, value) = tree.get(id.unwrap()).unwrap();
    assert_eq!(*value, range(0, 10));

    let mut built = false;
    let (_, added) = tree.try_add(range(12, 30), |r| {
        built = true;
        r
    });
    assert!(!added);
    assert!(!built, "value should not be built when nothing is added");
}

#[rstest]
#[case(range(0, 10), vec![])]
#[case(range(10, 20), vec![range(10, 20)])]
#[case(range(15, 16), vec![range(10, 20)])]
#[case(range(19, 31), vec![range(10, 20), range(30, 40)])]
#[case(range(20, 30), vec![])]
#[case(range(0, 100), vec![range(10, 20), range(30, 40), range(50, 60)])]
#[case(range(60, 100), vec![])]
#[case(range(12, 12), vec![])]
fn test_find(#[case] query: FileRange, #[case] expected: Vec<FileRange>) {
    let mut tree = FileRangeTree::new();
    for r in [range(10, 20), range(30, 40), range(50, 60)] {
        tree.add(r, ());
    }
    let found: Vec<_> = tree.find(query).map(|(_, r, _)| r).collect();
    assert_eq!(found, expected);
}

#[rstest]
fn test_remove_overlapping() {
    let mut tree = FileRangeTree::new();
    for r in [range(10, 20), range(30, 40), range(50, 60)] {
        tree.add(r, ());
    }
    let next = tree.remove(range(15, 35));
    assert_eq!(tree.ranges(), vec![range(50, 60)]);
    assert_eq!(next.and_then(|id| tree.get(id)).map(|(r, _)| r), Some(range(50, 60)));
    assert_eq!(tree.remove(range(50, 60)), None);
    assert!(tree.is_empty());
}

#[rstest]
fn test_remove_span_and_navigation() {
    let mut tree = FileRangeTree::new();
    let ids: Vec<_> = [range(0, 1), range(1, 2), range(2, 3), range(3, 4)]
        .into_iter()
        .map(|r| tree.add(r, r.begin).0.unwrap())
        .collect();
    assert_eq!(tree.first(), Some(ids[0]));
    assert_eq!(tree.last(), Some(ids[3]));
    assert_eq!(tree.next(ids[1]), Some(ids[2]));
    assert_eq!(tree.prev(ids[1]), Some(ids[0]));
    assert_eq!(tree.prev(ids[0]), None);
    assert_eq!(tree.root(), Some(ids[2]));

    let end = tree.remove_span(ids[1], Some(ids[3]));
    assert_eq!(end, Some(ids[3]));
    assert_eq!(tree.ranges(), vec![range(0, 1), range(3, 4)]);

    let (removed, value) = tree.remove_entry(ids[0]).unwrap();
    assert_eq!((removed, value), (range(0, 1), 0));
    assert!(tree.remove_entry(ids[0]).is_none(), "ids are invalid once removed");

    tree.remove_span(ids[3], None);
    assert!(tree.is_empty());
    assert_eq!(tree.root(), None);
}

#[rstest]
fn test_removed_slots_are_reused() {
    let mut tree = FileRangeTree::new();
    let (a, _) = tree.add(range(0, 10), "a");
    tree.remove_entry(a.unwrap());
    let (b, _) = tree.add(range(20, 30), "b");
    assert_eq!(a, b);
    assert_eq!(tree.get(b.unwrap()), Some((range(20, 30), &"b")));
    tree.clear();
    assert!(tree.is_empty());
    assert_eq!(tree.get(b.unwrap()), None);
}

#[derive(Debug, Clone)]
enum Op {
    Add(u64, u64),
    Remove(u64, u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    (any::<bool>(), 0u64..512, 0u64..64).prop_map(|(add, begin, len)| {
        if add {
            Op::Add(begin, begin + len)
        } else {
            Op::Remove(begin, begin + len)
        }
    })
}

proptest! {
    #[test]
    fn prop_test_ranges_never_overlap(ops in vec(arb_op(), 1..64)) {
        let mut tree = FileRangeTree::new();
        for op in ops {
            match op {
                Op::Add(begin, end) => {
                    tree.add(range(begin, end), ());
                }
                Op::Remove(begin, end) => {
                    tree.remove(range(begin, end));
                    prop_assert!(tree.find(range(begin, end)).next().is_none());
                }
            }
            assert_partitioned(&tree);
        }
    }
}
