//! End-to-end coverage through the public API: small hand-checked trees,
//! persistence across reopen, a custom comparator, masked scans and bulk
//! randomized insert/remove runs cross-checked against `BTreeSet`.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use disktree::{BTree, RecordComparator};

fn range_bytes(tree: &BTree, min: Option<&[u8]>, max: Option<&[u8]>) -> Vec<u8> {
    let mut iter = tree.iterate_range(min, max);
    let mut out = Vec::new();
    while let Some(value) = iter.next().unwrap() {
        out.push(value[0]);
    }
    out
}

#[test]
fn letter_workload_small_pages() {
    let dir = tempdir().unwrap();
    let mut tree = BTree::open(dir.path().join("letters.dat"), 28, 1).unwrap();

    for v in b"CNGAHEKQMFWLTZDPRXYS" {
        assert_eq!(tree.insert(&[*v]).unwrap(), None);
    }

    assert_eq!(range_bytes(&tree, Some(b"I"), Some(b"V")), b"KLMNPQRST");

    for v in b"HTRE" {
        assert_eq!(tree.remove(&[*v]).unwrap(), Some(vec![*v]));
        assert_eq!(tree.get(&[*v]).unwrap(), None);
    }

    // Everything else survives the rebalancing.
    for v in b"CNGAKQMFWLZDPXYS" {
        assert_eq!(tree.get(&[*v]).unwrap(), Some(vec![*v]), "lost {}", *v as char);
    }
    assert_eq!(range_bytes(&tree, None, None), b"ACDFGKLMNPQSWXYZ");

    tree.close().unwrap();
}

#[test]
fn values_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.dat");

    let mut tree = BTree::open(&path, 28, 1).unwrap();
    for v in b"CNGAHEKQMFWLTZDPRXYS" {
        tree.insert(&[*v]).unwrap();
    }
    tree.close().unwrap();

    let tree = BTree::open(&path, 28, 1).unwrap();
    assert_eq!(tree.block_size(), 28);
    assert_eq!(tree.value_size(), 1);
    assert_eq!(range_bytes(&tree, None, None), b"ACDEFGHKLMNPQRSTWXYZ");
    tree.close().unwrap();
}

#[test]
fn reopen_rejects_a_different_value_size() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("vs.dat");
    BTree::open(&path, 501, 13).unwrap().close().unwrap();

    let err = BTree::open(&path, 501, 17).unwrap_err();
    assert!(err.to_string().contains("value size"), "got: {err}");
}

#[test]
fn removal_shrinks_back_to_an_empty_tree() {
    let dir = tempdir().unwrap();
    let mut tree = BTree::open(dir.path().join("shrink.dat"), 28, 1).unwrap();

    let values: Vec<u8> = (b'a'..=b'z').collect();
    for v in &values {
        tree.insert(&[*v]).unwrap();
    }
    // Remove in a different order than insertion to hit borrow and merge
    // paths on both sides.
    for v in values.iter().rev() {
        assert_eq!(tree.remove(&[*v]).unwrap(), Some(vec![*v]));
    }

    assert!(tree.is_empty());
    assert_eq!(range_bytes(&tree, None, None), b"");

    // Reusable after going empty.
    tree.insert(b"q").unwrap();
    assert_eq!(tree.get(b"q").unwrap(), Some(b"q".to_vec()));
    tree.close().unwrap();
}

/// Orders records by their last byte, breaking ties on the full record.
struct LastByteComparator;

impl RecordComparator for LastByteComparator {
    fn compare(&self, key: &[u8], buf: &[u8], offset: usize, len: usize) -> Ordering {
        let stored = &buf[offset..offset + len];
        key[len - 1]
            .cmp(&stored[len - 1])
            .then_with(|| key.cmp(stored))
    }
}

#[test]
fn custom_comparator_controls_iteration_order() {
    let dir = tempdir().unwrap();
    let mut tree = BTree::open_with_options(
        dir.path().join("cmp.dat"),
        64,
        2,
        Box::new(LastByteComparator),
        false,
    )
    .unwrap();

    for v in [[b'a', 3u8], [b'b', 1], [b'c', 2], [b'd', 1]] {
        tree.insert(&v).unwrap();
    }

    let mut iter = tree.iterate_range(None, None);
    let mut order = Vec::new();
    while let Some(value) = iter.next().unwrap() {
        order.push(value);
    }
    assert_eq!(
        order,
        vec![
            vec![b'b', 1],
            vec![b'd', 1],
            vec![b'c', 2],
            vec![b'a', 3],
        ]
    );
    drop(iter);

    assert_eq!(tree.get(&[b'c', 2]).unwrap(), Some(vec![b'c', 2]));
    assert_eq!(tree.remove(&[b'b', 1]).unwrap(), Some(vec![b'b', 1]));
    assert_eq!(tree.get(&[b'b', 1]).unwrap(), None);
    tree.close().unwrap();
}

#[test]
fn masked_matching_on_full_and_empty_masks() {
    let dir = tempdir().unwrap();
    let mut tree = BTree::open(dir.path().join("mask.dat"), 64, 2).unwrap();

    let values = [[1u8, 10u8], [1, 20], [2, 10], [2, 20], [3, 30]];
    for v in &values {
        tree.insert(v).unwrap();
    }

    // All-zero mask matches every stored value.
    let mut iter = tree.iterate_matching(&[0xff, 0xff], &[0x00, 0x00]);
    let mut count = 0;
    while iter.next().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, values.len());
    drop(iter);

    // All-ones mask demands full equality.
    let mut iter = tree.iterate_matching(&[2, 10], &[0xff, 0xff]);
    assert_eq!(iter.next().unwrap(), Some(vec![2, 10]));
    assert_eq!(iter.next().unwrap(), None);
    drop(iter);

    // Partial mask: first byte must be 1, in sorted order via the range side.
    let mut iter = tree.iterate_range_matching(&[1, 0], &[0xff, 0x00], None, None);
    assert_eq!(iter.next().unwrap(), Some(vec![1, 10]));
    assert_eq!(iter.next().unwrap(), Some(vec![1, 20]));
    assert_eq!(iter.next().unwrap(), None);
    drop(iter);
    tree.close().unwrap();
}

#[test]
fn clear_then_reuse() {
    let dir = tempdir().unwrap();
    let mut tree = BTree::open(dir.path().join("clear.dat"), 28, 1).unwrap();

    for v in b"abcdefghij" {
        tree.insert(&[*v]).unwrap();
    }
    tree.clear().unwrap();
    assert!(tree.is_empty());

    for v in b"xyz" {
        tree.insert(&[*v]).unwrap();
    }
    assert_eq!(range_bytes(&tree, None, None), b"xyz");
    tree.close().unwrap();
}

fn random_workload(value_count: usize, remove_count: usize) {
    let dir = tempdir().unwrap();
    let mut tree = BTree::open(dir.path().join("bulk.dat"), 501, 13).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut expected: BTreeSet<[u8; 13]> = BTreeSet::new();
    while expected.len() < value_count {
        let mut value = [0u8; 13];
        rng.fill(&mut value[..]);
        if expected.insert(value) {
            assert_eq!(tree.insert(&value).unwrap(), None);
        }
    }

    // Point lookups for a sample.
    for value in expected.iter().step_by(97) {
        assert_eq!(tree.get(value).unwrap(), Some(value.to_vec()));
    }

    // Full sorted iteration matches the reference set.
    let mut iter = tree.iterate_range(None, None);
    let mut reference = expected.iter();
    while let Some(value) = iter.next().unwrap() {
        assert_eq!(Some(value.as_slice()), reference.next().map(|v| &v[..]));
    }
    assert_eq!(reference.next(), None);
    drop(iter);

    // A bounded range somewhere in the middle.
    let bounds: Vec<[u8; 13]> = expected.iter().copied().skip(value_count / 3).take(2_000).collect();
    if let (Some(min), Some(max)) = (bounds.first(), bounds.last()) {
        let mut iter = tree.iterate_range(Some(&min[..]), Some(&max[..]));
        let mut reference = expected.range(*min..=*max);
        while let Some(value) = iter.next().unwrap() {
            assert_eq!(Some(value.as_slice()), reference.next().map(|v| &v[..]));
        }
        assert_eq!(reference.next(), None);
        drop(iter);
    }

    // Remove a slice of the values and re-verify.
    let victims: Vec<[u8; 13]> = expected.iter().copied().step_by(3).take(remove_count).collect();
    for value in &victims {
        assert_eq!(tree.remove(value).unwrap(), Some(value.to_vec()));
        expected.remove(value);
    }
    for value in &victims {
        assert_eq!(tree.get(value).unwrap(), None);
    }
    for value in expected.iter().step_by(101) {
        assert_eq!(tree.get(value).unwrap(), Some(value.to_vec()));
    }

    tree.close().unwrap();
}

#[test]
fn bulk_random_insert_lookup_remove() {
    random_workload(20_000, 6_000);
}

#[test]
#[ignore = "slow full-size run"]
fn bulk_random_insert_lookup_remove_large() {
    random_workload(100_000, 30_000);
}
