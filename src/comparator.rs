//! Pluggable ordering for fixed-width records.
//!
//! The tree never interprets record bytes itself; every ordering decision
//! goes through a [`RecordComparator`]. Comparison is expressed against a
//! region of a node's page buffer so that search does not have to copy the
//! stored value out first.

use std::cmp::Ordering;

/// Total order over fixed-width records.
///
/// Implementations compare a candidate `key` against `len` bytes of `buf`
/// starting at `offset`. The order must be consistent with byte-array
/// equality for records of the tree's value size, and the same comparator
/// must be used for the whole lifetime of a tree file: the comparator's
/// identity is not persisted in the file header.
pub trait RecordComparator: Send + Sync {
    fn compare(&self, key: &[u8], buf: &[u8], offset: usize, len: usize) -> Ordering;
}

/// Unsigned bytewise lexicographic order, the default for new trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRecordComparator;

impl RecordComparator for DefaultRecordComparator {
    fn compare(&self, key: &[u8], buf: &[u8], offset: usize, len: usize) -> Ordering {
        key.cmp(&buf[offset..offset + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_regions_compare_equal() {
        let cmp = DefaultRecordComparator;
        let buf = [0xab, 0xcd, 0xef, 0x01];
        assert_eq!(cmp.compare(&[0xcd, 0xef], &buf, 1, 2), Ordering::Equal);
    }

    #[test]
    fn comparison_is_unsigned() {
        let cmp = DefaultRecordComparator;
        // 0x80 must sort above 0x7f, not below it.
        assert_eq!(cmp.compare(&[0x80], &[0x7f], 0, 1), Ordering::Greater);
        assert_eq!(cmp.compare(&[0x00], &[0xff], 0, 1), Ordering::Less);
    }

    #[test]
    fn offset_selects_region() {
        let cmp = DefaultRecordComparator;
        let buf = [b'a', b'b', b'c', b'd'];
        assert_eq!(cmp.compare(b"cd", &buf, 2, 2), Ordering::Equal);
        assert_eq!(cmp.compare(b"cd", &buf, 0, 2), Ordering::Greater);
    }

    #[test]
    fn shorter_key_sorts_before_its_extensions() {
        let cmp = DefaultRecordComparator;
        let buf = [b'a', b'b', b'c'];
        assert_eq!(cmp.compare(b"ab", &buf, 0, 3), Ordering::Less);
    }
}
