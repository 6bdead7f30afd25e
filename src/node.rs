//! # Node Page Layout and Algorithms
//!
//! This module implements the in-memory representation of one B-tree node
//! page: a value count followed by an alternating run of child pointers and
//! fixed-width values, ending in one trailing child pointer.
//!
//! ## Page Layout
//!
//! ```text
//! +----------------------+
//! | value count (u32)    |  offset 0
//! +----------------------+
//! | child id 0 (u32)     |  offset 4
//! | value 0              |  offset 8
//! | child id 1 (u32)     |  offset 8 + value_size
//! | value 1              |
//! | ...                  |
//! | child id n (u32)     |  trailing pointer, offset 4 + n * slot_size
//! +----------------------+
//! | spare slot           |  in-memory only, never written to disk
//! +----------------------+
//! ```
//!
//! A *slot* is one child pointer plus one value (`slot_size = 4 +
//! value_size` bytes). `child id i` points at the subtree holding values
//! smaller than `value i`; the trailing pointer holds everything larger than
//! the last value. A node is a leaf iff child id 0 is zero.
//!
//! ## Spare Slot
//!
//! The buffer is allocated one slot larger than the on-disk page so that
//! [`Node::split_and_insert`] can first insert the overflowing entry,
//! letting the node briefly hold `branch_factor` values, and then partition
//! at the median. This keeps the split a single straight-line copy instead
//! of a case analysis on the insertion position. Reads and writes are
//! clamped to `node_size`, so the spare slot never reaches the file.
//!
//! ## Sizing
//!
//! All layout arithmetic derives from two creation-time parameters:
//!
//! ```text
//! slot_size       = 4 + value_size
//! branch_factor   = 1 + (block_size - 8) / slot_size
//! min_value_count = (branch_factor - 1) / 2
//! node_size       = 8 + (branch_factor - 1) * slot_size
//! ```
//!
//! ## Mutation and Dirtiness
//!
//! Every mutating operation sets the node's dirty flag; the cache layer
//! writes dirty nodes back on eviction or an explicit flush. Reading a node
//! whose page lies partly or wholly past end-of-file leaves the unread tail
//! zeroed, which decodes as an empty leaf: freshly allocated ids that were
//! never flushed read back as empty nodes rather than as errors.

use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;

use eyre::{Result, WrapErr};

use crate::comparator::RecordComparator;

/// Layout parameters shared by every node of one tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeGeometry {
    pub block_size: u32,
    pub value_size: usize,
    pub slot_size: usize,
    pub branch_factor: usize,
    pub min_value_count: usize,
    pub node_size: usize,
}

impl NodeGeometry {
    pub(crate) fn new(block_size: u32, value_size: u32) -> Self {
        let value_size = value_size as usize;
        let slot_size = 4 + value_size;
        let branch_factor = 1 + (block_size as usize - 8) / slot_size;
        let min_value_count = (branch_factor - 1) / 2;
        let node_size = 8 + (branch_factor - 1) * slot_size;

        Self {
            block_size,
            value_size,
            slot_size,
            branch_factor,
            min_value_count,
            node_size,
        }
    }

    /// File offset of a node page. Ids are 1-based; the header occupies the
    /// space a node id 0 would have.
    pub(crate) fn node_offset(&self, id: u32) -> u64 {
        self.block_size as u64 * id as u64
    }
}

/// One mutable in-memory node page.
#[derive(Debug)]
pub(crate) struct Node {
    id: u32,
    geo: NodeGeometry,
    data: Box<[u8]>,
    value_count: usize,
    dirty: bool,
}

impl Node {
    /// Creates an empty node. The buffer carries one spare slot beyond the
    /// on-disk page size; see the module docs.
    pub(crate) fn new(id: u32, geo: NodeGeometry) -> Self {
        debug_assert!(id > 0, "node id 0 is reserved for 'no node'");

        Self {
            id,
            geo,
            data: vec![0u8; geo.node_size + geo.slot_size].into_boxed_slice(),
            value_count: 0,
            dirty: false,
        }
    }

    pub(crate) fn value_count(&self) -> usize {
        self.value_count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.value_count == 0
    }

    /// A node is full when it holds the maximum storable on disk; the spare
    /// slot is reserved for splits.
    pub(crate) fn is_full(&self) -> bool {
        self.value_count == self.geo.branch_factor - 1
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.child_id(0) == 0
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn value(&self, idx: usize) -> &[u8] {
        let offset = self.value_offset(idx);
        &self.data[offset..offset + self.geo.value_size]
    }

    pub(crate) fn set_value(&mut self, idx: usize, value: &[u8]) {
        let offset = self.value_offset(idx);
        self.data[offset..offset + self.geo.value_size].copy_from_slice(value);
        self.dirty = true;
    }

    pub(crate) fn child_id(&self, idx: usize) -> u32 {
        self.get_u32(self.child_offset(idx))
    }

    pub(crate) fn set_child_id(&mut self, idx: usize, id: u32) {
        self.put_u32(self.child_offset(idx), id);
        self.dirty = true;
    }

    /// Binary search over the node's values. Returns `Ok(index)` on a
    /// comparator match, otherwise `Err(insertion_index)` where
    /// `insertion_index` is the position of the first value greater than
    /// `key` (also the index of the child subtree that may contain `key`).
    pub(crate) fn search(
        &self,
        comparator: &dyn RecordComparator,
        key: &[u8],
    ) -> std::result::Result<usize, usize> {
        let mut low = 0;
        let mut high = self.value_count;

        while low < high {
            let mid = (low + high) / 2;
            match comparator.compare(key, &self.data, self.value_offset(mid), self.geo.value_size)
            {
                std::cmp::Ordering::Less => high = mid,
                std::cmp::Ordering::Greater => low = mid + 1,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }

        Err(low)
    }

    /// Inserts `value` at `idx` with `child_id` as the pointer directly to
    /// its right, shifting later slots one position over. Used for leaf
    /// inserts (child id 0) and for propagating a split's promoted median
    /// into the parent.
    pub(crate) fn insert_value_child_pair(&mut self, idx: usize, value: &[u8], child_id: u32) {
        let offset = self.value_offset(idx);

        if idx < self.value_count {
            self.shift_slot_right(offset, self.value_offset(self.value_count));
        }

        self.data[offset..offset + self.geo.value_size].copy_from_slice(value);
        self.put_u32(offset + self.geo.value_size, child_id);

        self.set_value_count(self.value_count + 1);
        self.dirty = true;
    }

    /// Mirror of [`Node::insert_value_child_pair`]: inserts `child_id`
    /// *before* position `idx` and `value` after it. Used when borrowing an
    /// entry from a left sibling.
    pub(crate) fn insert_child_value_pair(&mut self, idx: usize, child_id: u32, value: &[u8]) {
        let offset = self.child_offset(idx);

        self.shift_slot_right(offset, self.value_offset(self.value_count));

        self.put_u32(offset, child_id);
        self.data[offset + 4..offset + 4 + self.geo.value_size].copy_from_slice(value);

        self.set_value_count(self.value_count + 1);
        self.dirty = true;
    }

    /// Removes the value at `idx` together with the child pointer directly
    /// to its right, returning the removed value.
    pub(crate) fn remove_value_right(&mut self, idx: usize) -> Vec<u8> {
        let value = self.value(idx).to_vec();
        let end = self.value_offset(self.value_count);

        if idx < self.value_count - 1 {
            self.shift_slot_left(self.value_offset(idx + 1), end);
        }

        self.clear_data(end - self.geo.slot_size, end);
        self.set_value_count(self.value_count - 1);
        self.dirty = true;

        value
    }

    /// Removes the value at `idx` together with the child pointer directly
    /// to its left, returning the removed value.
    pub(crate) fn remove_value_left(&mut self, idx: usize) -> Vec<u8> {
        let value = self.value(idx).to_vec();
        let end = self.value_offset(self.value_count);

        self.shift_slot_left(self.child_offset(idx + 1), end);

        self.clear_data(end - self.geo.slot_size, end);
        self.set_value_count(self.value_count - 1);
        self.dirty = true;

        value
    }

    /// Splits a full node. First inserts the `(value, child_id)` pair using
    /// the spare slot, then partitions at the median: entries left of it
    /// stay here, entries right of it (including their trailing pointer)
    /// move into `new_node`, and the median itself is returned for promotion
    /// into the parent. Calling this on a node that is not full produces an
    /// inconsistent pair of nodes.
    pub(crate) fn split_and_insert(
        &mut self,
        value: &[u8],
        child_id: u32,
        idx: usize,
        new_node: &mut Node,
    ) -> Vec<u8> {
        debug_assert!(self.is_full(), "split of a non-full node");

        self.insert_value_child_pair(idx, value, child_id);

        // The node now holds exactly branch_factor values. The median moves
        // to the parent, everything right of it moves to the new node.
        let median_idx = self.geo.branch_factor / 2;
        let median_offset = self.value_offset(median_idx);
        let split_offset = median_offset + self.geo.value_size;
        let tail = self.data.len() - split_offset;

        new_node.data[4..4 + tail].copy_from_slice(&self.data[split_offset..]);

        let median = self.value(median_idx).to_vec();

        let buf_len = self.data.len();
        self.clear_data(median_offset, buf_len);
        self.set_value_count(median_idx);

        new_node.set_value_count(self.geo.branch_factor - median_idx - 1);
        new_node.dirty = true;

        median
    }

    /// Appends the separator demoted from the parent and then the entire
    /// contents of `right`, which is zeroed out and left empty. The caller
    /// must guarantee the combined count fits: this is only used to merge
    /// two minimally occupied siblings.
    pub(crate) fn merge_with_right_sibling(&mut self, separator: &[u8], right: &mut Node) {
        self.set_value(self.value_count, separator);

        let right_end = right.value_offset(right.value_count);
        let dest = self.child_offset(self.value_count + 1);
        self.data[dest..dest + right_end - 4].copy_from_slice(&right.data[4..right_end]);

        self.set_value_count(self.value_count + 1 + right.value_count);

        right.clear_data(4, right_end);
        right.set_value_count(0);
        right.dirty = true;
    }

    /// Fills the page from disk. A read that ends early (the page lies at or
    /// past end-of-file) leaves the tail zeroed instead of failing, matching
    /// the write-behind model where allocated ids may not have hit the file
    /// yet.
    pub(crate) fn read_from(&mut self, file: &File) -> Result<()> {
        let offset = self.geo.node_offset(self.id);
        let page = &mut self.data[..self.geo.node_size];

        let mut pos = 0;
        while pos < page.len() {
            match file.read_at(&mut page[pos..], offset + pos as u64) {
                Ok(0) => break,
                Ok(n) => pos += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(e)
                        .wrap_err_with(|| format!("failed to read node {} at offset {}", self.id, offset))
                }
            }
        }

        self.value_count = self.get_u32(0) as usize;
        Ok(())
    }

    /// Writes the page (without the spare slot) and clears the dirty flag.
    pub(crate) fn write_to(&mut self, file: &File) -> Result<()> {
        let offset = self.geo.node_offset(self.id);
        file.write_all_at(&self.data[..self.geo.node_size], offset)
            .wrap_err_with(|| format!("failed to write node {} at offset {}", self.id, offset))?;

        self.dirty = false;
        Ok(())
    }

    fn set_value_count(&mut self, count: usize) {
        self.value_count = count;
        self.put_u32(0, count as u32);
    }

    /// Moves the slots in `[start, end)` one slot to the right.
    fn shift_slot_right(&mut self, start: usize, end: usize) {
        self.data.copy_within(start..end, start + self.geo.slot_size);
    }

    /// Moves the slots in `[start, end)` one slot to the left.
    fn shift_slot_left(&mut self, start: usize, end: usize) {
        self.data.copy_within(start..end, start - self.geo.slot_size);
    }

    fn clear_data(&mut self, start: usize, end: usize) {
        self.data[start..end].fill(0);
    }

    fn value_offset(&self, idx: usize) -> usize {
        8 + idx * self.geo.slot_size
    }

    fn child_offset(&self, idx: usize) -> usize {
        4 + idx * self.geo.slot_size
    }

    fn get_u32(&self, offset: usize) -> u32 {
        u32::from_be_bytes(
            self.data[offset..offset + 4]
                .try_into()
                .expect("4-byte slice"),
        )
    }

    fn put_u32(&mut self, offset: usize, v: u32) {
        self.data[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
    }
}
