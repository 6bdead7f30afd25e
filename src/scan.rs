//! # Value Iterators
//!
//! Two ways to walk the stored values:
//!
//! * [`SeqScanIterator`] reads every node page in id order and emits values
//!   in whatever order they sit on disk. No comparator calls, no tree
//!   descent, at most one node pinned at a time. Node ids left behind by
//!   merges read back as zeroed pages with a value count of zero and are
//!   skipped.
//! * [`RangeIterator`] performs an in-order traversal between an optional
//!   inclusive minimum and maximum. It keeps its position as an explicit
//!   descent stack of `(node, next value index)` pairs, pinning exactly the
//!   nodes on the path from the root to the current position.
//!
//! Both support masked matching: with a search key and mask only values
//! where `value[i] & mask[i] == key[i] & mask[i]` on every byte are emitted.
//! An all-zero mask matches everything; an all-ones mask demands byte
//! equality on the full width.
//!
//! Iterators borrow the tree immutably, so the borrow checker prevents
//! structural mutation while a scan is live. `next` is fallible (a page
//! read can fail), which rules out implementing `std::iter::Iterator`
//! directly; callers drive the scan with a `while let` loop instead.

use std::sync::Arc;

use eyre::Result;
use smallvec::SmallVec;

use crate::cache::NodeSlot;
use crate::tree::BTree;

/// True when `value` agrees with `key` on every bit selected by `mask`.
pub(crate) fn masked_match(value: &[u8], key: &[u8], mask: &[u8]) -> bool {
    key.iter()
        .zip(mask)
        .zip(value)
        .all(|((k, m), v)| v & m == k & m)
}

/// Iterates over all values in node-id order.
pub struct SeqScanIterator<'a> {
    tree: &'a BTree,
    search_key: Option<Vec<u8>>,
    search_mask: Option<Vec<u8>>,
    current: Option<Arc<NodeSlot>>,
    current_id: u32,
    value_idx: usize,
}

impl<'a> SeqScanIterator<'a> {
    pub(crate) fn new(tree: &'a BTree, search_key: Option<&[u8]>, search_mask: Option<&[u8]>) -> Self {
        Self {
            tree,
            search_key: search_key.map(<[u8]>::to_vec),
            search_mask: search_mask.map(<[u8]>::to_vec),
            current: None,
            current_id: 0,
            value_idx: 0,
        }
    }

    /// Returns the next value, or `None` when every node has been visited.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.current.is_none() {
                if self.current_id >= self.tree.max_node_id {
                    return Ok(None);
                }
                self.current_id += 1;
                self.current = Some(self.tree.cache.acquire(self.current_id)?);
                self.value_idx = 0;
            }

            let slot = self.current.as_ref().expect("slot pinned above");
            let count = { slot.node.lock().value_count() };

            if self.value_idx >= count {
                let slot = self.current.take().expect("slot pinned above");
                self.tree.cache.release(&slot)?;
                continue;
            }

            let value = { slot.node.lock().value(self.value_idx).to_vec() };
            self.value_idx += 1;

            match (&self.search_key, &self.search_mask) {
                (Some(key), Some(mask)) if !masked_match(&value, key, mask) => continue,
                _ => return Ok(Some(value)),
            }
        }
    }

    /// Releases the pinned node, if any. Dropping the iterator does the
    /// same; `close` only exists to surface release errors.
    pub fn close(&mut self) -> Result<()> {
        if let Some(slot) = self.current.take() {
            self.tree.cache.release(&slot)?;
        }
        Ok(())
    }
}

impl Drop for SeqScanIterator<'_> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct StackEntry {
    slot: Arc<NodeSlot>,
    /// Next value index to emit at this node. Everything to the left of it,
    /// including the subtree under the child at this index, is already done.
    idx: usize,
}

/// Iterates in comparator order over the values in `[min_value, max_value]`,
/// both bounds inclusive and both optional.
pub struct RangeIterator<'a> {
    tree: &'a BTree,
    search_key: Option<Vec<u8>>,
    search_mask: Option<Vec<u8>>,
    min_value: Option<Vec<u8>>,
    max_value: Option<Vec<u8>>,
    /// Path from the root to the current position. Trees of any realistic
    /// size stay within the inline capacity.
    stack: SmallVec<[StackEntry; 8]>,
    started: bool,
}

impl<'a> RangeIterator<'a> {
    pub(crate) fn new(
        tree: &'a BTree,
        search_key: Option<&[u8]>,
        search_mask: Option<&[u8]>,
        min_value: Option<&[u8]>,
        max_value: Option<&[u8]>,
    ) -> Self {
        Self {
            tree,
            search_key: search_key.map(<[u8]>::to_vec),
            search_mask: search_mask.map(<[u8]>::to_vec),
            min_value: min_value.map(<[u8]>::to_vec),
            max_value: max_value.map(<[u8]>::to_vec),
            stack: SmallVec::new(),
            started: false,
        }
    }

    /// Returns the next in-order value, or `None` once the maximum has been
    /// passed or the tree is exhausted.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.started {
            self.started = true;
            self.descend_to_minimum()?;
        }

        loop {
            let Some(value) = self.emit_next()? else {
                return Ok(None);
            };

            if let Some(max) = &self.max_value {
                let past_max = self
                    .tree
                    .comparator
                    .compare(max, &value, 0, value.len())
                    .is_lt();
                if past_max {
                    self.close()?;
                    return Ok(None);
                }
            }

            match (&self.search_key, &self.search_mask) {
                (Some(key), Some(mask)) if !masked_match(&value, key, mask) => continue,
                _ => return Ok(Some(value)),
            }
        }
    }

    /// Positions the stack so that the first emitted value is the smallest
    /// one not below `min_value`. An exact match stops the descent at the
    /// matching entry itself rather than walking into its left subtree,
    /// whose values are all smaller than the minimum.
    fn descend_to_minimum(&mut self) -> Result<()> {
        if self.tree.root_node_id == 0 {
            return Ok(());
        }

        let Some(min) = self.min_value.clone() else {
            return self.descend_leftmost(self.tree.root_node_id);
        };

        let mut slot = self.tree.cache.acquire(self.tree.root_node_id)?;
        loop {
            let search = { slot.node.lock().search(self.tree.comparator.as_ref(), &min) };
            match search {
                Ok(idx) => {
                    self.stack.push(StackEntry { slot, idx });
                    return Ok(());
                }
                Err(idx) => {
                    let (leaf, child_id) = {
                        let node = slot.node.lock();
                        (node.is_leaf(), node.child_id(idx))
                    };
                    self.stack.push(StackEntry { slot, idx });
                    if leaf {
                        return Ok(());
                    }
                    slot = self.tree.cache.acquire(child_id)?;
                }
            }
        }
    }

    /// Pushes the path to the smallest value of the subtree rooted at
    /// `node_id`.
    fn descend_leftmost(&mut self, node_id: u32) -> Result<()> {
        let mut id = node_id;
        loop {
            let slot = self.tree.cache.acquire(id)?;
            let (leaf, child0) = {
                let node = slot.node.lock();
                (node.is_leaf(), node.child_id(0))
            };
            self.stack.push(StackEntry { slot, idx: 0 });
            if leaf {
                return Ok(());
            }
            id = child0;
        }
    }

    /// Emits the next value in order, ignoring bounds and masks.
    fn emit_next(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };

            let (count, leaf, value, next_child) = {
                let node = top.slot.node.lock();
                let count = node.value_count();
                if top.idx >= count {
                    (count, true, Vec::new(), 0)
                } else {
                    let value = node.value(top.idx).to_vec();
                    let leaf = node.is_leaf();
                    let next_child = if leaf { 0 } else { node.child_id(top.idx + 1) };
                    (count, leaf, value, next_child)
                }
            };

            if top.idx >= count {
                let entry = self.stack.pop().expect("top just inspected");
                self.tree.cache.release(&entry.slot)?;
                continue;
            }

            top.idx += 1;
            if !leaf {
                self.descend_leftmost(next_child)?;
            }
            return Ok(Some(value));
        }
    }

    /// Releases all pinned nodes on the path. Dropping the iterator does
    /// the same; `close` only exists to surface release errors.
    pub fn close(&mut self) -> Result<()> {
        while let Some(entry) = self.stack.pop() {
            self.tree.cache.release(&entry.slot)?;
        }
        Ok(())
    }
}

impl Drop for RangeIterator<'_> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
