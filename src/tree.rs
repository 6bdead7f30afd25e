//! # B-Tree Orchestrator
//!
//! This module ties the pieces together: it owns the backing file and the
//! header fields, drives [`Node`](crate::node) mutations through the
//! [`NodeCache`](crate::cache), and exposes the public operations.
//!
//! ## Algorithms
//!
//! **Search** descends iteratively: binary-search the current node, follow
//! the child at the insertion point on a miss, stop at a leaf.
//!
//! **Insert** descends recursively. An exact match overwrites the stored
//! value in place (skipping the write when the bytes are identical, to avoid
//! a pointless page flush) and returns the old bytes. Otherwise the value
//! lands in a leaf; a full node is split at its median, which is promoted
//! into the parent and may cascade further splits up to the root. When the
//! root itself overflows, a new root is allocated with the old root as its
//! leftmost child and the header is rewritten.
//!
//! **Remove** descends recursively. A match in a leaf is removed directly; a
//! match in an interior node is replaced by its in-order successor (the
//! smallest value of the right subtree), which is extracted from a leaf.
//! Whenever a child returns from the recursion holding fewer than
//! `min_value_count` values it is rebalanced:
//!
//! 1. borrow from the right sibling if it has values to spare,
//! 2. else borrow from the left sibling,
//! 3. else merge with whichever sibling exists, demoting the separator.
//!
//! The right sibling is always checked first; swapping that order would
//! produce differently shaped (still valid) trees, and tests pin the exact
//! shape. After the top-level call an empty root either empties the tree
//! (leaf root) or collapses one level (interior root).
//!
//! ## Node Ids and File Growth
//!
//! New nodes take `max_node_id + 1`; ids are never reused. A node emptied by
//! a merge stays allocated, zero-filled, and is simply skipped by scans.
//! `max_node_id` is not persisted: reopening derives it from the file
//! length. The file only ever grows (until `clear` truncates it back to the
//! header).
//!
//! ## Durability
//!
//! Writes are buffered in the cache until eviction, `sync` or `close`.
//! `sync` flushes every dirty node and, when the tree was opened with
//! `force_sync`, additionally asks the OS to push data to stable storage.
//! There is no write-ahead log: a crash between the pages of a split or
//! merge can leave the file inconsistent.
//!
//! ## Thread Safety
//!
//! Mutating operations take `&mut self` and iterators borrow `&self`, so
//! the borrow checker rules out mutation while a scan is in progress.
//! Concurrent `get` calls are safe; anything more needs external locking.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, eyre, Result, WrapErr};
use zerocopy::IntoBytes;

use crate::cache::{NodeCache, NodeSlot};
use crate::comparator::{DefaultRecordComparator, RecordComparator};
use crate::header::{FileHeader, FILE_FORMAT_VERSION, HEADER_LENGTH};
use crate::node::NodeGeometry;
use crate::scan::{RangeIterator, SeqScanIterator};

/// An on-disk B-tree over fixed-width byte records.
pub struct BTree {
    path: PathBuf,
    pub(crate) file: Arc<File>,
    force_sync: bool,
    pub(crate) comparator: Box<dyn RecordComparator>,
    pub(crate) cache: NodeCache,
    pub(crate) geo: NodeGeometry,
    pub(crate) root_node_id: u32,
    pub(crate) max_node_id: u32,
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("path", &self.path)
            .field("root_node_id", &self.root_node_id)
            .field("max_node_id", &self.max_node_id)
            .finish_non_exhaustive()
    }
}

struct InsertOutcome {
    /// Previous bytes stored under the inserted key, if any.
    old_value: Option<Vec<u8>>,
    /// Median promoted out of a split child, with the new right node's id.
    overflow: Option<(Vec<u8>, u32)>,
}

impl BTree {
    /// Opens or creates a tree file with the default bytewise comparator and
    /// no forced syncs.
    ///
    /// `block_size` is the bytes reserved per node page (ideally the file
    /// system's block size) and `value_size` the fixed record width. Both
    /// are recorded in the header on creation; on reopen the stored block
    /// size wins and the stored value size must match `value_size`.
    pub fn open(path: impl AsRef<Path>, block_size: u32, value_size: u32) -> Result<Self> {
        Self::open_with_options(
            path,
            block_size,
            value_size,
            Box::new(DefaultRecordComparator),
            false,
        )
    }

    /// Opens or creates a tree file with a caller-supplied comparator.
    ///
    /// The comparator determines the value order for the lifetime of the
    /// file and is not persisted; reopening with a different order silently
    /// corrupts searches. With `force_sync` every [`BTree::sync`] also
    /// forces file contents to stable storage, which can be very slow.
    pub fn open_with_options(
        path: impl AsRef<Path>,
        block_size: u32,
        value_size: u32,
        comparator: Box<dyn RecordComparator>,
        force_sync: bool,
    ) -> Result<Self> {
        ensure!(
            block_size as usize >= HEADER_LENGTH,
            "block size must be at least {HEADER_LENGTH} bytes"
        );
        ensure!(value_size > 0, "value size must be larger than 0");
        ensure!(
            block_size >= 3 * value_size + 20,
            "block size too small; a node must be able to store at least three values"
        );

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open btree file '{}'", path.display()))?;

        let file_len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat btree file '{}'", path.display()))?
            .len();

        let (block_size, root_node_id) = if file_len == 0 {
            (block_size, 0)
        } else {
            let mut buf = [0u8; HEADER_LENGTH];
            file.read_exact_at(&mut buf, 0)
                .wrap_err_with(|| format!("failed to read header of '{}'", path.display()))?;
            let header = FileHeader::from_bytes(&buf)?;

            ensure!(
                header.format_version() == FILE_FORMAT_VERSION,
                "unsupported file format version: {}",
                header.format_version()
            );
            ensure!(
                header.value_size() == value_size,
                "specified value size ({}) differs from what is stored on disk ({})",
                value_size,
                header.value_size()
            );

            (header.block_size(), header.root_node_id())
        };

        let geo = NodeGeometry::new(block_size, value_size);
        let max_node_id = (file_len.saturating_sub(geo.node_size as u64) / block_size as u64) as u32;

        let file = Arc::new(file);
        let mut tree = Self {
            path,
            file: file.clone(),
            force_sync,
            comparator,
            cache: NodeCache::new(file, geo),
            geo,
            root_node_id,
            max_node_id,
        };

        if file_len == 0 {
            tree.write_file_header()?;
            tree.sync()?;
        }

        Ok(tree)
    }

    /// The file this tree operates on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u32 {
        self.geo.block_size
    }

    pub fn value_size(&self) -> usize {
        self.geo.value_size
    }

    /// True when the tree holds no values at all.
    pub fn is_empty(&self) -> bool {
        self.root_node_id == 0
    }

    /// Gets the stored value that matches `key` under the tree's comparator.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root_node_id == 0 {
            return Ok(None);
        }

        let mut slot = self.cache.acquire(self.root_node_id)?;
        loop {
            let search = { slot.node.lock().search(self.comparator.as_ref(), key) };
            match search {
                Ok(idx) => {
                    let value = { slot.node.lock().value(idx).to_vec() };
                    self.cache.release(&slot)?;
                    return Ok(Some(value));
                }
                Err(idx) => {
                    let (leaf, child_id) = {
                        let node = slot.node.lock();
                        (node.is_leaf(), node.child_id(idx))
                    };
                    if leaf {
                        self.cache.release(&slot)?;
                        return Ok(None);
                    }
                    let child = self.cache.acquire(child_id)?;
                    self.cache.release(&slot)?;
                    slot = child;
                }
            }
        }
    }

    /// Inserts `value`, which must be exactly `value_size` bytes. If an
    /// equal value (under the comparator) is already present it is
    /// overwritten and the old bytes are returned.
    pub fn insert(&mut self, value: &[u8]) -> Result<Option<Vec<u8>>> {
        ensure!(
            value.len() == self.geo.value_size,
            "value must be exactly {} bytes, got {}",
            self.geo.value_size,
            value.len()
        );

        let root = if self.root_node_id == 0 {
            let root = self.create_node();
            self.root_node_id = root.id;
            self.write_file_header()?;
            root
        } else {
            self.cache.acquire(self.root_node_id)?
        };

        let outcome = self.insert_in_tree(value, 0, &root)?;

        if let Some((median, new_node_id)) = &outcome.overflow {
            // Root overflowed: the old root becomes the leftmost child of a
            // fresh root holding the single promoted entry.
            let new_root = self.create_node();
            {
                let mut node = new_root.node.lock();
                node.set_child_id(0, root.id);
                node.insert_value_child_pair(0, median, *new_node_id);
            }
            self.root_node_id = new_root.id;
            self.write_file_header()?;
            self.cache.release(&new_root)?;
        }

        self.cache.release(&root)?;
        Ok(outcome.old_value)
    }

    fn insert_in_tree(
        &mut self,
        value: &[u8],
        value_node_id: u32,
        slot: &Arc<NodeSlot>,
    ) -> Result<InsertOutcome> {
        let search = { slot.node.lock().search(self.comparator.as_ref(), value) };

        match search {
            Ok(idx) => {
                // Equal value present: replace it, but skip the write when
                // the bytes are identical.
                let mut node = slot.node.lock();
                let old = node.value(idx).to_vec();
                if old != value {
                    node.set_value(idx, value);
                }
                Ok(InsertOutcome {
                    old_value: Some(old),
                    overflow: None,
                })
            }
            Err(idx) => {
                let leaf = { slot.node.lock().is_leaf() };
                if leaf {
                    self.insert_in_node(value, value_node_id, idx, slot)
                } else {
                    let child_id = { slot.node.lock().child_id(idx) };
                    let child = self.cache.acquire(child_id)?;
                    let mut outcome = self.insert_in_tree(value, value_node_id, &child)?;
                    self.cache.release(&child)?;

                    if let Some((median, new_node_id)) = outcome.overflow.take() {
                        // The child split; its promoted median lands here
                        // and may split this node in turn.
                        let old_value = outcome.old_value;
                        let mut outcome = self.insert_in_node(&median, new_node_id, idx, slot)?;
                        outcome.old_value = old_value;
                        Ok(outcome)
                    } else {
                        Ok(outcome)
                    }
                }
            }
        }
    }

    fn insert_in_node(
        &mut self,
        value: &[u8],
        value_node_id: u32,
        idx: usize,
        slot: &Arc<NodeSlot>,
    ) -> Result<InsertOutcome> {
        let full = { slot.node.lock().is_full() };

        if full {
            let new_slot = self.create_node();
            let median = {
                let mut node = slot.node.lock();
                let mut new_node = new_slot.node.lock();
                node.split_and_insert(value, value_node_id, idx, &mut new_node)
            };
            let overflow = Some((median, new_slot.id));
            self.cache.release(&new_slot)?;
            Ok(InsertOutcome {
                old_value: None,
                overflow,
            })
        } else {
            slot.node
                .lock()
                .insert_value_child_pair(idx, value, value_node_id);
            Ok(InsertOutcome {
                old_value: None,
                overflow: None,
            })
        }
    }

    /// Removes the value matching `key`, returning it if it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root_node_id == 0 {
            return Ok(None);
        }

        let root = self.cache.acquire(self.root_node_id)?;
        let removed = self.remove_from_tree(key, &root)?;

        let empty = { root.node.lock().is_empty() };
        if empty {
            let leaf = { root.node.lock().is_leaf() };
            if leaf {
                self.root_node_id = 0;
            } else {
                // Collapse one level: the root's sole child takes over.
                let mut node = root.node.lock();
                self.root_node_id = node.child_id(0);
                node.set_child_id(0, 0);
            }
            self.write_file_header()?;
        }

        self.cache.release(&root)?;
        Ok(removed)
    }

    fn remove_from_tree(&self, key: &[u8], slot: &Arc<NodeSlot>) -> Result<Option<Vec<u8>>> {
        let search = { slot.node.lock().search(self.comparator.as_ref(), key) };

        match search {
            Ok(idx) => {
                let leaf = { slot.node.lock().is_leaf() };
                if leaf {
                    let value = slot.node.lock().remove_value_right(idx);
                    Ok(Some(value))
                } else {
                    // Interior match: swap in the in-order successor from
                    // the right subtree, then rebalance that subtree.
                    let (value, right_child_id) = {
                        let node = slot.node.lock();
                        (node.value(idx).to_vec(), node.child_id(idx + 1))
                    };
                    let right_child = self.cache.acquire(right_child_id)?;
                    let smallest = self.remove_smallest_from_tree(&right_child)?;
                    slot.node.lock().set_value(idx, &smallest);

                    self.balance_child_node(slot, &right_child, idx + 1)?;
                    self.cache.release(&right_child)?;
                    Ok(Some(value))
                }
            }
            Err(idx) => {
                let (leaf, child_id) = {
                    let node = slot.node.lock();
                    (node.is_leaf(), node.child_id(idx))
                };
                if leaf {
                    return Ok(None);
                }
                let child = self.cache.acquire(child_id)?;
                let value = self.remove_from_tree(key, &child)?;
                self.balance_child_node(slot, &child, idx)?;
                self.cache.release(&child)?;
                Ok(value)
            }
        }
    }

    fn remove_smallest_from_tree(&self, slot: &Arc<NodeSlot>) -> Result<Vec<u8>> {
        let leaf = { slot.node.lock().is_leaf() };

        if leaf {
            let mut node = slot.node.lock();
            ensure!(
                !node.is_empty(),
                "corrupt tree: empty leaf while extracting in-order successor"
            );
            Ok(node.remove_value_left(0))
        } else {
            let child_id = { slot.node.lock().child_id(0) };
            let child = self.cache.acquire(child_id)?;
            let value = self.remove_smallest_from_tree(&child)?;
            self.balance_child_node(slot, &child, 0)?;
            self.cache.release(&child)?;
            Ok(value)
        }
    }

    /// Restores the minimum-occupancy invariant on `child` after a removal.
    /// The right sibling is consulted before the left one; that order is
    /// part of the on-disk behavior and must not change.
    fn balance_child_node(
        &self,
        parent: &Arc<NodeSlot>,
        child: &Arc<NodeSlot>,
        child_idx: usize,
    ) -> Result<()> {
        let underfull = { child.node.lock().value_count() < self.geo.min_value_count };
        if !underfull {
            return Ok(());
        }

        let parent_count = { parent.node.lock().value_count() };
        let right_sibling = if child_idx < parent_count {
            let id = { parent.node.lock().child_id(child_idx + 1) };
            Some(self.cache.acquire(id)?)
        } else {
            None
        };

        let can_lend =
            |slot: &&Arc<NodeSlot>| slot.node.lock().value_count() > self.geo.min_value_count;

        if let Some(sibling) = right_sibling.as_ref().filter(can_lend) {
            // Rotate one entry leftwards through the parent: the separator
            // drops into the child, the sibling's first value replaces it.
            let (separator, sibling_child0) = {
                let p = parent.node.lock();
                let s = sibling.node.lock();
                (p.value(child_idx).to_vec(), s.child_id(0))
            };
            {
                let mut c = child.node.lock();
                let count = c.value_count();
                c.insert_value_child_pair(count, &separator, sibling_child0);
            }
            let new_separator = { sibling.node.lock().remove_value_left(0) };
            parent.node.lock().set_value(child_idx, &new_separator);
        } else {
            let left_sibling = if child_idx > 0 {
                let id = { parent.node.lock().child_id(child_idx - 1) };
                Some(self.cache.acquire(id)?)
            } else {
                None
            };

            if let Some(sibling) = left_sibling.as_ref().filter(can_lend) {
                // Mirror rotation through the parent, rightwards.
                let (separator, sibling_last_child, sibling_count) = {
                    let p = parent.node.lock();
                    let s = sibling.node.lock();
                    (
                        p.value(child_idx - 1).to_vec(),
                        s.child_id(s.value_count()),
                        s.value_count(),
                    )
                };
                child
                    .node
                    .lock()
                    .insert_child_value_pair(0, sibling_last_child, &separator);
                let new_separator = {
                    sibling.node.lock().remove_value_right(sibling_count - 1)
                };
                parent.node.lock().set_value(child_idx - 1, &new_separator);
            } else if let Some(sibling) = &left_sibling {
                // Both siblings are at the minimum: merge. The separator is
                // demoted out of the parent into the merged node; the
                // emptied node's id stays allocated forever.
                let separator = { parent.node.lock().remove_value_right(child_idx - 1) };
                let mut s = sibling.node.lock();
                let mut c = child.node.lock();
                s.merge_with_right_sibling(&separator, &mut c);
            } else {
                let sibling = right_sibling
                    .as_ref()
                    .ok_or_else(|| eyre!("corrupt tree: underfull node {} has no siblings", child.id))?;
                let separator = { parent.node.lock().remove_value_right(child_idx) };
                let mut c = child.node.lock();
                let mut s = sibling.node.lock();
                c.merge_with_right_sibling(&separator, &mut s);
            }

            if let Some(sibling) = left_sibling {
                self.cache.release(&sibling)?;
            }
        }

        if let Some(sibling) = right_sibling {
            self.cache.release(&sibling)?;
        }

        Ok(())
    }

    /// Removes all values: drops every cached node, truncates the file back
    /// to the header and resets the id counters.
    pub fn clear(&mut self) -> Result<()> {
        self.cache.discard_all();

        self.file
            .set_len(HEADER_LENGTH as u64)
            .wrap_err_with(|| format!("failed to truncate '{}'", self.path.display()))?;

        self.root_node_id = 0;
        self.max_node_id = 0;
        self.write_file_header()
    }

    /// Writes all cached changes to the file. With `force_sync` the file is
    /// also flushed to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.cache.flush_all()?;

        if self.force_sync {
            self.file
                .sync_data()
                .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))?;
        }

        Ok(())
    }

    /// Syncs pending changes and releases all resources. The tree cannot be
    /// used afterwards.
    pub fn close(self) -> Result<()> {
        self.sync()?;
        self.cache.discard_all();
        Ok(())
    }

    /// Iterates over all values in node-id order (not key order).
    pub fn iterate_all(&self) -> SeqScanIterator<'_> {
        SeqScanIterator::new(self, None, None)
    }

    /// Iterates in comparator order over all values between `min_value` and
    /// `max_value`, both inclusive and both optional.
    pub fn iterate_range(
        &self,
        min_value: Option<&[u8]>,
        max_value: Option<&[u8]>,
    ) -> RangeIterator<'_> {
        RangeIterator::new(self, None, None, min_value, max_value)
    }

    /// Iterates over all values matching `search_key` on the bit positions
    /// selected by `search_mask`, in node-id order.
    pub fn iterate_matching(&self, search_key: &[u8], search_mask: &[u8]) -> SeqScanIterator<'_> {
        SeqScanIterator::new(self, Some(search_key), Some(search_mask))
    }

    /// Iterates in comparator order over the values within `[min_value,
    /// max_value]` that match `search_key` under `search_mask`.
    pub fn iterate_range_matching(
        &self,
        search_key: &[u8],
        search_mask: &[u8],
        min_value: Option<&[u8]>,
        max_value: Option<&[u8]>,
    ) -> RangeIterator<'_> {
        RangeIterator::new(self, Some(search_key), Some(search_mask), min_value, max_value)
    }

    /// Dumps stored parameters, derived parameters and every node page (as
    /// currently on disk; call [`BTree::sync`] first for a current view).
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "---contents of BTree file '{}'---", self.path.display())?;
        writeln!(out, "Stored parameters:")?;
        writeln!(out, "block size   = {}", self.geo.block_size)?;
        writeln!(out, "value size   = {}", self.geo.value_size)?;
        writeln!(out, "root node id = {}", self.root_node_id)?;
        writeln!(out)?;
        writeln!(out, "Derived parameters:")?;
        writeln!(out, "slot size       = {}", self.geo.slot_size)?;
        writeln!(out, "branch factor   = {}", self.geo.branch_factor)?;
        writeln!(out, "min value count = {}", self.geo.min_value_count)?;
        writeln!(out, "node size       = {}", self.geo.node_size)?;
        writeln!(out, "max node id     = {}", self.max_node_id)?;
        writeln!(out)?;

        let mut page = vec![0u8; self.geo.node_size];
        for id in 1..=self.max_node_id {
            page.fill(0);
            read_page_allowing_eof(&self.file, &mut page, self.geo.node_offset(id))?;

            let count = u32::from_be_bytes(page[0..4].try_into().expect("4-byte slice")) as usize;
            write!(out, "node {id}: count={count} ")?;

            for i in 0..count {
                let slot_offset = 4 + i * self.geo.slot_size;
                let child =
                    u32::from_be_bytes(page[slot_offset..slot_offset + 4].try_into().expect("4-byte slice"));
                write!(out, "{child}[")?;
                for b in &page[slot_offset + 4..slot_offset + 4 + self.geo.value_size] {
                    write!(out, "{b:02x}")?;
                }
                write!(out, "]")?;
            }

            let trailing_offset = 4 + count * self.geo.slot_size;
            let trailing = u32::from_be_bytes(
                page[trailing_offset..trailing_offset + 4]
                    .try_into()
                    .expect("4-byte slice"),
            );
            writeln!(out, "{trailing}")?;
        }

        writeln!(out, "---end of BTree file---")?;
        Ok(())
    }

    fn create_node(&mut self) -> Arc<NodeSlot> {
        self.max_node_id += 1;
        self.cache.create_new(self.max_node_id)
    }

    fn write_file_header(&self) -> Result<()> {
        let header = FileHeader::new(
            self.geo.block_size,
            self.geo.value_size as u32,
            self.root_node_id,
        );
        self.file
            .write_all_at(header.as_bytes(), 0)
            .wrap_err_with(|| format!("failed to write header of '{}'", self.path.display()))
    }
}

fn read_page_allowing_eof(file: &File, page: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < page.len() {
        match file.read_at(&mut page[pos..], offset + pos as u64) {
            Ok(0) => break,
            Ok(n) => pos += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).wrap_err_with(|| format!("failed to read page at offset {offset}")),
        }
    }
    Ok(())
}
