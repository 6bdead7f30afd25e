//! # Node Cache with Pin Counts and a Release Pool
//!
//! Tree operations never touch the file directly; they acquire nodes through
//! this cache. A node is *pinned* while at least one in-flight operation
//! holds it, tracked with an explicit pin count per id. When the last pin is
//! dropped the node moves into a small most-recently-released pool so that
//! an immediately following operation (the common case during descent and
//! rebalancing) finds it without a disk read.
//!
//! ```text
//! acquire(id)              release(node)
//!      │                        │
//!      ▼                        ▼
//! ┌──────────┐  pin == 0  ┌──────────────┐  overflow   ┌──────────┐
//! │  pinned  │ ─────────► │ release pool │ ──────────► │   disk   │
//! │ (by id)  │ ◄───────── │ (capacity 8) │  (if dirty) │          │
//! └──────────┘  re-pin    └──────────────┘             └──────────┘
//! ```
//!
//! The pool evicts its least-recently-released entry, writing it out first
//! if it is dirty. `flush_all` writes every dirty node in either collection;
//! `discard_all` drops both without writing (used by `clear`, where the file
//! is truncated anyway, and by `close` after a flush).
//!
//! ## Thread Safety
//!
//! Both collections sit behind one `parking_lot::Mutex`, making concurrent
//! `acquire`/`release` bookkeeping safe. That is the only isolation offered:
//! the tree itself requires callers to serialize structural mutations.
//!
//! Any I/O failure on a cache-triggered read or write-back is propagated to
//! the caller and aborts the enclosing tree operation; there is no retry and
//! no repair.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;

use crate::node::{Node, NodeGeometry};

/// Capacity of the most-recently-released pool.
const RELEASE_POOL_SIZE: usize = 8;

/// A cached node page. The id is duplicated outside the lock so cache
/// bookkeeping never has to take the page lock.
#[derive(Debug)]
pub(crate) struct NodeSlot {
    pub(crate) id: u32,
    pub(crate) node: Mutex<Node>,
}

#[derive(Debug)]
struct PinnedEntry {
    slot: Arc<NodeSlot>,
    pins: u32,
}

#[derive(Debug, Default)]
struct CacheInner {
    pinned: HashMap<u32, PinnedEntry>,
    /// Front = most recently released.
    pool: VecDeque<Arc<NodeSlot>>,
}

#[derive(Debug)]
pub(crate) struct NodeCache {
    file: Arc<File>,
    geo: NodeGeometry,
    inner: Mutex<CacheInner>,
}

impl NodeCache {
    pub(crate) fn new(file: Arc<File>, geo: NodeGeometry) -> Self {
        Self {
            file,
            geo,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Returns the node with the given id, pinning it. Misses are read from
    /// the file while the cache lock is held, keeping the original coarse
    /// synchronization: two concurrent misses for one id cannot race.
    pub(crate) fn acquire(&self, id: u32) -> Result<Arc<NodeSlot>> {
        ensure!(id > 0, "node id must be larger than 0, is: {id}");

        let mut inner = self.inner.lock();

        if let Some(entry) = inner.pinned.get_mut(&id) {
            entry.pins += 1;
            return Ok(entry.slot.clone());
        }

        if let Some(pos) = inner.pool.iter().position(|slot| slot.id == id) {
            let slot = inner.pool.remove(pos).expect("position is in bounds");
            inner.pinned.insert(
                id,
                PinnedEntry {
                    slot: slot.clone(),
                    pins: 1,
                },
            );
            return Ok(slot);
        }

        let mut node = Node::new(id, self.geo);
        node.read_from(&self.file)?;

        let slot = Arc::new(NodeSlot {
            id,
            node: Mutex::new(node),
        });
        inner.pinned.insert(
            id,
            PinnedEntry {
                slot: slot.clone(),
                pins: 1,
            },
        );
        Ok(slot)
    }

    /// Registers a freshly allocated empty node under `id`, pinned once.
    /// Id allocation itself is the tree's job (`max_node_id + 1`).
    pub(crate) fn create_new(&self, id: u32) -> Arc<NodeSlot> {
        debug_assert!(id > 0, "node id 0 is reserved for 'no node'");

        let slot = Arc::new(NodeSlot {
            id,
            node: Mutex::new(Node::new(id, self.geo)),
        });
        self.inner.lock().pinned.insert(
            id,
            PinnedEntry {
                slot: slot.clone(),
                pins: 1,
            },
        );
        slot
    }

    /// Drops one pin. At zero the node moves to the front of the release
    /// pool; if that overflows, the least-recently-released node is evicted
    /// and written out when dirty.
    pub(crate) fn release(&self, slot: &Arc<NodeSlot>) -> Result<()> {
        let evicted = {
            let mut inner = self.inner.lock();

            let Some(entry) = inner.pinned.get_mut(&slot.id) else {
                bail!("released node {} is not pinned", slot.id);
            };
            entry.pins -= 1;
            if entry.pins > 0 {
                return Ok(());
            }

            let entry = inner.pinned.remove(&slot.id).expect("entry just seen");
            inner.pool.push_front(entry.slot);

            if inner.pool.len() > RELEASE_POOL_SIZE {
                inner.pool.pop_back()
            } else {
                None
            }
        };

        // Write-back happens outside the cache lock.
        if let Some(victim) = evicted {
            let mut node = victim.node.lock();
            if node.is_dirty() {
                node.write_to(&self.file)?;
            }
        }

        Ok(())
    }

    /// Writes every dirty node in both collections. Durability is the
    /// tree's concern (it decides whether to fsync afterwards).
    pub(crate) fn flush_all(&self) -> Result<()> {
        let inner = self.inner.lock();

        for entry in inner.pinned.values() {
            let mut node = entry.slot.node.lock();
            if node.is_dirty() {
                node.write_to(&self.file)?;
            }
        }

        for slot in &inner.pool {
            let mut node = slot.node.lock();
            if node.is_dirty() {
                node.write_to(&self.file)?;
            }
        }

        Ok(())
    }

    /// Drops both collections without writing anything.
    pub(crate) fn discard_all(&self) {
        let mut inner = self.inner.lock();
        inner.pinned.clear();
        inner.pool.clear();
    }

    #[cfg(test)]
    fn pinned_count(&self) -> usize {
        self.inner.lock().pinned.len()
    }

    #[cfg(test)]
    fn pool_count(&self) -> usize {
        self.inner.lock().pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache() -> NodeCache {
        let file = Arc::new(tempfile::tempfile().unwrap());
        NodeCache::new(file, NodeGeometry::new(28, 1))
    }

    #[test]
    fn acquire_miss_reads_and_pins() {
        let cache = test_cache();
        let slot = cache.acquire(1).unwrap();

        assert_eq!(slot.id, 1);
        assert_eq!(cache.pinned_count(), 1);
        assert_eq!(cache.pool_count(), 0);

        cache.release(&slot).unwrap();
        assert_eq!(cache.pinned_count(), 0);
        assert_eq!(cache.pool_count(), 1);
    }

    #[test]
    fn acquire_from_pool_returns_same_slot() {
        let cache = test_cache();
        let slot = cache.acquire(1).unwrap();
        slot.node.lock().insert_value_child_pair(0, b"z", 0);
        cache.release(&slot).unwrap();

        let again = cache.acquire(1).unwrap();
        assert!(Arc::ptr_eq(&slot, &again));
        assert_eq!(again.node.lock().value(0), b"z");
        cache.release(&again).unwrap();
    }

    #[test]
    fn double_pin_needs_double_release() {
        let cache = test_cache();
        let first = cache.acquire(1).unwrap();
        let second = cache.acquire(1).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache.release(&first).unwrap();
        assert_eq!(cache.pinned_count(), 1);
        cache.release(&second).unwrap();
        assert_eq!(cache.pinned_count(), 0);
    }

    #[test]
    fn pool_overflow_writes_dirty_victim() {
        let file = Arc::new(tempfile::tempfile().unwrap());
        let geo = NodeGeometry::new(28, 1);
        let cache = NodeCache::new(file.clone(), geo);

        let slot = cache.create_new(1);
        slot.node.lock().insert_value_child_pair(0, b"q", 0);
        cache.release(&slot).unwrap();

        // Push 8 more releases through so node 1 falls off the pool.
        for id in 2..=9 {
            let s = cache.create_new(id);
            cache.release(&s).unwrap();
        }
        assert_eq!(cache.pool_count(), RELEASE_POOL_SIZE);

        let mut reread = Node::new(1, geo);
        reread.read_from(&file).unwrap();
        assert_eq!(reread.value_count(), 1);
        assert_eq!(reread.value(0), b"q");
    }

    #[test]
    fn flush_all_writes_pinned_and_pooled_nodes() {
        let file = Arc::new(tempfile::tempfile().unwrap());
        let geo = NodeGeometry::new(28, 1);
        let cache = NodeCache::new(file.clone(), geo);

        let pinned = cache.create_new(1);
        pinned.node.lock().insert_value_child_pair(0, b"a", 0);

        let pooled = cache.create_new(2);
        pooled.node.lock().insert_value_child_pair(0, b"b", 0);
        cache.release(&pooled).unwrap();

        cache.flush_all().unwrap();

        for (id, value) in [(1, b"a"), (2, b"b")] {
            let mut node = Node::new(id, geo);
            node.read_from(&file).unwrap();
            assert_eq!(node.value(0), value);
        }
    }

    #[test]
    fn discard_all_drops_without_writing() {
        let file = Arc::new(tempfile::tempfile().unwrap());
        let geo = NodeGeometry::new(28, 1);
        let cache = NodeCache::new(file.clone(), geo);

        let slot = cache.create_new(1);
        slot.node.lock().insert_value_child_pair(0, b"a", 0);
        cache.discard_all();

        assert_eq!(cache.pinned_count(), 0);
        let mut node = Node::new(1, geo);
        node.read_from(&file).unwrap();
        assert!(node.is_empty());
    }

    #[test]
    fn node_id_zero_is_rejected() {
        let cache = test_cache();
        assert!(cache.acquire(0).is_err());
    }
}
