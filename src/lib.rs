//! # disktree - On-Disk B-Tree for Fixed-Width Records
//!
//! disktree is an embeddable, page-oriented B-tree that stores opaque
//! fixed-length byte records in a single file. It is the index primitive of a
//! triple-store's native storage layer: term and statement keys are encoded
//! into fixed-width byte arrays elsewhere and handed to this crate as-is.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │          Public API (BTree)          │
//! ├───────────────────┬─────────────────┤
//! │  SeqScanIterator  │  RangeIterator  │
//! ├───────────────────┴─────────────────┤
//! │     Node (page layout/algorithms)    │
//! ├─────────────────────────────────────┤
//! │   NodeCache (pin counts + MRU pool)  │
//! ├─────────────────────────────────────┤
//! │      Positioned file I/O (pread)     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Format
//!
//! All integers are big-endian. The file starts with a 16-byte header:
//!
//! ```text
//! Offset  Size  Description
//! 0       4     Format version
//! 4       4     Block size (bytes per node page)
//! 8       4     Value size (bytes per record)
//! 12      4     Root node id (0 = empty tree)
//! ```
//!
//! Node id `n` (ids are 1-based) occupies `node_size` bytes at file offset
//! `block_size * n`:
//!
//! ```text
//! +---------------------+
//! | value count (u32)   |
//! +---------------------+
//! | child id 0 (u32)    |   a node is a leaf iff child id 0 == 0
//! | value 0             |
//! | child id 1 (u32)    |
//! | value 1             |
//! | ...                 |
//! | child id n (u32)    |   trailing child pointer
//! +---------------------+
//! | zero padding        |
//! +---------------------+
//! ```
//!
//! ## Module Overview
//!
//! - [`tree`]: the `BTree` orchestrator (open/create, get/insert/remove,
//!   clear/sync/close, iterator construction)
//! - [`scan`]: lazy sequential and sorted-range iterators
//! - [`comparator`]: pluggable total order over fixed-width records
//! - `node`: in-memory node page with split/merge algorithms
//! - `cache`: pinned node set plus a small most-recently-released pool
//!
//! ## What This Crate Does Not Do
//!
//! There is no write-ahead log and no crash recovery: a process crash in the
//! middle of a multi-page update can leave the file structurally
//! inconsistent. There is also no multi-process locking. Callers that need
//! either must provide it a layer above.
//!
//! ## Quick Start
//!
//! ```ignore
//! use disktree::BTree;
//!
//! let mut btree = BTree::open("terms.dat", 4096, 13)?;
//! btree.insert(&record)?;
//! let mut iter = btree.iterate_range(Some(&min), Some(&max));
//! while let Some(value) = iter.next()? {
//!     // values arrive in comparator order
//! }
//! ```

mod cache;
mod header;
mod node;

pub mod comparator;
pub mod scan;
pub mod tree;

pub use comparator::{DefaultRecordComparator, RecordComparator};
pub use scan::{RangeIterator, SeqScanIterator};
pub use tree::BTree;
