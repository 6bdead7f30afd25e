//! File header definition.
//!
//! Every tree file starts with a fixed 16-byte header holding the format
//! version, the two creation-time sizing parameters and the current root
//! node id. All fields are big-endian u32s; the header struct uses zerocopy
//! traits so it can be read from and written as raw bytes without manual
//! field shuffling.
//!
//! `block_size` and `value_size` are immutable once the file exists. The
//! root node id is the only field that changes over the file's lifetime and
//! it is rewritten in place whenever the root moves.

use eyre::{ensure, Result};
use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub(crate) const FILE_FORMAT_VERSION: u32 = 1;
pub(crate) const HEADER_LENGTH: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct FileHeader {
    format_version: U32,
    block_size: U32,
    value_size: U32,
    root_node_id: U32,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == HEADER_LENGTH);

impl FileHeader {
    pub(crate) fn new(block_size: u32, value_size: u32, root_node_id: u32) -> Self {
        Self {
            format_version: U32::new(FILE_FORMAT_VERSION),
            block_size: U32::new(block_size),
            value_size: U32::new(value_size),
            root_node_id: U32::new(root_node_id),
        }
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= HEADER_LENGTH,
            "buffer too small for file header: {} < {}",
            bytes.len(),
            HEADER_LENGTH
        );

        Self::read_from_bytes(&bytes[..HEADER_LENGTH])
            .map_err(|e| eyre::eyre!("failed to parse file header: {:?}", e))
    }

    pub(crate) fn format_version(&self) -> u32 {
        self.format_version.get()
    }

    pub(crate) fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    pub(crate) fn value_size(&self) -> u32 {
        self.value_size.get()
    }

    pub(crate) fn root_node_id(&self) -> u32 {
        self.root_node_id.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_16_bytes() {
        assert_eq!(std::mem::size_of::<FileHeader>(), HEADER_LENGTH);
    }

    #[test]
    fn header_serializes_big_endian() {
        let header = FileHeader::new(4096, 13, 7);
        let bytes = header.as_bytes();

        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[0, 0, 0x10, 0]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 13]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 7]);
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let header = FileHeader::new(501, 13, 42);
        let parsed = FileHeader::from_bytes(header.as_bytes()).unwrap();

        assert_eq!(parsed.format_version(), FILE_FORMAT_VERSION);
        assert_eq!(parsed.block_size(), 501);
        assert_eq!(parsed.value_size(), 13);
        assert_eq!(parsed.root_node_id(), 42);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(FileHeader::from_bytes(&[0u8; 8]).is_err());
    }
}
