//! Segment files
//!
//! A segment is an immutable file holding every buffered point of one shard
//! at one flush or compaction generation:
//!
//! ```text
//! [ block(dev_1) ] ... [ block(dev_n) ]
//! [ IndexEntry(dev_1) ] ... [ IndexEntry(dev_n) ]
//! [ i64: byte length of the index region ]
//! ```
//!
//! All integers are big-endian. A block is the concatenation of the device's
//! records, `[timestamp: i64][value: i64]*width`, optionally wrapped in an
//! LZ4 frame. Index entries are ascending by device id, so a block ends where
//! the next entry's block starts, and the last block ends at the index region.

mod block;
mod reader;
mod writer;

pub use block::BlockEncoder;
pub use reader::{SegmentPoints, SegmentReader, SegmentView};
pub use writer::SegmentWriter;

use crate::{DeviceId, SegmentName, TimeRange, Timestamp};
use bytes::{Buf, BufMut};

/// Encoded size of one index entry
pub const INDEX_ENTRY_SIZE: usize = 4 + 8 + 8 + 8 + 8 + 1;

/// Size of the trailing index-length field
pub const TRAILER_SIZE: usize = 8;

/// Flag bit: block is an LZ4 frame
pub const FLAG_COMPRESSED: u8 = 1;

/// Locates and describes one device's block within a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub device_id: DeviceId,
    /// Smallest timestamp in the block
    pub start_time: Timestamp,
    /// Largest timestamp in the block
    pub end_time: Timestamp,
    /// Byte offset of the block in the data region
    pub offset: i64,
    /// Uncompressed length of the block
    pub length: i64,
    pub flag: u8,
}

impl IndexEntry {
    pub fn is_compressed(&self) -> bool {
        self.flag & FLAG_COMPRESSED != 0
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start_time, self.end_time)
    }

    /// Append the 37-byte encoding
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.device_id);
        buf.put_i64(self.start_time);
        buf.put_i64(self.end_time);
        buf.put_i64(self.offset);
        buf.put_i64(self.length);
        buf.put_u8(self.flag);
    }

    /// Decode one entry; `buf` must hold at least `INDEX_ENTRY_SIZE` bytes
    pub fn decode(buf: &mut impl Buf) -> Self {
        Self {
            device_id: buf.get_u32(),
            start_time: buf.get_i64(),
            end_time: buf.get_i64(),
            offset: buf.get_i64(),
            length: buf.get_i64(),
            flag: buf.get_u8(),
        }
    }
}

/// Summary of a segment produced by a writer
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub name: SegmentName,
    /// Number of device blocks
    pub devices: usize,
    /// Number of records
    pub points: usize,
    /// Total file size in bytes
    pub file_size: u64,
    pub compressed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_entry_layout() {
        let entry = IndexEntry {
            device_id: 0x0102_0304,
            start_time: 1,
            end_time: 2,
            offset: 3,
            length: 4,
            flag: FLAG_COMPRESSED,
        };
        let mut buf = Vec::new();
        entry.encode(&mut buf);

        assert_eq!(buf.len(), INDEX_ENTRY_SIZE);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        assert_eq!(&buf[4..12], &1i64.to_be_bytes());
        assert_eq!(&buf[28..36], &4i64.to_be_bytes());
        assert_eq!(buf[36], 1);

        let decoded = IndexEntry::decode(&mut &buf[..]);
        assert_eq!(decoded, entry);
        assert!(decoded.is_compressed());
    }
}
