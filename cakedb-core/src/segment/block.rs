//! Per-device block encoding

use super::FLAG_COMPRESSED;
use crate::{Point, Result};
use bytes::BufMut;
use lz4_flex::frame::FrameEncoder;
use std::io::Write;

/// Accumulates one device's records, plain or through an LZ4 frame
pub enum BlockEncoder {
    Plain(Vec<u8>),
    Compressed(FrameEncoder<Vec<u8>>),
}

impl BlockEncoder {
    pub fn new(compress: bool) -> Self {
        if compress {
            BlockEncoder::Compressed(FrameEncoder::new(Vec::new()))
        } else {
            BlockEncoder::Plain(Vec::new())
        }
    }

    /// Index flag describing this block
    pub fn flag(&self) -> u8 {
        match self {
            BlockEncoder::Plain(_) => 0,
            BlockEncoder::Compressed(_) => FLAG_COMPRESSED,
        }
    }

    /// Append one record, returning its uncompressed length
    pub fn push(&mut self, point: &Point) -> Result<usize> {
        let mut record = Vec::with_capacity(point.record_size());
        record.put_i64(point.timestamp);
        for value in &point.values {
            record.put_i64(*value);
        }

        match self {
            BlockEncoder::Plain(buf) => buf.extend_from_slice(&record),
            BlockEncoder::Compressed(encoder) => encoder.write_all(&record)?,
        }
        Ok(record.len())
    }

    /// Bytes to store on disk
    pub fn finish(self) -> Result<Vec<u8>> {
        match self {
            BlockEncoder::Plain(buf) => Ok(buf),
            BlockEncoder::Compressed(encoder) => Ok(encoder.finish()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lz4_flex::frame::FrameDecoder;
    use std::io::Read;

    #[test]
    fn test_plain_block() {
        let mut block = BlockEncoder::new(false);
        assert_eq!(block.flag(), 0);
        assert_eq!(block.push(&Point::new(1, 5, vec![7, -1])).unwrap(), 24);

        let bytes = block.finish().unwrap();
        assert_eq!(&bytes[..8], &5i64.to_be_bytes());
        assert_eq!(&bytes[8..16], &7i64.to_be_bytes());
        assert_eq!(&bytes[16..], &(-1i64).to_be_bytes());
    }

    #[test]
    fn test_compressed_block() {
        let mut plain = BlockEncoder::new(false);
        let mut packed = BlockEncoder::new(true);
        assert_eq!(packed.flag(), FLAG_COMPRESSED);

        for ts in 0..1000 {
            let point = Point::new(3, ts, vec![42; 10]);
            plain.push(&point).unwrap();
            packed.push(&point).unwrap();
        }
        let plain = plain.finish().unwrap();
        let packed = packed.finish().unwrap();
        assert!(packed.len() < plain.len());

        let mut restored = Vec::new();
        FrameDecoder::new(&packed[..]).read_to_end(&mut restored).unwrap();
        assert_eq!(restored, plain);
    }
}
