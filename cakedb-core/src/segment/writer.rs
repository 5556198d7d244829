//! Segment writer (dump)

use super::{BlockEncoder, IndexEntry, SegmentMeta, TRAILER_SIZE};
use crate::store::BlobStore;
use crate::{CakeError, DeviceId, Point, Result, SegmentName, Timestamp};
use bytes::BytesMut;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Streams points sorted by (device, timestamp) into a new segment
///
/// Everything is staged in a temp file that is only imported into the blob
/// store by [`SegmentWriter::finish`]. Dropping the writer early, or any
/// error on the way, removes the temp file and leaves no segment behind.
pub struct SegmentWriter {
    store: Arc<BlobStore>,
    name: SegmentName,
    out: BufWriter<NamedTempFile>,
    index: BytesMut,
    block: Option<OpenBlock>,
    last_device: Option<DeviceId>,
    compress: bool,
    /// Offset of the next block in the data region
    offset: u64,
    devices: usize,
    points: usize,
}

struct OpenBlock {
    device_id: DeviceId,
    start: Timestamp,
    end: Timestamp,
    real_size: u64,
    encoder: BlockEncoder,
}

impl SegmentWriter {
    /// Start a segment that will be stored as `name`
    pub fn create(store: Arc<BlobStore>, name: SegmentName, compress: bool) -> Result<Self> {
        let tmp = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", name.shard, name.created_at))
            .tempfile_in(store.tmp_dir())?;

        Ok(Self {
            store,
            name,
            out: BufWriter::new(tmp),
            index: BytesMut::new(),
            block: None,
            last_device: None,
            compress,
            offset: 0,
            devices: 0,
            points: 0,
        })
    }

    /// Dump a whole sorted stream as one segment
    pub fn write_all(
        store: Arc<BlobStore>,
        name: SegmentName,
        compress: bool,
        points: impl IntoIterator<Item = Point>,
    ) -> Result<SegmentMeta> {
        let mut writer = Self::create(store, name, compress)?;
        for point in points {
            writer.push(&point)?;
        }
        writer.finish()
    }

    /// Append a point; devices must arrive in ascending order
    pub fn push(&mut self, point: &Point) -> Result<()> {
        if self.last_device != Some(point.device_id) {
            if let Some(last) = self.last_device {
                if point.device_id < last {
                    return Err(CakeError::UnsortedInput(format!(
                        "device {} after device {} in segment {}",
                        point.device_id, last, self.name
                    )));
                }
            }
            self.close_block()?;
            self.block = Some(OpenBlock {
                device_id: point.device_id,
                start: Timestamp::MAX,
                end: Timestamp::MIN,
                real_size: 0,
                encoder: BlockEncoder::new(self.compress),
            });
            self.last_device = Some(point.device_id);
        }

        if let Some(block) = self.block.as_mut() {
            block.real_size += block.encoder.push(point)? as u64;
            block.start = block.start.min(point.timestamp);
            block.end = block.end.max(point.timestamp);
        }
        self.points += 1;
        Ok(())
    }

    fn close_block(&mut self) -> Result<()> {
        let Some(block) = self.block.take() else {
            return Ok(());
        };

        let flag = block.encoder.flag();
        let bytes = block.encoder.finish()?;
        self.out.write_all(&bytes)?;

        IndexEntry {
            device_id: block.device_id,
            start_time: block.start,
            end_time: block.end,
            offset: self.offset as i64,
            length: block.real_size as i64,
            flag,
        }
        .encode(&mut self.index);

        self.offset += bytes.len() as u64;
        self.devices += 1;
        Ok(())
    }

    /// Write the index and trailer, then import the file into the store
    pub fn finish(mut self) -> Result<SegmentMeta> {
        self.close_block()?;

        let index_len = self.index.len();
        self.out.write_all(&self.index)?;
        self.out.write_all(&(index_len as i64).to_be_bytes())?;

        let tmp = self.out.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        let path = tmp.into_temp_path();

        let key = self.name.key();
        self.store.import(&path, &key, true)?;

        let meta = SegmentMeta {
            name: self.name,
            devices: self.devices,
            points: self.points,
            file_size: self.offset + (index_len + TRAILER_SIZE) as u64,
            compressed: self.compress,
        };
        debug!(segment = %key, data_bytes = self.offset, index_bytes = index_len, "segment written");
        info!(
            segment = %key,
            devices = meta.devices,
            points = meta.points,
            compressed = meta.compressed,
            "imported segment"
        );
        Ok(meta)
    }
}
