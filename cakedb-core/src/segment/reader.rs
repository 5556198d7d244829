//! Segment reader for querying and enumerating points

use super::{IndexEntry, SegmentMeta, INDEX_ENTRY_SIZE, TRAILER_SIZE};
use crate::store::BlobStore;
use crate::{CakeError, DeviceId, Point, Result, SegmentName, TimeRange};
use bytes::Buf;
use lz4_flex::frame::FrameDecoder;
use memmap2::Mmap;
use std::borrow::Cow;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// Upper bound on how far an LZ4 frame can expand its input
const LZ4_MAX_EXPANSION: usize = 255;

/// Read-only, bounds-checked view over a memory-mapped segment file
#[derive(Debug)]
pub struct SegmentView {
    mmap: Mmap,
    segment: String,
}

impl SegmentView {
    pub fn open(path: &Path, segment: impl Into<String>) -> Result<Self> {
        let segment = segment.into();
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < TRAILER_SIZE as u64 {
            return Err(CakeError::corrupt(segment, format!("file of {} bytes has no trailer", len)));
        }

        // Segments are never modified after import, only replaced or unlinked,
        // which leaves an existing mapping intact.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap, segment })
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Borrow `len` bytes at `offset`, failing instead of reading out of range
    pub fn read_block(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.len())
            .ok_or_else(|| {
                CakeError::corrupt(
                    self.segment.as_str(),
                    format!("range {}+{} exceeds file of {} bytes", offset, len, self.len()),
                )
            })?;
        Ok(&self.mmap[offset as usize..end as usize])
    }
}

/// An opened segment: mapped file plus its decoded index
#[derive(Debug, Clone)]
pub struct SegmentReader {
    name: SegmentName,
    view: Arc<SegmentView>,
    entries: Arc<[IndexEntry]>,
    /// End of the data region, start of the index region
    data_end: u64,
}

impl SegmentReader {
    /// Open a segment stored in `store`
    pub fn open_in(store: &BlobStore, name: SegmentName) -> Result<Self> {
        let key = name.key();
        let path = store.path(&key);
        if !path.is_file() {
            return Err(CakeError::BlobNotFound(key));
        }
        Self::open(&path, name)
    }

    /// Map a segment file and read its trailing index
    pub fn open(path: &Path, name: SegmentName) -> Result<Self> {
        let segment = name.key();
        let view = SegmentView::open(path, segment.as_str())?;
        let file_len = view.len();

        let trailer = view.read_block(file_len - TRAILER_SIZE as u64, TRAILER_SIZE as u64)?;
        let index_len = (&trailer[..]).get_i64();
        let max_index = file_len - TRAILER_SIZE as u64;
        if index_len < 0 || index_len as u64 > max_index {
            return Err(CakeError::corrupt(
                segment,
                format!("index length {} outside file of {} bytes", index_len, file_len),
            ));
        }
        if index_len as usize % INDEX_ENTRY_SIZE != 0 {
            return Err(CakeError::corrupt(
                segment,
                format!("index length {} is not a multiple of {}", index_len, INDEX_ENTRY_SIZE),
            ));
        }

        let data_end = max_index - index_len as u64;
        let mut index = view.read_block(data_end, index_len as u64)?;
        let mut entries = Vec::with_capacity(index.len() / INDEX_ENTRY_SIZE);
        while index.remaining() >= INDEX_ENTRY_SIZE {
            entries.push(IndexEntry::decode(&mut index));
        }
        Self::validate(&segment, &entries, data_end)?;

        Ok(Self {
            name,
            view: Arc::new(view),
            entries: entries.into(),
            data_end,
        })
    }

    fn validate(segment: &str, entries: &[IndexEntry], data_end: u64) -> Result<()> {
        for pair in entries.windows(2) {
            if pair[0].device_id >= pair[1].device_id {
                return Err(CakeError::corrupt(
                    segment,
                    format!("index not ascending at device {}", pair[1].device_id),
                ));
            }
            if pair[0].offset > pair[1].offset {
                return Err(CakeError::corrupt(
                    segment,
                    format!("block offsets decrease at device {}", pair[1].device_id),
                ));
            }
        }
        for entry in entries {
            if entry.offset < 0 || entry.offset as u64 > data_end || entry.length < 0 {
                return Err(CakeError::corrupt(
                    segment,
                    format!("device {} block out of bounds", entry.device_id),
                ));
            }
        }
        Ok(())
    }

    pub fn name(&self) -> SegmentName {
        self.name
    }

    /// Decoded index, ascending by device id
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Size of the data region in bytes
    pub fn data_len(&self) -> u64 {
        self.data_end
    }

    pub fn file_size(&self) -> u64 {
        self.view.len()
    }

    /// Position of the device's index entry, if the device is present
    pub fn find(&self, device: DeviceId) -> Option<usize> {
        let pos = self.entries.partition_point(|e| e.device_id < device);
        match self.entries.get(pos) {
            Some(entry) if entry.device_id == device => Some(pos),
            _ => None,
        }
    }

    /// On-disk byte range of the i-th block
    fn block_extent(&self, i: usize) -> (u64, u64) {
        let start = self.entries[i].offset as u64;
        let end = match self.entries.get(i + 1) {
            Some(next) => next.offset as u64,
            None => self.data_end,
        };
        (start, end)
    }

    /// Uncompressed bytes of the i-th block
    pub fn block(&self, i: usize) -> Result<Cow<'_, [u8]>> {
        let entry = &self.entries[i];
        let (start, end) = self.block_extent(i);
        let raw = self.view.read_block(start, end - start)?;
        let expected = entry.length as usize;

        let bytes = if entry.is_compressed() {
            // The index length is untrusted; never allocate or inflate past it
            let mut out = Vec::with_capacity(expected.min(raw.len().saturating_mul(LZ4_MAX_EXPANSION)));
            FrameDecoder::new(raw)
                .take(entry.length as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| CakeError::corrupt(self.name.key(), format!("device {}: {}", entry.device_id, e)))?;
            Cow::Owned(out)
        } else {
            Cow::Borrowed(raw)
        };

        if bytes.len() != expected {
            return Err(CakeError::corrupt(
                self.name.key(),
                format!(
                    "device {} block holds {} bytes, index says {}",
                    entry.device_id,
                    bytes.len(),
                    expected
                ),
            ));
        }
        Ok(bytes)
    }

    /// Decode the i-th block with `width` values per record
    pub fn decode(&self, i: usize, width: usize) -> Result<Vec<Point>> {
        let entry = &self.entries[i];
        let bytes = self.block(i)?;
        let record_size = 8 + 8 * width;
        if bytes.len() % record_size != 0 {
            return Err(CakeError::DecodeWidthMismatch {
                device: entry.device_id,
                width,
                length: bytes.len() as u64,
            });
        }

        let points = bytes
            .chunks_exact(record_size)
            .map(|mut record| {
                let timestamp = record.get_i64();
                let values = (0..width).map(|_| record.get_i64()).collect();
                Point::new(entry.device_id, timestamp, values)
            })
            .collect();
        Ok(points)
    }

    /// Read one device's points within `range`
    pub fn read_device(&self, device: DeviceId, width: usize, range: &TimeRange) -> Result<Vec<Point>> {
        let i = self.find(device).ok_or_else(|| CakeError::DeviceNotInSegment {
            device,
            segment: self.name.key(),
        })?;
        if !self.entries[i].time_range().overlaps(range) {
            return Ok(Vec::new());
        }

        let mut points = self.decode(i, width)?;
        points.retain(|p| range.contains(p.timestamp));
        Ok(points)
    }

    /// File statistics, counting records with each device's width
    pub fn meta<F>(&self, mut width_of: F) -> Result<SegmentMeta>
    where
        F: FnMut(DeviceId) -> Result<usize>,
    {
        let mut points = 0;
        for entry in self.entries.iter() {
            let record_size = 8 + 8 * width_of(entry.device_id)?;
            points += entry.length as usize / record_size;
        }
        Ok(SegmentMeta {
            name: self.name,
            devices: self.entries.len(),
            points,
            file_size: self.file_size(),
            compressed: self.entries.iter().any(IndexEntry::is_compressed),
        })
    }

    /// Enumerate every point, block by block, in (device, timestamp) order
    ///
    /// `width_of` resolves each block's own device width.
    pub fn points<F>(self, width_of: F) -> SegmentPoints<F>
    where
        F: FnMut(DeviceId) -> Result<usize>,
    {
        SegmentPoints {
            reader: self,
            width_of,
            next_entry: 0,
            current: Vec::new().into_iter(),
            failed: false,
        }
    }
}

/// Lazy full-segment enumeration; stops after the first error
pub struct SegmentPoints<F> {
    reader: SegmentReader,
    width_of: F,
    next_entry: usize,
    current: std::vec::IntoIter<Point>,
    failed: bool,
}

impl<F> SegmentPoints<F>
where
    F: FnMut(DeviceId) -> Result<usize>,
{
    fn load(&mut self, i: usize) -> Result<Vec<Point>> {
        let width = (self.width_of)(self.reader.entries[i].device_id)?;
        self.reader.decode(i, width)
    }
}

impl<F> Iterator for SegmentPoints<F>
where
    F: FnMut(DeviceId) -> Result<usize>,
{
    type Item = Result<Point>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(point) = self.current.next() {
                return Some(Ok(point));
            }
            if self.failed || self.next_entry >= self.reader.entries.len() {
                return None;
            }

            let i = self.next_entry;
            self.next_entry += 1;
            match self.load(i) {
                Ok(points) => self.current = points.into_iter(),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::MemTable;
    use crate::memtable::ImmutableMemTable;
    use crate::segment::{SegmentWriter, FLAG_COMPRESSED};
    use crate::store::segment_transform;
    use rand::Rng;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const WEEK: i64 = crate::config::SHARD_DURATION_NANOS;

    fn open_store(dir: &TempDir) -> Arc<BlobStore> {
        Arc::new(
            BlobStore::open(dir.path().join("value"), dir.path().join("tmp"), segment_transform()).unwrap(),
        )
    }

    fn sorted(mut points: Vec<Point>) -> Vec<Point> {
        points.sort_by_key(|p| (p.device_id, p.timestamp));
        points
    }

    fn dump(store: &Arc<BlobStore>, created: i64, points: Vec<Point>, compress: bool) -> SegmentReader {
        let name = SegmentName::new(WEEK, 0, created);
        SegmentWriter::write_all(store.clone(), name, compress, sorted(points)).unwrap();
        SegmentReader::open_in(store, name).unwrap()
    }

    fn read_all(reader: SegmentReader, widths: &HashMap<DeviceId, usize>) -> Vec<Point> {
        reader
            .points(|device| widths.get(&device).copied().ok_or(CakeError::KeyNotFound(device)))
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    fn random_points(devices: u32, per_device: usize) -> (Vec<Point>, HashMap<DeviceId, usize>) {
        let mut rng = rand::thread_rng();
        let mut widths = HashMap::new();
        let mut points = Vec::new();
        for device in 0..devices {
            let device = device * 3 + rng.gen_range(0..3);
            let width = rng.gen_range(0..6);
            widths.insert(device, width);
            for _ in 0..per_device {
                let values = (0..width).map(|_| rng.gen_range(-1000..1000)).collect();
                points.push(Point::new(device, rng.gen_range(0..WEEK), values));
            }
        }
        (points, widths)
    }

    #[test]
    fn test_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let (points, widths) = random_points(40, 50);

        let reader = dump(&store, 1, points.clone(), false);
        assert_eq!(read_all(reader, &widths), sorted(points));
    }

    #[test]
    fn test_compression_transparency() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let (points, widths) = random_points(25, 200);

        let plain = dump(&store, 1, points.clone(), false);
        let packed = dump(&store, 2, points, true);
        assert!(packed.entries().iter().all(|e| e.flag & FLAG_COMPRESSED != 0));
        assert!(plain.entries().iter().all(|e| e.flag == 0));
        assert_eq!(read_all(plain, &widths), read_all(packed, &widths));
    }

    #[test]
    fn test_index_ordering_invariant() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let (points, _) = random_points(30, 20);

        let mut max_ts: HashMap<DeviceId, i64> = HashMap::new();
        let mut min_ts: HashMap<DeviceId, i64> = HashMap::new();
        for p in &points {
            let max = max_ts.entry(p.device_id).or_insert(i64::MIN);
            *max = (*max).max(p.timestamp);
            let min = min_ts.entry(p.device_id).or_insert(i64::MAX);
            *min = (*min).min(p.timestamp);
        }

        for compress in [false, true] {
            let reader = dump(&store, compress as i64 + 1, points.clone(), compress);
            let entries = reader.entries();
            assert_eq!(entries.len(), max_ts.len());
            assert!(entries.windows(2).all(|w| w[0].device_id < w[1].device_id));
            for entry in entries {
                assert!(entry.start_time <= entry.end_time);
                assert_eq!(entry.end_time, max_ts[&entry.device_id]);
                assert_eq!(entry.start_time, min_ts[&entry.device_id]);
            }
        }
    }

    #[test]
    fn test_buffered_points_come_back_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let memtable = MemTable::new(1);
        memtable.insert(Point::new(7, 1, vec![10]));
        memtable.insert(Point::new(7, 3, vec![30]));
        memtable.insert(Point::new(7, 2, vec![20]));

        let name = SegmentName::new(WEEK, 0, 1);
        let points = ImmutableMemTable::from(memtable).drain();
        SegmentWriter::write_all(store.clone(), name, false, points).unwrap();

        let reader = SegmentReader::open_in(&store, name).unwrap();
        let read: Vec<_> = reader
            .read_device(7, 1, &TimeRange::all())
            .unwrap()
            .into_iter()
            .map(|p| (p.timestamp, p.values))
            .collect();
        assert_eq!(read, vec![(1, vec![10]), (2, vec![20]), (3, vec![30])]);
    }

    #[test]
    fn test_binary_search_boundary() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        for compress in [false, true] {
            let points = vec![
                Point::new(3, 1, vec![1, 1]),
                Point::new(3, 2, vec![2, 2]),
                Point::new(7, 1, vec![7, 7]),
                Point::new(9, 1, vec![9, 9]),
                Point::new(9, 5, vec![9, 5]),
                Point::new(9, 8, vec![9, 8]),
            ];
            let reader = dump(&store, compress as i64 + 1, points, compress);

            assert_eq!(reader.find(3), Some(0));
            assert_eq!(reader.find(9), Some(2));
            assert_eq!(reader.find(8), None);
            assert_eq!(reader.find(1), None);
            assert_eq!(reader.find(10), None);

            let err = reader.read_device(8, 2, &TimeRange::all()).unwrap_err();
            assert!(matches!(err, CakeError::DeviceNotInSegment { device: 8, .. }));
            assert!(err.is_not_found());

            let last = reader.read_device(9, 2, &TimeRange::all()).unwrap();
            assert_eq!(last.len(), 3);
            assert_eq!(last[2].values, vec![9, 8]);

            let windowed = reader.read_device(9, 2, &TimeRange::new(2, 6)).unwrap();
            assert_eq!(windowed.len(), 1);
            assert_eq!(windowed[0].timestamp, 5);
            assert!(reader.read_device(3, 2, &TimeRange::new(50, 60)).unwrap().is_empty());
        }
    }

    #[test]
    fn test_per_entry_width() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let points = vec![
            Point::new(1, 10, vec![1]),
            Point::new(2, 10, vec![1, 2, 3]),
            Point::new(3, 10, vec![]),
            Point::new(3, 11, vec![]),
        ];
        let widths = HashMap::from([(1, 1), (2, 3), (3, 0)]);

        let reader = dump(&store, 1, points.clone(), true);
        let meta = reader.meta(|device| Ok(widths[&device])).unwrap();
        assert_eq!(meta.devices, 3);
        assert_eq!(meta.points, 4);
        assert!(meta.compressed);
        assert_eq!(meta.file_size, reader.data_len() + 3 * INDEX_ENTRY_SIZE as u64 + TRAILER_SIZE as u64);

        assert_eq!(read_all(reader, &widths), points);
    }

    #[test]
    fn test_width_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let reader = dump(&store, 1, vec![Point::new(4, 1, vec![1, 2, 3])], false);

        let err = reader.decode(0, 2).unwrap_err();
        assert!(matches!(err, CakeError::DecodeWidthMismatch { device: 4, width: 2, length: 32 }));

        let mut all = reader.points(|_| Ok(2));
        assert!(all.next().unwrap().is_err());
        assert!(all.next().is_none());
    }

    #[test]
    fn test_corrupt_segments() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        let name = SegmentName::new(WEEK, 0, 1);

        let short = dir.join("short");
        std::fs::write(&short, [0u8; 4]).unwrap();
        assert!(SegmentReader::open(&short, name).unwrap_err().is_corruption());

        let huge_index = dir.join("huge_index");
        std::fs::write(&huge_index, 1000i64.to_be_bytes()).unwrap();
        assert!(SegmentReader::open(&huge_index, name).unwrap_err().is_corruption());

        let ragged = dir.join("ragged");
        let mut bytes = vec![0u8; 10];
        bytes.extend_from_slice(&10i64.to_be_bytes());
        std::fs::write(&ragged, bytes).unwrap();
        assert!(SegmentReader::open(&ragged, name).unwrap_err().is_corruption());

        let empty = dir.join("empty");
        std::fs::write(&empty, 0i64.to_be_bytes()).unwrap();
        let reader = SegmentReader::open(&empty, name).unwrap();
        assert!(reader.entries().is_empty());
        assert_eq!(reader.points(|_| Ok(1)).count(), 0);
    }

    #[test]
    fn test_truncated_block() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let name = SegmentName::new(WEEK, 0, 1);
        SegmentWriter::write_all(store.clone(), name, false, vec![Point::new(1, 1, vec![5])]).unwrap();

        // Claim a longer block than the data region holds
        let path = store.path(&name.key());
        let mut bytes = std::fs::read(&path).unwrap();
        let length_at = 16 + 4 + 8 + 8 + 8;
        bytes[length_at..length_at + 8].copy_from_slice(&64i64.to_be_bytes());
        std::fs::write(&path, bytes).unwrap();

        let reader = SegmentReader::open_in(&store, name).unwrap();
        let err = reader.read_device(1, 1, &TimeRange::all()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_oversized_length_on_compressed_block() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let name = SegmentName::new(WEEK, 0, 1);
        SegmentWriter::write_all(store.clone(), name, true, vec![Point::new(1, 1, vec![5])]).unwrap();
        let data_len = SegmentReader::open_in(&store, name).unwrap().data_len() as usize;

        let path = store.path(&name.key());
        let mut bytes = std::fs::read(&path).unwrap();
        let length_at = data_len + 4 + 8 + 8 + 8;
        bytes[length_at..length_at + 8].copy_from_slice(&i64::MAX.to_be_bytes());
        std::fs::write(&path, bytes).unwrap();

        let reader = SegmentReader::open_in(&store, name).unwrap();
        assert!(reader.entries()[0].is_compressed());
        let err = reader.read_device(1, 1, &TimeRange::all()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_understated_length_on_compressed_block() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let name = SegmentName::new(WEEK, 0, 1);
        let points: Vec<_> = (0..100).map(|ts| Point::new(1, ts, vec![ts])).collect();
        SegmentWriter::write_all(store.clone(), name, true, points).unwrap();
        let data_len = SegmentReader::open_in(&store, name).unwrap().data_len() as usize;

        let path = store.path(&name.key());
        let mut bytes = std::fs::read(&path).unwrap();
        let length_at = data_len + 4 + 8 + 8 + 8;
        bytes[length_at..length_at + 8].copy_from_slice(&16i64.to_be_bytes());
        std::fs::write(&path, bytes).unwrap();

        let reader = SegmentReader::open_in(&store, name).unwrap();
        assert!(reader.block(0).unwrap_err().is_corruption());
    }

    #[test]
    fn test_view_bounds() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("seg");
        std::fs::write(&path, [1u8; 16]).unwrap();
        let view = SegmentView::open(&path, "seg").unwrap();

        assert_eq!(view.read_block(8, 8).unwrap(), &[1u8; 8]);
        assert!(view.read_block(9, 8).is_err());
        assert!(view.read_block(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_missing_segment() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let err = SegmentReader::open_in(&store, SegmentName::new(WEEK, 0, 9)).unwrap_err();
        assert!(matches!(err, CakeError::BlobNotFound(_)));
    }
}
