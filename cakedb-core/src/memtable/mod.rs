//! MemTable implementation using a concurrent skip list
//!
//! The MemTable buffers incoming points ordered by (device, timestamp) until
//! a flush drains it. Points with the same device and timestamp are all kept;
//! duplicates are only resolved when segments are compacted.

use crate::{DeviceId, Point, Timestamp};
use crossbeam_skiplist::{map, SkipMap};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Key for MemTable entries (device + timestamp + arrival order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemTableKey {
    pub device_id: DeviceId,
    pub timestamp: Timestamp,
    /// Insertion counter, keeps equal (device, timestamp) pairs distinct
    seq: u64,
}

/// MemTable for in-memory writes
pub struct MemTable {
    data: SkipMap<MemTableKey, Vec<i64>>,
    seq: AtomicU64,
    /// Approximate size in bytes
    size_bytes: AtomicUsize,
    id: u64,
}

impl MemTable {
    /// Create a new MemTable
    pub fn new(id: u64) -> Self {
        Self {
            data: SkipMap::new(),
            seq: AtomicU64::new(0),
            size_bytes: AtomicUsize::new(0),
            id,
        }
    }

    /// Get the MemTable ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert a point, returning the buffered size afterwards
    ///
    /// Safe to call from several threads at once.
    pub fn insert(&self, point: Point) -> usize {
        let key = MemTableKey {
            device_id: point.device_id,
            timestamp: point.timestamp,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let entry_size = point.size();
        self.data.insert(key, point.values);
        self.size_bytes.fetch_add(entry_size, Ordering::Relaxed) + entry_size
    }

    /// Get the current size in bytes
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Get entry count
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A MemTable taken out of service, waiting to be flushed
pub struct ImmutableMemTable {
    inner: MemTable,
}

impl ImmutableMemTable {
    /// Create an immutable snapshot from a MemTable
    pub fn from(memtable: MemTable) -> Self {
        Self { inner: memtable }
    }

    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Consume the table, yielding points ascending by (device, timestamp)
    pub fn drain(self) -> Drain {
        Drain {
            inner: self.inner.data.into_iter(),
        }
    }
}

/// One-shot ordered iterator over a drained MemTable
pub struct Drain {
    inner: map::IntoIter<MemTableKey, Vec<i64>>,
}

impl Iterator for Drain {
    type Item = Point;

    fn next(&mut self) -> Option<Point> {
        self.inner
            .next()
            .map(|(key, values)| Point::new(key.device_id, key.timestamp, values))
    }
}

/// The live MemTable plus the swap used to retire it
///
/// Inserts share the lock; only the swap takes it exclusively, and only for
/// the pointer exchange. Draining happens on the retired table, outside the
/// lock.
pub struct WriteBuffer {
    current: RwLock<MemTable>,
    next_id: AtomicU64,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(MemTable::new(0)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Buffer a point, returning the live table's size afterwards
    pub fn insert(&self, point: Point) -> usize {
        self.current.read().insert(point)
    }

    /// Size of the live table in bytes
    pub fn size(&self) -> usize {
        self.current.read().size()
    }

    /// Points in the live table
    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    /// Install a fresh table and hand back the old one for flushing
    pub fn swap(&self) -> ImmutableMemTable {
        let new_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let old = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, MemTable::new(new_id))
        };
        ImmutableMemTable::from(old)
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
