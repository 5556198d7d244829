//! Core types for CakeDB

use crate::error::{CakeError, Result};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Device identifier as carried on the wire and in segment indexes
pub type DeviceId = u32;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Time bucket number: `timestamp / shard_duration`
pub type ShardId = i64;

/// Map a timestamp to its shard bucket
///
/// Division truncates toward zero, so shard 0 spans one duration either
/// side of the epoch and matches existing segment file placement.
pub fn shard_of(timestamp: Timestamp, shard_duration: i64) -> ShardId {
    timestamp / shard_duration
}

/// One observation: a device's register values at a timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    /// Device that produced the readings
    pub device_id: DeviceId,
    /// Timestamp in nanoseconds
    pub timestamp: Timestamp,
    /// Register values, ordered like the device key
    pub values: Vec<i64>,
}

impl Point {
    /// Create a new point
    pub fn new(device_id: DeviceId, timestamp: Timestamp, values: Vec<i64>) -> Self {
        Self {
            device_id,
            timestamp,
            values,
        }
    }

    /// Buffered byte estimate used by the flush trigger
    pub fn size(&self) -> usize {
        8 * (self.values.len() + 2)
    }

    /// Encoded record length inside a segment block
    pub fn record_size(&self) -> usize {
        8 + 8 * self.values.len()
    }
}

/// A point read back from a segment, tagged with the segment's creation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePoint {
    pub point: Point,
    /// Creation millis of the segment the point came from
    pub created_at: i64,
}

impl MergePoint {
    pub fn new(point: Point, created_at: i64) -> Self {
        Self { point, created_at }
    }

    /// Merge order: device, then timestamp, then segment age
    pub fn sort_key(&self) -> (DeviceId, Timestamp, i64) {
        (self.point.device_id, self.point.timestamp, self.created_at)
    }
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Range covering every representable timestamp
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Shards touched by this range
    pub fn shards(&self, shard_duration: i64) -> RangeInclusive<ShardId> {
        shard_of(self.start, shard_duration)..=shard_of(self.end, shard_duration)
    }
}

/// Identity of a segment: `{shard_duration}_{shard}_{created_at}`
///
/// The same string is the blob-store key, and the first two components
/// become the directories the segment file lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentName {
    /// Shard duration in nanoseconds the segment was bucketed with
    pub shard_duration: i64,
    /// Shard bucket
    pub shard: ShardId,
    /// Creation time in milliseconds since Unix epoch
    pub created_at: i64,
}

impl SegmentName {
    pub fn new(shard_duration: i64, shard: ShardId, created_at: i64) -> Self {
        Self {
            shard_duration,
            shard,
            created_at,
        }
    }

    /// Blob-store key for this segment
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Time range covered by the shard bucket
    pub fn time_range(&self) -> TimeRange {
        let start = self.shard.saturating_mul(self.shard_duration);
        TimeRange::new(start, start.saturating_add(self.shard_duration - 1))
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.shard_duration, self.shard, self.created_at)
    }
}

impl FromStr for SegmentName {
    type Err = CakeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CakeError::InvalidSegmentName(s.to_string());
        let mut parts = s.split('_');
        let mut next = || -> Result<i64> {
            parts
                .next()
                .and_then(|p| p.parse::<i64>().ok())
                .ok_or_else(invalid)
        };
        let shard_duration = next()?;
        let shard = next()?;
        let created_at = next()?;
        if parts.next().is_some() || shard_duration <= 0 {
            return Err(invalid());
        }
        Ok(Self::new(shard_duration, shard, created_at))
    }
}
