//! Error types for CakeDB

use crate::types::DeviceId;
use thiserror::Error;

/// Result type alias for CakeDB operations
pub type Result<T> = std::result::Result<T, CakeError>;

/// CakeDB error types
#[derive(Error, Debug)]
pub enum CakeError {
    /// IO operation failed (create, read, write, mmap, rename)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Segment file is structurally damaged
    #[error("Corrupt segment {segment}: {reason}")]
    CorruptSegment { segment: String, reason: String },

    /// Block length does not fit the device's registered key width
    #[error("Device {device}: block of {length} bytes does not decode with width {width}")]
    DecodeWidthMismatch {
        device: DeviceId,
        width: usize,
        length: u64,
    },

    /// Sequenced write whose id is not newer than the last accepted one
    #[error("Out of order write: id {id} <= last accepted {last}")]
    OutOfOrderWrite { id: u64, last: u64 },

    /// No register key was ever written for the device
    #[error("No key registered for device {0}")]
    KeyNotFound(DeviceId),

    /// Device has no block in the segment
    #[error("Device {device} not found in segment {segment}")]
    DeviceNotInSegment { device: DeviceId, segment: String },

    /// Blob store has no entry for the key
    #[error("No stored blob for key {0}")]
    BlobNotFound(String),

    /// Stored device key cannot be a big-endian i64 array
    #[error("Corrupt key for device {device}: {len} bytes")]
    CorruptKey { device: DeviceId, len: usize },

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Segment name does not follow `{duration}_{shard}_{created}`
    #[error("Invalid segment name: {0}")]
    InvalidSegmentName(String),

    /// Points handed to a segment writer were not ordered by device
    #[error("Unsorted input: {0}")]
    UnsortedInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine is not running or has been shut down
    #[error("Engine is closed")]
    Closed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CakeError {
    /// Build a `CorruptSegment` error
    pub fn corrupt(segment: impl Into<String>, reason: impl Into<String>) -> Self {
        CakeError::CorruptSegment {
            segment: segment.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, CakeError::Io(_))
    }

    /// Check if error indicates storage damage
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CakeError::CorruptSegment { .. }
                | CakeError::DecodeWidthMismatch { .. }
                | CakeError::CorruptKey { .. }
                | CakeError::Compression(_)
        )
    }

    /// Check if error means "nothing stored yet" rather than damage
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CakeError::KeyNotFound(_)
                | CakeError::DeviceNotInSegment { .. }
                | CakeError::BlobNotFound(_)
        )
    }
}

impl From<lz4_flex::frame::Error> for CakeError {
    fn from(err: lz4_flex::frame::Error) -> Self {
        CakeError::Compression(err.to_string())
    }
}
