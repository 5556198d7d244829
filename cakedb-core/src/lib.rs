//! CakeDB Core - Embedded Time-Series Storage for IoT Device Data
//!
//! Stores register readings of high-cardinality device fleets as immutable,
//! time-sharded segment files.
//!
//! # Architecture
//!
//! - **MemTable**: ordered in-memory buffer keyed by (device, timestamp)
//! - **Shard pipeline**: drains a full buffer into one writer per 7-day shard
//! - **Segment**: immutable file of per-device blocks plus a trailing index,
//!   read back through a memory map
//! - **Compaction**: background k-way merge of a shard's small segments,
//!   keeping the newest value for duplicate timestamps
//! - **Store**: flat-file blob store holding device keys and segments

pub mod compaction;
pub mod memtable;
pub mod segment;
pub mod shard;
pub mod storage;
pub mod store;

mod error;
mod types;

pub use error::{CakeError, Result};
pub use types::*;

/// CakeDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Shard bucket width (7 days in nanoseconds)
    pub const SHARD_DURATION_NANOS: i64 = 7 * 24 * 60 * 60 * 1_000_000_000;

    /// Buffered bytes that trigger a flush (100MB)
    pub const FLUSH_THRESHOLD: usize = 100_000_000;

    /// Ingest queue capacity in points
    pub const INGEST_QUEUE_CAPACITY: usize = 1_000_000;

    /// Capacity of per-shard and merge pipeline queues
    pub const PIPELINE_QUEUE_CAPACITY: usize = 1_000;

    /// Retired buffers that may wait for the flush thread
    pub const FLUSH_QUEUE_CAPACITY: usize = 4;

    /// Threads reading segments for one query
    pub const READ_PARALLELISM: usize = 8;

    /// Idle time after which a shard writer finalizes its segment
    pub const SHARD_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

    /// Pause between compaction scans
    pub const COMPACTION_INTERVAL: Duration = Duration::from_secs(5 * 60);

    /// Segments at or above this size are left out of compaction (1GB)
    pub const COMPACTION_MAX_SEGMENT_SIZE: u64 = 1_000_000_000;

    /// A shard is compacted once it has more small segments than this
    pub const COMPACTION_MIN_SEGMENTS: usize = 5;

    /// Compaction output is compressed above this aggregate input size (100MB)
    pub const COMPACTION_COMPRESS_THRESHOLD: u64 = 100_000_000;
}
