//! Shard routing and flush pipeline
//!
//! A flush drains one retired MemTable in (device, timestamp) order and
//! fans the points out to one segment writer per time shard.

mod clock;
mod pool;

pub use clock::CreatedClock;
pub use pool::{ShardPool, WorkerState};

use crate::memtable::ImmutableMemTable;
use crate::segment::SegmentMeta;
use crate::store::BlobStore;
use crate::{CakeError, Result, ShardId};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Per-flush tuning
#[derive(Debug, Clone)]
pub struct ShardOptions {
    /// Shard bucket width in nanoseconds
    pub shard_duration: i64,
    /// LZ4-compress flushed blocks
    pub compress: bool,
    /// Capacity of each shard worker's queue
    pub queue_capacity: usize,
    /// Idle time after which a shard worker finalizes its segment
    pub idle_timeout: Duration,
}

/// Everything a shard worker needs to write segments
#[derive(Clone)]
pub struct ShardContext {
    pub store: Arc<BlobStore>,
    pub clock: Arc<CreatedClock>,
    pub options: ShardOptions,
}

/// Outcome of one flush
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Points handed to shard workers
    pub points: usize,
    /// Segments imported, ordered by shard
    pub segments: Vec<SegmentMeta>,
    /// Shards whose segment could not be written
    pub failures: Vec<(ShardId, CakeError)>,
}

impl FlushReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fold another report into this one
    pub fn absorb(&mut self, other: FlushReport) {
        self.points += other.points;
        self.segments.extend(other.segments);
        self.failures.extend(other.failures);
    }
}

/// Turns retired MemTables into segments
#[derive(Clone)]
pub struct FlushPipeline {
    ctx: ShardContext,
}

impl FlushPipeline {
    pub fn new(ctx: ShardContext) -> Self {
        Self { ctx }
    }

    /// Drain `table` through a fresh shard pool and wait for every segment
    pub fn run(&self, table: ImmutableMemTable) -> FlushReport {
        let id = table.id();
        let bytes = table.size();
        if table.is_empty() {
            return FlushReport::default();
        }

        let mut pool = ShardPool::new(self.ctx.clone());
        for point in table.drain() {
            pool.route(point);
        }
        let report = pool.finish();

        if report.is_ok() {
            info!(memtable = id, bytes, points = report.points, segments = report.segments.len(), "flush complete");
        } else {
            warn!(
                memtable = id,
                points = report.points,
                segments = report.segments.len(),
                failed_shards = report.failures.len(),
                "flush finished with failures"
            );
        }
        report
    }

    /// Start a flush thread that runs queued tables one at a time, in order
    ///
    /// Segment names come from one monotonic clock, so every segment of a
    /// table is named before any segment of a table queued after it.
    pub fn start(&self, capacity: usize) -> std::io::Result<FlushQueue> {
        let (tx, rx) = bounded(capacity);
        let pipeline = self.clone();
        let handle = thread::Builder::new()
            .name("cakedb-flush".to_string())
            .spawn(move || pipeline.serve(rx))?;
        Ok(FlushQueue { tx, handle })
    }

    fn serve(&self, jobs: Receiver<FlushJob>) -> FlushReport {
        // Flushes finished since the last reply
        let mut done = FlushReport::default();
        for job in jobs {
            done.absorb(self.run(job.table));
            if let Some(reply) = job.reply {
                // The caller may have given up waiting
                let _ = reply.send(std::mem::take(&mut done));
            }
        }
        done
    }
}

struct FlushJob {
    table: ImmutableMemTable,
    reply: Option<Sender<FlushReport>>,
}

/// Handle to the flush thread started by [`FlushPipeline::start`]
pub struct FlushQueue {
    tx: Sender<FlushJob>,
    handle: JoinHandle<FlushReport>,
}

impl FlushQueue {
    /// Queue a table; blocks while earlier flushes fill the queue
    pub fn submit(&self, table: ImmutableMemTable) -> Result<()> {
        self.send(FlushJob { table, reply: None })
    }

    /// Queue a table and have `reply` receive everything flushed up to and
    /// including it that was not reported before
    pub fn submit_with_reply(&self, table: ImmutableMemTable, reply: Sender<FlushReport>) -> Result<()> {
        self.send(FlushJob {
            table,
            reply: Some(reply),
        })
    }

    fn send(&self, job: FlushJob) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| CakeError::Internal("flush thread exited".to_string()))
    }

    /// Flush what is queued, stop the thread and return the unreported rest
    pub fn finish(self) -> FlushReport {
        drop(self.tx);
        match self.handle.join() {
            Ok(report) => report,
            Err(_) => {
                error!("flush thread panicked");
                FlushReport::default()
            }
        }
    }
}
