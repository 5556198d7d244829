//! Background compaction of small segments
//!
//! A shard that has collected more than `min_segments` segments below
//! `max_segment_size` has them merged into one. Duplicate (device, timestamp)
//! records keep the value of the most recently created input. The output
//! takes the name of the newest input and replaces it atomically, after which
//! the other inputs are erased.

mod merge;

pub use merge::{Dedup, KWayMerge};

use crate::segment::{SegmentMeta, SegmentReader, SegmentWriter};
use crate::store::{BlobStore, DeviceKeyStore};
use crate::{CakeError, MergePoint, Result, SegmentName, ShardId};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Compaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Run the background loop at all
    pub enabled: bool,
    /// Pause between scans
    pub interval: Duration,
    /// Segments at or above this size are never compacted
    pub max_segment_size: u64,
    /// Compact a shard once it has more eligible segments than this
    pub min_segments: usize,
    /// Compress the output when the inputs add up to more than this
    pub compress_threshold: u64,
    /// Queue capacity between each input reader and the merge
    pub pipeline_capacity: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: crate::config::COMPACTION_INTERVAL,
            max_segment_size: crate::config::COMPACTION_MAX_SEGMENT_SIZE,
            min_segments: crate::config::COMPACTION_MIN_SEGMENTS,
            compress_threshold: crate::config::COMPACTION_COMPRESS_THRESHOLD,
            pipeline_capacity: crate::config::PIPELINE_QUEUE_CAPACITY,
        }
    }
}

/// What the compactor is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactorState {
    Idle,
    Scanning,
    Merging(ShardId),
}

/// One merged shard
#[derive(Debug)]
pub struct CompactedShard {
    pub shard: ShardId,
    pub inputs: Vec<SegmentName>,
    pub output: SegmentMeta,
    /// Older duplicates discarded by the merge
    pub dropped: usize,
}

/// Outcome of one scan and merge pass
#[derive(Debug, Default)]
pub struct CompactionReport {
    /// Segment keys seen during the scan
    pub scanned: usize,
    pub compacted: Vec<CompactedShard>,
    /// Inputs moved aside because they could not be opened
    pub quarantined: Vec<SegmentName>,
    pub failures: Vec<(ShardId, CakeError)>,
}

impl CompactionReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

type Candidates = BTreeMap<(i64, ShardId), Vec<(SegmentName, u64)>>;

/// Merges a shard's small segments into one
pub struct Compactor {
    store: Arc<BlobStore>,
    keys: Arc<DeviceKeyStore>,
    quarantine_dir: PathBuf,
    config: CompactionConfig,
    state: Mutex<CompactorState>,
}

impl Compactor {
    pub fn new(
        store: Arc<BlobStore>,
        keys: Arc<DeviceKeyStore>,
        quarantine_dir: impl Into<PathBuf>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            store,
            keys,
            quarantine_dir: quarantine_dir.into(),
            config,
            state: Mutex::new(CompactorState::Idle),
        }
    }

    pub fn state(&self) -> CompactorState {
        *self.state.lock()
    }

    fn set_state(&self, state: CompactorState) {
        *self.state.lock() = state;
    }

    /// One synchronous scan and merge over every eligible shard
    pub fn run_once(&self) -> CompactionReport {
        let mut report = CompactionReport::default();

        self.set_state(CompactorState::Scanning);
        let candidates = self.scan(&mut report);
        debug!(scanned = report.scanned, shards = candidates.len(), "compaction scan complete");

        for ((_, shard), segments) in candidates {
            self.set_state(CompactorState::Merging(shard));
            match self.compact_shard(shard, segments, &mut report) {
                Ok(Some(done)) => {
                    info!(
                        shard,
                        inputs = done.inputs.len(),
                        segment = %done.output.name,
                        points = done.output.points,
                        dropped = done.dropped,
                        "compacted shard"
                    );
                    report.compacted.push(done);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(shard, error = %e, "compaction failed, inputs kept");
                    report.failures.push((shard, e));
                }
            }
        }

        self.set_state(CompactorState::Idle);
        report
    }

    /// Group small segments by shard, keeping shards past the fan-out trigger
    fn scan(&self, report: &mut CompactionReport) -> Candidates {
        let mut groups = Candidates::new();
        for key in self.store.keys("") {
            let name = match key.parse::<SegmentName>() {
                Ok(name) => name,
                Err(_) => {
                    debug!(key = %key, "ignoring non-segment key");
                    continue;
                }
            };
            report.scanned += 1;

            let size = match self.store.size(&key) {
                Ok(size) => size,
                Err(e) => {
                    warn!(segment = %key, error = %e, "cannot stat segment");
                    continue;
                }
            };
            if size < self.config.max_segment_size {
                groups.entry((name.shard_duration, name.shard)).or_default().push((name, size));
            }
        }

        groups.retain(|_, segments| segments.len() > self.config.min_segments);
        groups
    }

    fn compact_shard(
        &self,
        shard: ShardId,
        mut segments: Vec<(SegmentName, u64)>,
        report: &mut CompactionReport,
    ) -> Result<Option<CompactedShard>> {
        segments.sort_by_key(|(name, _)| name.created_at);

        let mut readers = Vec::with_capacity(segments.len());
        let mut input_bytes = 0;
        for (name, size) in segments {
            match SegmentReader::open_in(&self.store, name) {
                Ok(reader) => {
                    readers.push(reader);
                    input_bytes += size;
                }
                Err(e) if e.is_corruption() => {
                    warn!(segment = %name, error = %e, "quarantining corrupt segment");
                    self.quarantine(name)?;
                    report.quarantined.push(name);
                }
                Err(e) => return Err(e),
            }
        }
        if readers.len() < 2 {
            return Ok(None);
        }

        let inputs: Vec<_> = readers.iter().map(SegmentReader::name).collect();
        let newest = inputs.iter().map(|name| name.created_at).max().unwrap_or_default();
        let first = inputs[0];
        let output = SegmentName::new(first.shard_duration, first.shard, newest);
        let compress = input_bytes > self.config.compress_threshold;

        let (meta, dropped) = self.merge(readers, output, compress)?;

        for name in &inputs {
            if *name == output {
                continue;
            }
            if let Err(e) = self.store.erase(&name.key()) {
                warn!(segment = %name, error = %e, "failed to erase compacted input");
            }
        }

        Ok(Some(CompactedShard {
            shard,
            inputs,
            output: meta,
            dropped,
        }))
    }

    /// Stream every reader through the merge into one new segment
    fn merge(&self, readers: Vec<SegmentReader>, output: SegmentName, compress: bool) -> Result<(SegmentMeta, usize)> {
        let mut sources = Vec::with_capacity(readers.len());
        let mut handles = Vec::with_capacity(readers.len());
        for reader in readers {
            let (rx, handle) = self.spawn_pipeline(reader)?;
            sources.push(rx.into_iter());
            handles.push(handle);
        }

        let mut writer = SegmentWriter::create(self.store.clone(), output, compress)?;
        let mut merged = Dedup::new(KWayMerge::new(sources));
        for point in merged.by_ref() {
            writer.push(&point?.point)?;
        }
        let dropped = merged.dropped();
        drop(merged);

        for handle in handles {
            handle
                .join()
                .map_err(|_| CakeError::Internal("merge pipeline panicked".to_string()))?;
        }
        Ok((writer.finish()?, dropped))
    }

    /// Read one segment on its own thread into a bounded queue
    fn spawn_pipeline(&self, reader: SegmentReader) -> Result<(Receiver<Result<MergePoint>>, JoinHandle<()>)> {
        let (tx, rx) = bounded(self.config.pipeline_capacity);
        let keys = self.keys.clone();
        let created = reader.name().created_at;

        let handle = thread::Builder::new()
            .name(format!("cakedb-merge-{}", created))
            .spawn(move || {
                for point in reader.points(|device| keys.width(device)) {
                    if tx.send(point.map(|p| MergePoint::new(p, created))).is_err() {
                        break;
                    }
                }
            })?;
        Ok((rx, handle))
    }

    /// Move a segment out of the store into the quarantine directory
    fn quarantine(&self, name: SegmentName) -> Result<()> {
        let key = name.key();
        fs::create_dir_all(&self.quarantine_dir)?;
        fs::rename(self.store.path(&key), self.quarantine_dir.join(&key))?;
        Ok(())
    }

    /// Run `run_once` every interval until stopped
    pub fn spawn(self: Arc<Self>) -> std::io::Result<CompactorHandle> {
        let (shutdown, stop) = bounded::<()>(1);
        let interval = self.config.interval;
        let handle = thread::Builder::new()
            .name("cakedb-compactor".to_string())
            .spawn(move || loop {
                match stop.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let report = self.run_once();
                        if !report.compacted.is_empty() || !report.is_ok() {
                            debug!(
                                compacted = report.compacted.len(),
                                failed = report.failures.len(),
                                "compaction pass done"
                            );
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!(interval_secs = interval.as_secs(), "compactor started");
        Ok(CompactorHandle { shutdown, handle })
    }
}

/// Stops the background compactor
pub struct CompactorHandle {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl CompactorHandle {
    /// Signal the loop and wait for any running pass to finish
    pub fn stop(self) -> Result<()> {
        drop(self.shutdown);
        self.handle
            .join()
            .map_err(|_| CakeError::Internal("compactor panicked".to_string()))?;
        info!("compactor stopped");
        Ok(())
    }
}
