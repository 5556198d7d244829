//! Storage engine - top-level coordinator

use super::EngineConfig;
use crate::compaction::{Compactor, CompactorHandle};
use crate::memtable::WriteBuffer;
use crate::segment::SegmentReader;
use crate::shard::{CreatedClock, FlushPipeline, FlushQueue, FlushReport, ShardContext};
use crate::store::{segment_transform, BlobStore, DeviceKeyStore};
use crate::{CakeError, DeviceId, Point, Result, SegmentName, TimeRange, Timestamp};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

enum IngestMsg {
    Point(Point),
    /// Flush everything buffered so far and reply with the report
    Flush(Sender<FlushReport>),
}

struct Workers {
    ingest: JoinHandle<FlushReport>,
    compactor: Option<CompactorHandle>,
}

/// CakeDB storage engine
///
/// `new` opens the data directory, `start` launches the ingest thread and
/// the compactor, `shutdown` flushes every buffered point and stops them.
pub struct Engine {
    config: EngineConfig,
    store: Arc<BlobStore>,
    keys: Arc<DeviceKeyStore>,
    buffer: Arc<WriteBuffer>,
    pipeline: FlushPipeline,
    compactor: Arc<Compactor>,
    ingest: RwLock<Option<Sender<IngestMsg>>>,
    workers: Mutex<Option<Workers>>,
    last_id: Mutex<Option<u64>>,
}

impl Engine {
    /// Open the storage directories; nothing runs until [`Engine::start`]
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(BlobStore::open(config.value_dir(), config.tmp_dir(), segment_transform())?);
        purge_tmp(store.tmp_dir())?;
        let keys = Arc::new(DeviceKeyStore::open(config.key_dir(), config.tmp_dir())?);
        let clock = Arc::new(CreatedClock::seeded(&store));

        let pipeline = FlushPipeline::new(ShardContext {
            store: store.clone(),
            clock,
            options: config.shard_options(),
        });
        let compactor = Arc::new(Compactor::new(
            store.clone(),
            keys.clone(),
            config.quarantine_dir(),
            config.compaction.clone(),
        ));

        info!(data_dir = ?config.data_dir, "opened storage engine");
        Ok(Self {
            config,
            store,
            keys,
            buffer: Arc::new(WriteBuffer::new()),
            pipeline,
            compactor,
            ingest: RwLock::new(None),
            workers: Mutex::new(None),
            last_id: Mutex::new(None),
        })
    }

    /// Launch the ingest thread and, if enabled, the background compactor
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            debug!("engine already running");
            return Ok(());
        }

        let (tx, rx) = bounded(self.config.ingest_queue_capacity);
        let buffer = self.buffer.clone();
        let flushes = self.pipeline.start(crate::config::FLUSH_QUEUE_CAPACITY)?;
        let threshold = self.config.flush_threshold;
        let ingest = thread::Builder::new()
            .name("cakedb-ingest".to_string())
            .spawn(move || ingest_loop(rx, buffer, flushes, threshold))?;

        let compactor = if self.config.compaction.enabled {
            Some(self.compactor.clone().spawn()?)
        } else {
            None
        };

        *workers = Some(Workers { ingest, compactor });
        *self.ingest.write() = Some(tx);
        info!(flush_threshold = threshold, "storage engine started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.ingest.read().is_some()
    }

    /// Register the device key on first sight and queue the point
    ///
    /// Blocks while the ingest queue is full.
    pub fn write(&self, key: &[i64], point: Point) -> Result<()> {
        let ingest = self.ingest.read();
        let tx = ingest.as_ref().ok_or(CakeError::Closed)?;
        if self.keys.write(point.device_id, key)? {
            debug!(device = point.device_id, width = key.len(), "registered device key");
        }
        tx.send(IngestMsg::Point(point)).map_err(|_| CakeError::Closed)
    }

    /// Like [`Engine::write`], but only for ids above the last accepted one
    pub fn write_sequenced(&self, key: &[i64], point: Point, id: u64) -> Result<()> {
        let mut last = self.last_id.lock();
        if let Some(last) = *last {
            if id <= last {
                return Err(CakeError::OutOfOrderWrite { id, last });
            }
        }
        self.write(key, point)?;
        *last = Some(id);
        Ok(())
    }

    /// Highest id accepted by [`Engine::write_sequenced`]
    pub fn last_id(&self) -> Option<u64> {
        *self.last_id.lock()
    }

    /// Flush every point queued before this call and wait for the segments
    pub fn flush(&self) -> Result<FlushReport> {
        let (reply, report) = bounded(1);
        {
            let ingest = self.ingest.read();
            let tx = ingest.as_ref().ok_or(CakeError::Closed)?;
            tx.send(IngestMsg::Flush(reply)).map_err(|_| CakeError::Closed)?;
        }
        report
            .recv()
            .map_err(|_| CakeError::Internal("ingest thread exited before flushing".to_string()))
    }

    /// Read a device's points with `start <= timestamp <= end`
    ///
    /// Only flushed points are visible. For a timestamp present in several
    /// segments the value from the most recently created one wins. A segment
    /// that cannot be read is logged and skipped. Segments are read by at
    /// most `read_parallelism` threads.
    pub fn read(&self, device: DeviceId, start: Timestamp, end: Timestamp) -> Result<(Vec<i64>, Vec<Point>)> {
        let key = self.keys.read(device)?;
        let width = key.len();
        let range = TimeRange::new(start, end);
        let segments = self.segments_in(&range);

        let (jobs_tx, jobs) = unbounded();
        for name in &segments {
            // The receiver is still held below
            let _ = jobs_tx.send(*name);
        }
        drop(jobs_tx);

        let readers = self.config.read_parallelism.min(segments.len());
        let results: Vec<(SegmentName, Result<Vec<Point>>)> = thread::scope(|s| {
            let handles: Vec<_> = (0..readers)
                .map(|_| {
                    let jobs: Receiver<SegmentName> = jobs.clone();
                    s.spawn(move || {
                        jobs.iter()
                            .map(|name| (name, self.read_segment(name, device, width, &range)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        error!(device, "segment reader panicked");
                        Vec::new()
                    })
                })
                .collect()
        });

        let mut merged: BTreeMap<Timestamp, (i64, Vec<i64>)> = BTreeMap::new();
        for (name, result) in results {
            let points = match result {
                Ok(points) => points,
                Err(e) if e.is_not_found() => {
                    debug!(segment = %name, error = %e, "segment vanished during read");
                    continue;
                }
                Err(e) => {
                    warn!(segment = %name, device, error = %e, "skipping unreadable segment");
                    continue;
                }
            };
            for point in points {
                let newer = merged
                    .get(&point.timestamp)
                    .map_or(true, |(created, _)| *created <= name.created_at);
                if newer {
                    merged.insert(point.timestamp, (name.created_at, point.values));
                }
            }
        }

        let points = merged
            .into_iter()
            .map(|(ts, (_, values))| Point::new(device, ts, values))
            .collect();
        Ok((key, points))
    }

    fn read_segment(&self, name: SegmentName, device: DeviceId, width: usize, range: &TimeRange) -> Result<Vec<Point>> {
        let reader = SegmentReader::open_in(&self.store, name)?;
        match reader.read_device(device, width, range) {
            Err(CakeError::DeviceNotInSegment { .. }) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Segments whose shard overlaps `range`, oldest first
    fn segments_in(&self, range: &TimeRange) -> Vec<SegmentName> {
        let shards = range.shards(self.config.shard_duration);
        let mut names: Vec<_> = self
            .store
            .keys(&format!("{}_", self.config.shard_duration))
            .filter_map(|key| key.parse::<SegmentName>().ok())
            .filter(|name| name.shard_duration == self.config.shard_duration && shards.contains(&name.shard))
            .collect();
        names.sort_by_key(|name| name.created_at);
        names
    }

    /// Every segment currently in the store
    pub fn segments(&self) -> Vec<SegmentName> {
        let mut names: Vec<_> = self.store.keys("").filter_map(|key| key.parse().ok()).collect();
        names.sort();
        names
    }

    /// Stop accepting writes, flush the buffer and stop background work
    pub fn shutdown(&self) -> Result<FlushReport> {
        let Some(workers) = self.workers.lock().take() else {
            return Ok(FlushReport::default());
        };
        // Closing the queue makes the ingest thread drain and flush
        self.ingest.write().take();

        let report = workers
            .ingest
            .join()
            .map_err(|_| CakeError::Internal("ingest thread panicked".to_string()))?;
        if let Some(compactor) = workers.compactor {
            compactor.stop()?;
        }

        info!(
            points = report.points,
            segments = report.segments.len(),
            failed_shards = report.failures.len(),
            "storage engine stopped"
        );
        Ok(report)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn keys(&self) -> &DeviceKeyStore {
        &self.keys
    }

    pub fn compactor(&self) -> &Compactor {
        &self.compactor
    }

    /// Bytes waiting in the live buffer
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.size()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "engine shutdown failed");
        }
    }
}

/// Consume the ingest queue until every sender is gone, then flush the rest
///
/// Retired tables go to the flush thread in swap order, so a later table's
/// segments are always named newer than an earlier table's.
fn ingest_loop(rx: Receiver<IngestMsg>, buffer: Arc<WriteBuffer>, flushes: FlushQueue, threshold: usize) -> FlushReport {
    for msg in rx {
        match msg {
            IngestMsg::Point(point) => {
                if buffer.insert(point) > threshold {
                    let table = buffer.swap();
                    debug!(memtable = table.id(), bytes = table.size(), "flush threshold reached");
                    if let Err(e) = flushes.submit(table) {
                        error!(error = %e, "buffered points lost");
                    }
                }
            }
            IngestMsg::Flush(reply) => {
                if let Err(e) = flushes.submit_with_reply(buffer.swap(), reply) {
                    error!(error = %e, "flush request dropped");
                }
            }
        }
    }

    if let Err(e) = flushes.submit(buffer.swap()) {
        error!(error = %e, "buffered points lost");
    }
    flushes.finish()
}

/// Remove staging files left behind by an interrupted process
fn purge_tmp(dir: &Path) -> Result<()> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        warn!(removed, "removed stale staging files");
    }
    Ok(())
}
