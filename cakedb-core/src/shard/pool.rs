//! Shard worker pool
//!
//! One worker per shard, each owning a bounded queue and a lazily created
//! segment writer. A worker that sees no point for the idle timeout, with
//! its queue empty, retires and finalizes its segment. The next point for
//! that shard spawns a fresh worker and so a fresh segment.

use super::{FlushReport, ShardContext};
use crate::segment::{SegmentMeta, SegmentWriter};
use crate::{shard_of, CakeError, Point, Result, SegmentName, ShardId};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Lifecycle of a shard worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Accepting points
    Active,
    /// Finalizing its segment; the router must not send to it any more
    Retired,
}

struct ShardWorker {
    state: Arc<Mutex<WorkerState>>,
    tx: Sender<Point>,
    handle: JoinHandle<Result<Option<SegmentMeta>>>,
}

impl ShardWorker {
    fn spawn(shard: ShardId, ctx: ShardContext) -> Result<Self> {
        let (tx, rx) = bounded(ctx.options.queue_capacity);
        let state = Arc::new(Mutex::new(WorkerState::Active));
        let worker_state = state.clone();
        let handle = thread::Builder::new()
            .name(format!("cakedb-shard-{}", shard))
            .spawn(move || Self::run(shard, ctx, rx, worker_state))?;

        debug!(shard, "spawned shard worker");
        Ok(Self { state, tx, handle })
    }

    /// Hand a point to the worker, or give it back if the worker is retired
    ///
    /// The state lock is held across the send, so the worker cannot retire
    /// between the state check and the point landing in its queue.
    fn offer(&self, point: Point) -> std::result::Result<(), Point> {
        let state = self.state.lock();
        if *state == WorkerState::Retired {
            return Err(point);
        }
        self.tx.send(point).map_err(|e| e.into_inner())
    }

    fn run(
        shard: ShardId,
        ctx: ShardContext,
        rx: Receiver<Point>,
        state: Arc<Mutex<WorkerState>>,
    ) -> Result<Option<SegmentMeta>> {
        let mut writer: Option<SegmentWriter> = None;
        loop {
            let point = match rx.recv_timeout(ctx.options.idle_timeout) {
                Ok(point) => point,
                Err(RecvTimeoutError::Timeout) => {
                    let mut state = state.lock();
                    if rx.is_empty() {
                        *state = WorkerState::Retired;
                        debug!(shard, "shard worker idle, retiring");
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            // On failure the dropped receiver makes the router's next send fail
            Self::append(shard, &ctx, &mut writer, &point)?;
        }

        *state.lock() = WorkerState::Retired;
        writer.map(SegmentWriter::finish).transpose()
    }

    fn append(
        shard: ShardId,
        ctx: &ShardContext,
        writer: &mut Option<SegmentWriter>,
        point: &Point,
    ) -> Result<()> {
        if writer.is_none() {
            let name = SegmentName::new(ctx.options.shard_duration, shard, ctx.clock.next());
            *writer = Some(SegmentWriter::create(ctx.store.clone(), name, ctx.options.compress)?);
        }
        match writer.as_mut() {
            Some(writer) => writer.push(point),
            None => Ok(()),
        }
    }

    /// Close the queue and wait for the segment
    fn join(self) -> Result<Option<SegmentMeta>> {
        drop(self.tx);
        self.handle
            .join()
            .map_err(|_| CakeError::Internal("shard worker panicked".to_string()))?
    }
}

/// Routes a sorted point stream to per-shard workers
pub struct ShardPool {
    ctx: ShardContext,
    workers: HashMap<ShardId, ShardWorker>,
    report: FlushReport,
}

impl ShardPool {
    pub fn new(ctx: ShardContext) -> Self {
        Self {
            ctx,
            workers: HashMap::new(),
            report: FlushReport::default(),
        }
    }

    /// Send a point to its shard's worker, spawning one when needed
    ///
    /// Blocks while the worker's queue is full.
    pub fn route(&mut self, point: Point) {
        let shard = shard_of(point.timestamp, self.ctx.options.shard_duration);
        let mut point = point;
        loop {
            if !self.workers.contains_key(&shard) {
                match ShardWorker::spawn(shard, self.ctx.clone()) {
                    Ok(worker) => {
                        self.workers.insert(shard, worker);
                    }
                    Err(e) => {
                        self.record(shard, Err(e));
                        return;
                    }
                }
            }

            let Some(worker) = self.workers.get(&shard) else {
                return;
            };
            match worker.offer(point) {
                Ok(()) => {
                    self.report.points += 1;
                    return;
                }
                Err(returned) => {
                    point = returned;
                    if let Some(retired) = self.workers.remove(&shard) {
                        let result = retired.join();
                        self.record(shard, result);
                    }
                }
            }
        }
    }

    fn record(&mut self, shard: ShardId, result: Result<Option<SegmentMeta>>) {
        match result {
            Ok(Some(meta)) => self.report.segments.push(meta),
            Ok(None) => {}
            Err(e) => {
                error!(shard, error = %e, "shard flush failed");
                self.report.failures.push((shard, e));
            }
        }
    }

    /// Close every queue, wait for all workers and report what was written
    pub fn finish(mut self) -> FlushReport {
        let mut workers: Vec<_> = self.workers.drain().collect();
        workers.sort_by_key(|(shard, _)| *shard);
        for (shard, worker) in workers {
            let result = worker.join();
            self.record(shard, result);
        }
        self.report
    }
}
