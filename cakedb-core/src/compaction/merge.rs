//! K-way merge and duplicate resolution over sorted point streams

use crate::{MergePoint, Result};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

struct HeapItem {
    point: MergePoint,
    source: usize,
}

impl HeapItem {
    fn key(&self) -> (u32, i64, i64, usize) {
        let (device, ts, created) = self.point.sort_key();
        (device, ts, created, self.source)
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Merges individually sorted streams into one stream ascending by
/// (device, timestamp, created)
///
/// Each source must already be ascending by (device, timestamp) and carry a
/// single creation time. The first error from any source ends the merge.
pub struct KWayMerge<I> {
    sources: Vec<I>,
    heap: BinaryHeap<Reverse<HeapItem>>,
    primed: bool,
    failed: bool,
}

impl<I> KWayMerge<I>
where
    I: Iterator<Item = Result<MergePoint>>,
{
    pub fn new(sources: Vec<I>) -> Self {
        let heap = BinaryHeap::with_capacity(sources.len());
        Self {
            sources,
            heap,
            primed: false,
            failed: false,
        }
    }

    /// Pull the next head of `source` into the heap
    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next() {
            self.heap.push(Reverse(HeapItem { point: next?, source }));
        }
        Ok(())
    }

    fn prime(&mut self) -> Result<()> {
        self.primed = true;
        for source in 0..self.sources.len() {
            self.refill(source)?;
        }
        Ok(())
    }
}

impl<I> Iterator for KWayMerge<I>
where
    I: Iterator<Item = Result<MergePoint>>,
{
    type Item = Result<MergePoint>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.primed {
            if let Err(e) = self.prime() {
                self.failed = true;
                return Some(Err(e));
            }
        }

        let Reverse(item) = self.heap.pop()?;
        if let Err(e) = self.refill(item.source) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok(item.point))
    }
}

/// Keeps the last point of every run of equal (device, timestamp)
///
/// Fed from [`KWayMerge`], the last point of a run is the one from the most
/// recently created segment.
pub struct Dedup<I> {
    inner: I,
    pending: Option<MergePoint>,
    dropped: usize,
}

impl<I> Dedup<I>
where
    I: Iterator<Item = Result<MergePoint>>,
{
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            pending: None,
            dropped: 0,
        }
    }

    /// Points discarded as older duplicates so far
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl<I> Iterator for Dedup<I>
where
    I: Iterator<Item = Result<MergePoint>>,
{
    type Item = Result<MergePoint>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next() {
                Some(Ok(point)) => {
                    let Some(pending) = self.pending.take() else {
                        self.pending = Some(point);
                        continue;
                    };
                    let same = pending.point.device_id == point.point.device_id
                        && pending.point.timestamp == point.point.timestamp;
                    self.pending = Some(point);
                    if same {
                        self.dropped += 1;
                    } else {
                        return Some(Ok(pending));
                    }
                }
                Some(Err(e)) => {
                    self.pending = None;
                    return Some(Err(e));
                }
                None => return self.pending.take().map(Ok),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CakeError, Point};
    use rand::Rng;

    fn mp(device: u32, ts: i64, value: i64, created: i64) -> MergePoint {
        MergePoint::new(Point::new(device, ts, vec![value]), created)
    }

    fn stream(points: Vec<MergePoint>) -> std::vec::IntoIter<Result<MergePoint>> {
        points.into_iter().map(Ok).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_merge_is_globally_ascending() {
        let mut rng = rand::thread_rng();
        let mut sources = Vec::new();
        let mut total = 0;
        for created in 0..8 {
            let mut points: Vec<_> = (0..rng.gen_range(0..200))
                .map(|_| mp(rng.gen_range(0..20), rng.gen_range(0..50), 0, created))
                .collect();
            points.sort_by_key(|p| p.sort_key());
            total += points.len();
            sources.push(stream(points));
        }

        let merged: Vec<_> = KWayMerge::new(sources).collect::<Result<_>>().unwrap();
        assert_eq!(merged.len(), total);
        assert!(merged.windows(2).all(|w| w[0].sort_key() <= w[1].sort_key()));
    }

    #[test]
    fn test_duplicates_newest_last() {
        let newer = stream(vec![mp(5, 100, 2, 20)]);
        let older = stream(vec![mp(5, 100, 1, 10), mp(5, 101, 1, 10)]);

        let merged: Vec<_> = KWayMerge::new(vec![newer, older]).collect::<Result<_>>().unwrap();
        let created: Vec<_> = merged.iter().map(|p| p.created_at).collect();
        assert_eq!(created, vec![10, 20, 10]);
    }

    #[test]
    fn test_dedup_keeps_newest() {
        let a = stream(vec![mp(5, 100, 1, 10), mp(6, 1, 7, 10)]);
        let b = stream(vec![mp(5, 100, 2, 20), mp(5, 200, 3, 20)]);
        let c = stream(vec![mp(5, 100, 0, 5)]);

        let mut dedup = Dedup::new(KWayMerge::new(vec![a, b, c]));
        let out: Vec<_> = dedup.by_ref().collect::<Result<_>>().unwrap();
        let flat: Vec<_> = out
            .iter()
            .map(|p| (p.point.device_id, p.point.timestamp, p.point.values[0]))
            .collect();
        assert_eq!(flat, vec![(5, 100, 2), (5, 200, 3), (6, 1, 7)]);
        assert_eq!(dedup.dropped(), 2);
    }

    #[test]
    fn test_dedup_keeps_last_of_one_stream() {
        let input = stream(vec![mp(1, 1, 1, 3), mp(1, 1, 2, 3), mp(1, 2, 3, 3)]);
        let out: Vec<_> = Dedup::new(input).collect::<Result<_>>().unwrap();
        assert_eq!(out, vec![mp(1, 1, 2, 3), mp(1, 2, 3, 3)]);
    }

    #[test]
    fn test_source_error_stops_merge() {
        let good = stream(vec![mp(1, 1, 1, 1), mp(2, 1, 1, 1)]);
        let bad = vec![Ok(mp(1, 5, 1, 2)), Err(CakeError::corrupt("seg", "truncated"))].into_iter();
        let empty = stream(Vec::new());

        let mut merge = KWayMerge::new(vec![good, bad, empty]);
        assert!(merge.next().unwrap().is_ok());
        assert!(merge.next().unwrap().is_err());
        assert!(merge.next().is_none());
    }

    #[test]
    fn test_empty_sources() {
        let merge = KWayMerge::new(vec![stream(Vec::new()), stream(Vec::new())]);
        assert_eq!(Dedup::new(merge).count(), 0);
    }
}
